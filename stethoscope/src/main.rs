//! Watch for heartbeats from a monitored process and raise alarms when they stop.
use std::sync::Arc;

use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use stethoscope::config::Config;
use stethoscope::handlers::{app, AppState};
use stethoscope::liveness::LivenessState;
use stethoscope::metrics::setup_metrics_recorder;
use stethoscope::monitor::Monitor;
use stethoscope::notify::{Notification, Notifier};
use stethoscope::probes::MonitorProbe;
use stethoscope::shutdown::{NotifyOnShutdown, ShutdownHandler, SignalListener};
use stethoscope::time::SystemClock;

fn init_tracing(debug: bool) {
    let log_layer = {
        let base_layer = fmt::layer().with_target(true).with_level(true);

        if debug {
            base_layer
                .with_ansi(true)
                .with_filter(EnvFilter::from_default_env())
                .boxed()
        } else {
            base_layer
                .json()
                .with_filter(EnvFilter::from_default_env())
                .boxed()
        }
    };

    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env().wrap_err("failed to load configuration from env")?;
    init_tracing(config.debug);
    config.validate()?;

    let notifier = Arc::new(Notifier::from_config(&config));
    let monitor_config = config.monitor();
    let clock = Arc::new(SystemClock {});

    let state = LivenessState::new(clock.clone());
    let heartbeat = state.handle();
    let probe = MonitorProbe::new(config.probe_deadline(), clock);

    // Trap signals before anything can be reported, so that a SIGTERM arriving during
    // startup still goes through the shutdown hooks.
    let mut listener = SignalListener::new().wrap_err("failed to register signal handlers")?;
    let mut shutdown = ShutdownHandler::new(config.shutdown_timeout.0);
    shutdown.register(NotifyOnShutdown::new(
        notifier.clone(),
        config.shutdown_timeout.0,
    ));

    if config.report_on_startup {
        notifier.notify(&Notification::Started).await;
    }

    let mut monitor_task = Monitor::new(state, notifier.clone(), monitor_config)
        .with_probe(probe.clone())
        .spawn_supervised();

    let recorder_handle = if config.export_prometheus {
        Some(setup_metrics_recorder().wrap_err("failed to install metrics recorder")?)
    } else {
        None
    };
    let router = app(
        AppState {
            heartbeat,
            notifier: notifier.clone(),
            probe,
        },
        recorder_handle,
    );

    let (signal_tx, mut signal_rx) = oneshot::channel();
    let drain_timeout = config.shutdown_timeout.0;
    let shutdown_signal = async move {
        let signal = shutdown.wait_and_run(&mut listener).await;
        // In-flight requests get a bounded amount of time to drain, after which the
        // process goes down regardless.
        tokio::spawn(async move {
            tokio::time::sleep(drain_timeout).await;
            warn!("timed out draining http connections, exiting");
            std::process::exit(signal.exit_code());
        });
        signal_tx.send(signal).ok();
    };

    let bind = config.bind();
    let tcp_listener = tokio::net::TcpListener::bind(&bind)
        .await
        .wrap_err_with(|| format!("failed to bind {bind}"))?;
    info!("listening on {}", bind);

    let server = axum::serve(tcp_listener, router).with_graceful_shutdown(shutdown_signal);

    tokio::select! {
        result = server => {
            result.wrap_err("stethoscope http server failed")?;
        }
        reason = &mut monitor_task => {
            // The supervisor already sent the last-resort notification.
            let reason = reason.unwrap_or_else(|e| e.to_string());
            error!("heartbeat monitor exited, stopping: {}", reason);
            std::process::exit(1);
        }
    }

    match signal_rx.try_recv() {
        Ok(signal) => {
            info!(signal = signal.name(), "stethoscope terminated");
            std::process::exit(signal.exit_code());
        }
        Err(_) => {
            error!("stethoscope http server exited without a termination signal");
            std::process::exit(1);
        }
    }
}
