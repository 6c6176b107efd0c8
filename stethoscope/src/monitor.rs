//! The heartbeat monitor: a fixed-period loop comparing the time since the last
//! heartbeat against a threshold, edge-triggering notifications on transitions and
//! proving its own liveness with a periodic self-report.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::error::panic_message;
use crate::liveness::LivenessState;
use crate::notify::{Notification, Notifier};
use crate::probes::MonitorProbe;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    pub tick_interval: Duration,
    /// Must exceed `tick_interval` by at least one missed tick to absorb scheduling jitter.
    pub heartbeat_timeout: Duration,
    pub reporting_interval_ticks: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Healthy,
    Alerting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Lost,
    Recovered,
}

/// What a single tick did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickOutcome {
    pub transition: Option<Transition>,
    pub self_report: bool,
}

pub struct Monitor {
    state: LivenessState,
    notifier: Arc<Notifier>,
    config: MonitorConfig,
    /// Ticks since the last self-report, only touched by the loop.
    ticks_since_report: u64,
    probe: Option<MonitorProbe>,
}

impl Monitor {
    pub fn new(state: LivenessState, notifier: Arc<Notifier>, config: MonitorConfig) -> Self {
        Self {
            state,
            notifier,
            config,
            ticks_since_report: 0,
            probe: None,
        }
    }

    /// Report every completed tick to `probe`, for the `/_liveness` endpoint.
    pub fn with_probe(mut self, probe: MonitorProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn state(&self) -> MonitorState {
        match self.state.snapshot().alert_active {
            true => MonitorState::Alerting,
            false => MonitorState::Healthy,
        }
    }

    pub fn ticks_since_report(&self) -> u64 {
        self.ticks_since_report
    }

    /// Evaluate the state machine once.
    ///
    /// Tick bookkeeping (self-report counter, probe) happens first so that a tick which
    /// fails later still counts. The snapshot is a pair of atomic loads, nothing is held
    /// while notifications are sent. State moves before each send, so a failed send can
    /// never cause the same transition to be notified twice.
    pub async fn tick(&mut self) -> TickOutcome {
        // Independent of the alert state: the watchdog proves it is alive every N ticks.
        self.ticks_since_report += 1;
        let self_report = self.ticks_since_report >= self.config.reporting_interval_ticks;
        if self_report {
            self.ticks_since_report = 0;
        }
        if let Some(probe) = &self.probe {
            probe.report_tick();
        }

        let snapshot = self.state.snapshot();
        let stale = snapshot.elapsed > self.config.heartbeat_timeout;

        metrics::counter!("stethoscope_monitor_ticks_total").increment(1);
        metrics::gauge!("stethoscope_seconds_since_heartbeat").set(snapshot.elapsed.as_secs_f64());

        let transition = match (stale, snapshot.alert_active) {
            (true, false) => {
                warn!(
                    elapsed_secs = snapshot.elapsed.as_secs(),
                    timeout_secs = self.config.heartbeat_timeout.as_secs(),
                    "heartbeat lost"
                );
                self.state.set_alert_active(true);
                metrics::gauge!("stethoscope_alert_active").set(1.0);
                self.notifier.notify(&Notification::HeartbeatLost).await;
                Some(Transition::Lost)
            }
            (false, true) => {
                info!(elapsed_secs = snapshot.elapsed.as_secs(), "heartbeat recovered");
                self.state.set_alert_active(false);
                metrics::gauge!("stethoscope_alert_active").set(0.0);
                self.notifier.notify(&Notification::HeartbeatRecovered).await;
                Some(Transition::Recovered)
            }
            _ => None,
        };

        if self_report {
            self.notifier.notify(&Notification::SelfReport).await;
        }

        TickOutcome {
            transition,
            self_report,
        }
    }

    /// One tick behind a panic guard. A panicking tick is logged and notified, and
    /// returns `None`; the loop carries on with the next tick.
    pub async fn guarded_tick(&mut self) -> Option<TickOutcome> {
        match AssertUnwindSafe(self.tick()).catch_unwind().await {
            Ok(outcome) => Some(outcome),
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!("monitor tick failed: {}", reason);
                metrics::counter!("stethoscope_monitor_tick_panics_total").increment(1);

                self.notifier
                    .notify(&Notification::MonitorTickFailed(reason))
                    .await;
                None
            }
        }
    }

    /// Tick forever. The first check happens one full interval after the loop starts;
    /// late ticks are delayed rather than bunched up.
    pub async fn run(mut self) {
        info!(
            tick_secs = self.config.tick_interval.as_secs_f64(),
            timeout_secs = self.config.heartbeat_timeout.as_secs_f64(),
            reporting_interval_ticks = self.config.reporting_interval_ticks,
            "starting heartbeat monitor"
        );

        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of a tokio interval completes immediately.
        interval.tick().await;

        loop {
            interval.tick().await;
            self.guarded_tick().await;
        }
    }

    /// Spawn the loop under [`supervise`], which sends the last-resort notification if
    /// the loop ever ends.
    pub fn spawn_supervised(self) -> JoinHandle<String> {
        let notifier = self.notifier.clone();
        tokio::spawn(supervise(self.run(), notifier))
    }
}

/// Run `monitor` to completion in its own task, then send a `MonitorExited` notification
/// to every channel. Returns the exit reason.
///
/// The monitor is expected to run for the whole life of the process, so reaching the
/// notification at all means the watchdog is about to be blind. It fires at most once, as
/// this function only ever awaits one monitor.
pub async fn supervise<F>(monitor: F, notifier: Arc<Notifier>) -> String
where
    F: Future<Output = ()> + Send + 'static,
{
    let reason = match tokio::spawn(monitor).await {
        Ok(()) => "monitor loop returned".to_owned(),
        Err(e) if e.is_panic() => panic_message(e.into_panic().as_ref()),
        Err(e) => e.to_string(),
    };

    error!("heartbeat monitor exited: {}", reason);
    notifier
        .notify(&Notification::MonitorExited(reason.clone()))
        .await;
    reason
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::error::NotifyError;
    use crate::notify::NotificationChannel;
    use crate::time::{Clock, ManualClock};

    #[derive(Clone, Default)]
    struct MemoryChannel {
        sent: Arc<Mutex<Vec<Notification>>>,
    }

    impl MemoryChannel {
        fn sent(&self) -> Vec<Notification> {
            self.sent.lock().unwrap().clone()
        }

        fn count(&self, notification: &Notification) -> usize {
            self.sent().iter().filter(|n| *n == notification).count()
        }
    }

    #[async_trait]
    impl NotificationChannel for MemoryChannel {
        fn name(&self) -> &str {
            "memory"
        }

        async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
            self.sent.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    /// Panics when asked to deliver a lost heartbeat, behaves otherwise.
    struct PanickingChannel;

    #[async_trait]
    impl NotificationChannel for PanickingChannel {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
            if *notification == Notification::HeartbeatLost {
                panic!("transport exploded");
            }
            Ok(())
        }
    }

    /// Manual clock that can be told to panic on read.
    #[derive(Clone)]
    struct FaultyClock {
        inner: ManualClock,
        broken: Arc<AtomicBool>,
    }

    impl Clock for FaultyClock {
        fn now_ms(&self) -> i64 {
            if self.broken.load(Ordering::SeqCst) {
                panic!("clock unavailable");
            }
            self.inner.now_ms()
        }
    }

    const TICK: Duration = Duration::from_secs(60);

    fn config(reporting_interval_ticks: u64) -> MonitorConfig {
        MonitorConfig {
            tick_interval: TICK,
            heartbeat_timeout: Duration::from_secs(180),
            reporting_interval_ticks,
        }
    }

    fn monitor_with(notifier: Notifier, clock: &ManualClock, reporting: u64) -> Monitor {
        let state = LivenessState::new(Arc::new(clock.clone()));
        Monitor::new(state, Arc::new(notifier), config(reporting))
    }

    #[tokio::test]
    async fn steady_heartbeats_never_alert() {
        let clock = ManualClock::new(0);
        let urgent = MemoryChannel::default();
        let notifier = Notifier::new(Duration::from_secs(1)).with_channel(urgent.clone(), false);
        let mut monitor = monitor_with(notifier, &clock, 1_000);
        let heartbeat = monitor.state.handle();

        for _ in 0..100 {
            // Heartbeats 2m59s apart: always within the 3 minute threshold.
            clock.advance(Duration::from_secs(179));
            heartbeat.record_heartbeat();
            let outcome = monitor.tick().await;
            assert_eq!(outcome.transition, None);
            assert_eq!(monitor.state(), MonitorState::Healthy);
        }
        assert!(urgent.sent().is_empty());
    }

    #[tokio::test]
    async fn lost_is_edge_triggered() {
        let clock = ManualClock::new(0);
        let channel = MemoryChannel::default();
        let notifier = Notifier::new(Duration::from_secs(1)).with_channel(channel.clone(), true);
        let mut monitor = monitor_with(notifier, &clock, 1_000);

        // Exactly at the threshold is still healthy.
        clock.advance(Duration::from_secs(180));
        assert_eq!(monitor.tick().await.transition, None);

        clock.advance(Duration::from_secs(1));
        assert_eq!(monitor.tick().await.transition, Some(Transition::Lost));
        assert_eq!(monitor.state(), MonitorState::Alerting);

        for _ in 0..10 {
            clock.advance(TICK);
            assert_eq!(monitor.tick().await.transition, None);
        }
        assert_eq!(channel.count(&Notification::HeartbeatLost), 1);
        assert_eq!(monitor.state(), MonitorState::Alerting);
    }

    #[tokio::test]
    async fn recovery_goes_to_informational_channels_once() {
        let clock = ManualClock::new(0);
        let urgent = MemoryChannel::default();
        let informational = MemoryChannel::default();
        let notifier = Notifier::new(Duration::from_secs(1))
            .with_channel(urgent.clone(), false)
            .with_channel(informational.clone(), true);
        let mut monitor = monitor_with(notifier, &clock, 1_000);
        let heartbeat = monitor.state.handle();

        clock.advance(Duration::from_secs(600));
        assert_eq!(monitor.tick().await.transition, Some(Transition::Lost));

        heartbeat.record_heartbeat();
        clock.advance(TICK);
        assert_eq!(monitor.tick().await.transition, Some(Transition::Recovered));
        assert_eq!(monitor.state(), MonitorState::Healthy);

        clock.advance(TICK);
        assert_eq!(monitor.tick().await.transition, None);

        assert_eq!(urgent.sent(), vec![Notification::HeartbeatLost]);
        assert_eq!(
            informational.sent(),
            vec![Notification::HeartbeatLost, Notification::HeartbeatRecovered]
        );
    }

    #[tokio::test]
    async fn self_report_fires_while_alerting() {
        let clock = ManualClock::new(0);
        let channel = MemoryChannel::default();
        let notifier = Notifier::new(Duration::from_secs(1)).with_channel(channel.clone(), false);
        let mut monitor = monitor_with(notifier, &clock, 3);

        let mut reports = Vec::new();
        for tick in 1..=9 {
            // Never any heartbeat: alerting from the fourth tick on.
            clock.advance(TICK);
            if monitor.tick().await.self_report {
                reports.push(tick);
                assert_eq!(monitor.ticks_since_report(), 0);
            }
        }

        assert_eq!(reports, vec![3, 6, 9]);
        assert_eq!(monitor.state(), MonitorState::Alerting);
        assert_eq!(channel.count(&Notification::SelfReport), 3);
        assert_eq!(channel.count(&Notification::HeartbeatLost), 1);
    }

    #[tokio::test]
    async fn panicking_channel_does_not_fail_the_tick() {
        let clock = ManualClock::new(0);
        let channel = MemoryChannel::default();
        let notifier = Notifier::new(Duration::from_secs(1))
            .with_channel(PanickingChannel, true)
            .with_channel(channel.clone(), true);
        let mut monitor = monitor_with(notifier, &clock, 1_000);

        clock.advance(Duration::from_secs(600));
        assert_eq!(
            monitor.guarded_tick().await,
            Some(TickOutcome {
                transition: Some(Transition::Lost),
                self_report: false,
            })
        );
        assert_eq!(monitor.state(), MonitorState::Alerting);

        clock.advance(TICK);
        assert_eq!(monitor.guarded_tick().await, Some(TickOutcome::default()));

        assert_eq!(channel.count(&Notification::HeartbeatLost), 1);
        assert_eq!(channel.sent(), vec![Notification::HeartbeatLost]);
    }

    #[tokio::test]
    async fn panicking_tick_is_contained() {
        let clock = FaultyClock {
            inner: ManualClock::new(0),
            broken: Arc::new(AtomicBool::new(false)),
        };
        let channel = MemoryChannel::default();
        let notifier = Notifier::new(Duration::from_secs(1)).with_channel(channel.clone(), false);
        let state = LivenessState::new(Arc::new(clock.clone()));
        let heartbeat = state.handle();
        let mut monitor = Monitor::new(state, Arc::new(notifier), config(3));

        let mut reports = Vec::new();
        for tick in 1..=7 {
            clock.inner.advance(TICK);
            // Tick 2 blows up half way through.
            clock.broken.store(tick == 2, Ordering::SeqCst);
            if tick != 2 {
                heartbeat.record_heartbeat();
            }
            match monitor.guarded_tick().await {
                Some(outcome) if outcome.self_report => reports.push(tick),
                Some(_) => {}
                None => assert_eq!(tick, 2),
            }
        }

        // The failed tick still counted towards the self-report cadence.
        assert_eq!(reports, vec![3, 6]);
        assert_eq!(monitor.ticks_since_report(), 1);
        assert_eq!(
            channel.count(&Notification::MonitorTickFailed(
                "clock unavailable".to_owned()
            )),
            1
        );
        assert_eq!(channel.count(&Notification::SelfReport), 2);
        assert_eq!(monitor.state(), MonitorState::Healthy);
    }

    #[tokio::test]
    async fn ticks_feed_the_probe() {
        let clock = ManualClock::new(0);
        let probe = MonitorProbe::new(2 * TICK, Arc::new(clock.clone()));
        let mut monitor =
            monitor_with(Notifier::new(Duration::from_secs(1)), &clock, 1_000).with_probe(probe.clone());

        clock.advance(3 * TICK);
        assert!(!probe.check().healthy);

        monitor.tick().await;
        assert!(probe.check().healthy);
    }

    #[tokio::test]
    async fn supervisor_notifies_once_when_monitor_dies() {
        let channel = MemoryChannel::default();
        let notifier =
            Arc::new(Notifier::new(Duration::from_secs(1)).with_channel(channel.clone(), false));

        let reason = supervise(async { panic!("loop crashed") }, notifier).await;

        assert_eq!(reason, "loop crashed");
        assert_eq!(
            channel.sent(),
            vec![Notification::MonitorExited("loop crashed".to_owned())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn run_ticks_on_the_interval() {
        let clock = ManualClock::new(0);
        let channel = MemoryChannel::default();
        let notifier = Notifier::new(Duration::from_secs(1)).with_channel(channel.clone(), false);
        let monitor = monitor_with(notifier, &clock, 2);

        let handle = tokio::spawn(monitor.run());

        // Nothing at start, a self-report after two full intervals.
        tokio::time::sleep(TICK + Duration::from_secs(1)).await;
        assert!(channel.sent().is_empty());
        tokio::time::sleep(TICK).await;
        assert_eq!(channel.sent(), vec![Notification::SelfReport]);

        handle.abort();
    }
}
