//! Termination handling: trap SIGINT/SIGTERM, run an ordered list of shutdown hooks
//! exactly once, each bounded by a timeout, then let the process terminate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use crate::notify::{Notification, Notifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
}

impl Signal {
    pub fn number(&self) -> i32 {
        match self {
            Signal::Interrupt => 2,
            Signal::Terminate => 15,
        }
    }

    /// Conventional exit status of a process terminated by this signal.
    pub fn exit_code(&self) -> i32 {
        128 + self.number()
    }

    pub fn name(&self) -> &'static str {
        match self {
            Signal::Interrupt => "SIGINT",
            Signal::Terminate => "SIGTERM",
        }
    }
}

/// Holds the SIGINT and SIGTERM streams. Once created, the default disposition for both
/// signals is replaced for the rest of the process, so whoever owns this is responsible
/// for eventually terminating.
pub struct SignalListener {
    term: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
}

impl SignalListener {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            term: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
        })
    }

    pub async fn recv(&mut self) -> Signal {
        tokio::select! {
            _ = self.term.recv() => Signal::Terminate,
            _ = self.interrupt.recv() => Signal::Interrupt,
        }
    }
}

#[async_trait]
pub trait ShutdownHook {
    fn name(&self) -> &str;
    async fn on_shutdown(&self, signal: Signal);
}

/// Sends the "terminating" notification to every channel.
pub struct NotifyOnShutdown {
    notifier: Arc<Notifier>,
    timeout: Duration,
}

impl NotifyOnShutdown {
    pub fn new(notifier: Arc<Notifier>, timeout: Duration) -> Self {
        Self { notifier, timeout }
    }
}

#[async_trait]
impl ShutdownHook for NotifyOnShutdown {
    fn name(&self) -> &str {
        "notify"
    }

    async fn on_shutdown(&self, _signal: Signal) {
        self.notifier
            .notify_within(&Notification::Terminating, self.timeout)
            .await;
    }
}

pub struct ShutdownHandler {
    hooks: Vec<Box<dyn ShutdownHook + Send + Sync>>,
    hook_timeout: Duration,
    fired: AtomicBool,
}

impl ShutdownHandler {
    pub fn new(hook_timeout: Duration) -> Self {
        Self {
            hooks: Vec::new(),
            hook_timeout,
            fired: AtomicBool::new(false),
        }
    }

    /// Hooks run in registration order.
    pub fn register<H>(&mut self, hook: H)
    where
        H: ShutdownHook + Send + Sync + 'static,
    {
        self.hooks.push(Box::new(hook));
    }

    /// Remove every hook registered under `name`, returns whether any was removed.
    pub fn unregister(&mut self, name: &str) -> bool {
        let before = self.hooks.len();
        self.hooks.retain(|hook| hook.name() != name);
        self.hooks.len() != before
    }

    pub fn hook_timeout(&self) -> Duration {
        self.hook_timeout
    }

    /// Run every hook once, in order, each bounded by the hook timeout. Returns false
    /// without doing anything if the hooks already ran.
    pub async fn run_hooks(&self, signal: Signal) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }

        info!(signal = signal.name(), "stethoscope is about to terminate");
        for hook in &self.hooks {
            if tokio::time::timeout(self.hook_timeout, hook.on_shutdown(signal))
                .await
                .is_err()
            {
                warn!(
                    hook = hook.name(),
                    timeout_ms = self.hook_timeout.as_millis() as u64,
                    "shutdown hook timed out"
                );
            }
        }
        true
    }

    /// Wait for the first termination signal and run the hooks. A second signal while
    /// the hooks are still running cuts them short.
    pub async fn wait_and_run(&self, listener: &mut SignalListener) -> Signal {
        let signal = listener.recv().await;

        tokio::select! {
            _ = self.run_hooks(signal) => {},
            second = listener.recv() => {
                warn!(signal = second.name(), "second signal received, skipping remaining shutdown hooks");
            }
        }
        signal
    }
}
