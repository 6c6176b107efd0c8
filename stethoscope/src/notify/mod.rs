//! Notification fan-out.
//!
//! Every send is best-effort: a channel returns a `Result`, and the [`Notifier`] is the
//! single place where failures are logged, counted and dropped. Nothing that asks for a
//! notification ever sees a transport error, and a broken transport never stops the
//! others from being tried.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{panic_message, NotifyError};

pub mod email;
pub mod pushover;

pub use email::EmailChannel;
pub use pushover::PushoverChannel;

/// Which channels a notification goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Urgent: every configured channel.
    All,
    /// Good to know: only channels flagged as informational.
    Informational,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Started,
    HeartbeatLost,
    HeartbeatRecovered,
    SelfReport,
    ExplicitAlarm,
    Terminating,
    MonitorTickFailed(String),
    MonitorExited(String),
}

impl Notification {
    pub fn message(&self) -> String {
        match self {
            Notification::Started | Notification::SelfReport => {
                "Stethoscope is working.".to_owned()
            }
            Notification::HeartbeatLost => "Heartbeat lost!".to_owned(),
            Notification::HeartbeatRecovered => "Heartbeat recovered!".to_owned(),
            Notification::ExplicitAlarm => "Explicit alarm triggered".to_owned(),
            Notification::Terminating => "Stethoscope app is terminating".to_owned(),
            Notification::MonitorTickFailed(reason) => {
                format!("Stethoscope check failed, still running: {reason}")
            }
            Notification::MonitorExited(reason) => {
                format!("FATAL: Stethoscope checking thread exited: {reason}")
            }
        }
    }

    pub fn audience(&self) -> Audience {
        match self {
            // Recovery is informational, loss is broadcast everywhere.
            Notification::HeartbeatRecovered => Audience::Informational,
            _ => Audience::All,
        }
    }

    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Started => "started",
            Notification::HeartbeatLost => "heartbeat_lost",
            Notification::HeartbeatRecovered => "heartbeat_recovered",
            Notification::SelfReport => "self_report",
            Notification::ExplicitAlarm => "explicit_alarm",
            Notification::Terminating => "terminating",
            Notification::MonitorTickFailed(_) => "monitor_tick_failed",
            Notification::MonitorExited(_) => "monitor_exited",
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

/// A transport able to deliver a notification somewhere a human will see it.
#[async_trait]
pub trait NotificationChannel {
    fn name(&self) -> &str;
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Stands in for a transport whose configuration could not be used: every send fails
/// with the configuration error, so the problem shows up in the logs each time.
pub struct MisconfiguredChannel {
    name: String,
    reason: String,
}

impl MisconfiguredChannel {
    pub fn new(name: &str, reason: impl Into<String>) -> Self {
        Self {
            name: name.to_owned(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl NotificationChannel for MisconfiguredChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, _notification: &Notification) -> Result<(), NotifyError> {
        Err(NotifyError::Misconfigured(self.reason.clone()))
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub sent: usize,
    pub failed: usize,
}

struct RegisteredChannel {
    channel: Arc<dyn NotificationChannel + Send + Sync>,
    informational: bool,
}

pub struct Notifier {
    channels: Vec<RegisteredChannel>,
    send_timeout: Duration,
}

impl Notifier {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            channels: Vec::new(),
            send_timeout,
        }
    }

    /// Register a channel. Informational channels also receive `Audience::Informational`
    /// notifications, all channels receive `Audience::All` ones.
    pub fn with_channel<C>(mut self, channel: C, informational: bool) -> Self
    where
        C: NotificationChannel + Send + Sync + 'static,
    {
        self.channels.push(RegisteredChannel {
            channel: Arc::new(channel),
            informational,
        });
        self
    }

    /// Build the notifier from the configured transports. A transport that is not
    /// configured at all is skipped; one that is only partly or wrongly configured is
    /// kept as a [`MisconfiguredChannel`] so that every notification logs the problem.
    pub fn from_config(config: &Config) -> Self {
        let mut notifier = Notifier::new(config.notify_timeout.0);

        match EmailChannel::from_config(&config.email) {
            Ok(Some(channel)) => {
                info!(channel = "email", "notification channel configured");
                notifier = notifier.with_channel(channel, config.email.email_informational);
            }
            Ok(None) => info!(channel = "email", "notification channel not configured"),
            Err(e) => {
                error!(channel = "email", "notification channel misconfigured: {}", e);
                notifier = notifier.with_channel(
                    MisconfiguredChannel::new("email", e.to_string()),
                    config.email.email_informational,
                );
            }
        }

        match PushoverChannel::from_config(&config.pushover, config.notify_timeout.0) {
            Ok(Some(channel)) => {
                info!(channel = "pushover", "notification channel configured");
                notifier =
                    notifier.with_channel(channel, config.pushover.pushover_informational);
            }
            Ok(None) => info!(channel = "pushover", "notification channel not configured"),
            Err(e) => {
                error!(channel = "pushover", "notification channel misconfigured: {}", e);
                notifier = notifier.with_channel(
                    MisconfiguredChannel::new("pushover", e.to_string()),
                    config.pushover.pushover_informational,
                );
            }
        }

        if notifier.is_empty() {
            warn!("no notification channel configured, alerts will only be logged");
        }
        notifier
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Send to every channel in the notification's audience, each send bounded by the
    /// configured timeout.
    pub async fn notify(&self, notification: &Notification) -> Delivery {
        self.notify_within(notification, self.send_timeout).await
    }

    /// Same as [`Notifier::notify`] with an explicit per-send timeout.
    pub async fn notify_within(&self, notification: &Notification, timeout: Duration) -> Delivery {
        let audience = notification.audience();
        info!(
            notification = notification.kind(),
            audience = ?audience,
            "{}",
            notification
        );

        let sends = self
            .channels
            .iter()
            .filter(|registered| audience == Audience::All || registered.informational)
            .map(|registered| {
                let channel = registered.channel.clone();
                async move {
                    // A panicking transport is one more failed send, the others still run.
                    let send = tokio::time::timeout(timeout, channel.send(notification));
                    let result = match AssertUnwindSafe(send).catch_unwind().await {
                        Ok(Ok(result)) => result,
                        Ok(Err(_)) => Err(NotifyError::Timeout(timeout)),
                        Err(panic) => Err(NotifyError::Panicked(panic_message(panic.as_ref()))),
                    };
                    (channel, result)
                }
            });

        let mut delivery = Delivery::default();
        for (channel, result) in join_all(sends).await {
            let outcome = match result {
                Ok(()) => {
                    delivery.sent += 1;
                    "sent"
                }
                Err(e) => {
                    delivery.failed += 1;
                    error!(
                        channel = channel.name(),
                        notification = notification.kind(),
                        "failed to send notification: {}",
                        e
                    );
                    "failed"
                }
            };
            metrics::counter!(
                "stethoscope_notifications_total",
                "notification" => notification.kind(),
                "channel" => channel.name().to_owned(),
                "outcome" => outcome
            )
            .increment(1);
        }
        delivery
    }
}
