use std::any::Any;
use std::time;

use thiserror::Error;

/// Enumeration of errors a notification channel can return from a single send.
/// None of these ever reach the code asking for a notification, see `notify::Notifier`.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("channel is misconfigured: {0}")]
    Misconfigured(String),
    #[error("channel panicked: {0}")]
    Panicked(String),
    #[error("send timed out after {0:?}")]
    Timeout(time::Duration),
    #[error("failed to build email message: {0}")]
    Message(String),
    #[error("smtp delivery failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("push request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("push request rejected with status {status}: {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// Enumeration of errors in the loaded configuration.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
    #[error("heartbeat timeout ({timeout_secs}s) must be greater than the tick interval ({tick_secs}s)")]
    TimeoutNotAboveTick { timeout_secs: u64, tick_secs: u64 },
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("{key} is invalid: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}
