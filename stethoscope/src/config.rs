use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

use crate::error::ConfigError;
use crate::monitor::MonitorConfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "64250")]
    pub port: u16,

    #[envconfig(default = "60")]
    pub tick_interval_secs: u64,

    #[envconfig(default = "180")]
    pub heartbeat_timeout_secs: u64,

    // 10 days worth of ticks at the default tick interval
    #[envconfig(default = "14400")]
    pub reporting_interval_ticks: u64,

    #[envconfig(default = "true")]
    pub report_on_startup: bool,

    #[envconfig(from = "NOTIFY_TIMEOUT_MS", default = "10000")]
    pub notify_timeout: EnvMsDuration,

    #[envconfig(from = "SHUTDOWN_TIMEOUT_MS", default = "5000")]
    pub shutdown_timeout: EnvMsDuration,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    #[envconfig(default = "false")]
    pub debug: bool,

    #[envconfig(nested = true)]
    pub email: EmailConfig,

    #[envconfig(nested = true)]
    pub pushover: PushoverConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check the monitor timings. Transport settings are not checked here: a broken
    /// transport degrades on its own and never prevents startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_secs == 0 {
            return Err(ConfigError::ZeroValue("TICK_INTERVAL_SECS"));
        }
        if self.heartbeat_timeout_secs == 0 {
            return Err(ConfigError::ZeroValue("HEARTBEAT_TIMEOUT_SECS"));
        }
        if self.reporting_interval_ticks == 0 {
            return Err(ConfigError::ZeroValue("REPORTING_INTERVAL_TICKS"));
        }
        if self.heartbeat_timeout_secs <= self.tick_interval_secs {
            return Err(ConfigError::TimeoutNotAboveTick {
                timeout_secs: self.heartbeat_timeout_secs,
                tick_secs: self.tick_interval_secs,
            });
        }
        if self.heartbeat_timeout_secs < 2 * self.tick_interval_secs {
            tracing::warn!(
                timeout_secs = self.heartbeat_timeout_secs,
                tick_secs = self.tick_interval_secs,
                "heartbeat timeout leaves less than one missed tick of margin, expect false alarms"
            );
        }
        Ok(())
    }

    /// How long `/_liveness` tolerates no completed tick. A tick sends at most two
    /// notifications (a transition and a self-report), each bounded by the notify timeout.
    pub fn probe_deadline(&self) -> time::Duration {
        2 * time::Duration::from_secs(self.tick_interval_secs) + 2 * self.notify_timeout.0
    }

    pub fn monitor(&self) -> MonitorConfig {
        MonitorConfig {
            tick_interval: time::Duration::from_secs(self.tick_interval_secs),
            heartbeat_timeout: time::Duration::from_secs(self.heartbeat_timeout_secs),
            reporting_interval_ticks: self.reporting_interval_ticks,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

// Every transport key is optional so that a missing or malformed value only disables
// that transport. The port is kept as a string for the same reason.
#[derive(Envconfig, Clone, Default)]
pub struct EmailConfig {
    pub email_from: Option<String>,
    pub email_to: Option<String>,
    pub email_smtp_host: Option<String>,
    pub email_smtp_port: Option<String>,
    pub email_user: Option<String>,
    pub email_password: Option<String>,

    #[envconfig(default = "false")]
    pub email_informational: bool,
}

impl EmailConfig {
    pub fn is_unset(&self) -> bool {
        [
            &self.email_from,
            &self.email_to,
            &self.email_smtp_host,
            &self.email_smtp_port,
            &self.email_user,
            &self.email_password,
        ]
        .iter()
        .all(|value| value.is_none())
    }

    pub fn smtp_port(&self) -> Result<u16, ConfigError> {
        let port = required(&self.email_smtp_port, "EMAIL_SMTP_PORT")?;
        port.parse::<u16>().map_err(|e| ConfigError::Invalid {
            key: "EMAIL_SMTP_PORT",
            reason: e.to_string(),
        })
    }
}

#[derive(Envconfig, Clone, Default)]
pub struct PushoverConfig {
    pub pushover_token: Option<String>,
    pub pushover_user: Option<String>,

    #[envconfig(default = "https://api.pushover.net/1/messages.json")]
    pub pushover_api_url: String,

    #[envconfig(default = "true")]
    pub pushover_informational: bool,
}

impl PushoverConfig {
    pub fn is_unset(&self) -> bool {
        self.pushover_token.is_none() && self.pushover_user.is_none()
    }
}

/// Fetch a required transport key, treating an empty value as missing.
pub fn required<'a>(value: &'a Option<String>, key: &'static str) -> Result<&'a str, ConfigError> {
    match value.as_deref() {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(key)),
    }
}
