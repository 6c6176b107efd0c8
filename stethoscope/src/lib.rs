//! Heartbeat watchdog.
//!
//! A monitored process POSTs to `/heartbeat` periodically. A background monitor checks
//! once per tick how long ago the last heartbeat arrived and notifies the configured
//! channels when heartbeats stop and when they come back. The watchdog also reports
//! itself alive every N ticks, relays explicit alarms, and says goodbye on SIGINT/SIGTERM.

pub mod config;
pub mod error;
pub mod handlers;
pub mod liveness;
pub mod metrics;
pub mod monitor;
pub mod notify;
pub mod probes;
pub mod shutdown;
pub mod time;
