// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::time::Duration;

use derive_more::{Add, AddAssign, Display, From, Into, Sub, SubAssign};
use slog::Logger;

/// The default per-connection workload ceiling
pub const DEFAULT_MAX_WORKLOAD: i64 = 10 * 1024 * 1024;
/// The default minimum number of connections per host
pub const DEFAULT_MIN_CONNECTIONS: u32 = 1;
/// The default maximum number of connections per host
pub const DEFAULT_MAX_CONNECTIONS_PER_HOST: u32 = 4;
/// The default maximum number of connections across all hosts
pub const DEFAULT_MAX_CONNECTIONS: u32 = 128;
/// The default idle time in seconds before a connection is closed
pub const DEFAULT_MIN_IDLE: u64 = 30;
/// The default connect timeout in seconds
pub const DEFAULT_CONNECT_TIMEOUT: u64 = 5;
/// The default cap in seconds on a connection's cooldown sleep
pub const DEFAULT_MAX_WAIT: u64 = 30;
/// The default interval in seconds between raises of a host's stable
/// connection floor
pub const DEFAULT_WAIT_STABLE_TIME: u64 = 15;
/// The default number of consecutive failed connects after which a host's
/// queued tasks are failed
pub const DEFAULT_ABORT_CONN_ATTEMPTS: u32 = 4;
/// The default interval in seconds between connection checks run by a
/// connection's receive thread
pub const DEFAULT_CHECK_CONNECTION_INTERVAL: u64 = 2;
/// The default retry budget of a command that does not set one
pub const DEFAULT_MAX_RETRY: i32 = 2;
/// The default interval in seconds between compaction passes
pub const DEFAULT_COMPACT_INTERVAL: u64 = 10;

// Dedicated portals always use a single connection with this connect timeout
pub(crate) const DIRECT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// The configuration options for a portal context.
#[derive(Clone, Debug, Default)]
pub struct PortalOptions {
    /// An optional workload ceiling for a single connection. A connection
    /// stops sending once the workload of its outstanding commands reaches
    /// the ceiling, and a host gets one connection per ceiling's worth of
    /// queued and executing work. If not specified the default is 10 MiB.
    pub max_workload: Option<i64>,
    /// Optional minimum number of connections kept for a host with queued
    /// work. If not specified the default is 1.
    pub min_connections: Option<u32>,
    /// Optional maximum number of connections to a single host. If not
    /// specified the default is 4.
    pub max_connections_per_host: Option<u32>,
    /// Optional maximum number of connections across all hosts. When reached,
    /// the least loaded connection is closed before a new one is opened. If
    /// not specified the default is 128.
    pub max_connections: Option<u32>,
    /// Optional idle time in seconds after which a connection with nothing
    /// outstanding is closed. If not specified the default is 30 seconds.
    pub min_idle: Option<u64>,
    /// Optional connect timeout in seconds. If not specified the default is
    /// 5 seconds.
    pub connect_timeout: Option<u64>,
    /// Optional cap in seconds on the cooldown a dead connection imposes on
    /// its host. If not specified the default is 30 seconds.
    pub max_wait: Option<u64>,
    /// Optional interval in seconds between raises of a host's stable
    /// connection floor. If not specified the default is 15 seconds.
    pub wait_stable_time: Option<u64>,
    /// Optional number of consecutive failed connects after which a host's
    /// queued tasks are failed with `cant-connect`. If not specified the
    /// default is 4.
    pub abort_conn_attempts: Option<u32>,
    /// Optional interval in seconds between the connection checks run by each
    /// connection. If not specified the default is 2 seconds.
    pub check_connection_interval: Option<u64>,
    /// Optional retry budget for commands that do not set their own. If not
    /// specified the default is 2.
    pub max_retry: Option<i32>,
    /// Optional interval in seconds between compaction passes that remove
    /// unused hosts. If not specified the default is 10 seconds.
    pub compact_interval: Option<u64>,
    /// An optional `slog` logger instance. If none is provided the logger of
    /// the `GopSystem` is used.
    pub log: Option<Logger>,
}

// Options resolved against their defaults
#[derive(Clone, Debug)]
pub(crate) struct PortalConfig {
    pub max_workload: i64,
    pub min_conn: i64,
    pub max_conn: i64,
    pub max_connections: i64,
    pub min_idle: Duration,
    pub connect_timeout: Duration,
    pub max_wait: Duration,
    pub wait_stable_time: Duration,
    pub abort_conn_attempts: i64,
    pub check_connection_interval: Duration,
    pub max_retry: i32,
    pub compact_interval: u64,
}

impl PortalConfig {
    pub fn from_options(po: &PortalOptions) -> Self {
        PortalConfig {
            max_workload: po.max_workload.unwrap_or(DEFAULT_MAX_WORKLOAD).max(1),
            min_conn: i64::from(
                po.min_connections.unwrap_or(DEFAULT_MIN_CONNECTIONS),
            ),
            max_conn: i64::from(
                po.max_connections_per_host
                    .unwrap_or(DEFAULT_MAX_CONNECTIONS_PER_HOST),
            ),
            max_connections: i64::from(
                po.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            ),
            min_idle: Duration::from_secs(
                po.min_idle.unwrap_or(DEFAULT_MIN_IDLE),
            ),
            connect_timeout: Duration::from_secs(
                po.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            ),
            max_wait: Duration::from_secs(
                po.max_wait.unwrap_or(DEFAULT_MAX_WAIT),
            ),
            wait_stable_time: Duration::from_secs(
                po.wait_stable_time.unwrap_or(DEFAULT_WAIT_STABLE_TIME),
            ),
            abort_conn_attempts: i64::from(
                po.abort_conn_attempts
                    .unwrap_or(DEFAULT_ABORT_CONN_ATTEMPTS),
            ),
            check_connection_interval: Duration::from_secs(
                po.check_connection_interval
                    .unwrap_or(DEFAULT_CHECK_CONNECTION_INTERVAL),
            ),
            max_retry: po.max_retry.unwrap_or(DEFAULT_MAX_RETRY),
            compact_interval: po
                .compact_interval
                .unwrap_or(DEFAULT_COMPACT_INTERVAL)
                .max(1),
        }
    }
}

/// A newtype wrapper around u32 used for connection counts
#[derive(
    Add,
    AddAssign,
    Clone,
    Copy,
    Debug,
    Default,
    Display,
    Eq,
    From,
    Into,
    Ord,
    PartialOrd,
    PartialEq,
    Sub,
    SubAssign,
)]
pub struct ConnectionCount(u32);

/// A snapshot of one host portal
#[derive(Clone, Copy, Debug, Default)]
pub struct PortalStats {
    /// Connections that are intended to exist, including ones still starting
    pub intended_connections: ConnectionCount,
    /// Connections that have connected (or failed to) and are running
    pub live_connections: ConnectionCount,
    /// Connections that exited and are waiting to be reaped
    pub closed_connections: ConnectionCount,
    /// Connections in their teardown cooldown
    pub sleeping_connections: ConnectionCount,
    /// The current stable connection floor
    pub stable_connections: i64,
    pub queued_tasks: usize,
    pub queued_workload: i64,
    pub executing_workload: i64,
    pub dedicated_portals: usize,
    pub successful_connects: u64,
    pub failed_connects: u64,
    pub commands_processed: u64,
    pub invalid_host: bool,
}

/// The lifecycle of a portal context
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ContextState {
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for ContextState {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ContextState::Running => String::from("running").fmt(fmt),
            ContextState::Stopping => String::from("stopping").fmt(fmt),
            ContextState::Stopped => String::from("stopped").fmt(fmt),
        }
    }
}

/// A request for a host connection to stop
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ShutdownRequest {
    None,
    /// Stop once nothing is outstanding
    Requested,
    /// The send side exited with tasks still outstanding; the receive side
    /// collects them before stopping.
    DrainPending,
}

impl fmt::Display for ShutdownRequest {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ShutdownRequest::None => String::from("none").fmt(fmt),
            ShutdownRequest::Requested => String::from("requested").fmt(fmt),
            ShutdownRequest::DrainPending => {
                String::from("drain-pending").fmt(fmt)
            }
        }
    }
}

/// Whether a host connection is being closed by someone other than itself
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum CloseState {
    Open,
    /// Picked to be closed; reaping must wait
    Closing,
    /// Closed by the picker and safe to reap
    Released,
}

/// The receive thread's startup handshake with the send thread
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Startup {
    Pending,
    Ready,
    Failed,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn options_fall_back_to_defaults() {
        let config = PortalConfig::from_options(&PortalOptions {
            max_connections_per_host: Some(8),
            ..PortalOptions::default()
        });
        assert_eq!(config.max_conn, 8);
        assert_eq!(config.min_conn, i64::from(DEFAULT_MIN_CONNECTIONS));
        assert_eq!(config.max_workload, DEFAULT_MAX_WORKLOAD);
        assert_eq!(config.min_idle, Duration::from_secs(DEFAULT_MIN_IDLE));
        assert_eq!(ContextState::Stopping.to_string(), "stopping");
        assert_eq!(ShutdownRequest::DrainPending.to_string(), "drain-pending");
    }
}
