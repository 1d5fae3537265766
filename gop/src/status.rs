// Copyright 2020 Joyent, Inc.

use std::fmt;

/// The eight kinds of result an operation may complete with.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum StatusKind {
    /// The operation completed successfully.
    Success,
    /// The operation failed.
    Failure,
    /// The operation should be retried. Also returned by the timed wait
    /// functions when the wait expires before completion.
    Retry,
    /// The connection the operation was running on is dead.
    Dead,
    /// The operation timed out.
    Timeout,
    /// The destination host could not be resolved.
    InvalidHost,
    /// A connection to the destination could not be established.
    CantConnect,
    /// A generic error, e.g. the runtime is shutting down.
    Error,
}

impl fmt::Display for StatusKind {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StatusKind::Success => String::from("success").fmt(fmt),
            StatusKind::Failure => String::from("failure").fmt(fmt),
            StatusKind::Retry => String::from("retry").fmt(fmt),
            StatusKind::Dead => String::from("dead").fmt(fmt),
            StatusKind::Timeout => String::from("timeout").fmt(fmt),
            StatusKind::InvalidHost => String::from("invalid-host").fmt(fmt),
            StatusKind::CantConnect => String::from("cant-connect").fmt(fmt),
            StatusKind::Error => String::from("error").fmt(fmt),
        }
    }
}

/// The result of an operation: a status kind plus a transport-specific
/// secondary error code.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub struct OpStatus {
    pub kind: StatusKind,
    pub error_code: i32,
}

impl OpStatus {
    pub const SUCCESS: OpStatus = OpStatus::new(StatusKind::Success);
    pub const FAILURE: OpStatus = OpStatus::new(StatusKind::Failure);
    pub const RETRY: OpStatus = OpStatus::new(StatusKind::Retry);
    pub const DEAD: OpStatus = OpStatus::new(StatusKind::Dead);
    pub const TIMEOUT: OpStatus = OpStatus::new(StatusKind::Timeout);
    pub const INVALID_HOST: OpStatus = OpStatus::new(StatusKind::InvalidHost);
    pub const CANT_CONNECT: OpStatus = OpStatus::new(StatusKind::CantConnect);
    pub const ERROR: OpStatus = OpStatus::new(StatusKind::Error);

    pub const fn new(kind: StatusKind) -> Self {
        OpStatus {
            kind,
            error_code: 0,
        }
    }

    pub const fn with_code(kind: StatusKind, error_code: i32) -> Self {
        OpStatus { kind, error_code }
    }

    pub fn is_success(&self) -> bool {
        self.kind == StatusKind::Success
    }

    /// `Dead` and `Retry` both mean the connection should be abandoned and
    /// the command redelivered elsewhere.
    pub fn is_dead(&self) -> bool {
        self.kind == StatusKind::Dead || self.kind == StatusKind::Retry
    }
}

impl Default for OpStatus {
    fn default() -> Self {
        OpStatus::FAILURE
    }
}

impl From<StatusKind> for OpStatus {
    fn from(kind: StatusKind) -> Self {
        OpStatus::new(kind)
    }
}

impl fmt::Display for OpStatus {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if self.error_code == 0 {
            self.kind.fmt(fmt)
        } else {
            write!(fmt, "{} (code {})", self.kind, self.error_code)
        }
    }
}
