// Copyright 2020 Joyent, Inc.

use std::error::Error as StdError;
use std::fmt;
use std::io::Error as IOError;

/// Errors returned by the runtime's API. Failures of the remote work itself
/// are never reported through this type; they are delivered as an
/// [`OpStatus`](../status/struct.OpStatus.html) when the operation completes.
#[derive(Debug)]
pub enum Error {
    /// A queue-only function was called on a single operation.
    NotAQueue,
    /// A child was added to a queue that has been freed.
    QueueFreed,
    /// An operation without a command descriptor was handed to a portal.
    MissingCommand,
    /// `shutdown` was invoked on a clone of the portal context.
    ShutdownCalledByClone,
    /// The portal context has been shut down.
    ContextShutDown,
    /// A host connection thread could not be spawned.
    SpawnFailure(IOError),
    IOError(IOError),
}

impl From<IOError> for Error {
    fn from(error: IOError) -> Self {
        Error::IOError(error)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::NotAQueue => {
                String::from("operation is not a queue").fmt(fmt)
            }
            Error::QueueFreed => {
                String::from("queue has been freed").fmt(fmt)
            }
            Error::MissingCommand => {
                String::from("operation has no command descriptor").fmt(fmt)
            }
            Error::ShutdownCalledByClone => String::from(
                "shutdown may only be called by the original portal context",
            )
            .fmt(fmt),
            Error::ContextShutDown => {
                String::from("portal context is shut down").fmt(fmt)
            }
            Error::SpawnFailure(err) => {
                write!(fmt, "failed to spawn connection thread: {}", err)
            }
            Error::IOError(err) => err.fmt(fmt),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::SpawnFailure(err) => Some(err),
            Error::IOError(err) => Some(err),
            _ => None,
        }
    }
}
