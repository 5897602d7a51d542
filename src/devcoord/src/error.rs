// Copyright (c) 2022 The devcoord authors
//
// SPDX-License-Identifier: Apache-2.0
//

use serde::{Deserialize, Serialize};

/// Errors reported by the device coordinator.
///
/// The type is cloneable and serializable because the same values travel as
/// statuses inside devhost replies and are recorded in suspend reports.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum Error {
    /// Unknown device, devhost, driver or counter.
    #[error("{0} not found")]
    NotFound(String),

    /// Duplicate driver, duplicate device name or exclusive bind conflict.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Operation refused on an immortal device or from a foreign devhost.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Object is in the wrong state for the requested operation.
    #[error("bad state: {0}")]
    BadState(String),

    /// Allocation failure.
    #[error("out of memory")]
    NoMemory,

    /// The devhost did not answer in time.
    #[error("timed out waiting for devhost")]
    Timeout,

    /// The devhost channel is closed or broken.
    #[error("devhost channel error: {0}")]
    ChannelError(String),

    /// Unsupported protocol or binding request.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Malformed request arguments.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// Unparsable driver manifest or binding program.
    #[error("bad driver binding: {0}")]
    BadBinding(String),

    /// Filesystem or process failure.
    #[error("io error: {0}")]
    Io(String),

    #[error("metrics error: {0}")]
    Metrics(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(e.to_string()),
            std::io::ErrorKind::PermissionDenied => Error::AccessDenied(e.to_string()),
            _ => Error::Io(e.to_string()),
        }
    }
}

impl From<prometheus::Error> for Error {
    fn from(e: prometheus::Error) -> Self {
        Error::Metrics(e.to_string())
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Self {
        Error::NoMemory
    }
}

/// Result for coordinator operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of an operation executed by a devhost.
pub type Status = std::result::Result<(), Error>;
