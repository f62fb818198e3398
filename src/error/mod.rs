//! This module defines the client/user visible errors that can be returned by zdix.

use std::fmt::Display;

use serde::Serialize;

pub type Result<T> = std::result::Result<T, Error>;

/// One failed target of a fan-out operation
#[derive(Debug, Clone, Serialize)]
pub struct HostFailure {
    pub host: String,
    pub reason: String,
}

/// Error enum with all possible variants
#[derive(Debug, Serialize)]
pub enum Error {
    /// The mapping contains no hosts - routing is impossible
    EmptyMapping,
    /// The mapping is mid-rebalance. The caller must retry after a new
    /// mapping has been installed; zdix never retries internally.
    InconsistentMapping,
    /// An iterator was driven past its end
    Exhausted,
    /// A fan-out where one or more target hosts responded with non-success
    PartialFailure {
        operation: String,
        failures: Vec<HostFailure>,
    },
    /// The coordination substrate could not be reached
    CoordinationUnavailable {
        reason: String,
    },
    /// A remote host answered an operation with a failure status
    Remote {
        host: String,
        reason: String,
    },
    /// A remote host answered with a response shape the operation did not expect
    UnexpectedResponse {
        host: String,
        reason: String,
    },
    /// A second rebalance was started while one was already running on this node
    BalancingInProgress,
    InvalidConfig {
        reason: String,
    },
    Mapping(crate::mapping::Error),
    Cluster(crate::cluster::error::Error),
    Index(crate::index::Error),
    Dispatch(crate::dispatcher::Error),
    Io {
        reason: String,
    },
    Internal {
        reason: String,
    },
}

impl Error {
    /// Returns true if this is an instance of a [`Error::InconsistentMapping`] variant
    pub fn is_inconsistent_mapping(&self) -> bool {
        matches!(self, Error::InconsistentMapping)
    }

    /// Returns true if this is an instance of a [`Error::Exhausted`] variant
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Error::Exhausted)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            reason: err.to_string(),
        }
    }
}

impl From<crate::mapping::Error> for Error {
    fn from(err: crate::mapping::Error) -> Self {
        match err {
            crate::mapping::Error::Empty => Self::EmptyMapping,
            crate::mapping::Error::Inconsistent => Self::InconsistentMapping,
            _ => Self::Mapping(err),
        }
    }
}

impl From<crate::cluster::error::Error> for Error {
    fn from(err: crate::cluster::error::Error) -> Self {
        match err {
            crate::cluster::error::Error::Unavailable { reason } => {
                Self::CoordinationUnavailable { reason }
            }
            _ => Self::Cluster(err),
        }
    }
}

impl From<crate::index::Error> for Error {
    fn from(err: crate::index::Error) -> Self {
        Self::Index(err)
    }
}

impl From<crate::dispatcher::Error> for Error {
    fn from(err: crate::dispatcher::Error) -> Self {
        Self::Dispatch(err)
    }
}
