use std::fmt::Display;

use serde::Serialize;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Serialize)]
pub enum Error {
    /// The coordination substrate could not be reached
    Unavailable { reason: String },
    /// The coordinator is not connected to the substrate
    NotConnected,
    /// `connect` was called twice
    AlreadyConnected,
    /// No mapping has been published yet (the cluster was never bootstrapped)
    MappingNotInitialized,
    Mapping(crate::mapping::Error),
    Logic { reason: String },
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

impl From<crate::mapping::Error> for Error {
    fn from(err: crate::mapping::Error) -> Self {
        Self::Mapping(err)
    }
}
