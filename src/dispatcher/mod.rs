//! The request dispatch seam between the routing proxy and the storage nodes.
//!
//! A [`Dispatcher`] delivers one typed [`Request`] to one host and returns
//! its typed [`Response`]. Transport details (framing, sockets, pooling) live
//! behind implementations of this trait; the routing layer itself does
//! per-host fan-out on top of `send`.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt::Display;

use crate::operation::{Request, Response};

pub mod local;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Serialize)]
pub enum Error {
    /// The target host is not reachable through this dispatcher
    UnknownHost { host: String },
    Connection { host: String, reason: String },
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Sends a request to a single host and waits for its response
    async fn send(&self, host: &str, request: Request) -> Result<Response>;
}
