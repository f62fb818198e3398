//! Module that contains the typed requests and responses exchanged between
//! the routing proxy and the storage nodes.
//!
//! # Design principals
//! These types describe operation shapes only. How they travel (transport,
//! framing, byte encoding) is the dispatcher's concern; nothing here knows
//! about sockets.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, FromRepr};

use crate::mapping::Key;
use crate::utils::serde_hex_bytes;

/// Operation codes, stable across releases since they identify request
/// payloads on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum OpCode {
    Create = 1,
    Put = 2,
    Get = 3,
    Delete = 4,
    Contains = 5,
    GetRange = 6,
    GetKnn = 7,
    GetBatch = 8,
}

/// One key/value pair of the index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub key: Key,
    #[serde(with = "serde_hex_bytes")]
    pub value: Bytes,
}

impl IndexEntry {
    pub fn new(key: Key, value: Bytes) -> Self {
        Self { key, value }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Create {
        dim: usize,
        depth: u32,
    },
    Put {
        key: Key,
        #[serde(with = "serde_hex_bytes")]
        value: Bytes,
    },
    Get {
        key: Key,
    },
    Delete {
        key: Key,
    },
    Contains {
        key: Key,
    },
    GetRange {
        start: Key,
        end: Key,
        /// When set, entries farther than this from the range center are
        /// filtered out server-side
        distance: Option<f64>,
    },
    GetKnn {
        key: Key,
        k: usize,
    },
    GetBatch {
        /// Empty token starts a fresh scan on the target host
        iterator: String,
        size: usize,
        range: Option<(Key, Key)>,
    },
}

impl Request {
    pub fn op_code(&self) -> OpCode {
        match self {
            Request::Create { .. } => OpCode::Create,
            Request::Put { .. } => OpCode::Put,
            Request::Get { .. } => OpCode::Get,
            Request::Delete { .. } => OpCode::Delete,
            Request::Contains { .. } => OpCode::Contains,
            Request::GetRange { .. } => OpCode::GetRange,
            Request::GetKnn { .. } => OpCode::GetKnn,
            Request::GetBatch { .. } => OpCode::GetBatch,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpStatus {
    Success,
    Failure { reason: String },
}

impl OpStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, OpStatus::Success)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Status {
        status: OpStatus,
    },
    /// Single-entry answer (Get, and the previous value of Put/Delete)
    Entry {
        entry: Option<IndexEntry>,
    },
    Entries {
        entries: Vec<IndexEntry>,
    },
    Contains {
        found: bool,
    },
    Batch {
        entries: Vec<IndexEntry>,
        /// Non-empty when the host has more data for this scan
        iterator: String,
    },
}

impl Response {
    pub fn failure(reason: String) -> Self {
        Response::Status {
            status: OpStatus::Failure { reason },
        }
    }

    /// The failure reason, if this response carries one
    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            Response::Status {
                status: OpStatus::Failure { reason },
            } => Some(reason),
            _ => None,
        }
    }
}
