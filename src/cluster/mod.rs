//! Module that keeps the cluster view: the authoritative key space mapping,
//! the set of live hosts and the mapping version counter, all held in an
//! external coordination substrate and cached locally behind a watch.

pub mod coordinator;
pub mod error;
pub mod substrate;
