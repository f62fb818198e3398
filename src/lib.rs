pub mod cluster;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod index;
pub mod mapping;
pub mod node;
pub mod operation;
pub mod proxy;
pub mod telemetry;
pub mod utils;

#[cfg(test)]
extern crate quickcheck;
#[cfg(test)]
#[macro_use(quickcheck)]
extern crate quickcheck_macros;
