//! Proctor worker: sandboxed format/build/test checks for submitted code.

pub mod config;
pub mod context;
pub mod docker;
pub mod engine;
pub mod error;
pub mod executor;
pub mod languages;
pub mod parsers;
pub mod pool;
pub mod risk;
pub mod runs;
pub mod workspace;

#[cfg(test)]
mod testing;

pub use context::ExecContext;
pub use error::ExecError;
pub use executor::Orchestrator;
pub use pool::{PoolConfig, WorkerPool};
