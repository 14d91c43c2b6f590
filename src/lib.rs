// ABOUTME: Library root for database-rollup
// ABOUTME: Incremental maintenance of aggregate tables from a PostgreSQL change log

pub mod commands;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod postgres;
pub mod rollup;
pub mod utils;

pub use config::RollupConfig;
pub use error::{Result, RollupError};
pub use rollup::{Rollup, RunResult};
