//! Engine infrastructure: configuration, constants and logging

pub mod config;
pub mod constants;
pub mod logging;

pub use config::{EngineConfig, LoaderConfig, PostgresConfig};
pub use logging::init_logging;
