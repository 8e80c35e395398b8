//! CLI command implementations.

pub mod config;
pub mod simulate;

pub use config::{check_config, load_config, print_default_config};
pub use simulate::{simulate, SimulateOptions};
