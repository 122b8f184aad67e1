//! Command-line interface for config-refinery.
//!
//! Provides `run` for a single refinement and `batch` for queue-driven
//! refinement of several configurations.

mod commands;

pub use commands::{parse_cli, read_payload, run, run_with_cli, Cli, Commands};
