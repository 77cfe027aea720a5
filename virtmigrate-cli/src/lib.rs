//! virtmigrate CLI
//!
//! Argument surface, config file layering, logging and command output for
//! the `virtmigrate` binary.

pub mod cli;
pub mod commands;
pub mod config;
pub mod logging;
pub mod symbols;

pub use cli::{Cli, Commands, MigrationArgs};
