//! Command-line front end for tally counters.

mod cli;
pub mod commands;
mod config;

pub use cli::{Cli, Commands, CounterSettings};
pub use config::Config;
