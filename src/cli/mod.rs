//! Command-line surface. All output is machine-readable JSON on stdout;
//! rendering for humans is out of scope.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "tierverify",
    about = "Tiered compliance verification dispatcher",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (TOML). Defaults are used when absent.
    #[arg(long, global = true, default_value = "tierverify.toml")]
    pub config: PathBuf,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the full verification pipeline on a request file and print the
    /// result as JSON.
    Verify {
        /// JSON file with {query, facts, formula}.
        request: PathBuf,
    },
    /// Show the routing decision for a query without running any tier.
    Route {
        query: String,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration as JSON.
    Show,
    /// Write a default configuration file.
    Init,
}
