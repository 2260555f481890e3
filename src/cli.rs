//! Command line interface of the provisioner, built on clap.
//!
//! [`Cli`] carries the subcommands in [`Command`] plus global flags
//! (--config, --state, --backend, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Request, watch and tear down virtual infrastructures.
#[derive(Debug, Parser)]
#[command(name = "provisioner", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the TOML configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to the JSON state file; overrides `state_file` from the config.
    #[arg(long, global = true)]
    pub state: Option<PathBuf>,

    /// Where resources come from.
    #[arg(long, global = true, value_enum, default_value_t = BackendArg::Mock)]
    pub backend: BackendArg,

    /// Enable debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendArg {
    /// Synthesize addresses without touching the slot pool.
    Mock,
    /// Claim slots from the pool for every request.
    Pool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Submit a request and follow it until it finishes.
    Submit {
        /// Display name of the service.
        name: String,

        /// Template identifier (see `templates`).
        #[arg(long, short, default_value = "single")]
        template: String,

        /// Extra input as a JSON object, stored with the request.
        #[arg(long)]
        input: Option<String>,
    },

    /// List requests, newest first.
    List,

    /// Print one request as JSON.
    Show { id: u64 },

    /// Release a request's slots and delete it.
    Delete { id: u64 },

    /// Show the slot pool.
    Pool,

    /// Show the template catalog.
    Templates,

    /// Run an end-to-end walkthrough on a throwaway pool.
    Demo,
}
