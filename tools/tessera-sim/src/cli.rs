//! Command-line interface definitions for tessera-sim.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Drive the PCI enable engine over a simulated bus.
#[derive(Parser)]
#[command(name = "tessera-sim", version, about)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Only log errors.
    #[arg(long, short = 'q', global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log reference count transitions, capability discovery and MSI
    /// quiescing.
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Print the devices, their parents and their resources.
    Show(TopologyArgs),
    /// Execute the `[[step]]` entries and print the resulting state.
    Run(TopologyArgs),
}

/// Arguments shared by every subcommand.
#[derive(Parser)]
pub struct TopologyArgs {
    /// Topology description (TOML).
    pub topology: PathBuf,
}
