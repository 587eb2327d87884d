//! Command-line interface for groundlink.
//!
//! This module provides the CLI structure for the `gslink` binary.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{
    ConfigCommand, LinkArgs, ListenCommand, ParseCommand, PortsCommand, ServeCommand,
};

use crate::logging::Verbosity;

/// gslink - CanSat ground station link
///
/// Reads telemetry from the flight computer's serial radio, keeps the latest
/// frame, and streams every frame to connected dashboards.
#[derive(Debug, Parser)]
#[command(name = "gslink")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Connect the link and stream frames to push clients
    Serve(ServeCommand),

    /// Connect the link and print the latest frame at a fixed rate
    Listen(ListenCommand),

    /// Decode a single telemetry line
    Parse(ParseCommand),

    /// List serial ports
    Ports(PortsCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> Verbosity {
        if self.quiet {
            Verbosity::Quiet
        } else {
            match self.verbose {
                0 => Verbosity::Normal,
                1 => Verbosity::Verbose,
                _ => Verbosity::Trace,
            }
        }
    }
}
