//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Subcommand};

use crate::config::Config;
use crate::link::BaudRate;
use crate::telemetry::Schema;

fn parse_baud(value: &str) -> Result<BaudRate, String> {
    value.parse().map_err(|_| {
        let supported: Vec<String> = BaudRate::ALL.iter().map(ToString::to_string).collect();
        format!("expected one of {}", supported.join(", "))
    })
}

fn parse_schema(value: &str) -> Result<Schema, String> {
    value
        .parse()
        .map_err(|_| "expected `attitude` or `environmental`".to_string())
}

/// Serial link overrides shared by commands that open the port.
#[derive(Debug, Clone, Default, Args)]
pub struct LinkArgs {
    /// Serial port to open (overrides link.port)
    #[arg(short, long)]
    pub port: Option<String>,

    /// Baud rate (overrides link.baud)
    #[arg(short, long, value_parser = parse_baud)]
    pub baud: Option<BaudRate>,

    /// Telemetry field layout (overrides telemetry.schema)
    #[arg(short, long, value_parser = parse_schema)]
    pub schema: Option<Schema>,
}

impl LinkArgs {
    /// Fold the overrides into `config`.
    pub fn apply(&self, config: &mut Config) {
        if let Some(port) = &self.port {
            config.link.port = Some(port.clone());
        }
        if let Some(baud) = self.baud {
            config.link.baud = baud;
        }
        if let Some(schema) = self.schema {
            config.telemetry.schema = schema;
        }
    }
}

/// Serve command arguments.
#[derive(Debug, Args)]
pub struct ServeCommand {
    /// Serial link overrides.
    #[command(flatten)]
    pub link: LinkArgs,

    /// WebSocket listen address (overrides broadcast.websocket_listen)
    #[arg(long, value_name = "ADDR")]
    pub websocket: Option<SocketAddr>,

    /// Newline-delimited TCP listen address (overrides broadcast.tcp_listen)
    #[arg(long, value_name = "ADDR")]
    pub tcp: Option<SocketAddr>,

    /// Record frames to the launch log
    #[arg(short, long)]
    pub record: bool,

    /// Launch number for the launch log (implies --record)
    #[arg(short, long, value_name = "N")]
    pub launch: Option<u32>,
}

impl ServeCommand {
    /// Fold the overrides into `config`.
    pub fn apply(&self, config: &mut Config) {
        self.link.apply(config);
        if let Some(addr) = self.websocket {
            config.broadcast.websocket_listen = Some(addr);
        }
        if let Some(addr) = self.tcp {
            config.broadcast.tcp_listen = Some(addr);
        }
        if self.record || self.launch.is_some() {
            config.recorder.enabled = true;
        }
        if let Some(launch) = self.launch {
            config.recorder.launch_number = launch;
        }
    }
}

/// Listen command arguments.
#[derive(Debug, Args)]
pub struct ListenCommand {
    /// Serial link overrides.
    #[command(flatten)]
    pub link: LinkArgs,

    /// Snapshots printed per second
    #[arg(short, long, default_value = "10", value_parser = clap::value_parser!(u32).range(1..=100))]
    pub refresh_hz: u32,

    /// Print each snapshot as a JSON line
    #[arg(short, long)]
    pub json: bool,
}

/// Parse command arguments.
#[derive(Debug, Args)]
pub struct ParseCommand {
    /// The raw telemetry line
    pub line: String,

    /// Telemetry field layout (overrides telemetry.schema)
    #[arg(short, long, value_parser = parse_schema)]
    pub schema: Option<Schema>,

    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Ports command arguments.
#[derive(Debug, Args)]
pub struct PortsCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}
