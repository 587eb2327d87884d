//! `gslink` - CLI for groundlink
//!
//! This binary connects the ground station's serial link, serves live frames
//! to push clients, and offers a few inspection commands.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use groundlink::cli::{Cli, Command, ConfigCommand, ListenCommand, ParseCommand, ServeCommand};
use groundlink::link::list_ports;
use groundlink::{init_logging, Config, FrameParser, GroundStation, LinkState, Reading, TelemetryFrame};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.verbosity());

    match cli.command {
        Command::Serve(cmd) => handle_serve(load_config(cli.config)?, &cmd),
        Command::Listen(cmd) => handle_listen(load_config(cli.config)?, &cmd),
        Command::Parse(cmd) => handle_parse(&load_config(cli.config)?, &cmd),
        Command::Ports(cmd) => handle_ports(cmd.json),
        Command::Config(cmd) => handle_config(cli.config, cmd),
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    Config::load_from(path).context("failed to load configuration")
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("failed to start async runtime")
}

fn handle_serve(mut config: Config, cmd: &ServeCommand) -> anyhow::Result<()> {
    cmd.apply(&mut config);
    config.validate()?;
    runtime()?.block_on(serve(config))
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let station = GroundStation::new(config)?;
    let handles = station.spawn_push_servers().await?;
    if handles.is_empty() {
        warn!("no push endpoints configured; frames are only stored");
    }

    let connected = station.connect_configured();
    if connected.is_ok() {
        info!("serving; press Ctrl-C to stop");
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl-C")?;
        info!("shutting down");
    }

    for handle in handles {
        if let Err(err) = handle.shutdown().await {
            warn!(error = %err, "push endpoint did not stop cleanly");
        }
    }
    station.disconnect();

    let stats = station.link().stats();
    info!(
        lines = stats.lines_read,
        unrecognized = stats.unrecognized_lines,
        faults = stats.read_faults,
        published = station.broadcaster().published(),
        "session finished"
    );
    connected.context("failed to connect serial link")
}

fn handle_listen(mut config: Config, cmd: &ListenCommand) -> anyhow::Result<()> {
    cmd.link.apply(&mut config);
    config.recorder.enabled = false;
    config.validate()?;

    let station = GroundStation::new(config)?;
    station
        .connect_configured()
        .context("failed to connect serial link")?;

    let result = runtime()?.block_on(watch(&station, cmd));
    station.disconnect();
    result
}

async fn watch(station: &GroundStation, cmd: &ListenCommand) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_secs(1) / cmd.refresh_hz);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut seen = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let LinkState::Error(reason) = station.link().state() {
                    anyhow::bail!("serial link failed: {reason}");
                }
                let updates = station.store().updates();
                if updates != seen {
                    seen = updates;
                    print_frame(&station.store().get(), cmd.json)?;
                }
            }
            _ = &mut ctrl_c => return Ok(()),
        }
    }
}

fn handle_parse(config: &Config, cmd: &ParseCommand) -> anyhow::Result<()> {
    let schema = cmd.schema.unwrap_or(config.telemetry.schema);
    let (reading, format) = FrameParser::new(schema).decode(&cmd.line);

    if cmd.json {
        return print_frame(&TelemetryFrame::new(reading), true);
    }

    match format {
        Some(format) => println!("Format:  {format}"),
        None => println!("Format:  unrecognized (zeroed reading)"),
    }
    println!("Schema:  {schema}");
    for (field, value) in reading.values() {
        println!("  {:<7} {value}", field.key());
    }
    Ok(())
}

fn handle_ports(json: bool) -> anyhow::Result<()> {
    let ports = list_ports()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&ports)?);
    } else if ports.is_empty() {
        println!("No serial ports found.");
    } else {
        for port in ports {
            println!("{port}");
        }
    }
    Ok(())
}

fn handle_config(path: Option<PathBuf>, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            let config = load_config(path)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                print_config(&config);
            }
        }
        ConfigCommand::Path => {
            println!("{}", path.unwrap_or_else(Config::default_config_path).display());
        }
        ConfigCommand::Validate { file } => {
            let path = file.or(path).unwrap_or_else(Config::default_config_path);
            println!("Validating configuration: {}", path.display());
            Config::load_from(Some(path)).context("configuration is invalid")?;
            println!("Configuration is valid.");
        }
    }
    Ok(())
}

fn print_frame(frame: &TelemetryFrame, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", frame.encode()?);
    } else {
        println!(
            "{} {}",
            frame.captured_at.format("%H:%M:%S%.3f"),
            describe(&frame.reading)
        );
    }
    Ok(())
}

fn describe(reading: &Reading) -> String {
    reading
        .values()
        .into_iter()
        .map(|(field, value)| format!("{}={value:.2}", field.key()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn print_config(config: &Config) {
    let show = |addr: Option<std::net::SocketAddr>| {
        addr.map_or_else(|| "disabled".to_string(), |addr| addr.to_string())
    };

    println!("Current Configuration");
    println!("=====================");
    println!();
    println!("[Link]");
    println!(
        "  Port:               {}",
        config.link.port.as_deref().unwrap_or("(not set)")
    );
    println!("  Baud:               {}", config.link.baud);
    println!("  Read timeout (ms):  {}", config.link.read_timeout_ms);
    println!("  Disconnect (ms):    {}", config.link.disconnect_grace_ms);
    println!(
        "  Reconnect:          {} x {} ms",
        config.link.reconnect_attempts, config.link.reconnect_delay_ms
    );
    println!();
    println!("[Telemetry]");
    println!("  Schema:             {}", config.telemetry.schema);
    println!();
    println!("[Broadcast]");
    println!("  WebSocket:          {}", show(config.broadcast.websocket_listen));
    println!("  TCP:                {}", show(config.broadcast.tcp_listen));
    println!("  Queue capacity:     {}", config.broadcast.queue_capacity);
    println!("  Send timeout (ms):  {}", config.broadcast.send_timeout_ms);
    println!();
    println!("[Recorder]");
    println!("  Enabled:            {}", config.recorder.enabled);
    println!("  Directory:          {}", config.recorder_directory().display());
    println!("  Launch number:      {}", config.recorder.launch_number);
}
