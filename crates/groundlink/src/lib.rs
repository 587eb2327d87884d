//! `groundlink` - serial telemetry ingestion and live fan-out for a CanSat
//! ground station.
//!
//! A [`LinkManager`] reads newline-terminated lines from the flight
//! computer's radio, a [`FrameParser`] turns each line into a
//! [`TelemetryFrame`], the [`StateStore`] keeps the most recent one, and the
//! [`Broadcaster`] pushes every frame to connected clients.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod broadcast;
pub mod cli;
pub mod config;
pub mod error;
pub mod link;
pub mod logging;
pub mod parser;
pub mod push;
pub mod recorder;
pub mod station;
pub mod store;
pub mod telemetry;

pub use broadcast::{Broadcaster, FrameSink, PublishReport, SubscriberId, Subscription};
pub use config::Config;
pub use error::{Error, Result};
pub use link::{BaudRate, LinkManager, LinkState, LinkStats, PortOpener, SerialPortOpener};
pub use logging::init_logging;
pub use parser::FrameParser;
pub use push::{PushServerHandle, TcpServer, WebSocketServer};
pub use recorder::Recorder;
pub use station::GroundStation;
pub use store::StateStore;
pub use telemetry::{Reading, Schema, TelemetryFrame};
