//! Diagnostics for the ground station.
//!
//! Everything logs through `tracing`. [`init_logging`] installs a stderr
//! subscriber so stdout stays free for frames printed by `gslink listen
//! --json` and `gslink parse`. The read thread is named, so link events
//! show up tagged `groundlink-read`.

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// How chatty `gslink` is, picked from `-q` / `-v` / `-vv`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Errors only.
    Quiet,
    /// Connects, disconnects, client arrivals.
    #[default]
    Normal,
    /// Link state changes and dropped subscribers.
    Verbose,
    /// Every received line.
    Trace,
}

impl Verbosity {
    /// The most detailed level this verbosity lets through.
    #[must_use]
    pub fn level(self) -> Level {
        match self {
            Self::Quiet => Level::ERROR,
            Self::Normal => Level::INFO,
            Self::Verbose => Level::DEBUG,
            Self::Trace => Level::TRACE,
        }
    }

    /// Filter used when `RUST_LOG` is unset. Dependencies stay at `warn`
    /// unless the station itself is quieter.
    #[must_use]
    pub fn directive(self) -> String {
        let deps = self.level().min(Level::WARN);
        format!("{deps},groundlink={}", self.level())
    }
}

/// Install the stderr subscriber. `RUST_LOG`, when set, replaces the
/// filter derived from `verbosity`. Later calls are no-ops.
pub fn init_logging(verbosity: Verbosity) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.directive()));

    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_names(true)
        .with_file(false)
        .with_line_number(false);

    // A subscriber may already be installed (tests, embedding).
    let _ = tracing_subscriber::registry().with(filter).with(layer).try_init();
}
