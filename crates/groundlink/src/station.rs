//! The assembled ground station.
//!
//! [`GroundStation`] builds the shared pieces from a [`Config`] and wires
//! them together: the link feeds the store, then the broadcaster, then the
//! recorder when one is enabled.

use std::sync::Arc;

use tracing::info;

use crate::broadcast::{Broadcaster, FrameSink};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::link::{BaudRate, LinkManager, PortOpener, SerialPortOpener};
use crate::parser::FrameParser;
use crate::push::{PushServerHandle, TcpServer, WebSocketServer};
use crate::recorder::Recorder;
use crate::store::StateStore;

/// Shared context for one ground station process.
#[derive(Debug)]
pub struct GroundStation {
    config: Config,
    store: Arc<StateStore>,
    broadcaster: Arc<Broadcaster>,
    recorder: Option<Arc<Recorder>>,
    link: LinkManager,
}

impl GroundStation {
    /// Build a station that talks to real serial ports.
    ///
    /// # Errors
    ///
    /// Returns an error if the recorder is enabled and its log cannot be
    /// opened.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_opener(config, Arc::new(SerialPortOpener))
    }

    /// Build a station that opens ports through `opener`.
    ///
    /// # Errors
    ///
    /// Returns an error if the recorder is enabled and its log cannot be
    /// opened.
    pub fn with_opener(config: Config, opener: Arc<dyn PortOpener>) -> Result<Self> {
        let schema = config.telemetry.schema;
        let store = Arc::new(StateStore::new(schema));
        let broadcaster = Arc::new(Broadcaster::new(config.broadcast.queue_capacity));

        let recorder = if config.recorder.enabled {
            let recorder = Recorder::open(&config.recorder_directory(), config.recorder.launch_number)?;
            Some(Arc::new(recorder))
        } else {
            None
        };

        let mut link = LinkManager::new(
            opener,
            FrameParser::new(schema),
            Arc::clone(&store),
            config.link_settings(),
        )
        .with_sink(Arc::clone(&broadcaster) as Arc<dyn FrameSink>);
        if let Some(recorder) = &recorder {
            link = link.with_sink(Arc::clone(recorder) as Arc<dyn FrameSink>);
        }

        info!(%schema, recording = recorder.is_some(), "ground station ready");
        Ok(Self {
            config,
            store,
            broadcaster,
            recorder,
            link,
        })
    }

    /// The configuration this station was built from.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Latest-frame store.
    #[must_use]
    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Live fan-out hub.
    #[must_use]
    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// The launch log, if recording is enabled.
    #[must_use]
    pub fn recorder(&self) -> Option<&Recorder> {
        self.recorder.as_deref()
    }

    /// The serial link.
    #[must_use]
    pub fn link(&self) -> &LinkManager {
        &self.link
    }

    /// Connect the link to `port` at `baud`.
    ///
    /// # Errors
    ///
    /// Returns an error if the port cannot be opened.
    pub fn connect(&self, port: &str, baud: BaudRate) -> Result<()> {
        self.link.connect(port, baud)
    }

    /// Connect the link to the configured port and baud.
    ///
    /// # Errors
    ///
    /// Returns an error if no port is configured or it cannot be opened.
    pub fn connect_configured(&self) -> Result<()> {
        let port = self
            .config
            .link
            .port
            .as_deref()
            .ok_or_else(|| Error::config_validation("no serial port configured (set link.port or pass --port)"))?;
        self.connect(port, self.config.link.baud)
    }

    /// Disconnect the link. Safe to call at any time.
    pub fn disconnect(&self) {
        self.link.disconnect();
    }

    /// Start every configured push endpoint.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if an endpoint cannot bind; endpoints already started
    /// are shut down first.
    pub async fn spawn_push_servers(&self) -> Result<Vec<PushServerHandle>> {
        let send_timeout = self.config.send_timeout();
        let mut handles = Vec::new();

        if let Some(addr) = self.config.broadcast.websocket_listen {
            let server = WebSocketServer::new(addr, Arc::clone(&self.broadcaster), send_timeout);
            handles.push(server.spawn().await?);
        }

        if let Some(addr) = self.config.broadcast.tcp_listen {
            let server = TcpServer::new(addr, Arc::clone(&self.broadcaster), send_timeout);
            match server.spawn().await {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    for handle in handles {
                        // Already failing; a slow shutdown adds nothing.
                        let _ = handle.shutdown().await;
                    }
                    return Err(err);
                }
            }
        }

        Ok(handles)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::net::SocketAddr;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::link::{LinkState, PortReader};
    use crate::recorder::read_launch_log;
    use crate::telemetry::{Field, Schema, TelemetryFrame};

    /// Serves the same canned bytes on every open.
    struct CannedOpener(&'static str);

    impl PortOpener for CannedOpener {
        fn open(&self, _port: &str, _baud: BaudRate, _timeout: Duration) -> Result<PortReader> {
            Ok(Box::new(Cursor::new(self.0.as_bytes())))
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.link.read_timeout_ms = 10;
        config.link.disconnect_grace_ms = 200;
        config.broadcast.websocket_listen = None;
        config
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_frames_reach_store_subscribers_and_recorder() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.telemetry.schema = Schema::Environmental;
        config.recorder.enabled = true;
        config.recorder.directory = Some(dir.path().to_path_buf());
        config.recorder.launch_number = 5;

        let station = GroundStation::with_opener(
            config,
            Arc::new(CannedOpener("Data:A-100;T-21.5\nA-120;T-21.0\n")),
        )
        .unwrap();
        let mut sub = station.broadcaster().register();

        station.connect("/dev/ttyTEST", BaudRate::B9600).unwrap();
        assert!(wait_for(|| station.store().updates() >= 2));
        station.disconnect();

        assert_eq!(station.store().get().reading.get(Field::Altitude), Some(120.0));
        assert!(sub.try_recv().is_ok());
        assert!(sub.try_recv().is_ok());

        let recorder = station.recorder().unwrap();
        assert!(recorder.path().ends_with("Launch5.jsonl"));
        let frames = read_launch_log(recorder.path()).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].reading.get(Field::Temperature), Some(21.5));
    }

    #[test]
    fn test_unrecognized_line_is_broadcast_but_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.telemetry.schema = Schema::Environmental;
        config.recorder.enabled = true;
        config.recorder.directory = Some(dir.path().to_path_buf());

        let station = GroundStation::with_opener(
            config,
            Arc::new(CannedOpener("garbage!!\nData: A-100\n")),
        )
        .unwrap();
        let mut sub = station.broadcaster().register();

        station.connect("/dev/ttyTEST", BaudRate::B9600).unwrap();
        assert!(wait_for(|| station.store().updates() >= 2));
        station.disconnect();

        assert_eq!(station.link().stats().unrecognized_lines, 1);
        let first: TelemetryFrame = serde_json::from_str(&sub.try_recv().unwrap()).unwrap();
        assert!(first.reading.is_zeroed());
        assert!(sub.try_recv().is_ok());

        let frames = read_launch_log(station.recorder().unwrap().path()).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].reading.get(Field::Altitude), Some(100.0));
    }

    #[test]
    fn test_recorder_disabled_by_default() {
        let station = GroundStation::with_opener(test_config(), Arc::new(CannedOpener(""))).unwrap();
        assert!(station.recorder().is_none());
        assert_eq!(station.store().get().reading.schema(), Schema::Attitude);
    }

    #[test]
    fn test_connect_configured_requires_port() {
        let station = GroundStation::with_opener(test_config(), Arc::new(CannedOpener(""))).unwrap();
        let err = station.connect_configured().unwrap_err();
        assert!(err.is_config_error());
        assert_eq!(station.link().state(), LinkState::Disconnected);
    }

    #[test]
    fn test_connect_configured_uses_config() {
        let mut config = test_config();
        config.link.port = Some("/dev/ttyTEST".to_string());
        let station = GroundStation::with_opener(config, Arc::new(CannedOpener("1,2,3\n"))).unwrap();

        station.connect_configured().unwrap();
        assert!(station.link().is_connected());
        assert!(wait_for(|| station.store().updates() >= 1));
        station.disconnect();
        assert_eq!(station.link().state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_spawn_push_servers() {
        let mut config = test_config();
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        config.broadcast.websocket_listen = Some(any);
        config.broadcast.tcp_listen = Some(any);
        let station = GroundStation::with_opener(config, Arc::new(CannedOpener(""))).unwrap();

        let handles = station.spawn_push_servers().await.unwrap();
        let kinds: Vec<_> = handles.iter().map(PushServerHandle::kind).collect();
        assert_eq!(kinds, ["websocket", "tcp"]);

        for handle in handles {
            assert_ne!(handle.local_addr().port(), 0);
            handle.shutdown().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_spawn_push_servers_bind_failure() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = test_config();
        config.broadcast.websocket_listen = Some("127.0.0.1:0".parse().unwrap());
        config.broadcast.tcp_listen = Some(taken.local_addr().unwrap());
        let station = GroundStation::with_opener(config, Arc::new(CannedOpener(""))).unwrap();

        let err = station.spawn_push_servers().await.unwrap_err();
        assert!(matches!(err, Error::Bind { .. }));
    }
}
