use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::encoder::{CaptureHandle, EncoderDriver};
use crate::error::{Result, RtspError};
use crate::media::rtcp;
use crate::protocol::RtspRequest;
use crate::pump;
use crate::registry::{StreamConfig, StreamId, StreamRegistry, StreamStats, TotalStats};
use crate::session::{self, SessionTable, DEFAULT_SESSION_TIMEOUT};
use crate::transport::tcp;

/// Pass/fail authentication hook, supplied by the management layer.
///
/// Called once per session on the first non-OPTIONS request; the verdict
/// is latched into the session.
pub type Authenticator = Arc<dyn Fn(&RtspRequest) -> bool + Send + Sync>;

/// Server-level configuration used by protocol handlers.
#[derive(Clone)]
pub struct ServerConfig {
    /// Public host advertised in SDP `o=` and `c=` lines.
    /// When `None`, host is inferred from request URI/client address.
    pub public_host: Option<String>,
    /// SDP origin username field (`o=<username> ...`).
    pub sdp_username: String,
    /// SDP origin session id field (`o=... <session-id> ...`).
    pub sdp_session_id: String,
    /// SDP origin session version field (`o=... ... <session-version> ...`).
    pub sdp_session_version: String,
    /// Idle time after which the reaper expires a session.
    pub session_timeout: Duration,
    /// Optional authentication hook; `None` admits every client.
    pub authenticator: Option<Authenticator>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            public_host: None,
            sdp_username: "-".to_string(),
            sdp_session_id: "0".to_string(),
            sdp_session_version: "0".to_string(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            authenticator: None,
        }
    }
}

/// Server lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Listening,
    Stopped,
}

/// Point-in-time server counters for the management layer.
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub active_sessions: usize,
    pub totals: TotalStats,
}

/// High-level RTSP server orchestrator.
///
/// Owns the stream registry and session table and runs five workers while
/// listening: the TCP accept loop, the video and audio encoder pumps, the
/// RTCP reporter, and the session reaper. All workers poll one shared
/// running flag and are joined by [`stop`](Self::stop).
pub struct Server {
    bind_addr: String,
    bound_addr: Option<SocketAddr>,
    config: Arc<ServerConfig>,
    registry: Arc<StreamRegistry>,
    sessions: SessionTable,
    running: Arc<AtomicBool>,
    state: ServerState,
    workers: Vec<JoinHandle<()>>,
}

impl Server {
    pub fn new(bind_addr: &str, driver: Arc<dyn EncoderDriver>, capture: CaptureHandle) -> Self {
        Self::with_config(bind_addr, driver, capture, ServerConfig::default())
    }

    /// Create a server with custom protocol/SDP configuration.
    pub fn with_config(
        bind_addr: &str,
        driver: Arc<dyn EncoderDriver>,
        capture: CaptureHandle,
        config: ServerConfig,
    ) -> Self {
        Self {
            bind_addr: bind_addr.to_string(),
            bound_addr: None,
            config: Arc::new(config),
            registry: Arc::new(StreamRegistry::new(driver, capture)),
            sessions: SessionTable::new(),
            running: Arc::new(AtomicBool::new(false)),
            state: ServerState::Created,
            workers: Vec::new(),
        }
    }

    /// Register a stream; allowed before or while listening.
    pub fn register_stream(&self, config: StreamConfig) -> Result<StreamId> {
        self.registry.register(config)
    }

    pub fn unregister_stream(&self, id: StreamId) {
        self.registry.unregister(id);
    }

    pub fn stream_stats(&self, path: &str) -> Option<StreamStats> {
        self.registry.stats(path)
    }

    pub fn total_stats(&self) -> TotalStats {
        self.registry.total_stats()
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            active_sessions: self.sessions.len(),
            totals: self.registry.total_stats(),
        }
    }

    /// Bind the control port and spawn the workers.
    ///
    /// On bind failure the server stays in `Created` and can be started
    /// again.
    pub fn start(&mut self) -> Result<()> {
        if self.state != ServerState::Created {
            return Err(RtspError::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.bind_addr)?;
        listener.set_nonblocking(true)?;
        self.bound_addr = Some(listener.local_addr()?);

        self.running.store(true, Ordering::SeqCst);
        self.state = ServerState::Listening;

        tracing::info!(addr = %self.bind_addr, "RTSP server listening");

        {
            let sessions = self.sessions.clone();
            let registry = self.registry.clone();
            let config = self.config.clone();
            let running = self.running.clone();
            self.workers.push(thread::spawn(move || {
                tcp::accept_loop(listener, sessions, registry, config, running);
            }));
        }
        {
            let registry = self.registry.clone();
            let sessions = self.sessions.clone();
            let running = self.running.clone();
            self.workers.push(thread::spawn(move || {
                pump::video_pump_loop(registry, sessions, running);
            }));
        }
        {
            let registry = self.registry.clone();
            let sessions = self.sessions.clone();
            let running = self.running.clone();
            self.workers.push(thread::spawn(move || {
                pump::audio_pump_loop(registry, sessions, running);
            }));
        }
        {
            let sessions = self.sessions.clone();
            let running = self.running.clone();
            self.workers.push(thread::spawn(move || {
                rtcp::reporter_loop(sessions, running);
            }));
        }
        {
            let sessions = self.sessions.clone();
            let running = self.running.clone();
            let timeout = self.config.session_timeout;
            self.workers.push(thread::spawn(move || {
                session::reaper_loop(sessions, running, timeout);
            }));
        }

        Ok(())
    }

    /// Stop the server: clear the running flag, join every worker, and
    /// tear down all sessions. Safe to call while the pumps are mid-cycle.
    pub fn stop(&mut self) {
        if self.state != ServerState::Listening {
            return;
        }

        tracing::info!("server stopping");
        self.running.store(false, Ordering::SeqCst);

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }

        self.sessions.teardown_all();
        self.state = ServerState::Stopped;
        tracing::info!("server stopped");
    }

    /// Release every stream's encoder resources. Requires a stopped server
    /// so no pump can touch a handle being released.
    pub fn destroy(&mut self) -> Result<()> {
        if self.state == ServerState::Listening {
            return Err(RtspError::NotStopped);
        }
        self.registry.clear();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Actual bound control address, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound_addr
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    pub fn config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::testing::ScriptedDriver;
    use crate::registry::VideoParams;

    fn test_server() -> Server {
        Server::new("127.0.0.1:0", ScriptedDriver::new(), CaptureHandle(0))
    }

    #[test]
    fn lifecycle_created_listening_stopped() {
        let mut server = test_server();
        assert_eq!(server.state(), ServerState::Created);
        assert!(!server.is_running());

        server.start().unwrap();
        assert_eq!(server.state(), ServerState::Listening);
        assert!(server.is_running());
        assert!(server.local_addr().is_some());

        server.stop();
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(!server.is_running());
    }

    #[test]
    fn double_start_is_rejected() {
        let mut server = test_server();
        server.start().unwrap();
        assert!(matches!(server.start(), Err(RtspError::AlreadyRunning)));
        server.stop();
    }

    #[test]
    fn destroy_requires_not_listening() {
        let mut server = test_server();
        server
            .register_stream(StreamConfig::new("/vs0", "main", VideoParams::default()))
            .unwrap();
        server.start().unwrap();

        assert!(matches!(server.destroy(), Err(RtspError::NotStopped)));

        server.stop();
        server.destroy().unwrap();
        assert!(server.registry().is_empty());
    }

    #[test]
    fn stop_while_pump_running_does_not_deadlock() {
        let mut server = test_server();
        server
            .register_stream(StreamConfig::new("/vs0", "main", VideoParams::default()))
            .unwrap();
        server.start().unwrap();

        // give the pumps a few cycles against an empty driver queue
        std::thread::sleep(Duration::from_millis(50));
        server.stop();
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(server.sessions().is_empty());
    }

    #[test]
    fn stats_surface() {
        let server = test_server();
        server
            .register_stream(StreamConfig::new("/vs0", "main", VideoParams::default()))
            .unwrap();
        let stats = server.stats();
        assert_eq!(stats.active_sessions, 0);
        assert_eq!(stats.totals.streams, 1);
    }
}
