//! RTSP session management (RFC 2326 §3, §12.37).
//!
//! A session object is created the moment a client connection is accepted
//! and lives until TEARDOWN, disconnect, or idle timeout. It tracks:
//!
//! - A process-wide unique numeric ID (returned in the `Session` header).
//! - The protocol state machine: `Init -> Ready -> Playing`.
//! - The selected stream path and the negotiated RTP/RTCP sub-sessions.
//! - Activity timestamps the reaper uses to expire idle clients.
//!
//! ## Session lifecycle (RFC 2326 §A.1)
//!
//! ```text
//! accept         -> Init
//! SETUP          -> Ready
//! PLAY           -> Playing
//! PAUSE          -> Ready    (from Playing)
//! TEARDOWN       -> Closed   (from any state)
//! TCP disconnect -> Closed
//! idle timeout   -> Closed   (via the reaper)
//! ```
//!
//! `Recording` is reserved for a future RECORD path and is never entered.

pub mod transport;

use std::collections::HashMap;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::media::rtp::RtpSession;
pub use transport::TransportHeader;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Default idle timeout (RFC 2326 §12.37).
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// How often the reaper scans the table for expired sessions.
const REAP_SCAN_INTERVAL: Duration = Duration::from_secs(10);

/// Cooperative sleep granularity for the reaper worker.
const REAP_POLL_DELAY: Duration = Duration::from_millis(250);

/// RTSP session state machine (RFC 2326 §A.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connection accepted, nothing negotiated yet.
    Init,
    /// Transport negotiated via SETUP; not delivering media.
    Ready,
    /// Media is being delivered (RTP packets sent to client).
    Playing,
    /// Reserved for RECORD; never entered.
    Recording,
    /// Torn down; terminal.
    Closed,
}

/// A single RTSP session (RFC 2326 §3).
///
/// Interior mutability throughout so one `Arc<RtspSession>` can be shared
/// between the connection thread, the encoder pump, the RTCP reporter, and
/// the reaper.
#[derive(Debug)]
pub struct RtspSession {
    id: u64,
    /// Clone of the connection socket; the reaper shuts it down to unblock
    /// the connection thread when expiring a session.
    control: TcpStream,
    peer: SocketAddr,
    state: RwLock<SessionState>,
    authenticated: AtomicBool,
    created: Instant,
    last_activity: Mutex<Instant>,
    /// Stream path selected at SETUP; fan-out matches against it.
    path: RwLock<Option<String>>,
    timeout: Duration,
    /// Video RTP sub-session, present from SETUP until teardown.
    pub rtp: Mutex<Option<RtpSession>>,
    /// Audio RTP sub-session (dormant unless the stream enables audio).
    pub audio_rtp: Mutex<Option<RtpSession>>,
}

impl RtspSession {
    pub fn new(control: TcpStream, peer: SocketAddr, timeout: Duration) -> Self {
        let id = SESSION_COUNTER.fetch_add(1, Ordering::SeqCst);
        let now = Instant::now();
        Self {
            id,
            control,
            peer,
            state: RwLock::new(SessionState::Init),
            authenticated: AtomicBool::new(false),
            created: now,
            last_activity: Mutex::new(now),
            path: RwLock::new(None),
            timeout,
            rtp: Mutex::new(None),
            audio_rtp: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Transition the state machine. `Closed` is terminal: once entered,
    /// further transitions are ignored.
    pub fn set_state(&self, state: SessionState) {
        let mut current = self.state.write();
        if *current == SessionState::Closed {
            return;
        }
        tracing::debug!(
            session_id = self.id,
            old_state = ?*current,
            new_state = ?state,
            "state transition"
        );
        *current = state;
    }

    pub fn is_playing(&self) -> bool {
        *self.state.read() == SessionState::Playing
    }

    pub fn set_authenticated(&self, value: bool) {
        self.authenticated.store(value, Ordering::SeqCst);
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Record client activity; called for every successfully parsed request.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn stream_path(&self) -> Option<String> {
        self.path.read().clone()
    }

    pub fn set_stream_path(&self, path: &str) {
        *self.path.write() = Some(path.to_string());
    }

    /// Format the `Session` response header value per RFC 2326 §12.37.
    ///
    /// Example: `"0000000000000001;timeout=60"`
    pub fn session_header_value(&self) -> String {
        format!("{:016X};timeout={}", self.id, self.timeout.as_secs())
    }

    /// Drop the RTP/RTCP sub-sessions, closing their sockets.
    ///
    /// Used by TEARDOWN, which must keep the control socket alive long
    /// enough to write its response.
    pub fn release_media(&self) {
        self.rtp.lock().take();
        self.audio_rtp.lock().take();
    }

    /// Tear down the session: terminal state, RTP/RTCP sockets dropped,
    /// control socket shut down so a blocked connection thread unblocks.
    pub fn teardown(&self) {
        self.set_state(SessionState::Closed);
        self.release_media();
        let _ = self.control.shutdown(Shutdown::Both);
        tracing::debug!(session_id = self.id, peer = %self.peer, "session torn down");
    }
}

/// Thread-safe table of active sessions, keyed by session ID.
///
/// Backed by `parking_lot::RwLock` for fast concurrent reads: the encoder
/// pump and RTCP reporter walk the table every cycle, while inserts and
/// removals are rare.
#[derive(Clone)]
pub struct SessionTable {
    sessions: Arc<RwLock<HashMap<u64, Arc<RtspSession>>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a freshly accepted session.
    pub fn insert(&self, session: Arc<RtspSession>) {
        let mut sessions = self.sessions.write();
        sessions.insert(session.id(), session.clone());
        tracing::debug!(
            session_id = session.id(),
            peer = %session.peer(),
            total_sessions = sessions.len(),
            "session created"
        );
    }

    pub fn get(&self, id: u64) -> Option<Arc<RtspSession>> {
        self.sessions.read().get(&id).cloned()
    }

    /// Unlink a session from the table (used by TEARDOWN and disconnect).
    /// The caller is responsible for tearing the session down afterwards.
    pub fn remove(&self, id: u64) -> Option<Arc<RtspSession>> {
        let removed = self.sessions.write().remove(&id);
        if removed.is_some() {
            let total = self.sessions.read().len();
            tracing::debug!(session_id = id, total_sessions = total, "session removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// All current sessions; the fan-out and reporting paths iterate this.
    pub fn snapshot(&self) -> Vec<Arc<RtspSession>> {
        self.sessions.read().values().cloned().collect()
    }

    /// Sessions in `Playing` state whose selected path matches.
    pub fn playing_on(&self, path: &str) -> Vec<Arc<RtspSession>> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.is_playing() && s.stream_path().as_deref() == Some(path))
            .cloned()
            .collect()
    }

    /// Expire sessions idle longer than `timeout`.
    ///
    /// Each expired session is torn down first and unlinked after. Teardown
    /// sets `Closed` and takes the media locks, and the fan-out path
    /// re-checks state under those locks, so once a session leaves the
    /// table no packet can reach it. Returns the number of sessions reaped.
    pub fn reap_idle(&self, timeout: Duration) -> usize {
        let expired: Vec<Arc<RtspSession>> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.idle_for() > timeout)
            .cloned()
            .collect();

        for session in &expired {
            tracing::info!(
                session_id = session.id(),
                peer = %session.peer(),
                idle_secs = session.idle_for().as_secs(),
                "session timed out"
            );
            session.teardown();
            self.remove(session.id());
        }

        expired.len()
    }

    /// Tear down and remove every session (server shutdown).
    pub fn teardown_all(&self) {
        let drained: Vec<Arc<RtspSession>> = {
            let mut sessions = self.sessions.write();
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in &drained {
            session.teardown();
        }
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "all sessions torn down");
        }
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Timeout reaper worker: scans the table every [`REAP_SCAN_INTERVAL`] and
/// expires sessions idle longer than `timeout`. Exits when the running flag
/// clears.
pub fn reaper_loop(sessions: SessionTable, running: Arc<AtomicBool>, timeout: Duration) {
    tracing::debug!(timeout_secs = timeout.as_secs(), "session reaper started");

    let mut last_scan = Instant::now();
    while running.load(Ordering::SeqCst) {
        if last_scan.elapsed() >= REAP_SCAN_INTERVAL {
            last_scan = Instant::now();
            let reaped = sessions.reap_idle(timeout);
            if reaped > 0 {
                tracing::info!(reaped, remaining = sessions.len(), "idle sessions reaped");
            }
        }
        thread::sleep(REAP_POLL_DELAY);
    }

    tracing::debug!("session reaper exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn test_session(timeout: Duration) -> Arc<RtspSession> {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let _server_side = listener.accept().unwrap();
        Arc::new(RtspSession::new(client, addr, timeout))
    }

    #[test]
    fn ids_are_unique_and_increasing() {
        let a = test_session(DEFAULT_SESSION_TIMEOUT);
        let b = test_session(DEFAULT_SESSION_TIMEOUT);
        assert!(b.id() > a.id());
    }

    #[test]
    fn state_machine_walk() {
        let s = test_session(DEFAULT_SESSION_TIMEOUT);
        assert_eq!(s.state(), SessionState::Init);

        s.set_state(SessionState::Ready);
        assert_eq!(s.state(), SessionState::Ready);

        s.set_state(SessionState::Playing);
        assert!(s.is_playing());

        s.set_state(SessionState::Ready); // PAUSE
        assert!(!s.is_playing());
    }

    #[test]
    fn closed_is_terminal() {
        let s = test_session(DEFAULT_SESSION_TIMEOUT);
        s.set_state(SessionState::Closed);
        s.set_state(SessionState::Playing);
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[test]
    fn session_header_format() {
        let s = test_session(Duration::from_secs(60));
        let value = s.session_header_value();
        assert!(value.ends_with(";timeout=60"));
        assert_eq!(value.split(';').next().unwrap().len(), 16);
    }

    #[test]
    fn table_insert_get_remove() {
        let table = SessionTable::new();
        let s = test_session(DEFAULT_SESSION_TIMEOUT);
        let id = s.id();

        table.insert(s);
        assert_eq!(table.len(), 1);
        assert!(table.get(id).is_some());

        assert!(table.remove(id).is_some());
        assert!(table.remove(id).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn playing_on_filters_state_and_path() {
        let table = SessionTable::new();

        let playing = test_session(DEFAULT_SESSION_TIMEOUT);
        playing.set_stream_path("/vs0");
        playing.set_state(SessionState::Playing);
        table.insert(playing);

        let ready = test_session(DEFAULT_SESSION_TIMEOUT);
        ready.set_stream_path("/vs0");
        ready.set_state(SessionState::Ready);
        table.insert(ready);

        let other_path = test_session(DEFAULT_SESSION_TIMEOUT);
        other_path.set_stream_path("/vs1");
        other_path.set_state(SessionState::Playing);
        table.insert(other_path);

        assert_eq!(table.playing_on("/vs0").len(), 1);
        assert_eq!(table.playing_on("/vs1").len(), 1);
        assert!(table.playing_on("/vs2").is_empty());
    }

    #[test]
    fn reap_removes_only_idle_sessions() {
        let table = SessionTable::new();

        let idle = test_session(DEFAULT_SESSION_TIMEOUT);
        let idle_id = idle.id();
        table.insert(idle);

        let active = test_session(DEFAULT_SESSION_TIMEOUT);
        let active_id = active.id();
        table.insert(active.clone());

        std::thread::sleep(Duration::from_millis(30));
        active.touch();

        let reaped = table.reap_idle(Duration::from_millis(20));
        assert_eq!(reaped, 1);
        assert!(table.get(idle_id).is_none());
        assert!(table.get(active_id).is_some());
        assert_eq!(table.get(active_id).unwrap().state(), SessionState::Init);
    }

    #[test]
    fn reaped_session_is_closed() {
        let table = SessionTable::new();
        let s = test_session(DEFAULT_SESSION_TIMEOUT);
        let s_ref = s.clone();
        table.insert(s);

        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(table.reap_idle(Duration::from_millis(1)), 1);
        assert_eq!(s_ref.state(), SessionState::Closed);
        assert!(s_ref.rtp.lock().is_none());
    }

    #[test]
    fn teardown_all_drains_table() {
        let table = SessionTable::new();
        let a = test_session(DEFAULT_SESSION_TIMEOUT);
        let b = test_session(DEFAULT_SESSION_TIMEOUT);
        let a_ref = a.clone();
        table.insert(a);
        table.insert(b);

        table.teardown_all();
        assert!(table.is_empty());
        assert_eq!(a_ref.state(), SessionState::Closed);
    }
}
