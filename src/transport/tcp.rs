use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::protocol::{MethodHandler, RtspRequest};
use crate::registry::StreamRegistry;
use crate::server::ServerConfig;
use crate::session::{RtspSession, SessionState, SessionTable};

/// Non-blocking TCP accept loop.
///
/// Checks the `running` flag between accepts with a 50 ms poll interval so
/// that [`crate::server::Server::stop`] can terminate it promptly. Each
/// accepted connection gets a session in `Init` state and its own thread.
pub fn accept_loop(
    listener: TcpListener,
    sessions: SessionTable,
    registry: Arc<StreamRegistry>,
    config: Arc<ServerConfig>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let s = sessions.clone();
                let reg = registry.clone();
                let c = config.clone();
                let r = running.clone();
                thread::spawn(move || {
                    Connection::handle(stream, s, reg, c, r);
                });
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}

/// A single RTSP client connection with its own lifecycle.
struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    handler: MethodHandler,
    session: Arc<RtspSession>,
    peer_addr: SocketAddr,
}

impl Connection {
    /// Entry point: create the connection's session and run its request
    /// loop until disconnect, TEARDOWN, or shutdown.
    pub fn handle(
        stream: TcpStream,
        sessions: SessionTable,
        registry: Arc<StreamRegistry>,
        config: Arc<ServerConfig>,
        running: Arc<AtomicBool>,
    ) {
        let peer_addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(_) => return,
        };

        tracing::info!(%peer_addr, "client connected");

        // One clone feeds the reader, one is held by the session so the
        // reaper can shut it down to unblock this thread.
        let reader_stream = match stream.try_clone() {
            Ok(s) => s,
            Err(_) => return,
        };
        let control = match stream.try_clone() {
            Ok(s) => s,
            Err(_) => return,
        };

        let session = Arc::new(RtspSession::new(control, peer_addr, config.session_timeout));
        sessions.insert(session.clone());

        let handler = MethodHandler::new(
            session.clone(),
            sessions.clone(),
            registry,
            config,
            peer_addr,
        );

        let mut conn = Connection {
            reader: BufReader::new(reader_stream),
            writer: stream,
            handler,
            session,
            peer_addr,
        };

        let reason = conn.run(&running);
        conn.cleanup(&sessions);

        tracing::info!(%peer_addr, reason, "client disconnected");
    }

    /// RTSP request/response loop. Returns the reason for exiting.
    fn run(&mut self, running: &Arc<AtomicBool>) -> &'static str {
        while running.load(Ordering::SeqCst) {
            let mut request_text = String::new();
            loop {
                let mut line = String::new();
                match self.reader.read_line(&mut line) {
                    Ok(0) => return "connection closed by client",
                    Ok(_) => {
                        request_text.push_str(&line);
                        if line == "\r\n" || line == "\n" {
                            break;
                        }
                    }
                    Err(_) => return "read error",
                }
            }

            if request_text.trim().is_empty() {
                continue;
            }

            match RtspRequest::parse(&request_text) {
                Ok(request) => {
                    tracing::debug!(
                        peer = %self.peer_addr,
                        method = ?request.method,
                        uri = %request.uri,
                        version = %request.version,
                        "request"
                    );

                    let response = self.handler.handle(&request);

                    tracing::debug!(
                        peer = %self.peer_addr,
                        status = response.status_code,
                        "response"
                    );

                    if self
                        .writer
                        .write_all(response.serialize().as_bytes())
                        .is_err()
                    {
                        return "write error";
                    }

                    if self.session.state() == SessionState::Closed {
                        return "session torn down";
                    }
                }
                Err(e) => {
                    tracing::warn!(peer = %self.peer_addr, error = %e, "parse error");
                }
            }
        }

        "server shutting down"
    }

    /// Unlink and tear down the connection's session if it still exists
    /// (TEARDOWN and the reaper already unlink it themselves).
    fn cleanup(&self, sessions: &SessionTable) {
        if sessions.remove(self.session.id()).is_some() {
            self.session.teardown();
            tracing::debug!(peer = %self.peer_addr, session_id = self.session.id(), "session cleaned up on disconnect");
        }
    }
}
