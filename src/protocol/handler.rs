use std::net::SocketAddr;
use std::sync::Arc;

use crate::protocol::request::{Method, RtspRequest};
use crate::protocol::response::RtspResponse;
use crate::protocol::sdp;
use crate::registry::{extract_stream_path, StreamRegistry};
use crate::server::ServerConfig;
use crate::session::transport::TransportHeader;
use crate::session::{RtspSession, SessionState, SessionTable};
use crate::media::rtp::RtpSession;
use crate::media::Codec;

/// Drives the RTSP state machine for a single TCP connection.
///
/// The connection's session is created at accept time in `Init` state;
/// the handler walks it through `Ready` (SETUP) and `Playing` (PLAY) and
/// into terminal `Closed` (TEARDOWN). Every response echoes the request
/// CSeq; a missing CSeq is logged and echoed as `0`, never fatal.
pub struct MethodHandler {
    session: Arc<RtspSession>,
    sessions: SessionTable,
    registry: Arc<StreamRegistry>,
    config: Arc<ServerConfig>,
    client_addr: SocketAddr,
}

impl MethodHandler {
    pub fn new(
        session: Arc<RtspSession>,
        sessions: SessionTable,
        registry: Arc<StreamRegistry>,
        config: Arc<ServerConfig>,
        client_addr: SocketAddr,
    ) -> Self {
        MethodHandler {
            session,
            sessions,
            registry,
            config,
            client_addr,
        }
    }

    pub fn handle(&mut self, request: &RtspRequest) -> RtspResponse {
        let cseq = match request.cseq() {
            Some(c) => c,
            None => {
                tracing::warn!(session_id = self.session.id(), "request missing CSeq");
                "0"
            }
        };

        self.session.touch();

        if request.method != Method::Options && !self.authenticate(request) {
            tracing::warn!(
                session_id = self.session.id(),
                method = ?request.method,
                "request rejected by authenticator"
            );
            return RtspResponse::unauthorized().add_header("CSeq", cseq);
        }

        match request.method {
            Method::Options => self.handle_options(cseq),
            Method::Describe => self.handle_describe(cseq, &request.uri),
            Method::Setup => self.handle_setup(cseq, request),
            Method::Play => self.handle_play(cseq, request),
            Method::Pause => self.handle_pause(cseq),
            Method::Teardown => self.handle_teardown(cseq),
            Method::GetParameter => self.handle_get_parameter(cseq),
            Method::Record | Method::Unknown => {
                tracing::warn!(method = ?request.method, %cseq, "unsupported RTSP method");
                RtspResponse::not_implemented().add_header("CSeq", cseq)
            }
        }
    }

    /// Run the configured pass/fail hook once per session; its verdict is
    /// latched into the session's `authenticated` flag.
    fn authenticate(&self, request: &RtspRequest) -> bool {
        if self.session.is_authenticated() {
            return true;
        }
        let pass = match &self.config.authenticator {
            Some(hook) => hook(request),
            None => true,
        };
        if pass {
            self.session.set_authenticated(true);
        }
        pass
    }

    fn handle_options(&self, cseq: &str) -> RtspResponse {
        tracing::debug!(%cseq, "OPTIONS");
        RtspResponse::ok().add_header("CSeq", cseq).add_header(
            "Public",
            "OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN, GET_PARAMETER",
        )
    }

    /// Host for the SDP `o=`/`c=` lines: configured public host, else the
    /// host from the request URI, else the client-facing IP.
    fn host_from_uri_or_client(&self, uri: &str) -> String {
        if let Some(host) = &self.config.public_host {
            return host.clone();
        }

        if let Some(after_scheme) = uri
            .strip_prefix("rtsp://")
            .or_else(|| uri.strip_prefix("rtsps://"))
        {
            let host = after_scheme
                .split('/')
                .next()
                .and_then(|host_port| host_port.split(':').next())
                .unwrap_or("")
                .trim();
            if !host.is_empty() {
                return host.to_string();
            }
        }
        self.client_addr.ip().to_string()
    }

    fn handle_describe(&self, cseq: &str, uri: &str) -> RtspResponse {
        tracing::debug!(%cseq, uri, "DESCRIBE");

        let path = extract_stream_path(uri);
        let Some(info) = self.registry.lookup(path) else {
            tracing::warn!(uri, path, "DESCRIBE for unknown stream");
            return RtspResponse::not_found().add_header("CSeq", cseq);
        };

        let host = self.host_from_uri_or_client(uri);
        let body = sdp::generate(
            &info,
            &host,
            &self.config.sdp_session_id,
            &self.config.sdp_session_version,
            &self.config.sdp_username,
        );

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Content-Type", "application/sdp")
            .add_header("Content-Base", uri)
            .with_body(body)
    }

    fn handle_setup(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        if self.session.state() == SessionState::Playing {
            tracing::warn!(session_id = self.session.id(), "SETUP while playing");
            return RtspResponse::method_not_valid().add_header("CSeq", cseq);
        }

        let path = extract_stream_path(&request.uri);
        let Some(info) = self.registry.lookup(path) else {
            tracing::warn!(uri = %request.uri, path, "SETUP for unknown stream");
            return RtspResponse::not_found().add_header("CSeq", cseq);
        };

        let Some(transport_header) = request.get_header("Transport") else {
            tracing::warn!(%cseq, "SETUP missing Transport header");
            return RtspResponse::bad_request().add_header("CSeq", cseq);
        };

        // Only RTP/AVP over UDP is served (RFC 2326 §10.12).
        if TransportHeader::is_interleaved(transport_header) {
            tracing::warn!(%cseq, transport = %transport_header, "interleaved TCP transport declined");
            return RtspResponse::unsupported_transport()
                .add_header("CSeq", cseq)
                .add_header("Unsupported", "RTP/AVP/TCP (interleaved); use RTP/AVP (UDP)");
        }

        let Some(client_transport) = TransportHeader::parse(transport_header) else {
            tracing::warn!(%cseq, transport_header, "SETUP invalid Transport header");
            return RtspResponse::bad_request().add_header("CSeq", cseq);
        };

        // track2 selects the audio sub-stream when the stream carries one.
        let is_audio_track = request.uri.contains("/track2");
        let codec: Codec = if is_audio_track {
            if !info.audio_active() {
                tracing::warn!(uri = %request.uri, "SETUP for absent audio track");
                return RtspResponse::not_found().add_header("CSeq", cseq);
            }
            match info.config().audio.as_ref() {
                Some(audio) => audio.codec,
                None => return RtspResponse::not_found().add_header("CSeq", cseq),
            }
        } else {
            info.config().video.codec
        };

        let rtp = match RtpSession::new(
            self.client_addr.ip(),
            client_transport.client_rtp_port,
            client_transport.client_rtcp_port,
            codec,
        ) {
            Ok(rtp) => rtp,
            Err(e) => {
                tracing::error!(error = %e, "failed to create RTP session");
                return RtspResponse::internal_error().add_header("CSeq", cseq);
            }
        };

        let (server_rtp_port, server_rtcp_port) = rtp.server_ports();
        if is_audio_track {
            *self.session.audio_rtp.lock() = Some(rtp);
        } else {
            *self.session.rtp.lock() = Some(rtp);
        }

        self.session.set_stream_path(path);
        self.session.set_state(SessionState::Ready);

        tracing::info!(
            session_id = self.session.id(),
            stream = path,
            uri = %request.uri,
            client_rtp_port = client_transport.client_rtp_port,
            server_rtp_port,
            audio = is_audio_track,
            "transport negotiated via SETUP"
        );

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header(
                "Transport",
                &client_transport.response_value(server_rtp_port, server_rtcp_port),
            )
            .add_header("Session", &self.session.session_header_value())
    }

    fn handle_play(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        match self.session.state() {
            SessionState::Ready | SessionState::Playing => {}
            state => {
                tracing::warn!(session_id = self.session.id(), ?state, "PLAY before SETUP");
                return RtspResponse::method_not_valid().add_header("CSeq", cseq);
            }
        }

        self.session.set_state(SessionState::Playing);
        tracing::info!(session_id = self.session.id(), "session started playing");

        let mut resp = RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Session", &self.session.session_header_value())
            .add_header("Range", "npt=0.000-");

        if let Some(rtp) = self.session.rtp.lock().as_ref() {
            let rtp_info = format!(
                "url={};seq={};rtptime={}",
                request.uri,
                rtp.sequence(),
                rtp.timestamp()
            );
            resp = resp.add_header("RTP-Info", &rtp_info);
        }

        resp
    }

    fn handle_pause(&mut self, cseq: &str) -> RtspResponse {
        match self.session.state() {
            SessionState::Ready | SessionState::Playing => {}
            state => {
                tracing::warn!(session_id = self.session.id(), ?state, "PAUSE before SETUP");
                return RtspResponse::method_not_valid().add_header("CSeq", cseq);
            }
        }

        self.session.set_state(SessionState::Ready);
        tracing::info!(session_id = self.session.id(), "session paused");
        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Session", &self.session.session_header_value())
    }

    /// Close the session and release media before unlinking it, so the
    /// fan-out path cannot hand a packet to an unlinked session. The
    /// control socket stays open so the response still reaches the client;
    /// the connection loop exits on seeing `Closed`.
    fn handle_teardown(&mut self, cseq: &str) -> RtspResponse {
        self.session.set_state(SessionState::Closed);
        self.session.release_media();
        self.sessions.remove(self.session.id());
        tracing::info!(session_id = self.session.id(), "session terminated via TEARDOWN");
        RtspResponse::ok().add_header("CSeq", cseq)
    }

    /// GET_PARAMETER is used by clients (e.g. VLC) as a keepalive
    /// (RFC 2326 §10.8); activity was already refreshed in `handle`.
    fn handle_get_parameter(&self, cseq: &str) -> RtspResponse {
        tracing::trace!(%cseq, session_id = self.session.id(), "GET_PARAMETER keepalive");

        let mut resp = RtspResponse::ok().add_header("CSeq", cseq);
        if self.session.state() != SessionState::Init {
            resp = resp.add_header("Session", &self.session.session_header_value());
        }
        resp
    }
}
