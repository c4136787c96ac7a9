//! Encoder pump workers.
//!
//! One worker drains the hardware encoder and fans frames out to clients;
//! a second, identically shaped worker does the same for audio. Per cycle
//! (~10 ms) each enabled stream is serviced once:
//!
//! 1. Acquire the next encoded unit, retrying `WouldBlock` a bounded number
//!    of times. Any other driver error fails the cycle for that stream
//!    only; the next cycle tries again.
//! 2. For H.264, populate the stream's write-once SPS/PPS cache from the
//!    first keyframe seen.
//! 3. Fan out to every `Playing` session whose selected path matches,
//!    re-checking state under the session's media lock so a torn-down
//!    session is never handed a packet. A transmit failure on one session
//!    never affects the others.
//! 4. Bump the stream's counters for the drained unit and release it back
//!    to the driver.
//!
//! The audio worker runs even when no stream has audio enabled; it simply
//! finds nothing to service. Enabling audio is purely a configuration
//! change.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::encoder::{DriverError, EncodedUnit, EncoderDriver};
use crate::media::Codec;
use crate::registry::{StreamInfo, StreamRegistry};
use crate::session::{RtspSession, SessionTable};

/// Pause between pump cycles.
const PUMP_CYCLE: Duration = Duration::from_millis(10);

/// Bounded retry for `WouldBlock` within one cycle.
const GET_UNIT_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(20);

/// Driver-side wait per acquisition attempt.
const GET_UNIT_TIMEOUT_MS: u64 = 10;

/// Video pump worker. Exits when the running flag clears.
pub fn video_pump_loop(
    registry: Arc<StreamRegistry>,
    sessions: SessionTable,
    running: Arc<AtomicBool>,
) {
    tracing::debug!("video pump started");
    let driver = registry.driver();

    while running.load(Ordering::SeqCst) {
        for info in registry.snapshot() {
            match pump_video_stream(&info, &sessions, driver.as_ref()) {
                Ok(_) => {}
                Err(e) if e.is_retryable() => {
                    tracing::trace!(path = %info.path(), "no encoded unit this cycle");
                }
                Err(e) => {
                    tracing::warn!(path = %info.path(), error = %e, "video pump cycle failed");
                }
            }
        }
        thread::sleep(PUMP_CYCLE);
    }

    tracing::debug!("video pump exited");
}

/// Audio pump worker: same shape as the video pump, over streams with
/// audio enabled.
pub fn audio_pump_loop(
    registry: Arc<StreamRegistry>,
    sessions: SessionTable,
    running: Arc<AtomicBool>,
) {
    tracing::debug!("audio pump started");
    let driver = registry.driver();

    while running.load(Ordering::SeqCst) {
        for info in registry.snapshot() {
            if !info.audio_active() {
                continue;
            }
            match pump_audio_stream(&info, &sessions, driver.as_ref()) {
                Ok(_) => {}
                Err(e) if e.is_retryable() => {}
                Err(e) => {
                    tracing::warn!(path = %info.path(), error = %e, "audio pump cycle failed");
                }
            }
        }
        thread::sleep(PUMP_CYCLE);
    }

    tracing::debug!("audio pump exited");
}

/// Acquire the next unit with bounded `WouldBlock` retry.
fn acquire_unit(
    driver: &dyn EncoderDriver,
    info: &StreamInfo,
) -> Result<EncodedUnit, DriverError> {
    let mut attempt = 0;
    loop {
        match driver.get_unit(info.stream_handle(), GET_UNIT_TIMEOUT_MS) {
            Ok(unit) => return Ok(unit),
            Err(e) if e.is_retryable() => {
                attempt += 1;
                if attempt >= GET_UNIT_RETRIES {
                    return Err(e);
                }
                thread::sleep(RETRY_DELAY);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Service one stream for one cycle: acquire, cache parameter sets, fan
/// out, count, release. Returns the number of sessions served.
pub(crate) fn pump_video_stream(
    info: &StreamInfo,
    sessions: &SessionTable,
    driver: &dyn EncoderDriver,
) -> Result<usize, DriverError> {
    let unit = acquire_unit(driver, info)?;

    if unit.codec == Codec::H264 {
        info.cache_parameter_sets(&unit.data);
    }

    let targets = sessions.playing_on(info.path());
    let served = deliver_video(&unit, &targets, info.path());

    // Counters track encoder throughput, not delivery; the stats surface
    // reports them even with no client attached.
    info.record_video_frame(unit.data.len());
    driver.release_unit(info.stream_handle(), unit);
    Ok(served)
}

/// Fan one video unit out to the snapshotted sessions.
///
/// State is re-checked under each session's `rtp` lock. Teardown sets
/// `Closed` and then takes that lock to release the media before the
/// session is unlinked from the table, so a session snapshotted before
/// removal can never be handed a packet here.
fn deliver_video(unit: &EncodedUnit, targets: &[Arc<RtspSession>], path: &str) -> usize {
    let mut served = 0usize;
    for session in targets {
        let mut media = session.rtp.lock();
        if !session.is_playing() {
            continue;
        }
        if let Some(rtp) = media.as_mut() {
            match rtp.send_frame(&unit.data, unit.timestamp) {
                Ok(_) => served += 1,
                Err(e) => {
                    // Isolated: other sessions on this stream still get the frame.
                    tracing::warn!(
                        session_id = session.id(),
                        path = %path,
                        error = %e,
                        "frame transmit failed"
                    );
                }
            }
        }
    }
    served
}

/// Audio counterpart of [`pump_video_stream`].
pub(crate) fn pump_audio_stream(
    info: &StreamInfo,
    sessions: &SessionTable,
    driver: &dyn EncoderDriver,
) -> Result<usize, DriverError> {
    let Some(audio) = info.audio_handle() else {
        return Ok(0);
    };

    let unit = {
        let mut attempt = 0;
        loop {
            match driver.get_audio_unit(audio, GET_UNIT_TIMEOUT_MS) {
                Ok(unit) => break unit,
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    if attempt >= GET_UNIT_RETRIES {
                        return Err(e);
                    }
                    thread::sleep(RETRY_DELAY);
                }
                Err(e) => return Err(e),
            }
        }
    };

    let targets = sessions.playing_on(info.path());
    let mut served = 0usize;
    for session in &targets {
        let mut media = session.audio_rtp.lock();
        if !session.is_playing() {
            continue;
        }
        if let Some(rtp) = media.as_mut() {
            match rtp.send_frame(&unit.data, unit.timestamp) {
                Ok(_) => served += 1,
                Err(e) => {
                    tracing::warn!(
                        session_id = session.id(),
                        path = %info.path(),
                        error = %e,
                        "audio transmit failed"
                    );
                }
            }
        }
    }

    info.record_audio_frame(unit.data.len());
    driver.release_audio_unit(audio, unit);
    Ok(served)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::testing::ScriptedDriver;
    use crate::encoder::CaptureHandle;
    use crate::media::rtp::RtpSession;
    use crate::registry::{StreamConfig, VideoParams};
    use crate::session::{RtspSession, SessionState};
    use std::net::{TcpListener, TcpStream, UdpSocket};
    use std::sync::atomic::Ordering;

    fn registry_with_stream(driver: Arc<ScriptedDriver>) -> (Arc<StreamRegistry>, Arc<StreamInfo>) {
        let reg = Arc::new(StreamRegistry::new(driver, CaptureHandle(0)));
        reg.register(StreamConfig::new("/vs0", "main", VideoParams::default()))
            .unwrap();
        let info = reg.lookup("/vs0").unwrap();
        (reg, info)
    }

    /// A Playing session on `/vs0` whose RTP socket points at a local
    /// receiver; returns the receiver for packet assertions.
    fn playing_session(path: &str) -> (Arc<RtspSession>, UdpSocket) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let _server_side = listener.accept().unwrap();

        let session = Arc::new(RtspSession::new(client, addr, Duration::from_secs(60)));
        session.set_stream_path(path);

        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = receiver.local_addr().unwrap().port();
        let rtp =
            RtpSession::new("127.0.0.1".parse().unwrap(), port, port + 1, Codec::H264).unwrap();
        *session.rtp.lock() = Some(rtp);
        session.set_state(SessionState::Playing);

        (session, receiver)
    }

    fn h264_unit(payload_len: usize, timestamp: u32) -> EncodedUnit {
        let mut data = vec![0, 0, 0, 1, 0x65];
        data.extend(vec![0xAB; payload_len]);
        EncodedUnit {
            data,
            timestamp,
            codec: Codec::H264,
        }
    }

    #[test]
    fn retry_exhaustion_fails_cycle_without_counting() {
        let driver = ScriptedDriver::new();
        let (_reg, info) = registry_with_stream(driver.clone());
        let sessions = SessionTable::new();

        let result = pump_video_stream(&info, &sessions, &*driver);
        assert!(matches!(result, Err(DriverError::WouldBlock)));
        assert_eq!(driver.get_calls.load(Ordering::SeqCst), 3);
        assert_eq!(info.stats().frames_sent, 0);
        assert_eq!(info.stats().bytes_sent, 0);
        assert_eq!(driver.released.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn non_retryable_error_fails_immediately() {
        let driver = ScriptedDriver::new();
        let (_reg, info) = registry_with_stream(driver.clone());
        driver.push_error(DriverError::Failed("encoder fault".into()));

        let result = pump_video_stream(&info, &SessionTable::new(), &*driver);
        assert!(matches!(result, Err(DriverError::Failed(_))));
        assert_eq!(driver.get_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fan_out_serves_each_playing_session_once() {
        let driver = ScriptedDriver::new();
        let (_reg, info) = registry_with_stream(driver.clone());
        let sessions = SessionTable::new();

        let (a, recv_a) = playing_session("/vs0");
        let (b, recv_b) = playing_session("/vs0");
        sessions.insert(a);
        sessions.insert(b);

        driver.push_unit(h264_unit(1200, 3000));
        let served = pump_video_stream(&info, &sessions, &*driver).unwrap();
        assert_eq!(served, 2);

        // one single-NAL packet per receiver
        let mut buf = [0u8; 1500];
        for recv in [&recv_a, &recv_b] {
            recv.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
            let (n, _) = recv.recv_from(&mut buf).unwrap();
            assert_eq!(n, 12 + 1201);
        }

        assert_eq!(info.stats().frames_sent, 1);
        assert_eq!(driver.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fan_out_skips_sessions_on_other_paths_and_not_playing() {
        let driver = ScriptedDriver::new();
        let (_reg, info) = registry_with_stream(driver.clone());
        let sessions = SessionTable::new();

        let (other, other_recv) = playing_session("/vs1");
        let (paused, paused_recv) = playing_session("/vs0");
        paused.set_state(SessionState::Ready);
        sessions.insert(other);
        sessions.insert(paused);

        driver.push_unit(h264_unit(100, 3000));
        let served = pump_video_stream(&info, &sessions, &*driver).unwrap();
        assert_eq!(served, 0);
        // the drained unit still counts as encoder throughput
        assert_eq!(info.stats().frames_sent, 1);

        let mut buf = [0u8; 1500];
        for recv in [&other_recv, &paused_recv] {
            recv.set_nonblocking(true).unwrap();
            assert!(recv.recv_from(&mut buf).is_err());
        }
    }

    /// A Playing session whose RTP destination is port 0; `send_to` to it
    /// fails deterministically.
    fn playing_session_failing_transmit(path: &str) -> Arc<RtspSession> {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let _server_side = listener.accept().unwrap();

        let session = Arc::new(RtspSession::new(client, addr, Duration::from_secs(60)));
        session.set_stream_path(path);
        let rtp = RtpSession::new("127.0.0.1".parse().unwrap(), 0, 0, Codec::H264).unwrap();
        *session.rtp.lock() = Some(rtp);
        session.set_state(SessionState::Playing);
        session
    }

    #[test]
    fn counters_track_drained_units_without_sessions() {
        let driver = ScriptedDriver::new();
        let (_reg, info) = registry_with_stream(driver.clone());
        let sessions = SessionTable::new();

        driver.push_unit(h264_unit(1000, 3000));
        let served = pump_video_stream(&info, &sessions, &*driver).unwrap();
        assert_eq!(served, 0);

        let stats = info.stats();
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(stats.bytes_sent, 1005);
        assert_eq!(driver.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transmit_failure_is_isolated_per_session() {
        let driver = ScriptedDriver::new();
        let (_reg, info) = registry_with_stream(driver.clone());
        let sessions = SessionTable::new();

        let broken = playing_session_failing_transmit("/vs0");
        let (healthy, receiver) = playing_session("/vs0");
        sessions.insert(broken);
        sessions.insert(healthy);

        driver.push_unit(h264_unit(100, 3000));
        let served = pump_video_stream(&info, &sessions, &*driver).unwrap();
        assert_eq!(served, 1);

        let mut buf = [0u8; 1500];
        receiver.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(n, 12 + 101);
        assert_eq!(info.stats().frames_sent, 1);
    }

    #[test]
    fn torn_down_session_gets_nothing_after_unlink() {
        let driver = ScriptedDriver::new();
        let (_reg, _info) = registry_with_stream(driver.clone());
        let sessions = SessionTable::new();
        let (session, receiver) = playing_session("/vs0");
        sessions.insert(session.clone());

        // snapshot taken before the session expires
        let targets = sessions.playing_on("/vs0");
        session.teardown();
        sessions.remove(session.id());

        let unit = h264_unit(100, 3000);
        assert_eq!(deliver_video(&unit, &targets, "/vs0"), 0);

        let mut buf = [0u8; 1500];
        receiver.set_nonblocking(true).unwrap();
        assert!(receiver.recv_from(&mut buf).is_err());
    }

    #[test]
    fn pump_populates_parameter_set_cache() {
        let driver = ScriptedDriver::new();
        let (_reg, info) = registry_with_stream(driver.clone());

        let keyframe = [
            &[0u8, 0, 0, 1, 0x67, 0x42, 0x00, 0x1e][..],
            &[0, 0, 0, 1, 0x68, 0xce, 0x38, 0x80][..],
            &[0, 0, 0, 1, 0x65, 0x88][..],
        ]
        .concat();
        driver.push_unit(EncodedUnit {
            data: keyframe,
            timestamp: 0,
            codec: Codec::H264,
        });

        pump_video_stream(&info, &SessionTable::new(), &*driver).unwrap();
        let params = info.parameter_sets().unwrap();
        assert_eq!(params.profile_level_id.as_deref(), Some("42001e"));
    }
}
