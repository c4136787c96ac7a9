//! RTCP sender/receiver reporting (RFC 3550 §6).
//!
//! Report packets are built by small pure functions so the wire layout is
//! testable without sockets. A single scheduler worker services every
//! session's RTCP socket: it drains inbound reports (non-blocking) and
//! emits an SR or RR every [`RTCP_INTERVAL`] per session.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::media::rtp::RtpSession;
use crate::session::SessionTable;

/// Report cadence per session (RFC 3550 recommends ~5 s for small sessions).
pub const RTCP_INTERVAL: Duration = Duration::from_secs(5);

/// Scheduler pass cadence; bounds how long inbound RTCP sits unread.
const POLL_DELAY: Duration = Duration::from_millis(100);

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Sender Report packet size: header + SSRC + sender info.
pub const SR_PACKET_SIZE: usize = 28;
/// Receiver Report packet size: header + SSRC + one (empty) report block.
pub const RR_PACKET_SIZE: usize = 32;

/// RTCP packet classification (RFC 3550 §12.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcpPacketType {
    SenderReport,
    ReceiverReport,
    SourceDescription,
    Bye,
    App,
}

impl RtcpPacketType {
    pub fn from_pt(pt: u8) -> Option<Self> {
        match pt {
            200 => Some(Self::SenderReport),
            201 => Some(Self::ReceiverReport),
            202 => Some(Self::SourceDescription),
            203 => Some(Self::Bye),
            204 => Some(Self::App),
            _ => None,
        }
    }
}

/// Per-session transmission statistics and report bookkeeping.
///
/// Mutated only by the owning session's packetization and reporting paths.
#[derive(Debug, Default)]
pub struct RtcpStats {
    pub packets_sent: u32,
    pub octets_sent: u32,
    pub last_rtcp_sent: Option<Instant>,
    pub last_rtcp_received: Option<Instant>,
}

/// Classify an inbound RTCP datagram.
///
/// Returns `None` for truncated packets, non-version-2 packets, and
/// unrecognized payload types — all discarded without error.
pub fn classify(data: &[u8]) -> Option<RtcpPacketType> {
    if data.len() < 4 {
        return None;
    }
    let version = (data[0] >> 6) & 0x03;
    if version != 2 {
        return None;
    }
    RtcpPacketType::from_pt(data[1])
}

/// Current time as a 64-bit NTP timestamp (seconds since 1900 in the high
/// word, fraction in the low word).
pub fn ntp_now() -> u64 {
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = unix.as_secs() + NTP_UNIX_OFFSET;
    let frac = ((unix.subsec_nanos() as u64) << 32) / 1_000_000_000;
    (secs << 32) | frac
}

/// Build a Sender Report (RFC 3550 §6.4.1).
///
/// ```text
/// |V=2|P|  RC=0 | PT=200 |      length=6       |
/// |                  SSRC                      |
/// |             NTP timestamp (64)             |
/// |              RTP timestamp                 |
/// |           sender packet count              |
/// |            sender octet count              |
/// ```
pub fn encode_sender_report(
    ssrc: u32,
    ntp_timestamp: u64,
    rtp_timestamp: u32,
    packets_sent: u32,
    octets_sent: u32,
) -> [u8; SR_PACKET_SIZE] {
    let mut packet = [0u8; SR_PACKET_SIZE];
    packet[0] = 0x80; // V=2, P=0, RC=0
    packet[1] = 200; // PT=SR
    packet[2..4].copy_from_slice(&6u16.to_be_bytes()); // length in words - 1
    packet[4..8].copy_from_slice(&ssrc.to_be_bytes());
    packet[8..16].copy_from_slice(&ntp_timestamp.to_be_bytes());
    packet[16..20].copy_from_slice(&rtp_timestamp.to_be_bytes());
    packet[20..24].copy_from_slice(&packets_sent.to_be_bytes());
    packet[24..28].copy_from_slice(&octets_sent.to_be_bytes());
    packet
}

/// Build a Receiver Report skeleton with one zeroed report block
/// (RFC 3550 §6.4.2).
pub fn encode_receiver_report(ssrc: u32) -> [u8; RR_PACKET_SIZE] {
    let mut packet = [0u8; RR_PACKET_SIZE];
    packet[0] = 0x81; // V=2, P=0, RC=1
    packet[1] = 201; // PT=RR
    packet[2..4].copy_from_slice(&7u16.to_be_bytes());
    packet[4..8].copy_from_slice(&ssrc.to_be_bytes());
    // report block left zeroed
    packet
}

/// Shared RTCP scheduler worker.
///
/// Iterates every session each pass: drains inbound RTCP from both the
/// video and audio sub-sessions and sends the periodic report when due.
/// Exits when the server's running flag clears.
pub fn reporter_loop(sessions: SessionTable, running: Arc<AtomicBool>) {
    tracing::debug!("RTCP reporter started");

    while running.load(Ordering::SeqCst) {
        for session in sessions.snapshot() {
            if let Some(rtp) = session.rtp.lock().as_mut() {
                service_session(rtp);
            }
            if let Some(rtp) = session.audio_rtp.lock().as_mut() {
                service_session(rtp);
            }
        }
        thread::sleep(POLL_DELAY);
    }

    tracing::debug!("RTCP reporter exited");
}

/// One scheduler pass over a single RTP sub-session.
fn service_session(rtp: &mut RtpSession) {
    let mut buf = [0u8; 1500];
    loop {
        match rtp.rtcp_socket().recv_from(&mut buf) {
            Ok((n, from)) => {
                rtp.stats.last_rtcp_received = Some(Instant::now());
                match classify(&buf[..n]) {
                    Some(kind) => {
                        tracing::trace!(ssrc = rtp.ssrc(), ?kind, %from, "RTCP received")
                    }
                    None => {
                        tracing::debug!(ssrc = rtp.ssrc(), len = n, "unrecognized RTCP packet")
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) => {
                tracing::debug!(error = %e, "RTCP receive error");
                break;
            }
        }
    }

    let due = rtp
        .stats
        .last_rtcp_sent
        .is_none_or(|sent| sent.elapsed() >= RTCP_INTERVAL);
    if !due {
        return;
    }

    let result = if rtp.stats.packets_sent > 0 {
        let sr = encode_sender_report(
            rtp.ssrc(),
            ntp_now(),
            rtp.timestamp(),
            rtp.stats.packets_sent,
            rtp.stats.octets_sent,
        );
        rtp.rtcp_socket().send_to(&sr, rtp.client_rtcp_addr())
    } else {
        let rr = encode_receiver_report(rtp.ssrc());
        rtp.rtcp_socket().send_to(&rr, rtp.client_rtcp_addr())
    };

    match result {
        Ok(_) => rtp.stats.last_rtcp_sent = Some(Instant::now()),
        Err(e) => tracing::debug!(ssrc = rtp.ssrc(), error = %e, "RTCP send failed"),
    }
}
