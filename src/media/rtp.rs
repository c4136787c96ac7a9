use std::net::{IpAddr, SocketAddr, UdpSocket};

use rand::RngExt;

use crate::error::Result;
use crate::media::h264;
use crate::media::rtcp::RtcpStats;
use crate::media::Codec;

/// Practical payload budget per datagram, leaving room for IP/UDP overhead.
pub const DEFAULT_MTU: usize = 1400;

/// RTP fixed header size (RFC 3550 §5.1).
pub const RTP_HEADER_SIZE: usize = 12;

/// Serialize a 12-byte RTP fixed header (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Version is always 2; padding, extension, and CSRC count are always 0.
/// The `marker` bit signals the last packet of a frame (RFC 6184 §5.1).
pub fn encode_rtp_header(
    pt: u8,
    marker: bool,
    sequence: u16,
    timestamp: u32,
    ssrc: u32,
) -> [u8; RTP_HEADER_SIZE] {
    let mut header = [0u8; RTP_HEADER_SIZE];
    header[0] = 2 << 6;
    header[1] = ((marker as u8) << 7) | (pt & 0x7f);
    header[2..4].copy_from_slice(&sequence.to_be_bytes());
    header[4..8].copy_from_slice(&timestamp.to_be_bytes());
    header[8..12].copy_from_slice(&ssrc.to_be_bytes());
    header
}

/// Per-session RTP media transport state.
///
/// Owns the session's pair of UDP sockets (RTP + RTCP), the sequence and
/// timestamp counters, and the RTCP statistics block. Sequence and timestamp
/// are written only by the encoder pump's fan-out path; nothing else
/// increments them.
#[derive(Debug)]
pub struct RtpSession {
    /// Synchronization source identifier, random at creation, immutable
    /// (RFC 3550 §8.1).
    ssrc: u32,
    sequence: u16,
    /// RTP timestamp of the most recently transmitted frame.
    timestamp: u32,
    codec: Codec,
    mtu: usize,
    socket: UdpSocket,
    rtcp_socket: UdpSocket,
    server_rtp_port: u16,
    server_rtcp_port: u16,
    client_rtp_addr: SocketAddr,
    client_rtcp_addr: SocketAddr,
    pub stats: RtcpStats,
}

impl RtpSession {
    /// Bind an RTP/RTCP socket pair and set up transport toward the client.
    ///
    /// Both sockets are bound to ephemeral ports; the RTCP socket is
    /// non-blocking so the shared reporter can poll it without stalling.
    pub fn new(
        client_ip: IpAddr,
        client_rtp_port: u16,
        client_rtcp_port: u16,
        codec: Codec,
    ) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        let rtcp_socket = UdpSocket::bind("0.0.0.0:0")?;
        rtcp_socket.set_nonblocking(true)?;

        let server_rtp_port = socket.local_addr()?.port();
        let server_rtcp_port = rtcp_socket.local_addr()?.port();
        let ssrc = rand::rng().random::<u32>();

        tracing::debug!(
            ssrc = format_args!("{:#010X}", ssrc),
            server_rtp_port,
            server_rtcp_port,
            client = %client_ip,
            "RTP session created"
        );

        Ok(Self {
            ssrc,
            sequence: 0,
            timestamp: 0,
            codec,
            mtu: DEFAULT_MTU,
            socket,
            rtcp_socket,
            server_rtp_port,
            server_rtcp_port,
            client_rtp_addr: SocketAddr::new(client_ip, client_rtp_port),
            client_rtcp_addr: SocketAddr::new(client_ip, client_rtcp_port),
            stats: RtcpStats::default(),
        })
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Next sequence number to be transmitted (for the RTP-Info header).
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// RTP timestamp of the last transmitted frame (for the RTP-Info header).
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Server-side (RTP, RTCP) ports, advertised in the SETUP response.
    pub fn server_ports(&self) -> (u16, u16) {
        (self.server_rtp_port, self.server_rtcp_port)
    }

    pub fn client_rtcp_addr(&self) -> SocketAddr {
        self.client_rtcp_addr
    }

    pub fn rtcp_socket(&self) -> &UdpSocket {
        &self.rtcp_socket
    }

    /// Packetize one encoded frame and transmit it to the client.
    ///
    /// H.264 access units are split into NAL units, each sent as a single
    /// NAL packet when it fits the MTU or FU-A fragments otherwise
    /// (RFC 6184 §5.6/§5.8). Audio frames go out as one packet. Returns the
    /// number of RTP packets transmitted.
    pub fn send_frame(&mut self, payload: &[u8], timestamp: u32) -> Result<usize> {
        if payload.is_empty() {
            return Ok(0);
        }

        self.timestamp = timestamp;

        let fragments = match self.codec {
            Codec::H264 => h264::packetize(payload, self.mtu),
            _ => vec![h264::Fragment {
                bytes: payload.to_vec(),
                marker: true,
            }],
        };

        let pt = self.codec.payload_type();
        let mut sent = 0usize;
        for frag in &fragments {
            let header = encode_rtp_header(pt, frag.marker, self.sequence, timestamp, self.ssrc);
            self.sequence = self.sequence.wrapping_add(1);

            let mut packet = Vec::with_capacity(RTP_HEADER_SIZE + frag.bytes.len());
            packet.extend_from_slice(&header);
            packet.extend_from_slice(&frag.bytes);

            self.socket.send_to(&packet, self.client_rtp_addr)?;
            // sender counts wrap mod 2^32 (RFC 3550 §6.4.1)
            self.stats.packets_sent = self.stats.packets_sent.wrapping_add(1);
            self.stats.octets_sent = self
                .stats
                .octets_sent
                .wrapping_add(frag.bytes.len() as u32);
            sent += 1;
        }

        tracing::trace!(
            packets = sent,
            frame_bytes = payload.len(),
            seq = self.sequence,
            ts = timestamp,
            "frame transmitted"
        );

        Ok(sent)
    }
}
