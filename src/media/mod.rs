//! Media codecs and RTP/RTCP packet construction.
//!
//! Every encoded frame leaving the encoder pump is split into one or more
//! RTP packets. Each packet carries a 12-byte fixed header (RFC 3550 §5.1)
//! built by [`rtp::encode_rtp_header`]:
//!
//! - **Sequence number** (16-bit, wrapping) — for reordering and loss detection.
//! - **Timestamp** (32-bit) — media clock, 90 kHz for video.
//! - **SSRC** (32-bit) — randomly chosen to identify the sender.
//! - **Marker bit** — set on the last packet of an access unit (frame).
//!
//! H.264 access units larger than the MTU are fragmented per RFC 6184 FU-A
//! ([`h264`]); RTCP sender/receiver reports live in [`rtcp`].

pub mod h264;
pub mod rtcp;
pub mod rtp;

/// Codecs the streaming core can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// H.264/AVC video (RFC 6184).
    H264,
    /// AAC audio.
    Aac,
    /// G.711 μ-law audio.
    Pcmu,
    /// G.711 A-law audio.
    Pcma,
}

impl Codec {
    /// RTP payload type (RFC 3551; dynamic range 96–127 for H.264/AAC).
    pub fn payload_type(self) -> u8 {
        match self {
            Self::H264 => 96,
            Self::Aac => 97,
            Self::Pcmu => 0,
            Self::Pcma => 8,
        }
    }

    /// Nominal RTP clock rate in Hz.
    pub fn clock_rate(self) -> u32 {
        match self {
            Self::H264 => 90_000,
            Self::Aac => 16_000,
            Self::Pcmu | Self::Pcma => 8_000,
        }
    }

    /// Codec name for the SDP `a=rtpmap` attribute.
    pub fn name(self) -> &'static str {
        match self {
            Self::H264 => "H264",
            Self::Aac => "MPEG4-GENERIC",
            Self::Pcmu => "PCMU",
            Self::Pcma => "PCMA",
        }
    }

    pub fn is_video(self) -> bool {
        matches!(self, Self::H264)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_type_mapping() {
        assert_eq!(Codec::H264.payload_type(), 96);
        assert_eq!(Codec::Aac.payload_type(), 97);
        assert_eq!(Codec::Pcmu.payload_type(), 0);
        assert_eq!(Codec::Pcma.payload_type(), 8);
    }

    #[test]
    fn video_clock_rate_is_90khz() {
        assert_eq!(Codec::H264.clock_rate(), 90_000);
        assert!(Codec::H264.is_video());
        assert!(!Codec::Aac.is_video());
    }
}
