//! Network transport layer for RTSP signaling.
//!
//! RTSP uses a split transport model:
//!
//! - **TCP** ([`tcp`]): carries RTSP request/response signaling. One TCP
//!   connection per client, with a thread per connection.
//!
//! - **UDP**: carries RTP media and RTCP reports. Each session binds its
//!   own socket pair in [`crate::media::rtp::RtpSession`].
//!
//! Interleaved TCP transport (RFC 2326 §10.12) is declined at SETUP with
//! 461 Unsupported Transport.

pub mod tcp;
