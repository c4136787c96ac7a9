//! SDP (Session Description Protocol) generation (RFC 4566 / RFC 8866).
//!
//! Produces the SDP body returned by DESCRIBE responses, built from the
//! stream's registry slot. The format:
//!
//! ```text
//! v=0                                          ← protocol version
//! o=<user> <sess-id> <sess-ver> IN IP4 <addr>  ← origin
//! s=<stream name>                               ← session name
//! c=IN IP4 <addr>                               ← connection address
//! t=0 0                                         ← timing (live stream)
//! a=tool:rtsp-multistream                       ← server software (§6)
//! a=sendonly                                    ← direction (§6)
//! m=video 0 RTP/AVP 96                          ← media description
//! a=rtpmap:96 H264/90000                        ← codec/clock rate
//! a=framerate:25                                ← configured frame rate
//! a=fmtp:96 packetization-mode=1;...            ← codec parameters
//! a=control:track1                              ← track control URL
//! ```
//!
//! The `fmtp` line carries `profile-level-id` and `sprop-parameter-sets`
//! (RFC 6184 §8.1) once the first keyframe has populated the stream's
//! SPS/PPS cache; until then clients get `packetization-mode=1` alone and
//! pick the parameter sets out of the RTP stream. An `m=audio` section is
//! appended for streams with audio enabled.

use crate::registry::StreamInfo;

/// Generate an SDP session description for the given stream.
pub fn generate(
    info: &StreamInfo,
    ip: &str,
    session_id: &str,
    session_version: &str,
    username: &str,
) -> String {
    let config = info.config();
    let video = &config.video;
    let pt = video.codec.payload_type();

    let mut sdp: Vec<String> = Vec::new();

    sdp.push("v=0".to_string());
    sdp.push(format!(
        "o={} {} {} IN IP4 {}",
        username, session_id, session_version, ip
    ));
    sdp.push(format!("s={}", config.name));
    sdp.push(format!("c=IN IP4 {}", ip));
    sdp.push("t=0 0".to_string());
    sdp.push("a=tool:rtsp-multistream".to_string());
    sdp.push("a=sendonly".to_string());

    sdp.push(format!("m=video 0 RTP/AVP {}", pt));
    sdp.push(format!(
        "a=rtpmap:{} {}/{}",
        pt,
        video.codec.name(),
        video.codec.clock_rate()
    ));
    sdp.push(format!("a=framerate:{}", video.fps));

    let mut fmtp = format!("a=fmtp:{} packetization-mode=1", pt);
    if let Some(params) = info.parameter_sets() {
        if let Some(plid) = &params.profile_level_id {
            fmtp.push_str(&format!(";profile-level-id={}", plid));
        }
        fmtp.push_str(&format!(
            ";sprop-parameter-sets={},{}",
            params.sps_base64, params.pps_base64
        ));
    }
    sdp.push(fmtp);
    sdp.push("a=control:track1".to_string());

    if info.audio_active()
        && let Some(audio) = &config.audio
    {
        let apt = audio.codec.payload_type();
        sdp.push(format!("m=audio 0 RTP/AVP {}", apt));
        sdp.push(format!(
            "a=rtpmap:{} {}/{}/{}",
            apt,
            audio.codec.name(),
            audio.sample_rate,
            audio.channels
        ));
        sdp.push("a=control:track2".to_string());
    }

    tracing::debug!(path = %config.path, "SDP generated");

    format!("{}\r\n", sdp.join("\r\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::testing::ScriptedDriver;
    use crate::encoder::CaptureHandle;
    use crate::registry::{AudioParams, StreamConfig, StreamRegistry, VideoParams};
    use std::sync::Arc;

    fn registered(config: StreamConfig) -> Arc<StreamInfo> {
        let reg = StreamRegistry::new(ScriptedDriver::new(), CaptureHandle(0));
        let path = config.path.clone();
        reg.register(config).unwrap();
        reg.lookup(&path).unwrap()
    }

    #[test]
    fn generates_h264_sdp() {
        let info = registered(StreamConfig::new(
            "/vs0",
            "Main Stream",
            VideoParams::default(),
        ));
        let sdp = generate(&info, "192.168.1.100", "1234567890", "1", "server");

        assert!(sdp.contains("v=0\r\n"));
        assert!(sdp.contains("o=server 1234567890 1 IN IP4 192.168.1.100\r\n"));
        assert!(sdp.contains("s=Main Stream\r\n"));
        assert!(
            sdp.contains("c=IN IP4 192.168.1.100\r\n"),
            "c= must use configured IP, not 0.0.0.0"
        );
        assert!(sdp.contains("a=sendonly\r\n"));
        assert!(sdp.contains("m=video 0 RTP/AVP 96\r\n"));
        assert!(sdp.contains("a=rtpmap:96 H264/90000\r\n"));
        assert!(sdp.contains("a=framerate:25\r\n"));
        assert!(sdp.contains("a=fmtp:96 packetization-mode=1\r\n"));
        assert!(sdp.contains("a=control:track1\r\n"));
        assert!(!sdp.contains("m=audio"));

        // Verify ordering: rtpmap must come before fmtp (RFC 6184 §8.2.1)
        let rtpmap_idx = sdp.find("a=rtpmap").unwrap();
        let fmtp_idx = sdp.find("a=fmtp").unwrap();
        assert!(rtpmap_idx < fmtp_idx);

        // Session-level attrs must come before the media section
        let sendonly_idx = sdp.find("a=sendonly").unwrap();
        let m_idx = sdp.find("m=video").unwrap();
        assert!(sendonly_idx < m_idx);
        assert!(fmtp_idx > m_idx);
        assert!(sdp.ends_with("\r\n"));
    }

    #[test]
    fn fmtp_carries_cached_parameter_sets() {
        let info = registered(StreamConfig::new("/vs0", "main", VideoParams::default()));
        let keyframe = [
            &[0u8, 0, 0, 1, 0x67, 0x42, 0x00, 0x1e][..],
            &[0, 0, 0, 1, 0x68, 0xce, 0x38, 0x80][..],
        ]
        .concat();
        assert!(info.cache_parameter_sets(&keyframe));

        let sdp = generate(&info, "10.0.0.1", "1", "1", "cam");
        assert!(sdp.contains("profile-level-id=42001e"));
        assert!(sdp.contains("sprop-parameter-sets=Z0IAHg==,aM44gA==\r\n"));
    }

    #[test]
    fn audio_section_when_enabled() {
        let mut config = StreamConfig::new("/vs0", "main", VideoParams::default());
        config.audio = Some(AudioParams::default());
        config.audio_enabled = true;
        let info = registered(config);

        let sdp = generate(&info, "10.0.0.1", "1", "1", "cam");
        assert!(info.audio_active());
        assert!(sdp.contains("m=audio 0 RTP/AVP 97\r\n"));
        assert!(sdp.contains("a=rtpmap:97 MPEG4-GENERIC/16000/1\r\n"));
        assert!(sdp.contains("a=control:track2\r\n"));
    }
}
