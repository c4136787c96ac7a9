//! Stream registry: the fixed table of configured camera streams.
//!
//! Each registered stream owns one encoder binding in the platform driver
//! and one slot in a table of [`MAX_STREAMS`]. Registration acquires driver
//! resources (encoder instance + capture binding, optionally an audio pair)
//! and releases them again on unregistration or when a later acquisition
//! step fails. The encoder pump and the RTSP handlers only ever see
//! `Arc<StreamInfo>` snapshots, so slot removal never invalidates a frame
//! mid-flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::prelude::*;
use parking_lot::{Mutex, RwLock};

use crate::encoder::{AudioHandle, CaptureHandle, EncoderDriver, EncoderHandle, StreamHandle};
use crate::error::{Result, RtspError};
use crate::media::{h264, Codec};

/// Size of the stream table.
pub const MAX_STREAMS: usize = 8;

/// Fallback path when a URI carries none.
pub const DEFAULT_STREAM_PATH: &str = "/vs0";

/// Registry slot index for a registered stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub usize);

/// H.264 encoding profile selection passed through to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VideoProfile {
    Baseline,
    #[default]
    Main,
    High,
}

/// Rate-control mode passed through to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BitrateMode {
    #[default]
    Cbr,
    Vbr,
}

/// Video encoding parameters for one stream.
#[derive(Debug, Clone)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
    pub codec: Codec,
    pub bitrate_mode: BitrateMode,
    pub profile: VideoProfile,
}

impl Default for VideoParams {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 25,
            bitrate_kbps: 4000,
            codec: Codec::H264,
            bitrate_mode: BitrateMode::default(),
            profile: VideoProfile::default(),
        }
    }
}

/// Audio encoding parameters for one stream.
#[derive(Debug, Clone)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub channels: u8,
    pub bits_per_sample: u8,
    pub codec: Codec,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            bits_per_sample: 16,
            codec: Codec::Aac,
        }
    }
}

/// Immutable configuration of one stream, fixed at registration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// URI path clients select the stream by (e.g. `/vs0`). Unique.
    pub path: String,
    /// Human-readable name carried into the SDP session section.
    pub name: String,
    pub video: VideoParams,
    pub audio: Option<AudioParams>,
    /// Audio capture/fan-out switch; the audio pump skips streams where
    /// this is false even when `audio` params are present.
    pub audio_enabled: bool,
}

impl StreamConfig {
    pub fn new(path: &str, name: &str, video: VideoParams) -> Self {
        Self {
            path: path.to_string(),
            name: name.to_string(),
            video,
            audio: None,
            audio_enabled: false,
        }
    }
}

/// Base64 SPS/PPS captured from the first keyframe, plus the derived
/// `profile-level-id`. Written once, never cleared while the stream lives.
#[derive(Debug, Clone)]
pub struct ParamSets {
    pub sps_base64: String,
    pub pps_base64: String,
    pub profile_level_id: Option<String>,
}

/// One live registry slot.
///
/// A `StreamInfo` exists only with its driver resources fully acquired;
/// there is no half-initialized state to observe.
pub struct StreamInfo {
    id: StreamId,
    config: StreamConfig,
    encoder: EncoderHandle,
    stream: StreamHandle,
    audio: Option<AudioHandle>,
    param_sets: Mutex<Option<ParamSets>>,
    bytes_sent: AtomicU64,
    frames_sent: AtomicU64,
    audio_frames_sent: AtomicU64,
}

impl StreamInfo {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn path(&self) -> &str {
        &self.config.path
    }

    pub fn stream_handle(&self) -> StreamHandle {
        self.stream
    }

    pub fn encoder_handle(&self) -> EncoderHandle {
        self.encoder
    }

    pub fn audio_handle(&self) -> Option<AudioHandle> {
        self.audio
    }

    /// Whether the audio pump should service this stream.
    pub fn audio_active(&self) -> bool {
        self.config.audio_enabled && self.audio.is_some()
    }

    /// Scan a frame for SPS/PPS and cache them base64-encoded.
    ///
    /// Write-once: after the first keyframe populates the cache, later
    /// calls return immediately without rescanning. Returns `true` when
    /// the cache is populated after the call.
    pub fn cache_parameter_sets(&self, frame: &[u8]) -> bool {
        let mut cache = self.param_sets.lock();
        if cache.is_some() {
            return true;
        }

        let (sps, pps) = h264::find_parameter_sets(frame);
        if let (Some(sps), Some(pps)) = (sps, pps) {
            *cache = Some(ParamSets {
                sps_base64: BASE64_STANDARD.encode(sps),
                pps_base64: BASE64_STANDARD.encode(pps),
                profile_level_id: h264::profile_level_id(sps),
            });
            tracing::info!(path = %self.config.path, "SPS/PPS captured");
            true
        } else {
            false
        }
    }

    pub fn parameter_sets(&self) -> Option<ParamSets> {
        self.param_sets.lock().clone()
    }

    pub fn record_video_frame(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_audio_frame(&self, bytes: usize) {
        self.audio_frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            path: self.config.path.clone(),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            audio_frames_sent: self.audio_frames_sent.load(Ordering::Relaxed),
        }
    }
}

/// Per-stream transmission counters, surfaced to the management layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStats {
    pub path: String,
    pub bytes_sent: u64,
    pub frames_sent: u64,
    pub audio_frames_sent: u64,
}

/// Aggregate counters across all registered streams.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TotalStats {
    pub streams: usize,
    pub bytes_sent: u64,
    pub frames_sent: u64,
    pub audio_frames_sent: u64,
}

/// Fixed-capacity table of registered streams, keyed by slot and by path.
pub struct StreamRegistry {
    driver: Arc<dyn EncoderDriver>,
    capture: CaptureHandle,
    slots: RwLock<Vec<Option<Arc<StreamInfo>>>>,
}

impl StreamRegistry {
    pub fn new(driver: Arc<dyn EncoderDriver>, capture: CaptureHandle) -> Self {
        Self {
            driver,
            capture,
            slots: RwLock::new(vec![None; MAX_STREAMS]),
        }
    }

    /// Register a stream and acquire its encoder resources.
    ///
    /// Fails with [`RtspError::CapacityExceeded`] when the table is full and
    /// [`RtspError::InvalidConfig`] for zeroed video parameters or a
    /// duplicate path; driver failures release whatever was already
    /// acquired before propagating. The table is unchanged on any failure.
    pub fn register(&self, config: StreamConfig) -> Result<StreamId> {
        let video = &config.video;
        if video.width == 0 || video.height == 0 || video.fps == 0 {
            return Err(RtspError::InvalidConfig("zero video dimensions or fps"));
        }
        if !video.codec.is_video() {
            return Err(RtspError::InvalidConfig("video codec required"));
        }

        let mut slots = self.slots.write();
        if slots.iter().flatten().any(|s| s.path() == config.path) {
            return Err(RtspError::InvalidConfig("duplicate stream path"));
        }
        let Some(slot_index) = slots.iter().position(Option::is_none) else {
            return Err(RtspError::CapacityExceeded(MAX_STREAMS));
        };

        let encoder = self.driver.init_encoder(video)?;
        let stream = match self.driver.bind_stream(self.capture, encoder) {
            Ok(stream) => stream,
            Err(e) => {
                self.driver.cleanup_encoder(encoder);
                return Err(e.into());
            }
        };

        let audio = if config.audio_enabled {
            match config.audio.as_ref() {
                Some(params) => match self.driver.init_audio(params) {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        // Audio is optional; the stream still serves video.
                        tracing::warn!(path = %config.path, error = %e, "audio init failed");
                        None
                    }
                },
                None => None,
            }
        } else {
            None
        };

        let id = StreamId(slot_index);
        tracing::info!(
            path = %config.path,
            width = video.width,
            height = video.height,
            fps = video.fps,
            slot = slot_index,
            "stream registered"
        );

        slots[slot_index] = Some(Arc::new(StreamInfo {
            id,
            config,
            encoder,
            stream,
            audio,
            param_sets: Mutex::new(None),
            bytes_sent: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            audio_frames_sent: AtomicU64::new(0),
        }));

        Ok(id)
    }

    /// Release a stream's encoder resources and clear its slot.
    ///
    /// No-op when the slot is already empty.
    pub fn unregister(&self, id: StreamId) {
        let removed = {
            let mut slots = self.slots.write();
            slots.get_mut(id.0).and_then(Option::take)
        };

        if let Some(info) = removed {
            self.driver.cancel_stream(info.stream);
            self.driver.cleanup_encoder(info.encoder);
            if let Some(audio) = info.audio {
                self.driver.cleanup_audio(audio);
            }
            tracing::info!(path = %info.path(), "stream unregistered");
        }
    }

    /// Look up a stream by its URI path.
    pub fn lookup(&self, path: &str) -> Option<Arc<StreamInfo>> {
        self.slots
            .read()
            .iter()
            .flatten()
            .find(|s| s.path() == path)
            .cloned()
    }

    /// All registered streams, in slot order.
    pub fn snapshot(&self) -> Vec<Arc<StreamInfo>> {
        self.slots.read().iter().flatten().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.slots.read().iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self, path: &str) -> Option<StreamStats> {
        self.lookup(path).map(|s| s.stats())
    }

    /// Aggregate counters across every registered stream.
    pub fn total_stats(&self) -> TotalStats {
        let mut total = TotalStats::default();
        for info in self.slots.read().iter().flatten() {
            let stats = info.stats();
            total.streams += 1;
            total.bytes_sent += stats.bytes_sent;
            total.frames_sent += stats.frames_sent;
            total.audio_frames_sent += stats.audio_frames_sent;
        }
        total
    }

    pub fn driver(&self) -> Arc<dyn EncoderDriver> {
        self.driver.clone()
    }

    /// Unregister every stream, releasing all driver resources.
    pub fn clear(&self) {
        for i in 0..MAX_STREAMS {
            self.unregister(StreamId(i));
        }
    }
}

/// Extract the stream path from an RTSP URI.
///
/// `rtsp://host:8554/vs0/track1` → `/vs0`
/// `rtsp://host:8554/vs0`        → `/vs0`
/// `rtsp://host:8554`            → `/vs0` (default)
/// `*`                           → `/vs0` (default)
pub fn extract_stream_path(uri: &str) -> &str {
    let path = if let Some(after) = uri
        .strip_prefix("rtsp://")
        .or_else(|| uri.strip_prefix("rtsps://"))
    {
        match after.find('/') {
            Some(slash) => &after[slash..],
            None => DEFAULT_STREAM_PATH,
        }
    } else if uri.starts_with('/') {
        uri
    } else {
        DEFAULT_STREAM_PATH
    };

    // Strip only a trailing track selector: /vs0/track1 → /vs0.
    // Paths merely containing "/track" (e.g. /tracker) pass through.
    match path.rfind("/track") {
        Some(pos) if pos > 0 => {
            let suffix = &path[pos + "/track".len()..];
            if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
                &path[..pos]
            } else {
                path
            }
        }
        _ => path,
    }
}
