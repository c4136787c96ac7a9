//! Encoder driver boundary.
//!
//! The hardware video/audio encoder lives outside this crate. The streaming
//! core consumes it through [`EncoderDriver`], an object-safe trait the
//! platform layer implements. Handles are opaque tokens minted by the driver;
//! the core never interprets them, only passes them back.
//!
//! The contract the core relies on:
//!
//! - `get_unit` returns [`DriverError::WouldBlock`] when no encoded unit is
//!   ready yet — the encoder pump treats that as retryable. Any other error
//!   fails the current pump cycle for that stream only.
//! - Every successful `get_unit` is paired with a `release_unit` before the
//!   next acquisition on the same stream handle.
//! - `cancel_stream` + `cleanup_encoder` fully release a binding created by
//!   `bind_stream` + `init_encoder`, in that order.

use crate::media::Codec;
use crate::registry::{AudioParams, VideoParams};

/// Opaque token for an initialized encoder instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncoderHandle(pub u64);

/// Opaque token for a capture-to-encoder stream binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub u64);

/// Opaque token for the video capture pipeline (owned upstream, shared
/// across all encoder bindings).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CaptureHandle(pub u64);

/// Opaque token for an audio input + encoder pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioHandle(pub u64);

/// One encoded media unit handed out by the driver.
///
/// For H.264 this is a complete Annex B access unit (start-code delimited
/// NAL units); for audio it is one encoded frame.
#[derive(Debug, Clone)]
pub struct EncodedUnit {
    pub data: Vec<u8>,
    /// Clock-rate-scaled RTP timestamp assigned by the driver.
    pub timestamp: u32,
    pub codec: Codec,
}

/// Errors surfaced by the encoder driver.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// No encoded unit is available yet; retry shortly.
    #[error("encoder not ready")]
    WouldBlock,

    /// Encoder instance creation failed.
    #[error("encoder init failed: {0}")]
    InitFailed(String),

    /// Capture-to-encoder stream binding failed.
    #[error("stream bind failed: {0}")]
    BindFailed(String),

    /// Any other driver-side failure.
    #[error("driver failure: {0}")]
    Failed(String),
}

impl DriverError {
    /// Whether the encoder pump should retry this error within the cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::WouldBlock)
    }
}

/// Platform encoder abstraction consumed by the streaming core.
pub trait EncoderDriver: Send + Sync {
    fn init_encoder(&self, config: &VideoParams) -> Result<EncoderHandle, DriverError>;

    /// Bind an initialized encoder to the capture pipeline, producing a
    /// stream handle units are drained from.
    fn bind_stream(
        &self,
        capture: CaptureHandle,
        encoder: EncoderHandle,
    ) -> Result<StreamHandle, DriverError>;

    /// Acquire the next encoded unit, waiting at most `timeout_ms`.
    fn get_unit(&self, stream: StreamHandle, timeout_ms: u64) -> Result<EncodedUnit, DriverError>;

    /// Return a unit obtained from [`get_unit`](Self::get_unit) to the driver.
    fn release_unit(&self, stream: StreamHandle, unit: EncodedUnit);

    fn cancel_stream(&self, stream: StreamHandle);

    fn cleanup_encoder(&self, handle: EncoderHandle);

    /// Open the audio input and encoder for a stream. Default: unsupported.
    fn init_audio(&self, _config: &AudioParams) -> Result<AudioHandle, DriverError> {
        Err(DriverError::InitFailed("audio not supported".into()))
    }

    fn get_audio_unit(
        &self,
        _audio: AudioHandle,
        _timeout_ms: u64,
    ) -> Result<EncodedUnit, DriverError> {
        Err(DriverError::WouldBlock)
    }

    fn release_audio_unit(&self, _audio: AudioHandle, _unit: EncodedUnit) {}

    fn cleanup_audio(&self, _audio: AudioHandle) {}
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted driver stub shared by module tests.

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    /// Hands out pre-queued `get_unit` outcomes in order; empty queue means
    /// `WouldBlock`. Counts releases so tests can check acquire/release
    /// pairing.
    pub(crate) struct ScriptedDriver {
        next_handle: AtomicU64,
        units: Mutex<VecDeque<Result<EncodedUnit, DriverError>>>,
        pub(crate) released: AtomicU64,
        pub(crate) get_calls: AtomicU64,
    }

    impl ScriptedDriver {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                next_handle: AtomicU64::new(1),
                units: Mutex::new(VecDeque::new()),
                released: AtomicU64::new(0),
                get_calls: AtomicU64::new(0),
            })
        }

        pub(crate) fn push_unit(&self, unit: EncodedUnit) {
            self.units.lock().push_back(Ok(unit));
        }

        pub(crate) fn push_error(&self, err: DriverError) {
            self.units.lock().push_back(Err(err));
        }
    }

    impl EncoderDriver for ScriptedDriver {
        fn init_encoder(&self, _config: &VideoParams) -> Result<EncoderHandle, DriverError> {
            Ok(EncoderHandle(self.next_handle.fetch_add(1, Ordering::SeqCst)))
        }

        fn bind_stream(
            &self,
            _capture: CaptureHandle,
            _encoder: EncoderHandle,
        ) -> Result<StreamHandle, DriverError> {
            Ok(StreamHandle(self.next_handle.fetch_add(1, Ordering::SeqCst)))
        }

        fn get_unit(
            &self,
            _stream: StreamHandle,
            _timeout_ms: u64,
        ) -> Result<EncodedUnit, DriverError> {
            self.get_calls.fetch_add(1, Ordering::SeqCst);
            self.units
                .lock()
                .pop_front()
                .unwrap_or(Err(DriverError::WouldBlock))
        }

        fn release_unit(&self, _stream: StreamHandle, _unit: EncodedUnit) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }

        fn cancel_stream(&self, _stream: StreamHandle) {}

        fn cleanup_encoder(&self, _handle: EncoderHandle) {}

        fn init_audio(&self, _config: &AudioParams) -> Result<AudioHandle, DriverError> {
            Ok(AudioHandle(self.next_handle.fetch_add(1, Ordering::SeqCst)))
        }
    }
}
