pub mod encoder;
pub mod error;
pub mod media;
pub mod protocol;
pub mod pump;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;

pub use encoder::{CaptureHandle, EncodedUnit, EncoderDriver};
pub use error::{Result, RtspError};
pub use registry::{AudioParams, StreamConfig, StreamId, StreamRegistry, VideoParams};
pub use server::{Authenticator, Server, ServerConfig, ServerState};
