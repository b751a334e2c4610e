pub mod config;
pub mod error;
pub mod hal;
pub mod host;
pub mod observability;
pub mod probe;
pub mod registry;
pub mod session;
pub mod video;

pub use error::{CodecError, ErrorCode};
pub use registry::{HostContext, Plugin, PluginApi, SessionRegistry};
pub use session::{DecoderSession, EncoderSession, SessionState};
