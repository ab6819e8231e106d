pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod headers;
pub mod logging;
pub mod message;

pub use codec::{decode, encode, Codec, CodecError, CodecRegistry, JsonCodec, MsgpackCodec};
pub use config::{RegistryKind, RuntimeConfig};
pub use context::Context;
pub use error::MicroError;
pub use logging::init_tracing;
pub use message::{Message, MessageType, TransportRequest, TransportResponse};
