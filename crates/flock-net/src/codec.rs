//! Value codecs.

use std::fmt;

use flock_types::Value;

/// Errors produced while encoding or decoding values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),
}

/// Converts values to bytes and back.
///
/// Services can register their own codec; every codec used inside one group
/// must agree on the byte format of the values they exchange.
pub trait Codec: Send + Sync + fmt::Debug {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError>;
}

/// The default codec: postcard over the serde representation of [`Value`].
#[derive(Debug, Default, Clone, Copy)]
pub struct PostcardCodec;

impl Codec for PostcardCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        postcard::to_allocvec(value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        postcard::from_bytes(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
