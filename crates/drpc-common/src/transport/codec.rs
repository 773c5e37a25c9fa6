use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::protocol::error::Result;

/// Identifier negotiated in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodecType {
    Json,
    Postcard,
}

impl CodecType {
    /// Wire name of this codec.
    pub fn name(&self) -> &'static str {
        match self {
            CodecType::Json => "application/json",
            CodecType::Postcard => "application/postcard",
        }
    }

    /// Resolves a wire name, `None` if no such codec exists.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "application/json" => Some(CodecType::Json),
            "application/postcard" => Some(CodecType::Postcard),
            _ => None,
        }
    }
}

/// Codec for encoding/decoding headers and bodies.
///
/// Both sides of a connection use the codec chosen in the handshake. New
/// formats are added as variants.
///
/// # Example
///
/// ```
/// use drpc_common::transport::{Codec, CodecType};
/// use drpc_common::protocol::Header;
///
/// let codec = Codec::new(CodecType::Postcard);
/// let header = Header::request("Arith.Sum", 1);
///
/// let encoded = codec.encode(&header).unwrap();
/// let decoded: Header = codec.decode(&encoded).unwrap();
/// assert_eq!(header, decoded);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Json(JsonCodec),
    Postcard(PostcardCodec),
}

impl Codec {
    pub fn new(codec_type: CodecType) -> Self {
        match codec_type {
            CodecType::Json => Codec::Json(JsonCodec),
            CodecType::Postcard => Codec::Postcard(PostcardCodec),
        }
    }

    pub fn codec_type(&self) -> CodecType {
        match self {
            Codec::Json(_) => CodecType::Json,
            Codec::Postcard(_) => CodecType::Postcard,
        }
    }

    /// Encode a value to bytes
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Codec::Json(_) => JsonCodec::encode(value),
            Codec::Postcard(_) => PostcardCodec::encode(value),
        }
    }

    /// Decode a value from bytes
    pub fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        match self {
            Codec::Json(_) => JsonCodec::decode(data),
            Codec::Postcard(_) => PostcardCodec::decode(data),
        }
    }

    /// Encoding of the empty body sent with error responses.
    pub fn empty_body(&self) -> Result<Vec<u8>> {
        self.encode(&())
    }
}

impl Default for Codec {
    fn default() -> Self {
        Codec::Json(JsonCodec)
    }
}

/// Self-describing text codec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Compact binary codec. Not self-describing: both sides must agree on the
/// exact types, and `serde_json::Value`-like dynamic types are unsupported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PostcardCodec;

impl PostcardCodec {
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(value)?)
    }

    pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
        Ok(postcard::from_bytes(data)?)
    }
}
