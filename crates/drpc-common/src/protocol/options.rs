//! Connection options and the handshake that carries them.
//!
//! The dialing side sends one [`Handshake`] right after the transport
//! connects. It is always JSON inside a single length-prefixed chunk, so the
//! accepting side can read it before any codec has been agreed on:
//!
//! ```text
//! | Handshake (JSON) | Header1 | Body1 | Header2 | Body2 | ...
//! | <- fixed JSON -> | <----- encoding chosen by codec_type ----> |
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{Result, RpcError};
use crate::transport::codec::CodecType;

/// Identifies the protocol family. Must match bit for bit on both sides.
pub const MAGIC_NUMBER: u32 = 0x3bef5c;

/// Default bound on connecting plus handshaking.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-connection configuration chosen by the dialing side.
///
/// A zero duration means "unbounded" for both timeouts.
///
/// # Example
///
/// ```
/// use drpc_common::protocol::Options;
/// use drpc_common::transport::CodecType;
/// use std::time::Duration;
///
/// let options = Options::default()
///     .with_codec(CodecType::Postcard)
///     .with_handle_timeout(Duration::from_secs(1));
///
/// assert_eq!(options.codec_type, CodecType::Postcard);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    pub codec_type: CodecType,
    /// Bounds connect + handshake on the client
    pub connect_timeout: Duration,
    /// Bounds how long the server lets a handler run before answering with a timeout error
    pub handle_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            codec_type: CodecType::Json,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handle_timeout: Duration::ZERO,
        }
    }
}

impl Options {
    pub fn with_codec(mut self, codec_type: CodecType) -> Self {
        self.codec_type = codec_type;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handle_timeout(mut self, timeout: Duration) -> Self {
        self.handle_timeout = timeout;
        self
    }

    /// Builds the preamble sent on the wire. The magic number is always stamped here.
    pub fn to_handshake(&self) -> Handshake {
        Handshake {
            magic_number: MAGIC_NUMBER,
            codec_type: self.codec_type.name().to_string(),
            connect_timeout_ms: self.connect_timeout.as_millis() as u64,
            handle_timeout_ms: self.handle_timeout.as_millis() as u64,
        }
    }
}

/// Wire form of [`Options`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Handshake {
    pub magic_number: u32,
    pub codec_type: String,
    pub connect_timeout_ms: u64,
    pub handle_timeout_ms: u64,
}

impl Handshake {
    /// Checks the magic number and resolves the codec.
    pub fn validate(&self) -> Result<Options> {
        if self.magic_number != MAGIC_NUMBER {
            return Err(RpcError::InvalidMagic(self.magic_number));
        }

        let codec_type = CodecType::from_name(&self.codec_type)
            .ok_or_else(|| RpcError::UnknownCodec(self.codec_type.clone()))?;

        Ok(Options {
            codec_type,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            handle_timeout: Duration::from_millis(self.handle_timeout_ms),
        })
    }
}
