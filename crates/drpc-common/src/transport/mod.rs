//! drpc Transport Layer
//!
//! Codecs, stream framing and socket helpers shared by the client and the
//! server.
//!
//! # Wire Format
//!
//! ```text
//! | Handshake | Header1 | Body1 | Header2 | Body2 | ...
//! ```
//!
//! Every element is one `[4-byte length as u32 big-endian] + [data]` chunk.
//! The handshake is always JSON; headers and bodies use the codec it names.
//!
//! # Components
//!
//! - **[`Codec`]**: [`JsonCodec`] / [`PostcardCodec`] selected by [`CodecType`]
//! - **[`FrameReader`]** / **[`FrameWriter`]**: header/body framing on a byte stream
//! - **[`Listener`]**: accept source for TCP and Unix sockets

pub mod codec;
pub mod frame;
pub mod tcp;

pub use codec::{Codec, CodecType, JsonCodec, PostcardCodec};
pub use frame::{
    read_handshake, write_handshake, BoxedReader, BoxedWriter, FrameReader, FrameWriter,
    INITIAL_CHUNK_CAPACITY, MAX_MESSAGE_SIZE,
};
pub use tcp::{connect, listen, Connection, Listener};

#[cfg(unix)]
pub use tcp::connect_unix;
