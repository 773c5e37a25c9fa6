//! Length-prefixed framing of handshakes, headers and bodies.
//!
//! Every chunk on the wire is `[4-byte length as u32 big-endian] + [data]`.
//! A frame is two chunks, header then body, both encoded with the
//! negotiated [`Codec`]. Bodies are opaque to this layer, so a body that is
//! not wanted can be skipped by length without decoding it.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

use crate::protocol::error::{Result, RpcError};
use crate::protocol::{Handshake, Header};
use crate::transport::codec::{Codec, JsonCodec};

/// Maximum size of a single chunk (100 MB)
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Upfront allocation for an incoming chunk (64 KB)
pub const INITIAL_CHUNK_CAPACITY: usize = 64 * 1024;

/// Read half of a connection after type erasure.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a connection after type erasure.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Writes one length-prefixed chunk. Does not flush.
pub async fn write_chunk<W>(writer: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(RpcError::FrameTooLarge(data.len(), MAX_MESSAGE_SIZE));
    }

    writer.write_all(&(data.len() as u32).to_be_bytes()).await?;
    writer.write_all(data).await?;
    Ok(())
}

async fn read_chunk_len<R>(reader: &mut R) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(RpcError::FrameTooLarge(len, MAX_MESSAGE_SIZE));
    }
    Ok(len)
}

/// Reads one length-prefixed chunk.
///
/// The buffer grows as payload bytes arrive, so a length prefix alone
/// never reserves more than [`INITIAL_CHUNK_CAPACITY`].
///
/// # Errors
///
/// - [`RpcError::FrameTooLarge`] if the prefix exceeds [`MAX_MESSAGE_SIZE`]
/// - [`RpcError::ConnectionClosed`] if the stream ends mid-chunk
pub async fn read_chunk<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let len = read_chunk_len(reader).await?;
    let mut buf = Vec::with_capacity(len.min(INITIAL_CHUNK_CAPACITY));
    let read = (&mut *reader).take(len as u64).read_to_end(&mut buf).await?;
    if read < len {
        return Err(RpcError::ConnectionClosed);
    }
    Ok(buf)
}

/// Sends the connection preamble and flushes it.
///
/// Uses exact writes on the raw stream so nothing is left buffered when the
/// stream is handed to the frame layer.
pub async fn write_handshake<W>(writer: &mut W, handshake: &Handshake) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let data = JsonCodec::encode(handshake)?;
    write_chunk(writer, &data).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the connection preamble without reading past it.
pub async fn read_handshake<R>(reader: &mut R) -> Result<Handshake>
where
    R: AsyncRead + Unpin,
{
    let data = read_chunk(reader).await?;
    JsonCodec::decode(&data)
}

/// Reads `(Header, Body)` frames in order.
///
/// A body must be read or discarded before the next header; reading a header
/// while a body is outstanding is a protocol error.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    codec: Codec,
    body_pending: bool,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R, codec: Codec) -> Self {
        Self {
            inner: BufReader::new(inner),
            codec,
            body_pending: false,
        }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Reads the next header.
    ///
    /// # Returns
    /// The decoded header; its body must be consumed before the next call.
    ///
    /// # Errors
    /// - [`RpcError::Protocol`] if the previous body is still unread
    /// - [`RpcError::ConnectionClosed`] on a clean or mid-chunk EOF
    /// - [`RpcError::Codec`] if the header does not decode
    pub async fn read_header(&mut self) -> Result<Header> {
        if self.body_pending {
            return Err(RpcError::Protocol(
                "header read before the previous body was consumed".to_string(),
            ));
        }

        let data = read_chunk(&mut self.inner).await?;
        let header = self.codec.decode(&data)?;
        self.body_pending = true;
        Ok(header)
    }

    /// Reads the current body without decoding it.
    ///
    /// # Errors
    /// [`RpcError::Protocol`] if no header was read first, otherwise as
    /// [`read_chunk`].
    pub async fn read_body_bytes(&mut self) -> Result<Vec<u8>> {
        self.expect_body()?;
        let data = read_chunk(&mut self.inner).await?;
        self.body_pending = false;
        Ok(data)
    }

    /// Reads and decodes the current body.
    ///
    /// The body is consumed even when decoding fails, so the stream stays
    /// aligned on the next frame.
    pub async fn read_body<T: DeserializeOwned>(&mut self) -> Result<T> {
        let data = self.read_body_bytes().await?;
        self.codec.decode(&data)
    }

    /// Skips the current body, consuming exactly its bytes.
    ///
    /// # Errors
    /// - [`RpcError::Protocol`] if no header was read first
    /// - [`RpcError::ConnectionClosed`] if the stream ends inside the body
    pub async fn discard_body(&mut self) -> Result<()> {
        self.expect_body()?;
        let len = read_chunk_len(&mut self.inner).await? as u64;

        let mut limited = (&mut self.inner).take(len);
        let skipped = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
        if skipped < len {
            return Err(RpcError::ConnectionClosed);
        }

        self.body_pending = false;
        Ok(())
    }

    fn expect_body(&self) -> Result<()> {
        if self.body_pending {
            Ok(())
        } else {
            Err(RpcError::Protocol("body read without a header".to_string()))
        }
    }
}

/// Writes `(Header, Body)` frames.
///
/// Header and body are fully encoded before any byte is written, so an
/// encoding failure never leaves a partial frame on the stream. Callers that
/// share one writer must serialize access to it.
pub struct FrameWriter<W> {
    inner: BufWriter<W>,
    codec: Codec,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(inner: W, codec: Codec) -> Self {
        Self {
            inner: BufWriter::new(inner),
            codec,
        }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Encodes and writes a complete frame, then flushes.
    ///
    /// # Arguments
    /// * `header` - Frame header
    /// * `body` - Value encoded with this writer's codec
    ///
    /// # Errors
    /// Encoding failures are returned before anything is written.
    pub async fn write_frame<B>(&mut self, header: &Header, body: &B) -> Result<()>
    where
        B: Serialize + ?Sized,
    {
        let body = self.codec.encode(body)?;
        self.write_encoded(header, &body).await
    }

    /// Writes a frame whose body was already encoded with this writer's codec.
    ///
    /// # Errors
    /// - [`RpcError::FrameTooLarge`] if either chunk exceeds [`MAX_MESSAGE_SIZE`]
    /// - [`RpcError::Io`] or [`RpcError::ConnectionClosed`] if the transport fails mid-write
    pub async fn write_encoded(&mut self, header: &Header, body: &[u8]) -> Result<()> {
        let header = self.codec.encode(header)?;
        for chunk in [&header[..], body] {
            if chunk.len() > MAX_MESSAGE_SIZE {
                return Err(RpcError::FrameTooLarge(chunk.len(), MAX_MESSAGE_SIZE));
            }
        }

        write_chunk(&mut self.inner, &header).await?;
        write_chunk(&mut self.inner, body).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Flushes and closes the write side of the transport.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
