use std::time::Duration;

use thiserror::Error;

/// Errors produced anywhere in the drpc stack.
///
/// The enum is `Clone` because a single fatal connection error has to be
/// delivered to every call still pending on that connection.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Frame too large: {0} bytes (max {1} bytes)")]
    FrameTooLarge(usize, usize),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Invalid magic number {0:#x}")]
    InvalidMagic(u32),

    #[error("Invalid codec type: {0}")]
    UnknownCodec(String),

    #[error("connection is shut down")]
    Shutdown,

    #[error("rpc client: connect timeout: expect within {0:?}")]
    ConnectTimeout(Duration),

    #[error("rpc server: handshake timeout: expect within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("rpc client: call failed: deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    #[error("rpc client: call failed: cancelled")]
    Cancelled,

    /// Error string carried back in a response header.
    #[error("{0}")]
    Server(String),

    #[error("rpc server: service/method request ill-formed: {0}")]
    MalformedServiceMethod(String),

    #[error("rpc server: can't find service: {0}")]
    UnknownService(String),

    #[error("rpc server: can't find method: {0}")]
    UnknownMethod(String),

    #[error("rpc server: service already defined: {0}")]
    DuplicateService(String),

    #[error("rpc server: {0} is not a valid service name")]
    InvalidServiceName(String),

    #[error("rpc server: request handle timeout: expect within {0:?}")]
    HandleTimeout(Duration),

    #[error("rpc server: handler for {0} panicked")]
    HandlerPanicked(String),

    #[error("rpc client: completion channel has no free slot")]
    SinkFull,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

impl RpcError {
    /// True for every locally detected timeout (connect, handshake, call deadline, handle).
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            RpcError::ConnectTimeout(_)
                | RpcError::HandshakeTimeout(_)
                | RpcError::DeadlineExceeded(_)
                | RpcError::HandleTimeout(_)
        )
    }

    /// True when the client can no longer accept calls.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, RpcError::Shutdown | RpcError::ConnectionClosed)
    }
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => RpcError::ConnectionClosed,
            _ => RpcError::Io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Codec(err.to_string())
    }
}

impl From<postcard::Error> for RpcError {
    fn from(err: postcard::Error) -> Self {
        RpcError::Codec(err.to_string())
    }
}

impl From<std::net::AddrParseError> for RpcError {
    fn from(err: std::net::AddrParseError) -> Self {
        RpcError::InvalidAddress(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
