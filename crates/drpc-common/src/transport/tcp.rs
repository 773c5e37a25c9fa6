use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

use crate::protocol::error::{Result, RpcError};

/// Any ordered, reliable byte stream a connection can run over.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Source of inbound connections for the server's accept loop.
pub trait Listener: Send + Sync + 'static {
    type Conn: Connection;

    /// Waits for the next connection, returning it with a printable peer address.
    fn accept_conn(&self) -> impl Future<Output = std::io::Result<(Self::Conn, String)>> + Send;

    fn local_addr_string(&self) -> std::io::Result<String>;
}

impl Listener for TcpListener {
    type Conn = TcpStream;

    fn accept_conn(&self) -> impl Future<Output = std::io::Result<(TcpStream, String)>> + Send {
        async move {
            let (stream, peer_addr) = self.accept().await?;
            // Frames are small and latency sensitive
            let _ = stream.set_nodelay(true);
            Ok((stream, peer_addr.to_string()))
        }
    }

    fn local_addr_string(&self) -> std::io::Result<String> {
        Ok(self.local_addr()?.to_string())
    }
}

#[cfg(unix)]
impl Listener for tokio::net::UnixListener {
    type Conn = tokio::net::UnixStream;

    fn accept_conn(
        &self,
    ) -> impl Future<Output = std::io::Result<(tokio::net::UnixStream, String)>> + Send {
        async move {
            let (stream, peer_addr) = self.accept().await?;
            Ok((stream, format!("{:?}", peer_addr)))
        }
    }

    fn local_addr_string(&self) -> std::io::Result<String> {
        Ok(format!("{:?}", self.local_addr()?))
    }
}

/// Binds a TCP listener.
pub async fn listen(bind_addr: &str) -> Result<TcpListener> {
    TcpListener::bind(bind_addr)
        .await
        .map_err(|e| RpcError::Io(format!("Failed to bind to {}: {}", bind_addr, e)))
}

/// Connects to a remote endpoint, bounded by `timeout` (zero means unbounded).
///
/// The address may resolve to several socket addresses; each is tried in
/// turn until one succeeds.
pub async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let attempt = connect_any(addr);
    let stream = if timeout.is_zero() {
        attempt.await?
    } else {
        tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| RpcError::ConnectTimeout(timeout))??
    };

    let _ = stream.set_nodelay(true);
    Ok(stream)
}

async fn connect_any(addr: &str) -> Result<TcpStream> {
    let socket_addrs = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| RpcError::InvalidAddress(format!("'{}': {}", addr, e)))?;

    let mut last_err = None;
    for socket_addr in socket_addrs {
        match TcpStream::connect(socket_addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                tracing::debug!("connect to {} failed: {}", socket_addr, e);
                last_err = Some(e);
            }
        }
    }

    Err(RpcError::Io(format!(
        "Failed to connect to {}: {}",
        addr,
        last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no addresses resolved".to_string())
    )))
}

/// Connects to a Unix domain socket, bounded by `timeout` (zero means unbounded).
#[cfg(unix)]
pub async fn connect_unix(path: &str, timeout: Duration) -> Result<tokio::net::UnixStream> {
    let attempt = tokio::net::UnixStream::connect(path);
    let stream = if timeout.is_zero() {
        attempt.await?
    } else {
        tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| RpcError::ConnectTimeout(timeout))??
    };
    Ok(stream)
}
