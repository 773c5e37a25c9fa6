//! Connecting and handshaking.
//!
//! Both steps are bounded by [`Options::connect_timeout`]; zero disables
//! the bound. A handshake that does not finish in time drops the
//! connection it was running on.

use std::future::Future;

use drpc_common::protocol::error::{Result, RpcError};
use drpc_common::protocol::Options;
use drpc_common::transport::{connect, Connection};
use tracing::debug;

use crate::client::Client;

/// Connects to a TCP address and returns a ready client.
///
/// # Arguments
/// * `addr` - `host:port`; every resolved address is tried in turn
/// * `options` - Codec and timeouts; `connect_timeout` bounds the connect and
///   the client setup separately
///
/// # Errors
/// [`RpcError::ConnectTimeout`] if either step overruns, or the connect error.
pub async fn dial(addr: &str, options: Options) -> Result<Client> {
    let conn = connect(addr, options.connect_timeout).await?;
    debug!("rpc client: connected to {}", addr);
    dial_with(conn, options, Client::new).await
}

/// Connects to a Unix domain socket and returns a ready client.
#[cfg(unix)]
pub async fn dial_unix(path: &str, options: Options) -> Result<Client> {
    let conn = drpc_common::transport::connect_unix(path, options.connect_timeout).await?;
    debug!("rpc client: connected to unix socket {}", path);
    dial_with(conn, options, Client::new).await
}

/// Dials an address of the form `protocol@addr`, e.g. `tcp@127.0.0.1:9999`
/// or `unix@/tmp/drpc.sock`.
///
/// # Errors
/// [`RpcError::InvalidAddress`] for a missing `@` or an unsupported protocol,
/// otherwise as [`dial`].
pub async fn x_dial(rpc_addr: &str, options: Options) -> Result<Client> {
    let (protocol, addr) = rpc_addr.split_once('@').ok_or_else(|| {
        RpcError::InvalidAddress(format!(
            "rpc client err: wrong format '{}', expect protocol@addr",
            rpc_addr
        ))
    })?;

    match protocol {
        "tcp" => dial(addr, options).await,
        #[cfg(unix)]
        "unix" => dial_unix(addr, options).await,
        other => Err(RpcError::InvalidAddress(format!(
            "rpc client err: unsupported protocol '{}'",
            other
        ))),
    }
}

/// Runs `new_client` over an open connection, bounded by the connect timeout.
pub(crate) async fn dial_with<C, F, Fut>(conn: C, options: Options, new_client: F) -> Result<Client>
where
    C: Connection,
    F: FnOnce(C, Options) -> Fut,
    Fut: Future<Output = Result<Client>>,
{
    let timeout = options.connect_timeout;
    if timeout.is_zero() {
        return new_client(conn, options).await;
    }

    tokio::time::timeout(timeout, new_client(conn, options))
        .await
        .map_err(|_| RpcError::ConnectTimeout(timeout))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use drpc_common::transport::{listen, read_handshake, Listener};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};

    async fn slow_client(conn: DuplexStream, options: Options) -> Result<Client> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Client::new(conn, options).await
    }

    #[tokio::test]
    async fn test_slow_handshake_times_out() {
        let (conn, mut peer) = tokio::io::duplex(1024);
        let options = Options::default().with_connect_timeout(Duration::from_millis(50));

        let started = std::time::Instant::now();
        let err = dial_with(conn, options, slow_client).await.err().unwrap();
        assert_eq!(err, RpcError::ConnectTimeout(Duration::from_millis(50)));
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_millis(200));

        // The abandoned connection was dropped
        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_zero_timeout_waits_for_slow_handshake() {
        let (conn, mut peer) = tokio::io::duplex(1024);
        let options = Options::default().with_connect_timeout(Duration::ZERO);

        let client = dial_with(conn, options, slow_client).await.unwrap();
        assert!(client.is_available());
        assert!(read_handshake(&mut peer).await.unwrap().validate().is_ok());
    }

    #[tokio::test]
    async fn test_dial_sends_handshake() {
        let listener = listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr_string().unwrap();

        let options = Options::default().with_handle_timeout(Duration::from_secs(3));
        let client = x_dial(&format!("tcp@{}", addr), options).await.unwrap();
        assert_eq!(client.options(), &options);

        let (mut conn, _) = listener.accept_conn().await.unwrap();
        let received = read_handshake(&mut conn).await.unwrap().validate().unwrap();
        assert_eq!(received, options);
    }

    #[tokio::test]
    async fn test_x_dial_rejects_bad_addresses() {
        let err = x_dial("127.0.0.1:9999", Options::default()).await.err().unwrap();
        assert!(matches!(err, RpcError::InvalidAddress(_)));

        let err = x_dial("http@127.0.0.1:9999", Options::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RpcError::InvalidAddress(_)));
    }
}
