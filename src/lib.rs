//! drpc
//!
//! Multiplexed RPC over a single byte stream.
//!
//! - [`common`] - wire protocol, codecs and framing
//! - [`client`] - [`Client`], [`dial`], [`x_dial`]
//! - [`server`] - [`Server`], [`Service`]
//!
//! # Example
//!
//! ```no_run
//! use drpc::{Options, Service};
//! use std::sync::Arc;
//!
//! struct Arith;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! drpc::register(
//!     Service::builder(Arith)
//!         .method("Sum", |_: Arc<Arith>, (a, b): (i64, i64), _: i64| async move {
//!             Ok::<_, String>(a + b)
//!         })
//!         .build()?,
//! )?;
//!
//! let listener = drpc::common::transport::listen("127.0.0.1:9999").await?;
//! tokio::spawn(drpc::accept(listener));
//!
//! let client = drpc::dial("127.0.0.1:9999", Options::default()).await?;
//! let sum: i64 = client.call("Arith.Sum", &(3, 4)).await?;
//! assert_eq!(sum, 7);
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, OnceLock};

pub use drpc_client as client;
pub use drpc_common as common;
pub use drpc_server as server;

pub use drpc_client::{dial, x_dial, Call, Client};
pub use drpc_common::transport::{CodecType, Listener};
pub use drpc_common::{Header, Options, Result, RpcError};
pub use drpc_server::{Server, Service, ServiceBuilder};

static DEFAULT_SERVER: OnceLock<Arc<Server>> = OnceLock::new();

/// Process-wide server used by [`register`] and [`accept`].
pub fn default_server() -> Arc<Server> {
    DEFAULT_SERVER
        .get_or_init(|| Arc::new(Server::new()))
        .clone()
}

/// Publishes a service on the default server.
pub fn register(service: Service) -> Result<()> {
    default_server().register(service)
}

/// Serves the default server on `listener`.
pub async fn accept<L: Listener>(listener: L) {
    default_server().accept(listener).await
}
