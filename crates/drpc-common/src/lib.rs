//! drpc Common Types and Transport
//!
//! This crate provides the protocol definitions and stream framing shared
//! by the drpc client and server.
//!
//! # Overview
//!
//! A drpc connection carries one handshake followed by any number of
//! `(Header, Body)` frames. The dialing side picks the codec and timeout
//! policy in the handshake; after that both sides exchange frames whose
//! headers carry a sequence number used to correlate responses with
//! requests. Responses may arrive in any order.
//!
//! # Components
//!
//! - [`protocol`] - `Header`, `Options`/`Handshake`, `RpcError`
//! - [`transport`] - codecs, framing and socket helpers
//!
//! # Example
//!
//! ```
//! use drpc_common::{Header, Options};
//!
//! let handshake = Options::default().to_handshake();
//! assert!(handshake.validate().is_ok());
//!
//! let request = Header::request("Arith.Sum", 1);
//! let response = request.reply();
//! assert_eq!(request.seq, response.seq);
//! ```

pub mod protocol;
pub mod transport;

pub use protocol::*;
