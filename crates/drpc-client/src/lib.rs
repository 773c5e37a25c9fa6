//! drpc Client
//!
//! A [`Client`] owns one connection and lets any number of tasks call
//! methods over it at once. Calls are correlated with responses by sequence
//! number, so the server may answer in any order.
//!
//! Use [`dial`] (TCP), [`dial_unix`] or [`x_dial`] (`"tcp@host:port"`,
//! `"unix@/path"`) to connect; they send the handshake and bound the whole
//! setup by [`Options::connect_timeout`](drpc_common::Options).

pub mod call;
pub mod client;
pub mod dial;

pub use call::Call;
pub use client::Client;
#[cfg(unix)]
pub use dial::dial_unix;
pub use dial::{dial, x_dial};
