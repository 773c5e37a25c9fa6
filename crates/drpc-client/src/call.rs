//! Outstanding calls and their completion.

use drpc_common::protocol::error::{Result, RpcError};
use drpc_common::protocol::Seq;
use drpc_common::transport::Codec;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc::OwnedPermit;

/// A finished call, delivered through the sink passed to
/// [`Client::go`](crate::Client::go).
#[derive(Debug)]
pub struct Call<R> {
    pub seq: Seq,
    pub service_method: String,
    /// Decoded reply, or the reason the call failed
    pub reply: Result<R>,
}

impl<R> Call<R> {
    pub fn into_reply(self) -> Result<R> {
        self.reply
    }
}

/// What the receive loop (or a failed send) hands to a pending call.
pub(crate) enum Outcome<'a> {
    /// Raw response body, still to be decoded into the reply type
    Body(&'a [u8]),
    Failed(RpcError),
}

/// Type-erased pending call as stored in the pending table.
///
/// `complete` consumes the entry, so a call can only finish once.
pub(crate) trait Completion: Send {
    fn complete(self: Box<Self>, outcome: Outcome<'_>);
}

/// Pending call whose sink slot was reserved at submission.
pub(crate) struct PendingCall<R> {
    pub(crate) service_method: String,
    pub(crate) seq: Seq,
    pub(crate) codec: Codec,
    pub(crate) permit: OwnedPermit<Call<R>>,
}

impl<R> Completion for PendingCall<R>
where
    R: DeserializeOwned + Send + 'static,
{
    fn complete(self: Box<Self>, outcome: Outcome<'_>) {
        let reply = match outcome {
            Outcome::Body(body) => self.codec.decode(body).map_err(|e| match e {
                RpcError::Codec(msg) => RpcError::Codec(format!("rpc client: reading body: {}", msg)),
                other => other,
            }),
            Outcome::Failed(err) => Err(err),
        };

        let PendingCall {
            service_method,
            seq,
            permit,
            ..
        } = *self;

        permit.send(Call {
            seq,
            service_method,
            reply,
        });
    }
}
