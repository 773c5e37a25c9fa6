use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use drpc_common::protocol::error::{Result, RpcError};
use drpc_common::protocol::{Header, Options, Seq};
use drpc_common::transport::{
    write_handshake, BoxedReader, BoxedWriter, Codec, Connection, FrameReader, FrameWriter,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::call::{Call, Completion, Outcome, PendingCall};

/// drpc client
///
/// Owns one connection and multiplexes any number of concurrent calls over
/// it. Requests are written under a send lock, responses are matched back
/// to their calls by sequence number in a background receive task.
///
/// Dropping the client closes it.
///
/// # Example
///
/// ```no_run
/// use drpc_client::dial;
/// use drpc_common::Options;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = dial("127.0.0.1:9999", Options::default()).await?;
/// let sum: i64 = client.call("Arith.Sum", &(3, 4)).await?;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    codec: Codec,
    options: Options,
    /// Send lock; also owns the write half, taken out once the client stops
    sending: tokio::sync::Mutex<Option<FrameWriter<BoxedWriter>>>,
    state: Mutex<State>,
    close_signal: watch::Sender<bool>,
}

struct State {
    seq: Seq,
    pending: HashMap<Seq, Box<dyn Completion>>,
    /// Set by `close`
    closing: bool,
    /// Set once the receive loop has stopped
    shutdown: bool,
}

impl Client {
    /// Sends the handshake over `conn` and starts the receive loop.
    ///
    /// # Arguments
    /// * `conn` - Connected byte stream; the client owns it from here on
    /// * `options` - Codec and timeouts announced to the server
    ///
    /// # Errors
    /// Fails if the handshake cannot be written.
    pub async fn new<C: Connection>(mut conn: C, options: Options) -> Result<Self> {
        write_handshake(&mut conn, &options.to_handshake()).await?;

        let codec = Codec::new(options.codec_type);
        let (read_half, write_half) = tokio::io::split(conn);
        let reader = FrameReader::new(Box::new(read_half) as BoxedReader, codec);
        let writer = FrameWriter::new(Box::new(write_half) as BoxedWriter, codec);

        let (close_signal, closed) = watch::channel(false);
        let inner = Arc::new(Inner {
            codec,
            options,
            sending: tokio::sync::Mutex::new(Some(writer)),
            state: Mutex::new(State {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
            close_signal,
        });

        tokio::spawn(receive_loop(inner.clone(), reader, closed));
        Ok(Self { inner })
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// True while the client accepts new calls.
    pub fn is_available(&self) -> bool {
        let state = self.inner.state();
        !state.closing && !state.shutdown
    }

    /// Number of calls still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.state().pending.len()
    }

    /// Stops the client and releases its connection.
    ///
    /// A request write blocked on a peer that stopped reading is abandoned.
    /// The receive loop then completes every pending call with
    /// [`RpcError::Shutdown`] and drops the transport.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Shutdown`] if the client was already closed.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state();
            if state.closing {
                return Err(RpcError::Shutdown);
            }
            state.closing = true;
        }

        self.inner.close_signal.send_replace(true);
        Ok(())
    }

    /// Submits a call without waiting for it.
    ///
    /// The finished [`Call`] is delivered through `sink`, which must have a
    /// free slot; a full sink fails with [`RpcError::SinkFull`] before
    /// anything is sent. Every other failure, including a closed client, is
    /// delivered through the sink.
    ///
    /// # Arguments
    /// * `service_method` - Target as `"Service.Method"`
    /// * `args` - Request body, encoded with the client's codec
    /// * `sink` - Channel the finished call is delivered to
    ///
    /// # Returns
    /// The assigned sequence number, or 0 if the call never got one.
    ///
    /// # Errors
    /// * [`RpcError::SinkFull`] - `sink` has no free slot
    /// * [`RpcError::Cancelled`] - `sink`'s receiver is gone
    pub async fn go<A, R>(
        &self,
        service_method: &str,
        args: &A,
        sink: &mpsc::Sender<Call<R>>,
    ) -> Result<Seq>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let permit = match sink.clone().try_reserve_owned() {
            Ok(permit) => permit,
            Err(TrySendError::Full(_)) => return Err(RpcError::SinkFull),
            Err(TrySendError::Closed(_)) => return Err(RpcError::Cancelled),
        };

        let call = Box::new(PendingCall {
            service_method: service_method.to_string(),
            seq: 0,
            codec: self.inner.codec,
            permit,
        });

        Ok(self.send(call, args).await)
    }

    /// Calls a method and waits for its reply.
    ///
    /// # Errors
    /// [`RpcError::Server`] carries an error string reported by the server;
    /// transport failures and a closed client surface as their own variants.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        self.call_until(service_method, args, std::future::pending::<()>(), RpcError::Cancelled)
            .await
    }

    /// Calls a method, giving up after `timeout`.
    ///
    /// Giving up only forgets the call locally; the request may still be
    /// handled by the server.
    ///
    /// # Errors
    /// [`RpcError::DeadlineExceeded`] when `timeout` elapses first, otherwise
    /// as [`Client::call`].
    pub async fn call_timeout<A, R>(
        &self,
        service_method: &str,
        args: &A,
        timeout: Duration,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        self.call_until(
            service_method,
            args,
            tokio::time::sleep(timeout),
            RpcError::DeadlineExceeded(timeout),
        )
        .await
    }

    /// Calls a method, giving up when `cancel` resolves first.
    pub async fn call_with_cancel<A, R, F>(
        &self,
        service_method: &str,
        args: &A,
        cancel: F,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
        F: Future,
    {
        self.call_until(service_method, args, cancel, RpcError::Cancelled)
            .await
    }

    async fn call_until<A, R, F>(
        &self,
        service_method: &str,
        args: &A,
        signal: F,
        on_signal: RpcError,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
        F: Future,
    {
        let (tx, mut rx) = mpsc::channel(1);
        let seq = self.go(service_method, args, &tx).await?;

        tokio::select! {
            call = rx.recv() => match call {
                Some(call) => call.reply,
                None => Err(RpcError::Shutdown),
            },
            _ = signal => {
                // A response that still arrives finds no entry and is discarded
                self.inner.remove_pending(seq);
                debug!("rpc client: gave up on {} seq {}", service_method, seq);
                Err(on_signal)
            }
        }
    }

    /// Registers the call and writes its request as one step under the send
    /// lock.
    async fn send<A, R>(&self, mut call: Box<PendingCall<R>>, args: &A) -> Seq
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let body = match self.inner.codec.encode(args) {
            Ok(body) => body,
            Err(e) => {
                call.complete(Outcome::Failed(e));
                return 0;
            }
        };

        let mut closed = self.inner.close_signal.subscribe();
        let mut sending = self.inner.sending.lock().await;

        let header = {
            let mut state = self.inner.state();
            if state.closing || state.shutdown || sending.is_none() {
                drop(state);
                call.complete(Outcome::Failed(RpcError::Shutdown));
                return 0;
            }

            let seq = state.seq;
            state.seq += 1;
            call.seq = seq;
            let header = Header::request(call.service_method.clone(), seq);
            state.pending.insert(seq, call);
            header
        };

        let written = match sending.as_mut() {
            Some(writer) => tokio::select! {
                written = writer.write_encoded(&header, &body) => written,
                // The frame may be half written; the connection is going away
                _ = wait_closed(&mut closed) => Err(RpcError::Shutdown),
            },
            None => Err(RpcError::Shutdown),
        };
        drop(sending);

        if let Err(e) = written {
            warn!("rpc client: write {} seq {} error: {}", header.service_method, header.seq, e);
            // May already be gone if the receive loop terminated it
            if let Some(call) = self.inner.remove_pending(header.seq) {
                call.complete(Outcome::Failed(e));
            }
        }

        header.seq
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove_pending(&self, seq: Seq) -> Option<Box<dyn Completion>> {
        self.state().pending.remove(&seq)
    }

    /// Marks the client shut down, fails every pending call with `err` and
    /// releases the write half.
    ///
    /// Holds the send lock as well so no call can be registered halfway
    /// through.
    async fn terminate_all(&self, err: RpcError) -> Option<FrameWriter<BoxedWriter>> {
        let mut sending = self.sending.lock().await;
        let pending: Vec<Box<dyn Completion>> = {
            let mut state = self.state();
            state.shutdown = true;
            state.pending.drain().map(|(_, call)| call).collect()
        };

        if !pending.is_empty() {
            debug!("rpc client: terminating {} pending calls: {}", pending.len(), err);
        }
        for call in pending {
            call.complete(Outcome::Failed(err.clone()));
        }
        sending.take()
    }
}

/// Reads responses until the stream fails or the client is closed, then
/// terminates every call still pending.
async fn receive_loop(
    inner: Arc<Inner>,
    mut reader: FrameReader<BoxedReader>,
    mut closed: watch::Receiver<bool>,
) {
    let err = loop {
        let header = tokio::select! {
            _ = closed.changed() => break RpcError::Shutdown,
            header = reader.read_header() => header,
        };
        let header = match header {
            Ok(header) => header,
            Err(e) => break e,
        };

        match inner.remove_pending(header.seq) {
            None => {
                // Cancelled or never sent; keep the stream aligned
                if let Err(e) = reader.discard_body().await {
                    break e;
                }
            }
            Some(call) if header.is_error() => {
                let discarded = reader.discard_body().await;
                call.complete(Outcome::Failed(RpcError::Server(header.error)));
                if let Err(e) = discarded {
                    break e;
                }
            }
            Some(call) => match reader.read_body_bytes().await {
                Ok(body) => call.complete(Outcome::Body(&body)),
                Err(e) => {
                    call.complete(Outcome::Failed(e.clone()));
                    break e;
                }
            },
        }
    };

    if err != RpcError::Shutdown {
        debug!("rpc client: receive loop stopped: {}", err);
    }
    let writer = inner.terminate_all(err.clone()).await;

    // After close the peer may not be reading, so the write half is dropped
    // without flushing
    if let Some(mut writer) = writer {
        if err != RpcError::Shutdown {
            if let Err(e) = writer.shutdown().await {
                debug!("rpc client: close error: {}", e);
            }
        }
    }
}

/// Resolves once `close` has been called.
async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}
