use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use drpc_common::protocol::error::{Result, RpcError};
use drpc_common::protocol::{split_service_method, Header, DEFAULT_CONNECT_TIMEOUT};
use drpc_common::transport::{
    read_handshake, BoxedReader, BoxedWriter, Codec, Connection, FrameReader, FrameWriter,
    Listener,
};
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::service::{Argument, MethodDescriptor, Reply, ReplySlot, Service};

/// Write half of a connection, shared by every task answering on it.
///
/// Holding the lock for a whole frame keeps header and body adjacent on the
/// stream.
type SharedWriter = Arc<Mutex<FrameWriter<BoxedWriter>>>;

/// drpc server.
///
/// Holds the service registry and serves any number of connections. Each
/// connection gets its own task, and each request on it is handled in a
/// further task, so responses may leave in a different order than requests
/// arrived.
///
/// # Example
///
/// ```no_run
/// use drpc_server::{Server, Service};
/// use std::sync::Arc;
///
/// struct Echo;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let server = Arc::new(Server::new());
/// server.register(
///     Service::builder(Echo)
///         .method("Say", |_: Arc<Echo>, msg: String, _: String| async move { Ok::<_, String>(msg) })
///         .build()?,
/// )?;
///
/// let listener = drpc_common::transport::listen("127.0.0.1:9999").await?;
/// server.accept(listener).await;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    services: RwLock<HashMap<String, Arc<Service>>>,
    handshake_timeout: Duration,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            handshake_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// One parsed request, alive for a single dispatch.
struct Request {
    header: Header,
    argument: Argument,
    reply: ReplySlot,
    method: Arc<MethodDescriptor>,
}

/// Result of reading one frame that did not break the connection.
enum Incoming {
    Request(Request),
    /// Frame was consumed but cannot be dispatched; answer with an error.
    Rejected(Header, RpcError),
}

impl Server {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounds how long a new connection may take to send its handshake.
    ///
    /// Defaults to [`DEFAULT_CONNECT_TIMEOUT`]; zero waits forever.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Publishes a service.
    ///
    /// # Errors
    /// [`RpcError::DuplicateService`] if a service with the same name exists.
    pub fn register(&self, service: Service) -> Result<()> {
        let mut services = self.services.write().unwrap_or_else(PoisonError::into_inner);
        if services.contains_key(service.name()) {
            return Err(RpcError::DuplicateService(service.name().to_string()));
        }

        info!("rpc server: registered service {}", service.name());
        services.insert(service.name().to_string(), Arc::new(service));
        Ok(())
    }

    pub fn service(&self, name: &str) -> Option<Arc<Service>> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Registered service names, sorted.
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort_unstable();
        names
    }

    /// Resolves `"Service.Method"` to a method descriptor.
    ///
    /// # Errors
    /// - [`RpcError::MalformedServiceMethod`] if there is no `.` separator
    /// - [`RpcError::UnknownService`] / [`RpcError::UnknownMethod`] if nothing matches
    pub fn find_method(&self, service_method: &str) -> Result<Arc<MethodDescriptor>> {
        let (service_name, method_name) = split_service_method(service_method)
            .ok_or_else(|| RpcError::MalformedServiceMethod(service_method.to_string()))?;

        let service = self
            .service(service_name)
            .ok_or_else(|| RpcError::UnknownService(service_name.to_string()))?;

        service
            .method(method_name)
            .cloned()
            .ok_or_else(|| RpcError::UnknownMethod(method_name.to_string()))
    }

    /// Accepts connections forever, serving each in its own task.
    ///
    /// Accept errors are logged and do not stop the loop.
    pub async fn accept<L: Listener>(self: Arc<Self>, listener: L) {
        if let Ok(addr) = listener.local_addr_string() {
            info!("rpc server: accepting connections on {}", addr);
        }

        loop {
            match listener.accept_conn().await {
                Ok((conn, peer_addr)) => {
                    debug!("rpc server: connection established from {}", peer_addr);
                    tokio::spawn(self.clone().serve_conn(conn));
                }
                Err(e) => {
                    warn!("rpc server: accept error: {}", e);
                }
            }
        }
    }

    /// Serves one already-established connection until the peer goes away.
    ///
    /// A bad handshake closes the connection without a reply, since no codec
    /// has been agreed on to carry one.
    pub async fn serve_conn<C: Connection>(self: Arc<Self>, mut conn: C) {
        let handshake = if self.handshake_timeout.is_zero() {
            read_handshake(&mut conn).await
        } else {
            tokio::time::timeout(self.handshake_timeout, read_handshake(&mut conn))
                .await
                .unwrap_or(Err(RpcError::HandshakeTimeout(self.handshake_timeout)))
        };
        let handshake = match handshake {
            Ok(handshake) => handshake,
            Err(e) => {
                warn!("rpc server: decode handshake error: {}", e);
                return;
            }
        };

        let options = match handshake.validate() {
            Ok(options) => options,
            Err(e) => {
                warn!("rpc server: rejecting connection: {}", e);
                return;
            }
        };

        let codec = Codec::new(options.codec_type);
        let (read_half, write_half) = tokio::io::split(conn);
        let reader = FrameReader::new(Box::new(read_half) as BoxedReader, codec);
        let writer = FrameWriter::new(Box::new(write_half) as BoxedWriter, codec);

        self.serve_codec(reader, writer, options.handle_timeout).await;
    }

    /// Reads requests until the stream fails, dispatching each concurrently.
    ///
    /// Before returning it waits for every in-flight request so no task
    /// writes to a closed stream.
    ///
    /// # Arguments
    /// * `reader` - Frame source, positioned just after the handshake
    /// * `writer` - Frame sink shared by every response on this connection
    /// * `handle_timeout` - Per-request handler bound; zero means unbounded
    pub async fn serve_codec(
        self: Arc<Self>,
        mut reader: FrameReader<BoxedReader>,
        writer: FrameWriter<BoxedWriter>,
        handle_timeout: Duration,
    ) {
        let writer: SharedWriter = Arc::new(Mutex::new(writer));
        let mut in_flight = JoinSet::new();

        loop {
            match self.read_request(&mut reader).await {
                Ok(Incoming::Request(request)) => {
                    in_flight.spawn(handle_request(request, writer.clone(), handle_timeout));
                }
                Ok(Incoming::Rejected(header, err)) => {
                    debug!("rpc server: rejecting seq {}: {}", header.seq, err);
                    send_error(&writer, &header, &err).await;
                }
                Err(RpcError::ConnectionClosed) => break,
                Err(e) => {
                    warn!("rpc server: read request error: {}", e);
                    break;
                }
            }

            while in_flight.try_join_next().is_some() {}
        }

        while in_flight.join_next().await.is_some() {}

        let mut sink = writer.lock().await;
        if let Err(e) = sink.shutdown().await {
            debug!("rpc server: close error: {}", e);
        }
    }

    /// Reads one frame. `Err` means the stream is unusable.
    async fn read_request(&self, reader: &mut FrameReader<BoxedReader>) -> Result<Incoming> {
        let header = reader.read_header().await?;
        // Consume the body before resolving so the stream stays aligned
        // whatever happens next.
        let body = reader.read_body_bytes().await?;

        let method = match self.find_method(&header.service_method) {
            Ok(method) => method,
            Err(e) => return Ok(Incoming::Rejected(header, e)),
        };

        let argument = match method.read_argument(&reader.codec(), &body) {
            Ok(argument) => argument,
            Err(e) => {
                warn!("rpc server: read body error: {}", e);
                return Ok(Incoming::Rejected(header, e));
            }
        };

        let reply = method.new_reply();
        Ok(Incoming::Request(Request {
            header,
            argument,
            reply,
            method,
        }))
    }
}

/// Runs one request, racing it against `handle_timeout` when non-zero.
///
/// On timeout the error response is sent right away; the invocation keeps
/// running detached and its eventual result is dropped, so each request gets
/// exactly one response.
async fn handle_request(request: Request, writer: SharedWriter, handle_timeout: Duration) {
    let Request {
        header,
        argument,
        reply,
        method,
    } = request;

    debug!("rpc server: handling {} seq {}", header.service_method, header.seq);
    let mut invocation = tokio::spawn(method.invoke(argument, reply));

    if handle_timeout.is_zero() {
        let outcome = invocation.await;
        send_outcome(&writer, &header, outcome).await;
        return;
    }

    tokio::select! {
        outcome = &mut invocation => {
            send_outcome(&writer, &header, outcome).await;
        }
        _ = tokio::time::sleep(handle_timeout) => {
            send_error(&writer, &header, &RpcError::HandleTimeout(handle_timeout)).await;
            debug!(
                "rpc server: {} seq {} timed out, late result will be dropped",
                header.service_method, header.seq
            );
        }
    }
}

async fn send_outcome(
    writer: &SharedWriter,
    header: &Header,
    outcome: std::result::Result<std::result::Result<Reply, String>, JoinError>,
) {
    match outcome {
        Ok(Ok(reply)) => {
            let codec = writer.lock().await.codec();
            match reply.encode(&codec) {
                Ok(body) => send_response(writer, &header.reply(), &body).await,
                Err(e) => send_error(writer, header, &e).await,
            }
        }
        Ok(Err(message)) => {
            send_response_error(writer, header, message).await;
        }
        Err(e) => {
            error!("rpc server: handler for {} failed: {}", header.service_method, e);
            send_error(writer, header, &RpcError::HandlerPanicked(header.service_method.clone()))
                .await;
        }
    }
}

async fn send_error(writer: &SharedWriter, header: &Header, err: &RpcError) {
    send_response_error(writer, header, err.to_string()).await;
}

async fn send_response_error(writer: &SharedWriter, header: &Header, message: String) {
    let codec = writer.lock().await.codec();
    match codec.empty_body() {
        Ok(body) => send_response(writer, &header.reply_error(message), &body).await,
        Err(e) => error!("rpc server: encode empty body error: {}", e),
    }
}

/// Writes one response frame under the connection's send lock.
///
/// Failures are logged, not retried; the next read on a broken connection
/// ends the serve loop.
async fn send_response(writer: &SharedWriter, header: &Header, body: &[u8]) {
    let mut writer = writer.lock().await;
    if let Err(e) = writer.write_encoded(header, body).await {
        error!("rpc server: write response error: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drpc_common::protocol::Options;
    use drpc_common::transport::{write_handshake, CodecType};
    use serde::{Deserialize, Serialize};
    use tokio::io::DuplexStream;

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Args {
        num1: i64,
        num2: i64,
    }

    struct Arith;

    fn arith() -> Service {
        Service::builder(Arith)
            .method("Sum", |_: Arc<Arith>, args: Args, _: i64| async move {
                Ok::<_, String>(args.num1 + args.num2)
            })
            .method("Sleep", |_: Arc<Arith>, millis: u64, _: ()| async move {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok::<_, String>(())
            })
            .method("Panic", |_: Arc<Arith>, _: (), _: ()| async move {
                if true {
                    panic!("handler blew up");
                }
                Ok::<_, String>(())
            })
            .build()
            .unwrap()
    }

    fn server() -> Arc<Server> {
        let server = Arc::new(Server::new());
        server.register(arith()).unwrap();
        server
    }

    /// Starts serving one end of a duplex pipe and returns framed halves of
    /// the other end, handshake already sent.
    async fn connect(
        options: Options,
    ) -> (FrameReader<tokio::io::ReadHalf<DuplexStream>>, FrameWriter<tokio::io::WriteHalf<DuplexStream>>) {
        let (mut client, conn) = tokio::io::duplex(64 * 1024);
        tokio::spawn(server().serve_conn(conn));

        write_handshake(&mut client, &options.to_handshake())
            .await
            .unwrap();
        let codec = Codec::new(options.codec_type);
        let (read_half, write_half) = tokio::io::split(client);
        (
            FrameReader::new(read_half, codec),
            FrameWriter::new(write_half, codec),
        )
    }

    #[test]
    fn test_register_duplicate_rejected() {
        let server = server();
        let err = server.register(arith()).unwrap_err();
        assert_eq!(err, RpcError::DuplicateService("Arith".to_string()));
        assert_eq!(server.service_names(), vec!["Arith"]);
    }

    #[test]
    fn test_find_method() {
        let server = server();
        assert_eq!(server.find_method("Arith.Sum").unwrap().name(), "Sum");

        assert_eq!(
            server.find_method("ArithSum").unwrap_err(),
            RpcError::MalformedServiceMethod("ArithSum".to_string())
        );
        assert_eq!(
            server.find_method("Geometry.Sum").unwrap_err(),
            RpcError::UnknownService("Geometry".to_string())
        );
        assert_eq!(
            server.find_method("Arith.Product").unwrap_err(),
            RpcError::UnknownMethod("Product".to_string())
        );
    }

    #[test]
    fn test_find_method_empty_method_name() {
        assert_eq!(
            server().find_method("Arith.").unwrap_err(),
            RpcError::UnknownMethod(String::new())
        );
    }

    #[tokio::test]
    async fn test_serve_round_trip() {
        for codec_type in [CodecType::Json, CodecType::Postcard] {
            let (mut reader, mut writer) = connect(Options::default().with_codec(codec_type)).await;

            writer
                .write_frame(&Header::request("Arith.Sum", 1), &Args { num1: 3, num2: 4 })
                .await
                .unwrap();

            let header = reader.read_header().await.unwrap();
            assert_eq!(header.seq, 1);
            assert!(!header.is_error());
            assert_eq!(reader.read_body::<i64>().await.unwrap(), 7);
        }
    }

    #[tokio::test]
    async fn test_unknown_method_keeps_connection() {
        let (mut reader, mut writer) = connect(Options::default()).await;

        writer
            .write_frame(&Header::request("Arith.Product", 1), &Args::default())
            .await
            .unwrap();
        let header = reader.read_header().await.unwrap();
        assert!(header.error.contains("can't find method: Product"));
        reader.discard_body().await.unwrap();

        writer
            .write_frame(&Header::request("Arith.Sum", 2), &Args { num1: 1, num2: 1 })
            .await
            .unwrap();
        let header = reader.read_header().await.unwrap();
        assert_eq!(header.seq, 2);
        assert_eq!(reader.read_body::<i64>().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_bad_argument_answered_with_error() {
        let (mut reader, mut writer) = connect(Options::default()).await;

        writer
            .write_frame(&Header::request("Arith.Sum", 9), "not args")
            .await
            .unwrap();
        let header = reader.read_header().await.unwrap();
        assert_eq!(header.seq, 9);
        assert!(header.is_error());
        reader.discard_body().await.unwrap();
    }

    #[tokio::test]
    async fn test_handle_timeout() {
        let options = Options::default().with_handle_timeout(Duration::from_millis(50));
        let (mut reader, mut writer) = connect(options).await;

        writer
            .write_frame(&Header::request("Arith.Sleep", 1), &500u64)
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let header = reader.read_header().await.unwrap();
        assert!(header.error.contains("handle timeout"));
        assert!(started.elapsed() < Duration::from_millis(400));
        reader.discard_body().await.unwrap();

        // The late result of the timed-out call is never sent
        writer
            .write_frame(&Header::request("Arith.Sum", 2), &Args { num1: 2, num2: 2 })
            .await
            .unwrap();
        let header = reader.read_header().await.unwrap();
        assert_eq!(header.seq, 2);
        assert_eq!(reader.read_body::<i64>().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_no_second_response_after_timeout() {
        let options = Options::default().with_handle_timeout(Duration::from_millis(50));
        let (mut reader, mut writer) = connect(options).await;

        writer
            .write_frame(&Header::request("Arith.Sleep", 1), &100u64)
            .await
            .unwrap();

        let header = reader.read_header().await.unwrap();
        assert_eq!(header.seq, 1);
        assert!(header.error.contains("handle timeout"));
        reader.discard_body().await.unwrap();

        // The handler finishes at 100ms; nothing else may arrive for seq 1
        let late = tokio::time::timeout(Duration::from_millis(300), reader.read_header()).await;
        assert!(late.is_err(), "unexpected second frame: {:?}", late);
    }

    #[tokio::test]
    async fn test_silent_peer_dropped_after_handshake_timeout() {
        let server = Arc::new(Server::new().with_handshake_timeout(Duration::from_millis(50)));
        let (client, conn) = tokio::io::duplex(1024);

        let serving = tokio::spawn(server.serve_conn(conn));
        tokio::time::timeout(Duration::from_secs(1), serving)
            .await
            .expect("serve_conn still waiting for a handshake")
            .unwrap();

        let mut reader = FrameReader::new(client, Codec::default());
        assert_eq!(reader.read_header().await, Err(RpcError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_handler_panic_reported() {
        let (mut reader, mut writer) = connect(Options::default()).await;

        writer
            .write_frame(&Header::request("Arith.Panic", 1), &())
            .await
            .unwrap();
        let header = reader.read_header().await.unwrap();
        assert!(header.error.contains("panicked"));
    }

    #[tokio::test]
    async fn test_bad_magic_closes_connection() {
        let (mut client, conn) = tokio::io::duplex(1024);
        let serving = tokio::spawn(server().serve_conn(conn));

        let mut handshake = Options::default().to_handshake();
        handshake.magic_number = 0x1234;
        write_handshake(&mut client, &handshake).await.unwrap();

        serving.await.unwrap();
        let mut reader = FrameReader::new(client, Codec::default());
        assert_eq!(reader.read_header().await, Err(RpcError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_serve_returns_after_peer_closes() {
        let (mut reader, mut writer) = connect(Options::default()).await;
        writer.shutdown().await.unwrap();
        assert_eq!(reader.read_header().await, Err(RpcError::ConnectionClosed));
    }
}
