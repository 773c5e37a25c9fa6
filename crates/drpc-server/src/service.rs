//! Service registry entries.
//!
//! A [`Service`] wraps one receiver value and a table of
//! [`MethodDescriptor`]s. Methods are bound explicitly with
//! [`ServiceBuilder::method`]; each binding captures the argument and reply
//! types, so the server can decode arguments, build reply slots and invoke
//! the handler without knowing those types.
//!
//! # Example
//!
//! ```
//! use drpc_server::Service;
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Default, Serialize, Deserialize)]
//! struct Args { num1: i64, num2: i64 }
//!
//! struct Arith;
//!
//! let service = Service::builder(Arith)
//!     .method("Sum", |_: Arc<Arith>, args: Args, _reply: i64| async move {
//!         Ok::<_, String>(args.num1 + args.num2)
//!     })
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(service.name(), "Arith");
//! assert!(service.method("Sum").is_some());
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use drpc_common::protocol::error::{Result, RpcError};
use drpc_common::transport::Codec;
use futures_util::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Decoded request argument, typed by the descriptor that produced it.
pub type Argument = Box<dyn Any + Send>;

/// Fresh reply slot, typed by the descriptor that produced it.
pub type ReplySlot = Box<dyn Any + Send>;

/// Handler output that only needs to be encoded.
pub type Reply = Box<dyn EncodeReply>;

/// Encodes a reply value with the connection's codec.
pub trait EncodeReply: Send {
    fn encode(&self, codec: &Codec) -> Result<Vec<u8>>;
}

impl<T> EncodeReply for T
where
    T: Serialize + Send,
{
    fn encode(&self, codec: &Codec) -> Result<Vec<u8>> {
        codec.encode(self)
    }
}

/// Type-erased binding of one method.
trait Handler: Send + Sync {
    fn read_argument(&self, codec: &Codec, body: &[u8]) -> Result<Argument>;

    fn new_reply(&self) -> ReplySlot;

    fn call(&self, argument: Argument, reply: ReplySlot) -> BoxFuture<'static, std::result::Result<Reply, String>>;
}

struct TypedHandler<R, A, Rep, F> {
    receiver: Arc<R>,
    func: F,
    _types: PhantomData<fn(A) -> Rep>,
}

impl<R, A, Rep, E, F, Fut> Handler for TypedHandler<R, A, Rep, F>
where
    R: Send + Sync + 'static,
    A: DeserializeOwned + Send + 'static,
    Rep: Serialize + Default + Send + 'static,
    E: fmt::Display + 'static,
    F: Fn(Arc<R>, A, Rep) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Rep, E>> + Send + 'static,
{
    fn read_argument(&self, codec: &Codec, body: &[u8]) -> Result<Argument> {
        let argument: A = codec.decode(body)?;
        Ok(Box::new(argument))
    }

    fn new_reply(&self) -> ReplySlot {
        Box::new(Rep::default())
    }

    fn call(&self, argument: Argument, reply: ReplySlot) -> BoxFuture<'static, std::result::Result<Reply, String>> {
        let (argument, reply) = match (argument.downcast::<A>(), reply.downcast::<Rep>()) {
            (Ok(argument), Ok(reply)) => (*argument, *reply),
            _ => return futures_util::future::ready(Err("rpc server: argument or reply type mismatch".to_string())).boxed(),
        };

        let fut = (self.func)(self.receiver.clone(), argument, reply);
        async move {
            fut.await
                .map(|reply| Box::new(reply) as Reply)
                .map_err(|e| e.to_string())
        }
        .boxed()
    }
}

/// One invocable method of a service.
pub struct MethodDescriptor {
    name: String,
    arg_type: &'static str,
    reply_type: &'static str,
    num_calls: AtomicU64,
    handler: Box<dyn Handler>,
}

impl MethodDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arg_type(&self) -> &'static str {
        self.arg_type
    }

    pub fn reply_type(&self) -> &'static str {
        self.reply_type
    }

    /// Number of times this method has been invoked.
    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Relaxed)
    }

    /// Builds a fresh argument by decoding a request body.
    pub fn read_argument(&self, codec: &Codec, body: &[u8]) -> Result<Argument> {
        self.handler.read_argument(codec, body)
    }

    /// Builds a fresh reply slot holding `Default::default()` of the reply type.
    pub fn new_reply(&self) -> ReplySlot {
        self.handler.new_reply()
    }

    /// Counts the call and runs the bound handler.
    ///
    /// The returned future owns everything it needs, so it can be spawned
    /// and outlive the caller.
    pub fn invoke(&self, argument: Argument, reply: ReplySlot) -> BoxFuture<'static, std::result::Result<Reply, String>> {
        self.num_calls.fetch_add(1, Ordering::Relaxed);
        self.handler.call(argument, reply)
    }
}

impl fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("arg_type", &self.arg_type)
            .field("reply_type", &self.reply_type)
            .field("num_calls", &self.num_calls())
            .finish()
    }
}

/// A registered receiver and its methods. Immutable once built.
#[derive(Debug)]
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<MethodDescriptor>>,
}

impl Service {
    /// Starts a service named after the receiver's type.
    pub fn builder<R>(receiver: R) -> ServiceBuilder<R>
    where
        R: Send + Sync + 'static,
    {
        ServiceBuilder::named(type_name_of::<R>(), receiver)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method(&self, name: &str) -> Option<&Arc<MethodDescriptor>> {
        self.methods.get(name)
    }

    /// Method names, sorted.
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Collects method bindings for one receiver.
pub struct ServiceBuilder<R> {
    name: String,
    receiver: Arc<R>,
    methods: HashMap<String, Arc<MethodDescriptor>>,
}

impl<R> ServiceBuilder<R>
where
    R: Send + Sync + 'static,
{
    /// Starts a service with an explicit name.
    pub fn named(name: impl Into<String>, receiver: R) -> Self {
        Self {
            name: name.into(),
            receiver: Arc::new(receiver),
            methods: HashMap::new(),
        }
    }

    /// Binds `func` as `name`.
    ///
    /// The handler receives the receiver, the decoded argument and a
    /// default-initialised reply slot, and returns the filled reply or an
    /// error that is sent back to the caller as a string. Names that are not
    /// exported identifiers (leading uppercase letter) are skipped.
    pub fn method<A, Rep, E, F, Fut>(mut self, name: &str, func: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        Rep: Serialize + Default + Send + 'static,
        E: fmt::Display + 'static,
        F: Fn(Arc<R>, A, Rep) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Rep, E>> + Send + 'static,
    {
        if !is_exported(name) {
            tracing::debug!("rpc server: skipping unexported method {}.{}", self.name, name);
            return self;
        }

        let descriptor = MethodDescriptor {
            name: name.to_string(),
            arg_type: std::any::type_name::<A>(),
            reply_type: std::any::type_name::<Rep>(),
            num_calls: AtomicU64::new(0),
            handler: Box::new(TypedHandler {
                receiver: self.receiver.clone(),
                func,
                _types: PhantomData::<fn(A) -> Rep>,
            }),
        };

        self.methods.insert(name.to_string(), Arc::new(descriptor));
        self
    }

    /// Validates the service name and freezes the method table.
    pub fn build(self) -> Result<Service> {
        if !is_exported(&self.name) {
            return Err(RpcError::InvalidServiceName(self.name));
        }

        for method in self.methods.keys() {
            tracing::info!("rpc server: register {}.{}", self.name, method);
        }

        Ok(Service {
            name: self.name,
            methods: self.methods,
        })
    }
}

/// Exported identifier: leading uppercase letter, then alphanumerics or `_`.
pub fn is_exported(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_uppercase() => chars.all(|c| c.is_alphanumeric() || c == '_'),
        _ => false,
    }
}

/// Last path segment of a type name, without generic parameters.
fn type_name_of<R>() -> String {
    let full = std::any::type_name::<R>();
    let without_generics = full.split('<').next().unwrap_or(full);
    without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use drpc_common::transport::CodecType;
    use serde::Deserialize;
    use std::collections::HashMap;

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Args {
        num1: i64,
        num2: i64,
    }

    struct Arith;

    #[allow(non_camel_case_types)]
    struct lowercase;

    fn arith() -> Service {
        Service::builder(Arith)
            .method("Sum", |_: Arc<Arith>, args: Args, _: i64| async move {
                Ok::<_, String>(args.num1 + args.num2)
            })
            .method("Div", |_: Arc<Arith>, args: Args, _: i64| async move {
                if args.num2 == 0 {
                    return Err("divide by zero".to_string());
                }
                Ok(args.num1 / args.num2)
            })
            .method("Tally", |_: Arc<Arith>, words: Vec<String>, mut counts: HashMap<String, u32>| async move {
                for word in words {
                    *counts.entry(word).or_default() += 1;
                }
                Ok::<_, String>(counts)
            })
            .method("internal", |_: Arc<Arith>, _: i64, _: i64| async move { Ok::<_, String>(0) })
            .build()
            .unwrap()
    }

    #[test]
    fn test_service_name_from_type() {
        let service = arith();
        assert_eq!(service.name(), "Arith");
        assert_eq!(service.method_names(), vec!["Div", "Sum", "Tally"]);
    }

    #[test]
    fn test_unexported_method_skipped() {
        assert!(arith().method("internal").is_none());
    }

    #[test]
    fn test_unexported_service_rejected() {
        let err = Service::builder(lowercase).build().unwrap_err();
        assert_eq!(err, RpcError::InvalidServiceName("lowercase".to_string()));
    }

    #[test]
    fn test_explicit_name() {
        let service = ServiceBuilder::named("Calculator", Arith).build().unwrap();
        assert_eq!(service.name(), "Calculator");
    }

    #[test]
    fn test_is_exported() {
        assert!(is_exported("Sum"));
        assert!(is_exported("Sum_2"));
        assert!(!is_exported("sum"));
        assert!(!is_exported(""));
        assert!(!is_exported("Sum.Div"));
    }

    #[test]
    fn test_descriptor_types() {
        let service = arith();
        let sum = service.method("Sum").unwrap();
        assert!(sum.arg_type().ends_with("Args"));
        assert_eq!(sum.reply_type(), "i64");
    }

    #[tokio::test]
    async fn test_invoke_counts_calls() {
        let service = arith();
        let sum = service.method("Sum").unwrap();
        let codec = Codec::new(CodecType::Json);

        for _ in 0..3 {
            let body = codec.encode(&Args { num1: 3, num2: 4 }).unwrap();
            let argument = sum.read_argument(&codec, &body).unwrap();
            let reply = sum.invoke(argument, sum.new_reply()).await.unwrap();
            assert_eq!(reply.encode(&codec).unwrap(), b"7");
        }

        assert_eq!(sum.num_calls(), 3);
    }

    #[tokio::test]
    async fn test_invoke_returns_application_error() {
        let service = arith();
        let div = service.method("Div").unwrap();
        let codec = Codec::new(CodecType::Json);

        let body = codec.encode(&Args { num1: 1, num2: 0 }).unwrap();
        let argument = div.read_argument(&codec, &body).unwrap();
        let err = div.invoke(argument, div.new_reply()).await.err().unwrap();
        assert_eq!(err, "divide by zero");
    }

    #[tokio::test]
    async fn test_container_reply_is_usable() {
        let service = arith();
        let tally = service.method("Tally").unwrap();
        let codec = Codec::new(CodecType::Json);

        let body = codec.encode(&vec!["a", "b", "a"]).unwrap();
        let argument = tally.read_argument(&codec, &body).unwrap();
        let reply = tally.invoke(argument, tally.new_reply()).await.unwrap();

        let counts: HashMap<String, u32> = codec.decode(&reply.encode(&codec).unwrap()).unwrap();
        assert_eq!(counts["a"], 2);
        assert_eq!(counts["b"], 1);
    }

    #[test]
    fn test_bad_argument_is_codec_error() {
        let service = arith();
        let sum = service.method("Sum").unwrap();
        let codec = Codec::new(CodecType::Json);

        let err = sum.read_argument(&codec, b"\"nope\"").err().unwrap();
        assert!(matches!(err, RpcError::Codec(_)));
    }

    #[tokio::test]
    async fn test_mismatched_argument_rejected() {
        let service = arith();
        let sum = service.method("Sum").unwrap();

        let err = sum
            .invoke(Box::new("wrong type"), sum.new_reply())
            .await
            .err()
            .unwrap();
        assert!(err.contains("type mismatch"));
    }
}
