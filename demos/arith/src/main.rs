//! # Arith demo
//!
//! Starts a drpc server with a `Foo` service, then issues concurrent calls
//! against it over one client connection.
//!
//! ```bash
//! cargo run -p arith -- --calls 10 --codec postcard
//! RUST_LOG=debug cargo run -p arith -- --handle-timeout-ms 500
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use argh::FromArgs;
use drpc::common::transport::listen;
use drpc::{CodecType, Options, Server, Service};
use serde::{Deserialize, Serialize};

#[derive(FromArgs)]
/// drpc arith demo - serve Foo.Sum / Foo.Sleep and call them concurrently
struct Cli {
    /// address to bind the server to
    #[argh(option, short = 'b', default = "\"127.0.0.1:0\".into()")]
    bind: String,

    /// number of concurrent Foo.Sum calls
    #[argh(option, short = 'n', long = "calls", default = "5")]
    calls: i64,

    /// codec: json or postcard
    #[argh(option, long = "codec", default = "\"json\".into()")]
    codec: String,

    /// server-side handle timeout in milliseconds (0 = unbounded)
    #[argh(option, long = "handle-timeout-ms", default = "0")]
    handle_timeout_ms: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Args {
    num1: i64,
    num2: i64,
}

struct Foo;

fn foo_service() -> drpc::Result<Service> {
    Service::builder(Foo)
        .method("Sum", |_: Arc<Foo>, args: Args, _: i64| async move {
            Ok::<_, String>(args.num1 + args.num2)
        })
        .method("Sleep", |_: Arc<Foo>, args: Args, _: i64| async move {
            tokio::time::sleep(Duration::from_millis(100 * args.num1.max(0) as u64)).await;
            Ok::<_, String>(args.num1 + args.num2)
        })
        .build()
}

fn parse_codec(name: &str) -> Result<CodecType> {
    match name {
        "json" => Ok(CodecType::Json),
        "postcard" => Ok(CodecType::Postcard),
        other => Err(anyhow::anyhow!(
            "Invalid codec: '{}' (expected json or postcard)",
            other
        )),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Default to INFO, RUST_LOG overrides
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let server = Arc::new(Server::new());
    server.register(foo_service()?)?;

    let listener = listen(&cli.bind).await?;
    let addr = listener.local_addr()?.to_string();
    tracing::info!("Server listening on {}", addr);
    tokio::spawn(server.clone().accept(listener));

    let options = Options::default()
        .with_codec(parse_codec(&cli.codec)?)
        .with_handle_timeout(Duration::from_millis(cli.handle_timeout_ms));
    let client = Arc::new(drpc::x_dial(&format!("tcp@{}", addr), options).await?);

    let mut tasks = Vec::new();
    for i in 0..cli.calls {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let args = Args {
                num1: i,
                num2: i * i,
            };
            match client.call::<_, i64>("Foo.Sum", &args).await {
                Ok(reply) => tracing::info!("Foo.Sum success: {} + {} = {}", args.num1, args.num2, reply),
                Err(e) => tracing::warn!("Foo.Sum error: {}", e),
            }

            match client
                .call_timeout::<_, i64>("Foo.Sleep", &args, Duration::from_millis(250))
                .await
            {
                Ok(reply) => tracing::info!("Foo.Sleep success: {} + {} = {}", args.num1, args.num2, reply),
                Err(e) => tracing::warn!("Foo.Sleep error: {}", e),
            }
        }));
    }

    for task in tasks {
        task.await?;
    }

    if let Ok(sum) = server.find_method("Foo.Sum") {
        tracing::info!("Foo.Sum served {} calls", sum.num_calls());
    }
    client.close()?;
    Ok(())
}
