//! Circumambient
//!
//! Transparent HTTP reverse proxy. Every request received on `--in` is
//! forwarded to `--out` and a JSON record describing it is published to a
//! Redis channel, or written to the log with `--console`.
//!
//! Usage:
//!   circumambient --in :8080 --out localhost:3000 [OPTIONS]

use circumambient::config::{Config, ConfigError, SinkKind};
use circumambient::metrics::serve_metrics;
use circumambient::proxy::{create_reusable_listener, ProxyServer};
use circumambient::sink::create_sink;
use clap::Parser;
use std::net::SocketAddr;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "Usage: circumambient --in <host:port> --out <host:port>";

/// Proxy that reports each request it forwards to Redis pub/sub or the log.
#[derive(Parser, Debug, Default)]
#[command(name = "circumambient")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on, e.g. :8080
    #[arg(long = "in", value_name = "host:port")]
    listen: Option<String>,

    /// Upstream to forward every request to, e.g. localhost:3000
    #[arg(long = "out", value_name = "host:port")]
    upstream: Option<String>,

    /// Redis server address [default: :6379]
    #[arg(long, value_name = ":port")]
    redis: Option<String>,

    /// Redis pub/sub channel [default: requests]
    #[arg(long, value_name = "name")]
    channel: Option<String>,

    /// Write telemetry to the log instead of Redis
    #[arg(long)]
    console: bool,

    /// Number of pooled Redis connections [default: 3]
    #[arg(long, value_name = "n")]
    pool_size: Option<u32>,

    /// Serve Prometheus metrics on this port
    #[arg(long, value_name = "port")]
    metrics_port: Option<u16>,

    /// YAML configuration file; flags take precedence over its values
    #[arg(short, long, value_name = "file", env = "CIRCUMAMBIENT_CONFIG")]
    config: Option<String>,
}

impl Args {
    /// Overlay command-line flags onto a base configuration.
    fn apply(self, mut config: Config) -> Config {
        if let Some(listen) = self.listen {
            config.listen = Some(listen);
        }
        if let Some(upstream) = self.upstream {
            config.upstream = Some(upstream);
        }
        if self.console {
            config.sink.kind = SinkKind::Console;
        }
        if let Some(address) = self.redis {
            config.sink.redis.address = address;
        }
        if let Some(channel) = self.channel {
            config.sink.redis.channel = channel;
        }
        if let Some(pool_size) = self.pool_size {
            config.sink.redis.pool_size = pool_size;
        }
        if let Some(port) = self.metrics_port {
            config.metrics.port = Some(port);
        }
        config
    }
}

fn load_config(args: Args) -> Result<Config, ConfigError> {
    let base = match args.config.as_deref() {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    let config = args.apply(base);
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match load_config(Args::parse()) {
        Ok(config) => config,
        Err(e) if e.is_usage_error() => {
            eprintln!("{}", USAGE);
            return ExitCode::from(2);
        }
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), anyhow::Error> {
    let sink = create_sink(&config.sink)?;

    if let Some(port) = config.metrics.port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = create_reusable_listener(addr)?;
        info!("Serving metrics on http://{}/metrics", addr);
        tokio::spawn(async move {
            if let Err(e) = serve_metrics(listener).await {
                error!("Metrics server stopped: {}", e);
            }
        });
    }

    let server = ProxyServer::new(&config, sink)?;

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}
