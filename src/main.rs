// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Topic Broker
//!
//! A topic-addressed message broker mediating publish/fan-out,
//! priority-routed request/response, and a `system.*` control plane
//! between services connected over persistent streams.
//!
//! # Usage
//!
//! ```bash
//! # Start on the default port (7600)
//! topic-broker
//!
//! # Custom port and config file
//! topic-broker --port 7610 --config broker.json
//! ```

use clap::Parser;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

mod broker;
mod codec;
mod config;
mod connection;
mod error;
mod metrics;
mod registry;
mod request_table;
mod router;
mod server;
mod subscription;
mod topic;
mod trie;

pub use config::BrokerConfig;
pub use server::Server;

/// Topic Broker - pub/sub, priority request/response, and system control
#[derive(Parser, Debug)]
#[command(name = "topic-broker")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port to listen on
    #[arg(short, long, default_value = "7600")]
    port: u16,

    /// Bind address (0.0.0.0 for all interfaces)
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Configuration file (JSON format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Maximum outstanding requests before oldest-eviction kicks in
    #[arg(long)]
    max_outstanding_requests: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = if let Some(config_path) = &args.config {
        info!("loading config from {:?}", config_path);
        BrokerConfig::from_file(config_path)?
    } else {
        BrokerConfig {
            bind_address: args.bind.parse()?,
            port: args.port,
            ..Default::default()
        }
    };
    if let Some(max_outstanding) = args.max_outstanding_requests {
        config.max_outstanding_requests = max_outstanding;
    }

    info!("+----------------------------------------------------+");
    info!(
        "|       Topic Broker v{}                         |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    info!("|  Bind:         {:40} |", format!("{}:{}", config.bind_address, config.port));
    info!("|  Max requests: {:40} |", config.max_outstanding_requests);
    info!(
        "|  Heartbeat:    {:40} |",
        format!(
            "{}ms / {}ms",
            config.heartbeat_retry_timeout_ms, config.heartbeat_deregister_timeout_ms
        )
    );
    info!("+----------------------------------------------------+");

    let server = Server::new(config)?;

    let server_handle = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown signal received, stopping broker...");
        server_handle.shutdown().await;
    });

    server.run().await?;

    info!("topic broker stopped");
    Ok(())
}
