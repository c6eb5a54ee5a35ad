mod config;
mod error;
mod health;
mod http;
mod service;
mod store;
mod types;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::service::NodeService;
use crate::store::node::Nodes;
use crate::store::node_check::NodeChecks;

#[derive(Debug, Parser)]
#[command(name = "warden", about = "Node registry and health supervision server.")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the server.
    Server {
        /// Config path.
        #[arg(short, long, default_value = "warden.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warden=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Server { config } => server(&config).await,
    }
}

async fn server(path: &Path) -> anyhow::Result<()> {
    let config = Config::load(path)?;

    let mut client = store::sqlite::Client::connect(&store::sqlite::Config {
        path: config.database.path.clone(),
        max_connections: config.database.max_connections,
        idle_timeout: config.database.idle_timeout,
        connection_lifetime: config.database.connection_lifetime,
    })
    .await
    .context("failed to connect to the database")?;

    let nodes = Arc::new(Nodes::new(client.pool()));
    let checks = Arc::new(NodeChecks::new(client.pool()));
    client.register(nodes.clone());
    client.register(checks.clone());
    client
        .start()
        .await
        .context("failed to start the database client")?;
    let client = Arc::new(client);

    let http_client = reqwest::Client::builder()
        .timeout(config.supervisor.probe_timeout)
        .build()
        .context("failed to create the probe http client")?;

    let health = health::Health::start(health::Config {
        interval: config.supervisor.interval,
        concurrency: config.supervisor.concurrency,
        max_failures: config.supervisor.max_failures,
        http_client,
        registry: nodes.clone(),
        checks,
    })
    .await
    .context("failed to start the health supervisor")?;

    let service = NodeService::new(Arc::clone(&client), nodes, health.notifier(), config.node.ttl);
    let router = http::router(service, &config.transport.http);

    let listener = tokio::net::TcpListener::bind((
        config.transport.http.address.as_str(),
        config.transport.http.port,
    ))
    .await
    .context("failed to bind the http listener")?;
    tracing::info!(address = %listener.local_addr()?, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    health.stop().await;
    client
        .stop()
        .await
        .context("failed to stop the database client")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for the interrupt signal");
    }
}
