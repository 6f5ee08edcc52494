use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use broker_relay::{
    Client, ClientConfig, ListenConfig, Server, ServerConfig, load_client_tls_config, load_config,
    load_rules, load_tls_config, serve,
};

#[derive(Parser)]
#[command(name = "broker-relay", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the public relay server
    Server {
        #[arg(default_value = "server.toml")]
        config: PathBuf,
    },
    /// Run the private relay client
    Client {
        #[arg(default_value = "client.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
                shutdown.cancel();
            }
        });
    }

    match cli.command {
        Command::Server { config } => run_server(&config, shutdown).await,
        Command::Client { config } => run_client(&config, shutdown).await,
    }
}

async fn bind(listen: &ListenConfig) -> Result<(TcpListener, Option<Arc<rustls::ServerConfig>>)> {
    let tls = match &listen.tls {
        Some(tls_config) => {
            let config = load_tls_config(tls_config).context("Failed to load TLS configuration")?;
            info!(cert_file = %tls_config.cert_file, "TLS enabled");
            Some(Arc::new(config))
        }
        None => None,
    };

    let addr = listen.addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to address {addr}"))?;
    Ok((listener, tls))
}

async fn run_server(path: &Path, shutdown: CancellationToken) -> Result<()> {
    let config: ServerConfig = load_config(path)?;
    info!(
        config_file = %path.display(),
        listen_addr = %config.listen.addr(),
        upstream_url = config.upstream_url.as_deref().unwrap_or("none"),
        stream_responses = config.stream_responses,
        "Configuration loaded"
    );

    let rules = load_rules(config.accept.as_deref())?;
    let (listener, tls) = bind(&config.listen).await?;
    let server = Server::new(config, rules)?;

    serve(listener, server.router(), tls, shutdown).await;
    Ok(())
}

async fn run_client(path: &Path, shutdown: CancellationToken) -> Result<()> {
    let config: ClientConfig = load_config(path)?;
    info!(
        config_file = %path.display(),
        server_url = %config.server_url,
        target_url = config.target_url.as_deref().unwrap_or("none"),
        "Configuration loaded"
    );
    if config.insecure_skip_verify {
        warn!("Server certificate verification is disabled");
    }

    let rules = load_rules(config.accept.as_deref())?;
    let tls = load_client_tls_config(config.ca_cert.as_deref(), config.insecure_skip_verify)
        .context("Failed to load client TLS configuration")?;
    let listen = config.listen.clone();
    let client = Client::new(config, rules, Arc::new(tls))?;

    if let Some(listen) = listen {
        let (listener, tls) = bind(&listen).await?;
        tokio::spawn(serve(listener, client.router(), tls, shutdown.clone()));
    }

    let result = client.run(shutdown.clone()).await;
    shutdown.cancel();
    result
}
