//! Patchlog Server - Patch Log Replication Server
//!
//! Serves one or more append-only patch logs over HTTP:
//! - Durable, hash-chained append storage per source
//! - At-most-one accepted append per version under concurrent writers
//! - Range fetch for replica catch-up

mod handlers;

use anyhow::Result;
use clap::{Parser, Subcommand};
use handlers::LogHandler;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use patchlog_core::PatchLogServer;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Patchlog Server Configuration
#[derive(Parser, Debug)]
#[command(name = "patchlog")]
#[command(author = "Patchlog Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Patch log replication server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the server
    Start {
        /// Listen address (e.g., 0.0.0.0:1066)
        #[arg(short, long, default_value = "0.0.0.0:1066")]
        addr: String,

        /// Data root directory holding all source logs
        #[arg(short, long, default_value = "./data/patchlog")]
        data_root: String,

        /// Enable debug logging
        #[arg(long)]
        debug: bool,
    },

    /// Initialize a data root and create a source
    Init {
        /// Data root directory
        #[arg(short, long, default_value = "./data/patchlog")]
        data_root: String,

        /// Source identifier to create
        source_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            addr,
            data_root,
            debug,
        } => {
            let env_filter = if debug {
                tracing_subscriber::EnvFilter::new("debug")
            } else {
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::INFO.into())
            };

            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer())
                .with(env_filter)
                .init();

            info!("Starting patchlog server on {}", addr);
            info!("Data root: {}", data_root);

            // Registry rehydration verifies every source's tail before the
            // server accepts any writes.
            let server = Arc::new(PatchLogServer::open(std::path::Path::new(&data_root))?);
            let sources = server.list_sources().await;
            info!("Rehydrated {} source(s): {:?}", sources.len(), sources);

            let handler = Arc::new(LogHandler::new(server));

            let addr: SocketAddr = addr.parse()?;
            let listener = TcpListener::bind(addr).await?;
            info!("Server listening on {}", addr);

            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (stream, peer) = accepted?;
                        let handler = handler.clone();
                        let io = TokioIo::new(stream);

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let handler = handler.clone();
                                async move {
                                    info!("Request: {} {}", req.method(), req.uri());
                                    let resp = handler.handle(req).await;
                                    info!("Response: {}", resp.status());
                                    Ok::<_, hyper::Error>(resp)
                                }
                            });
                            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                                error!("Error serving connection from {}: {:?}", peer, e);
                            }
                        });
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("Shutdown signal received; draining");
                        break;
                    }
                }
            }

            Ok(())
        }

        Commands::Init {
            data_root,
            source_id,
        } => {
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_subscriber::EnvFilter::new("info"))
                .init();

            let server = PatchLogServer::open(std::path::Path::new(&data_root))?;
            let desc = server.create_source(&source_id).await?;
            println!(
                "Created source '{}' at version {} under {}",
                desc.source_id, desc.head_version, data_root
            );
            Ok(())
        }
    }
}
