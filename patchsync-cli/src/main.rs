//! patchsync — patch log replica tool.
//!
//! Maintains a local mirror of one source's log on a patch log server:
//! - init: pin a mirror directory to a server and source
//! - pull/watch: one-shot or continuous catch-up
//! - submit: publish a local patch, rebasing through conflicts
//! - status/verify: inspect and integrity-check the mirror
//!
//! # Usage
//!
//! ```bash
//! # Pin a mirror to a server's source (creating the source if asked)
//! patchsync init --server http://server:1066 --source my-log --create ./mirror
//!
//! # Catch up once, or keep following
//! patchsync pull ./mirror
//! patchsync watch ./mirror --interval 5
//!
//! # Publish a local patch on top of the current head
//! patchsync submit ./mirror patch.bin
//!
//! # Inspect and verify
//! patchsync status ./mirror
//! patchsync verify ./mirror
//! ```

mod mirror;
mod remote;

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use mirror::Mirror;
use patchlog_core::{DEFAULT_MAX_SUBMIT_ATTEMPTS, PatchLogLink};
use remote::RemoteLink;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "patchsync")]
#[command(author = "Patchlog Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Patch log replica tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize a mirror directory for one source
    Init {
        /// Server base URL (e.g. http://server:1066)
        #[arg(short, long)]
        server: String,
        /// Source identifier to mirror
        #[arg(long)]
        source: String,
        /// Create the source on the server if it does not exist
        #[arg(long)]
        create: bool,
        /// Mirror directory
        dir: String,
    },

    /// Pull everything past the local log, once
    Pull {
        /// Mirror directory
        dir: String,
    },

    /// Keep the mirror converged by polling the server
    Watch {
        /// Mirror directory
        dir: String,
        /// Poll interval in seconds
        #[arg(short, long, default_value_t = 5)]
        interval: u64,
    },

    /// Display mirror state and distance behind the server
    Status {
        /// Mirror directory
        dir: String,
    },

    /// Submit a patch file on top of the current head
    Submit {
        /// Mirror directory
        dir: String,
        /// File holding the patch payload
        file: String,
        /// Bound on rebase-and-retry attempts
        #[arg(long, default_value_t = DEFAULT_MAX_SUBMIT_ATTEMPTS)]
        max_attempts: u32,
    },

    /// Verify the local log chain, and against the server when reachable
    Verify {
        /// Mirror directory
        dir: String,
        /// Skip the server-side comparison
        #[arg(long)]
        local_only: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("patchsync=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            server,
            source,
            create,
            dir,
        } => cmd_init(server, source, create, dir).await,

        Commands::Pull { dir } => cmd_pull(dir).await,

        Commands::Watch { dir, interval } => cmd_watch(dir, interval).await,

        Commands::Status { dir } => cmd_status(dir).await,

        Commands::Submit {
            dir,
            file,
            max_attempts,
        } => cmd_submit(dir, file, max_attempts).await,

        Commands::Verify { dir, local_only } => cmd_verify(dir, local_only).await,
    }
}

/// Open the mirror and a link to the server it was pinned to.
fn open_mirror(dir: &str) -> Result<(Mirror, Arc<RemoteLink>)> {
    let mirror = Mirror::open(Path::new(dir))?;
    let link = Arc::new(RemoteLink::new(&mirror.state().server_url)?);
    Ok((mirror, link))
}

/// Check the server is the one the mirror was pinned to.
async fn check_identity(mirror: &Mirror, link: &RemoteLink) -> Result<()> {
    let info = link.server_info().await?;
    mirror.state().verify_registry(&info.registry_id)
}

async fn cmd_init(server: String, source: String, create: bool, dir: String) -> Result<()> {
    let link = RemoteLink::new(&server)?;
    let info = link.server_info().await?;

    let desc = if create {
        link.create_source(&source).await?
    } else {
        link.describe_source(&source).await?
    };

    let mirror = Mirror::init(
        Path::new(&dir),
        &server,
        &info.registry_id,
        info.protocol_version,
        &source,
    )?;

    println!("Mirror initialized:");
    println!("  Server:      {}", mirror.state().server_url);
    println!("  Registry:    {}", info.registry_id);
    println!("  Source:      {}", desc.source_id);
    println!("  Server HEAD: v{}", desc.head_version);
    println!("  Ready to pull v1 through v{}", desc.head_version);
    Ok(())
}

async fn cmd_pull(dir: String) -> Result<()> {
    let (mut mirror, link) = open_mirror(&dir)?;
    check_identity(&mirror, &link).await?;

    let start = std::time::Instant::now();
    let pulled = mirror.pull(link).await?;

    if pulled == 0 {
        println!("Already up to date at v{}.", mirror.local_version());
        return Ok(());
    }
    println!(
        "Pulled {} record(s) in {}ms; local head is v{}.",
        pulled,
        start.elapsed().as_millis(),
        mirror.local_version()
    );
    Ok(())
}

async fn cmd_watch(dir: String, interval: u64) -> Result<()> {
    let (mut mirror, link) = open_mirror(&dir)?;
    check_identity(&mirror, &link).await?;

    info!(
        "Watching {} at {} every {}s",
        mirror.state().source_id,
        mirror.state().server_url,
        interval
    );

    loop {
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(interval)) => {
                match mirror.pull(link.clone()).await {
                    Ok(0) => {}
                    Ok(pulled) => {
                        info!("Pulled {} record(s); local head is v{}", pulled, mirror.local_version());
                    }
                    // Keep watching through transient failures
                    Err(e) => warn!("Pull failed: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping watch at v{}", mirror.local_version());
                return Ok(());
            }
        }
    }
}

async fn cmd_status(dir: String) -> Result<()> {
    let (mirror, link) = open_mirror(&dir)?;
    let state = mirror.state();

    println!("Mirror:     {}", dir);
    println!("Server:     {}", state.server_url);
    println!("Registry:   {}", state.registry_id);
    println!("Source:     {}", state.source_id);
    println!("Local HEAD: v{}", mirror.local_version());

    if state.last_sync_timestamp > 0 {
        let date = chrono::DateTime::from_timestamp(state.last_sync_timestamp, 0)
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| state.last_sync_timestamp.to_string());
        println!("Last pull:  {} ({} record(s) total)", date, state.total_pulled);
    } else {
        println!("Last pull:  never");
    }

    match link.describe_source(&state.source_id).await {
        Ok(desc) => {
            let behind = desc.head_version.saturating_sub(mirror.local_version());
            println!("Server HEAD: v{} ({} behind)", desc.head_version, behind);
        }
        Err(e) => println!("Server unreachable: {}", e),
    }
    Ok(())
}

async fn cmd_submit(dir: String, file: String, max_attempts: u32) -> Result<()> {
    let payload = std::fs::read(&file)?;
    if payload.is_empty() {
        return Err(anyhow!("refusing to submit an empty patch: {}", file));
    }

    let (mut mirror, link) = open_mirror(&dir)?;
    check_identity(&mirror, &link).await?;

    let version = mirror.submit(link, payload, max_attempts).await?;
    println!("Accepted at v{}.", version);
    Ok(())
}

async fn cmd_verify(dir: String, local_only: bool) -> Result<()> {
    let (mirror, link) = open_mirror(&dir)?;

    println!("Verifying local log chain...");
    mirror.verify()?;
    let local_head = mirror.local_version();
    println!("  OK: v1 through v{} verified", local_head);

    if local_only || local_head == 0 {
        return Ok(());
    }

    // The server's record at our head must be the record we hold.
    let theirs = link
        .fetch_range(&mirror.state().source_id, local_head, Some(local_head))
        .await?;
    let ours = mirror.read_range(local_head, Some(local_head))?;
    match (theirs.first(), ours.first()) {
        (Some(a), Some(b)) if a.hash() == b.hash() => {
            println!("  OK: server agrees at v{}", local_head);
            Ok(())
        }
        (Some(_), Some(_)) => Err(anyhow!(
            "mirror diverged from server at v{}; remove and re-init",
            local_head
        )),
        _ => Err(anyhow!("server no longer holds v{}", local_head)),
    }
}
