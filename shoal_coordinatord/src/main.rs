//! Coordinator daemon: the one binary in the workspace with a `main`.
//!
//! Everything else here is a library a collaborator embeds directly
//! (`shoal_api::init`/`connect` run in the application's own process).
//! This binary exists for the case where the creator role is better
//! played by a dedicated long-running process instead of the first
//! application process to start: it creates the segment, publishes the
//! root map, runs the liveness reaper and reclamation sweep on a fixed
//! interval, and prints the connectable segment name peers are handed
//! on argv (per §6/§9's "process control" contract — the core imposes
//! no spawn mechanism, so this daemon prints the name and gets out of
//! the way).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use shoal_common::config::{ConfigLoader, RuntimeConfig};
use shoal_objects::Map;
use shoal_shm::coordinator::Reaper;
use shoal_shm::Segment;
use shoal_txn::Engine;

#[derive(Parser)]
#[command(
    name = "shoal-coordinatord",
    about = "Owns a shoal shared-memory segment's lifecycle: creation, root publication, liveness reaping"
)]
struct Cli {
    /// Path to a `shoal.toml` config file; falls back to defaults if absent.
    #[arg(long, default_value = "shoal.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a segment, publish its root map, and run the reaper and
    /// reclamation sweeper until interrupted (SIGINT/Ctrl-C).
    Run {
        /// Explicit segment name; a random one is generated if omitted.
        #[arg(long)]
        name: Option<String>,
    },
    /// Attach to an existing segment and print its current status once.
    Status {
        #[arg(long)]
        name: String,
    },
}

#[derive(Debug, thiserror::Error)]
enum DaemonError {
    #[error(transparent)]
    Config(#[from] shoal_common::config::ConfigError),
    #[error(transparent)]
    Shm(#[from] shoal_shm::ShmError),
    #[error(transparent)]
    Txn(#[from] shoal_txn::TxnError),
}

fn generate_segment_name() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    format!("shoal-{}-{}", std::process::id(), nanos)
}

#[tokio::main]
async fn main() -> Result<(), DaemonError> {
    shoal_shm::init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Run { name } => run(&cli.config, name).await,
        Command::Status { name } => status(&name),
    }
}

async fn run(config_path: &str, name: Option<String>) -> Result<(), DaemonError> {
    let cfg = RuntimeConfig::load(config_path)?.apply_env_overrides();
    cfg.validate()?;

    let name = name.unwrap_or_else(generate_segment_name);
    let segment = Segment::create(&name, cfg.segment_size)?;
    info!(name = %name, participants = segment.participant_count(), "segment created");

    let engine = Engine::new(Arc::new(segment));
    let root = engine.transaction(|ctx| Map::new(ctx).map(|m| m.handle()).map_err(Into::into))?;
    engine.segment().set_root_handle(root);
    info!(root = root.raw(), "root map published");

    // argv/stdout is the hand-off contract: a host process spawning this
    // daemon reads the printed name on the next line of stdout and
    // passes it to peers it spawns.
    println!("{name}");

    let reaper = Reaper::new(Duration::from_secs(cfg.reaper_grace_s));
    let shutdown = Arc::new(AtomicBool::new(false));
    let engine = Arc::new(engine);

    let maintenance = {
        let engine = Arc::clone(&engine);
        let shutdown = Arc::clone(&shutdown);
        let segment_name = name.clone();
        tokio::task::spawn_blocking(move || {
            while !shutdown.load(Ordering::Acquire) {
                let reaped = reaper.sweep_after_grace(engine.segment().participant_table());
                if reaped > 0 {
                    warn!(segment = %segment_name, reaped, "reaper marked dead participants");
                }
                let freed = engine.sweep();
                if freed > 0 {
                    info!(segment = %segment_name, freed, "reclamation sweep freed objects");
                }
            }
        })
    };

    tokio::signal::ctrl_c().await.ok();
    info!("received interrupt, shutting down coordinator");
    shutdown.store(true, Ordering::Release);
    if let Err(err) = maintenance.await {
        warn!(?err, "maintenance loop task panicked");
    }

    // `engine` is now the last strong reference (the background thread
    // joined above), so dropping it here drops the `Segment`: this
    // process unregisters its participant slot and, as creator, removes
    // the segment's backing file from `/dev/shm`.
    drop(engine);
    Ok(())
}

fn status(name: &str) -> Result<(), DaemonError> {
    let segment = Segment::attach(name)?;
    let root = segment.root_handle();
    println!("segment:      {name}");
    println!("participants: {}", segment.participant_count());
    println!("root handle:  {}", if root.is_null() { "unpublished".to_string() } else { root.raw().to_string() });
    println!("alloc epoch:  {}", segment.current_epoch());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn generated_segment_names_are_unique() {
        let a = generate_segment_name();
        let b = generate_segment_name();
        assert_ne!(a, b);
        assert!(a.starts_with("shoal-"));
    }
}
