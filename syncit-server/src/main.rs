//! syncit-server - standalone collaborative editing server
//!
//! Serves the session engine over WebSocket with RocksDB persistence.
//! Every open session is flushed to disk on Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use syncit_collab::broadcast::TopicHub;
use syncit_collab::registry::SessionRegistry;
use syncit_collab::router::Router;
use syncit_collab::runner::{CodeRunner, DockerConfig, DockerExecutor};
use syncit_collab::server::{ServerConfig, SyncServer};
use syncit_collab::storage::{RocksStore, StoreConfig};

#[derive(Parser)]
#[command(name = "syncit-server")]
#[command(version)]
#[command(about = "Real-time collaborative file editing server", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long, env = "SYNCIT_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB data directory
    #[arg(short, long, env = "SYNCIT_DATA", default_value = "syncit_data")]
    data: PathBuf,

    /// Frames buffered per subscriber before it lags
    #[arg(long, env = "SYNCIT_TOPIC_CAPACITY", default_value = "256")]
    topic_capacity: usize,

    /// Allow clients to run files in Docker
    #[arg(long)]
    enable_run: bool,

    /// Docker binary used for runs
    #[arg(long, default_value = "docker")]
    docker_bin: String,

    /// Per-run time limit in seconds
    #[arg(long, default_value = "10")]
    run_timeout: u64,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let store = Arc::new(RocksStore::open(StoreConfig {
        path: args.data.clone(),
        ..StoreConfig::default()
    })?);
    log::info!(
        "Opened {} with {} saved files",
        store.path().display(),
        store.list_files()?.len()
    );
    let registry = Arc::new(SessionRegistry::new());
    let router = Arc::new(Router::new(
        registry.clone(),
        Arc::new(TopicHub::new(args.topic_capacity)),
        store.clone(),
    ));

    // The router already carries the store, so no storage_path here.
    let config = ServerConfig {
        bind_addr: args.bind,
        topic_capacity: args.topic_capacity,
        storage_path: None,
    };
    let mut server = SyncServer::with_router(config, router);

    if args.enable_run {
        let executor = DockerExecutor::new(DockerConfig {
            docker_bin: args.docker_bin,
            timeout: Duration::from_secs(args.run_timeout),
            ..DockerConfig::default()
        });
        server = server.with_runner(Arc::new(CodeRunner::new(
            registry,
            store.clone(),
            Arc::new(executor),
        )));
        log::info!("Code execution enabled");
    }

    let report = server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    log::info!(
        "Shutdown complete: {} flushed, {} contended, {} failed",
        report.flushed.len(),
        report.contended.len(),
        report.failed.len()
    );
    for (id, err) in &report.failed {
        log::error!("File {id} was not persisted: {err}");
    }

    let stats = server.stats().await;
    log::info!(
        "Served {} connections, {} commands ({} rejected)",
        stats.total_connections,
        stats.total_commands,
        stats.rejected_commands
    );

    store.sync()?;

    Ok(())
}
