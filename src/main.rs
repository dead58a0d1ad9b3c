use colored::Colorize;
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;
use vmvault::config::VaultConfig;
use vmvault::db_manager::DatabaseManager;
use vmvault::engine::BackupEngine;
use vmvault::export::ExportServer;
use vmvault::joblog::{DbSink, JobTracker, LogWriter, RecordQueue};
use vmvault::platforms::PlatformRegistry;
use vmvault::repository::{ChainManager, RepositoryManager, RetentionSweeper};
use vmvault::restore::MountManager;

fn print_banner(title: &str, color: fn(&str) -> colored::ColoredString) {
    let border = "╔═══════════════════════════════════════════════════════════════╗";
    let bottom = "╚═══════════════════════════════════════════════════════════════╝";

    println!("{}", color(border));
    println!("{}", color(&format!("║{:^63}║", title)));
    println!("{}", color(bottom));
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    env_logger::init();

    print_banner("vmvault protection engine", |s| s.cyan());

    let config = VaultConfig::read().expect("Failed to read config file");

    // Database and schema.
    let db_manager = DatabaseManager::new(&config.database.url).await?;
    let pool = db_manager.get_pool().clone();

    // Job/log substrate: bounded queue, batched writer.
    let queue = RecordQueue::new(config.log.queue_size, config.log.drop_policy);
    let sink = Arc::new(DbSink::new(pool.clone()));
    let writer = LogWriter::new(Arc::clone(&queue), sink).spawn();
    let tracker = JobTracker::new(Arc::clone(&queue));

    // Repository layer and retention sweeping.
    let repositories = Arc::new(RepositoryManager::new(
        pool.clone(),
        &config.repository.mount_root,
    ));
    let chains = Arc::new(ChainManager::new(pool.clone()));
    let sweeper = RetentionSweeper::new(
        pool.clone(),
        Duration::from_secs(config.repository.retention_sweep_secs),
    );
    let sweeper_stop = sweeper.stop_signal();
    let sweeper_task = sweeper.spawn();

    // Export server.
    let exports = ExportServer::new(&config.export);
    exports.start().await?;

    // Source platforms come from the connector inventory; an empty
    // registry is valid until connectors are configured.
    let platforms = Arc::new(PlatformRegistry::new());

    let _engine = BackupEngine::new(
        pool.clone(),
        Arc::clone(&tracker),
        Arc::clone(&repositories),
        Arc::clone(&chains),
        Arc::clone(&exports),
        platforms,
        config.transport.clone(),
        config.engine.clone(),
        &config.export.socket_path,
    );

    let mounts = MountManager::new(
        pool.clone(),
        Arc::clone(&repositories),
        Arc::clone(&exports),
        &config.export.socket_path,
        &config.restore,
    );
    mounts.start();

    info!("engine initialised; waiting for shutdown signal");
    tokio::signal::ctrl_c().await?;
    print_banner("shutting down", |s| s.yellow());

    mounts.shutdown().await;
    exports.shutdown();
    sweeper_stop.cancel();
    if let Err(e) = sweeper_task.await {
        error!("retention sweeper did not stop cleanly: {}", e);
    }
    repositories.shutdown().await;
    writer.shutdown().await;

    info!("shutdown complete");
    Ok(())
}
