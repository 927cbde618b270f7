//! TF scheduler process. One per partition.
//!
//! Usage:
//!   scheduler --listen-endpoint 0.0.0.0:9000 [--partition-id prod] ...

use dotenv::dotenv;
use log::info;
use std::sync::Arc;
use tokio::net::TcpListener;

use tfflow::config::{fatal_config_exit, SchedulerConfig};
use tfflow::discovery::DiscoveryDb;
use tfflow::scheduler_core::{run_housekeeping, run_listener, SchedulerService};

#[tokio::main]
async fn main() {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let config = match SchedulerConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => fatal_config_exit(&e.to_string()),
    };

    info!("🚀 TF scheduler starting");
    info!("   ├─ partition: {}", config.partition_id);
    info!("   ├─ endpoint:  {}", config.listen_endpoint);
    info!("   └─ discovery: {}", config.discovery_db);

    let discovery = match DiscoveryDb::open(&config.discovery_db, &config.partition_id) {
        Ok(db) => db,
        Err(e) => fatal_config_exit(&format!("Cannot open the discovery registry: {}", e)),
    };

    let listener = match TcpListener::bind(&config.listen_endpoint).await {
        Ok(listener) => listener,
        Err(e) => fatal_config_exit(&format!(
            "Cannot bind the scheduler endpoint {}: {}",
            config.listen_endpoint, e
        )),
    };

    let service = Arc::new(SchedulerService::new(&config, discovery));

    let housekeeping = {
        let service = service.clone();
        std::thread::Builder::new()
            .name("sched-housekeeping".to_string())
            .spawn(move || run_housekeeping(service))
            .expect("spawn housekeeping thread")
    };

    tokio::spawn(run_listener(service.clone(), listener));

    info!("✅ Scheduler ready, waiting for peers");
    info!("🔄 Press CTRL+C to terminate the partition");

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for CTRL+C: {}", e);
    }

    info!("⚠️  Terminating partition...");
    if let Ok(snapshot) = service.discovery_snapshot() {
        log::debug!("Partition membership at termination:\n{}", snapshot);
    }
    service.terminate_partition();

    // give the terminate messages a moment to reach the nodes
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;

    service.stop();
    let _ = housekeeping.join();

    info!("✅ TF scheduler stopped");
}
