//! TF aggregation node.
//!
//! Usage:
//!   aggregator --scheduler-endpoint host:9000 --process-id agg-0 \
//!              [--buffer-size 34359738368] ...

use dotenv::dotenv;
use log::info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use tfflow::aggregator_core::accounting::BufferAccounting;
use tfflow::aggregator_core::sink::{run_drain_loop, LogSink};
use tfflow::aggregator_core::{build, run_scheduler_link, update};
use tfflow::config::{fatal_config_exit, AggregatorConfig};
use tfflow::discovery::DiscoveryDb;
use tfflow::fifo::ConcurrentFifo;
use tfflow::messages::{Hello, PeerRole};

#[tokio::main]
async fn main() {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let config = match AggregatorConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => fatal_config_exit(&e.to_string()),
    };

    info!("🚀 TF aggregation node starting");
    info!("   ├─ process_id: {}", config.process_id);
    info!("   ├─ partition:  {}", config.partition_id);
    info!("   ├─ scheduler:  {}", config.scheduler_endpoint);
    info!("   └─ TF buffer:  {} bytes", config.buffer_size);

    let discovery = match DiscoveryDb::open(&config.discovery_db, &config.partition_id) {
        Ok(db) => db,
        Err(e) => fatal_config_exit(&format!("Cannot open the discovery registry: {}", e)),
    };
    if let Err(e) = discovery.register(&config.process_id, PeerRole::Aggregator, "-") {
        fatal_config_exit(&format!("Discovery registration failed: {}", e));
    }
    let discovery = Arc::new(discovery);

    let accounting = Arc::new(BufferAccounting::new(config.buffer_size));
    let requests = Arc::new(ConcurrentFifo::new());
    let running = Arc::new(AtomicBool::new(true));

    let (sched_tx, sched_rx) = mpsc::unbounded_channel();
    let (built_tx, built_rx) = mpsc::channel(16);

    tokio::spawn(run_scheduler_link(
        config.scheduler_endpoint.clone(),
        Hello {
            role: PeerRole::Aggregator,
            process_id: config.process_id.clone(),
            partition_id: config.partition_id.clone(),
        },
        accounting.clone(),
        requests.clone(),
        sched_rx,
    ));

    tokio::spawn(run_drain_loop(built_rx, Arc::new(LogSink), accounting.clone()));

    let build_thread = {
        let (req, acc, disc) = (requests.clone(), accounting.clone(), discovery.clone());
        std::thread::Builder::new()
            .name("tfb-build".to_string())
            .spawn(move || build::run_build_loop(req, acc, disc, built_tx))
            .expect("spawn build thread")
    };
    let update_thread = {
        let (acc, run) = (accounting.clone(), running.clone());
        let (pid, part) = (config.process_id.clone(), config.partition_id.clone());
        std::thread::Builder::new()
            .name("tfb-update".to_string())
            .spawn(move || update::run_update_loop(acc, sched_tx, pid, part, run))
            .expect("spawn update thread")
    };

    info!("✅ Aggregation node ready");
    info!("🔄 Press CTRL+C to shut down");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("⚠️  Received CTRL+C, shutting down...");
                break;
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {
                if accounting.terminate_requested() && requests.is_empty() {
                    info!("Partition terminated and builds drained, shutting down");
                    break;
                }
            }
        }
    }

    // drain outstanding builds, then stop the workers
    accounting.set_accepting(false);
    requests.stop();
    let _ = build_thread.join();
    running.store(false, Ordering::Release);
    accounting.set_accepting(false); // wake the update waiter
    let _ = update_thread.join();

    let _ = discovery.deregister(&config.process_id);

    info!(
        "✅ Aggregation node stopped. buffered_tfs={} buffered_bytes={}",
        accounting.num_buffered_tfs(),
        accounting.current_tf_buffer_size()
    );
}
