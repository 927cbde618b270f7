//! STF builder process.
//!
//! Receives readout multiparts on the input channel, assembles and
//! orders SubTimeFrames, and publishes them through the source buffer
//! (or the workflow channel, or nowhere in standalone mode).
//!
//! Usage:
//!   builder --rdh-version 6 [--detector TPC] [--stand-alone] ...
//!
//! Channels resolve through TFFLOW_CHAN_<NAME> environment variables.

use dotenv::dotenv;
use log::{error, info};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

use tfflow::builder_core::output::OutputMode;
use tfflow::builder_core::sender::{self, SourceBuffer};
use tfflow::builder_core::{
    assembly, input, output, run_info_loop, sequencer, BuilderCounters, BuilderPipeline,
    BuilderState,
};
use tfflow::config::{fatal_config_exit, resolve_channel, BuilderConfig};
use tfflow::discovery::DiscoveryDb;
use tfflow::messages::{Hello, PeerRole};
use tfflow::net;

/// Bytes of serialized STFs kept for aggregator pulls.
const SOURCE_BUFFER_CAPACITY: u64 = 4 << 30;

#[tokio::main]
async fn main() {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let config = match BuilderConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => fatal_config_exit(&e.to_string()),
    };

    info!("🚀 STF builder starting");
    info!("   ├─ process_id: {}", config.process_id);
    info!("   ├─ partition:  {}", config.partition_id);
    info!("   ├─ rdh_version: {}", config.rdh_version.as_u8());
    info!(
        "   ├─ detector:   {}",
        config
            .detector
            .map(|d| d.as_str().to_string())
            .unwrap_or_else(|| "(from RDH)".to_string())
    );
    info!("   ├─ subspec_mode: {}", config.subspec_mode.as_str());
    if config.pipeline_limited() {
        info!("   ├─ max buffered STFs: {}", config.max_stfs_in_pipeline);
    } else {
        info!("   ├─ max buffered STFs: unlimited (back-pressure possible)");
    }
    info!(
        "   └─ built STFs: {}",
        if config.max_built_stfs == 0 {
            "not limited".to_string()
        } else {
            format!("limited to {}", config.max_built_stfs)
        }
    );

    let input_addr = match resolve_channel(&config.input_channel_name) {
        Ok(addr) => addr,
        Err(e) => fatal_config_exit(&e.to_string()),
    };
    let readout_listener = match TcpListener::bind(&input_addr).await {
        Ok(listener) => listener,
        Err(e) => fatal_config_exit(&format!(
            "Input channel '{}' cannot bind {}: {}",
            config.input_channel_name, input_addr, e
        )),
    };
    info!("✅ Input channel '{}' bound at {}", config.input_channel_name, input_addr);

    let state = Arc::new(BuilderState::new());
    let counters = Arc::new(BuilderCounters::new());
    let pipeline = Arc::new(BuilderPipeline::new(
        counters.clone(),
        config.max_stfs_in_pipeline,
    ));

    let (receiver, events) = net::readout_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(net::readout_accept_loop(
        readout_listener,
        events.clone(),
        shutdown_rx,
    ));

    // pick the output wiring: exactly one of the two sending modes, or none
    let mut discovery: Option<DiscoveryDb> = None;
    let mode = if config.standalone {
        OutputMode::Standalone
    } else if config.dpl_enabled() {
        let dpl_addr = match resolve_channel(&config.dpl_channel_name) {
            Ok(addr) => addr,
            Err(e) => fatal_config_exit(&e.to_string()),
        };
        info!("✅ Workflow channel '{}' at {}", config.dpl_channel_name, dpl_addr);

        let (tx, mut rx) = mpsc::channel(64);
        tokio::spawn(async move {
            use futures::SinkExt;
            let stream = match net::connect_with_retry(&dpl_addr).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("❌ Cannot reach the workflow consumer: {}", e);
                    return;
                }
            };
            let mut conn: net::WorkflowClientConn = net::framed(stream);
            while let Some(message) = rx.recv().await {
                if let Err(e) = conn.send(message).await {
                    error!("Workflow channel send failed: {}", e);
                    break;
                }
            }
        });
        OutputMode::Workflow(tx)
    } else {
        if config.scheduler_endpoint.is_empty() {
            fatal_config_exit("scheduler-endpoint must be set when sending to aggregation");
        }
        let output_addr = match resolve_channel(&config.output_channel_name) {
            Ok(addr) => addr,
            Err(e) => fatal_config_exit(&e.to_string()),
        };
        let stf_listener = match TcpListener::bind(&output_addr).await {
            Ok(listener) => listener,
            Err(e) => fatal_config_exit(&format!(
                "Output channel '{}' cannot bind {}: {}",
                config.output_channel_name, output_addr, e
            )),
        };
        let served_at = stf_listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or(output_addr);
        info!("✅ Source buffer serving STF pulls at {}", served_at);

        let db = match DiscoveryDb::open(&config.discovery_db, &config.partition_id) {
            Ok(db) => db,
            Err(e) => fatal_config_exit(&format!("Cannot open the discovery registry: {}", e)),
        };
        if let Err(e) = db.register(&config.process_id, PeerRole::Builder, &served_at) {
            fatal_config_exit(&format!("Discovery registration failed: {}", e));
        }
        discovery = Some(db);

        let buffer = Arc::new(SourceBuffer::new(SOURCE_BUFFER_CAPACITY));
        let (entry_tx, entry_rx) = mpsc::channel(64);
        let (sched_tx, sched_rx) = mpsc::unbounded_channel();

        tokio::spawn(sender::run_source_buffer(
            entry_rx,
            buffer.clone(),
            sched_tx,
            counters.clone(),
            config.process_id.clone(),
        ));
        tokio::spawn(sender::run_stf_server(
            stf_listener,
            buffer,
            config.process_id.clone(),
        ));
        tokio::spawn(sender::run_scheduler_link(
            config.scheduler_endpoint.clone(),
            Hello {
                role: PeerRole::Builder,
                process_id: config.process_id.clone(),
                partition_id: config.partition_id.clone(),
            },
            sched_rx,
        ));
        OutputMode::Serializer(entry_tx)
    };

    // stage threads, wired input → assembly → sequencer → output
    let input_thread = {
        let (s, c, p) = (state.clone(), counters.clone(), pipeline.clone());
        std::thread::Builder::new()
            .name("stfb-input".to_string())
            .spawn(move || input::run_input_stage(receiver, s, c, p))
            .expect("spawn input thread")
    };
    let assembly_thread = {
        let (cfg, s, c, p) = (config.clone(), state.clone(), counters.clone(), pipeline.clone());
        std::thread::Builder::new()
            .name("stfb-assembly".to_string())
            .spawn(move || assembly::run_assembly_stage(&cfg, s, c, p))
            .expect("spawn assembly thread")
    };
    let sequencer_thread = {
        let (s, p) = (state.clone(), pipeline.clone());
        std::thread::Builder::new()
            .name("stfb-seq".to_string())
            .spawn(move || sequencer::run_sequencer_stage(s, p))
            .expect("spawn sequencer thread")
    };
    let output_thread = {
        let (s, c, p) = (state.clone(), counters.clone(), pipeline.clone());
        let max_built = config.max_built_stfs;
        std::thread::Builder::new()
            .name("stfb-output".to_string())
            .spawn(move || output::run_output_stage(s, c, p, mode, max_built))
            .expect("spawn output thread")
    };
    let info_thread = {
        let (s, c) = (state.clone(), counters.clone());
        std::thread::Builder::new()
            .name("stfb-info".to_string())
            .spawn(move || run_info_loop(s, c))
            .expect("spawn info thread")
    };

    info!("✅ All pipeline stages running");
    info!("🔄 Press CTRL+C to shut down");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("⚠️  Received CTRL+C, shutting down...");
                break;
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {
                if !state.running() {
                    info!("Output loop finished, shutting down");
                    break;
                }
            }
        }
    }

    // shutdown order matters: stop the source first, then drain the
    // stages front to back, memory-holding structures last
    state.set_running(false);
    let _ = shutdown_tx.send(true);
    events.stop();
    let _ = input_thread.join();
    pipeline.input_queue.stop();
    let _ = assembly_thread.join();
    pipeline.sequencer_queue.stop();
    let _ = sequencer_thread.join();
    pipeline.output_queue.stop();
    let _ = output_thread.join();
    let _ = info_thread.join();
    pipeline.clear();

    if let Some(db) = discovery {
        let _ = db.deregister(&config.process_id);
    }

    info!("✅ STF builder stopped. sent_total={}", counters.sent_total());
}
