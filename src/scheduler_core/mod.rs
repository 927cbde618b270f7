//! TF scheduler process core.
//!
//! Accepts duplex connections from builders and aggregators, tracks the
//! fleet through updates, completes TimeFrames from STF announcements
//! and assigns each complete TimeFrame to one aggregation node.

pub mod registry;
pub mod tf_info;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::config::SchedulerConfig;
use crate::discovery::DiscoveryDb;
use crate::messages::{
    BuildTfResponse, FromScheduler, Hello, PartitionInfo, PeerRole, StfAnnounce,
    TfBuilderUpdateMessage, TfBuildingInformation, ToScheduler,
};
use crate::net::{self, SchedulerServerConn};
use crate::scheduler_core::registry::AggregatorRegistry;
use crate::scheduler_core::tf_info::TfCompletionTracker;

/// Registry/tracker sweep period.
pub const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

const SOURCE_CACHE_REFRESH: Duration = Duration::from_secs(1);

struct SourceCache {
    refreshed_at: Option<Instant>,
    sources: HashSet<String>,
}

pub struct SchedulerService {
    partition_id: String,
    registry: AggregatorRegistry,
    tracker: TfCompletionTracker,
    discovery: DiscoveryDb,
    source_cache: Mutex<SourceCache>,
    /// Outbound link per connected aggregation node.
    agg_links: Mutex<HashMap<String, mpsc::UnboundedSender<FromScheduler>>>,
    /// Assignments awaiting a response, keyed by tf id.
    in_flight: Mutex<HashMap<u64, (String, TfBuildingInformation)>>,
    /// Complete TimeFrames that found no capacity yet.
    unassigned: Mutex<VecDeque<TfBuildingInformation>>,
    running: AtomicBool,
    terminate_requested: AtomicBool,
}

impl SchedulerService {
    pub fn new(config: &SchedulerConfig, discovery: DiscoveryDb) -> Self {
        Self {
            partition_id: config.partition_id.clone(),
            registry: AggregatorRegistry::new(),
            tracker: TfCompletionTracker::new(),
            discovery,
            source_cache: Mutex::new(SourceCache {
                refreshed_at: None,
                sources: HashSet::new(),
            }),
            agg_links: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            unassigned: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(true),
            terminate_requested: AtomicBool::new(false),
        }
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn registry(&self) -> &AggregatorRegistry {
        &self.registry
    }

    /// Builder set from discovery, cached for a second.
    fn expected_sources(&self) -> HashSet<String> {
        let mut cache = self.source_cache.lock().unwrap();
        let fresh = cache
            .refreshed_at
            .map(|at| at.elapsed() < SOURCE_CACHE_REFRESH)
            .unwrap_or(false);
        if !fresh {
            match self.discovery.builder_ids() {
                Ok(ids) => {
                    cache.sources = ids.into_iter().collect();
                    cache.refreshed_at = Some(Instant::now());
                }
                Err(e) => log::error!("Discovery query failed: {}", e),
            }
        }
        cache.sources.clone()
    }

    pub fn handle_announce(&self, announce: StfAnnounce) {
        if self.terminate_requested.load(Ordering::Acquire) {
            return;
        }
        let expected = self.expected_sources();
        if let Some(info) = self.tracker.add_announce(announce, &expected) {
            self.assign_or_queue(info);
        }
    }

    pub fn handle_update(&self, update: TfBuilderUpdateMessage) {
        if update.failed_tf_count > 0 {
            log::warn!(
                "Aggregation node reported failed TF builds. tfb_id={} failed={}",
                update.process_id,
                update.failed_tf_count
            );
        }
        self.registry.update_info(update);
    }

    pub fn handle_build_response(&self, peer_id: &str, response: BuildTfResponse) {
        let removed = self.in_flight.lock().unwrap().remove(&response.tf_id);
        let Some((assigned_to, info)) = removed else {
            log::warn!(
                "Build response for unknown assignment. tf_id={} tfb_id={}",
                response.tf_id,
                peer_id
            );
            return;
        };

        if assigned_to != peer_id {
            log::warn!(
                "Build response from the wrong node. tf_id={} expected={} received={}",
                response.tf_id,
                assigned_to,
                peer_id
            );
        }

        if response.accepted {
            log::debug!(
                "TimeFrame accepted. tf_id={} tfb_id={} size={}",
                response.tf_id,
                peer_id,
                info.tf_size
            );
            return;
        }

        // declined: the node is out of room regardless of our estimate
        log::warn!(
            "TimeFrame declined, marking node not ready. tf_id={} tfb_id={} reason={}",
            response.tf_id,
            peer_id,
            response
                .reason
                .map(|r| r.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        );
        self.registry.remove_ready(peer_id);
        self.unassigned.lock().unwrap().push_back(info);
    }

    /// Register the outbound link of a freshly connected aggregator.
    pub fn register_aggregator_link(
        &self,
        process_id: &str,
        link: mpsc::UnboundedSender<FromScheduler>,
    ) {
        self.agg_links
            .lock()
            .unwrap()
            .insert(process_id.to_string(), link);
    }

    /// Connection to an aggregator dropped: requeue whatever it owed us.
    pub fn handle_peer_gone(&self, process_id: &str) {
        self.agg_links.lock().unwrap().remove(process_id);
        self.registry.remove_ready(process_id);

        let mut in_flight = self.in_flight.lock().unwrap();
        let orphaned: Vec<u64> = in_flight
            .iter()
            .filter(|(_, (assigned_to, _))| assigned_to == process_id)
            .map(|(tf_id, _)| *tf_id)
            .collect();
        if orphaned.is_empty() {
            return;
        }

        let mut unassigned = self.unassigned.lock().unwrap();
        for tf_id in orphaned {
            if let Some((_, info)) = in_flight.remove(&tf_id) {
                log::warn!(
                    "Requeueing TimeFrame after node loss. tf_id={} tfb_id={}",
                    tf_id,
                    process_id
                );
                unassigned.push_back(info);
            }
        }
    }

    /// Try candidates in ready order until the request is on the wire;
    /// with no capacity anywhere the TimeFrame waits for a retry.
    fn assign_or_queue(&self, info: TfBuildingInformation) {
        loop {
            let Some(tfb_id) = self.registry.find_tf_builder_for_tf(info.tf_size) else {
                log::debug!(
                    "No aggregation node has capacity. tf_id={} size={}",
                    info.tf_id,
                    info.tf_size
                );
                self.unassigned.lock().unwrap().push_back(info);
                return;
            };

            self.registry.mark_with_tf_id(&tfb_id, info.tf_id);

            let link = self.agg_links.lock().unwrap().get(&tfb_id).cloned();
            match link {
                Some(link) => {
                    self.in_flight
                        .lock()
                        .unwrap()
                        .insert(info.tf_id, (tfb_id.clone(), info.clone()));
                    if link
                        .send(FromScheduler::BuildTfRequest(info.clone()))
                        .is_ok()
                    {
                        log::debug!(
                            "Assigned TimeFrame. tf_id={} tfb_id={} size={}",
                            info.tf_id,
                            tfb_id,
                            info.tf_size
                        );
                        return;
                    }
                    // link died under us: clean up and try the next node
                    self.in_flight.lock().unwrap().remove(&info.tf_id);
                    self.handle_peer_gone(&tfb_id);
                }
                None => {
                    // selected a node we no longer talk to
                    self.handle_peer_gone(&tfb_id);
                }
            }
        }
    }

    fn retry_unassigned(&self) {
        let queued: Vec<TfBuildingInformation> = {
            let mut unassigned = self.unassigned.lock().unwrap();
            unassigned.drain(..).collect()
        };
        if queued.is_empty() {
            return;
        }
        log::debug!("Retrying unassigned TimeFrames. count={}", queued.len());
        for info in queued {
            self.assign_or_queue(info);
        }
    }

    pub fn housekeeping_pass(&self) {
        for id in self.registry.evict_stale() {
            self.agg_links.lock().unwrap().remove(&id);
        }
        for (tf_id, announced) in self.tracker.sweep_stale() {
            log::warn!(
                "Dropping incomplete TimeFrame. tf_id={} announced_sources={}",
                tf_id,
                announced
            );
        }
        self.retry_unassigned();
    }

    /// JSON view of the partition membership for diagnostics.
    pub fn discovery_snapshot(&self) -> rusqlite::Result<String> {
        self.discovery.snapshot_json()
    }

    /// Stop the partition: no new assignments, every node told to drain.
    pub fn terminate_partition(&self) {
        if self.terminate_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("🛑 Terminating partition '{}'", self.partition_id);

        let links = self.agg_links.lock().unwrap();
        for (id, link) in links.iter() {
            let message = FromScheduler::TerminatePartition(PartitionInfo {
                partition_id: self.partition_id.clone(),
            });
            if link.send(message).is_err() {
                log::debug!("Terminate not delivered. tfb_id={}", id);
            }
        }
    }
}

/// Housekeeping thread body.
pub fn run_housekeeping(service: Arc<SchedulerService>) {
    while service.running() {
        std::thread::sleep(HOUSEKEEPING_INTERVAL);
        service.housekeeping_pass();
    }
    log::debug!("Exiting scheduler housekeeping thread");
}

/// Accept loop for builder and aggregator connections.
pub async fn run_listener(service: Arc<SchedulerService>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                log::debug!("Peer connected: {}", peer);
                tokio::spawn(handle_connection(service.clone(), stream));
            }
            Err(e) => log::error!("Scheduler accept failed: {}", e),
        }
    }
}

async fn handle_connection(service: Arc<SchedulerService>, stream: TcpStream) {
    let mut conn: SchedulerServerConn = net::framed(stream);

    let hello = match conn.next().await {
        Some(Ok(ToScheduler::Hello(hello))) => hello,
        other => {
            log::warn!("Peer did not identify itself, closing. got={:?}", other.is_some());
            return;
        }
    };
    log::info!(
        "👋 Peer identified. role={:?} process_id={} partition={}",
        hello.role,
        hello.process_id,
        hello.partition_id
    );

    match hello.role {
        PeerRole::Builder => run_builder_peer(service, conn).await,
        PeerRole::Aggregator => run_aggregator_peer(service, conn, hello).await,
    }
}

async fn run_builder_peer(service: Arc<SchedulerService>, mut conn: SchedulerServerConn) {
    while let Some(message) = conn.next().await {
        match message {
            Ok(ToScheduler::StfAnnounce(announce)) => service.handle_announce(announce),
            Ok(other) => log::debug!("Unexpected message on a builder link: {:?}", other),
            Err(e) => {
                log::warn!("Builder link error: {}", e);
                break;
            }
        }
    }
    log::debug!("Builder link closed");
}

async fn run_aggregator_peer(
    service: Arc<SchedulerService>,
    mut conn: SchedulerServerConn,
    hello: Hello,
) {
    let (link_tx, mut link_rx) = mpsc::unbounded_channel();
    service.register_aggregator_link(&hello.process_id, link_tx);

    loop {
        tokio::select! {
            outgoing = link_rx.recv() => match outgoing {
                Some(message) => {
                    if let Err(e) = conn.send(message).await {
                        log::warn!("Aggregator link send failed: {}", e);
                        break;
                    }
                }
                None => break,
            },
            incoming = conn.next() => match incoming {
                Some(Ok(ToScheduler::TfBuilderUpdate(update))) => service.handle_update(update),
                Some(Ok(ToScheduler::BuildTfResponse(response))) => {
                    service.handle_build_response(&hello.process_id, response)
                }
                Some(Ok(ToScheduler::PartitionResponse(response))) => {
                    log::info!(
                        "Partition termination acknowledged. tfb_id={} ok={}",
                        hello.process_id,
                        response.acknowledged
                    );
                }
                Some(Ok(other)) => log::debug!("Unexpected message on an aggregator link: {:?}", other),
                Some(Err(e)) => {
                    log::warn!("Aggregator link error: {}", e);
                    break;
                }
                None => break,
            },
        }
    }

    service.handle_peer_gone(&hello.process_id);
    log::debug!("Aggregator link closed. tfb_id={}", hello.process_id);
}
