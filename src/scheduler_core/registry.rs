//! Aggregation fleet registry and selection engine.
//!
//! Tracks every aggregation node through its periodic updates and keeps
//! a FIFO pool of nodes ready to take a TimeFrame. Selection is first
//! fit over the ready pool with a 10 % size overestimate.
//!
//! Lock order: the global map lock is always taken before the ready
//! pool lock when an operation needs both.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::messages::TfBuilderUpdateMessage;

/// Head-room applied to a TimeFrame size before admission.
pub const TF_SIZE_OVERESTIMATE_PERCENT: u64 = 10;

/// An aggregator that missed updates this long is dropped.
pub const TF_BUILDER_DISCARD_TIMEOUT: Duration = Duration::from_secs(5);

pub fn overestimated_size(size: u64) -> u64 {
    size * (100 + TF_SIZE_OVERESTIMATE_PERCENT) / 100
}

/// Live view of one aggregation node.
pub struct TfBuilderInfo {
    process_id: String,
    last_update: Mutex<Instant>,
    last_message: Mutex<TfBuilderUpdateMessage>,
    last_scheduled_tf: AtomicU64,
    estimated_free_memory: AtomicU64,
    /// Reservations made since the last update arrived.
    reserved_since_update: AtomicU64,
    in_ready_pool: AtomicBool,
}

impl TfBuilderInfo {
    fn new(update: TfBuilderUpdateMessage) -> Self {
        Self {
            process_id: update.process_id.clone(),
            last_update: Mutex::new(Instant::now()),
            estimated_free_memory: AtomicU64::new(update.free_memory),
            last_message: Mutex::new(update),
            last_scheduled_tf: AtomicU64::new(0),
            reserved_since_update: AtomicU64::new(0),
            in_ready_pool: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.process_id
    }

    pub fn estimated_free_memory(&self) -> u64 {
        self.estimated_free_memory.load(Ordering::Acquire)
    }

    pub fn last_scheduled_tf(&self) -> u64 {
        self.last_scheduled_tf.load(Ordering::Acquire)
    }

    pub fn last_built_tf_id(&self) -> u64 {
        self.last_message.lock().unwrap().last_built_tf_id
    }

    fn age(&self) -> Duration {
        self.last_update.lock().unwrap().elapsed()
    }

    fn apply_update(&self, update: TfBuilderUpdateMessage) {
        *self.last_update.lock().unwrap() = Instant::now();
        // reservations made while this update was in flight stay charged
        let reserved = self.reserved_since_update.swap(0, Ordering::AcqRel);
        self.estimated_free_memory
            .store(update.free_memory.saturating_sub(reserved), Ordering::Release);
        *self.last_message.lock().unwrap() = update;
    }

    fn reserve(&self, size: u64) {
        self.reserved_since_update.fetch_add(size, Ordering::AcqRel);
        // not an underflow risk: callers reserve at most the current estimate
        self.estimated_free_memory.fetch_sub(size, Ordering::AcqRel);
    }
}

/// Global map plus ready pool.
pub struct AggregatorRegistry {
    global: Mutex<HashMap<String, Arc<TfBuilderInfo>>>,
    ready: Mutex<VecDeque<Arc<TfBuilderInfo>>>,
}

impl AggregatorRegistry {
    pub fn new() -> Self {
        Self {
            global: Mutex::new(HashMap::new()),
            ready: Mutex::new(VecDeque::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.global.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<Arc<TfBuilderInfo>> {
        self.global.lock().unwrap().get(id).cloned()
    }

    pub fn ready_count(&self) -> usize {
        self.ready.lock().unwrap().len()
    }

    /// Ingest one update. Unknown processes are created and made ready;
    /// known ones re-enter the ready pool once they report free memory.
    pub fn update_info(&self, update: TfBuilderUpdateMessage) {
        let mut global = self.global.lock().unwrap();
        match global.get(&update.process_id) {
            Some(info) => {
                let info = info.clone();
                drop(global);
                info.apply_update(update);
                if info.estimated_free_memory() > 0 {
                    self.add_ready(info);
                }
            }
            None => {
                let info = Arc::new(TfBuilderInfo::new(update));
                log::info!("New aggregation node registered. tfb_id={}", info.id());
                global.insert(info.id().to_string(), info.clone());
                drop(global);
                self.add_ready(info);
            }
        }
    }

    /// Put a node back into the ready pool (no-op when already there).
    pub fn add_ready(&self, info: Arc<TfBuilderInfo>) {
        if info.in_ready_pool.swap(true, Ordering::AcqRel) {
            return;
        }
        self.ready.lock().unwrap().push_back(info);
    }

    pub fn remove_ready(&self, id: &str) {
        let mut ready = self.ready.lock().unwrap();
        if let Some(pos) = ready.iter().position(|info| info.id() == id) {
            let info = ready.remove(pos).unwrap();
            info.in_ready_pool.store(false, Ordering::Release);
            log::debug!("Removed aggregation node from the ready pool. tfb_id={}", id);
        }
    }

    /// First-fit selection over the ready pool. On success the node
    /// leaves the pool and its estimate is charged the overestimated
    /// size; it re-enters the pool with its next update.
    pub fn find_tf_builder_for_tf(&self, size: u64) -> Option<String> {
        let required = overestimated_size(size);
        let mut ready = self.ready.lock().unwrap();

        let pos = ready
            .iter()
            .position(|info| info.estimated_free_memory() >= required)?;

        let info = ready.remove(pos).unwrap();
        info.in_ready_pool.store(false, Ordering::Release);
        info.reserve(required);
        Some(info.id().to_string())
    }

    pub fn mark_with_tf_id(&self, id: &str, tf_id: u64) -> bool {
        let global = self.global.lock().unwrap();
        match global.get(id) {
            Some(info) => {
                info.last_scheduled_tf.store(tf_id, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Drop nodes that stopped sending updates. Returns the evicted ids.
    pub fn evict_stale(&self) -> Vec<String> {
        let mut global = self.global.lock().unwrap();
        let stale: Vec<String> = global
            .iter()
            .filter(|(_, info)| info.age() > TF_BUILDER_DISCARD_TIMEOUT)
            .map(|(id, _)| id.clone())
            .collect();

        if !stale.is_empty() {
            let mut ready = self.ready.lock().unwrap();
            for id in &stale {
                global.remove(id);
                if let Some(pos) = ready.iter().position(|info| info.id() == id) {
                    ready.remove(pos);
                }
                log::debug!("Discarding stale aggregation node. tfb_id={}", id);
            }
        }
        stale
    }

    pub fn clear(&self) {
        self.global.lock().unwrap().clear();
        self.ready.lock().unwrap().clear();
    }
}

impl Default for AggregatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn update(id: &str, free: u64) -> TfBuilderUpdateMessage {
        TfBuilderUpdateMessage {
            process_id: id.to_string(),
            partition_id: "test".to_string(),
            free_memory: free,
            buffer_size: free,
            num_buffered_tfs: 0,
            last_built_tf_id: 0,
            failed_tf_count: 0,
            wall_time: Utc::now(),
        }
    }

    const GIB: u64 = 1 << 30;

    #[test]
    fn test_first_update_creates_and_readies() {
        let registry = AggregatorRegistry::new();
        registry.update_info(update("agg-0", GIB));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.ready_count(), 1);
        assert_eq!(registry.get("agg-0").unwrap().estimated_free_memory(), GIB);
    }

    #[test]
    fn test_first_fit_picks_first_with_headroom() {
        let registry = AggregatorRegistry::new();
        registry.update_info(update("agg-0", GIB));
        registry.update_info(update("agg-1", 2 * GIB));
        registry.update_info(update("agg-2", 5 * GIB));

        // 3 GiB TF needs 3.3 GiB: only agg-2 fits
        let chosen = registry.find_tf_builder_for_tf(3 * GIB).unwrap();
        assert_eq!(chosen, "agg-2");

        // estimate drops by the overestimated size and it left the pool
        let info = registry.get("agg-2").unwrap();
        assert_eq!(
            info.estimated_free_memory(),
            5 * GIB - overestimated_size(3 * GIB)
        );
        assert_eq!(registry.ready_count(), 2);
    }

    #[test]
    fn test_no_fit_returns_none_and_keeps_pool() {
        let registry = AggregatorRegistry::new();
        registry.update_info(update("agg-0", GIB));

        assert!(registry.find_tf_builder_for_tf(GIB).is_none());
        assert_eq!(registry.ready_count(), 1);
    }

    #[test]
    fn test_admission_respects_overestimate() {
        let registry = AggregatorRegistry::new();
        // 1.05 × size is not enough head-room, 1.1 × is required
        registry.update_info(update("agg-0", 105));
        assert!(registry.find_tf_builder_for_tf(100).is_none());

        registry.update_info(update("agg-1", 110));
        assert_eq!(registry.find_tf_builder_for_tf(100).unwrap(), "agg-1");
    }

    #[test]
    fn test_update_restores_readiness() {
        let registry = AggregatorRegistry::new();
        registry.update_info(update("agg-0", 2 * GIB));

        assert_eq!(registry.find_tf_builder_for_tf(GIB).unwrap(), "agg-0");
        assert_eq!(registry.ready_count(), 0);

        // next update confirms free memory and re-adds the node
        registry.update_info(update("agg-0", 2 * GIB));
        assert_eq!(registry.ready_count(), 1);
    }

    #[test]
    fn test_update_subtracts_inflight_reservations() {
        let registry = AggregatorRegistry::new();
        registry.update_info(update("agg-0", 2 * GIB));
        registry.find_tf_builder_for_tf(GIB).unwrap();

        // the update was generated before the assignment landed: its free
        // memory does not yet reflect the reservation
        registry.update_info(update("agg-0", 2 * GIB));
        let info = registry.get("agg-0").unwrap();
        assert_eq!(
            info.estimated_free_memory(),
            2 * GIB - overestimated_size(GIB)
        );

        // a later update reports the charged state; nothing in flight
        registry.update_info(update("agg-0", 2 * GIB - overestimated_size(GIB)));
        assert_eq!(
            info.estimated_free_memory(),
            2 * GIB - overestimated_size(GIB)
        );
    }

    #[test]
    fn test_fifo_order_of_ready_pool() {
        let registry = AggregatorRegistry::new();
        registry.update_info(update("agg-0", 4 * GIB));
        registry.update_info(update("agg-1", 4 * GIB));

        // both fit, the earlier entrant wins
        assert_eq!(registry.find_tf_builder_for_tf(GIB).unwrap(), "agg-0");
        assert_eq!(registry.find_tf_builder_for_tf(GIB).unwrap(), "agg-1");
    }

    #[test]
    fn test_mark_with_tf_id() {
        let registry = AggregatorRegistry::new();
        registry.update_info(update("agg-0", GIB));

        assert!(registry.mark_with_tf_id("agg-0", 42));
        assert_eq!(registry.get("agg-0").unwrap().last_scheduled_tf(), 42);
        assert!(!registry.mark_with_tf_id("agg-9", 42));
    }

    #[test]
    fn test_evict_stale_removes_from_both_structures() {
        let registry = AggregatorRegistry::new();
        registry.update_info(update("agg-0", GIB));

        // fresh node survives a sweep
        assert!(registry.evict_stale().is_empty());

        // age it artificially past the discard timeout
        {
            let info = registry.get("agg-0").unwrap();
            *info.last_update.lock().unwrap() =
                Instant::now() - TF_BUILDER_DISCARD_TIMEOUT - Duration::from_millis(100);
        }

        assert_eq!(registry.evict_stale(), vec!["agg-0".to_string()]);
        assert!(registry.is_empty());
        assert_eq!(registry.ready_count(), 0);
    }
}
