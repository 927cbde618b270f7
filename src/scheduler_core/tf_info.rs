//! TimeFrame completion tracking.
//!
//! Builders announce `(tf_id, size)` as STFs land in their source
//! buffers. A TimeFrame is complete once every expected source has
//! announced its id; incomplete entries older than the stale bound are
//! discarded, their sources presumed to have dropped the data.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::messages::{StfAnnounce, TfBuildingInformation};

/// An incomplete TimeFrame older than this is dropped.
pub const STALE_TF_TIMEOUT: Duration = Duration::from_secs(1);

struct PendingTf {
    stf_sizes: HashMap<String, u64>,
    first_seen: Instant,
}

pub struct TfCompletionTracker {
    pending: Mutex<HashMap<u64, PendingTf>>,
}

impl TfCompletionTracker {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Record one announcement. Returns the assignment record when every
    /// expected source has reported this id.
    pub fn add_announce(
        &self,
        announce: StfAnnounce,
        expected_sources: &HashSet<String>,
    ) -> Option<TfBuildingInformation> {
        let mut pending = self.pending.lock().unwrap();
        let entry = pending.entry(announce.tf_id).or_insert_with(|| PendingTf {
            stf_sizes: HashMap::new(),
            first_seen: Instant::now(),
        });

        if entry
            .stf_sizes
            .insert(announce.stf_sender_id.clone(), announce.size)
            .is_some()
        {
            log::warn!(
                "Duplicate STF announcement. tf_id={} stf_sender_id={}",
                announce.tf_id,
                announce.stf_sender_id
            );
        }

        let complete = !expected_sources.is_empty()
            && expected_sources
                .iter()
                .all(|source| entry.stf_sizes.contains_key(source));
        if !complete {
            return None;
        }

        let entry = pending.remove(&announce.tf_id).unwrap();
        let mut stf_sizes: Vec<(String, u64)> = entry.stf_sizes.into_iter().collect();
        stf_sizes.sort();
        let tf_size = stf_sizes.iter().map(|(_, size)| size).sum();

        Some(TfBuildingInformation {
            tf_id: announce.tf_id,
            stf_sizes,
            tf_size,
        })
    }

    /// Drop incomplete TimeFrames past the stale bound. Returns
    /// `(tf_id, announced_sources)` per dropped entry.
    pub fn sweep_stale(&self) -> Vec<(u64, usize)> {
        let mut pending = self.pending.lock().unwrap();
        let stale: Vec<u64> = pending
            .iter()
            .filter(|(_, entry)| entry.first_seen.elapsed() > STALE_TF_TIMEOUT)
            .map(|(id, _)| *id)
            .collect();

        stale
            .into_iter()
            .map(|id| {
                let entry = pending.remove(&id).unwrap();
                (id, entry.stf_sizes.len())
            })
            .collect()
    }
}

impl Default for TfCompletionTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announce(sender: &str, tf_id: u64, size: u64) -> StfAnnounce {
        StfAnnounce {
            stf_sender_id: sender.to_string(),
            tf_id,
            size,
        }
    }

    fn sources(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_completes_when_all_sources_announce() {
        let tracker = TfCompletionTracker::new();
        let expected = sources(&["builder-0", "builder-1"]);

        assert!(tracker
            .add_announce(announce("builder-0", 7, 100), &expected)
            .is_none());
        let info = tracker
            .add_announce(announce("builder-1", 7, 50), &expected)
            .unwrap();

        assert_eq!(info.tf_id, 7);
        assert_eq!(info.tf_size, 150);
        assert_eq!(
            info.stf_sizes,
            vec![
                ("builder-0".to_string(), 100),
                ("builder-1".to_string(), 50)
            ]
        );
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn test_single_source_completes_immediately() {
        let tracker = TfCompletionTracker::new();
        let expected = sources(&["builder-0"]);

        let info = tracker
            .add_announce(announce("builder-0", 1, 64), &expected)
            .unwrap();
        assert_eq!(info.tf_size, 64);
    }

    #[test]
    fn test_interleaved_tf_ids_tracked_independently() {
        let tracker = TfCompletionTracker::new();
        let expected = sources(&["builder-0", "builder-1"]);

        assert!(tracker
            .add_announce(announce("builder-0", 1, 10), &expected)
            .is_none());
        assert!(tracker
            .add_announce(announce("builder-0", 2, 20), &expected)
            .is_none());

        // id 2 completes before id 1
        let info = tracker
            .add_announce(announce("builder-1", 2, 5), &expected)
            .unwrap();
        assert_eq!(info.tf_id, 2);
        assert_eq!(tracker.pending_count(), 1);
    }

    #[test]
    fn test_no_expected_sources_never_completes() {
        let tracker = TfCompletionTracker::new();
        assert!(tracker
            .add_announce(announce("builder-0", 1, 10), &HashSet::new())
            .is_none());
        assert_eq!(tracker.pending_count(), 1);
    }

    #[test]
    fn test_sweep_stale_drops_incomplete() {
        let tracker = TfCompletionTracker::new();
        let expected = sources(&["builder-0", "builder-1"]);
        assert!(tracker
            .add_announce(announce("builder-0", 3, 10), &expected)
            .is_none());

        // age the entry past the bound
        {
            let mut pending = tracker.pending.lock().unwrap();
            pending.get_mut(&3).unwrap().first_seen =
                Instant::now() - STALE_TF_TIMEOUT - Duration::from_millis(50);
        }

        assert_eq!(tracker.sweep_stale(), vec![(3, 1)]);
        assert_eq!(tracker.pending_count(), 0);
    }
}
