//! Aggregation node buffer accounting.
//!
//! Every admitted TimeFrame charges its size against the buffer at
//! request time and discharges it when the TF is forwarded downstream or
//! its build fails. The update thread is signalled on every change.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use chrono::Utc;

use crate::messages::{BuildRefusal, TfBuilderUpdateMessage};

struct Inner {
    buffer_size: u64,
    tf_sizes: HashMap<u64, u64>,
    current_tf_buffer_size: u64,
    num_buffered_tfs: u32,
    last_built_tf_id: u64,
    failed_since_update: u64,
    accepting: bool,
    terminate_requested: bool,
}

pub struct BufferAccounting {
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl BufferAccounting {
    pub fn new(buffer_size: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buffer_size,
                tf_sizes: HashMap::new(),
                current_tf_buffer_size: 0,
                num_buffered_tfs: 0,
                last_built_tf_id: 0,
                failed_since_update: 0,
                accepting: true,
                terminate_requested: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// Admission control: charge the TF size or refuse the request.
    pub fn admit(&self, tf_id: u64, size: u64) -> Result<(), BuildRefusal> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.accepting {
            return Err(BuildRefusal::NotAccepting);
        }
        if inner.current_tf_buffer_size + size > inner.buffer_size {
            return Err(BuildRefusal::InsufficientBuffer);
        }
        if inner.tf_sizes.insert(tf_id, size).is_some() {
            log::warn!("TimeFrame admitted twice, re-charging. tf_id={}", tf_id);
        } else {
            inner.current_tf_buffer_size += size;
        }
        drop(inner);
        self.changed.notify_all();
        Ok(())
    }

    pub fn record_built(&self, tf_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.num_buffered_tfs += 1;
        inner.last_built_tf_id = tf_id;
        drop(inner);
        self.changed.notify_all();
    }

    /// TF left the node (drained downstream); release its charge.
    pub fn record_forwarded(&self, tf_id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(size) = inner.tf_sizes.remove(&tf_id) else {
            log::error!("Forwarded TF was never charged. tf_id={}", tf_id);
            return false;
        };
        inner.current_tf_buffer_size -= size;
        inner.num_buffered_tfs = inner.num_buffered_tfs.saturating_sub(1);
        drop(inner);
        self.changed.notify_all();
        true
    }

    /// Build failed; release the charge and report with the next update.
    pub fn record_failed(&self, tf_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(size) = inner.tf_sizes.remove(&tf_id) {
            inner.current_tf_buffer_size -= size;
        }
        inner.failed_since_update += 1;
        drop(inner);
        self.changed.notify_all();
    }

    pub fn free_memory(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.buffer_size - inner.current_tf_buffer_size
    }

    pub fn current_tf_buffer_size(&self) -> u64 {
        self.inner.lock().unwrap().current_tf_buffer_size
    }

    pub fn num_buffered_tfs(&self) -> u32 {
        self.inner.lock().unwrap().num_buffered_tfs
    }

    pub fn is_charged(&self, tf_id: u64) -> bool {
        self.inner.lock().unwrap().tf_sizes.contains_key(&tf_id)
    }

    pub fn accepting(&self) -> bool {
        self.inner.lock().unwrap().accepting
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.inner.lock().unwrap().accepting = accepting;
        self.changed.notify_all();
    }

    pub fn request_terminate(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.accepting = false;
        inner.terminate_requested = true;
        drop(inner);
        self.changed.notify_all();
    }

    pub fn terminate_requested(&self) -> bool {
        self.inner.lock().unwrap().terminate_requested
    }

    /// Build the next update for the scheduler; resets the failure count.
    pub fn make_update(&self, process_id: &str, partition_id: &str) -> TfBuilderUpdateMessage {
        let mut inner = self.inner.lock().unwrap();
        let failed = inner.failed_since_update;
        inner.failed_since_update = 0;
        TfBuilderUpdateMessage {
            process_id: process_id.to_string(),
            partition_id: partition_id.to_string(),
            free_memory: inner.buffer_size - inner.current_tf_buffer_size,
            buffer_size: inner.buffer_size,
            num_buffered_tfs: inner.num_buffered_tfs,
            last_built_tf_id: inner.last_built_tf_id,
            failed_tf_count: failed,
            wall_time: Utc::now(),
        }
    }

    /// Block until an accounting change or the timeout floor elapses.
    pub fn wait_signal(&self, timeout: Duration) {
        let inner = self.inner.lock().unwrap();
        let _ = self.changed.wait_timeout(inner, timeout).unwrap();
    }

    #[cfg(test)]
    fn charged_sum(&self) -> u64 {
        self.inner.lock().unwrap().tf_sizes.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admit_charges_and_tracks_sum() {
        let accounting = BufferAccounting::new(1000);
        accounting.admit(1, 300).unwrap();
        accounting.admit(2, 200).unwrap();

        assert_eq!(accounting.current_tf_buffer_size(), 500);
        assert_eq!(accounting.free_memory(), 500);
        // the held-TF sum always matches the charged total
        assert_eq!(accounting.charged_sum(), accounting.current_tf_buffer_size());
    }

    #[test]
    fn test_admit_rejects_over_capacity() {
        let accounting = BufferAccounting::new(1000);
        accounting.admit(1, 800).unwrap();

        let err = accounting.admit(2, 300).unwrap_err();
        assert_eq!(err, BuildRefusal::InsufficientBuffer);
        assert_eq!(accounting.current_tf_buffer_size(), 800);

        // an exactly-fitting TF is admitted
        accounting.admit(3, 200).unwrap();
        assert_eq!(accounting.free_memory(), 0);
    }

    #[test]
    fn test_admit_rejects_when_not_accepting() {
        let accounting = BufferAccounting::new(1000);
        accounting.set_accepting(false);
        assert_eq!(accounting.admit(1, 10).unwrap_err(), BuildRefusal::NotAccepting);
    }

    #[test]
    fn test_forwarded_discharges() {
        let accounting = BufferAccounting::new(1000);
        accounting.admit(1, 400).unwrap();
        accounting.record_built(1);
        assert_eq!(accounting.num_buffered_tfs(), 1);

        assert!(accounting.record_forwarded(1));
        assert_eq!(accounting.current_tf_buffer_size(), 0);
        assert_eq!(accounting.num_buffered_tfs(), 0);
        assert_eq!(accounting.charged_sum(), 0);

        // double discharge is refused
        assert!(!accounting.record_forwarded(1));
    }

    #[test]
    fn test_failed_build_discharges_and_counts() {
        let accounting = BufferAccounting::new(1000);
        accounting.admit(1, 400).unwrap();
        accounting.record_failed(1);

        assert_eq!(accounting.current_tf_buffer_size(), 0);
        let update = accounting.make_update("agg-0", "test");
        assert_eq!(update.failed_tf_count, 1);

        // the failure count resets after it is reported once
        let update = accounting.make_update("agg-0", "test");
        assert_eq!(update.failed_tf_count, 0);
    }

    #[test]
    fn test_terminate_stops_admission() {
        let accounting = BufferAccounting::new(1000);
        accounting.request_terminate();
        assert!(accounting.terminate_requested());
        assert!(!accounting.accepting());
        assert_eq!(accounting.admit(1, 10).unwrap_err(), BuildRefusal::NotAccepting);
    }

    #[test]
    fn test_update_reflects_state() {
        let accounting = BufferAccounting::new(1 << 30);
        accounting.admit(11, 1 << 20).unwrap();
        accounting.record_built(11);

        let update = accounting.make_update("agg-3", "prod");
        assert_eq!(update.process_id, "agg-3");
        assert_eq!(update.buffer_size, 1 << 30);
        assert_eq!(update.free_memory, (1 << 30) - (1 << 20));
        assert_eq!(update.num_buffered_tfs, 1);
        assert_eq!(update.last_built_tf_id, 11);
    }
}
