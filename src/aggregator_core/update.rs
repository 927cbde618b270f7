//! Scheduler update sender.
//!
//! One update per accounting change, with a 500 ms floor so the
//! scheduler's liveness tracking never starves.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::aggregator_core::accounting::BufferAccounting;
use crate::messages::ToScheduler;

/// Update cadence floor.
pub const UPDATE_INTERVAL_FLOOR: Duration = Duration::from_millis(500);

/// Update thread body.
pub fn run_update_loop(
    accounting: Arc<BufferAccounting>,
    to_scheduler: mpsc::UnboundedSender<ToScheduler>,
    process_id: String,
    partition_id: String,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Acquire) {
        accounting.wait_signal(UPDATE_INTERVAL_FLOOR);

        let update = accounting.make_update(&process_id, &partition_id);
        if to_scheduler
            .send(ToScheduler::TfBuilderUpdate(update))
            .is_err()
        {
            log::warn!("Scheduler link is gone, stopping updates");
            break;
        }
    }
    log::debug!("Exiting update thread");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_updates_flow_until_stopped() {
        let accounting = Arc::new(BufferAccounting::new(1 << 30));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));

        let (acc, run) = (accounting.clone(), running.clone());
        let handle = std::thread::spawn(move || {
            run_update_loop(acc, tx, "agg-0".to_string(), "test".to_string(), run);
        });

        // an accounting change wakes the loop promptly
        accounting.admit(1, 100).unwrap();

        let update = rx.blocking_recv().unwrap();
        match update {
            ToScheduler::TfBuilderUpdate(u) => {
                assert_eq!(u.process_id, "agg-0");
                assert_eq!(u.buffer_size, 1 << 30);
            }
            other => panic!("unexpected: {:?}", other),
        }

        running.store(false, Ordering::Release);
        accounting.set_accepting(false); // wake the waiter
        handle.join().unwrap();
    }
}
