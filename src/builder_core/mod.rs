//! STF builder process core.
//!
//! Four stages connected by bounded queues, each a dedicated thread:
//! input (framing + monotonicity), assembly (multipart → STF), sequencer
//! (ordering + gap fill), output (serialize / hand off). The source
//! buffer and the scheduler link run as async tasks beside the stages.

pub mod assembly;
pub mod input;
pub mod output;
pub mod sender;
pub mod sequencer;

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::fifo::ConcurrentFifo;
use crate::readout::Multipart;
use crate::stf::SubTimeFrame;

/// Process-wide run state, shared by every stage.
pub struct BuilderState {
    running: AtomicBool,
    paused: AtomicBool,
    accepting_data: AtomicBool,
}

impl BuilderState {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            accepting_data: AtomicBool::new(true),
        }
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, value: bool) {
        self.running.store(value, Ordering::Release);
    }

    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn set_paused(&self, value: bool) {
        self.paused.store(value, Ordering::Release);
        self.accepting_data.store(!value, Ordering::Release);
    }

    pub fn accepting_data(&self) -> bool {
        self.accepting_data.load(Ordering::Acquire)
    }
}

impl Default for BuilderState {
    fn default() -> Self {
        Self::new()
    }
}

fn load_f64(cell: &AtomicU64) -> f64 {
    f64::from_bits(cell.load(Ordering::Relaxed))
}

fn store_f64(cell: &AtomicU64, value: f64) {
    cell.store(value.to_bits(), Ordering::Relaxed);
}

/// Per-component counters, reported by the info thread.
pub struct BuilderCounters {
    /// STFs currently owned by the pipeline (sequencer out → send).
    num_stfs: AtomicI64,
    sent_out_stfs_total: AtomicU64,
    backward_tf_jumps: AtomicU64,
    dropped_stfs: AtomicU64,
    lost_bytes: AtomicU64,
    filtered_empty_hbfs: AtomicU64,
    // rolling means, stored as f64 bits
    stf_size_mean: AtomicU64,
    stf_time_mean: AtomicU64,
    send_time_ms_mean: AtomicU64,
    sent_out_rate: AtomicU64,
}

impl BuilderCounters {
    pub fn new() -> Self {
        Self {
            num_stfs: AtomicI64::new(0),
            sent_out_stfs_total: AtomicU64::new(0),
            backward_tf_jumps: AtomicU64::new(0),
            dropped_stfs: AtomicU64::new(0),
            lost_bytes: AtomicU64::new(0),
            filtered_empty_hbfs: AtomicU64::new(0),
            stf_size_mean: AtomicU64::new(0f64.to_bits()),
            stf_time_mean: AtomicU64::new(0f64.to_bits()),
            send_time_ms_mean: AtomicU64::new(0f64.to_bits()),
            sent_out_rate: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn num_stfs(&self) -> i64 {
        self.num_stfs.load(Ordering::Relaxed)
    }

    pub fn stf_entered_pipeline(&self) {
        self.num_stfs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stf_left_pipeline(&self) {
        self.num_stfs.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn sent_total(&self) -> u64 {
        self.sent_out_stfs_total.load(Ordering::Relaxed)
    }

    pub fn record_sent(&self) -> u64 {
        self.sent_out_stfs_total.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_backward_jump(&self) -> u64 {
        self.backward_tf_jumps.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn backward_jumps(&self) -> u64 {
        self.backward_tf_jumps.load(Ordering::Relaxed)
    }

    pub fn record_dropped_stf(&self) -> u64 {
        self.dropped_stfs.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn dropped_stfs(&self) -> u64 {
        self.dropped_stfs.load(Ordering::Relaxed)
    }

    pub fn account_lost_bytes(&self, bytes: u64) {
        self.lost_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn lost_bytes(&self) -> u64 {
        self.lost_bytes.load(Ordering::Relaxed)
    }

    pub fn record_filtered_empty_hbf(&self) {
        self.filtered_empty_hbfs.fetch_add(1, Ordering::Relaxed);
    }

    /// Rolling size mean, weight 1/64.
    pub fn sample_stf_size(&self, size: u64) {
        let mean = load_f64(&self.stf_size_mean);
        store_f64(
            &self.stf_size_mean,
            mean + (size as f64 / 64.0 - mean / 64.0),
        );
    }

    pub fn stf_size_mean(&self) -> f64 {
        load_f64(&self.stf_size_mean)
    }

    /// Rolling inter-STF arrival time, weight 1/100.
    pub fn sample_stf_interval(&self, seconds: f64) {
        let mean = load_f64(&self.stf_time_mean);
        store_f64(&self.stf_time_mean, mean + (seconds / 100.0 - mean / 100.0));
    }

    pub fn stf_time_mean(&self) -> f64 {
        load_f64(&self.stf_time_mean)
    }

    /// Rolling send time, weight 1/100.
    pub fn sample_send_time_ms(&self, millis: f64) {
        let mean = load_f64(&self.send_time_ms_mean);
        store_f64(
            &self.send_time_ms_mean,
            mean + (millis / 100.0 - mean / 100.0),
        );
    }

    pub fn send_time_ms_mean(&self) -> f64 {
        load_f64(&self.send_time_ms_mean)
    }

    pub fn set_sent_out_rate(&self, rate: f64) {
        store_f64(&self.sent_out_rate, rate);
    }

    pub fn sent_out_rate(&self) -> f64 {
        load_f64(&self.sent_out_rate)
    }
}

impl Default for BuilderCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Queues between the stages plus the pipeline cap policy.
pub struct BuilderPipeline {
    pub input_queue: ConcurrentFifo<Multipart>,
    pub sequencer_queue: ConcurrentFifo<SubTimeFrame>,
    pub output_queue: ConcurrentFifo<SubTimeFrame>,
    counters: Arc<BuilderCounters>,
    /// <= 0 means uncapped.
    max_stfs_in_pipeline: i64,
}

impl BuilderPipeline {
    pub fn new(counters: Arc<BuilderCounters>, max_stfs_in_pipeline: i64) -> Self {
        Self {
            input_queue: ConcurrentFifo::new(),
            sequencer_queue: ConcurrentFifo::new(),
            output_queue: ConcurrentFifo::new(),
            counters,
            max_stfs_in_pipeline,
        }
    }

    /// Hand an ordered STF to the output stage. With the cap enabled a
    /// full pipeline drops the STF; readout must never be blocked.
    pub fn queue_to_output(&self, stf: SubTimeFrame) -> bool {
        if self.max_stfs_in_pipeline > 0
            && self.counters.num_stfs() >= self.max_stfs_in_pipeline
        {
            self.counters.account_lost_bytes(stf.data_size());
            self.counters.record_dropped_stf();
            return false;
        }
        self.counters.stf_entered_pipeline();
        if !self.output_queue.push(stf) {
            self.counters.stf_left_pipeline();
            return false;
        }
        true
    }

    /// Drop everything still queued (shutdown path).
    pub fn clear(&self) {
        self.input_queue.clear();
        self.sequencer_queue.clear();
        self.output_queue.clear();
    }
}

/// 2 s periodic stats line; silent while paused.
pub fn run_info_loop(state: Arc<BuilderState>, counters: Arc<BuilderCounters>) {
    while state.running() {
        std::thread::sleep(Duration::from_secs(2));

        if state.paused() || !state.running() {
            continue;
        }

        let time_mean = counters.stf_time_mean();
        let frequency = if time_mean > 0.0 { 1.0 / time_mean } else { 0.0 };
        log::info!(
            "📊 SubTimeFrame size_mean={:.0} frequency_mean={:.4} sending_time_ms_mean={:.4} queued_stfs={}",
            counters.stf_size_mean(),
            frequency,
            counters.send_time_ms_mean(),
            counters.num_stfs()
        );
        log::info!(
            "📊 SubTimeFrame sent_total={} rate={:.4} lost_bytes={} dropped_stfs={}",
            counters.sent_total(),
            counters.sent_out_rate(),
            counters.lost_bytes(),
            counters.backward_jumps() + counters.dropped_stfs()
        );
    }

    log::debug!("Exiting info thread");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_mean_converges() {
        let counters = BuilderCounters::new();
        for _ in 0..2000 {
            counters.sample_stf_size(6400);
        }
        let mean = counters.stf_size_mean();
        assert!((mean - 6400.0).abs() < 1.0, "mean={}", mean);
    }

    #[test]
    fn test_pipeline_cap_drops_when_full() {
        let counters = Arc::new(BuilderCounters::new());
        let pipeline = BuilderPipeline::new(counters.clone(), 4);

        for id in 0..4 {
            assert!(pipeline.queue_to_output(SubTimeFrame::new(id)));
        }
        assert_eq!(counters.num_stfs(), 4);

        // fifth STF exceeds the cap and is dropped
        let mut stf = SubTimeFrame::new(4);
        stf.add_hbfs(
            crate::stf::EquipmentIdentifier {
                origin: crate::config::Detector::TST.into(),
                subspec: 1,
            },
            vec![vec![0u8; 100]],
        );
        assert!(!pipeline.queue_to_output(stf));
        assert_eq!(counters.num_stfs(), 4);
        assert_eq!(counters.lost_bytes(), 100);
    }

    #[test]
    fn test_uncapped_pipeline_accepts_everything() {
        let counters = Arc::new(BuilderCounters::new());
        let pipeline = BuilderPipeline::new(counters.clone(), 0);

        for id in 0..100 {
            assert!(pipeline.queue_to_output(SubTimeFrame::new(id)));
        }
        assert_eq!(counters.num_stfs(), 100);
    }

    #[test]
    fn test_state_pause_stops_accepting() {
        let state = BuilderState::new();
        assert!(state.accepting_data());
        state.set_paused(true);
        assert!(!state.accepting_data());
        state.set_paused(false);
        assert!(state.accepting_data());
    }
}
