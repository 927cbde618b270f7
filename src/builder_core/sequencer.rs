//! Builder sequencer stage.
//!
//! Delivers STFs downstream in strictly increasing id order. Small gaps
//! are filled with empty placeholder STFs; a gap wider than two seconds
//! worth of STFs is skipped outright.

use std::sync::Arc;
use std::time::Duration;

use crate::builder_core::{BuilderPipeline, BuilderState};
use crate::fifo::PopError;
use crate::ratelimit::RateLimiter;
use crate::stf::{StfOrigin, SubTimeFrame};

/// Gap-fill ceiling: two seconds of STFs at the nominal rate
/// (11234 Hz heartbeat, 256 orbits per time-frame).
pub const MAX_GAP_FILL: u64 = 2 * 11234 / 256;

const SEQ_POLL: Duration = Duration::from_millis(500);

/// Pure ordering core, separate from the thread loop so it can be tested
/// against a plain sink.
pub struct StfSequencer {
    last_delivered_id: u64,
    rl_repeated: RateLimiter,
    rl_gap: RateLimiter,
}

impl StfSequencer {
    pub fn new() -> Self {
        Self {
            last_delivered_id: 0,
            rl_repeated: RateLimiter::every_ms(500),
            rl_gap: RateLimiter::every_ms(1000),
        }
    }

    pub fn last_delivered_id(&self) -> u64 {
        self.last_delivered_id
    }

    /// Order one STF, delivering through `sink`. Rejected duplicates are
    /// dropped; gap fillers carry `StfOrigin::Null`.
    pub fn sequence<F>(&mut self, mut stf: SubTimeFrame, sink: &mut F)
    where
        F: FnMut(SubTimeFrame),
    {
        let id = stf.id();
        stf.set_origin(StfOrigin::Readout);

        if id <= self.last_delivered_id {
            if let Some(n) = self.rl_repeated.allow() {
                log::error!(
                    "Sequencer: Repeated STF will be rejected. previous_stf_id={} current_stf_id={} suppressed={}",
                    self.last_delivered_id,
                    id,
                    n
                );
            }
            return;
        }

        if id == self.last_delivered_id + 1 {
            self.last_delivered_id = id;
            sink(stf);
            return;
        }

        let missing_start = self.last_delivered_id + 1;
        let missing_count = id - missing_start;

        if missing_count < MAX_GAP_FILL {
            if let Some(n) = self.rl_gap.allow() {
                log::warn!(
                    "Sequencer: Creating empty (missing) STFs. previous_stf_id={} num_missing={} suppressed={}",
                    self.last_delivered_id,
                    missing_count,
                    n
                );
            }
            for missing_id in missing_start..id {
                sink(SubTimeFrame::empty(missing_id));
            }
        } else if let Some(n) = self.rl_gap.allow() {
            log::warn!(
                "Sequencer: Large STF gap, not filling. previous_stf_id={} current_stf_id={} num_missing={} suppressed={}",
                self.last_delivered_id,
                id,
                missing_count,
                n
            );
        }

        self.last_delivered_id = id;
        sink(stf);
    }
}

impl Default for StfSequencer {
    fn default() -> Self {
        Self::new()
    }
}

/// Sequencer stage thread body.
pub fn run_sequencer_stage(state: Arc<BuilderState>, pipeline: Arc<BuilderPipeline>) {
    let mut sequencer = StfSequencer::new();

    loop {
        let stf = match pipeline.sequencer_queue.pop_wait_for(SEQ_POLL) {
            Ok(stf) => stf,
            Err(PopError::Timeout) => {
                if !state.running() {
                    break;
                }
                continue;
            }
            Err(PopError::Stopped) => break,
        };

        if !state.accepting_data() {
            continue;
        }

        sequencer.sequence(stf, &mut |ordered| {
            pipeline.queue_to_output(ordered);
        });
    }

    log::debug!("Exiting sequencer thread");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(seq: &mut StfSequencer, ids: &[u64]) -> Vec<(u64, StfOrigin)> {
        let mut out = Vec::new();
        for &id in ids {
            seq.sequence(SubTimeFrame::new(id), &mut |stf| {
                out.push((stf.id(), stf.origin()));
            });
        }
        out
    }

    #[test]
    fn test_in_order_delivery() {
        let mut seq = StfSequencer::new();
        let out = collect(&mut seq, &[1, 2, 3]);
        assert_eq!(
            out,
            vec![
                (1, StfOrigin::Readout),
                (2, StfOrigin::Readout),
                (3, StfOrigin::Readout)
            ]
        );
        assert_eq!(seq.last_delivered_id(), 3);
    }

    #[test]
    fn test_gap_filled_with_null_stfs() {
        let mut seq = StfSequencer::new();
        let out = collect(&mut seq, &[5, 8]);

        let ids: Vec<u64> = out.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6, 7, 8]);

        // 6 and 7 are placeholders
        assert_eq!(out[5], (6, StfOrigin::Null));
        assert_eq!(out[6], (7, StfOrigin::Null));
        assert_eq!(out[7], (8, StfOrigin::Readout));
    }

    #[test]
    fn test_gap_fillers_are_empty() {
        let mut seq = StfSequencer::new();
        let mut fillers = Vec::new();
        seq.sequence(SubTimeFrame::new(1), &mut |_| {});
        seq.sequence(SubTimeFrame::new(4), &mut |stf| {
            if stf.origin() == StfOrigin::Null {
                fillers.push(stf);
            }
        });
        assert_eq!(fillers.len(), 2);
        assert!(fillers.iter().all(|stf| stf.hbf_count() == 0));
    }

    #[test]
    fn test_large_gap_not_filled() {
        let mut seq = StfSequencer::new();
        let out = collect(&mut seq, &[5, 500]);

        // gap of 494 exceeds the ceiling: only the real STFs pass
        let after_five: Vec<u64> = out.iter().map(|(id, _)| *id).skip(5).collect();
        assert_eq!(after_five, vec![500]);
        assert_eq!(seq.last_delivered_id(), 500);
    }

    #[test]
    fn test_gap_just_below_ceiling_filled() {
        let mut seq = StfSequencer::new();
        seq.sequence(SubTimeFrame::new(1), &mut |_| {});

        let mut count = 0usize;
        let next = 1 + MAX_GAP_FILL; // missing = MAX_GAP_FILL - 1 < ceiling
        seq.sequence(SubTimeFrame::new(next), &mut |_| count += 1);
        assert_eq!(count as u64, MAX_GAP_FILL);
    }

    #[test]
    fn test_gap_at_ceiling_not_filled() {
        let mut seq = StfSequencer::new();
        seq.sequence(SubTimeFrame::new(1), &mut |_| {});

        let mut count = 0usize;
        let next = 2 + MAX_GAP_FILL; // missing = MAX_GAP_FILL, not < ceiling
        seq.sequence(SubTimeFrame::new(next), &mut |_| count += 1);
        assert_eq!(count, 1);
    }

    #[test]
    fn test_duplicates_rejected() {
        let mut seq = StfSequencer::new();
        let out = collect(&mut seq, &[1, 2, 2, 1, 3]);
        let ids: Vec<u64> = out.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_ids_strictly_increase() {
        let mut seq = StfSequencer::new();
        let mut delivered = Vec::new();
        for id in [3u64, 7, 6, 10, 10, 11] {
            seq.sequence(SubTimeFrame::new(id), &mut |stf| delivered.push(stf.id()));
        }
        for window in delivered.windows(2) {
            assert!(window[0] < window[1]);
        }
    }
}
