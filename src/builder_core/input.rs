//! Builder input stage.
//!
//! Validates readout framing, enforces monotonic time-frame ids and
//! forwards raw multiparts to the assembly stage. Never aborts the
//! process; every recoverable condition loops.

use std::sync::Arc;
use std::time::Duration;

use crate::builder_core::{BuilderCounters, BuilderPipeline, BuilderState};
use crate::net::{ReadoutReceiver, TransportError};
use crate::ratelimit::RateLimiter;
use crate::readout::{payload_size, FramingError, ReadoutHeader};

const RECEIVE_POLL: Duration = Duration::from_millis(500);
const ERROR_BACKOFF: Duration = Duration::from_millis(10);

pub fn run_input_stage(
    receiver: ReadoutReceiver,
    state: Arc<BuilderState>,
    counters: Arc<BuilderCounters>,
    pipeline: Arc<BuilderPipeline>,
) {
    let mut last_seen_tf_id: Option<u32> = None;

    let mut rl_not_accepting = RateLimiter::every_ms(1000);
    let mut rl_interrupted = RateLimiter::every_ms(1000);
    let mut rl_transport = RateLimiter::every_ms(1000);
    let mut rl_framing = RateLimiter::every_ms(1000);
    let mut rl_backward = RateLimiter::every_ms(200);
    let mut rl_forward = RateLimiter::every_ms(200);

    while state.running() {
        let multipart = match receiver.receive(RECEIVE_POLL) {
            Ok(parts) => parts,
            Err(TransportError::Timeout) => continue,
            Err(TransportError::Interrupted) => {
                if state.accepting_data() {
                    if let Some(n) = rl_interrupted.allow() {
                        log::info!(
                            "READOUT INTERFACE: Receive interrupted. suppressed={}",
                            n
                        );
                    }
                }
                std::thread::sleep(ERROR_BACKOFF);
                continue;
            }
            Err(TransportError::Error(msg)) => {
                if let Some(n) = rl_transport.allow() {
                    log::error!(
                        "READOUT INTERFACE: Receive failed. error={} suppressed={}",
                        msg,
                        n
                    );
                }
                std::thread::sleep(ERROR_BACKOFF);
                continue;
            }
            Err(TransportError::Closed) => break,
        };

        if !state.accepting_data() {
            if let Some(n) = rl_not_accepting.allow() {
                log::warn!(
                    "READOUT INTERFACE: Discarding received data while not in the running state. suppressed={}",
                    n
                );
            }
            continue;
        }

        if multipart.is_empty() {
            continue;
        }

        let header = match ReadoutHeader::from_multipart(&multipart) {
            Ok(header) => header,
            Err(err) => {
                counters.account_lost_bytes(payload_size(&multipart));
                if let Some(n) = rl_framing.allow() {
                    match err {
                        FramingError::HeaderSize { .. } | FramingError::Empty => log::error!(
                            "READOUT INTERFACE: {}. Make sure to use a compatible readout version. suppressed={}",
                            err, n
                        ),
                        FramingError::Version { .. } => log::error!(
                            "READOUT INTERFACE: {}. suppressed={}",
                            err, n
                        ),
                    }
                }
                continue;
            }
        };

        if let Some(last) = last_seen_tf_id {
            // backward jump: the source is misbehaving, drop and continue
            if header.time_frame_id < last {
                let total = counters.record_backward_jump();
                counters.account_lost_bytes(payload_size(&multipart));
                if let Some(n) = rl_backward.allow() {
                    log::error!(
                        "READOUT INTERFACE: TF ID decreased! ({}) -> ({}). \
                         SubTimeFrames will be incomplete! total_occurrences={} suppressed={}",
                        last,
                        header.time_frame_id,
                        total,
                        n
                    );
                }
                continue;
            }

            // forward gap: keep the data, the sequencer fills the hole
            if header.time_frame_id > last + 1 {
                if let Some(n) = rl_forward.allow() {
                    log::warn!(
                        "READOUT INTERFACE: TF ID non-contiguous increase! ({}) -> ({}). suppressed={}",
                        last,
                        header.time_frame_id,
                        n
                    );
                }
            }
        }

        last_seen_tf_id = Some(header.time_frame_id);
        pipeline.input_queue.push(multipart);
    }

    log::debug!("Exiting the input thread");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fifo::ConcurrentFifo;
    use crate::net::readout_channel;
    use crate::net::TransportEvent;
    use crate::readout::READOUT_HEADER_SIZE;
    use std::sync::Arc;

    fn harness() -> (
        Arc<ConcurrentFifo<TransportEvent>>,
        ReadoutReceiver,
        Arc<BuilderState>,
        Arc<BuilderCounters>,
        Arc<BuilderPipeline>,
    ) {
        let (receiver, events) = readout_channel();
        let state = Arc::new(BuilderState::new());
        let counters = Arc::new(BuilderCounters::new());
        let pipeline = Arc::new(BuilderPipeline::new(counters.clone(), 0));
        (events, receiver, state, counters, pipeline)
    }

    fn multipart(tf_id: u32, payloads: usize) -> Vec<Vec<u8>> {
        let mut parts = vec![ReadoutHeader::new(tf_id, 0).encode().to_vec()];
        for _ in 0..payloads {
            parts.push(vec![0u8; 64]);
        }
        parts
    }

    fn run_stage_over(
        events: Arc<ConcurrentFifo<TransportEvent>>,
        receiver: ReadoutReceiver,
        state: Arc<BuilderState>,
        counters: Arc<BuilderCounters>,
        pipeline: Arc<BuilderPipeline>,
    ) -> std::thread::JoinHandle<()> {
        let handle = std::thread::spawn(move || {
            run_input_stage(receiver, state, counters, pipeline)
        });
        // give the stage a moment to drain, then shut it down
        std::thread::sleep(Duration::from_millis(100));
        events.stop();
        handle
    }

    #[test]
    fn test_monotonic_ids_forwarded() {
        let (events, receiver, state, counters, pipeline) = harness();
        for id in [10u32, 10, 11, 12] {
            events.push(TransportEvent::Multipart(multipart(id, 2)));
        }

        let p = pipeline.clone();
        run_stage_over(events, receiver, state, counters, p)
            .join()
            .unwrap();

        assert_eq!(pipeline.input_queue.len(), 4);
    }

    #[test]
    fn test_backward_jump_dropped_then_stream_continues() {
        let (events, receiver, state, counters, pipeline) = harness();
        events.push(TransportEvent::Multipart(multipart(10, 1)));
        events.push(TransportEvent::Multipart(multipart(9, 1)));
        events.push(TransportEvent::Multipart(multipart(11, 1)));

        let (c, p) = (counters.clone(), pipeline.clone());
        run_stage_over(events, receiver, state, c, p).join().unwrap();

        assert_eq!(pipeline.input_queue.len(), 2);
        assert_eq!(counters.backward_jumps(), 1);
        assert_eq!(counters.lost_bytes(), 64);
    }

    #[test]
    fn test_forward_gap_kept() {
        let (events, receiver, state, counters, pipeline) = harness();
        events.push(TransportEvent::Multipart(multipart(5, 1)));
        events.push(TransportEvent::Multipart(multipart(500, 1)));

        let p = pipeline.clone();
        run_stage_over(events, receiver, state, counters, p)
            .join()
            .unwrap();

        assert_eq!(pipeline.input_queue.len(), 2);
    }

    #[test]
    fn test_bad_header_size_dropped() {
        let (events, receiver, state, counters, pipeline) = harness();
        let bad = vec![vec![0u8; READOUT_HEADER_SIZE - 1], vec![0u8; 32]];
        events.push(TransportEvent::Multipart(bad));

        let (c, p) = (counters.clone(), pipeline.clone());
        run_stage_over(events, receiver, state, c, p).join().unwrap();

        assert_eq!(pipeline.input_queue.len(), 0);
        assert_eq!(counters.lost_bytes(), 32);
    }

    #[test]
    fn test_version_mismatch_dropped() {
        let (events, receiver, state, counters, pipeline) = harness();
        let mut header = ReadoutHeader::new(1, 0);
        header.version = 77;
        events.push(TransportEvent::Multipart(vec![
            header.encode().to_vec(),
            vec![0u8; 16],
        ]));

        let p = pipeline.clone();
        run_stage_over(events, receiver, state, counters, p)
            .join()
            .unwrap();

        assert_eq!(pipeline.input_queue.len(), 0);
    }

    #[test]
    fn test_not_accepting_discards() {
        let (events, receiver, state, counters, pipeline) = harness();
        state.set_paused(true);
        events.push(TransportEvent::Multipart(multipart(1, 1)));

        let (s, p) = (state.clone(), pipeline.clone());
        run_stage_over(events, receiver, s, counters, p).join().unwrap();

        assert_eq!(pipeline.input_queue.len(), 0);
    }
}
