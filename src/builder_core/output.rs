//! Builder output stage.
//!
//! Dequeues ordered STFs and either serializes them toward the source
//! buffer, hands them to the workflow-framework channel, or drops them in
//! standalone mode. Honors the `max-built-stfs` cap and announces
//! end-of-stream to the workflow consumer on exit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::builder_core::{BuilderCounters, BuilderPipeline, BuilderState};
use crate::codec::{multipart_size, serialize_stf};
use crate::fifo::PopError;
use crate::messages::WorkflowMessage;
use crate::ratelimit::RateLimiter;
use crate::readout::Multipart;

const OUTPUT_POLL: Duration = Duration::from_millis(500);
const EOS_LINGER: Duration = Duration::from_secs(2);

/// A serialized STF headed for the source buffer.
pub struct SourceBufferEntry {
    pub tf_id: u64,
    pub parts: Multipart,
    pub size: u64,
}

/// Where finished STFs go. Exactly one non-standalone variant is active.
pub enum OutputMode {
    /// No output; only useful together with a file sink.
    Standalone,
    /// Interleaved-header serializer feeding the source buffer.
    Serializer(mpsc::Sender<SourceBufferEntry>),
    /// Workflow-framework adapter.
    Workflow(mpsc::Sender<WorkflowMessage>),
}

impl OutputMode {
    fn name(&self) -> &'static str {
        match self {
            OutputMode::Standalone => "standalone",
            OutputMode::Serializer(_) => "serializer",
            OutputMode::Workflow(_) => "workflow",
        }
    }
}

/// Output stage thread body. On exit the process leaves the running
/// state: a finished output loop means the pipeline is done.
pub fn run_output_stage(
    state: Arc<BuilderState>,
    counters: Arc<BuilderCounters>,
    pipeline: Arc<BuilderPipeline>,
    mode: OutputMode,
    max_built_stfs: u64,
) {
    log::info!("Output: sending mode is '{}'", mode.name());
    if matches!(mode, OutputMode::Standalone) {
        log::warn!("Output: running in standalone mode, STF data will be discarded.");
    }

    let mut rl_sending = RateLimiter::every_ms(2000);
    let mut window_start: Option<Instant> = None;
    let mut sent_in_window = 0u64;

    while state.running() {
        let stf = match pipeline.output_queue.pop_wait_for(OUTPUT_POLL) {
            Ok(stf) => stf,
            Err(PopError::Timeout) => continue,
            Err(PopError::Stopped) => break,
        };

        counters.stf_left_pipeline();

        if let Some(n) = rl_sending.allow() {
            log::debug!(
                "Sending an STF out. stf_id={} stf_size={} unique_equipment={} suppressed={}",
                stf.id(),
                stf.data_size(),
                stf.equipment_identifiers().len(),
                n
            );
        }

        counters.sample_stf_size(stf.data_size());

        if !matches!(mode, OutputMode::Standalone) {
            let send_start = Instant::now();

            let send_result = match &mode {
                OutputMode::Serializer(tx) => {
                    let parts = serialize_stf(&stf);
                    let entry = SourceBufferEntry {
                        tf_id: stf.id(),
                        size: multipart_size(&parts),
                        parts,
                    };
                    tx.blocking_send(entry).map_err(|_| "source buffer gone")
                }
                OutputMode::Workflow(tx) => {
                    let message = WorkflowMessage::payload(stf.id(), serialize_stf(&stf));
                    tx.blocking_send(message).map_err(|_| "workflow channel gone")
                }
                OutputMode::Standalone => unreachable!(),
            };

            if let Err(what) = send_result {
                if state.running() {
                    log::error!("Output: exception on send: what={}", what);
                } else {
                    log::info!("Output(NOT_RUNNING): shutting down: what={}", what);
                }
                break;
            }

            let start = *window_start.get_or_insert_with(Instant::now);
            sent_in_window += 1;
            let total = counters.record_sent();

            let elapsed_ms = send_start.elapsed().as_secs_f64() * 1e3;
            counters.sample_send_time_ms(elapsed_ms.max(1e-6));
            counters.set_sent_out_rate(sent_in_window as f64 / start.elapsed().as_secs_f64());

            if max_built_stfs > 0 && total == max_built_stfs {
                log::info!("Maximum number of sent SubTimeFrames reached. Exiting.");
                break;
            }
        }
    }

    // tell the workflow consumer the source is done; best effort only
    if let OutputMode::Workflow(tx) = &mode {
        let _ = tx.blocking_send(WorkflowMessage::source_completed());
        log::info!("Source Completed message sent to the workflow consumer.");
        std::thread::sleep(EOS_LINGER);
    }

    state.set_running(false);

    log::info!(
        "Output: Stopped SubTimeFrame sending. sent_total={} rate={:.4}",
        counters.sent_total(),
        counters.sent_out_rate()
    );
}
