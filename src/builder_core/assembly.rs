//! Builder assembly stage: readout multiparts → SubTimeFrames.
//!
//! One STF is in progress at a time. A multipart with a different
//! time-frame id force-closes the current STF (missed stop flag), the
//! `last_tf_message` flag closes it normally, and inactivity on the
//! input queue closes it on a timeout.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::builder_core::{BuilderCounters, BuilderPipeline, BuilderState};
use crate::config::{BuilderConfig, SanityCheckMode, SubSpecMode};
use crate::fifo::PopError;
use crate::ratelimit::RateLimiter;
use crate::rdh::RdhReader;
use crate::readout::{Multipart, ReadoutHeader};
use crate::stf::{EquipmentIdentifier, SubTimeFrame};

/// Input poll deadline; doubles as the inactivity bound for an open STF.
pub const STF_DATA_WAIT: Duration = Duration::from_secs(2);

pub struct StfAssembler {
    config: BuilderConfig,
    counters: Arc<BuilderCounters>,
    current: Option<SubTimeFrame>,
    last_emit: Instant,
    rl_framing: RateLimiter,
    rl_rdh: RateLimiter,
    rl_subspec: RateLimiter,
    rl_missed_stop: RateLimiter,
    rl_link: RateLimiter,
}

impl StfAssembler {
    pub fn new(config: &BuilderConfig, counters: Arc<BuilderCounters>) -> Self {
        log::info!(
            "StfBuilder: Using {:#06x} as the FeeID mask.",
            config.fee_id_mask
        );
        Self {
            config: config.clone(),
            counters,
            current: None,
            last_emit: Instant::now(),
            rl_framing: RateLimiter::every_ms(1000),
            rl_rdh: RateLimiter::every_ms(1000),
            rl_subspec: RateLimiter::every_ms(10_000),
            rl_missed_stop: RateLimiter::every_ms(1000),
            rl_link: RateLimiter::every_ms(1000),
        }
    }

    pub fn current_id(&self) -> Option<u64> {
        self.current.as_ref().map(|stf| stf.id())
    }

    /// Close and return the in-progress STF, if any.
    pub fn finish_current(&mut self) -> Option<SubTimeFrame> {
        let stf = self.current.take()?;
        let elapsed = self.last_emit.elapsed().as_secs_f64();
        self.last_emit = Instant::now();
        self.counters.sample_stf_interval(elapsed);
        Some(stf)
    }

    fn masked_subspec(&self, raw: u32) -> u32 {
        match self.config.subspec_mode {
            SubSpecMode::FeeId => raw & self.config.fee_id_mask,
            SubSpecMode::CruLinkId => raw,
        }
    }

    /// Feed one multipart; returns the STFs it completed (forced close on
    /// an id change plus a regular close can both happen here).
    pub fn process_multipart(&mut self, multipart: Multipart) -> Vec<SubTimeFrame> {
        let mut emitted = Vec::new();

        let mut parts = multipart.into_iter();
        let header = match parts.next().as_deref().map(ReadoutHeader::parse) {
            Some(Ok(header)) => header,
            _ => {
                if let Some(n) = self.rl_framing.allow() {
                    log::error!("READOUT INTERFACE: unparsable readout header. suppressed={}", n);
                }
                return emitted;
            }
        };
        let mut data: Vec<Vec<u8>> = parts.collect();

        // a bare header must carry the stop flag
        if data.is_empty() && !header.last_tf_message() {
            if let Some(n) = self.rl_framing.allow() {
                log::error!(
                    "READOUT INTERFACE: Received only a header message without the STF stop bit set. suppressed={}",
                    n
                );
            }
            return emitted;
        }

        // cross-check the advertised link id against the first RDH
        if !data.is_empty() && header.is_rdh_format() {
            match RdhReader::new(&data[0], self.config.rdh_version) {
                Ok(rdh) => {
                    if rdh.link_id() != header.link_id {
                        if let Some(n) = self.rl_link.allow() {
                            log::error!(
                                "READOUT INTERFACE: Update link ID does not match RDH in the data block. \
                                 hdr_link_id={} rdh_link_id={} suppressed={}",
                                header.link_id,
                                rdh.link_id(),
                                n
                            );
                        }
                    }
                }
                Err(e) => {
                    let lost: u64 = data.iter().map(|p| p.len() as u64).sum();
                    self.counters.account_lost_bytes(lost);
                    if let Some(n) = self.rl_rdh.allow() {
                        log::error!(
                            "READOUT INTERFACE: error while parsing the RDH header. what={} suppressed={}",
                            e,
                            n
                        );
                    }
                    return emitted;
                }
            }
        }

        let tf_id = header.time_frame_id as u64;

        // a new id without the stop flag means the previous STF is done
        if let Some(current_id) = self.current_id() {
            if current_id != tf_id {
                if let Some(n) = self.rl_missed_stop.allow() {
                    log::error!(
                        "READOUT INTERFACE: Update with a new STF ID but the Stop flag was not set \
                         for the current STF. current_id={} new_id={} suppressed={}",
                        current_id,
                        tf_id,
                        n
                    );
                }
                emitted.extend(self.finish_current());
            }
        }

        if !data.is_empty() {
            self.add_hbf_runs(tf_id, &mut data);
        }

        if header.last_tf_message() {
            emitted.extend(self.finish_current());
        }

        emitted
    }

    /// Split the data parts into contiguous same-subspec runs and add
    /// them to the in-progress STF.
    fn add_hbf_runs(&mut self, tf_id: u64, data: &mut [Vec<u8>]) {
        let first = match RdhReader::new(&data[0], self.config.rdh_version) {
            Ok(rdh) => rdh,
            Err(e) => {
                let lost: u64 = data.iter().map(|p| p.len() as u64).sum();
                self.counters.account_lost_bytes(lost);
                if let Some(n) = self.rl_rdh.allow() {
                    log::error!(
                        "READOUT INTERFACE: Cannot parse RDH of received HBFs. what={} suppressed={}",
                        e,
                        n
                    );
                }
                return;
            }
        };

        let origin = match first.data_origin(self.config.detector) {
            Ok(det) => det,
            Err(e) => {
                let lost: u64 = data.iter().map(|p| p.len() as u64).sum();
                self.counters.account_lost_bytes(lost);
                if let Some(n) = self.rl_rdh.allow() {
                    log::error!("READOUT INTERFACE: {} suppressed={}", e, n);
                }
                return;
            }
        };

        let mut run_subspec = first.sub_specification(self.config.subspec_mode);
        let mut run: Vec<Vec<u8>> = Vec::new();

        for idx in 0..data.len() {
            let (subspec, keep) = {
                let rdh = match RdhReader::new(&data[idx], self.config.rdh_version) {
                    Ok(rdh) => rdh,
                    Err(e) => {
                        // the pending run and the rest of the multipart are lost
                        let lost: u64 = run.iter().map(|p| p.len() as u64).sum::<u64>()
                            + data[idx..].iter().map(|p| p.len() as u64).sum::<u64>();
                        self.counters.account_lost_bytes(lost);
                        if let Some(n) = self.rl_rdh.allow() {
                            log::error!(
                                "READOUT INTERFACE: RDH decode failed mid-update, abandoning the rest. \
                                 what={} lost_bytes={} suppressed={}",
                                e,
                                lost,
                                n
                            );
                        }
                        return;
                    }
                };

                let mut keep = true;
                if self.config.rdh_sanity_check != SanityCheckMode::Off {
                    if let Err(e) = rdh.sanity_check() {
                        match self.config.rdh_sanity_check {
                            SanityCheckMode::Print => {
                                log::error!("READOUT INTERFACE: RDH sanity check failed: {}", e);
                            }
                            SanityCheckMode::Drop => {
                                log::error!(
                                    "READOUT INTERFACE: RDH sanity check failed, dropping HBF: {}",
                                    e
                                );
                                self.counters.account_lost_bytes(data[idx].len() as u64);
                                keep = false;
                            }
                            SanityCheckMode::Off => {}
                        }
                    }
                }

                if keep && self.config.filter_empty_trigger && rdh.is_empty_trigger_hbf() {
                    self.counters.record_filtered_empty_hbf();
                    keep = false;
                }

                (rdh.sub_specification(self.config.subspec_mode), keep)
            };

            if subspec != run_subspec {
                if let Some(n) = self.rl_subspec.allow() {
                    log::warn!(
                        "READOUT INTERFACE: Update with mismatched subspecifications. \
                         run_subspec={:#06x} block[{}]_subspec={:#06x} suppressed={}",
                        run_subspec,
                        idx,
                        subspec,
                        n
                    );
                }
                self.flush_run(tf_id, origin, run_subspec, std::mem::take(&mut run));
                run_subspec = subspec;
            }

            if keep {
                run.push(std::mem::take(&mut data[idx]));
            }
        }

        self.flush_run(tf_id, origin, run_subspec, run);
    }

    fn flush_run(
        &mut self,
        tf_id: u64,
        origin: crate::config::Detector,
        raw_subspec: u32,
        run: Vec<Vec<u8>>,
    ) {
        if run.is_empty() {
            return;
        }
        let equipment = EquipmentIdentifier {
            origin: origin.into(),
            subspec: self.masked_subspec(raw_subspec),
        };
        self.current
            .get_or_insert_with(|| SubTimeFrame::new(tf_id))
            .add_hbfs(equipment, run);
    }
}

/// Assembly stage thread body.
pub fn run_assembly_stage(
    config: &BuilderConfig,
    state: Arc<BuilderState>,
    counters: Arc<BuilderCounters>,
    pipeline: Arc<BuilderPipeline>,
) {
    let mut assembler = StfAssembler::new(config, counters.clone());
    let mut started = false;
    let mut after_stop_count = 0u64;
    let mut rl_after_stop = RateLimiter::every_ms(1000);
    let mut rl_empty = RateLimiter::every_ms(1000);

    loop {
        let multipart = match pipeline.input_queue.pop_wait_for(STF_DATA_WAIT) {
            Ok(parts) => parts,
            Err(PopError::Timeout) => {
                if !state.running() {
                    break;
                }
                if started {
                    if let Some(stf) = assembler.finish_current() {
                        log::warn!(
                            "READOUT INTERFACE: finishing STF on a timeout. stf_id={} size={}",
                            stf.id(),
                            stf.data_size()
                        );
                        pipeline.sequencer_queue.push(stf);
                    }
                }
                continue;
            }
            Err(PopError::Stopped) => break,
        };

        if !state.running() {
            after_stop_count += 1;
            if let Some(n) = rl_after_stop.allow() {
                log::warn!(
                    "Assembly: Building STFs after stop signal. after_stop_stf_count={} suppressed={}",
                    after_stop_count,
                    n
                );
            }
        }

        if multipart.is_empty() {
            if let Some(n) = rl_empty.allow() {
                log::error!("READOUT INTERFACE: empty readout multipart. suppressed={}", n);
            }
            continue;
        }

        started = true;

        for stf in assembler.process_multipart(multipart) {
            pipeline.sequencer_queue.push(stf);
        }
    }

    log::debug!("Exiting assembly thread");
}
