//! Every message crossing a process boundary.
//!
//! All messages travel as bincode over length-delimited TCP frames, see
//! `net`. The scheduler connection is a duplex stream: peers identify
//! themselves with `Hello` and then push role-specific messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::readout::Multipart;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    Builder,
    Aggregator,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub role: PeerRole,
    pub process_id: String,
    pub partition_id: String,
}

/// One finished STF became available at a builder's source buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StfAnnounce {
    pub stf_sender_id: String,
    pub tf_id: u64,
    pub size: u64,
}

/// Periodic resource report from an aggregation node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TfBuilderUpdateMessage {
    pub process_id: String,
    pub partition_id: String,
    pub free_memory: u64,
    pub buffer_size: u64,
    pub num_buffered_tfs: u32,
    pub last_built_tf_id: u64,
    /// Builds that failed since the previous update.
    pub failed_tf_count: u64,
    pub wall_time: DateTime<Utc>,
}

/// Assignment record: which sources hold the STFs of one TimeFrame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TfBuildingInformation {
    pub tf_id: u64,
    /// (stf_sender_id, stf_size) for every source.
    pub stf_sizes: Vec<(String, u64)>,
    pub tf_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildRefusal {
    NotAccepting,
    InsufficientBuffer,
}

impl std::fmt::Display for BuildRefusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildRefusal::NotAccepting => write!(f, "not accepting new TimeFrames"),
            BuildRefusal::InsufficientBuffer => write!(f, "TF buffer capacity exceeded"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildTfResponse {
    pub tf_id: u64,
    pub accepted: bool,
    pub reason: Option<BuildRefusal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub partition_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionResponse {
    pub partition_id: String,
    pub acknowledged: bool,
}

/// Builder/aggregator → scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ToScheduler {
    Hello(Hello),
    StfAnnounce(StfAnnounce),
    TfBuilderUpdate(TfBuilderUpdateMessage),
    BuildTfResponse(BuildTfResponse),
    PartitionResponse(PartitionResponse),
}

/// Scheduler → aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FromScheduler {
    BuildTfRequest(TfBuildingInformation),
    TerminatePartition(PartitionInfo),
}

/// Aggregator → builder source buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StfDataRequest {
    pub tf_id: u64,
}

/// Builder source buffer → aggregator. `parts` is the interleaved STF
/// framing produced by the output serializer, served verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StfDataResponse {
    pub tf_id: u64,
    pub stf_sender_id: String,
    pub parts: Option<Multipart>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowChannelState {
    Running,
    Completed,
}

/// Header stack of a workflow-framework record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowHeaderStack {
    pub state: WorkflowChannelState,
    pub tf_id: Option<u64>,
}

/// Two-part record on the workflow channel: header stack plus body parts.
/// The end-of-stream record carries `state = Completed` and an empty body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowMessage {
    pub headers: WorkflowHeaderStack,
    pub body: Multipart,
}

impl WorkflowMessage {
    pub fn source_completed() -> Self {
        Self {
            headers: WorkflowHeaderStack {
                state: WorkflowChannelState::Completed,
                tf_id: None,
            },
            body: vec![Vec::new()],
        }
    }

    pub fn payload(tf_id: u64, body: Multipart) -> Self {
        Self {
            headers: WorkflowHeaderStack {
                state: WorkflowChannelState::Running,
                tf_id: Some(tf_id),
            },
            body,
        }
    }
}
