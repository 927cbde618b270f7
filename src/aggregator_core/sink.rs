//! Downstream drain for built TimeFrames.
//!
//! The node holds a TF until the sink consumes it; consumption releases
//! the buffer charge. The default sink just records the hand-off.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::aggregator_core::accounting::BufferAccounting;
use crate::stf::TimeFrame;

#[derive(Debug)]
pub struct SinkError(pub String);

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TF sink error: {}", self.0)
    }
}

impl std::error::Error for SinkError {}

#[async_trait]
pub trait TfSink: Send + Sync {
    async fn consume(&self, tf: TimeFrame) -> Result<(), SinkError>;
}

/// Records the TF and drops it; stands in for a real downstream consumer.
pub struct LogSink;

#[async_trait]
impl TfSink for LogSink {
    async fn consume(&self, tf: TimeFrame) -> Result<(), SinkError> {
        log::info!(
            "⬇️  TimeFrame drained. tf_id={} stf_count={} size={}",
            tf.id,
            tf.stf_count(),
            tf.data_size()
        );
        Ok(())
    }
}

/// Pass built TimeFrames to the sink and discharge their accounting.
pub async fn run_drain_loop(
    mut rx: mpsc::Receiver<TimeFrame>,
    sink: Arc<dyn TfSink>,
    accounting: Arc<BufferAccounting>,
) {
    while let Some(tf) = rx.recv().await {
        let tf_id = tf.id;
        if let Err(e) = sink.consume(tf).await {
            log::error!("Failed to drain TimeFrame. tf_id={} what={}", tf_id, e);
        }
        // the TF left the buffer either way
        accounting.record_forwarded(tf_id);
    }
    log::debug!("TF drain loop stopped");
}
