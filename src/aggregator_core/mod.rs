//! TF aggregation node core.
//!
//! The scheduler link admits build requests against the buffer
//! accounting and queues them; the build thread pulls STFs from the
//! sources; the drain loop hands finished TimeFrames downstream; the
//! update thread reports free memory back to the scheduler.

pub mod accounting;
pub mod build;
pub mod sink;
pub mod update;

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::aggregator_core::accounting::BufferAccounting;
use crate::fifo::ConcurrentFifo;
use crate::messages::{
    BuildTfResponse, FromScheduler, Hello, PartitionResponse, TfBuildingInformation, ToScheduler,
};
use crate::net::{self, SchedulerClientConn};

/// Handle one incoming build request: admission control, then queue.
pub fn handle_build_request(
    accounting: &BufferAccounting,
    requests: &ConcurrentFifo<TfBuildingInformation>,
    request: TfBuildingInformation,
) -> BuildTfResponse {
    match accounting.admit(request.tf_id, request.tf_size) {
        Ok(()) => {
            let tf_id = request.tf_id;
            if requests.try_push(request).is_err() {
                // queue is stopped: shutting down, release the charge
                accounting.record_failed(tf_id);
                return BuildTfResponse {
                    tf_id,
                    accepted: false,
                    reason: Some(crate::messages::BuildRefusal::NotAccepting),
                };
            }
            BuildTfResponse {
                tf_id,
                accepted: true,
                reason: None,
            }
        }
        Err(refusal) => {
            log::warn!(
                "Rejecting TimeFrame. tf_id={} size={} reason={}",
                request.tf_id,
                request.tf_size,
                refusal
            );
            BuildTfResponse {
                tf_id: request.tf_id,
                accepted: false,
                reason: Some(refusal),
            }
        }
    }
}

/// Aggregator side of the scheduler connection. Sends the identity and
/// the periodic updates, answers build requests and the terminate call.
pub async fn run_scheduler_link(
    endpoint: String,
    hello: Hello,
    accounting: Arc<BufferAccounting>,
    requests: Arc<ConcurrentFifo<TfBuildingInformation>>,
    mut from_local: mpsc::UnboundedReceiver<ToScheduler>,
) {
    loop {
        if accounting.terminate_requested() {
            return;
        }

        let stream = match net::connect_with_retry(&endpoint).await {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("Cannot reach the scheduler at {}: {}", endpoint, e);
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                continue;
            }
        };
        let mut conn: SchedulerClientConn = net::framed(stream);

        if conn.send(ToScheduler::Hello(hello.clone())).await.is_err() {
            continue;
        }
        log::info!("🔗 Connected to the scheduler at {}", endpoint);

        loop {
            tokio::select! {
                outgoing = from_local.recv() => match outgoing {
                    Some(message) => {
                        if conn.send(message).await.is_err() {
                            log::warn!("Scheduler connection lost, reconnecting");
                            break;
                        }
                    }
                    None => return,
                },
                incoming = conn.next() => match incoming {
                    Some(Ok(FromScheduler::BuildTfRequest(request))) => {
                        let response = handle_build_request(&accounting, &requests, request);
                        if conn
                            .send(ToScheduler::BuildTfResponse(response))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(FromScheduler::TerminatePartition(info))) => {
                        log::info!("🛑 Partition terminate requested. partition={}", info.partition_id);
                        accounting.request_terminate();
                        let response = PartitionResponse {
                            partition_id: info.partition_id,
                            acknowledged: true,
                        };
                        let _ = conn.send(ToScheduler::PartitionResponse(response)).await;
                    }
                    Some(Err(e)) => {
                        log::warn!("Scheduler connection error: {}, reconnecting", e);
                        break;
                    }
                    None => {
                        log::warn!("Scheduler closed the connection, reconnecting");
                        break;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::BuildRefusal;

    fn request(tf_id: u64, size: u64) -> TfBuildingInformation {
        TfBuildingInformation {
            tf_id,
            stf_sizes: vec![("builder-0".to_string(), size)],
            tf_size: size,
        }
    }

    #[test]
    fn test_accepted_request_is_queued_and_charged() {
        let accounting = BufferAccounting::new(1000);
        let requests = ConcurrentFifo::new();

        let response = handle_build_request(&accounting, &requests, request(1, 400));
        assert!(response.accepted);
        assert_eq!(requests.len(), 1);
        assert_eq!(accounting.current_tf_buffer_size(), 400);
    }

    #[test]
    fn test_overflow_rejected_with_reason() {
        let accounting = BufferAccounting::new(1000);
        let requests = ConcurrentFifo::new();

        assert!(handle_build_request(&accounting, &requests, request(1, 900)).accepted);
        let response = handle_build_request(&accounting, &requests, request(2, 200));

        assert!(!response.accepted);
        assert_eq!(response.reason, Some(BuildRefusal::InsufficientBuffer));
        // the rejected TF left no charge behind
        assert_eq!(accounting.current_tf_buffer_size(), 900);
        assert_eq!(requests.len(), 1);
    }

    #[test]
    fn test_terminated_node_rejects() {
        let accounting = BufferAccounting::new(1000);
        let requests = ConcurrentFifo::new();
        accounting.request_terminate();

        let response = handle_build_request(&accounting, &requests, request(1, 10));
        assert!(!response.accepted);
        assert_eq!(response.reason, Some(BuildRefusal::NotAccepting));
    }

    #[test]
    fn test_stopped_queue_releases_charge() {
        let accounting = BufferAccounting::new(1000);
        let requests = ConcurrentFifo::new();
        requests.stop();

        let response = handle_build_request(&accounting, &requests, request(1, 10));
        assert!(!response.accepted);
        assert_eq!(accounting.current_tf_buffer_size(), 0);
    }
}
