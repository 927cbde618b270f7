//! Builder source buffer.
//!
//! Holds serialized STFs produced by the output stage, announces each to
//! the scheduler and serves pull requests from aggregators. An STF is
//! handed out exactly once; serving it removes it from the buffer.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::builder_core::output::SourceBufferEntry;
use crate::builder_core::BuilderCounters;
use crate::messages::{Hello, StfAnnounce, StfDataResponse, ToScheduler};
use crate::net::{self, SchedulerClientConn, StfServerConn};
use crate::readout::Multipart;

struct BufferInner {
    stfs: HashMap<u64, (Multipart, u64)>,
    order: VecDeque<u64>,
    used_bytes: u64,
}

/// Bounded by bytes; over capacity the oldest STFs are evicted.
pub struct SourceBuffer {
    inner: Mutex<BufferInner>,
    capacity_bytes: u64,
}

impl SourceBuffer {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(BufferInner {
                stfs: HashMap::new(),
                order: VecDeque::new(),
                used_bytes: 0,
            }),
            capacity_bytes,
        }
    }

    /// Insert one serialized STF; returns `(tf_id, size)` of evictions.
    pub fn insert(&self, tf_id: u64, parts: Multipart, size: u64) -> Vec<(u64, u64)> {
        let mut inner = self.inner.lock().unwrap();
        if inner.stfs.insert(tf_id, (parts, size)).is_none() {
            inner.order.push_back(tf_id);
        }
        inner.used_bytes += size;

        let mut evicted = Vec::new();
        while inner.used_bytes > self.capacity_bytes && inner.order.len() > 1 {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            if let Some((_, old_size)) = inner.stfs.remove(&oldest) {
                inner.used_bytes -= old_size;
                evicted.push((oldest, old_size));
            }
        }
        evicted
    }

    /// Remove and return one STF; it belongs to the caller afterwards.
    pub fn take(&self, tf_id: u64) -> Option<(Multipart, u64)> {
        let mut inner = self.inner.lock().unwrap();
        let (parts, size) = inner.stfs.remove(&tf_id)?;
        inner.used_bytes -= size;
        inner.order.retain(|&id| id != tf_id);
        Some((parts, size))
    }

    pub fn used_bytes(&self) -> u64 {
        self.inner.lock().unwrap().used_bytes
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().stfs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Consume serialized STFs from the output stage, buffer and announce.
pub async fn run_source_buffer(
    mut rx: mpsc::Receiver<SourceBufferEntry>,
    buffer: Arc<SourceBuffer>,
    to_scheduler: mpsc::UnboundedSender<ToScheduler>,
    counters: Arc<BuilderCounters>,
    sender_id: String,
) {
    while let Some(entry) = rx.recv().await {
        let evicted = buffer.insert(entry.tf_id, entry.parts, entry.size);
        for (old_id, old_size) in evicted {
            counters.account_lost_bytes(old_size);
            counters.record_dropped_stf();
            log::warn!(
                "Source buffer full, evicted unclaimed STF. stf_id={} size={}",
                old_id,
                old_size
            );
        }

        let announce = ToScheduler::StfAnnounce(StfAnnounce {
            stf_sender_id: sender_id.clone(),
            tf_id: entry.tf_id,
            size: entry.size,
        });
        if to_scheduler.send(announce).is_err() {
            log::warn!("Scheduler link is gone, stopping STF announcements");
            break;
        }
    }

    log::debug!("Source buffer task stopped");
}

/// Serve `StfDataRequest` pulls from aggregators.
pub async fn run_stf_server(listener: TcpListener, buffer: Arc<SourceBuffer>, sender_id: String) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::error!("STF server accept failed: {}", e);
                continue;
            }
        };
        log::debug!("Aggregator connected for STF pulls: {}", peer);

        let buffer = buffer.clone();
        let sender_id = sender_id.clone();
        tokio::spawn(async move {
            let mut conn: StfServerConn = net::framed(stream);
            while let Some(request) = conn.next().await {
                let request = match request {
                    Ok(request) => request,
                    Err(e) => {
                        log::debug!("STF pull connection error: {}", e);
                        break;
                    }
                };

                let parts = buffer.take(request.tf_id).map(|(parts, _)| parts);
                if parts.is_none() {
                    log::warn!(
                        "STF pull for unknown stf. tf_id={} requested_by={}",
                        request.tf_id,
                        peer
                    );
                }

                let response = StfDataResponse {
                    tf_id: request.tf_id,
                    stf_sender_id: sender_id.clone(),
                    parts,
                };
                if let Err(e) = conn.send(response).await {
                    log::debug!("STF pull response failed: {}", e);
                    break;
                }
            }
        });
    }
}

/// Builder side of the scheduler connection: identify, then forward
/// announcements. Reconnects if the scheduler goes away.
pub async fn run_scheduler_link(
    endpoint: String,
    hello: Hello,
    mut from_local: mpsc::UnboundedReceiver<ToScheduler>,
) {
    loop {
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
                    // the scheduler does not command builders
                    Some(Ok(_)) => log::debug!("Ignoring scheduler message on the builder link"),
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

    fn parts_of(len: usize) -> Multipart {
        vec![vec![0u8; len]]
    }

    #[test]
    fn test_insert_take_removes() {
        let buffer = SourceBuffer::new(1 << 20);
        buffer.insert(1, parts_of(100), 100);
        buffer.insert(2, parts_of(50), 50);
        assert_eq!(buffer.used_bytes(), 150);

        let (parts, size) = buffer.take(1).unwrap();
        assert_eq!(size, 100);
        assert_eq!(parts[0].len(), 100);
        assert_eq!(buffer.used_bytes(), 50);

        // an STF is served exactly once
        assert!(buffer.take(1).is_none());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let buffer = SourceBuffer::new(250);
        buffer.insert(1, parts_of(100), 100);
        buffer.insert(2, parts_of(100), 100);
        let evicted = buffer.insert(3, parts_of(100), 100);

        assert_eq!(evicted, vec![(1, 100)]);
        assert_eq!(buffer.len(), 2);
        assert!(buffer.take(1).is_none());
        assert!(buffer.take(2).is_some());
    }

    #[test]
    fn test_newest_entry_never_self_evicts() {
        let buffer = SourceBuffer::new(10);
        let evicted = buffer.insert(1, parts_of(100), 100);
        assert!(evicted.is_empty());
        assert_eq!(buffer.len(), 1);
    }

    #[tokio::test]
    async fn test_source_buffer_task_announces() {
        let buffer = Arc::new(SourceBuffer::new(1 << 20));
        let counters = Arc::new(BuilderCounters::new());
        let (entry_tx, entry_rx) = mpsc::channel(4);
        let (sched_tx, mut sched_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(run_source_buffer(
            entry_rx,
            buffer.clone(),
            sched_tx,
            counters,
            "builder-7".to_string(),
        ));

        entry_tx
            .send(SourceBufferEntry {
                tf_id: 42,
                parts: parts_of(128),
                size: 128,
            })
            .await
            .unwrap();

        let announce = sched_rx.recv().await.unwrap();
        match announce {
            ToScheduler::StfAnnounce(a) => {
                assert_eq!(a.tf_id, 42);
                assert_eq!(a.size, 128);
                assert_eq!(a.stf_sender_id, "builder-7");
            }
            other => panic!("unexpected message: {:?}", other),
        }
        assert_eq!(buffer.len(), 1);

        drop(entry_tx);
        task.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stf_server_serves_and_removes() {
        use crate::messages::StfDataRequest;
        use crate::net::StfClientConn;
        use tokio::net::TcpStream;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let buffer = Arc::new(SourceBuffer::new(1 << 20));
        buffer.insert(9, parts_of(64), 64);
        tokio::spawn(run_stf_server(listener, buffer.clone(), "builder-0".to_string()));

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client: StfClientConn = net::framed(stream);

        client.send(StfDataRequest { tf_id: 9 }).await.unwrap();
        let response = client.next().await.unwrap().unwrap();
        assert_eq!(response.tf_id, 9);
        assert!(response.parts.is_some());
        assert!(buffer.is_empty());

        // the same id is no longer available
        client.send(StfDataRequest { tf_id: 9 }).await.unwrap();
        let response = client.next().await.unwrap().unwrap();
        assert!(response.parts.is_none());
    }
}
