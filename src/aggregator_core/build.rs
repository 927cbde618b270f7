//! TimeFrame build loop.
//!
//! Pops assignment records from the build queue and pulls the
//! constituent STFs from every listed source in parallel. The thread
//! hosts its own single-threaded runtime for the pull I/O.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::{future, SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::aggregator_core::accounting::BufferAccounting;
use crate::codec::deserialize_stf;
use crate::discovery::DiscoveryDb;
use crate::fifo::{ConcurrentFifo, PopError};
use crate::messages::{StfDataRequest, TfBuildingInformation};
use crate::net::{self, StfClientConn};
use crate::stf::{SubTimeFrame, TimeFrame};

const BUILD_POLL: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub enum BuildError {
    UnknownSource(String),
    Connect { source: String, what: String },
    Protocol { source: String, what: String },
    StfGone { source: String, tf_id: u64 },
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::UnknownSource(source) => {
                write!(f, "source '{}' is not registered", source)
            }
            BuildError::Connect { source, what } => {
                write!(f, "cannot reach source '{}': {}", source, what)
            }
            BuildError::Protocol { source, what } => {
                write!(f, "bad response from source '{}': {}", source, what)
            }
            BuildError::StfGone { source, tf_id } => {
                write!(f, "source '{}' no longer holds STF {}", source, tf_id)
            }
        }
    }
}

impl std::error::Error for BuildError {}

/// Pull one STF from one source buffer.
async fn pull_stf(
    discovery: &DiscoveryDb,
    source: &str,
    tf_id: u64,
) -> Result<SubTimeFrame, BuildError> {
    let endpoint = discovery
        .endpoint_of(source)
        .map_err(|e| BuildError::UnknownSource(format!("{}: {}", source, e)))?
        .ok_or_else(|| BuildError::UnknownSource(source.to_string()))?;

    let stream = net::connect_with_retry(&endpoint)
        .await
        .map_err(|e| BuildError::Connect {
            source: source.to_string(),
            what: e.to_string(),
        })?;
    let mut conn: StfClientConn = net::framed(stream);

    conn.send(StfDataRequest { tf_id })
        .await
        .map_err(|e| BuildError::Connect {
            source: source.to_string(),
            what: e.to_string(),
        })?;

    let response = match conn.next().await {
        Some(Ok(response)) => response,
        Some(Err(e)) => {
            return Err(BuildError::Protocol {
                source: source.to_string(),
                what: e.to_string(),
            })
        }
        None => {
            return Err(BuildError::Connect {
                source: source.to_string(),
                what: "connection closed".to_string(),
            })
        }
    };

    let parts = response.parts.ok_or(BuildError::StfGone {
        source: source.to_string(),
        tf_id,
    })?;

    deserialize_stf(&parts).map_err(|e| BuildError::Protocol {
        source: source.to_string(),
        what: e.to_string(),
    })
}

/// Pull all STFs of one assignment in parallel.
pub async fn build_time_frame(
    discovery: &DiscoveryDb,
    request: &TfBuildingInformation,
) -> Result<TimeFrame, BuildError> {
    let pulls = request
        .stf_sizes
        .iter()
        .map(|(source, _)| pull_stf(discovery, source, request.tf_id));

    let mut stfs = Vec::with_capacity(request.stf_sizes.len());
    for result in future::join_all(pulls).await {
        stfs.push(result?);
    }
    Ok(TimeFrame::new(request.tf_id, stfs))
}

/// Build thread body. Keeps draining the queue after a terminate request
/// until it runs dry.
pub fn run_build_loop(
    requests: Arc<ConcurrentFifo<TfBuildingInformation>>,
    accounting: Arc<BufferAccounting>,
    discovery: Arc<DiscoveryDb>,
    built_tx: mpsc::Sender<TimeFrame>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Cannot create the build runtime: {}", e);
            return;
        }
    };

    loop {
        let request = match requests.pop_wait_for(BUILD_POLL) {
            Ok(request) => request,
            Err(PopError::Timeout) => {
                if accounting.terminate_requested() {
                    break;
                }
                continue;
            }
            Err(PopError::Stopped) => break,
        };

        log::debug!(
            "Building TimeFrame. tf_id={} sources={} size={}",
            request.tf_id,
            request.stf_sizes.len(),
            request.tf_size
        );

        match runtime.block_on(build_time_frame(&discovery, &request)) {
            Ok(tf) => {
                accounting.record_built(tf.id);
                if built_tx.blocking_send(tf).is_err() {
                    log::warn!("TF drain is gone, stopping the build loop");
                    break;
                }
            }
            Err(e) => {
                log::error!(
                    "TimeFrame build failed. tf_id={} what={}",
                    request.tf_id,
                    e
                );
                accounting.record_failed(request.tf_id);
            }
        }
    }

    log::debug!("Exiting build thread");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder_core::sender::{run_stf_server, SourceBuffer};
    use crate::codec::{multipart_size, serialize_stf};
    use crate::messages::PeerRole;
    use tempfile::NamedTempFile;
    use tokio::net::TcpListener;

    async fn source_with_stf(
        db_path: &str,
        sender_id: &str,
        stf: &SubTimeFrame,
    ) -> Arc<SourceBuffer> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let discovery = DiscoveryDb::open(db_path, "test").unwrap();
        discovery
            .register(sender_id, PeerRole::Builder, &addr)
            .unwrap();

        let buffer = Arc::new(SourceBuffer::new(1 << 20));
        let parts = serialize_stf(stf);
        buffer.insert(stf.id(), parts.clone(), multipart_size(&parts));
        tokio::spawn(run_stf_server(listener, buffer.clone(), sender_id.to_string()));
        buffer
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_build_pulls_from_all_sources() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();

        let mut stf_a = SubTimeFrame::new(3);
        stf_a.add_hbfs(
            crate::stf::EquipmentIdentifier {
                origin: crate::config::Detector::TPC.into(),
                subspec: 1,
            },
            vec![vec![0u8; 256]],
        );
        let stf_b = SubTimeFrame::new(3);

        source_with_stf(path, "builder-0", &stf_a).await;
        source_with_stf(path, "builder-1", &stf_b).await;

        let discovery = DiscoveryDb::open(path, "test").unwrap();
        let request = TfBuildingInformation {
            tf_id: 3,
            stf_sizes: vec![
                ("builder-0".to_string(), 256),
                ("builder-1".to_string(), 0),
            ],
            tf_size: 256,
        };

        let tf = build_time_frame(&discovery, &request).await.unwrap();
        assert_eq!(tf.id, 3);
        assert_eq!(tf.stf_count(), 2);
        assert_eq!(tf.data_size(), 256);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_build_fails_when_stf_gone() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();

        let stf = SubTimeFrame::new(1);
        source_with_stf(path, "builder-0", &stf).await;

        let discovery = DiscoveryDb::open(path, "test").unwrap();
        let request = TfBuildingInformation {
            tf_id: 99, // never announced
            stf_sizes: vec![("builder-0".to_string(), 10)],
            tf_size: 10,
        };

        let err = build_time_frame(&discovery, &request).await.unwrap_err();
        assert!(matches!(err, BuildError::StfGone { tf_id: 99, .. }));
    }

    #[test]
    fn test_build_loop_charges_and_discharges() {
        // full path: admit → build (loopback pull) → drain
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();

        let stf = SubTimeFrame::new(5);
        runtime.block_on(source_with_stf(&path, "builder-0", &stf));

        let accounting = Arc::new(BufferAccounting::new(1000));
        accounting.admit(5, 10).unwrap();

        let requests = Arc::new(ConcurrentFifo::new());
        requests.push(TfBuildingInformation {
            tf_id: 5,
            stf_sizes: vec![("builder-0".to_string(), 10)],
            tf_size: 10,
        });
        requests.stop();

        let discovery = Arc::new(DiscoveryDb::open(&path, "test").unwrap());
        let (built_tx, mut built_rx) = mpsc::channel(4);

        let acc = accounting.clone();
        let build = std::thread::spawn(move || {
            run_build_loop(requests, acc, discovery, built_tx);
        });
        build.join().unwrap();

        let tf = built_rx.blocking_recv().unwrap();
        assert_eq!(tf.id, 5);
        assert_eq!(accounting.num_buffered_tfs(), 1);
        assert!(accounting.is_charged(5));

        // the runtime keeps the stf server alive until here
        drop(runtime);
    }
}
