//! Framed TCP transport between processes.
//!
//! Frames are length-delimited bincode. Each channel type gets a pair of
//! aliases over `Framed` for the two directions of the stream.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_serde::formats::Bincode;
use tokio_util::codec::LengthDelimitedCodec;

use crate::fifo::{ConcurrentFifo, PopError};
use crate::messages::{
    FromScheduler, StfDataRequest, StfDataResponse, ToScheduler, WorkflowMessage,
};
use crate::readout::Multipart;

/// A framed connection carrying `T` inbound and `U` outbound.
pub type Framed<C, T, U> =
    tokio_serde::Framed<tokio_util::codec::Framed<C, LengthDelimitedCodec>, T, U, Bincode<T, U>>;

/// Scheduler side of a peer connection.
pub type SchedulerServerConn = Framed<TcpStream, ToScheduler, FromScheduler>;
/// Builder/aggregator side of the scheduler connection.
pub type SchedulerClientConn = Framed<TcpStream, FromScheduler, ToScheduler>;

/// Source-buffer side of an STF pull connection.
pub type StfServerConn = Framed<TcpStream, StfDataRequest, StfDataResponse>;
/// Aggregator side of an STF pull connection.
pub type StfClientConn = Framed<TcpStream, StfDataResponse, StfDataRequest>;

/// Builder side of the readout channel (receive only).
pub type ReadoutServerConn = Framed<TcpStream, Multipart, Multipart>;
/// Readout/replay side of the readout channel.
pub type ReadoutClientConn = Framed<TcpStream, Multipart, Multipart>;

/// Builder side of the workflow channel (send only).
pub type WorkflowClientConn = Framed<TcpStream, WorkflowMessage, WorkflowMessage>;

fn length_delimited_codec() -> LengthDelimitedCodec {
    let mut codec = LengthDelimitedCodec::new();
    // STFs can be large; the consumer pulls them one at a time
    codec.set_max_frame_length(usize::MAX);
    codec
}

/// Wrap a raw connection into the framed transport.
pub fn framed<C, T, U>(conn: C) -> Framed<C, T, U>
where
    C: AsyncRead + AsyncWrite,
{
    tokio_serde::Framed::new(
        tokio_util::codec::Framed::new(conn, length_delimited_codec()),
        Bincode::default(),
    )
}

/// Connect with bounded retries; peers may come up in any order.
pub async fn connect_with_retry(addr: &str) -> io::Result<TcpStream> {
    let mut retries = 10;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(_) if retries > 0 => {
                retries -= 1;
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Transport-level receive outcomes surfaced to the input stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No data within the deadline.
    Timeout,
    /// The peer went away; a reconnect may follow.
    Interrupted,
    /// Receive failed (framing/decode); the stream continues.
    Error(String),
    /// The channel was shut down locally.
    Closed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Timeout => write!(f, "receive timeout"),
            TransportError::Interrupted => write!(f, "transport interrupted"),
            TransportError::Error(msg) => write!(f, "transport error: {}", msg),
            TransportError::Closed => write!(f, "channel closed"),
        }
    }
}

/// Events produced by the accept loop for the blocking receiver.
pub enum TransportEvent {
    Multipart(Multipart),
    Interrupted,
    Error(String),
}

/// Blocking receive side of the readout channel, backed by the accept
/// loop below. This is what the input-stage thread polls.
pub struct ReadoutReceiver {
    events: Arc<ConcurrentFifo<TransportEvent>>,
}

impl ReadoutReceiver {
    pub fn receive(&self, timeout: Duration) -> Result<Multipart, TransportError> {
        match self.events.pop_wait_for(timeout) {
            Ok(TransportEvent::Multipart(parts)) => Ok(parts),
            Ok(TransportEvent::Interrupted) => Err(TransportError::Interrupted),
            Ok(TransportEvent::Error(msg)) => Err(TransportError::Error(msg)),
            Err(PopError::Timeout) => Err(TransportError::Timeout),
            Err(PopError::Stopped) => Err(TransportError::Closed),
        }
    }

    pub fn close(&self) {
        self.events.stop();
    }

    pub fn queued(&self) -> usize {
        self.events.len()
    }
}

/// Create the receiver and the event queue the accept loop feeds.
pub fn readout_channel() -> (ReadoutReceiver, Arc<ConcurrentFifo<TransportEvent>>) {
    let events = Arc::new(ConcurrentFifo::new());
    (
        ReadoutReceiver {
            events: events.clone(),
        },
        events,
    )
}

/// Accept loop for the readout channel. One readout link group connects
/// at a time; a dropped connection is surfaced as `Interrupted` and the
/// loop goes back to accepting.
pub async fn readout_accept_loop(
    listener: TcpListener,
    events: Arc<ConcurrentFifo<TransportEvent>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let stream = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    log::info!("🔗 Readout connected from {}", peer);
                    stream
                }
                Err(e) => {
                    let _ = events.try_push(TransportEvent::Error(e.to_string()));
                    continue;
                }
            },
            _ = shutdown.changed() => break,
        };

        let mut conn: ReadoutServerConn = framed(stream);
        loop {
            tokio::select! {
                item = conn.next() => match item {
                    Some(Ok(parts)) => {
                        if events.try_push(TransportEvent::Multipart(parts)).is_err() {
                            return; // receiver closed
                        }
                    }
                    Some(Err(e)) => {
                        let _ = events.try_push(TransportEvent::Error(e.to_string()));
                    }
                    None => {
                        log::info!("🔌 Readout disconnected");
                        let _ = events.try_push(TransportEvent::Interrupted);
                        break;
                    }
                },
                _ = shutdown.changed() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::SinkExt;
    use crate::readout::ReadoutHeader;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_readout_channel_delivers_multiparts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (receiver, events) = readout_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(readout_accept_loop(listener, events, shutdown_rx));

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client: ReadoutClientConn = framed(stream);

        let multipart = vec![
            ReadoutHeader::new(1, 0).encode().to_vec(),
            vec![0xAB; 256],
        ];
        client.send(multipart.clone()).await.unwrap();

        let received = tokio::task::spawn_blocking(move || {
            receiver.receive(Duration::from_secs(5))
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(received, multipart);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disconnect_surfaces_interrupted() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (receiver, events) = readout_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(readout_accept_loop(listener, events, shutdown_rx));

        let stream = TcpStream::connect(addr).await.unwrap();
        drop(stream);

        let result = tokio::task::spawn_blocking(move || {
            // first event after a bare connect/drop must be the interrupt
            receiver.receive(Duration::from_secs(5))
        })
        .await
        .unwrap();

        assert_eq!(result, Err(TransportError::Interrupted));
    }

    #[test]
    fn test_closed_receiver_reports_closed() {
        let (receiver, _events) = readout_channel();
        receiver.close();
        assert_eq!(
            receiver.receive(Duration::from_millis(10)),
            Err(TransportError::Closed)
        );
    }
}
