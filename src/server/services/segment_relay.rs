//! Chunk hand-off between the task pulling a segment from the origin and the response body
//! that writes it to the player.
//!
//! The producer never waits: chunks that arrive while nobody is reading are queued, and a read
//! that finds the queue empty parks until the next delivery. Only one read can be parked at a time.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::Stream;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("a read is already pending on this relay")]
    ReadPending,
    #[error("upstream failed mid-segment: {0}")]
    Upstream(String),
}

#[derive(Debug)]
enum Delivery {
    Chunk(Bytes),
    Eof,
    Failed(String),
}

#[derive(Default)]
struct RelayState {
    queue: VecDeque<Bytes>,
    // set once, every read after the queue drains sees it
    terminal: Option<Result<(), String>>,
    waiter: Option<oneshot::Sender<Delivery>>,
}

/// single producer / single consumer exchange guarded by one mutex
#[derive(Clone, Default)]
pub struct ChunkRelay {
    state: Arc<Mutex<RelayState>>,
}

impl ChunkRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// hand a chunk over, straight to a parked reader if there is one
    pub fn deliver(&self, chunk: Bytes) {
        let mut state = self.lock();
        if state.terminal.is_some() {
            return;
        }

        match state.waiter.take() {
            Some(waiter) => {
                // reader went away between parking and now, keep the bytes for the next one
                if let Err(Delivery::Chunk(chunk)) = waiter.send(Delivery::Chunk(chunk)) {
                    state.queue.push_back(chunk);
                }
            }
            None => state.queue.push_back(chunk),
        }
    }

    pub fn finish(&self) {
        self.complete(Ok(()));
    }

    pub fn fail(&self, reason: impl Into<String>) {
        self.complete(Err(reason.into()));
    }

    fn complete(&self, outcome: Result<(), String>) {
        let mut state = self.lock();
        if state.terminal.is_some() {
            return;
        }

        if let Some(waiter) = state.waiter.take() {
            let _ = waiter.send(match &outcome {
                Ok(()) => Delivery::Eof,
                Err(reason) => Delivery::Failed(reason.clone()),
            });
        }
        state.terminal = Some(outcome);
    }

    /// next chunk in arrival order, `Ok(None)` once the segment is complete
    pub async fn read_next_chunk(&self) -> Result<Option<Bytes>, RelayError> {
        let receiver = {
            let mut state = self.lock();

            if let Some(chunk) = state.queue.pop_front() {
                return Ok(Some(chunk));
            }

            match &state.terminal {
                Some(Ok(())) => return Ok(None),
                Some(Err(reason)) => return Err(RelayError::Upstream(reason.clone())),
                None => {}
            }

            if state.waiter.as_ref().is_some_and(|w| !w.is_closed()) {
                return Err(RelayError::ReadPending);
            }

            let (sender, receiver) = oneshot::channel();
            state.waiter = Some(sender);
            receiver
        };

        match receiver.await {
            Ok(Delivery::Chunk(chunk)) => Ok(Some(chunk)),
            Ok(Delivery::Eof) => Ok(None),
            Ok(Delivery::Failed(reason)) => Err(RelayError::Upstream(reason)),
            // sender dropped without a delivery means the relay itself went away
            Err(_) => Err(RelayError::Upstream("relay closed".to_string())),
        }
    }
}

/// a registered upstream body, dropping it stops the producer task
pub struct RelayHandle {
    relay: ChunkRelay,
    producer: JoinHandle<()>,
}

impl RelayHandle {
    pub async fn read_next_chunk(&self) -> Result<Option<Bytes>, RelayError> {
        self.relay.read_next_chunk().await
    }

    /// body stream for axum, ends on eof and yields the error on failure
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, RelayError>> + Send + 'static {
        futures::stream::unfold(Some(self), |handle| async move {
            let handle = handle?;
            match handle.read_next_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(handle))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        // player hung up or switched channel, no point pulling the rest of the segment
        self.producer.abort();
    }
}

/// chunk source the relay can pull from, implemented for upstream responses
#[async_trait::async_trait]
pub trait ChunkSource: Send + 'static {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, String>;
}

#[async_trait::async_trait]
impl ChunkSource for reqwest::Response {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, String> {
        self.chunk().await.map_err(|e| e.to_string())
    }
}

pub struct SegmentStreamingRelay;

impl SegmentStreamingRelay {
    /// start pulling `source` in the background and return the read side
    pub fn register<S: ChunkSource>(mut source: S) -> RelayHandle {
        let relay = ChunkRelay::new();
        let producer_relay = relay.clone();

        let producer = tokio::spawn(async move {
            let mut total = 0usize;
            loop {
                match source.next_chunk().await {
                    Ok(Some(chunk)) => {
                        total += chunk.len();
                        producer_relay.deliver(chunk);
                    }
                    Ok(None) => {
                        debug!("segment relay finished after {} bytes", total);
                        producer_relay.finish();
                        break;
                    }
                    Err(e) => {
                        error!("segment relay failed after {} bytes: {}", total, e);
                        producer_relay.fail(e);
                        break;
                    }
                }
            }
        });

        RelayHandle { relay, producer }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn buffered_chunks_come_out_in_order() {
        let relay = ChunkRelay::new();
        relay.deliver(Bytes::from_static(b"a"));
        relay.deliver(Bytes::from_static(b"b"));
        relay.finish();

        assert_eq!(relay.read_next_chunk().await, Ok(Some(Bytes::from_static(b"a"))));
        assert_eq!(relay.read_next_chunk().await, Ok(Some(Bytes::from_static(b"b"))));
        assert_eq!(relay.read_next_chunk().await, Ok(None));
        assert_eq!(relay.read_next_chunk().await, Ok(None));
    }

    #[tokio::test]
    async fn parked_read_is_woken_by_delivery() {
        let relay = ChunkRelay::new();
        let reader = relay.clone();
        let read = tokio::spawn(async move { reader.read_next_chunk().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        relay.deliver(Bytes::from_static(b"late"));

        assert_eq!(read.await.unwrap(), Ok(Some(Bytes::from_static(b"late"))));
    }

    #[tokio::test]
    async fn second_pending_read_is_rejected() {
        let relay = ChunkRelay::new();
        let reader = relay.clone();
        let first = tokio::spawn(async move { reader.read_next_chunk().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(relay.read_next_chunk().await, Err(RelayError::ReadPending));

        relay.fail("reset");
        assert_eq!(
            first.await.unwrap(),
            Err(RelayError::Upstream("reset".to_string()))
        );
        assert_eq!(
            relay.read_next_chunk().await,
            Err(RelayError::Upstream("reset".to_string()))
        );
    }

    #[tokio::test]
    async fn deliveries_after_completion_are_ignored() {
        let relay = ChunkRelay::new();
        relay.finish();
        relay.deliver(Bytes::from_static(b"x"));

        assert_eq!(relay.read_next_chunk().await, Ok(None));
    }
}
