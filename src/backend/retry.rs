use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::backend::poster::{FlushStats, Poster, PosterStats};
use crate::backend::response::ResponseData;
use crate::error::{RelayError, RelayResult};

const INITIAL_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
struct Batch {
    path: String,
    content_type: String,
    body: Bytes,
}

impl Batch {
    fn size(&self) -> u64 {
        self.body.len() as u64
    }
}

struct QueueState {
    batches: VecDeque<Batch>,
    bytes: u64,
}

/// Wraps a `Poster`; on transient post failure, queues the batch instead of
/// dropping it and retries it from a dedicated drain task with exponential
/// back-off (500ms, doubling, clamped to `max_delay`, reset on success).
pub struct RetryBuffer {
    inner: Arc<dyn Poster>,
    state: Arc<Mutex<QueueState>>,
    capacity_bytes: u64,
    max_delay: Duration,
    notify: Arc<Notify>,
    buffered_points_hint: AtomicU64,
}

impl RetryBuffer {
    pub fn new(inner: Arc<dyn Poster>, capacity_mb: u64, max_delay: Duration) -> Arc<RetryBuffer> {
        Self::with_capacity_bytes(inner, capacity_mb * 1024 * 1024, max_delay)
    }

    fn with_capacity_bytes(inner: Arc<dyn Poster>, capacity_bytes: u64, max_delay: Duration) -> Arc<RetryBuffer> {
        let buffer = Arc::new(RetryBuffer {
            inner,
            state: Arc::new(Mutex::new(QueueState {
                batches: VecDeque::new(),
                bytes: 0,
            })),
            capacity_bytes,
            max_delay,
            notify: Arc::new(Notify::new()),
            buffered_points_hint: AtomicU64::new(0),
        });
        buffer.clone().spawn_drain_task();
        buffer
    }

    fn spawn_drain_task(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut delay = INITIAL_DELAY;
            loop {
                let next = {
                    let mut state = self.state.lock();
                    state.batches.pop_front()
                };
                let Some(batch) = next else {
                    self.notify.notified().await;
                    continue;
                };
                match self
                    .inner
                    .post(&batch.path, &batch.content_type, batch.body.clone())
                    .await
                {
                    Ok(resp) if resp.status.is_success() => {
                        delay = INITIAL_DELAY;
                        let mut state = self.state.lock();
                        state.bytes = state.bytes.saturating_sub(batch.size());
                    }
                    _ => {
                        {
                            let mut state = self.state.lock();
                            state.batches.push_front(batch);
                        }
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(self.max_delay);
                    }
                }
            }
        });
    }

    fn try_enqueue(&self, batch: Batch) -> RelayResult<()> {
        let mut state = self.state.lock();
        if state.bytes + batch.size() > self.capacity_bytes {
            return Err(RelayError::BufferFull);
        }
        state.bytes += batch.size();
        state.batches.push_back(batch);
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    pub fn queued_bytes(&self) -> u64 {
        self.state.lock().bytes
    }

    pub fn queued_batches(&self) -> usize {
        self.state.lock().batches.len()
    }

    fn accepted_response(&self) -> ResponseData {
        let mut accepted = ResponseData::new(self.inner.name(), String::new(), self.inner.location());
        accepted.status = axum::http::StatusCode::ACCEPTED;
        accepted
    }
}

#[async_trait]
impl Poster for RetryBuffer {
    async fn post(&self, path: &str, content_type: &str, body: Bytes) -> RelayResult<ResponseData> {
        match self.inner.post(path, content_type, body.clone()).await {
            // Transport failure or a 5xx from upstream: both are transient
            // from the relay's point of view, buffer and retry.
            Ok(resp) if resp.status.is_server_error() => {
                self.try_enqueue(Batch {
                    path: path.to_string(),
                    content_type: content_type.to_string(),
                    body,
                })?;
                Ok(self.accepted_response())
            }
            Ok(resp) => Ok(resp),
            Err(_) => {
                self.try_enqueue(Batch {
                    path: path.to_string(),
                    content_type: content_type.to_string(),
                    body,
                })?;
                Ok(self.accepted_response())
            }
        }
    }

    async fn query(&self, path_and_query: &str) -> RelayResult<ResponseData> {
        self.inner.query(path_and_query).await
    }

    fn stats(&self) -> PosterStats {
        let state = self.state.lock();
        PosterStats {
            buffered_points: self.buffered_points_hint.load(Ordering::Relaxed),
            buffered_bytes: state.bytes,
        }
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn location(&self) -> &str {
        self.inner.location()
    }

    fn flush(&self) -> FlushStats {
        let mut state = self.state.lock();
        let dropped_batches = state.batches.len();
        let dropped_bytes = state.bytes;
        state.batches.clear();
        state.bytes = 0;
        FlushStats {
            dropped_batches,
            dropped_bytes,
        }
    }
}

/// Computes the delay for the n-th retry attempt (0-indexed), doubling from
/// `INITIAL_DELAY` and clamped to `max_delay`. Exposed standalone so the
/// back-off math can be unit tested without spinning up the drain task.
pub fn delay_for_attempt(attempt: u32, max_delay: Duration) -> Duration {
    let doubled = INITIAL_DELAY.saturating_mul(1 << attempt.min(16));
    doubled.min(max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    struct AlwaysFails;

    #[async_trait]
    impl Poster for AlwaysFails {
        async fn post(&self, _path: &str, _content_type: &str, _body: Bytes) -> RelayResult<ResponseData> {
            Err(RelayError::Internal("backend down".to_string()))
        }
        async fn query(&self, _path_and_query: &str) -> RelayResult<ResponseData> {
            unimplemented!("not exercised by this test")
        }
        fn stats(&self) -> PosterStats {
            PosterStats::default()
        }
        fn name(&self) -> &str {
            "down"
        }
        fn location(&self) -> &str {
            "http://down"
        }
    }

    #[tokio::test]
    async fn first_write_is_buffered_as_202_then_buffer_full_is_503() {
        let body = Bytes::from_static(b"m v=1");
        let buffer = RetryBuffer::with_capacity_bytes(Arc::new(AlwaysFails), body.len() as u64, Duration::from_millis(1));

        let first = buffer.post("/write", "text/plain", body.clone()).await.unwrap();
        assert_eq!(first.status, StatusCode::ACCEPTED);

        let second = buffer.post("/write", "text/plain", body).await;
        assert!(matches!(second, Err(RelayError::BufferFull)));
        assert_eq!(RelayError::BufferFull.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn flush_drains_queue_and_reports_drop_count() {
        let body = Bytes::from_static(b"m v=1");
        let buffer = RetryBuffer::with_capacity_bytes(Arc::new(AlwaysFails), 1024, Duration::from_secs(60));
        buffer.post("/write", "text/plain", body.clone()).await.unwrap();

        let stats = buffer.flush();
        assert_eq!(stats.dropped_batches, 1);
        assert_eq!(stats.dropped_bytes, body.len() as u64);
        assert_eq!(buffer.queued_batches(), 0);
    }

    #[test]
    fn delay_doubles_each_attempt() {
        let max = Duration::from_secs(10);
        assert_eq!(delay_for_attempt(0, max), Duration::from_millis(500));
        assert_eq!(delay_for_attempt(1, max), Duration::from_millis(1000));
        assert_eq!(delay_for_attempt(2, max), Duration::from_millis(2000));
    }

    #[test]
    fn delay_clamps_to_max() {
        let max = Duration::from_secs(2);
        assert_eq!(delay_for_attempt(10, max), max);
    }
}
