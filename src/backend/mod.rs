pub mod poster;
pub mod response;
pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::config::InfluxDbBackend;
use crate::error::RelayResult;
use poster::{FlushStats, HttpPoster, Poster, PosterStats};
use response::ResponseData;
use retry::RetryBuffer;

/// A configured upstream backend: its poster (possibly retry-buffered) plus
/// the metadata cluster fan-out needs (name, admin flag).
pub struct DbBackend {
    name: String,
    poster: Arc<dyn Poster>,
}

impl DbBackend {
    pub fn from_config(cfg: &InfluxDbBackend) -> RelayResult<DbBackend> {
        let http_poster: Arc<dyn Poster> = Arc::new(HttpPoster::from_config(cfg)?);
        let poster: Arc<dyn Poster> = if cfg.buffer_size_mb > 0 {
            RetryBuffer::new(
                http_poster,
                cfg.buffer_size_mb,
                Duration::from_secs(cfg.max_delay_interval),
            )
        } else {
            http_poster
        };
        Ok(DbBackend {
            name: cfg.name.clone(),
            poster,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn location(&self) -> &str {
        self.poster.location()
    }

    pub async fn post(&self, path: &str, content_type: &str, body: Bytes) -> RelayResult<ResponseData> {
        self.poster.post(path, content_type, body).await
    }

    pub async fn query(&self, path_and_query: &str) -> RelayResult<ResponseData> {
        self.poster.query(path_and_query).await
    }

    pub fn stats(&self) -> PosterStats {
        self.poster.stats()
    }

    pub fn flush(&self) -> FlushStats {
        self.poster.flush()
    }
}

#[cfg(test)]
impl DbBackend {
    pub(crate) fn new_for_test(name: impl Into<String>, poster: Arc<dyn Poster>) -> DbBackend {
        DbBackend {
            name: name.into(),
            poster,
        }
    }
}
