use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::backend::response::ResponseData;
use crate::config::InfluxDbBackend;
use crate::error::RelayResult;

const USER_AGENT: &str = "influxdb-smart-relay";

/// A single upstream time-series backend reachable over HTTP. `RetryBuffer`
/// wraps any `Poster` so the cluster fan-out code never has to know whether
/// writes are going straight out or through a buffer.
#[async_trait]
pub trait Poster: Send + Sync {
    async fn post(&self, path: &str, content_type: &str, body: Bytes) -> RelayResult<ResponseData>;
    async fn query(&self, path_and_query: &str) -> RelayResult<ResponseData>;
    fn stats(&self) -> PosterStats;
    fn name(&self) -> &str;
    fn location(&self) -> &str;

    /// Drops any buffered-but-unsent data and reports how much was dropped.
    /// Posters with no buffer (a bare `HttpPoster`) have nothing to flush.
    fn flush(&self) -> FlushStats {
        FlushStats::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PosterStats {
    pub buffered_points: u64,
    pub buffered_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FlushStats {
    pub dropped_batches: usize,
    pub dropped_bytes: u64,
}

pub struct HttpPoster {
    name: String,
    location: String,
    client: reqwest::Client,
}

impl HttpPoster {
    pub fn from_config(cfg: &InfluxDbBackend) -> RelayResult<HttpPoster> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout))
            .danger_accept_invalid_certs(cfg.skip_tls_verification)
            .build()?;
        Ok(HttpPoster {
            name: cfg.name.clone(),
            location: cfg.location.clone(),
            client,
        })
    }
}

#[async_trait]
impl Poster for HttpPoster {
    async fn post(&self, path: &str, content_type: &str, body: Bytes) -> RelayResult<ResponseData> {
        let url = format!("{}{}", self.location, path);
        let resp = self
            .client
            .post(&url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await?;
        let status = resp.status();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = resp.bytes().await?;
        let mut response = ResponseData::new(self.name.clone(), String::new(), self.location.clone());
        response.status = status;
        response.content_type = content_type;
        response.body = body;
        Ok(response)
    }

    async fn query(&self, path_and_query: &str) -> RelayResult<ResponseData> {
        let url = format!("{}{}", self.location, path_and_query);
        let resp = self
            .client
            .get(&url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .send()
            .await?;
        let status = resp.status();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = resp.bytes().await?;
        let mut response = ResponseData::new(self.name.clone(), String::new(), self.location.clone());
        response.status = status;
        response.content_type = content_type;
        response.body = body;
        Ok(response)
    }

    fn stats(&self) -> PosterStats {
        PosterStats::default()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn location(&self) -> &str {
        &self.location
    }
}
