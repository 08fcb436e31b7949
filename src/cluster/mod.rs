use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::backend::poster::FlushStats;
use crate::backend::response::{reduce_responses, ResponseData};
use crate::backend::DbBackend;
use crate::config::{InfluxCluster, InfluxDbBackend};
use crate::error::{RelayError, RelayResult};
use crate::routing::SENTINEL_CLUSTER;

/// Tagged dispatch strategy, replacing the original's per-instance function
/// fields (`WriteHTTP`/`WriteData`/`QueryHTTP` closures assigned in the
/// constructor) with a plain enum matched in each operation. `"lb"` is a
/// reserved, unimplemented cluster type and is rejected at validation rather
/// than silently mapped onto one of these two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterKind {
    Single,
    Ha,
}

impl ClusterKind {
    fn from_config_str(s: &str) -> Result<ClusterKind, String> {
        match s.to_ascii_lowercase().as_str() {
            "single" => Ok(ClusterKind::Single),
            "ha" => Ok(ClusterKind::Ha),
            "lb" => Err("cluster type \"lb\" is reserved and not implemented".to_string()),
            other => Err(format!("unknown cluster type: {}", other)),
        }
    }
}

struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_sec: f64, burst: f64) -> TokenBucket {
        TokenBucket {
            capacity: burst.max(1.0),
            tokens: burst.max(1.0),
            refill_rate: rate_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn allow(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Standalone rate limiter reused by the HTTP server's own rate middleware
/// (as opposed to the per-cluster limiter embedded in `Cluster`).
pub struct RateLimiter(Mutex<TokenBucket>);

impl RateLimiter {
    pub fn new(rate_per_sec: u64, burst: u64) -> RateLimiter {
        RateLimiter(Mutex::new(TokenBucket::new(
            rate_per_sec as f64,
            burst.max(rate_per_sec) as f64,
        )))
    }

    pub fn allow(&self) -> bool {
        self.0.lock().allow()
    }
}

pub struct Cluster {
    name: String,
    kind: ClusterKind,
    backends: Vec<Arc<DbBackend>>,
    rate_limiter: Option<Mutex<TokenBucket>>,
    query_router_endpoints: Vec<String>,
    health_timeout: Duration,
    default_ping_response: axum::http::StatusCode,
}

impl Cluster {
    pub fn from_config(
        cfg: &InfluxCluster,
        all_backends: &[InfluxDbBackend],
    ) -> RelayResult<Cluster> {
        if cfg.name == SENTINEL_CLUSTER {
            return Err(RelayError::Config(format!(
                "cluster name {} is reserved",
                SENTINEL_CLUSTER
            )));
        }
        let kind = ClusterKind::from_config_str(&cfg.r#type)
            .map_err(|e| RelayError::Config(format!("cluster {}: {}", cfg.name, e)))?;

        let mut backends = Vec::new();
        for member in &cfg.members {
            let backend_cfg = all_backends
                .iter()
                .find(|b| &b.name == member)
                .ok_or_else(|| {
                    RelayError::Config(format!("cluster {} references unknown backend {}", cfg.name, member))
                })?;
            backends.push(Arc::new(DbBackend::from_config(backend_cfg)?));
        }

        match kind {
            ClusterKind::Single if backends.len() != 1 => {
                return Err(RelayError::Config(format!(
                    "cluster {} of type single must have exactly 1 member, has {}",
                    cfg.name,
                    backends.len()
                )))
            }
            ClusterKind::Ha if backends.len() < 2 => {
                return Err(RelayError::Config(format!(
                    "cluster {} of type ha must have at least 2 members, has {}",
                    cfg.name,
                    backends.len()
                )))
            }
            _ => {}
        }

        let rate_limiter = if cfg.rate_limit > 0 {
            Some(Mutex::new(TokenBucket::new(
                cfg.rate_limit as f64,
                cfg.burst_limit.max(cfg.rate_limit) as f64,
            )))
        } else {
            None
        };

        let default_ping_response = axum::http::StatusCode::from_u16(cfg.default_ping_response)
            .unwrap_or(axum::http::StatusCode::NO_CONTENT);

        Ok(Cluster {
            name: cfg.name.clone(),
            kind,
            backends,
            rate_limiter,
            query_router_endpoints: cfg.query_router_endpoint_api.clone(),
            health_timeout: Duration::from_secs(cfg.health_timeout),
            default_ping_response,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ping_response(&self) -> axum::http::StatusCode {
        self.default_ping_response
    }

    fn check_rate_limit(&self) -> RelayResult<()> {
        match &self.rate_limiter {
            Some(bucket) if !bucket.lock().allow() => Err(RelayError::RateLimited),
            _ => Ok(()),
        }
    }

    /// Fans `body` out to every backend, synthesizing a `502` `ResponseData`
    /// for any backend that failed at the transport level so the returned
    /// vector always has exactly one entry per backend — callers that need
    /// to account for every member (testable property: an HA write produces
    /// exactly N responses) can rely on the length.
    pub async fn fan_out_write(&self, path: &str, content_type: &str, body: Bytes) -> Vec<ResponseData> {
        let futures = self.backends.iter().map(|b| {
            let body = body.clone();
            let name = b.name().to_string();
            async move { (name, b.post(path, content_type, body).await) }
        });
        join_all(futures)
            .await
            .into_iter()
            .map(|(name, result)| match result {
                Ok(resp) => resp,
                Err(e) => {
                    let mut synthetic = ResponseData::new(name, self.name.clone(), String::new());
                    synthetic.status = axum::http::StatusCode::BAD_GATEWAY;
                    synthetic.body = Bytes::from(e.to_string());
                    synthetic
                }
            })
            .collect()
    }

    /// Writes `body` to every member for `Ha` clusters, or just the first
    /// member for `Single`, then reduces the batch of responses to one.
    pub async fn write(&self, path: &str, content_type: &str, body: Bytes) -> RelayResult<ResponseData> {
        self.check_rate_limit()?;
        match self.kind {
            ClusterKind::Single => self.backends[0].post(path, content_type, body).await,
            ClusterKind::Ha => {
                let responses = self.fan_out_write(path, content_type, body).await;
                reduce_responses(&responses).ok_or(RelayError::Internal(
                    "all backends failed to respond".to_string(),
                ))
            }
        }
    }

    /// Drains every backend's retry buffer, reporting the aggregate drop.
    pub fn flush_all(&self) -> FlushStats {
        self.backends.iter().map(|b| b.flush()).fold(FlushStats::default(), |acc, s| FlushStats {
            dropped_batches: acc.dropped_batches + s.dropped_batches,
            dropped_bytes: acc.dropped_bytes + s.dropped_bytes,
        })
    }

    /// Probes every backend's `{location}/ping` concurrently within
    /// `health_timeout` and classifies the cluster as `healthy` (all
    /// backends answered), `critical` (none did), or `problem` (some did).
    pub async fn health_check(&self) -> Value {
        let client = reqwest::Client::new();
        let timeout = self.health_timeout;
        let checks = self.backends.iter().map(|b| {
            let client = client.clone();
            let name = b.name().to_string();
            let url = format!("{}/ping", b.location());
            async move {
                let ok = tokio::time::timeout(timeout, client.get(&url).send())
                    .await
                    .ok()
                    .and_then(|r| r.ok())
                    .map(|r| r.status().is_success())
                    .unwrap_or(false);
                (name, ok)
            }
        });

        let mut healthy = serde_json::Map::new();
        let mut problem = serde_json::Map::new();
        for (name, ok) in join_all(checks).await {
            if ok {
                healthy.insert(name, Value::Bool(true));
            } else {
                problem.insert(name, Value::Bool(true));
            }
        }

        let status = if problem.is_empty() {
            "healthy"
        } else if healthy.is_empty() {
            "critical"
        } else {
            "problem"
        };

        json!({ "status": status, "healthy": healthy, "problem": problem })
    }

    /// Selects a single backend to forward a query to, probing
    /// `query_router_endpoints` concurrently within `health_timeout` and
    /// taking the first name in their unioned response that also names a
    /// current member; falls back to the first configured backend when the
    /// union is empty or names nothing we have, matching the original's
    /// `backends[0]` fallback.
    async fn select_query_backend(&self) -> &Arc<DbBackend> {
        if self.query_router_endpoints.is_empty() {
            return &self.backends[0];
        }

        let probes = self.query_router_endpoints.iter().map(|url| {
            let url = url.clone();
            async move {
                let client = reqwest::Client::new();
                client.get(&url).send().await.ok()?.json::<Vec<String>>().await.ok()
            }
        });

        let probed = tokio::time::timeout(self.health_timeout, join_all(probes))
            .await
            .unwrap_or_default();

        let union: Vec<String> = probed.into_iter().flatten().flatten().collect();
        for candidate in &union {
            if let Some(backend) = self.backends.iter().find(|b| b.name() == candidate) {
                return backend;
            }
        }
        &self.backends[0]
    }

    pub async fn query(&self, path_and_query: &str) -> RelayResult<ResponseData> {
        self.check_rate_limit()?;
        let backend = self.select_query_backend().await;
        backend.query(path_and_query).await
    }

    pub fn handle_status(&self) -> Vec<(String, crate::backend::poster::PosterStats)> {
        self.backends
            .iter()
            .map(|b| (b.name().to_string(), b.stats()))
            .collect()
    }
}

#[cfg(test)]
impl Cluster {
    fn new_for_test(name: &str, kind: ClusterKind, backends: Vec<Arc<DbBackend>>) -> Cluster {
        Cluster {
            name: name.to_string(),
            kind,
            backends,
            rate_limiter: None,
            query_router_endpoints: vec![],
            health_timeout: Duration::from_secs(1),
            default_ping_response: axum::http::StatusCode::NO_CONTENT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::poster::{Poster, PosterStats};
    use async_trait::async_trait;

    struct MockPoster {
        name: String,
        ok: bool,
    }

    #[async_trait]
    impl Poster for MockPoster {
        async fn post(&self, _path: &str, _content_type: &str, _body: Bytes) -> RelayResult<ResponseData> {
            if self.ok {
                let mut r = ResponseData::new(self.name.clone(), String::new(), String::new());
                r.status = axum::http::StatusCode::NO_CONTENT;
                Ok(r)
            } else {
                Err(RelayError::Internal("backend unreachable".to_string()))
            }
        }
        async fn query(&self, _path_and_query: &str) -> RelayResult<ResponseData> {
            unimplemented!("not exercised by these tests")
        }
        fn stats(&self) -> PosterStats {
            PosterStats::default()
        }
        fn name(&self) -> &str {
            &self.name
        }
        fn location(&self) -> &str {
            ""
        }
    }

    fn mock_backend(name: &str, ok: bool) -> Arc<DbBackend> {
        Arc::new(DbBackend::new_for_test(
            name,
            Arc::new(MockPoster { name: name.to_string(), ok }),
        ))
    }

    #[tokio::test]
    async fn ha_fan_out_returns_one_response_per_backend_even_on_failure() {
        let cluster = Cluster::new_for_test(
            "c1",
            ClusterKind::Ha,
            vec![mock_backend("a", true), mock_backend("b", false)],
        );
        let responses = cluster.fan_out_write("/write", "text/plain", Bytes::new()).await;
        assert_eq!(responses.len(), 2);
        assert!(responses.iter().any(|r| r.status == axum::http::StatusCode::NO_CONTENT));
        assert!(responses.iter().any(|r| r.status == axum::http::StatusCode::BAD_GATEWAY));
    }

    #[tokio::test]
    async fn ha_write_succeeds_when_at_least_one_backend_answers() {
        let cluster = Cluster::new_for_test(
            "c1",
            ClusterKind::Ha,
            vec![mock_backend("a", true), mock_backend("b", false)],
        );
        let resp = cluster.write("/write", "text/plain", Bytes::new()).await.unwrap();
        assert_eq!(resp.status, axum::http::StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn write_is_rejected_once_rate_limit_is_exhausted() {
        let mut cluster = Cluster::new_for_test("c1", ClusterKind::Single, vec![mock_backend("a", true)]);
        cluster.rate_limiter = Some(Mutex::new(TokenBucket::new(0.0, 1.0)));

        let first = cluster.write("/write", "text/plain", Bytes::new()).await;
        assert!(first.is_ok());
        let second = cluster.write("/write", "text/plain", Bytes::new()).await;
        assert!(matches!(second, Err(RelayError::RateLimited)));
    }

    #[test]
    fn single_cluster_type_rejects_more_than_one_member() {
        let cfg = InfluxCluster {
            name: "c1".into(),
            members: vec!["a".into(), "b".into()],
            r#type: "single".into(),
            rate_limit: 0,
            burst_limit: 0,
            query_router_endpoint_api: vec![],
            default_ping_response: 204,
            log_file: None,
            log_level: None,
            health_timeout: 5,
        };
        let backends = vec![
            InfluxDbBackend {
                name: "a".into(),
                location: "http://a".into(),
                timeout: 10,
                buffer_size_mb: 0,
                max_batch_kb: 512,
                max_delay_interval: 10,
                skip_tls_verification: false,
            },
            InfluxDbBackend {
                name: "b".into(),
                location: "http://b".into(),
                timeout: 10,
                buffer_size_mb: 0,
                max_batch_kb: 512,
                max_delay_interval: 10,
                skip_tls_verification: false,
            },
        ];
        assert!(Cluster::from_config(&cfg, &backends).is_err());
    }

    #[test]
    fn ha_cluster_type_rejects_single_member() {
        let cfg = InfluxCluster {
            name: "c1".into(),
            members: vec!["a".into()],
            r#type: "ha".into(),
            rate_limit: 0,
            burst_limit: 0,
            query_router_endpoint_api: vec![],
            default_ping_response: 204,
            log_file: None,
            log_level: None,
            health_timeout: 5,
        };
        let backends = vec![InfluxDbBackend {
            name: "a".into(),
            location: "http://a".into(),
            timeout: 10,
            buffer_size_mb: 0,
            max_batch_kb: 512,
            max_delay_interval: 10,
            skip_tls_verification: false,
        }];
        assert!(Cluster::from_config(&cfg, &backends).is_err());
    }

    #[test]
    fn lb_cluster_type_is_rejected_outright() {
        let cfg = InfluxCluster {
            name: "c1".into(),
            members: vec!["a".into()],
            r#type: "lb".into(),
            rate_limit: 0,
            burst_limit: 0,
            query_router_endpoint_api: vec![],
            default_ping_response: 204,
            log_file: None,
            log_level: None,
            health_timeout: 5,
        };
        let backends = vec![InfluxDbBackend {
            name: "a".into(),
            location: "http://a".into(),
            timeout: 10,
            buffer_size_mb: 0,
            max_batch_kb: 512,
            max_delay_interval: 10,
            skip_tls_verification: false,
        }];
        assert!(Cluster::from_config(&cfg, &backends).is_err());
    }

    #[test]
    fn token_bucket_rejects_past_capacity() {
        let mut bucket = TokenBucket::new(0.0, 2.0);
        assert!(bucket.allow());
        assert!(bucket.allow());
        assert!(!bucket.allow());
    }

    #[test]
    fn sentinel_cluster_name_is_rejected() {
        let cfg = InfluxCluster {
            name: SENTINEL_CLUSTER.to_string(),
            members: vec!["a".into()],
            r#type: "single".into(),
            rate_limit: 0,
            burst_limit: 0,
            query_router_endpoint_api: vec![],
            default_ping_response: 204,
            log_file: None,
            log_level: None,
            health_timeout: 5,
        };
        let backends = vec![InfluxDbBackend {
            name: "a".into(),
            location: "http://a".into(),
            timeout: 10,
            buffer_size_mb: 0,
            max_batch_kb: 512,
            max_delay_interval: 10,
            skip_tls_verification: false,
        }];
        assert!(Cluster::from_config(&cfg, &backends).is_err());
    }
}
