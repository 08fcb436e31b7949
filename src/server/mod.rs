pub mod admin;
pub mod middleware;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderValue, Method, Request as HttpRequest, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware as axum_middleware, Router};
use bytes::Bytes;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as HyperBuilder;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Inbound request timeout. The config schema carries no equivalent field
/// (backend timeouts are set per `InfluxDbBackend` instead), so this guards
/// against a handler that never returns rather than modeling a tunable.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a server waits for in-flight connections to finish once asked
/// to shut down (reload or process exit) before aborting them outright.
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(25);

use crate::backend::response::reduce_responses;
use crate::cluster::{Cluster, RateLimiter};
use crate::codec::{line_protocol, prometheus, Precision};
use crate::config::HttpConfig;
use crate::context::RequestContext;
use crate::error::{RelayError, RelayResult};
use crate::params::Params;
use crate::routing::{Endpoint, EndpointKind, RouteLevel, RouteTarget, SourceFormat};

pub struct ServerState {
    pub name: String,
    pub clusters: Arc<RwLock<HashMap<String, Arc<Cluster>>>>,
    pub endpoints: Vec<Endpoint>,
    pub rate_limiter: Option<RateLimiter>,
    pub default_rp: Option<String>,
}

pub struct Server {
    pub name: String,
    bind_addr: String,
    ssl_combined_pem: Option<String>,
    state: Arc<ServerState>,
}

impl Server {
    pub fn from_config(cfg: &HttpConfig, clusters: Arc<RwLock<HashMap<String, Arc<Cluster>>>>) -> RelayResult<Server> {
        let endpoints = cfg
            .endpoint
            .iter()
            .map(Endpoint::from_config)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| RelayError::Config(e.to_string()))?;

        let rate_limiter = if cfg.rate_limit > 0 {
            Some(RateLimiter::new(cfg.rate_limit, cfg.burst_limit))
        } else {
            None
        };

        Ok(Server {
            name: cfg.name.clone(),
            bind_addr: cfg.bind_addr.clone(),
            ssl_combined_pem: cfg.ssl_combined_pem.clone(),
            state: Arc::new(ServerState {
                name: cfg.name.clone(),
                clusters,
                endpoints,
                rate_limiter,
                default_rp: cfg.default_retention_policy.clone(),
            }),
        })
    }

    fn router(&self) -> Router {
        // Layers stack outermost-first, matching the teacher's own
        // `ServiceBuilder` composition: tracing and panic-catching wrap
        // everything, then the rate limiter rejects before the costlier
        // query-normalization/body-decode work ever runs.
        let middleware = ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CatchPanicLayer::new())
            .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
            .layer(axum_middleware::from_fn_with_state(
                self.state.clone(),
                middleware::rate_middleware,
            ))
            .layer(axum_middleware::from_fn(middleware::log_middleware))
            .layer(axum_middleware::from_fn_with_state(
                self.state.clone(),
                middleware::query_middleware,
            ))
            .layer(axum_middleware::from_fn(middleware::body_middleware));

        Router::new()
            .route("/ping/{clusterid}", get(admin::ping))
            .route("/status/{clusterid}", get(admin::status))
            .route("/health/{clusterid}", get(admin::health))
            .route("/admin/{clusterid}", post(admin::admin))
            .route("/admin/flush/{clusterid}", post(admin::admin_flush))
            .fallback(process_endpoint)
            .layer(middleware)
            .with_state(self.state.clone())
    }

    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> RelayResult<()> {
        match &self.ssl_combined_pem {
            Some(pem_path) => self.run_tls(pem_path, shutdown).await,
            None => self.run_plain(shutdown).await,
        }
    }

    async fn run_plain(&self, mut shutdown: watch::Receiver<bool>) -> RelayResult<()> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        tracing::info!(server = %self.name, addr = %self.bind_addr, "listening");
        let make_service = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, make_service)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))
    }

    /// Accepts TLS connections by hand, rather than `axum::serve`, since
    /// axum has no built-in TLS listener. Each accepted stream is served
    /// through the same tower `Router` via `hyper-util`'s auto (HTTP/1 or
    /// HTTP/2) connection builder. `ConnectInfo` can't be injected by
    /// `into_make_service_with_connect_info` here (there's no `MakeService`
    /// in this path), so each connection's router clone carries its own
    /// peer address as an extension layer instead.
    async fn run_tls(&self, pem_path: &str, mut shutdown: watch::Receiver<bool>) -> RelayResult<()> {
        let acceptor = build_tls_acceptor(pem_path)?;
        let listener = TcpListener::bind(&self.bind_addr).await?;
        tracing::info!(server = %self.name, addr = %self.bind_addr, tls = true, "listening");

        let router = self.router();
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to accept TCP connection");
                            continue;
                        }
                    };
                    let acceptor = acceptor.clone();
                    let per_conn_router = router
                        .clone()
                        .layer(axum::extract::Extension(ConnectInfo(peer)));
                    let service = TowerToHyperService::new(per_conn_router);
                    connections.spawn(async move {
                        let tls_stream = match acceptor.accept(stream).await {
                            Ok(s) => s,
                            Err(e) => {
                                tracing::warn!(error = %e, peer = %peer, "TLS handshake failed");
                                return;
                            }
                        };
                        let io = TokioIo::new(tls_stream);
                        if let Err(e) = HyperBuilder::new(TokioExecutor::new())
                            .serve_connection(io, service)
                            .await
                        {
                            tracing::warn!(error = %e, peer = %peer, "connection error");
                        }
                    });
                }
            }
        }

        tracing::info!(server = %self.name, "shutting down, draining in-flight connections");
        let drain = async {
            while connections.join_next().await.is_some() {}
        };
        if tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, drain).await.is_err() {
            tracing::warn!(server = %self.name, "graceful shutdown deadline exceeded, aborting remaining connections");
            connections.abort_all();
        }
        Ok(())
    }
}

fn build_tls_acceptor(pem_path: &str) -> RelayResult<TlsAcceptor> {
    let pem_bytes = std::fs::read(pem_path)?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut pem_bytes.as_slice())
        .collect::<Result<_, _>>()
        .map_err(|e| RelayError::Config(format!("invalid certificate in {}: {}", pem_path, e)))?;
    let key = rustls_pemfile::private_key(&mut pem_bytes.as_slice())
        .map_err(|e| RelayError::Config(format!("invalid private key in {}: {}", pem_path, e)))?
        .ok_or_else(|| RelayError::Config(format!("no private key found in {}", pem_path)))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| RelayError::Config(format!("invalid TLS cert/key pair: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

async fn process_endpoint(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: HttpRequest<axum::body::Body>,
) -> Response {
    let path = request.uri().path().to_string();
    let query = request.uri().query().unwrap_or("").to_string();
    let headers = request.headers().clone();
    let method = request.method().clone();

    let Some(endpoint) = state.endpoints.iter().find(|e| e.matches_path(&path)) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    if endpoint.kind == EndpointKind::Write {
        match method {
            Method::POST => {}
            Method::OPTIONS => return StatusCode::NO_CONTENT.into_response(),
            _ => {
                let mut resp = RelayError::MethodNotAllowed.into_response();
                resp.headers_mut()
                    .insert(axum::http::header::ALLOW, HeaderValue::from_static("POST"));
                return resp;
            }
        }
    }

    let mut ctx = RequestContext::new();
    ctx.set_endpoint(&path);
    ctx.append_trace(&format!("endpoint:{}", path));

    let mut params = Params::new();
    for (k, v) in url_pairs(&query) {
        params.query.insert(k, v);
    }
    params.header = Params::extract_context_fields(&headers, &params.query, peer);

    let body = match axum::body::to_bytes(request.into_body(), 64 * 1024 * 1024).await {
        Ok(b) => b,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    ctx.set_request_size(body.len());

    if endpoint.kind == EndpointKind::Write {
        let decoded = match endpoint.source_format {
            SourceFormat::Ilp => {
                let text = String::from_utf8_lossy(&body);
                let precision = params
                    .query
                    .get("precision")
                    .map(|p| Precision::from_query_param(p))
                    .unwrap_or(Precision::Nanos);
                line_protocol::decode(&text, precision)
            }
            SourceFormat::Prw => prometheus::decode(&body),
            SourceFormat::Iql => Ok(Vec::new()),
        };
        let points = match decoded {
            Ok(p) => p,
            Err(e) => return e.into_response(),
        };
        ctx.set_request_points(points.len());
        params.points = points;
    }

    let target = endpoint.process(&mut params);

    let Some(target) = target else {
        return endpoint.no_route_status().into_response();
    };

    let clusters = state.clusters.read().await;

    match target {
        RouteTarget::Cluster { name, level } => {
            if name == crate::routing::SENTINEL_CLUSTER {
                return StatusCode::NO_CONTENT.into_response();
            }
            let Some(cluster) = clusters.get(&name) else {
                return RelayError::UnknownCluster(name).into_response();
            };

            let result = if endpoint.kind == EndpointKind::Write {
                let body_out = match level {
                    RouteLevel::Data => match endpoint.source_format {
                        SourceFormat::Ilp => Bytes::from(line_protocol::encode(&params.points)),
                        _ => body.clone(),
                    },
                    RouteLevel::Http => body.clone(),
                };
                let write_path = params.remap_request(&path);
                cluster.write(&write_path, "application/octet-stream", body_out).await
            } else {
                let read_path = params.remap_request(&path);
                cluster.query(&read_path).await
            };

            match result {
                Ok(resp) => {
                    ctx.mark_served(resp.status.as_u16(), resp.body.len());
                    resp.into_response()
                }
                Err(e) => e.into_response(),
            }
        }
        RouteTarget::Bucketed { cluster: cluster_name, buckets } => {
            let Some(cluster) = clusters.get(&cluster_name) else {
                return RelayError::UnknownCluster(cluster_name).into_response();
            };

            let writes = buckets.into_iter().map(|(bucket_name, bucket_points)| {
                let cluster = cluster.clone();
                let mut bucket_params = params.clone_selected();
                bucket_params.points = bucket_points;
                bucket_params.set_db(&bucket_name);
                let write_path = bucket_params.remap_request(&path);
                async move {
                    let body_out = Bytes::from(line_protocol::encode(&bucket_params.points));
                    cluster.write(&write_path, "application/octet-stream", body_out).await
                }
            });

            let results = futures::future::join_all(writes).await;
            let responses: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok().cloned()).collect();
            if responses.is_empty() {
                return match results.into_iter().next() {
                    Some(Err(e)) => e.into_response(),
                    _ => StatusCode::NO_CONTENT.into_response(),
                };
            }

            match reduce_responses(&responses) {
                Some(resp) => {
                    ctx.mark_served(resp.status.as_u16(), resp.body.len());
                    resp.into_response()
                }
                None => StatusCode::NO_CONTENT.into_response(),
            }
        }
    }
}

fn url_pairs(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|s| !s.is_empty())
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
