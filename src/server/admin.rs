use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use serde_json::json;

use crate::server::ServerState;

const INFLUXDB_VERSION: &str = "1.8.0";
const HEADER_INFLUXDB_VERSION: &str = "X-InfluxDB-Version";
const HEADER_SRELAY_VERSION: &str = "X-Influx-SRelay-Version";

fn version_headers(mut resp: Response) -> Response {
    let headers = resp.headers_mut();
    headers.insert(HEADER_INFLUXDB_VERSION, HeaderValue::from_static(INFLUXDB_VERSION));
    headers.insert(
        HEADER_SRELAY_VERSION,
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    resp
}

/// Mimics InfluxDB's own `/ping`: returns the cluster's configured
/// `default_ping_response` status with version headers set, so clients that
/// health-check against `influxdb-smart-relay` see the same contract as a
/// direct InfluxDB connection.
pub async fn ping(State(state): State<Arc<ServerState>>, Path(clusterid): Path<String>) -> Response {
    with_cluster(&state, &clusterid, |cluster| {
        version_headers(cluster.ping_response().into_response())
    })
    .await
}

pub async fn health(State(state): State<Arc<ServerState>>, Path(clusterid): Path<String>) -> Response {
    let clusters = state.clusters.read().await;
    match clusters.get(&clusterid) {
        Some(cluster) => Json(cluster.health_check().await).into_response(),
        None => unknown_cluster(&clusterid),
    }
}

pub async fn status(State(state): State<Arc<ServerState>>, Path(clusterid): Path<String>) -> Response {
    with_cluster(&state, &clusterid, |cluster| {
        let statuses = cluster
            .handle_status()
            .into_iter()
            .map(|(name, stats)| {
                json!({
                    "backend": name,
                    "buffered_points": stats.buffered_points,
                    "buffered_bytes": stats.buffered_bytes,
                })
            })
            .collect::<Vec<_>>();
        Json(json!({ "cluster": cluster.name(), "backends": statuses })).into_response()
    })
    .await
}

/// Forwards the POSTed admin body (`application/x-www-form-urlencoded`, as
/// InfluxDB's own `/query` admin actions expect) straight through to the
/// cluster's query path.
pub async fn admin(State(state): State<Arc<ServerState>>, Path(clusterid): Path<String>, body: Bytes) -> Response {
    let clusters = state.clusters.read().await;
    let Some(cluster) = clusters.get(&clusterid) else {
        return unknown_cluster(&clusterid);
    };
    match cluster.write("/query", "application/x-www-form-urlencoded", body).await {
        Ok(resp) => resp.into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn admin_flush(State(state): State<Arc<ServerState>>, Path(clusterid): Path<String>) -> Response {
    with_cluster(&state, &clusterid, |cluster| {
        let stats = cluster.flush_all();
        Json(json!({
            "dropped_batches": stats.dropped_batches,
            "dropped_bytes": stats.dropped_bytes,
        }))
        .into_response()
    })
    .await
}

fn unknown_cluster(clusterid: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": format!("cluster {} not exist in config", clusterid) })),
    )
        .into_response()
}

/// Looks the trailing path segment up as a cluster name, returning an
/// explicit 400 JSON body when it's unknown rather than silently logging and
/// dropping the request.
async fn with_cluster<F>(state: &ServerState, clusterid: &str, f: F) -> Response
where
    F: FnOnce(&crate::cluster::Cluster) -> Response,
{
    let clusters = state.clusters.read().await;
    match clusters.get(clusterid) {
        Some(cluster) => f(cluster),
        None => unknown_cluster(clusterid),
    }
}
