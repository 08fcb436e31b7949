use std::collections::HashMap;
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{watch, RwLock};

use crate::cluster::Cluster;
use crate::config::Config;
use crate::error::{RelayError, RelayResult};
use crate::server::Server;

/// Owns the live cluster and server registries and drives the process
/// lifecycle. Replaces the original's package-level mutable globals
/// (`relay.clusters`) with an explicit value the caller constructs and owns.
pub struct RelayService {
    clusters: Arc<RwLock<HashMap<String, Arc<Cluster>>>>,
    servers: Vec<Arc<Server>>,
    shutdown_tx: watch::Sender<bool>,
}

impl RelayService {
    pub fn new(config: &Config) -> RelayResult<RelayService> {
        let mut cluster_map = HashMap::new();
        for cluster_cfg in &config.influxcluster {
            if cluster_map.contains_key(&cluster_cfg.name) {
                return Err(RelayError::DuplicateCluster(cluster_cfg.name.clone()));
            }
            let cluster = Cluster::from_config(cluster_cfg, &config.influxdb)?;
            cluster_map.insert(cluster_cfg.name.clone(), Arc::new(cluster));
        }
        let clusters = Arc::new(RwLock::new(cluster_map));

        let mut servers = Vec::new();
        let mut seen_names = std::collections::HashSet::new();
        for http_cfg in &config.http {
            if !seen_names.insert(http_cfg.name.clone()) {
                return Err(RelayError::DuplicateRelay(http_cfg.name.clone()));
            }
            servers.push(Arc::new(Server::from_config(http_cfg, clusters.clone())?));
        }

        let (shutdown_tx, _) = watch::channel(false);
        Ok(RelayService {
            clusters,
            servers,
            shutdown_tx,
        })
    }

    /// Runs every configured server concurrently; returns the first error
    /// encountered, matching the original's wait-for-all-then-return-first.
    pub async fn run(&self) -> RelayResult<()> {
        let mut handles = Vec::new();
        for server in &self.servers {
            let server = server.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move { server.run(shutdown_rx).await }));
        }

        let mut first_err = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(RelayError::Internal(e.to_string()));
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Tells every server to stop accepting new connections and drain
    /// in-flight ones. Each server enforces its own grace period; callers
    /// that need a hard ceiling should bound their await of `run()`
    /// themselves (the process entry point does, ahead of a SIGHUP reload).
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn cluster_count(&self) -> usize {
        self.servers.len()
    }
}

/// Runs until SIGTERM/SIGINT/SIGQUIT for a clean exit, or SIGHUP to signal a
/// reload (the caller is expected to rebuild the service from a freshly
/// loaded `Config` and call this again).
pub async fn wait_for_exit_or_reload() -> RelayResult<ReloadOrExit> {
    let mut sigterm = signal(SignalKind::terminate()).map_err(RelayError::Io)?;
    let mut sigint = signal(SignalKind::interrupt()).map_err(RelayError::Io)?;
    let mut sigquit = signal(SignalKind::quit()).map_err(RelayError::Io)?;
    let mut sighup = signal(SignalKind::hangup()).map_err(RelayError::Io)?;

    tokio::select! {
        _ = sigterm.recv() => Ok(ReloadOrExit::Exit),
        _ = sigint.recv() => Ok(ReloadOrExit::Exit),
        _ = sigquit.recv() => Ok(ReloadOrExit::Exit),
        _ = sighup.recv() => Ok(ReloadOrExit::Reload),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOrExit {
    Reload,
    Exit,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HttpConfig, InfluxCluster, InfluxDbBackend};

    fn backend(name: &str) -> InfluxDbBackend {
        InfluxDbBackend {
            name: name.into(),
            location: "http://127.0.0.1:9999".into(),
            timeout: 1,
            buffer_size_mb: 0,
            max_batch_kb: 512,
            max_delay_interval: 10,
            skip_tls_verification: false,
        }
    }

    fn cluster(name: &str, members: Vec<&str>) -> InfluxCluster {
        InfluxCluster {
            name: name.into(),
            members: members.into_iter().map(String::from).collect(),
            r#type: "single".into(),
            rate_limit: 0,
            burst_limit: 0,
            query_router_endpoint_api: vec![],
            default_ping_response: 204,
            log_file: None,
            log_level: None,
            health_timeout: 5,
        }
    }

    #[test]
    fn rejects_duplicate_cluster_names_at_construction() {
        let config = Config {
            influxdb: vec![backend("a")],
            influxcluster: vec![cluster("dup", vec!["a"]), cluster("dup", vec!["a"])],
            http: vec![],
        };
        assert!(matches!(
            RelayService::new(&config),
            Err(RelayError::DuplicateCluster(_))
        ));
    }

    #[test]
    fn rejects_duplicate_relay_names_at_construction() {
        let config = Config {
            influxdb: vec![backend("a")],
            influxcluster: vec![cluster("c1", vec!["a"])],
            http: vec![
                HttpConfig {
                    name: "dup".into(),
                    bind_addr: "127.0.0.1:8080".into(),
                    log_file: None,
                    log_level: None,
                    rate_limit: 0,
                    burst_limit: 0,
                    endpoint: vec![],
                    ssl_combined_pem: None,
                    default_retention_policy: None,
                },
                HttpConfig {
                    name: "dup".into(),
                    bind_addr: "127.0.0.1:8081".into(),
                    log_file: None,
                    log_level: None,
                    rate_limit: 0,
                    burst_limit: 0,
                    endpoint: vec![],
                    ssl_combined_pem: None,
                    default_retention_policy: None,
                },
            ],
        };
        assert!(matches!(
            RelayService::new(&config),
            Err(RelayError::DuplicateRelay(_))
        ));
    }
}
