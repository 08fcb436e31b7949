use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::error::{RelayError, RelayResult};

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default, rename = "influxdb")]
    pub influxdb: Vec<InfluxDbBackend>,
    #[serde(default, rename = "influxcluster")]
    pub influxcluster: Vec<InfluxCluster>,
    #[serde(default, rename = "http")]
    pub http: Vec<HttpConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InfluxDbBackend {
    pub name: String,
    pub location: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout: u64,
    #[serde(default)]
    pub buffer_size_mb: u64,
    #[serde(default = "default_batch_size_kb")]
    pub max_batch_kb: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_interval: u64,
    #[serde(default)]
    pub skip_tls_verification: bool,
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_batch_size_kb() -> u64 {
    512
}

fn default_max_delay_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct InfluxCluster {
    pub name: String,
    pub members: Vec<String>,
    #[serde(default = "default_cluster_type")]
    pub r#type: String,
    #[serde(default)]
    pub rate_limit: u64,
    #[serde(default)]
    pub burst_limit: u64,
    #[serde(default)]
    pub query_router_endpoint_api: Vec<String>,
    #[serde(default = "default_ping_response")]
    pub default_ping_response: u16,
    #[serde(default)]
    pub log_file: Option<String>,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default = "default_health_timeout_secs")]
    pub health_timeout: u64,
}

fn default_cluster_type() -> String {
    "single".to_string()
}

fn default_ping_response() -> u16 {
    204
}

fn default_health_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct Filter {
    pub name: String,
    pub action: String,
    pub key: String,
    #[serde(rename = "match")]
    pub match_expr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Rule {
    pub name: String,
    pub action: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub key_aux: Option<String>,
    #[serde(default, rename = "match")]
    pub match_expr: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub value_on_unmatch: Option<String>,
    #[serde(default)]
    pub to_cluster: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Route {
    pub name: String,
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub filter: Vec<Filter>,
    #[serde(default)]
    pub rule: Vec<Rule>,
}

fn default_level() -> String {
    "http".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Endpoint {
    pub uri: Vec<String>,
    pub r#type: String,
    pub source_format: String,
    #[serde(default)]
    pub route: Vec<Route>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub name: String,
    pub bind_addr: String,
    #[serde(default)]
    pub log_file: Option<String>,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub rate_limit: u64,
    #[serde(default)]
    pub burst_limit: u64,
    #[serde(default)]
    pub endpoint: Vec<Endpoint>,
    #[serde(default)]
    pub ssl_combined_pem: Option<String>,
    #[serde(default)]
    pub default_retention_policy: Option<String>,
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> RelayResult<Config> {
        let raw = std::fs::read_to_string(path)?;
        let cfg: Config =
            toml::from_str(&raw).map_err(|e| RelayError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn get_influx_cluster(&self, name: &str) -> Option<&InfluxCluster> {
        self.influxcluster.iter().find(|c| c.name == name)
    }

    pub fn get_influx_db_backend(&self, name: &str) -> Option<&InfluxDbBackend> {
        self.influxdb.iter().find(|b| b.name == name)
    }

    pub fn validate(&self) -> RelayResult<()> {
        let mut seen = HashSet::new();
        for cluster in &self.influxcluster {
            if !seen.insert(cluster.name.clone()) {
                return Err(RelayError::DuplicateCluster(cluster.name.clone()));
            }
            for member in &cluster.members {
                if self.get_influx_db_backend(member).is_none() {
                    return Err(RelayError::Config(format!(
                        "cluster {} references unknown backend {}",
                        cluster.name, member
                    )));
                }
            }
        }

        let mut seen_http = HashSet::new();
        for http in &self.http {
            if !seen_http.insert(http.name.clone()) {
                return Err(RelayError::DuplicateRelay(http.name.clone()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_duplicate_cluster_names() {
        let cfg = Config {
            influxdb: vec![InfluxDbBackend {
                name: "a".into(),
                location: "http://a".into(),
                timeout: 10,
                buffer_size_mb: 0,
                max_batch_kb: 512,
                max_delay_interval: 10,
                skip_tls_verification: false,
            }],
            influxcluster: vec![
                InfluxCluster {
                    name: "dup".into(),
                    members: vec!["a".into()],
                    r#type: "single".into(),
                    rate_limit: 0,
                    burst_limit: 0,
                    query_router_endpoint_api: vec![],
                    default_ping_response: 204,
                    log_file: None,
                    log_level: None,
                    health_timeout: 5,
                },
                InfluxCluster {
                    name: "dup".into(),
                    members: vec!["a".into()],
                    r#type: "single".into(),
                    rate_limit: 0,
                    burst_limit: 0,
                    query_router_endpoint_api: vec![],
                    default_ping_response: 204,
                    log_file: None,
                    log_level: None,
                    health_timeout: 5,
                },
            ],
            http: vec![],
        };
        assert!(matches!(cfg.validate(), Err(RelayError::DuplicateCluster(_))));
    }
}
