use std::collections::BTreeMap;

use regex::Regex;

use crate::codec::Point;
use crate::config;
use crate::params::Params;

pub const SENTINEL_CLUSTER: &str = "__sinc__";

#[derive(Debug, Clone)]
pub enum RuleAction {
    /// Route to `to_cluster` if `key` (header-then-query) matches;
    /// otherwise to `value_on_unmatch` if set.
    Route {
        key: String,
        pattern: Option<Regex>,
        to_cluster: String,
        value_on_unmatch: Option<String>,
    },
    /// Buckets the decoded point batch by a tag (or the measurement, for
    /// `key == "measurement"`): for each point, `pattern` is matched against
    /// that value and, on match, `value` (a regex replacement template, e.g.
    /// `"shard-$1"`) computes the bucket name; points that don't match fall
    /// into `value_on_unmatch`'s bucket, or are dropped if unset. Every
    /// bucket is written to `to_cluster` with `db` set to the bucket name.
    RouteDbFromData {
        key: String,
        pattern: Regex,
        value: String,
        value_on_unmatch: Option<String>,
        to_cluster: String,
    },
    /// Renames a tag or field key across every point in the batch.
    RenameData { from: String, to: String },
    /// Renames a header or query key in place.
    RenameHttp { from: String, to: String },
    /// Drops points whose named tag matches the pattern.
    DropData { tag: String, pattern: Regex },
    /// Stops processing further rules in this route.
    Break,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub action: RuleAction,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuleOutcome {
    Continue,
    Break,
    RouteTo(String),
    /// Emitted by `route_db_from_data`: one cluster, several per-bucket
    /// point groups each destined for its own `db`.
    RouteBucketed {
        cluster: String,
        buckets: BTreeMap<String, Vec<Point>>,
    },
}

impl Rule {
    pub fn from_config(cfg: &config::Rule) -> Result<Rule, regex::Error> {
        let action = match cfg.action.as_str() {
            "route" => RuleAction::Route {
                key: cfg.key.clone().unwrap_or_default(),
                pattern: cfg
                    .match_expr
                    .as_deref()
                    .map(Regex::new)
                    .transpose()?,
                to_cluster: cfg.to_cluster.clone().unwrap_or_default(),
                value_on_unmatch: cfg.value_on_unmatch.clone(),
            },
            "route_db_from_data" => RuleAction::RouteDbFromData {
                key: cfg.key.clone().unwrap_or_default(),
                pattern: Regex::new(cfg.match_expr.as_deref().unwrap_or(".*"))?,
                value: cfg.value.clone().unwrap_or_default(),
                value_on_unmatch: cfg.value_on_unmatch.clone(),
                to_cluster: cfg.to_cluster.clone().unwrap_or_default(),
            },
            "rename_data" => RuleAction::RenameData {
                from: cfg.key.clone().unwrap_or_default(),
                to: cfg.key_aux.clone().unwrap_or_default(),
            },
            "rename_http" => RuleAction::RenameHttp {
                from: cfg.key.clone().unwrap_or_default(),
                to: cfg.key_aux.clone().unwrap_or_default(),
            },
            "drop_data" => RuleAction::DropData {
                tag: cfg.key.clone().unwrap_or_default(),
                pattern: Regex::new(cfg.match_expr.as_deref().unwrap_or(".*"))?,
            },
            "break" => RuleAction::Break,
            other => {
                // Unknown actions are treated as no-ops that log and continue,
                // matching the original's tolerance for unrecognized config
                // rather than aborting the whole relay at parse time.
                tracing::warn!(action = other, "unknown rule action, ignoring");
                RuleAction::Break
            }
        };
        Ok(Rule {
            name: cfg.name.clone(),
            action,
        })
    }

    pub fn apply(&self, params: &mut Params) -> RuleOutcome {
        match &self.action {
            RuleAction::Route {
                key,
                pattern,
                to_cluster,
                value_on_unmatch,
            } => {
                let current = params
                    .header
                    .get(key)
                    .or_else(|| params.query.get(key))
                    .cloned();
                let matched = match (&current, pattern) {
                    (Some(v), Some(p)) => p.is_match(v),
                    (Some(_), None) => true,
                    (None, _) => false,
                };
                if matched {
                    RuleOutcome::RouteTo(to_cluster.clone())
                } else if let Some(fallback) = value_on_unmatch {
                    RuleOutcome::RouteTo(fallback.clone())
                } else {
                    RuleOutcome::Continue
                }
            }
            RuleAction::RouteDbFromData {
                key,
                pattern,
                value,
                value_on_unmatch,
                to_cluster,
            } => {
                let mut buckets: BTreeMap<String, Vec<Point>> = BTreeMap::new();
                for point in std::mem::take(&mut params.points) {
                    let candidate = if key == "measurement" {
                        Some(point.measurement.clone())
                    } else {
                        point.tags.get(key).cloned()
                    };
                    let bucket = match &candidate {
                        Some(v) if pattern.is_match(v) => {
                            Some(pattern.replace_all(v, value.as_str()).into_owned())
                        }
                        _ => value_on_unmatch.clone(),
                    };
                    if let Some(bucket) = bucket {
                        buckets.entry(bucket).or_default().push(point);
                    }
                    // else: no match and no fallback bucket, the point is dropped.
                }
                if buckets.is_empty() {
                    RuleOutcome::Continue
                } else {
                    RuleOutcome::RouteBucketed {
                        cluster: to_cluster.clone(),
                        buckets,
                    }
                }
            }
            RuleAction::RenameData { from, to } => {
                for point in &mut params.points {
                    if let Some(v) = point.tags.remove(from) {
                        point.tags.insert(to.clone(), v);
                    }
                    if let Some(v) = point.fields.remove(from) {
                        point.fields.insert(to.clone(), v);
                    }
                }
                RuleOutcome::Continue
            }
            RuleAction::RenameHttp { from, to } => {
                if let Some(v) = params.header.remove(from) {
                    params.header.insert(to.clone(), v);
                } else if let Some(v) = params.query.remove(from) {
                    params.query.insert(to.clone(), v);
                } else {
                    tracing::debug!(key = %from, "rename_http: key not present, no-op");
                }
                RuleOutcome::Continue
            }
            RuleAction::DropData { tag, pattern } => {
                let before = params.points.len();
                params.points.retain(|p| match p.tags.get(tag) {
                    Some(v) => !pattern.is_match(v),
                    None => true,
                });
                tracing::debug!(dropped = before - params.points.len(), "drop_data applied");
                RuleOutcome::Continue
            }
            RuleAction::Break => RuleOutcome::Break,
        }
    }
}
