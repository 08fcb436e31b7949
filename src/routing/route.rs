use std::collections::BTreeMap;

use crate::codec::Point;
use crate::config;
use crate::params::Params;
use crate::routing::filter::Filter;
use crate::routing::rule::{Rule, RuleOutcome};

/// Dispatch mode for a route's `route` rules: `Http` rewrites and replays the
/// raw HTTP request against the target cluster, `Data` re-encodes the
/// decoded point batch and writes that instead. Unrelated to how filters
/// combine (filters are always OR'd).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteLevel {
    Http,
    Data,
}

impl RouteLevel {
    fn from_str(s: &str) -> RouteLevel {
        if s.eq_ignore_ascii_case("data") {
            RouteLevel::Data
        } else {
            RouteLevel::Http
        }
    }
}

/// Where a matched route sends the request: a single cluster (dispatched
/// per `level`), or several buckets of decoded points each destined for
/// their own `db` on one cluster (`route_db_from_data`).
#[derive(Debug, Clone)]
pub enum RouteTarget {
    Cluster { name: String, level: RouteLevel },
    Bucketed {
        cluster: String,
        buckets: BTreeMap<String, Vec<Point>>,
    },
}

/// An ordered group of filters (always OR-combined) gating an ordered list
/// of rules, applied sequentially until a `route` target is produced or a
/// `break` rule stops processing.
#[derive(Debug, Clone)]
pub struct Route {
    pub name: String,
    level: RouteLevel,
    filters: Vec<Filter>,
    rules: Vec<Rule>,
}

impl Route {
    pub fn from_config(cfg: &config::Route) -> Result<Route, regex::Error> {
        let filters = cfg
            .filter
            .iter()
            .map(Filter::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        let rules = cfg
            .rule
            .iter()
            .map(Rule::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Route {
            name: cfg.name.clone(),
            level: RouteLevel::from_str(&cfg.level),
            filters,
            rules,
        })
    }

    pub fn level(&self) -> RouteLevel {
        self.level
    }

    pub fn matches_filters(&self, params: &Params) -> bool {
        if self.filters.is_empty() {
            return true;
        }
        self.filters.iter().any(|f| f.matches(params))
    }

    /// Applies rules in order; returns the first routed target, or `None` if
    /// no rule routed (but filters matched and rules may still have mutated
    /// `params` in place via rename/drop actions).
    pub fn process_rules(&self, params: &mut Params) -> Option<RouteTarget> {
        for rule in &self.rules {
            match rule.apply(params) {
                RuleOutcome::RouteTo(cluster) => {
                    return Some(RouteTarget::Cluster {
                        name: cluster,
                        level: self.level,
                    })
                }
                RuleOutcome::RouteBucketed { cluster, buckets } => {
                    return Some(RouteTarget::Bucketed { cluster, buckets })
                }
                RuleOutcome::Break => return None,
                RuleOutcome::Continue => continue,
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg_route(level: &str) -> config::Route {
        config::Route {
            name: "r".into(),
            level: level.into(),
            filter: vec![
                config::Filter {
                    name: "f1".into(),
                    action: "pass".into(),
                    key: "db".into(),
                    match_expr: "^prod$".into(),
                },
                config::Filter {
                    name: "f2".into(),
                    action: "pass".into(),
                    key: "env".into(),
                    match_expr: "^prod$".into(),
                },
            ],
            rule: vec![],
        }
    }

    #[test]
    fn filters_are_always_or_combined() {
        let route = Route::from_config(&cfg_route("http")).unwrap();
        let mut p = Params::new();
        p.header.insert("db".into(), "prod".into());
        assert!(route.matches_filters(&p));
        let p2 = Params::new();
        assert!(!route.matches_filters(&p2));
    }

    #[test]
    fn no_filters_always_matches() {
        let route = Route::from_config(&config::Route {
            name: "r".into(),
            level: "http".into(),
            filter: vec![],
            rule: vec![],
        })
        .unwrap();
        assert!(route.matches_filters(&Params::new()));
    }

    #[test]
    fn level_defaults_to_http_and_parses_data() {
        let http_route = Route::from_config(&cfg_route("http")).unwrap();
        assert_eq!(http_route.level(), RouteLevel::Http);
        let data_route = Route::from_config(&cfg_route("data")).unwrap();
        assert_eq!(data_route.level(), RouteLevel::Data);
        let garbage_route = Route::from_config(&cfg_route("bogus")).unwrap();
        assert_eq!(garbage_route.level(), RouteLevel::Http);
    }

    #[test]
    fn process_rules_attaches_route_level_to_cluster_target() {
        let mut cfg = cfg_route("data");
        cfg.filter = vec![];
        cfg.rule = vec![config::Rule {
            name: "r".into(),
            action: "route".into(),
            key: Some("db".into()),
            key_aux: None,
            match_expr: None,
            value: None,
            value_on_unmatch: None,
            to_cluster: Some("prod-cluster".into()),
        }];
        let route = Route::from_config(&cfg).unwrap();
        let mut params = Params::new();
        params.header.insert("db".into(), "anything".into());
        match route.process_rules(&mut params) {
            Some(RouteTarget::Cluster { name, level }) => {
                assert_eq!(name, "prod-cluster");
                assert_eq!(level, RouteLevel::Data);
            }
            other => panic!("expected Cluster target, got {:?}", other),
        }
    }
}
