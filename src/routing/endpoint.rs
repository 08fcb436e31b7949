use axum::http::StatusCode;

use crate::config;
use crate::routing::route::{Route, RouteTarget};
use crate::params::Params;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Iql,
    Ilp,
    Prw,
}

impl SourceFormat {
    fn from_str(s: &str) -> SourceFormat {
        match s.to_ascii_lowercase().as_str() {
            "ilp" => SourceFormat::Ilp,
            "prw" | "prometheus" => SourceFormat::Prw,
            _ => SourceFormat::Iql,
        }
    }
}

/// An ordered list of URIs this endpoint answers for, plus the ordered route
/// list evaluated against every request whose path matches.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub uris: Vec<String>,
    pub kind: EndpointKind,
    pub source_format: SourceFormat,
    routes: Vec<Route>,
}

impl Endpoint {
    pub fn from_config(cfg: &config::Endpoint) -> Result<Endpoint, regex::Error> {
        let kind = if cfg.r#type.eq_ignore_ascii_case("write") {
            EndpointKind::Write
        } else {
            EndpointKind::Read
        };
        let routes = cfg
            .route
            .iter()
            .map(Route::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Endpoint {
            uris: cfg.uri.clone(),
            kind,
            source_format: SourceFormat::from_str(&cfg.source_format),
            routes,
        })
    }

    pub fn matches_path(&self, path: &str) -> bool {
        self.uris.iter().any(|u| u == path)
    }

    /// Default response when no route within this endpoint matched: 204 for
    /// writes (the data is silently accepted and dropped), 400 for reads.
    pub fn no_route_status(&self) -> StatusCode {
        match self.kind {
            EndpointKind::Write => StatusCode::NO_CONTENT,
            EndpointKind::Read => StatusCode::BAD_REQUEST,
        }
    }

    /// Evaluates routes in order; the first whose filters match and whose
    /// rules produce a routed target wins.
    pub fn process(&self, params: &mut Params) -> Option<RouteTarget> {
        for route in &self.routes {
            if !route.matches_filters(params) {
                continue;
            }
            if let Some(target) = route.process_rules(params) {
                return Some(target);
            }
        }
        None
    }
}
