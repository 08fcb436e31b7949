use regex::Regex;

use crate::config;
use crate::params::Params;

/// A single header-or-query match test. Looks the key up in the header map
/// first, falling back to the query map, matching the Go original's
/// header-then-query lookup order in `RouteFilter.Match`.
#[derive(Debug, Clone)]
pub struct Filter {
    pub name: String,
    pub key: String,
    pattern: Regex,
}

impl Filter {
    pub fn from_config(cfg: &config::Filter) -> Result<Filter, regex::Error> {
        Ok(Filter {
            name: cfg.name.clone(),
            key: cfg.key.clone(),
            pattern: Regex::new(&cfg.match_expr)?,
        })
    }

    pub fn matches(&self, params: &Params) -> bool {
        let value = params
            .header
            .get(&self.key)
            .or_else(|| params.query.get(&self.key));
        match value {
            Some(v) => self.pattern.is_match(v),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(key: &str, expr: &str) -> Filter {
        Filter::from_config(&config::Filter {
            name: "f".into(),
            action: "pass".into(),
            key: key.into(),
            match_expr: expr.into(),
        })
        .unwrap()
    }

    #[test]
    fn matches_header_before_query() {
        let f = filter("db", "^prod$");
        let mut p = Params::new();
        p.header.insert("db".into(), "prod".into());
        p.query.insert("db".into(), "staging".into());
        assert!(f.matches(&p));
    }

    #[test]
    fn falls_back_to_query_when_header_absent() {
        let f = filter("db", "^prod$");
        let mut p = Params::new();
        p.query.insert("db".into(), "prod".into());
        assert!(f.matches(&p));
    }

    #[test]
    fn no_match_when_key_absent_anywhere() {
        let f = filter("db", "^prod$");
        let p = Params::new();
        assert!(!f.matches(&p));
    }
}
