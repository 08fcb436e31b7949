use smart_relay::config;
use smart_relay::params::Params;
use smart_relay::routing::{Endpoint, RouteTarget};

fn write_endpoint_with_db_routing() -> Endpoint {
    Endpoint::from_config(&config::Endpoint {
        uri: vec!["/write".to_string()],
        r#type: "write".to_string(),
        source_format: "ilp".to_string(),
        route: vec![
            config::Route {
                name: "prod".to_string(),
                level: "http".to_string(),
                filter: vec![config::Filter {
                    name: "prod-db".to_string(),
                    action: "pass".to_string(),
                    key: "db".to_string(),
                    match_expr: "^prod$".to_string(),
                }],
                rule: vec![config::Rule {
                    name: "route-prod".to_string(),
                    action: "route".to_string(),
                    key: Some("db".to_string()),
                    key_aux: None,
                    match_expr: None,
                    value: None,
                    value_on_unmatch: None,
                    to_cluster: Some("prod-cluster".to_string()),
                }],
            },
            config::Route {
                name: "fallback".to_string(),
                level: "http".to_string(),
                filter: vec![],
                rule: vec![config::Rule {
                    name: "route-default".to_string(),
                    action: "route".to_string(),
                    key: Some("__never__".to_string()),
                    key_aux: None,
                    match_expr: None,
                    value: None,
                    value_on_unmatch: Some("default-cluster".to_string()),
                    to_cluster: Some("default-cluster".to_string()),
                }],
            },
        ],
    })
    .expect("endpoint config should compile")
}

fn cluster_name(target: Option<RouteTarget>) -> Option<String> {
    match target {
        Some(RouteTarget::Cluster { name, .. }) => Some(name),
        _ => None,
    }
}

#[test]
fn request_with_matching_db_routes_to_named_cluster() {
    let endpoint = write_endpoint_with_db_routing();
    let mut params = Params::new();
    params.header.insert("db".to_string(), "prod".to_string());

    let target = endpoint.process(&mut params);
    assert_eq!(cluster_name(target).as_deref(), Some("prod-cluster"));
}

#[test]
fn request_without_matching_filter_falls_through_to_fallback_route() {
    let endpoint = write_endpoint_with_db_routing();
    let mut params = Params::new();
    params.header.insert("db".to_string(), "staging".to_string());

    let target = endpoint.process(&mut params);
    assert_eq!(cluster_name(target).as_deref(), Some("default-cluster"));
}

#[test]
fn unmatched_write_endpoint_falls_back_to_no_content_default() {
    use axum::http::StatusCode;
    let endpoint = Endpoint::from_config(&config::Endpoint {
        uri: vec!["/write".to_string()],
        r#type: "write".to_string(),
        source_format: "ilp".to_string(),
        route: vec![],
    })
    .unwrap();
    let mut params = Params::new();
    assert!(endpoint.process(&mut params).is_none());
    assert_eq!(endpoint.no_route_status(), StatusCode::NO_CONTENT);
}

#[test]
fn unmatched_read_endpoint_falls_back_to_bad_request_default() {
    use axum::http::StatusCode;
    let endpoint = Endpoint::from_config(&config::Endpoint {
        uri: vec!["/query".to_string()],
        r#type: "read".to_string(),
        source_format: "iql".to_string(),
        route: vec![],
    })
    .unwrap();
    assert_eq!(endpoint.no_route_status(), StatusCode::BAD_REQUEST);
}
