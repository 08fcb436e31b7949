pub mod endpoint;
pub mod filter;
pub mod route;
pub mod rule;

pub use endpoint::{Endpoint, EndpointKind, SourceFormat};
pub use route::{Route, RouteLevel, RouteTarget};
pub use rule::{Rule, RuleAction, RuleOutcome, SENTINEL_CLUSTER};
