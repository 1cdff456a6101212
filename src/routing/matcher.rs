//! Route matching logic.
//!
//! # Responsibilities
//! - Find the route table for the request's domain
//! - Structurally match the path against each template (segment count and
//!   literal equality), then filter by method
//! - Report 405 separately from "no route"
//!
//! # Design Decisions
//! - Registration order is priority: first structural + method match wins
//! - Host matching is case-insensitive, path matching is case-sensitive
//! - No regex, no converters: parameters are always text

use std::sync::Arc;

use axum::http::Method;

use crate::routing::domain::Domain;
use crate::routing::router::{DomainRegistry, Route, RouteTable};
use crate::routing::template::Params;

/// Outcome of matching one request.
#[derive(Debug, Clone)]
pub enum MatchResult {
    /// Dispatch locally.
    Local {
        domain: Domain,
        route: Route,
        params: Params,
    },
    /// At least one template matched the path but none accepts the method.
    MethodNotAllowed { allowed: Vec<Method> },
    /// Nothing matched, or the domain is not registered.
    NoMatch,
}

impl MatchResult {
    pub fn is_local(&self) -> bool {
        matches!(self, MatchResult::Local { .. })
    }
}

/// Matches requests against a frozen registry.
#[derive(Debug, Clone)]
pub struct RouteMatcher {
    registry: Arc<DomainRegistry>,
}

impl RouteMatcher {
    pub fn new(registry: Arc<DomainRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &DomainRegistry {
        &self.registry
    }

    pub fn match_request(&self, domain: &Domain, method: &Method, path: &str) -> MatchResult {
        match self.registry.lookup(domain) {
            Some(table) => match_table(domain, table, method, path),
            None => MatchResult::NoMatch,
        }
    }
}

/// Match against a single domain's table.
pub fn match_table(domain: &Domain, table: &RouteTable, method: &Method, path: &str) -> MatchResult {
    let mut allowed: Vec<Method> = Vec::new();

    for route in table.routes() {
        let Some(params) = route.template().matches(path) else {
            continue;
        };
        if route.accepts(method) {
            return MatchResult::Local {
                domain: domain.clone(),
                route: route.clone(),
                params,
            };
        }
        for m in route.methods() {
            if !allowed.contains(m) {
                allowed.push(m.clone());
            }
        }
    }

    if allowed.is_empty() {
        MatchResult::NoMatch
    } else {
        MatchResult::MethodNotAllowed { allowed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::handler::{HandlerResult, Reply};
    use crate::http::request::IncomingRequest;

    async fn noop(_req: IncomingRequest, _params: Params) -> HandlerResult {
        Ok(Reply::text(""))
    }

    fn shop() -> Domain {
        Domain::parse("shop.local").unwrap()
    }

    fn matcher() -> (RouteMatcher, Vec<crate::routing::RouteHandle>) {
        let mut table = RouteTable::new();
        let item = table.get("/item/<id>", noop).unwrap();
        let new_item = table.get("/item/new", noop).unwrap();
        let order = table.post("/order/<id>/<line>", noop).unwrap();
        let mut registry = DomainRegistry::new();
        registry.register(shop(), table);
        (RouteMatcher::new(Arc::new(registry)), vec![item, new_item, order])
    }

    #[test]
    fn matches_and_extracts() {
        let (m, handles) = matcher();
        match m.match_request(&shop(), &Method::GET, "/item/42") {
            MatchResult::Local { route, params, domain } => {
                assert_eq!(route.handle(), handles[0]);
                assert_eq!(params.get("id"), Some("42"));
                assert_eq!(domain, shop());
            }
            other => panic!("expected local match, got {:?}", other),
        }
    }

    #[test]
    fn registration_order_is_priority() {
        let (m, handles) = matcher();
        // "/item/new" also fits "/item/<id>", which was registered first
        match m.match_request(&shop(), &Method::GET, "/item/new") {
            MatchResult::Local { route, params, .. } => {
                assert_eq!(route.handle(), handles[0]);
                assert_eq!(params.get("id"), Some("new"));
            }
            other => panic!("expected local match, got {:?}", other),
        }
    }

    #[test]
    fn extra_segments_do_not_match() {
        let (m, _) = matcher();
        assert!(matches!(
            m.match_request(&shop(), &Method::GET, "/item/42/extra"),
            MatchResult::NoMatch
        ));
    }

    #[test]
    fn wrong_method_is_405() {
        let (m, _) = matcher();
        match m.match_request(&shop(), &Method::POST, "/item/42") {
            MatchResult::MethodNotAllowed { allowed } => {
                assert_eq!(allowed, vec![Method::GET, Method::HEAD]);
            }
            other => panic!("expected 405, got {:?}", other),
        }
    }

    #[test]
    fn multiple_params() {
        let (m, handles) = matcher();
        match m.match_request(&shop(), &Method::POST, "/order/7/3") {
            MatchResult::Local { route, params, .. } => {
                assert_eq!(route.handle(), handles[2]);
                assert_eq!(params.get("id"), Some("7"));
                assert_eq!(params.get("line"), Some("3"));
            }
            other => panic!("expected local match, got {:?}", other),
        }
    }

    #[test]
    fn unregistered_domain_is_no_match() {
        let (m, _) = matcher();
        let other = Domain::parse("example.com").unwrap();
        assert!(!m.match_request(&other, &Method::GET, "/item/42").is_local());
        assert!(matches!(
            m.match_request(&other, &Method::GET, "/item/42"),
            MatchResult::NoMatch
        ));
    }

    #[test]
    fn head_is_served_by_get_routes() {
        let (m, _) = matcher();
        assert!(m.match_request(&shop(), &Method::HEAD, "/item/1").is_local());
    }
}
