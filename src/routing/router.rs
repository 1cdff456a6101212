//! Domain registry and per-domain route tables.
//!
//! # Responsibilities
//! - Map each registered domain to its ordered route table
//! - Keep route registration order, which is also match priority
//! - Resolve duplicate (shape, method) registrations: the last one wins
//!
//! # Design Decisions
//! - Populated by one writer before serving, shared read-only (`Arc`) while
//!   serving, so lookups take no locks
//! - O(1) domain lookup via HashMap, O(n) route scan per domain
//! - Re-registering a domain replaces its whole table

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use axum::http::Method;

use crate::http::handler::Handler;
use crate::routing::domain::Domain;
use crate::routing::template::{PathTemplate, TemplateError};

/// Opaque handle to a registered route, usable with [`RouteTable::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteHandle(u64);

/// One route: template, accepted methods and handler.
#[derive(Clone)]
pub struct Route {
    handle: RouteHandle,
    template: PathTemplate,
    methods: Vec<Method>,
    handler: Arc<dyn Handler>,
}

impl Route {
    pub fn handle(&self) -> RouteHandle {
        self.handle
    }

    pub fn template(&self) -> &PathTemplate {
        &self.template
    }

    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    pub fn accepts(&self, method: &Method) -> bool {
        self.methods.contains(method)
    }

    pub fn handler(&self) -> &dyn Handler {
        self.handler.as_ref()
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("handle", &self.handle)
            .field("template", &self.template.as_str())
            .field("methods", &self.methods)
            .finish_non_exhaustive()
    }
}

/// Ordered routes for a single domain.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
    next_handle: u64,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `template` and `methods`.
    ///
    /// An earlier route with the same template shape loses the overlapping
    /// methods (and is dropped once it has none left). GET implies HEAD.
    pub fn add<H: Handler>(
        &mut self,
        template: &str,
        methods: &[Method],
        handler: H,
    ) -> Result<RouteHandle, TemplateError> {
        let template = PathTemplate::parse(template)?;

        let mut accepted: Vec<Method> = Vec::with_capacity(methods.len() + 1);
        for method in methods {
            if !accepted.contains(method) {
                accepted.push(method.clone());
            }
        }
        if accepted.contains(&Method::GET) && !accepted.contains(&Method::HEAD) {
            accepted.push(Method::HEAD);
        }

        for existing in self.routes.iter_mut() {
            if existing.template.same_shape(&template) {
                let before = existing.methods.len();
                existing.methods.retain(|m| !accepted.contains(m));
                if existing.methods.len() != before {
                    tracing::debug!(
                        template = %existing.template,
                        replaced_by = %template,
                        "Route overridden by later registration"
                    );
                }
            }
        }
        self.routes.retain(|r| !r.methods.is_empty());

        let handle = RouteHandle(self.next_handle);
        self.next_handle += 1;
        self.routes.push(Route {
            handle,
            template,
            methods: accepted,
            handler: Arc::new(handler),
        });
        Ok(handle)
    }

    pub fn get<H: Handler>(&mut self, template: &str, handler: H) -> Result<RouteHandle, TemplateError> {
        self.add(template, &[Method::GET], handler)
    }

    pub fn post<H: Handler>(&mut self, template: &str, handler: H) -> Result<RouteHandle, TemplateError> {
        self.add(template, &[Method::POST], handler)
    }

    pub fn put<H: Handler>(&mut self, template: &str, handler: H) -> Result<RouteHandle, TemplateError> {
        self.add(template, &[Method::PUT], handler)
    }

    pub fn delete<H: Handler>(&mut self, template: &str, handler: H) -> Result<RouteHandle, TemplateError> {
        self.add(template, &[Method::DELETE], handler)
    }

    /// Remove a route. Returns false if the handle is unknown (or was already
    /// displaced by a later registration).
    pub fn remove(&mut self, handle: RouteHandle) -> bool {
        let before = self.routes.len();
        self.routes.retain(|r| r.handle != handle);
        self.routes.len() != before
    }

    /// Routes in match priority order.
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Process-wide domain → route table mapping.
#[derive(Debug, Clone, Default)]
pub struct DomainRegistry {
    domains: HashMap<Domain, Arc<RouteTable>>,
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `routes` to `domain`, replacing any previous binding.
    pub fn register(&mut self, domain: Domain, routes: RouteTable) {
        let count = routes.len();
        if self.domains.insert(domain.clone(), Arc::new(routes)).is_some() {
            tracing::info!(domain = %domain, routes = count, "Domain re-registered, previous routes replaced");
        } else {
            tracing::info!(domain = %domain, routes = count, "Domain registered");
        }
    }

    /// Remove a domain. Returns its routes if it was registered.
    pub fn unregister(&mut self, domain: &Domain) -> Option<Arc<RouteTable>> {
        self.domains.remove(domain)
    }

    pub fn lookup(&self, domain: &Domain) -> Option<&Arc<RouteTable>> {
        self.domains.get(domain)
    }

    /// Lookup by raw host text; case and a trailing dot are ignored.
    pub fn lookup_host(&self, host: &str) -> Option<&Arc<RouteTable>> {
        Domain::parse(host).ok().and_then(|d| self.domains.get(&d))
    }

    pub fn contains(&self, domain: &Domain) -> bool {
        self.domains.contains_key(domain)
    }

    /// Registered domains, sorted.
    pub fn domains(&self) -> Vec<Domain> {
        let mut domains: Vec<Domain> = self.domains.keys().cloned().collect();
        domains.sort();
        domains
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::handler::{HandlerResult, Reply};
    use crate::http::request::IncomingRequest;
    use crate::routing::Params;

    async fn noop(_req: IncomingRequest, _params: Params) -> HandlerResult {
        Ok(Reply::text(""))
    }

    fn domain(s: &str) -> Domain {
        Domain::parse(s).unwrap()
    }

    #[test]
    fn lookup_ignores_case_and_trailing_dot() {
        let mut registry = DomainRegistry::new();
        registry.register(domain("shop.local"), RouteTable::new());
        assert!(registry.lookup_host("SHOP.local.").is_some());
        assert!(registry.lookup(&domain("Shop.Local")).is_some());
        assert!(registry.lookup_host("other.local").is_none());
    }

    #[test]
    fn register_replaces_binding() {
        let mut registry = DomainRegistry::new();
        let mut first = RouteTable::new();
        first.get("/a", noop).unwrap();
        first.get("/b", noop).unwrap();
        registry.register(domain("shop.local"), first);

        let mut second = RouteTable::new();
        second.get("/c", noop).unwrap();
        registry.register(domain("shop.local"), second);

        let table = registry.lookup(&domain("shop.local")).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.routes()[0].template().as_str(), "/c");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn domains_are_sorted() {
        let mut registry = DomainRegistry::new();
        registry.register(domain("b.local"), RouteTable::new());
        registry.register(domain("a.local"), RouteTable::new());
        assert_eq!(registry.domains(), vec![domain("a.local"), domain("b.local")]);
        assert!(registry.unregister(&domain("a.local")).is_some());
        assert_eq!(registry.domains(), vec![domain("b.local")]);
    }

    #[test]
    fn get_implies_head() {
        let mut table = RouteTable::new();
        table.get("/", noop).unwrap();
        assert!(table.routes()[0].accepts(&Method::HEAD));
        assert!(!table.routes()[0].accepts(&Method::POST));
    }

    #[test]
    fn same_shape_and_method_last_wins() {
        let mut table = RouteTable::new();
        let first = table.add("/item/<id>", &[Method::GET, Method::POST], noop).unwrap();
        let second = table.get("/item/<sku>", noop).unwrap();

        assert_eq!(table.len(), 2);
        // first keeps only POST
        assert_eq!(table.routes()[0].handle(), first);
        assert_eq!(table.routes()[0].methods(), &[Method::POST]);
        assert_eq!(table.routes()[1].handle(), second);

        // fully displaced routes disappear
        table.post("/item/<x>", noop).unwrap();
        assert_eq!(table.len(), 2);
        assert!(!table.remove(first));
    }

    #[test]
    fn different_shapes_coexist() {
        let mut table = RouteTable::new();
        table.get("/item/<id>", noop).unwrap();
        table.get("/item/new", noop).unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn remove_by_handle() {
        let mut table = RouteTable::new();
        let h = table.get("/x", noop).unwrap();
        assert!(table.remove(h));
        assert!(table.is_empty());
        assert!(!table.remove(h));
    }

    #[test]
    fn bad_template_is_reported() {
        let mut table = RouteTable::new();
        assert!(table.get("no-slash", noop).is_err());
        assert!(table.is_empty());
    }
}
