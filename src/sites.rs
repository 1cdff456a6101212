//! Canned sites from configuration.
//!
//! Each `[[sites]]` entry becomes a registered domain whose routes answer
//! with a fixed status, content type and body. `{name}` in the body is
//! replaced by the path parameter bound to `name`.

use std::sync::Arc;

use axum::http::{Method, StatusCode};

use crate::config::schema::{CannedRouteConfig, SiteConfig};
use crate::http::handler::{HandlerError, Reply};
use crate::http::request::IncomingRequest;
use crate::http::response::OutgoingResponse;
use crate::routing::{Domain, DomainError, Params, RouteTable, TemplateError};

#[derive(Debug, thiserror::Error)]
pub enum SiteError {
    #[error("site {domain:?}: {source}")]
    Domain {
        domain: String,
        #[source]
        source: DomainError,
    },
    #[error("site {domain}: {source}")]
    Template {
        domain: Domain,
        #[source]
        source: TemplateError,
    },
    #[error("site {domain}: {method:?} is not an HTTP method")]
    Method { domain: Domain, method: String },
    #[error("site {domain}: {status} is not a valid status code")]
    Status { domain: Domain, status: u16 },
}

#[derive(Debug)]
struct CannedResponse {
    status: StatusCode,
    content_type: String,
    body: String,
}

impl CannedResponse {
    fn render(&self, params: &Params) -> OutgoingResponse {
        let mut body = self.body.clone();
        for (name, value) in params.iter() {
            body = body.replace(&format!("{{{}}}", name), value);
        }
        OutgoingResponse::new(self.status)
            .with_mimetype(&self.content_type)
            .with_body(body)
    }
}

/// Turn site configs into domains and route tables ready for registration.
pub fn build_sites(sites: &[SiteConfig]) -> Result<Vec<(Domain, RouteTable)>, SiteError> {
    sites.iter().map(build_site).collect()
}

fn build_site(site: &SiteConfig) -> Result<(Domain, RouteTable), SiteError> {
    let domain = Domain::parse(&site.domain).map_err(|source| SiteError::Domain {
        domain: site.domain.clone(),
        source,
    })?;

    let mut routes = RouteTable::new();
    for route in &site.routes {
        add_route(&domain, &mut routes, route)?;
    }
    Ok((domain, routes))
}

fn add_route(domain: &Domain, routes: &mut RouteTable, route: &CannedRouteConfig) -> Result<(), SiteError> {
    let methods = route
        .methods
        .iter()
        .map(|m| {
            Method::from_bytes(m.to_ascii_uppercase().as_bytes()).map_err(|_| SiteError::Method {
                domain: domain.clone(),
                method: m.clone(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let status = StatusCode::from_u16(route.status).map_err(|_| SiteError::Status {
        domain: domain.clone(),
        status: route.status,
    })?;

    let canned = Arc::new(CannedResponse {
        status,
        content_type: route.content_type.clone(),
        body: route.body.clone(),
    });
    let handler = move |_request: IncomingRequest, params: Params| {
        let response = canned.render(&params);
        async move { Ok::<Reply, HandlerError>(Reply::Response(response)) }
    };

    routes
        .add(&route.path, &methods, handler)
        .map_err(|source| SiteError::Template {
            domain: domain.clone(),
            source,
        })?;
    Ok(())
}
