//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, ports present)
//! - Check addresses, domains, templates and methods of canned sites
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: InterceptorConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use axum::http::{Method, StatusCode};

use crate::config::schema::InterceptorConfig;
use crate::routing::{Domain, PathTemplate};

/// A single semantic problem, tagged with the offending field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &InterceptorConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<IpAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("{:?} is not an IP address", config.listener.bind_address),
        ));
    }
    if config.listener.ports.is_empty() {
        errors.push(ValidationError::new("listener.ports", "at least one port is required"));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be greater than 0"));
    }

    if config.name_override.target_address.parse::<IpAddr>().is_err() {
        errors.push(ValidationError::new(
            "name_override.target_address",
            format!("{:?} is not an IP address", config.name_override.target_address),
        ));
    }
    if config.name_override.enabled && config.name_override.hosts_path.trim().is_empty() {
        errors.push(ValidationError::new("name_override.hosts_path", "must not be empty"));
    }

    for (field, value) in [
        ("upstream.connect_timeout_ms", config.upstream.connect_timeout_ms),
        ("upstream.request_timeout_secs", config.upstream.request_timeout_secs),
        ("timeouts.request_secs", config.timeouts.request_secs),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than 0"));
        }
    }
    if config.upstream.retry_base_delay_ms > config.upstream.retry_max_delay_ms {
        errors.push(ValidationError::new(
            "upstream.retry_base_delay_ms",
            "must not exceed upstream.retry_max_delay_ms",
        ));
    }

    for (host, addr) in &config.upstream.pinned {
        if Domain::parse(host).is_err() {
            errors.push(ValidationError::new(
                "upstream.pinned",
                format!("{:?} is not a domain name", host),
            ));
        }
        if addr.parse::<IpAddr>().is_err() {
            errors.push(ValidationError::new(
                "upstream.pinned",
                format!("{:?} is not an IP address", addr),
            ));
        }
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("{:?} is not a socket address", config.observability.metrics_address),
        ));
    }

    let mut seen = Vec::new();
    for (i, site) in config.sites.iter().enumerate() {
        let prefix = format!("sites[{}]", i);
        match Domain::parse(&site.domain) {
            Ok(domain) if seen.contains(&domain) => errors.push(ValidationError::new(
                format!("{}.domain", prefix),
                format!("{} is listed twice", domain),
            )),
            Ok(domain) => seen.push(domain),
            Err(e) => errors.push(ValidationError::new(format!("{}.domain", prefix), e.to_string())),
        }

        for (j, route) in site.routes.iter().enumerate() {
            let field = format!("{}.routes[{}]", prefix, j);
            if let Err(e) = PathTemplate::parse(&route.path) {
                errors.push(ValidationError::new(format!("{}.path", field), e.to_string()));
            }
            if route.methods.is_empty() {
                errors.push(ValidationError::new(format!("{}.methods", field), "must not be empty"));
            }
            for method in &route.methods {
                if Method::from_bytes(method.as_bytes()).is_err() {
                    errors.push(ValidationError::new(
                        format!("{}.methods", field),
                        format!("{:?} is not an HTTP method", method),
                    ));
                }
            }
            if StatusCode::from_u16(route.status).is_err() {
                errors.push(ValidationError::new(
                    format!("{}.status", field),
                    format!("{} is not a valid status code", route.status),
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
