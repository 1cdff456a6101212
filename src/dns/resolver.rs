//! True name resolution for forwarded requests.
//!
//! Intercepted domains resolve to the local listener through the hosts file,
//! so forwarding must ask public nameservers directly. The system resolver
//! is never consulted.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};

use crate::config::Nameservers;
use crate::routing::Domain;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no addresses found for {0}")]
    NoAddresses(String),
}

/// reqwest resolver that bypasses the local hosts file.
#[derive(Clone)]
pub struct UpstreamResolver {
    inner: TokioAsyncResolver,
    pinned: HashMap<Domain, IpAddr>,
}

impl UpstreamResolver {
    pub fn new(nameservers: Nameservers) -> Self {
        let config = match nameservers {
            Nameservers::Cloudflare => ResolverConfig::cloudflare(),
            Nameservers::Google => ResolverConfig::google(),
            Nameservers::Quad9 => ResolverConfig::quad9(),
        };
        let mut opts = ResolverOpts::default();
        opts.use_hosts_file = false;

        Self {
            inner: TokioAsyncResolver::tokio(config, opts),
            pinned: HashMap::new(),
        }
    }

    /// Answer `host` with `addr` without a query.
    pub fn pin(mut self, host: Domain, addr: IpAddr) -> Self {
        self.pinned.insert(host, addr);
        self
    }

    pub async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, Box<dyn std::error::Error + Send + Sync>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        if let Some(ip) = Domain::parse(host).ok().and_then(|d| self.pinned.get(&d).copied()) {
            return Ok(vec![ip]);
        }

        let lookup = self.inner.lookup_ip(host).await?;
        let addrs: Vec<IpAddr> = lookup.iter().collect();
        if addrs.is_empty() {
            return Err(Box::new(ResolveError::NoAddresses(host.to_string())));
        }
        tracing::debug!(host, addrs = ?addrs, "Resolved upstream host");
        Ok(addrs)
    }
}

impl std::fmt::Debug for UpstreamResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResolver")
            .field("pinned", &self.pinned)
            .finish_non_exhaustive()
    }
}

impl Resolve for UpstreamResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let resolver = self.clone();
        Box::pin(async move {
            let ips = resolver.lookup(name.as_str()).await?;
            // port is filled in by the connector
            let addrs: Addrs = Box::new(ips.into_iter().map(|ip| SocketAddr::new(ip, 0)));
            Ok(addrs)
        })
    }
}
