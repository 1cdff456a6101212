//! The public control surface: register domains, start, stop.
//!
//! # State machine
//! ```text
//! Idle → Binding → Serving → Draining → Idle
//! ```
//! - `start` applies hosts overrides before binding. If any port fails to
//!   bind, the overrides are rolled back and the interceptor returns to Idle.
//! - `stop` is two-phase: drain every listener (bounded by the grace period),
//!   then restore the hosts file. The restore runs even when the drain timed
//!   out, and its failure is reported loudly.
//! - `abort` skips the drain, including one a cancelled `stop` left behind.
//! - The registry is only writable while Idle.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinHandle;

use crate::config::InterceptorConfig;
use crate::dns::{NameOverrideManager, OverrideError};
use crate::http::forward::{ForwardError, UpstreamForwarder};
use crate::http::server::{build_router, serve, AppState, ServeSettings};
use crate::lifecycle::shutdown::Shutdown;
use crate::net::{ConnectionTracker, Listener, ListenerError};
use crate::routing::{Domain, DomainRegistry, RouteMatcher, RouteTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Binding,
    Serving,
    Draining,
}

#[derive(Debug, thiserror::Error)]
pub enum InterceptorError {
    #[error("interceptor is already running")]
    AlreadyRunning,
    #[error("interceptor is not running")]
    NotRunning,
    #[error("domain {0} is not registered")]
    UnknownDomain(Domain),
    #[error("no domains are registered")]
    NoDomains,
    #[error("no ports to listen on")]
    NoPorts,
    #[error("{field} is not a valid IP address: {value:?}")]
    InvalidAddress { field: &'static str, value: String },
    #[error(transparent)]
    Bind(#[from] ListenerError),
    #[error("failed to apply hosts overrides: {0}")]
    Override(#[source] OverrideError),
    #[error(transparent)]
    Forwarder(#[from] ForwardError),
    #[error("failed to restore hosts file, name resolution is still overridden: {0}")]
    RestoreFailed(#[source] OverrideError),
}

/// What `start` should do.
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Override just this domain. `None` overrides every registered domain.
    pub domain: Option<Domain>,
    /// Ports to bind. Port 0 picks a free port.
    pub ports: Vec<u16>,
    /// Write hosts-file entries for the domains.
    pub apply_name_override: bool,
}

impl StartOptions {
    pub fn from_config(config: &InterceptorConfig) -> Self {
        Self {
            domain: None,
            ports: config.listener.ports.clone(),
            apply_name_override: config.name_override.enabled,
        }
    }
}

struct Running {
    shutdown: Shutdown,
    /// Listener tasks not yet joined.
    tasks: Vec<JoinHandle<()>>,
}

pub struct Interceptor {
    config: InterceptorConfig,
    registry: Arc<DomainRegistry>,
    overrides: Arc<NameOverrideManager>,
    phase: watch::Sender<ListenerState>,
    tracker: ConnectionTracker,
    running: Mutex<Option<Running>>,
}

impl Interceptor {
    pub fn new(config: InterceptorConfig) -> Self {
        let overrides = NameOverrideManager::new(&config.name_override.hosts_path)
            .with_cache_flush(config.name_override.flush_resolver_cache);
        let (phase, _) = watch::channel(ListenerState::Idle);
        Self {
            config,
            registry: Arc::new(DomainRegistry::new()),
            overrides: Arc::new(overrides),
            phase,
            tracker: ConnectionTracker::new(),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &InterceptorConfig {
        &self.config
    }

    pub fn overrides(&self) -> &NameOverrideManager {
        &self.overrides
    }

    /// Bind `routes` to `domain`, replacing an earlier registration.
    pub fn register_domain(&mut self, domain: Domain, routes: RouteTable) -> Result<(), InterceptorError> {
        self.ensure_idle()?;
        Arc::make_mut(&mut self.registry).register(domain, routes);
        Ok(())
    }

    pub fn unregister_domain(&mut self, domain: &Domain) -> Result<bool, InterceptorError> {
        self.ensure_idle()?;
        Ok(Arc::make_mut(&mut self.registry).unregister(domain).is_some())
    }

    /// Registered domains, sorted.
    pub fn list_registered_domains(&self) -> Vec<Domain> {
        self.registry.domains()
    }

    pub fn state(&self) -> ListenerState {
        *self.phase.borrow()
    }

    /// Live connections, including those still draining.
    pub fn active_connections(&self) -> u64 {
        self.tracker.active_count()
    }

    /// Apply overrides, bind, and start serving. Returns the bound addresses.
    pub async fn start(&self, options: StartOptions) -> Result<Vec<SocketAddr>, InterceptorError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(InterceptorError::AlreadyRunning);
        }

        self.phase.send_replace(ListenerState::Binding);
        match self.launch(&options).await {
            Ok((run, bound)) => {
                *running = Some(run);
                self.phase.send_replace(ListenerState::Serving);
                tracing::info!(
                    addresses = ?bound,
                    domains = ?self.registry.domains().iter().map(Domain::as_str).collect::<Vec<_>>(),
                    "Interceptor serving"
                );
                Ok(bound)
            }
            Err(e) => {
                self.phase.send_replace(ListenerState::Idle);
                tracing::error!(error = %e, "Interceptor failed to start");
                Err(e)
            }
        }
    }

    /// Drain, then restore the hosts file.
    ///
    /// Dropping the returned future part-way leaves the listeners that have
    /// not finished draining in place for [`Interceptor::abort`].
    pub async fn stop(&self) -> Result<(), InterceptorError> {
        let mut running = self.running.lock().await;
        let Some(run) = running.as_mut() else {
            return Err(InterceptorError::NotRunning);
        };

        // phase 1: drain
        self.phase.send_replace(ListenerState::Draining);
        tracing::info!(active_connections = self.tracker.active_count(), "Interceptor draining");
        run.shutdown.trigger();
        while let Some(task) = run.tasks.last_mut() {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Listener task ended abnormally");
            }
            run.tasks.pop();
        }
        running.take();

        // phase 2: restore, regardless of how the drain went
        self.finish().await
    }

    /// Stop without draining: close every listener and connection at once,
    /// then restore the hosts file.
    pub async fn abort(&self) -> Result<(), InterceptorError> {
        let mut running = self.running.lock().await;
        let Some(run) = running.take() else {
            return Err(InterceptorError::NotRunning);
        };

        self.phase.send_replace(ListenerState::Draining);
        tracing::warn!(active_connections = self.tracker.active_count(), "Interceptor aborting");
        run.shutdown.trigger();
        for task in run.tasks {
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::error!(error = %e, "Listener task ended abnormally");
                }
            }
        }

        self.finish().await
    }

    async fn finish(&self) -> Result<(), InterceptorError> {
        let restored = self.restore_overrides().await;
        self.phase.send_replace(ListenerState::Idle);
        match restored {
            Ok(()) => {
                tracing::info!("Interceptor stopped");
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    hosts = %self.overrides.hosts_path().display(),
                    "HOSTS FILE NOT RESTORED: name resolution is still redirected; run `rewroute restore`"
                );
                Err(InterceptorError::RestoreFailed(e))
            }
        }
    }

    async fn launch(&self, options: &StartOptions) -> Result<(Running, Vec<SocketAddr>), InterceptorError> {
        if self.registry.is_empty() {
            return Err(InterceptorError::NoDomains);
        }
        if options.ports.is_empty() {
            return Err(InterceptorError::NoPorts);
        }
        let domains = match &options.domain {
            Some(domain) if !self.registry.contains(domain) => {
                return Err(InterceptorError::UnknownDomain(domain.clone()));
            }
            Some(domain) => vec![domain.clone()],
            None => self.registry.domains(),
        };
        let bind_ip = parse_ip("listener.bind_address", &self.config.listener.bind_address)?;
        let target = parse_ip("name_override.target_address", &self.config.name_override.target_address)?;
        let forwarder = UpstreamForwarder::new(&self.config.upstream)?;

        if options.apply_name_override {
            if let Err(e) = self.apply_overrides(domains, target).await {
                self.rollback_overrides().await;
                return Err(InterceptorError::Override(e));
            }
        }

        let listeners = match self.bind_all(bind_ip, &options.ports).await {
            Ok(listeners) => listeners,
            Err(e) => {
                self.rollback_overrides().await;
                return Err(e.into());
            }
        };

        let bound: Vec<SocketAddr> = listeners.iter().map(|(_, addr)| *addr).collect();
        let state = AppState::new(
            RouteMatcher::new(Arc::clone(&self.registry)),
            forwarder,
            &self.config,
            bound.clone(),
        );
        let router = build_router(&self.config, state);
        let settings = ServeSettings::from_config(&self.config);
        let shutdown = Shutdown::new();

        let tasks = listeners
            .into_iter()
            .map(|(listener, _)| {
                tokio::spawn(serve(
                    listener,
                    router.clone(),
                    self.tracker.clone(),
                    shutdown.subscribe(),
                    settings,
                ))
            })
            .collect();

        Ok((
            Running { shutdown, tasks },
            bound,
        ))
    }

    async fn bind_all(&self, ip: IpAddr, ports: &[u16]) -> Result<Vec<(Listener, SocketAddr)>, ListenerError> {
        let limit = Arc::new(Semaphore::new(self.config.listener.max_connections));
        let mut listeners = Vec::with_capacity(ports.len());
        for port in ports {
            let addr = SocketAddr::new(ip, *port);
            // earlier sockets close on drop if this one fails
            let listener = Listener::bind(addr, Arc::clone(&limit)).await?;
            let local = listener
                .local_addr()
                .map_err(|source| ListenerError::Bind { addr, source })?;
            listeners.push((listener, local));
        }
        Ok(listeners)
    }

    async fn apply_overrides(&self, domains: Vec<Domain>, target: IpAddr) -> Result<(), OverrideError> {
        self.with_overrides(move |overrides| overrides.apply_many(&domains, target))
            .await
    }

    async fn restore_overrides(&self) -> Result<(), OverrideError> {
        self.with_overrides(|overrides| overrides.restore_all()).await
    }

    async fn rollback_overrides(&self) {
        if let Err(e) = self.restore_overrides().await {
            tracing::error!(error = %e, "Failed to roll back hosts overrides after a failed start");
        }
    }

    /// Hosts-file I/O is blocking; keep it off the runtime threads.
    async fn with_overrides<T, F>(&self, f: F) -> Result<T, OverrideError>
    where
        F: FnOnce(&NameOverrideManager) -> Result<T, OverrideError> + Send + 'static,
        T: Send + 'static,
    {
        let overrides = Arc::clone(&self.overrides);
        let path = overrides.hosts_path().to_path_buf();
        tokio::task::spawn_blocking(move || f(&overrides))
            .await
            .map_err(|e| OverrideError::Io {
                path,
                source: io::Error::other(e),
            })?
    }

    fn ensure_idle(&self) -> Result<(), InterceptorError> {
        if self.state() == ListenerState::Idle {
            Ok(())
        } else {
            Err(InterceptorError::AlreadyRunning)
        }
    }
}

impl Drop for Interceptor {
    fn drop(&mut self) {
        if let Some(run) = self.running.get_mut().take() {
            run.shutdown.trigger();
            for task in &run.tasks {
                task.abort();
            }
            tracing::warn!("Interceptor dropped while running; restoring hosts file");
            if let Err(e) = self.overrides.restore_all() {
                tracing::error!(error = %e, "HOSTS FILE NOT RESTORED on drop; run `rewroute restore`");
            }
        }
    }
}

fn parse_ip(field: &'static str, value: &str) -> Result<IpAddr, InterceptorError> {
    value.parse().map_err(|_| InterceptorError::InvalidAddress {
        field,
        value: value.to_string(),
    })
}
