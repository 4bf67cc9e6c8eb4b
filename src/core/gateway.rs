//! Core gateway orchestration service.
//!
//! The `GatewayService` ties the immutable [`GatewayConfig`] to the live
//! [`RouteStore`]. It provides:
//! * Service-prefix parsing for inbound paths (`/__<service>/<rest>`)
//! * Allowed-service checks
//! * Route table lookup and rule resolution into an [`Upstream`]
//!
//! This layer performs no I/O of its own so it stays easily testable.
use std::{collections::HashSet, sync::Arc};

use crate::{
    config::models::{GatewayConfig, RouteTable},
    core::route_matcher::{RouteError, RouteMatcher, Upstream},
    ports::route_store::RouteStore,
};

const SERVICE_PREFIX: &str = "/__";

/// Central orchestrator for service resolution and rule matching.
pub struct GatewayService {
    config: Arc<GatewayConfig>,
    store: Arc<dyn RouteStore>,
    matcher: RouteMatcher,
    allowed: HashSet<String>,
}

impl GatewayService {
    pub fn new(config: Arc<GatewayConfig>, store: Arc<dyn RouteStore>) -> Self {
        let allowed = config.services.iter().cloned().collect();
        let matcher = RouteMatcher::new(config.timeout);
        Self {
            config,
            store,
            matcher,
            allowed,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RouteStore> {
        &self.store
    }

    pub fn is_allowed(&self, service: &str) -> bool {
        self.allowed.contains(service)
    }

    /// Route table of an allowed service.
    pub fn route_table(&self, service: &str) -> Result<Arc<RouteTable>, RouteError> {
        if !self.is_allowed(service) {
            return Err(RouteError::ServiceNotFound);
        }
        self.store.get(service).ok_or(RouteError::ServiceNotFound)
    }

    /// Resolve `path` (already stripped of the service prefix) for `service`.
    pub fn resolve(&self, service: &str, path: &str) -> Result<Upstream, RouteError> {
        let table = self.route_table(service)?;
        self.matcher.match_route(&table, path)
    }
}

/// Split `/__<service>/<rest>` into the service name and `/<rest>`.
///
/// `/__orders` yields `("orders", "/")`. Paths without the prefix, or with an
/// empty service name, yield `None`.
pub fn split_service_path(path: &str) -> Option<(&str, &str)> {
    let tail = path.strip_prefix(SERVICE_PREFIX)?;
    let (service, rest) = match tail.find('/') {
        Some(index) => tail.split_at(index),
        None => (tail, "/"),
    };
    if service.is_empty() {
        return None;
    }
    Some((service, rest))
}
