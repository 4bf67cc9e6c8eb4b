//! Rule resolution for a single service's route table.
//!
//! The matcher walks rules in declaration order and resolves the first one
//! whose pattern matches into an [`Upstream`]: the effective auth spec, the
//! effective timeout, and one address picked from the rule's pool.
use std::time::Duration;

use rand::Rng;
use thiserror::Error;

use crate::config::models::{AuthSpec, DEFAULT_TIMEOUT, Route, RouteTable};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("service not found")]
    ServiceNotFound,

    #[error("route not found")]
    RouteNotFound,

    #[error("route '{pattern}' has no upstream address")]
    NoUpstream { pattern: String },
}

/// The resolved target for one request. Built per request and never shared.
#[derive(Debug, Clone, PartialEq)]
pub struct Upstream {
    pub auth: Option<AuthSpec>,
    /// Always non-zero.
    pub timeout: Duration,
    pub upstream_url: String,
    pub target_path: String,
}

#[derive(Debug, Clone, Copy)]
pub struct RouteMatcher {
    fallback_timeout: Duration,
}

impl Default for RouteMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl RouteMatcher {
    /// `fallback_timeout` applies when neither the table nor the rule sets
    /// one. Zero falls back to [`DEFAULT_TIMEOUT`].
    pub fn new(fallback_timeout: Duration) -> Self {
        let fallback_timeout = if fallback_timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            fallback_timeout
        };
        Self { fallback_timeout }
    }

    pub fn match_route(&self, table: &RouteTable, path: &str) -> Result<Upstream, RouteError> {
        let route = table
            .routes
            .iter()
            .filter(|route| !route.pattern.is_empty())
            .find(|route| route.pattern.is_match(path))
            .ok_or(RouteError::RouteNotFound)?;

        let pool = if route.proxy.is_empty() {
            &table.proxy
        } else {
            &route.proxy
        };
        let upstream_url = pick_address(pool).ok_or_else(|| RouteError::NoUpstream {
            pattern: route.pattern.as_str().to_string(),
        })?;

        Ok(Upstream {
            auth: effective_auth(table, route).cloned(),
            timeout: self.effective_timeout(table, route),
            upstream_url: upstream_url.to_string(),
            target_path: path.to_string(),
        })
    }

    fn effective_timeout(&self, table: &RouteTable, route: &Route) -> Duration {
        let set = |timeout: Option<Duration>| timeout.filter(|t| !t.is_zero());
        set(route.timeout)
            .or(set(table.timeout))
            .unwrap_or(self.fallback_timeout)
    }
}

fn effective_auth<'a>(table: &'a RouteTable, route: &'a Route) -> Option<&'a AuthSpec> {
    if route.disable_auth {
        return None;
    }
    route.auth.as_ref().or(table.auth.as_ref())
}

/// One address from the pool: the only entry when there is one, a uniform
/// random choice otherwise.
pub fn pick_address(pool: &[String]) -> Option<&str> {
    match pool {
        [] => None,
        [only] => Some(only.as_str()),
        _ => {
            let index = rand::rng().random_range(0..pool.len());
            Some(pool[index].as_str())
        }
    }
}
