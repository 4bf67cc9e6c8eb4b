//! routegate - a service-addressed API gateway.
//!
//! Requests arrive as `/__<service>/<rest>`. The gateway looks up the route table
//! for `<service>`, picks the first rule whose regular expression matches `<rest>`,
//! optionally verifies a JWT and copies selected claims into request headers or
//! query parameters, then forwards the request to one address of the rule's pool.
//!
//! Route tables are JSON files in a watched directory tree and are swapped in
//! atomically whenever a file changes, so routing can be edited without a restart.
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use routegate::{FileRouteStore, GatewayService, config::GatewayConfig};
//!
//! # fn main() -> eyre::Result<()> {
//! let cfg: GatewayConfig = routegate::config::loader::load_config_sync("gateway.yaml")?;
//! let store = Arc::new(FileRouteStore::new(&cfg.route_dir));
//! let gateway = GatewayService::new(Arc::new(cfg), store);
//! let upstream = gateway.resolve("orders", "/api/items")?;
//! println!("forwarding to {}", upstream.upstream_url);
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters** (implementations) while keeping
//! routing, auth and claims logic inside `core`, free of I/O. End users should prefer the
//! re-exports below instead of reaching into internal modules directly.
//!
//! # Error Handling
//! Startup paths return `eyre::Result<T>`; request paths use domain error types that map
//! onto HTTP status codes in [`ports::GatewayError`].
pub mod config;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{FileRouteStore, HttpClientAdapter, HttpHandler},
    core::GatewayService,
    ports::{http_client::HttpClient, route_store::RouteStore},
    utils::GracefulShutdown,
};
