pub mod agent;
pub mod buffered_body;
pub mod file_route_store;
pub mod http_client;
pub mod http_handler;
pub mod middleware;

/// Re-export commonly used types from adapters
pub use agent::{Agent, ProxyRuntime};
pub use buffered_body::{BufferedBody, FlushPolicy};
pub use file_route_store::FileRouteStore;
pub use http_client::HttpClientAdapter;
pub use http_handler::HttpHandler;
pub use middleware::*;
