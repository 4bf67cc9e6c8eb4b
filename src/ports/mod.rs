pub mod gateway_error;
pub mod http_client;
pub mod route_store;

pub use gateway_error::GatewayError;
pub use http_client::{HttpClient, HttpClientError, HttpClientResult};
pub use route_store::{ConfigError, RouteStore};
