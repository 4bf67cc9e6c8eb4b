pub mod auth;
pub mod buffer_pool;
pub mod claims;
pub mod gateway;
pub mod placement;
pub mod route_matcher;

pub use auth::{AuthError, Authenticator, Claims};
pub use buffer_pool::BufferPool;
pub use claims::RequestContext;
pub use gateway::GatewayService;
pub use placement::Placement;
pub use route_matcher::{RouteError, RouteMatcher, Upstream};
