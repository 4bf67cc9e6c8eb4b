use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    body::Body as AxumBody,
    extract::{ConnectInfo, Request},
    middleware,
    response::IntoResponse,
    routing::any,
};
use hyper::Response;
use tracing::Instrument;

use crate::{
    adapters::{
        agent::{Agent, ProxyRuntime},
        middleware::{cors_middleware, request_id_middleware, request_timing_middleware},
    },
    config::models::RouteTable,
    core::{
        GatewayService, RequestContext,
        gateway::split_service_path,
        route_matcher::RouteError,
    },
    ports::gateway_error::GatewayError,
    tracing_setup::create_request_span,
};

const DEBUG_CONFIG_PATH: &str = "/debug/config";

/// HTTP handler for routegate
pub struct HttpHandler {
    gateway: Arc<GatewayService>,
    runtime: Arc<ProxyRuntime>,
}

impl HttpHandler {
    pub fn new(gateway: Arc<GatewayService>, runtime: Arc<ProxyRuntime>) -> Self {
        Self { gateway, runtime }
    }

    /// Main request handler. Every failure is rendered as a JSON error body.
    pub async fn handle_request(
        &self,
        req: Request,
        client_addr: Option<SocketAddr>,
    ) -> Response<AxumBody> {
        let path = req.uri().path().to_string();

        if path == DEBUG_CONFIG_PATH {
            return self.handle_debug_config(None);
        }
        if let Some(service) = path
            .strip_prefix(DEBUG_CONFIG_PATH)
            .and_then(|rest| rest.strip_prefix('/'))
        {
            return self.handle_debug_config(Some(service));
        }

        match self.handle_proxy_request(req, client_addr).await {
            Ok(response) => response,
            Err(e) => {
                tracing::info!(path = %path, status = e.status().as_u16(), error = %e, "Request rejected");
                e.into_response()
            }
        }
    }

    async fn handle_proxy_request(
        &self,
        req: Request,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<AxumBody>, GatewayError> {
        let (service, rest) = split_service_path(req.uri().path())
            .map(|(service, rest)| (service.to_string(), rest.to_string()))
            .ok_or(RouteError::ServiceNotFound)?;

        let upstream = self.gateway.resolve(&service, &rest)?;
        let agent = Agent::new(upstream, Arc::clone(&self.runtime))?;

        let (parts, body) = req.into_parts();
        let mut ctx = RequestContext::from_parts(&parts, client_addr);
        let span = create_request_span(&service, parts.method.as_str(), &rest, &ctx.request_id);

        async move {
            agent.authenticate(&parts, &mut ctx)?;
            let response = agent
                .forward(Request::from_parts(parts, body), &ctx)
                .await?;
            tracing::Span::current().record("http.status_code", response.status().as_u16());
            Ok::<_, GatewayError>(response)
        }
        .instrument(span)
        .await
    }

    /// Dump loaded route tables. Secrets are redacted by serialization.
    fn handle_debug_config(&self, service: Option<&str>) -> Response<AxumBody> {
        match service {
            Some(service) => match self.gateway.store().get(service) {
                Some(table) => Json(table.as_ref()).into_response(),
                None => GatewayError::from(RouteError::ServiceNotFound).into_response(),
            },
            None => {
                let tables: BTreeMap<String, Arc<RouteTable>> =
                    self.gateway.store().get_all().into_iter().collect();
                let dump: BTreeMap<&str, &RouteTable> = tables
                    .iter()
                    .map(|(service, table)| (service.as_str(), table.as_ref()))
                    .collect();
                Json(dump).into_response()
            }
        }
    }
}

/// Build the gateway router around `handler`.
pub fn router(handler: Arc<HttpHandler>) -> Router {
    let make_request_route = |handler: Arc<HttpHandler>| {
        any(move |req: Request| {
            let handler = handler.clone();
            async move {
                let client_addr = req
                    .extensions()
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| *addr);
                handler.handle_request(req, client_addr).await
            }
        })
    };

    Router::new()
        .route("/{*path}", make_request_route(handler.clone()))
        .route("/", make_request_route(handler))
        .layer(middleware::from_fn(cors_middleware))
        .layer(middleware::from_fn(request_timing_middleware))
        .layer(middleware::from_fn(request_id_middleware))
}
