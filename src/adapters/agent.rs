//! Per-request proxying unit.
//!
//! An [`Agent`] is built for each matched request from the resolved
//! [`Upstream`]. It authenticates the caller, places claims on the outbound
//! request, forwards it under a deadline and sanitizes the response.
use std::{net::SocketAddr, sync::Arc};

use axum::body::Body as AxumBody;
use http::{HeaderMap, HeaderName, HeaderValue, Request, Response, Uri, header, request::Parts};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};
use url::Url;

use crate::{
    adapters::buffered_body::{BufferedBody, FlushPolicy},
    config::models::{DEFAULT_TIMEOUT, GatewayConfig},
    core::{
        auth::Authenticator,
        buffer_pool::BufferPool,
        claims::{RequestContext, inject_claims, stage_claims},
        route_matcher::Upstream,
    },
    ports::{gateway_error::GatewayError, http_client::HttpClient},
};

/// Request headers that only describe the inbound hop.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Response headers that reveal the upstream or are invalidated by re-chunking.
const STRIPPED_RESPONSE_HEADERS: [&str; 5] = [
    "server",
    "x-powered-by",
    "transfer-encoding",
    "connection",
    "content-length",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const EVENT_STREAM: &str = "text/event-stream";

/// Process-wide pieces every agent shares.
pub struct ProxyRuntime {
    pub config: Arc<GatewayConfig>,
    pub client: Arc<dyn HttpClient>,
    pub buffers: BufferPool,
}

impl ProxyRuntime {
    pub fn new(config: Arc<GatewayConfig>, client: Arc<dyn HttpClient>) -> Self {
        let buffers = BufferPool::new(config.transport.buffer_size);
        Self {
            config,
            client,
            buffers,
        }
    }
}

pub struct Agent {
    upstream: Upstream,
    target: Url,
    runtime: Arc<ProxyRuntime>,
}

impl Agent {
    pub fn new(upstream: Upstream, runtime: Arc<ProxyRuntime>) -> Result<Self, GatewayError> {
        let target = Url::parse(&upstream.upstream_url)
            .ok()
            .filter(|url| matches!(url.scheme(), "http" | "https") && url.host().is_some())
            .ok_or_else(|| GatewayError::InvalidUpstream(upstream.upstream_url.clone()))?;
        Ok(Self {
            upstream,
            target,
            runtime,
        })
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    /// Verify the caller's token and stage its claims. No-op without auth.
    pub fn authenticate(&self, parts: &Parts, ctx: &mut RequestContext) -> Result<(), GatewayError> {
        let Some(spec) = &self.upstream.auth else {
            return Ok(());
        };
        let claims = Authenticator::from_spec(spec).parse(parts)?;
        stage_claims(spec, &claims, ctx);
        debug!(
            request_id = %ctx.request_id,
            claims = claims.len(),
            staged = ctx.staged_len(),
            "Authenticated request"
        );
        Ok(())
    }

    /// Forward to the upstream. Every upstream failure becomes
    /// [`GatewayError::ServiceBusy`].
    pub async fn forward(
        &self,
        req: Request<AxumBody>,
        ctx: &RequestContext,
    ) -> Result<Response<AxumBody>, GatewayError> {
        let (mut parts, body) = req.into_parts();

        if let Some(spec) = &self.upstream.auth {
            inject_claims(spec, ctx, &mut parts);
        }

        let timeout = if self.upstream.timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            self.upstream.timeout
        };
        let deadline = Instant::now() + timeout;

        parts.uri = self.outbound_uri(&parts.uri)?;
        strip_hop_by_hop(&mut parts.headers);
        append_forwarded_for(&mut parts.headers, ctx.client_addr);

        debug!(
            request_id = %ctx.request_id,
            upstream = %parts.uri,
            timeout = ?timeout,
            "Forwarding request"
        );

        let outbound = Request::from_parts(parts, body);
        let response = match timeout_at(deadline, self.runtime.client.send_request(outbound)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(
                    request_id = %ctx.request_id,
                    upstream = %self.upstream.upstream_url,
                    error = %e,
                    "Upstream request failed"
                );
                return Err(GatewayError::ServiceBusy);
            }
            Err(_) => {
                warn!(
                    request_id = %ctx.request_id,
                    upstream = %self.upstream.upstream_url,
                    timeout = ?timeout,
                    "Upstream deadline exceeded"
                );
                return Err(GatewayError::ServiceBusy);
            }
        };

        Ok(self.relay(response, deadline))
    }

    /// Scheme and authority from the upstream, path from the matched request,
    /// query as the upstream's own query followed by the inbound one.
    fn outbound_uri(&self, inbound: &Uri) -> Result<Uri, GatewayError> {
        let mut url = self.target.clone();
        url.set_path(&self.upstream.target_path);

        let base = self.target.query().filter(|q| !q.is_empty());
        let extra = inbound.query().filter(|q| !q.is_empty());
        let query = match (base, extra) {
            (Some(base), Some(extra)) => Some(format!("{base}&{extra}")),
            (Some(only), None) | (None, Some(only)) => Some(only.to_string()),
            (None, None) => None,
        };
        url.set_query(query.as_deref());

        url.as_str()
            .parse::<Uri>()
            .map_err(|e| GatewayError::BadRequest(e.to_string()))
    }

    fn relay(&self, response: Response<AxumBody>, deadline: Instant) -> Response<AxumBody> {
        let (mut parts, body) = response.into_parts();
        for name in STRIPPED_RESPONSE_HEADERS {
            parts.headers.remove(name);
        }

        let streaming = parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with(EVENT_STREAM));
        let policy = if streaming {
            FlushPolicy::Immediate
        } else {
            FlushPolicy::from_interval(self.runtime.config.transport.flush_interval)
        };

        let body = BufferedBody::new(body, self.runtime.buffers.clone(), policy, deadline);
        Response::from_parts(parts, AxumBody::new(body))
    }
}

/// Drop hop-by-hop headers, including any the `Connection` header names.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, client_addr: Option<SocketAddr>) {
    let Some(addr) = client_addr else {
        return;
    };
    let ip = addr.ip().to_string();
    let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.is_empty() => format!("{prior}, {ip}"),
        _ => ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, time::Duration};

    use async_trait::async_trait;
    use http_body_util::BodyExt;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;

    use super::*;
    use crate::{
        config::models::{AuthKind, AuthSpec},
        core::placement::Placement,
        ports::http_client::{HttpClientError, HttpClientResult},
    };

    /// Records the outbound request and answers with a canned response.
    #[derive(Default)]
    struct RecordingClient {
        seen: Mutex<Option<http::request::Parts>>,
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl HttpClient for RecordingClient {
        async fn send_request(
            &self,
            req: Request<AxumBody>,
        ) -> HttpClientResult<Response<AxumBody>> {
            let (parts, _) = req.into_parts();
            *self.seen.lock().unwrap() = Some(parts);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(HttpClientError::ConnectionError("refused".to_string()));
            }
            Ok(Response::builder()
                .header("Server", "nginx/1.25")
                .header("X-Powered-By", "PHP")
                .header("Content-Length", "2")
                .header("Connection", "keep-alive")
                .header("X-Upstream", "yes")
                .body(AxumBody::from("ok"))
                .unwrap())
        }
    }

    fn runtime(client: Arc<RecordingClient>) -> Arc<ProxyRuntime> {
        Arc::new(ProxyRuntime::new(
            Arc::new(GatewayConfig::default()),
            client as Arc<dyn HttpClient>,
        ))
    }

    fn upstream(url: &str, auth: Option<AuthSpec>) -> Upstream {
        Upstream {
            auth,
            timeout: Duration::from_secs(5),
            upstream_url: url.to_string(),
            target_path: "/api/items".to_string(),
        }
    }

    fn auth_spec() -> AuthSpec {
        AuthSpec {
            kind: AuthKind::Jwt,
            source: Placement::Header("Authorization".to_string()),
            secret: "secret".to_string(),
            claims: [(
                Placement::Header("X-User".to_string()),
                "userName".to_string(),
            )]
            .into_iter()
            .collect(),
        }
    }

    #[test]
    fn test_invalid_upstream_is_rejected() {
        let client = Arc::new(RecordingClient::default());
        for url in ["not a url", "ftp://files:21", "unix:/tmp/sock"] {
            assert!(matches!(
                Agent::new(upstream(url, None), runtime(client.clone())),
                Err(GatewayError::InvalidUpstream(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_forward_rewrites_target_and_sanitizes_response() {
        let client = Arc::new(RecordingClient::default());
        let agent = Agent::new(
            upstream("http://10.0.0.1:9000/ignored?base=1", None),
            runtime(client.clone()),
        )
        .unwrap();

        let req = Request::builder()
            .uri("/__orders/api/items?x=1")
            .header("Host", "gateway.local")
            .header("Connection", "keep-alive, X-Hop")
            .header("X-Hop", "drop-me")
            .header("Keep-Alive", "timeout=5")
            .header("X-Forwarded-For", "203.0.113.9")
            .body(AxumBody::empty())
            .unwrap();
        let ctx = RequestContext::new("req-1", Some("198.51.100.7:5555".parse().unwrap()));

        let response = agent.forward(req, &ctx).await.unwrap();

        let seen = client.seen.lock().unwrap().take().unwrap();
        assert_eq!(
            seen.uri.to_string(),
            "http://10.0.0.1:9000/api/items?base=1&x=1"
        );
        assert_eq!(seen.headers.get("host").unwrap(), "gateway.local");
        assert!(seen.headers.get("connection").is_none());
        assert!(seen.headers.get("x-hop").is_none());
        assert!(seen.headers.get("keep-alive").is_none());
        assert_eq!(
            seen.headers.get("x-forwarded-for").unwrap(),
            "203.0.113.9, 198.51.100.7"
        );

        for name in STRIPPED_RESPONSE_HEADERS {
            assert!(response.headers().get(name).is_none(), "{name} leaked");
        }
        assert_eq!(response.headers().get("x-upstream").unwrap(), "yes");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_authenticate_then_forward_places_claims() {
        let client = Arc::new(RecordingClient::default());
        let agent = Agent::new(
            upstream("http://10.0.0.1:9000", Some(auth_spec())),
            runtime(client.clone()),
        )
        .unwrap();

        let token = encode(
            &Header::default(),
            &json!({"userName": "alice"}),
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        let req = Request::builder()
            .uri("/__orders/api/items")
            .header("Authorization", format!("Bearer {token}"))
            .header("X-User", "spoofed")
            .body(AxumBody::empty())
            .unwrap();
        let (parts, body) = req.into_parts();
        let mut ctx = RequestContext::new("req-2", None);

        agent.authenticate(&parts, &mut ctx).unwrap();
        agent
            .forward(Request::from_parts(parts, body), &ctx)
            .await
            .unwrap();

        let seen = client.seen.lock().unwrap().take().unwrap();
        let users: Vec<_> = seen.headers.get_all("x-user").iter().collect();
        assert_eq!(users, vec!["alice"]);
    }

    #[tokio::test]
    async fn test_authenticate_rejects_missing_token() {
        let client = Arc::new(RecordingClient::default());
        let agent = Agent::new(
            upstream("http://10.0.0.1:9000", Some(auth_spec())),
            runtime(client),
        )
        .unwrap();
        let (parts, _) = Request::builder()
            .uri("/__orders/api/items")
            .body(())
            .unwrap()
            .into_parts();

        let err = agent
            .authenticate(&parts, &mut RequestContext::default())
            .unwrap_err();
        assert!(matches!(err, GatewayError::Auth(_)));
    }

    #[tokio::test]
    async fn test_upstream_failure_is_service_busy() {
        let client = Arc::new(RecordingClient {
            fail: true,
            ..Default::default()
        });
        let agent = Agent::new(upstream("http://10.0.0.1:9000", None), runtime(client)).unwrap();
        let req = Request::builder()
            .uri("/x")
            .body(AxumBody::empty())
            .unwrap();

        let err = agent
            .forward(req, &RequestContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ServiceBusy));
    }

    #[tokio::test]
    async fn test_deadline_is_service_busy() {
        let client = Arc::new(RecordingClient {
            delay: Duration::from_millis(200),
            ..Default::default()
        });
        let mut slow = upstream("http://10.0.0.1:9000", None);
        slow.timeout = Duration::from_millis(50);
        let agent = Agent::new(slow, runtime(client)).unwrap();
        let req = Request::builder()
            .uri("/x")
            .body(AxumBody::empty())
            .unwrap();

        let started = Instant::now();
        let err = agent
            .forward(req, &RequestContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ServiceBusy));
        assert!(started.elapsed() < Duration::from_millis(200));
    }
}
