use std::{
    future::Future,
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use http_body_util::BodyExt;
use hyper::{Request, Response, Uri, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioTimer},
};
use rustls_native_certs::load_native_certs;
use tokio::{sync::Semaphore, time::timeout};
use tower::Service;
use tracing::Instrument;

use crate::{
    config::models::TransportConfig,
    ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type Connector = TimeoutConnector<HttpsConnector<HttpConnector>>;

/// Bounds the whole connect phase (TCP dial plus TLS handshake).
#[derive(Clone)]
pub struct TimeoutConnector<C> {
    inner: C,
    timeout: Duration,
}

impl<C> TimeoutConnector<C> {
    pub fn new(inner: C, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl<C> Service<Uri> for TimeoutConnector<C>
where
    C: Service<Uri>,
    C::Response: Send + 'static,
    C::Error: Into<BoxError>,
    C::Future: Send + 'static,
{
    type Response = C::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let limit = self.timeout;
        let connecting = self.inner.call(uri);
        Box::pin(async move {
            match timeout(limit, connecting).await {
                Ok(result) => result.map_err(Into::into),
                Err(_) => Err(Box::new(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect timed out after {limit:?}"),
                )) as BoxError),
            }
        })
    }
}

/// HTTP client adapter using Hyper with Rustls and a shared connection pool.
///
/// Responsibilities:
/// * Applies the transport tuning: dial, handshake and response-header
///   timeouts, keep-alive, idle pool limits
/// * Caps concurrent exchanges per upstream host when configured; the slot is
///   held until the response body is dropped
/// * Converts between Hyper body and Axum body types
pub struct HttpClientAdapter {
    client: Client<Connector, AxumBody>,
    response_header_timeout: Duration,
    max_conns_per_host: usize,
    host_limits: scc::HashMap<String, Arc<Semaphore>>,
}

impl HttpClientAdapter {
    /// Create a new HTTP client adapter.
    pub fn new(transport: &TransportConfig) -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false); // Allow HTTPS URLs
        http_connector.set_connect_timeout(Some(transport.dial_timeout));
        http_connector.set_keepalive(Some(transport.keep_alive));
        http_connector.set_nodelay(true);

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();

        if !native_certs.certs.is_empty() {
            for cert in native_certs.certs {
                if root_cert_store.add(cert).is_err() {
                    tracing::warn!("Failed to add native certificate to rustls RootCertStore");
                }
            }
            tracing::info!("Loaded {} native root certificates.", root_cert_store.len());
        }

        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);
        let connector = TimeoutConnector::new(
            https_connector,
            transport.dial_timeout + transport.tls_handshake_timeout,
        );

        // hyper has no global idle cap; bound each host by the smaller limit.
        let idle_per_host = transport
            .max_idle_conns_per_host
            .min(transport.max_idle_conns);

        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(transport.idle_conn_timeout)
            .pool_max_idle_per_host(idle_per_host)
            .build::<_, AxumBody>(connector);

        tracing::info!(
            idle_per_host,
            max_conns_per_host = transport.max_conns_per_host,
            "Created upstream HTTP client"
        );
        Ok(Self {
            client,
            response_header_timeout: transport.response_header_timeout,
            max_conns_per_host: transport.max_conns_per_host,
            host_limits: scc::HashMap::new(),
        })
    }

    async fn host_limit(&self, host: &str) -> Option<Arc<Semaphore>> {
        if self.max_conns_per_host == 0 {
            return None;
        }
        let limit = self.max_conns_per_host;
        let semaphore = self
            .host_limits
            .entry_async(host.to_string())
            .await
            .or_insert_with(|| Arc::new(Semaphore::new(limit)))
            .get()
            .clone();
        Some(semaphore)
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(
        &self,
        mut req: Request<AxumBody>,
    ) -> HttpClientResult<Response<AxumBody>> {
        let Some(authority) = req.uri().authority().cloned() else {
            tracing::error!("Outgoing URI has no host: {}", req.uri());
            return Err(HttpClientError::InvalidRequest(
                "Outgoing URI has no host".to_string(),
            ));
        };
        let backend_identifier = format!(
            "{}://{}",
            req.uri().scheme_str().unwrap_or("http"),
            authority
        );

        let span = tracing::info_span!(
            "backend_request",
            backend.url = %backend_identifier,
            http.method = %req.method(),
            http.path = %req.uri().path(),
            http.status_code = tracing::field::Empty,
        );

        // Callers normally forward the inbound Host; fall back to the target.
        if !req.headers().contains_key(header::HOST) {
            let host_value = HeaderValue::from_str(authority.as_str())
                .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;
            req.headers_mut().insert(header::HOST, host_value);
        }
        *req.version_mut() = Version::HTTP_11;

        async move {
            let permit = match self.host_limit(authority.as_str()).await {
                Some(semaphore) => Some(semaphore.acquire_owned().await.map_err(|e| {
                    HttpClientError::ConnectionError(format!("connection limiter closed: {e}"))
                })?),
                None => None,
            };

            tracing::debug!("Sending request: {} {}", req.method(), req.uri());
            let method = req.method().clone();
            let uri = req.uri().clone();

            let response = match timeout(self.response_header_timeout, self.client.request(req))
                .await
            {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    tracing::Span::current().record("http.status_code", 599u16);
                    tracing::warn!(
                        "Error making request to backend {} ({} {}): {}",
                        backend_identifier,
                        method,
                        uri,
                        e
                    );
                    return Err(HttpClientError::ConnectionError(format!(
                        "Request to {method} {uri} failed: {e}"
                    )));
                }
                Err(_) => {
                    tracing::Span::current().record("http.status_code", 599u16);
                    tracing::warn!(
                        "No response headers from backend {} within {:?}",
                        backend_identifier,
                        self.response_header_timeout
                    );
                    return Err(HttpClientError::ResponseHeaderTimeout(
                        self.response_header_timeout,
                    ));
                }
            };

            tracing::Span::current().record("http.status_code", response.status().as_u16());

            let (parts, hyper_body) = response.into_parts();
            let body = match permit {
                // The permit lives as long as the body stream.
                Some(permit) => AxumBody::new(hyper_body.map_frame(move |frame| {
                    let _held = &permit;
                    frame
                })),
                None => AxumBody::new(hyper_body),
            };
            Ok::<_, HttpClientError>(Response::from_parts(parts, body))
        }
        .instrument(span)
        .await
    }
}
