use axum::{
    Json,
    response::{IntoResponse, Response},
};
use hyper::StatusCode;
use serde::Serialize;
use thiserror::Error;

use crate::core::{auth::AuthError, route_matcher::RouteError};

/// Faults a request can end in before or during forwarding.
///
/// Every variant renders as a small JSON body. Upstream faults carry no
/// detail so the upstream topology never leaks to callers.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    #[error(transparent)]
    Route(#[from] RouteError),

    #[error("{0}")]
    Auth(#[from] AuthError),

    #[error("invalid upstream")]
    InvalidUpstream(String),

    #[error("service busy")]
    ServiceBusy,

    #[error("bad request: {0}")]
    BadRequest(String),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: u16,
    message: &'a str,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Route(RouteError::ServiceNotFound | RouteError::RouteNotFound) => {
                StatusCode::NOT_FOUND
            }
            GatewayError::Route(RouteError::NoUpstream { .. }) | GatewayError::InvalidUpstream(_) => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::ServiceBusy => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn public_message(&self) -> String {
        match self {
            GatewayError::Route(RouteError::NoUpstream { .. }) => "invalid upstream".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.public_message();
        let body = ErrorBody {
            code: status.as_u16(),
            message: &message,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;

    use super::*;

    async fn render(err: GatewayError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let (status, body) = render(RouteError::ServiceNotFound.into()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], "service not found");
        assert_eq!(body["code"], 404);

        let (status, body) = render(RouteError::RouteNotFound.into()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], "route not found");

        let (status, body) = render(AuthError::MissingToken.into()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["message"], "missing token");

        let (status, body) = render(GatewayError::ServiceBusy).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["message"], "service busy");
    }

    #[tokio::test]
    async fn test_upstream_detail_is_hidden() {
        let (status, body) =
            render(GatewayError::InvalidUpstream("ftp://10.1.2.3".to_string())).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["message"], "invalid upstream");

        let (_, body) = render(
            RouteError::NoUpstream {
                pattern: "^/secret".to_string(),
            }
            .into(),
        )
        .await;
        assert_eq!(body["message"], "invalid upstream");
    }
}
