//! Request-scoped context and the two halves of claim placement.
//!
//! Authentication stages claim values keyed by their outbound placement.
//! Forwarding later writes the staged values into the outbound request.
//! The token is verified only once.
use std::{collections::HashMap, net::SocketAddr};

use http::request::Parts;
use tracing::warn;
use uuid::Uuid;

use crate::{
    config::models::AuthSpec,
    core::{auth::Claims, placement::Placement},
};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Per-request state carried from the handler through authentication to
/// forwarding.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub request_id: String,
    pub client_addr: Option<SocketAddr>,
    staged: HashMap<Placement, String>,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>, client_addr: Option<SocketAddr>) -> Self {
        Self {
            request_id: request_id.into(),
            client_addr,
            staged: HashMap::new(),
        }
    }

    /// Reuse the inbound `X-Request-ID` when present.
    pub fn from_parts(parts: &Parts, client_addr: Option<SocketAddr>) -> Self {
        let request_id = parts
            .headers
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self::new(request_id, client_addr)
    }

    pub fn stage(&mut self, placement: Placement, value: impl Into<String>) {
        self.staged.insert(placement, value.into());
    }

    pub fn staged(&self, placement: &Placement) -> Option<&str> {
        self.staged.get(placement).map(String::as_str)
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }
}

/// Copy each mapped claim that is present and non-empty into the context.
pub fn stage_claims(spec: &AuthSpec, claims: &Claims, ctx: &mut RequestContext) {
    for (placement, claim_name) in &spec.claims {
        match claims.get(claim_name) {
            Some(value) if !value.is_empty() => ctx.stage(placement.clone(), value),
            _ => {}
        }
    }
}

/// Write staged values into the outbound request, replacing whatever the
/// caller sent at the same placement.
pub fn inject_claims(spec: &AuthSpec, ctx: &RequestContext, parts: &mut Parts) {
    for placement in spec.claims.keys() {
        let Some(value) = ctx.staged(placement) else {
            continue;
        };
        if let Err(e) = placement.write(parts, value) {
            warn!(
                request_id = %ctx.request_id,
                placement = %placement,
                error = %e,
                "Skipping claim that cannot be placed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::config::models::AuthKind;

    fn spec(entries: &[(&str, &str)]) -> AuthSpec {
        AuthSpec {
            kind: AuthKind::Jwt,
            source: Placement::Header("Authorization".to_string()),
            secret: "s".to_string(),
            claims: entries
                .iter()
                .map(|(placement, claim)| (Placement::parse(placement).unwrap(), claim.to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn claims(entries: &[(&str, &str)]) -> Claims {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn parts(uri: &str) -> Parts {
        http::Request::builder()
            .uri(uri)
            .header("X-User", "spoofed")
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    #[test]
    fn test_claim_reaches_outbound_header() {
        let spec = spec(&[("$header.X-User", "userName")]);
        let mut ctx = RequestContext::default();

        stage_claims(&spec, &claims(&[("userName", "alice")]), &mut ctx);
        let mut outbound = parts("/api/items");
        inject_claims(&spec, &ctx, &mut outbound);

        let values: Vec<_> = outbound.headers.get_all("x-user").iter().collect();
        assert_eq!(values, vec!["alice"]);
    }

    #[test]
    fn test_claim_reaches_outbound_query() {
        let spec = spec(&[("$query.uid", "uid")]);
        let mut ctx = RequestContext::default();

        stage_claims(&spec, &claims(&[("uid", "42")]), &mut ctx);
        let mut outbound = parts("/api/items?uid=1&x=y");
        inject_claims(&spec, &ctx, &mut outbound);

        assert_eq!(outbound.uri.query(), Some("x=y&uid=42"));
    }

    #[test]
    fn test_missing_and_empty_claims_are_not_staged() {
        let spec = spec(&[("$header.X-User", "userName"), ("$header.X-Role", "role")]);
        let mut ctx = RequestContext::default();

        stage_claims(&spec, &claims(&[("role", "")]), &mut ctx);
        assert_eq!(ctx.staged_len(), 0);

        let mut outbound = parts("/");
        inject_claims(&spec, &ctx, &mut outbound);
        assert_eq!(outbound.headers.get("x-user").unwrap(), "spoofed");
        assert!(outbound.headers.get("x-role").is_none());
    }

    #[test]
    fn test_unplaceable_value_is_skipped() {
        let spec = spec(&[("$header.X-User", "userName"), ("$query.uid", "uid")]);
        let mut ctx = RequestContext::default();

        stage_claims(
            &spec,
            &claims(&[("userName", "bad\nvalue"), ("uid", "7")]),
            &mut ctx,
        );
        let mut outbound = parts("/p");
        inject_claims(&spec, &ctx, &mut outbound);

        assert_eq!(outbound.headers.get("x-user").unwrap(), "spoofed");
        assert_eq!(outbound.uri.query(), Some("uid=7"));
    }

    #[test]
    fn test_request_id_is_reused_or_generated() {
        let with_id = http::Request::builder()
            .header("X-Request-ID", "req-1")
            .body(())
            .unwrap()
            .into_parts()
            .0;
        assert_eq!(RequestContext::from_parts(&with_id, None).request_id, "req-1");

        let without = parts("/");
        let generated = RequestContext::from_parts(&without, None).request_id;
        assert!(Uuid::parse_str(&generated).is_ok());
    }
}
