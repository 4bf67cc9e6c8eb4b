//! Token authentication.
//!
//! Token kinds form a closed set. [`Authenticator::from_spec`] dispatches on
//! the configured [`AuthKind`]; adding a kind means adding a variant here.
use std::collections::{HashMap, HashSet};

use http::request::Parts;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde_json::Value;
use thiserror::Error;

use crate::{
    config::models::{AuthKind, AuthSpec},
    core::placement::Placement,
};

const BEARER_PREFIX: &str = "Bearer ";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
}

/// Flat claim name -> string value map decoded from a verified token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Claims(HashMap<String, String>);

impl Claims {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Flatten decoded JSON claims. Nulls are dropped, strings are kept as-is
    /// and everything else is rendered as JSON text.
    fn from_json(raw: HashMap<String, Value>) -> Self {
        let flat = raw
            .into_iter()
            .filter_map(|(name, value)| match value {
                Value::Null => None,
                Value::String(text) => Some((name, text)),
                other => Some((name, other.to_string())),
            })
            .collect();
        Self(flat)
    }
}

impl FromIterator<(String, String)> for Claims {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

pub enum Authenticator {
    Jwt(JwtAuthenticator),
}

impl Authenticator {
    pub fn from_spec(spec: &AuthSpec) -> Self {
        match spec.kind {
            AuthKind::Jwt => Authenticator::Jwt(JwtAuthenticator::new(
                spec.source.clone(),
                spec.secret.as_bytes(),
            )),
        }
    }

    pub fn parse(&self, parts: &Parts) -> Result<Claims, AuthError> {
        match self {
            Authenticator::Jwt(jwt) => jwt.parse(parts),
        }
    }
}

/// HMAC-signed JWT read from a header or query parameter.
pub struct JwtAuthenticator {
    source: Placement,
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(source: Placement, secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];
        // exp and nbf are still checked when the token carries them.
        validation.required_spec_claims = HashSet::new();
        validation.validate_nbf = true;
        validation.validate_aud = false;

        Self {
            source,
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn parse(&self, parts: &Parts) -> Result<Claims, AuthError> {
        let raw = self.source.read(parts).unwrap_or_default();
        let token = raw.strip_prefix(BEARER_PREFIX).unwrap_or(&raw).trim();
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let data =
            jsonwebtoken::decode::<HashMap<String, Value>>(token, &self.key, &self.validation)?;
        Ok(Claims::from_json(data.claims))
    }
}
