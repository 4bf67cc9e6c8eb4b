//! Placement descriptors: `$header.<Name>`, `$query.<name>`, or a bare value.
//!
//! A placement names a slot in an HTTP request. The token source of an auth
//! spec is a placement, and so is every key of its claim map.
use std::{fmt, str::FromStr};

use http::{
    HeaderValue, Uri,
    header::HeaderName,
    request::Parts,
    uri::PathAndQuery,
};
use thiserror::Error;

const HEADER_PREFIX: &str = "$header.";
const QUERY_PREFIX: &str = "$query.";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlacementError {
    #[error("placement '{0}' has an unknown location (expected $header. or $query.)")]
    UnknownLocation(String),

    #[error("placement '{0}' has an empty name")]
    EmptyName(String),

    #[error("placement '{0}' is not a valid header name")]
    InvalidHeaderName(String),

    #[error("value for {placement} is not a valid header value")]
    InvalidHeaderValue { placement: String },

    #[error("rewritten request target is invalid: {0}")]
    InvalidUri(String),
}

/// A location in an HTTP request.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Placement {
    Header(String),
    Query(String),
    /// No recognized location prefix; reads and writes are no-ops.
    Bare(String),
}

impl Placement {
    pub fn parse(descriptor: &str) -> Result<Self, PlacementError> {
        if let Some(name) = descriptor.strip_prefix(HEADER_PREFIX) {
            if name.is_empty() {
                return Err(PlacementError::EmptyName(descriptor.to_string()));
            }
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| PlacementError::InvalidHeaderName(descriptor.to_string()))?;
            return Ok(Placement::Header(name.to_string()));
        }
        if let Some(name) = descriptor.strip_prefix(QUERY_PREFIX) {
            if name.is_empty() {
                return Err(PlacementError::EmptyName(descriptor.to_string()));
            }
            return Ok(Placement::Query(name.to_string()));
        }
        if descriptor.starts_with('$') {
            return Err(PlacementError::UnknownLocation(descriptor.to_string()));
        }
        Ok(Placement::Bare(descriptor.to_string()))
    }

    pub fn name(&self) -> &str {
        match self {
            Placement::Header(name) | Placement::Query(name) | Placement::Bare(name) => name,
        }
    }

    /// Read the first value at this placement. Bare placements read nothing.
    pub fn read(&self, parts: &Parts) -> Option<String> {
        match self {
            Placement::Header(name) => parts
                .headers
                .get(name.as_str())
                .and_then(|value| value.to_str().ok())
                .map(str::to_string),
            Placement::Query(name) => parts.uri.query().and_then(|query| {
                url::form_urlencoded::parse(query.as_bytes())
                    .find(|(key, _)| key == name.as_str())
                    .map(|(_, value)| value.into_owned())
            }),
            Placement::Bare(_) => None,
        }
    }

    /// Write `value` at this placement, replacing whatever is there.
    pub fn write(&self, parts: &mut Parts, value: &str) -> Result<(), PlacementError> {
        match self {
            Placement::Header(name) => {
                let header = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|_| PlacementError::InvalidHeaderName(self.to_string()))?;
                let value = HeaderValue::from_str(value).map_err(|_| {
                    PlacementError::InvalidHeaderValue {
                        placement: self.to_string(),
                    }
                })?;
                parts.headers.insert(header, value);
                Ok(())
            }
            Placement::Query(name) => set_query_param(parts, name, value),
            Placement::Bare(_) => Ok(()),
        }
    }
}

fn set_query_param(parts: &mut Parts, name: &str, value: &str) -> Result<(), PlacementError> {
    let existing = parts.uri.query().unwrap_or_default();
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, current) in url::form_urlencoded::parse(existing.as_bytes()) {
        if key != name {
            serializer.append_pair(&key, &current);
        }
    }
    serializer.append_pair(name, value);
    let query = serializer.finish();

    let path_and_query = format!("{}?{}", parts.uri.path(), query);
    let mut uri_parts = parts.uri.clone().into_parts();
    uri_parts.path_and_query = Some(
        PathAndQuery::from_str(&path_and_query)
            .map_err(|e| PlacementError::InvalidUri(e.to_string()))?,
    );
    parts.uri = Uri::from_parts(uri_parts).map_err(|e| PlacementError::InvalidUri(e.to_string()))?;
    Ok(())
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Placement::Header(name) => write!(f, "{HEADER_PREFIX}{name}"),
            Placement::Query(name) => write!(f, "{QUERY_PREFIX}{name}"),
            Placement::Bare(name) => f.write_str(name),
        }
    }
}

impl FromStr for Placement {
    type Err = PlacementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Placement::parse(s)
    }
}

impl TryFrom<String> for Placement {
    type Error = PlacementError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Placement::parse(&value)
    }
}

impl From<Placement> for String {
    fn from(value: Placement) -> Self {
        value.to_string()
    }
}

impl serde::Serialize for Placement {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Placement {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Placement::parse(&raw).map_err(serde::de::Error::custom)
    }
}
