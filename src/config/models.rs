//! Configuration data structures for routegate.
//!
//! There are two configuration layers:
//! * [`GatewayConfig`] is loaded once at startup (file + environment) and is
//!   immutable afterwards.
//! * [`RouteTable`] is loaded per service from a directory of JSON files and is
//!   replaced wholesale whenever its file changes.
//!
//! Durations are written the human way (`"30s"`, `"500ms"`, `"1m 30s"`). Route
//! match patterns are compiled while decoding, so a table that made it into the
//! store never carries an invalid regular expression.
use std::{collections::BTreeMap, fmt, path::PathBuf, time::Duration};

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error as _};

use crate::core::placement::Placement;

/// Timeout applied when neither the gateway, the table nor the rule sets one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Serde adapter for `Duration` fields written as human readable strings.
pub mod duration_str {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim())
            .map_err(|e| D::Error::custom(format!("invalid duration '{raw}': {e}")))
    }
}

/// Same as [`duration_str`] for optional fields; an empty string means unset.
pub mod option_duration_str {
    use super::*;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => duration_str::serialize(duration, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(text) => humantime::parse_duration(text)
                .map(Some)
                .map_err(|e| D::Error::custom(format!("invalid duration '{text}': {e}"))),
        }
    }
}

/// Process-wide gateway configuration.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address the HTTP listener binds to
    pub listen_addr: String,
    /// Directory holding one `<service>.json` route table per service
    pub route_dir: PathBuf,
    /// Service names callers may address; anything else is "service not found"
    pub services: Vec<String>,
    /// Timeout used when neither the route table nor the rule sets one
    #[serde(with = "duration_str")]
    pub timeout: Duration,
    pub transport: TransportConfig,
    pub log: LogConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            route_dir: PathBuf::from("./content/proxy"),
            services: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            transport: TransportConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Upstream transport tuning.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// Upper bound for idle pooled connections
    pub max_idle_conns: usize,
    /// Idle pooled connections kept per upstream host
    pub max_idle_conns_per_host: usize,
    /// Concurrent exchanges per upstream host; 0 means unlimited
    pub max_conns_per_host: usize,
    #[serde(with = "duration_str")]
    pub idle_conn_timeout: Duration,
    #[serde(with = "duration_str")]
    pub dial_timeout: Duration,
    #[serde(with = "duration_str")]
    pub tls_handshake_timeout: Duration,
    /// TCP keep-alive interval
    #[serde(with = "duration_str")]
    pub keep_alive: Duration,
    #[serde(with = "duration_str")]
    pub response_header_timeout: Duration,
    /// Accepted for configuration compatibility; the hyper client sends
    /// request bodies without waiting for `100 Continue`.
    #[serde(with = "duration_str")]
    pub expect_continue_timeout: Duration,
    /// How long buffered response bytes may wait for more data before being
    /// flushed to the caller; zero flushes as soon as the upstream stalls
    #[serde(with = "duration_str")]
    pub flush_interval: Duration,
    /// Capacity in bytes of each pooled relay buffer
    pub buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_idle_conns: 500,
            max_idle_conns_per_host: 100,
            max_conns_per_host: 0,
            idle_conn_timeout: Duration::from_secs(60),
            dial_timeout: Duration::from_secs(5),
            tls_handshake_timeout: Duration::from_secs(5),
            keep_alive: Duration::from_secs(30),
            response_header_timeout: Duration::from_secs(4),
            expect_continue_timeout: Duration::from_secs(1),
            flush_interval: Duration::ZERO,
            buffer_size: 128 * 1024,
        }
    }
}

/// Logging output settings.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set
    pub level: String,
    /// JSON lines when true, human readable output otherwise
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

/// Routing rules and defaults for one service.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct RouteTable {
    /// Default upstream pool for rules that do not list their own
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proxy: Vec<String>,
    #[serde(
        default,
        with = "option_duration_str",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthSpec>,
    /// Rules in priority order; the first match wins
    #[serde(default)]
    pub routes: Vec<Route>,
}

impl RouteTable {
    /// Decode a table from the JSON route file format.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// A single routing rule.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Route {
    /// Regular expression tested against the request path
    #[serde(rename = "match", default)]
    pub pattern: PathPattern,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proxy: Vec<String>,
    #[serde(
        default,
        with = "option_duration_str",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub disable_auth: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthSpec>,
}

/// A compiled path pattern. The empty pattern never matches anything.
#[derive(Clone, Default)]
pub struct PathPattern(Option<Regex>);

impl PathPattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        if pattern.is_empty() {
            return Ok(Self(None));
        }
        Regex::new(pattern).map(|regex| Self(Some(regex)))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// Unanchored search; anchor with `^`/`$` in the pattern when needed.
    pub fn is_match(&self, path: &str) -> bool {
        self.0.as_ref().is_some_and(|regex| regex.is_match(path))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_ref().map_or("", Regex::as_str)
    }
}

impl PartialEq for PathPattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl fmt::Debug for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PathPattern({:?})", self.as_str())
    }
}

impl Serialize for PathPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PathPattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        PathPattern::new(&raw)
            .map_err(|e| D::Error::custom(format!("invalid match pattern '{raw}': {e}")))
    }
}

/// Token kinds understood by the authenticator.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    /// HMAC-signed JSON Web Token
    Jwt,
}

/// Authentication settings and the claim placement map.
#[derive(Serialize, Deserialize, Clone, PartialEq)]
pub struct AuthSpec {
    #[serde(rename = "type")]
    pub kind: AuthKind,
    /// Where the inbound token is read from
    pub source: Placement,
    #[serde(serialize_with = "redact")]
    pub secret: String,
    /// Outbound placement -> claim name
    #[serde(default)]
    pub claims: BTreeMap<Placement, String>,
}

impl fmt::Debug for AuthSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSpec")
            .field("kind", &self.kind)
            .field("source", &self.source)
            .field("secret", &"***")
            .field("claims", &self.claims)
            .finish()
    }
}

fn redact<S: Serializer>(_secret: &str, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str("***")
}
