use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::GatewayConfig;

/// Environment variables with this prefix override file values, e.g.
/// `ROUTEGATE__TRANSPORT__BUFFER_SIZE=65536`.
pub const ENV_PREFIX: &str = "ROUTEGATE";
const ENV_SEPARATOR: &str = "__";

/// Load configuration from a file using the config crate, then apply
/// environment overrides. Supports YAML, JSON, TOML and INI.
pub async fn load_config(config_path: &str) -> Result<GatewayConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: &str) -> Result<GatewayConfig> {
    load_with_env(config_path, None)
}

/// Load with an explicit environment map instead of the process environment.
pub fn load_with_env(
    config_path: &str,
    env: Option<config::Map<String, String>>,
) -> Result<GatewayConfig> {
    let config_path = Path::new(config_path);

    // Determine file format based on extension
    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Yaml, // Default to YAML
    };

    let environment = Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_SEPARATOR)
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("services")
        .source(env);

    let settings = Config::builder()
        .add_source(File::new(
            config_path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
            format,
        ))
        .add_source(environment)
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    let gateway_config: GatewayConfig = settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })?;

    Ok(gateway_config)
}

/// Sample configuration written by `routegate init`.
pub const SAMPLE_CONFIG: &str = r#"listen_addr: "0.0.0.0:8080"
route_dir: "./content/proxy"
services:
  - orders
timeout: "30s"
transport:
  max_idle_conns: 500
  max_idle_conns_per_host: 100
  max_conns_per_host: 0
  idle_conn_timeout: "60s"
  dial_timeout: "5s"
  tls_handshake_timeout: "5s"
  keep_alive: "30s"
  response_header_timeout: "4s"
  expect_continue_timeout: "1s"
  flush_interval: "0s"
  buffer_size: 131072
log:
  level: "info"
  json: true
"#;

/// Sample route table written next to [`SAMPLE_CONFIG`].
pub const SAMPLE_ROUTE_TABLE: &str = r#"{
  "proxy": ["http://127.0.0.1:9000"],
  "timeout": "30s",
  "routes": [
    {"match": "^/api/.*", "timeout": "5s"}
  ]
}
"#;
