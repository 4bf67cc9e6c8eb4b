use std::{collections::HashSet, net::SocketAddr};

use crate::config::models::{AuthSpec, GatewayConfig, RouteTable};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Validator for the gateway process configuration and per-service route tables
pub struct GatewayConfigValidator;

impl GatewayConfigValidator {
    /// Validate the gateway configuration
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if config.route_dir.as_os_str().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "route_dir".to_string(),
            });
        }

        if config.services.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "services".to_string(),
            });
        }
        let mut seen = HashSet::new();
        for service in &config.services {
            if let Err(e) = Self::validate_service_name(service) {
                errors.push(e);
            }
            if !seen.insert(service.as_str()) {
                errors.push(ValidationError::InvalidField {
                    field: "services".to_string(),
                    message: format!("Duplicate service '{service}'"),
                });
            }
        }

        if config.transport.buffer_size == 0 {
            errors.push(ValidationError::InvalidField {
                field: "transport.buffer_size".to_string(),
                message: "Buffer size must be greater than 0".to_string(),
            });
        }
        if config.transport.max_idle_conns_per_host > config.transport.max_idle_conns {
            errors.push(ValidationError::InvalidField {
                field: "transport.max_idle_conns_per_host".to_string(),
                message: format!(
                    "Cannot exceed max_idle_conns ({})",
                    config.transport.max_idle_conns
                ),
            });
        }
        for (field, value) in [
            ("transport.dial_timeout", config.transport.dial_timeout),
            (
                "transport.tls_handshake_timeout",
                config.transport.tls_handshake_timeout,
            ),
            (
                "transport.response_header_timeout",
                config.transport.response_header_timeout,
            ),
        ] {
            if value.is_zero() {
                errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: "Timeout must be greater than 0".to_string(),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate a route table loaded for `service`.
    ///
    /// Decoding already guarantees compiled patterns and known auth kinds; this
    /// checks what serde cannot.
    pub fn validate_route_table(service: &str, table: &RouteTable) -> ValidationResult<()> {
        let mut errors = Vec::new();

        for (i, upstream) in table.proxy.iter().enumerate() {
            if let Err(e) = Self::validate_url(upstream, &format!("{service}.proxy[{i}]")) {
                errors.push(e);
            }
        }
        if let Some(auth) = &table.auth {
            Self::validate_auth(auth, &format!("{service}.auth"), &mut errors);
        }

        for (i, route) in table.routes.iter().enumerate() {
            let context = format!("{service}.routes[{i}]");
            if route.pattern.is_empty() {
                continue;
            }
            if route.proxy.is_empty() && table.proxy.is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("{context}.proxy"),
                });
            }
            for (j, upstream) in route.proxy.iter().enumerate() {
                if let Err(e) = Self::validate_url(upstream, &format!("{context}.proxy[{j}]")) {
                    errors.push(e);
                }
            }
            if let Some(auth) = &route.auth {
                Self::validate_auth(auth, &format!("{context}.auth"), &mut errors);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    /// Service names become a path segment and a file stem.
    fn validate_service_name(name: &str) -> ValidationResult<()> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if valid {
            Ok(())
        } else {
            Err(ValidationError::InvalidField {
                field: format!("services: '{name}'"),
                message: "Service names may only contain letters, digits, '-', '_' and '.'"
                    .to_string(),
            })
        }
    }

    fn validate_auth(auth: &AuthSpec, context: &str, errors: &mut Vec<ValidationError>) {
        if auth.secret.is_empty() {
            errors.push(ValidationError::MissingField {
                field: format!("{context}.secret"),
            });
        }
        for (placement, claim) in &auth.claims {
            if claim.is_empty() {
                errors.push(ValidationError::InvalidField {
                    field: format!("{context}.claims[{placement}]"),
                    message: "Claim name must not be empty".to_string(),
                });
            }
        }
    }

    /// Validate URL format
    fn validate_url(url_str: &str, context: &str) -> ValidationResult<()> {
        match url::Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: format!(
                            "URL scheme must be 'http' or 'https', got '{}'",
                            url.scheme()
                        ),
                    });
                }

                if url.host().is_none() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "URL must have a valid host".to_string(),
                    });
                }

                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid URL format: {e}"),
            }),
        }
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.is_empty() {
            return "No errors".to_string();
        }

        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
