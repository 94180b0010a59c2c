use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;

use wildwatch_core::config::{
    optional_trimmed, parse_bounded, required_trimmed, split_list, value_or_default, ConfigError,
    CoreConfig,
};

/// Origins allowed by the CORS layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedOrigins {
    Any,
    List(Vec<String>),
}

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub core: CoreConfig,
    pub jwt_secret: String,
    pub jwt_audience: Option<String>,
    pub auth_clock_skew: Duration,
    pub webhook_secret: Option<String>,
    pub allowed_origins: AllowedOrigins,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("core", &self.core)
            .field("jwt_secret", &"[REDACTED]")
            .field("jwt_audience", &self.jwt_audience)
            .field("auth_clock_skew", &self.auth_clock_skew)
            .field(
                "webhook_secret",
                &self.webhook_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("allowed_origins", &self.allowed_origins)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let core = CoreConfig::from_lookup(&lookup)?;
        let bind_addr = value_or_default(&lookup, "WILDWATCH_BIND_ADDR", "127.0.0.1:8000");

        let jwt_secret = required_trimmed(&lookup, "JWT_SECRET")?;
        if jwt_secret.len() < 16 {
            return Err(ConfigError::Invalid(
                "JWT_SECRET must be at least 16 characters".to_string(),
            ));
        }
        let jwt_audience = optional_trimmed(&lookup, "JWT_AUDIENCE");
        let auth_clock_skew_secs: u64 =
            parse_bounded(&lookup, "AUTH_CLOCK_SKEW_SECS", "60", 0..=300)?;

        let webhook_secret = optional_trimmed(&lookup, "KOBO_WEBHOOK_SECRET");

        let allowed_origins = match optional_trimmed(&lookup, "ALLOWED_ORIGINS").as_deref() {
            None | Some("*") => AllowedOrigins::Any,
            Some(list) => {
                let origins = split_list(list);
                if let Some(bad) = origins
                    .iter()
                    .find(|origin| !wildwatch_core::util::is_http_url(origin))
                {
                    return Err(ConfigError::Invalid(format!(
                        "ALLOWED_ORIGINS entry `{bad}` must start with http:// or https://"
                    )));
                }
                AllowedOrigins::List(origins)
            }
        };

        Ok(Self {
            bind_addr,
            core,
            jwt_secret,
            jwt_audience,
            auth_clock_skew: Duration::from_secs(auth_clock_skew_secs),
            webhook_secret,
            allowed_origins,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn config_requires_jwt_secret() {
        let err = load(&[("KOBO_API_TOKEN", "token")]).unwrap_err();
        assert!(err.to_string().contains("JWT_SECRET"));
    }

    #[test]
    fn config_redacts_sensitive_debug_fields() {
        let config = load(&[
            ("KOBO_API_TOKEN", "sensitive-kobo-token"),
            ("JWT_SECRET", "sensitive-jwt-secret-value"),
            ("KOBO_WEBHOOK_SECRET", "sensitive-webhook-secret"),
        ])
        .unwrap();

        let debug_output = format!("{config:?}");
        assert!(!debug_output.contains("sensitive-kobo-token"));
        assert!(!debug_output.contains("sensitive-jwt-secret-value"));
        assert!(!debug_output.contains("sensitive-webhook-secret"));
        assert!(debug_output.contains("[REDACTED]"));
        assert_eq!(config.bind_addr, "127.0.0.1:8000");
        assert_eq!(config.allowed_origins, AllowedOrigins::Any);
    }

    #[test]
    fn config_parses_origin_list() {
        let config = load(&[
            ("KOBO_API_TOKEN", "token"),
            ("JWT_SECRET", "0123456789abcdef"),
            ("ALLOWED_ORIGINS", "https://wildwatch.org, http://localhost:3000"),
        ])
        .unwrap();
        assert_eq!(
            config.allowed_origins,
            AllowedOrigins::List(vec![
                "https://wildwatch.org".to_string(),
                "http://localhost:3000".to_string()
            ])
        );

        let err = load(&[
            ("KOBO_API_TOKEN", "token"),
            ("JWT_SECRET", "0123456789abcdef"),
            ("ALLOWED_ORIGINS", "wildwatch.org"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("ALLOWED_ORIGINS"));
    }
}
