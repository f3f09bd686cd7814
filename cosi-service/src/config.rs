//! Service configuration
//!
//! Loaded from environment variables with the `COSI_` prefix.

use std::env;
use std::time::Duration;

use cosi_protocol::{DEFAULT_PROTOCOL_NAME, DEFAULT_SUBPROTOCOL_NAME, DEFAULT_TIMEOUT};
use serde::{Deserialize, Serialize};

use crate::error::{ServiceError, ServiceResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Global timeout of a signing round in milliseconds
    pub timeout_ms: u64,
    /// Required signatures; `None` means `n - (n - 1) / 3`
    pub threshold: Option<usize>,
    /// Number of subtrees; `None` means `sqrt(n - 1)`
    pub nsubtrees: Option<usize>,
    pub protocol_name: String,
    pub subprotocol_name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
            threshold: None,
            nsubtrees: None,
            protocol_name: DEFAULT_PROTOCOL_NAME.to_string(),
            subprotocol_name: DEFAULT_SUBPROTOCOL_NAME.to_string(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> ServiceResult<Self> {
        let defaults = Self::default();

        let config = Self {
            timeout_ms: parse_var("COSI_TIMEOUT_MS")?.unwrap_or(defaults.timeout_ms),
            threshold: parse_var("COSI_THRESHOLD")?,
            nsubtrees: parse_var("COSI_NSUBTREES")?,
            protocol_name: env::var("COSI_PROTOCOL").unwrap_or(defaults.protocol_name),
            subprotocol_name: env::var("COSI_SUBPROTOCOL").unwrap_or(defaults.subprotocol_name),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ServiceResult<()> {
        if self.timeout_ms == 0 {
            return Err(ServiceError::Config("timeout must be positive".to_string()));
        }
        if self.threshold == Some(0) {
            return Err(ServiceError::Config("threshold must be positive".to_string()));
        }
        if self.nsubtrees == Some(0) {
            return Err(ServiceError::Config(
                "number of subtrees must be positive".to_string(),
            ));
        }
        if self.protocol_name.is_empty() || self.subprotocol_name.is_empty() {
            return Err(ServiceError::Config(
                "protocol names cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> ServiceResult<Option<T>> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ServiceError::Config(format!("invalid value for {}: {}", name, value))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServiceConfig::default();
        assert_eq!(config.timeout(), DEFAULT_TIMEOUT);
        assert_eq!(config.threshold, None);
        assert_eq!(config.protocol_name, DEFAULT_PROTOCOL_NAME);
        assert!(config.validate().is_ok());
    }

    // One test touches the environment so parallel tests do not race on it
    #[test]
    fn test_from_env() {
        env::set_var("COSI_TIMEOUT_MS", "2500");
        env::set_var("COSI_THRESHOLD", "7");
        env::remove_var("COSI_NSUBTREES");
        let config = ServiceConfig::from_env().unwrap();
        assert_eq!(config.timeout(), Duration::from_millis(2500));
        assert_eq!(config.threshold, Some(7));
        assert_eq!(config.nsubtrees, None);

        env::set_var("COSI_THRESHOLD", "seven");
        assert!(matches!(
            ServiceConfig::from_env(),
            Err(ServiceError::Config(_))
        ));

        env::set_var("COSI_THRESHOLD", "0");
        assert!(ServiceConfig::from_env().is_err());

        env::remove_var("COSI_TIMEOUT_MS");
        env::remove_var("COSI_THRESHOLD");
    }

    #[test]
    fn test_config_serde() {
        let config = ServiceConfig {
            threshold: Some(3),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ServiceConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
