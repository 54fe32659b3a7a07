//! Client configuration and loading logic

use crate::model::ModelIdentity;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Settings for a model client, loadable from TOML
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// `scheme://host[:port]`; scheme is `http` or `grpc`
    pub url: String,
    pub model_name: String,
    /// Latest version when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    /// Defer the readiness wait and config fetch until first use
    pub lazy_init: bool,
    pub init_timeout_s: f64,
    pub inference_timeout_s: f64,
    pub connection_timeout_s: f64,
    /// Concurrent transport calls of the futures client
    pub max_workers: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            model_name: String::new(),
            model_version: None,
            lazy_init: true,
            init_timeout_s: default_init_timeout(),
            inference_timeout_s: default_inference_timeout(),
            connection_timeout_s: default_connection_timeout(),
            max_workers: default_max_workers(),
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            model_name: model_name.into(),
            ..Default::default()
        }
    }

    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(url) = std::env::var("INFER_CLIENT_URL") {
            config.url = url;
        }
        if let Ok(name) = std::env::var("INFER_CLIENT_MODEL_NAME") {
            config.model_name = name;
        }
        if let Ok(version) = std::env::var("INFER_CLIENT_MODEL_VERSION") {
            config.model_version = Some(version).filter(|v| !v.is_empty());
        }
        if let Ok(timeout) = std::env::var("INFER_CLIENT_INIT_TIMEOUT") {
            config.init_timeout_s = timeout
                .parse()
                .context("Invalid INFER_CLIENT_INIT_TIMEOUT value")?;
        }
        if let Ok(timeout) = std::env::var("INFER_CLIENT_INFERENCE_TIMEOUT") {
            config.inference_timeout_s = timeout
                .parse()
                .context("Invalid INFER_CLIENT_INFERENCE_TIMEOUT value")?;
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        crate::endpoint::Endpoint::parse(&self.url).context("Invalid server url")?;
        self.identity().context("Invalid model identity")?;

        for (name, value) in [
            ("init_timeout_s", self.init_timeout_s),
            ("inference_timeout_s", self.inference_timeout_s),
            ("connection_timeout_s", self.connection_timeout_s),
        ] {
            if !value.is_finite() || value <= 0.0 {
                anyhow::bail!("{} must be a positive number of seconds (got {})", name, value);
            }
            if value > MAX_TIMEOUT_S {
                anyhow::bail!(
                    "{} must be at most {} seconds (got {})",
                    name,
                    MAX_TIMEOUT_S,
                    value
                );
            }
        }

        if self.max_workers == 0 {
            anyhow::bail!("max_workers must be at least 1");
        }

        Ok(())
    }

    pub fn identity(&self) -> crate::error::ClientResult<ModelIdentity> {
        ModelIdentity::new(self.model_name.clone(), self.model_version.clone())
    }

    /// Timeouts and init policy for a client built from this config
    pub fn options(&self) -> ClientOptions {
        ClientOptions {
            lazy_init: self.lazy_init,
            init_timeout: seconds(self.init_timeout_s),
            inference_timeout: seconds(self.inference_timeout_s),
            connection_timeout: seconds(self.connection_timeout_s),
        }
    }
}

/// Per-client timeouts; each applies to one logical operation independently
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClientOptions {
    pub lazy_init: bool,
    pub init_timeout: Duration,
    pub inference_timeout: Duration,
    pub connection_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientConfig::default().options()
    }
}

/// Longest accepted timeout, one year
const MAX_TIMEOUT_S: f64 = 365.0 * 24.0 * 3600.0;

fn seconds(value: f64) -> Duration {
    let max = Duration::from_secs_f64(MAX_TIMEOUT_S);
    Duration::try_from_secs_f64(value).map_or(max, |duration| duration.min(max))
}

// Default functions
fn default_url() -> String {
    "http://localhost:8000".to_string()
}
fn default_init_timeout() -> f64 {
    300.0
}
fn default_inference_timeout() -> f64 {
    60.0
}
fn default_connection_timeout() -> f64 {
    60.0
}
fn default_max_workers() -> usize {
    128
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn clear_env() {
        // SAFETY: tests touching the environment run serially
        unsafe {
            for key in [
                "INFER_CLIENT_URL",
                "INFER_CLIENT_MODEL_NAME",
                "INFER_CLIENT_MODEL_VERSION",
                "INFER_CLIENT_INIT_TIMEOUT",
                "INFER_CLIENT_INFERENCE_TIMEOUT",
            ] {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.url, "http://localhost:8000");
        assert!(config.lazy_init);
        assert_eq!(config.init_timeout_s, 300.0);
        assert_eq!(config.inference_timeout_s, 60.0);
        assert_eq!(config.max_workers, 128);

        let options = config.options();
        assert_eq!(options.inference_timeout, Duration::from_secs(60));
        assert_eq!(options.connection_timeout, Duration::from_secs(60));
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        clear_env();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
url = "grpc://triton:8001"
model_name = "add_sub"
model_version = "2"
lazy_init = false
inference_timeout_s = 2.5
"#
        )
        .unwrap();

        let config = ClientConfig::load(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.url, "grpc://triton:8001");
        assert_eq!(config.model_version.as_deref(), Some("2"));
        assert!(!config.lazy_init);
        assert_eq!(config.options().inference_timeout, Duration::from_millis(2500));
        // Unset fields keep defaults
        assert_eq!(config.init_timeout_s, 300.0);
        config.validate().unwrap();
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        unsafe {
            std::env::set_var("INFER_CLIENT_URL", "http://other:9000");
            std::env::set_var("INFER_CLIENT_MODEL_NAME", "identity");
            std::env::set_var("INFER_CLIENT_INIT_TIMEOUT", "1.5");
        }

        let config = ClientConfig::load(None).unwrap();
        clear_env();

        assert_eq!(config.url, "http://other:9000");
        assert_eq!(config.model_name, "identity");
        assert_eq!(config.init_timeout_s, 1.5);
    }

    #[test]
    #[serial]
    fn test_invalid_env_value() {
        clear_env();
        unsafe {
            std::env::set_var("INFER_CLIENT_INFERENCE_TIMEOUT", "soon");
        }
        let result = ClientConfig::load(None);
        clear_env();
        assert!(result.is_err());
    }

    #[test]
    fn test_validation() {
        assert!(ClientConfig::new("http://localhost:8000", "m").validate().is_ok());
        assert!(ClientConfig::new("ftp://localhost:8000", "m").validate().is_err());
        assert!(ClientConfig::new("http://localhost:8000", "").validate().is_err());

        let config = ClientConfig {
            model_version: Some("v1".to_string()),
            ..ClientConfig::new("http://localhost:8000", "m")
        };
        assert!(config.validate().is_err());

        let config = ClientConfig {
            inference_timeout_s: 0.0,
            ..ClientConfig::new("http://localhost:8000", "m")
        };
        assert!(config.validate().is_err());

        let config = ClientConfig {
            max_workers: 0,
            ..ClientConfig::new("http://localhost:8000", "m")
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_huge_timeouts_rejected_and_clamped() {
        let config = ClientConfig {
            init_timeout_s: 1e300,
            ..ClientConfig::new("http://localhost:8000", "m")
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("init_timeout_s"));

        // Unvalidated configs still yield a usable duration
        let year = Duration::from_secs(365 * 24 * 3600);
        assert_eq!(config.options().init_timeout, year);

        let config = ClientConfig {
            connection_timeout_s: MAX_TIMEOUT_S,
            ..ClientConfig::new("http://localhost:8000", "m")
        };
        assert!(config.validate().is_ok());
    }
}
