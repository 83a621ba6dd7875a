//! TOML-based service configuration.

use std::env;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::Deserialize;

/// Top-level service configuration parsed from TOML.
///
/// All fields have defaults, so a missing file or an empty document yields a
/// runnable development setup. Connector secrets can be supplied through the
/// environment instead of the file (see [`ServiceConfig::apply_env_overrides`]).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// HTTP server binding.
    pub server: ServerConfig,
    /// Log output settings.
    pub logging: LoggingConfig,
    /// Market computation tuning.
    pub market: MarketConfig,
    /// Dataspace connector endpoints and credentials.
    pub dataspace: DataspaceConfig,
}

/// HTTP server binding.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Directory for rotated log files; empty disables file output.
    pub directory: String,
    /// Default filter when `RUST_LOG` is not set.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: String::new(),
            filter: "rec_lem_api=info".to_string(),
        }
    }
}

/// Market computation tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MarketConfig {
    /// Cap on iterative pricing rounds.
    pub max_iterations: usize,
    /// Convergence threshold on the per-interval price movement, EUR/kWh.
    pub convergence_eps: f64,
    /// Increment added on top of the crossing price, EUR/kWh.
    pub crossing_increment: f64,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            convergence_eps: 1e-3,
            crossing_increment: 0.0,
        }
    }
}

/// Dataspace connector endpoints and credentials.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DataspaceConfig {
    pub indata: IndataConfig,
    pub sel: SelConfig,
    pub pvgis: PvgisConfig,
}

/// IN-DATA connector settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IndataConfig {
    pub base_url: String,
    /// Metering endpoint path on the connector.
    pub endpoint: String,
    /// Access token; normally provided via `RECLEM_INDATA_TOKEN`.
    pub token: String,
}

impl Default for IndataConfig {
    fn default() -> Self {
        Self {
            base_url: "https://connector-sentinel.enershare.inesctec.pt".to_string(),
            endpoint: "/dataspace/inesctec/observed/ceve_living-lab/metering/energy".to_string(),
            token: String::new(),
        }
    }
}

/// Smart Energy Lab connector settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SelConfig {
    pub base_url: String,
    /// Token endpoint of the back office.
    pub token_url: String,
    /// Account credentials; normally provided via `RECLEM_SEL_EMAIL` and
    /// `RECLEM_SEL_PASSWORD`.
    pub email: String,
    pub password: String,
}

impl Default for SelConfig {
    fn default() -> Self {
        Self {
            base_url: "https://enershare.smartenergylab.pt".to_string(),
            token_url: "https://backoffice.smartenergylab.pt/api/token/".to_string(),
            email: String::new(),
            password: String::new(),
        }
    }
}

/// PVGIS service settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PvgisConfig {
    pub base_url: String,
}

impl Default for PvgisConfig {
    fn default() -> Self {
        Self {
            base_url: "https://re.jrc.ec.europa.eu/api/v5_2".to_string(),
        }
    }
}

/// Configuration error with field path and constraint description.
#[derive(Debug)]
pub struct ConfigError {
    /// Dotted field path (e.g., `"market.max_iterations"`).
    pub field: String,
    /// Human-readable constraint description.
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config error: {} — {}", self.field, self.message)
    }
}

impl ServiceConfig {
    /// Parses the configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file cannot be read or the TOML is
    /// invalid.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError {
            field: "config".to_string(),
            message: format!("cannot read \"{}\": {e}", path.display()),
        })?;
        Self::from_toml_str(&content)
    }

    /// Parses the configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the TOML is invalid or contains unknown
    /// fields.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError {
            field: "toml".to_string(),
            message: e.to_string(),
        })
    }

    /// Overrides connector secrets from the environment, when set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(token) = env::var("RECLEM_INDATA_TOKEN") {
            self.dataspace.indata.token = token;
        }
        if let Ok(email) = env::var("RECLEM_SEL_EMAIL") {
            self.dataspace.sel.email = email;
        }
        if let Ok(password) = env::var("RECLEM_SEL_PASSWORD") {
            self.dataspace.sel.password = password;
        }
    }

    /// Validates all fields and returns a list of errors.
    ///
    /// Returns an empty vector if configuration is valid.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.server.host.is_empty() {
            errors.push(ConfigError {
                field: "server.host".into(),
                message: "must not be empty".into(),
            });
        }

        let m = &self.market;
        if m.max_iterations == 0 {
            errors.push(ConfigError {
                field: "market.max_iterations".into(),
                message: "must be > 0".into(),
            });
        }
        if m.convergence_eps <= 0.0 {
            errors.push(ConfigError {
                field: "market.convergence_eps".into(),
                message: "must be > 0".into(),
            });
        }
        if m.crossing_increment < 0.0 {
            errors.push(ConfigError {
                field: "market.crossing_increment".into(),
                message: "must be >= 0".into(),
            });
        }

        for (field, url) in [
            ("dataspace.indata.base_url", &self.dataspace.indata.base_url),
            ("dataspace.sel.base_url", &self.dataspace.sel.base_url),
            ("dataspace.sel.token_url", &self.dataspace.sel.token_url),
            ("dataspace.pvgis.base_url", &self.dataspace.pvgis.base_url),
        ] {
            if url.is_empty() {
                errors.push(ConfigError {
                    field: field.into(),
                    message: "must not be empty".into(),
                });
            }
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = ServiceConfig::default();
        let errors = cfg.validate();
        assert!(errors.is_empty(), "defaults should be valid: {errors:?}");
    }

    #[test]
    fn valid_toml_parses() {
        let toml = r#"
[server]
host = "0.0.0.0"
port = 80

[logging]
directory = "logs"
filter = "rec_lem_api=debug"

[market]
max_iterations = 20
convergence_eps = 0.0005
crossing_increment = 0.001

[dataspace.indata]
base_url = "http://localhost:9001"
endpoint = "/metering/energy"
token = "secret"

[dataspace.sel]
base_url = "http://localhost:9002"
token_url = "http://localhost:9002/api/token/"
email = "ops@example.org"
password = "secret"

[dataspace.pvgis]
base_url = "http://localhost:9003"
"#;
        let cfg = ServiceConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.server.port, 80);
        assert_eq!(cfg.market.max_iterations, 20);
        assert_eq!(cfg.dataspace.indata.token, "secret");
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let cfg = ServiceConfig::from_toml_str("[server]\nport = 9000\n").unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.market.max_iterations, 10);
    }

    #[test]
    fn unknown_field_is_rejected() {
        let result = ServiceConfig::from_toml_str("[server]\nbogus = true\n");
        assert!(result.is_err());
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("service.toml");
        std::fs::write(&path, "[server]\nport = 8080\n").unwrap();
        let cfg = ServiceConfig::from_toml_file(&path).unwrap();
        assert_eq!(cfg.server.port, 8080);
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = ServiceConfig::from_toml_file(Path::new("/does/not/exist.toml")).unwrap_err();
        assert!(err.message.contains("cannot read"));
    }

    #[test]
    fn validation_catches_zero_iterations() {
        let mut cfg = ServiceConfig::default();
        cfg.market.max_iterations = 0;
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "market.max_iterations"));
    }

    #[test]
    fn validation_catches_empty_url() {
        let mut cfg = ServiceConfig::default();
        cfg.dataspace.pvgis.base_url.clear();
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "dataspace.pvgis.base_url"));
    }
}
