//! Configuration for the certfleet daemon
//!
//! Supports TOML configuration files, environment variable overrides
//! (`CERTFLEET_*`), `${VAR}` expansion in values, validation and defaults.

use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeSettings,

    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub acme: AcmeSettings,

    #[serde(default)]
    pub renewal: RenewalSettings,

    #[serde(default)]
    pub scheduler: SchedulerSettings,
}

/// Node identity settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Display name; the hostname is used when empty
    #[serde(default)]
    pub name: String,
}

/// Shared store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// etcd endpoints
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    /// Root prefix under which all platform keys live
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// TTL of the shared lock session in seconds
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
}

/// ACME settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeSettings {
    /// Operator contact for CA registration
    #[serde(default)]
    pub contact_email: String,

    /// Use the CA staging environment
    #[serde(default)]
    pub staging: bool,

    /// Custom directory URL (overrides `staging`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory_url: Option<String>,

    /// Directory for issued certificate files and the account key
    #[serde(default = "default_cert_dir")]
    pub cert_dir: String,
}

/// Renewal settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewalSettings {
    /// Interval of the periodic certificate check in seconds
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Delay before the first check after startup, in seconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,

    /// Per-run timeout of the check task in seconds
    #[serde(default = "default_check_timeout")]
    pub check_timeout_secs: u64,

    /// Days before expiry at which a certificate becomes eligible for
    /// renewal. Default 30.
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: i64,
}

/// Scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Worker pool size per node
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

// Default values
fn default_endpoints() -> Vec<String> {
    vec!["http://127.0.0.1:2379".to_string()]
}

fn default_namespace() -> String {
    "/certfleet/".to_string()
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_session_ttl() -> u64 {
    30
}

fn default_cert_dir() -> String {
    "/var/lib/certfleet/certs".to_string()
}

fn default_check_interval() -> u64 {
    24 * 3600
}

fn default_initial_delay() -> u64 {
    60
}

fn default_check_timeout() -> u64 {
    10 * 60
}

fn default_renew_before_days() -> i64 {
    30
}

fn default_max_workers() -> usize {
    8
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            namespace: default_namespace(),
            connect_timeout_secs: default_connect_timeout(),
            session_ttl_secs: default_session_ttl(),
        }
    }
}

impl Default for AcmeSettings {
    fn default() -> Self {
        Self {
            contact_email: String::new(),
            staging: false,
            directory_url: None,
            cert_dir: default_cert_dir(),
        }
    }
}

impl Default for RenewalSettings {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            initial_delay_secs: default_initial_delay(),
            check_timeout_secs: default_check_timeout(),
            renew_before_days: default_renew_before_days(),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeSettings::default(),
            store: StoreSettings::default(),
            acme: AcmeSettings::default(),
            renewal: RenewalSettings::default(),
            scheduler: SchedulerSettings::default(),
        }
    }
}

impl Config {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| FleetError::configuration(format!("failed to read config file: {e}")))?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| FleetError::configuration(format!("failed to parse TOML: {e}")))
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(endpoints) = env::var("CERTFLEET_STORE_ENDPOINTS") {
            self.store.endpoints = Self::expand_env_var(&endpoints)?
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(namespace) = env::var("CERTFLEET_STORE_NAMESPACE") {
            self.store.namespace = namespace;
        }
        if let Ok(email) = env::var("CERTFLEET_ACME_CONTACT_EMAIL") {
            self.acme.contact_email = email;
        }
        if let Ok(staging) = env::var("CERTFLEET_ACME_STAGING") {
            self.acme.staging = staging == "1" || staging.eq_ignore_ascii_case("true");
        }
        if let Ok(dir) = env::var("CERTFLEET_ACME_CERT_DIR") {
            self.acme.cert_dir = Self::expand_env_var(&dir)?;
        }
        if let Ok(interval) = env::var("CERTFLEET_RENEWAL_CHECK_INTERVAL") {
            if let Ok(secs) = interval.parse::<u64>() {
                self.renewal.check_interval_secs = secs;
            }
        }
        if let Ok(days) = env::var("CERTFLEET_RENEWAL_BEFORE_DAYS") {
            if let Ok(d) = days.parse::<i64>() {
                self.renewal.renew_before_days = d;
            }
        }
        if let Ok(workers) = env::var("CERTFLEET_SCHEDULER_MAX_WORKERS") {
            if let Ok(w) = workers.parse::<usize>() {
                self.scheduler.max_workers = w;
            }
        }
        Ok(())
    }

    /// Expand environment variables in format ${VAR}
    pub fn expand_env_var(value: &str) -> Result<String> {
        let re = regex::Regex::new(r"\$\{([^}]+)\}")
            .map_err(|_| FleetError::configuration("invalid expansion pattern"))?;
        let result = re
            .replace_all(value, |caps: &regex::Captures| {
                let var_name = &caps[1];
                env::var(var_name).unwrap_or_else(|_| format!("${{{var_name}}}"))
            })
            .to_string();
        Ok(result)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.store.endpoints.is_empty() {
            return Err(FleetError::configuration(
                "at least one store endpoint is required",
            ));
        }
        if !self.store.namespace.starts_with('/') {
            return Err(FleetError::configuration(
                "store namespace must start with '/'",
            ));
        }
        if self.store.session_ttl_secs == 0 {
            return Err(FleetError::configuration(
                "session TTL must be greater than 0",
            ));
        }
        if self.acme.cert_dir.is_empty() {
            return Err(FleetError::configuration(
                "certificate directory cannot be empty",
            ));
        }
        if self.renewal.renew_before_days < 1 {
            return Err(FleetError::configuration(
                "renew_before_days must be at least 1",
            ));
        }
        if self.renewal.check_interval_secs == 0 {
            return Err(FleetError::configuration(
                "check interval must be greater than 0",
            ));
        }
        if self.scheduler.max_workers == 0 {
            return Err(FleetError::configuration(
                "max_workers must be at least 1",
            ));
        }
        Ok(())
    }

    /// Connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.store.connect_timeout_secs)
    }

    /// Shared session TTL as Duration
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.store.session_ttl_secs)
    }

    /// Renewal check interval as Duration
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.renewal.check_interval_secs)
    }

    /// Initial check delay as Duration
    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.renewal.initial_delay_secs)
    }

    /// Per-run check timeout as Duration
    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.renewal.check_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.store.namespace, "/certfleet/");
        assert_eq!(config.renewal.renew_before_days, 30);
        assert_eq!(config.renewal.check_interval_secs, 86400);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
[store]
endpoints = ["http://etcd-1:2379", "http://etcd-2:2379"]
namespace = "/tls/"

[acme]
contact_email = "ops@example.com"
staging = true

[renewal]
check_interval_secs = 43200
renew_before_days = 10
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.store.endpoints.len(), 2);
        assert_eq!(config.store.namespace, "/tls/");
        assert!(config.acme.staging);
        assert_eq!(config.renewal.renew_before_days, 10);
        assert_eq!(config.renewal.check_timeout_secs, 600);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.store.endpoints.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.renewal.renew_before_days = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.store.namespace = "no-slash".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        temp_env::with_vars(
            [
                (
                    "CERTFLEET_STORE_ENDPOINTS",
                    Some("http://a:2379, http://b:2379"),
                ),
                ("CERTFLEET_RENEWAL_BEFORE_DAYS", Some("15")),
            ],
            || {
                let mut config = Config::default();
                config.apply_env_overrides().unwrap();
                assert_eq!(
                    config.store.endpoints,
                    vec!["http://a:2379".to_string(), "http://b:2379".to_string()]
                );
                assert_eq!(config.renewal.renew_before_days, 15);
            },
        );
    }

    #[test]
    fn test_expand_env_var() {
        temp_env::with_var("CF_TEST_DIR", Some("/srv/certs"), || {
            let result = Config::expand_env_var("${CF_TEST_DIR}/live").unwrap();
            assert_eq!(result, "/srv/certs/live");
        });
    }
}
