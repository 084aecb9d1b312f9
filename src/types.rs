//! Persisted entities and the domain-matching rules shared by the manager
//! and the deployers. All entities serialize to JSON with the field names
//! used in the shared store.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};

static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\*\.)?([A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?\.)+[A-Za-z]{2,63}$")
        .expect("domain pattern is valid")
});

/// Syntactic domain validation. Accepts a single leading wildcard label.
pub fn is_valid_domain(domain: &str) -> bool {
    domain.len() <= 253 && DOMAIN_RE.is_match(domain)
}

/// Whether a domain is a wildcard (`*.` prefix)
pub fn is_wildcard(domain: &str) -> bool {
    domain.starts_with("*.")
}

/// Match a deploy-config domain against a certificate domain.
///
/// Rules: exact equality; `*.R` matches `R` itself and `X.R` where `X`
/// contains no further dots; symmetric when the certificate side is the
/// wildcard.
pub fn domain_matches(config_domain: &str, cert_domain: &str) -> bool {
    if config_domain == cert_domain {
        return true;
    }
    wildcard_covers(config_domain, cert_domain) || wildcard_covers(cert_domain, config_domain)
}

fn wildcard_covers(pattern: &str, subject: &str) -> bool {
    let Some(root) = pattern.strip_prefix("*.") else {
        return false;
    };
    if subject == root {
        return true;
    }
    match subject.strip_suffix(root) {
        Some(head) => {
            // `head` must be a single label terminated by the joining dot
            let Some(label) = head.strip_suffix('.') else {
                return false;
            };
            !label.is_empty() && !label.contains('.')
        }
        None => false,
    }
}

/// Timestamp component of on-disk certificate file names
/// (`<domain>-<YYYYMMDDhhmmss>.crt`)
pub fn file_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d%H%M%S").to_string()
}

/// A managed domain certificate, the unit the renewal sweep operates on.
///
/// Created by `add_domain`, rewritten on each successful renewal, deleted
/// by `remove_domain`. The in-record PEM content is authoritative; the
/// paths are retained for installations that predate inline storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainCert {
    pub domain: String,
    pub cert_path: String,
    pub key_path: String,
    #[serde(rename = "certPEM", default)]
    pub cert_pem: String,
    #[serde(rename = "keyPEM", default)]
    pub key_pem: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_wildcard: bool,
    pub last_renewal_at: DateTime<Utc>,
    pub dns_provider: String,
}

impl DomainCert {
    /// Whether the certificate falls inside the renewal window of
    /// `renew_before_days` days
    pub fn needs_renewal(&self, renew_before_days: i64, now: DateTime<Utc>) -> bool {
        self.expires_at - now < chrono::Duration::days(renew_before_days)
    }
}

/// Operator-registered DNS provider credentials. The credential map is
/// opaque to the core; the provider factory validates the recognized keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsProviderConfig {
    pub name: String,
    pub provider_type: String,
    pub credentials: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Legacy single-valued global DNS default, kept under `dns_config/config`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsConfig {
    pub provider_type: String,
    pub credentials: HashMap<String, String>,
}

/// Deploy target kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployKind {
    Local,
    Remote,
    Cloud,
}

impl std::fmt::Display for DeployKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeployKind::Local => write!(f, "local"),
            DeployKind::Remote => write!(f, "remote"),
            DeployKind::Cloud => write!(f, "cloud"),
        }
    }
}

/// Local filesystem deployment payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalDeployConfig {
    pub cert_path: String,
    pub key_path: String,
    #[serde(default)]
    pub post_commands: Vec<String>,
}

/// Remote SSH deployment payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDeployConfig {
    pub host: String,
    /// SSH port; 22 when unset
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// PEM-encoded private key content
    #[serde(default)]
    pub private_key: Option<String>,
    pub cert_path: String,
    pub key_path: String,
    #[serde(default)]
    pub post_commands: Vec<String>,
    /// Opt-in strict host key verification against `host_fingerprint`
    #[serde(default)]
    pub strict_host_key: bool,
    /// Expected SHA-256 host key fingerprint (`SHA256:...`)
    #[serde(default)]
    pub host_fingerprint: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

/// Cloud SSL platform deployment payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudDeployConfig {
    /// Vendor tag used to resolve the registered cloud adapter
    pub provider: String,
    pub access_key_id: String,
    pub access_key_secret: String,
    /// Domain the uploaded certificate is deployed for; may be a wildcard
    pub target_domain: String,
    /// Optional restriction to specific resource tags (CDN, SLB, ...)
    #[serde(default)]
    pub resource_types: Vec<String>,
}

/// A deployment target for issued certificates.
///
/// Exactly one of the payload sub-records is present, matching `kind`.
/// `last_deploy_at`/`last_deploy_error` record every attempt, not only
/// successes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployConfig {
    pub id: String,
    pub name: String,
    /// Concrete or wildcard domain this config applies to
    pub domain: String,
    #[serde(rename = "type")]
    pub kind: DeployKind,
    pub enabled: bool,
    pub auto_deploy: bool,
    #[serde(rename = "localCfg", default, skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalDeployConfig>,
    #[serde(rename = "remoteCfg", default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteDeployConfig>,
    #[serde(rename = "cloudCfg", default, skip_serializing_if = "Option::is_none")]
    pub cloud: Option<CloudDeployConfig>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_deploy_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_deploy_error: String,
}

impl DeployConfig {
    /// Validate the payload against its kind: presence of exactly one
    /// sub-record and the per-kind mandatory fields.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_domain(&self.domain) {
            return Err(FleetError::configuration(format!(
                "deploy config {}: invalid domain {:?}",
                self.id, self.domain
            )));
        }
        let present =
            [self.local.is_some(), self.remote.is_some(), self.cloud.is_some()]
                .iter()
                .filter(|p| **p)
                .count();
        if present != 1 {
            return Err(FleetError::configuration(format!(
                "deploy config {}: exactly one payload must be set, found {}",
                self.id, present
            )));
        }
        match self.kind {
            DeployKind::Local => {
                let local = self.local.as_ref().ok_or_else(|| {
                    FleetError::configuration("local deploy config missing local payload")
                })?;
                if !local.cert_path.starts_with('/') || !local.key_path.starts_with('/') {
                    return Err(FleetError::configuration(
                        "local deploy config requires absolute cert/key paths",
                    ));
                }
            }
            DeployKind::Remote => {
                let remote = self.remote.as_ref().ok_or_else(|| {
                    FleetError::configuration("remote deploy config missing remote payload")
                })?;
                if remote.host.is_empty() || remote.username.is_empty() {
                    return Err(FleetError::configuration(
                        "remote deploy config requires host and username",
                    ));
                }
                if remote.password.is_none() && remote.private_key.is_none() {
                    return Err(FleetError::configuration(
                        "remote deploy config requires a password or a private key",
                    ));
                }
                if remote.cert_path.is_empty() || remote.key_path.is_empty() {
                    return Err(FleetError::configuration(
                        "remote deploy config requires cert/key paths",
                    ));
                }
                if remote.strict_host_key && remote.host_fingerprint.is_none() {
                    return Err(FleetError::configuration(
                        "strict host key verification requires a host fingerprint",
                    ));
                }
            }
            DeployKind::Cloud => {
                let cloud = self.cloud.as_ref().ok_or_else(|| {
                    FleetError::configuration("cloud deploy config missing cloud payload")
                })?;
                if cloud.access_key_id.is_empty()
                    || cloud.access_key_secret.is_empty()
                    || cloud.target_domain.is_empty()
                {
                    return Err(FleetError::configuration(
                        "cloud deploy config requires access key id, secret and target domain",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Whether this config applies to a certificate for `cert_domain`
    pub fn matches_domain(&self, cert_domain: &str) -> bool {
        domain_matches(&self.domain, cert_domain)
    }
}

/// Advisory lock metadata written next to a held mutex for admins
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub key: String,
    pub owner: String,
    pub create_time: DateTime<Utc>,
    pub lease_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_match_rules() {
        assert!(domain_matches("*.example.com", "a.example.com"));
        assert!(!domain_matches("*.example.com", "a.b.example.com"));
        assert!(domain_matches("*.example.com", "example.com"));
        assert!(domain_matches("api.example.com", "api.example.com"));
        assert!(!domain_matches("*.example.com", "example.org"));
        // symmetric: wildcard certificate against a concrete config domain
        assert!(domain_matches("api.example.com", "*.example.com"));
    }

    #[test]
    fn test_domain_validation() {
        assert!(is_valid_domain("example.com"));
        assert!(is_valid_domain("*.example.com"));
        assert!(is_valid_domain("a-b.c-d.io"));
        assert!(!is_valid_domain("example"));
        assert!(!is_valid_domain("*.*.example.com"));
        assert!(!is_valid_domain("-bad.example.com"));
        assert!(!is_valid_domain(""));
    }

    #[test]
    fn test_needs_renewal_window() {
        let now = Utc::now();
        let cert = DomainCert {
            domain: "example.com".into(),
            cert_path: String::new(),
            key_path: String::new(),
            cert_pem: String::new(),
            key_pem: String::new(),
            issued_at: now,
            expires_at: now + chrono::Duration::days(3),
            is_wildcard: false,
            last_renewal_at: now,
            dns_provider: "acme1".into(),
        };
        assert!(cert.needs_renewal(10, now));
        assert!(!cert.needs_renewal(2, now));
    }

    #[test]
    fn test_deploy_config_validation() {
        let now = Utc::now();
        let mut cfg = DeployConfig {
            id: "d1".into(),
            name: "web".into(),
            domain: "example.com".into(),
            kind: DeployKind::Local,
            enabled: true,
            auto_deploy: false,
            local: Some(LocalDeployConfig {
                cert_path: "/etc/ssl/example.crt".into(),
                key_path: "/etc/ssl/example.key".into(),
                post_commands: vec![],
            }),
            remote: None,
            cloud: None,
            created_at: now,
            updated_at: now,
            last_deploy_at: None,
            last_deploy_error: String::new(),
        };
        assert!(cfg.validate().is_ok());

        cfg.local.as_mut().unwrap().cert_path = "relative/path.crt".into();
        assert!(cfg.validate().is_err());

        cfg.kind = DeployKind::Remote;
        cfg.local = None;
        cfg.remote = Some(RemoteDeployConfig {
            host: "host.example.com".into(),
            port: 22,
            username: "deploy".into(),
            password: None,
            private_key: None,
            cert_path: "/etc/ssl/example.crt".into(),
            key_path: "/etc/ssl/example.key".into(),
            post_commands: vec![],
            strict_host_key: false,
            host_fingerprint: None,
        });
        // neither password nor private key
        assert!(cfg.validate().is_err());
        cfg.remote.as_mut().unwrap().password = Some("secret".into());
        assert!(cfg.validate().is_ok());
    }
}
