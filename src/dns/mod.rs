//! DNS-01 challenge providers.
//!
//! The core treats provider SDKs as an opaque challenge-solver interface:
//! given a domain, a token and the computed record value, a provider
//! publishes and later removes the `_acme-challenge` TXT record. The
//! factory recognizes the operator-visible provider tags, validates the
//! credential map keys, and resolves per-provider propagation defaults.

pub mod cloudflare;
pub mod digitalocean;
pub mod godaddy;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{FleetError, Result};

pub use cloudflare::CloudflareProvider;
pub use digitalocean::DigitalOceanProvider;
pub use godaddy::GodaddyProvider;

/// Propagation-polling defaults, provider-specific
#[derive(Debug, Clone, Copy)]
pub struct PropagationTiming {
    /// TTL of the published TXT record
    pub ttl_secs: u32,
    /// How long to wait for the record to become visible
    pub deadline: Duration,
    /// Pause between propagation checks
    pub interval: Duration,
}

/// A DNS provider able to solve DNS-01 challenges.
///
/// `key_auth` is the TXT record value (the digest of the ACME key
/// authorization), not the raw key authorization string.
#[async_trait]
pub trait ChallengeProvider: std::fmt::Debug + Send + Sync {
    /// Publish the TXT record under `_acme-challenge.<domain>`
    async fn present(&self, domain: &str, token: &str, key_auth: &str) -> Result<()>;

    /// Remove the record published by `present`
    async fn cleanup(&self, domain: &str, token: &str, key_auth: &str) -> Result<()>;

    /// Propagation-polling parameters for this provider
    fn timing(&self) -> PropagationTiming;
}

/// TXT record name for a challenge on `domain` (wildcard prefix stripped)
pub fn challenge_record(domain: &str) -> String {
    format!("_acme-challenge.{}", domain.trim_start_matches("*."))
}

/// Resolve an operator-supplied provider tag (including aliases) to its
/// canonical form. Unknown tags fail fast.
pub fn canonical_tag(provider_type: &str) -> Result<&'static str> {
    match provider_type.to_ascii_lowercase().as_str() {
        "aliyun" | "alidns" => Ok("aliyun"),
        "cloudflare" => Ok("cloudflare"),
        "dnspod" | "tencentcloud" => Ok("dnspod"),
        "godaddy" => Ok("godaddy"),
        "route53" | "aws" => Ok("route53"),
        "digitalocean" | "do" => Ok("digitalocean"),
        "namesilo" => Ok("namesilo"),
        "mock" => Ok("mock"),
        other => Err(FleetError::configuration(format!(
            "unknown DNS provider type {other:?}"
        ))),
    }
}

/// Default propagation tuning per canonical tag
pub fn default_timing(tag: &str) -> PropagationTiming {
    match tag {
        "aliyun" => PropagationTiming {
            ttl_secs: 600,
            deadline: Duration::from_secs(15 * 60),
            interval: Duration::from_secs(30),
        },
        "cloudflare" => PropagationTiming {
            ttl_secs: 120,
            deadline: Duration::from_secs(10 * 60),
            interval: Duration::from_secs(10),
        },
        "dnspod" => PropagationTiming {
            ttl_secs: 600,
            deadline: Duration::from_secs(15 * 60),
            interval: Duration::from_secs(20),
        },
        "godaddy" => PropagationTiming {
            ttl_secs: 600,
            deadline: Duration::from_secs(30 * 60),
            interval: Duration::from_secs(30),
        },
        "route53" => PropagationTiming {
            ttl_secs: 300,
            deadline: Duration::from_secs(15 * 60),
            interval: Duration::from_secs(20),
        },
        "digitalocean" => PropagationTiming {
            ttl_secs: 30,
            deadline: Duration::from_secs(10 * 60),
            interval: Duration::from_secs(15),
        },
        "namesilo" => PropagationTiming {
            ttl_secs: 7200,
            deadline: Duration::from_secs(40 * 60),
            interval: Duration::from_secs(60),
        },
        // test only
        _ => PropagationTiming {
            ttl_secs: 1,
            deadline: Duration::from_secs(2),
            interval: Duration::from_millis(50),
        },
    }
}

/// Recognized credential map keys per canonical tag; outer list entries are
/// alternatives, inner lists must be present together.
fn credential_alternatives(tag: &str) -> &'static [&'static [&'static str]] {
    match tag {
        "aliyun" => &[&["ALICLOUD_ACCESS_KEY", "ALICLOUD_SECRET_KEY"]],
        "cloudflare" => &[&["CF_API_TOKEN"], &["CF_API_KEY", "CF_API_EMAIL"]],
        // login token is assembled as `<id>,<key>`
        "dnspod" => &[&["TENCENTCLOUD_SECRET_ID", "TENCENTCLOUD_SECRET_KEY"]],
        "godaddy" => &[&["GODADDY_API_KEY", "GODADDY_API_SECRET"]],
        "route53" => &[&["AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY"]],
        "digitalocean" => &[&["DO_AUTH_TOKEN"]],
        "namesilo" => &[&["NAMESILO_API_KEY"]],
        _ => &[&[]],
    }
}

/// Check that the credential map satisfies one of the provider's
/// recognized key sets
pub fn validate_credentials(tag: &str, credentials: &HashMap<String, String>) -> Result<()> {
    let alternatives = credential_alternatives(tag);
    let satisfied = alternatives.iter().any(|set| {
        set.iter()
            .all(|key| credentials.get(*key).is_some_and(|v| !v.is_empty()))
    });
    if satisfied {
        Ok(())
    } else {
        let expected: Vec<String> = alternatives.iter().map(|s| s.join("+")).collect();
        Err(FleetError::configuration(format!(
            "provider {tag}: missing credentials, expected one of [{}]",
            expected.join(", ")
        )))
    }
}

/// Constructor for an externally registered provider adapter
pub type ProviderCtor =
    Arc<dyn Fn(&HashMap<String, String>) -> Result<Arc<dyn ChallengeProvider>> + Send + Sync>;

/// Factory resolving `(provider_type, credentials)` to a challenge
/// provider. REST-backed adapters ship built in; SDK-backed providers
/// (aliyun, dnspod, route53, namesilo) are registered by the embedding
/// application through [`register`](Self::register).
#[derive(Default)]
pub struct ProviderRegistry {
    custom: RwLock<HashMap<String, ProviderCtor>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or override) an adapter for a canonical tag
    pub fn register(&self, tag: &str, ctor: ProviderCtor) -> Result<()> {
        let tag = canonical_tag(tag)?;
        self.custom
            .write()
            .expect("provider registry")
            .insert(tag.to_string(), ctor);
        Ok(())
    }

    /// Resolve a provider. Unknown tags and missing credentials fail fast
    /// with a configuration error.
    pub fn provider_for(
        &self,
        provider_type: &str,
        credentials: &HashMap<String, String>,
    ) -> Result<Arc<dyn ChallengeProvider>> {
        let tag = canonical_tag(provider_type)?;
        validate_credentials(tag, credentials)?;

        if let Some(ctor) = self
            .custom
            .read()
            .expect("provider registry")
            .get(tag)
            .cloned()
        {
            return ctor(credentials);
        }

        match tag {
            "cloudflare" => Ok(Arc::new(CloudflareProvider::from_credentials(credentials)?)),
            "digitalocean" => Ok(Arc::new(DigitalOceanProvider::from_credentials(
                credentials,
            )?)),
            "godaddy" => Ok(Arc::new(GodaddyProvider::from_credentials(credentials)?)),
            "mock" => Ok(Arc::new(MockChallengeProvider::new())),
            other => Err(FleetError::configuration(format!(
                "provider {other} requires a registered adapter"
            ))),
        }
    }
}

/// In-process provider for tests; records every presented value
#[derive(Debug)]
pub struct MockChallengeProvider {
    records: RwLock<HashMap<String, String>>,
}

impl MockChallengeProvider {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Current record value for a domain, if presented and not cleaned up
    pub fn record_for(&self, domain: &str) -> Option<String> {
        self.records
            .read()
            .expect("mock records")
            .get(&challenge_record(domain))
            .cloned()
    }
}

impl Default for MockChallengeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChallengeProvider for MockChallengeProvider {
    async fn present(&self, domain: &str, _token: &str, key_auth: &str) -> Result<()> {
        self.records
            .write()
            .expect("mock records")
            .insert(challenge_record(domain), key_auth.to_string());
        tracing::debug!(domain, "mock TXT record presented");
        Ok(())
    }

    async fn cleanup(&self, domain: &str, _token: &str, _key_auth: &str) -> Result<()> {
        self.records
            .write()
            .expect("mock records")
            .remove(&challenge_record(domain));
        tracing::debug!(domain, "mock TXT record removed");
        Ok(())
    }

    fn timing(&self) -> PropagationTiming {
        default_timing("mock")
    }
}

/// Walk a domain's labels from most to least specific; used by the REST
/// adapters to discover the registered zone.
pub(crate) fn zone_candidates(domain: &str) -> Vec<String> {
    let base = domain.trim_start_matches("*.");
    let labels: Vec<&str> = base.split('.').collect();
    (0..labels.len().saturating_sub(1))
        .map(|i| labels[i..].join("."))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_aliases() {
        assert_eq!(canonical_tag("alidns").unwrap(), "aliyun");
        assert_eq!(canonical_tag("tencentcloud").unwrap(), "dnspod");
        assert_eq!(canonical_tag("AWS").unwrap(), "route53");
        assert_eq!(canonical_tag("do").unwrap(), "digitalocean");
        assert!(canonical_tag("nonexistent").is_err());
    }

    #[test]
    fn test_credential_validation() {
        let mut creds = HashMap::new();
        assert!(validate_credentials("cloudflare", &creds).is_err());

        creds.insert("CF_API_TOKEN".to_string(), "tok".to_string());
        assert!(validate_credentials("cloudflare", &creds).is_ok());

        let mut keyed = HashMap::new();
        keyed.insert("CF_API_KEY".to_string(), "key".to_string());
        assert!(validate_credentials("cloudflare", &keyed).is_err());
        keyed.insert("CF_API_EMAIL".to_string(), "ops@example.com".to_string());
        assert!(validate_credentials("cloudflare", &keyed).is_ok());
    }

    #[test]
    fn test_registry_rejects_unregistered_sdk_provider() {
        let registry = ProviderRegistry::new();
        let mut creds = HashMap::new();
        creds.insert("AWS_ACCESS_KEY_ID".to_string(), "id".to_string());
        creds.insert("AWS_SECRET_ACCESS_KEY".to_string(), "secret".to_string());
        let err = registry.provider_for("route53", &creds).unwrap_err();
        assert!(matches!(err, FleetError::Configuration(_)));
    }

    #[test]
    fn test_zone_candidates_walk() {
        assert_eq!(
            zone_candidates("a.b.example.com"),
            vec!["a.b.example.com", "b.example.com", "example.com"]
        );
        assert_eq!(zone_candidates("*.example.com"), vec!["example.com"]);
    }

    #[tokio::test]
    async fn test_mock_provider_records() {
        let provider = MockChallengeProvider::new();
        provider
            .present("example.com", "tok", "value-1")
            .await
            .unwrap();
        assert_eq!(
            provider.record_for("example.com"),
            Some("value-1".to_string())
        );
        provider
            .cleanup("example.com", "tok", "value-1")
            .await
            .unwrap();
        assert_eq!(provider.record_for("example.com"), None);
    }

    #[test]
    fn test_timing_defaults() {
        let cf = default_timing("cloudflare");
        assert_eq!(cf.ttl_secs, 120);
        assert_eq!(cf.interval, Duration::from_secs(10));
        let namesilo = default_timing("namesilo");
        assert_eq!(namesilo.deadline, Duration::from_secs(2400));
    }
}
