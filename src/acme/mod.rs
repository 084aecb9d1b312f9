//! ACME client facade.
//!
//! Stateless with respect to the rest of the platform: a domain plus
//! provider credentials go in, certificate material and validity come out.
//! The ACME wire protocol itself is consumed from `instant-acme`; DNS-01 is
//! the only supported challenge. Challenge propagation is polled against an
//! explicit list of public resolvers to tolerate slow authoritative
//! propagation.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hickory_resolver::TokioResolver;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig};
use hickory_resolver::name_server::TokioConnectionProvider;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, OrderStatus, RetryPolicy,
};
use tokio::sync::Mutex;

use crate::dns::{ChallengeProvider, ProviderRegistry, challenge_record, canonical_tag};
use crate::error::{FleetError, Result};
use crate::types::file_timestamp;

/// Public resolvers queried during propagation polling
const RESOLVER_IPS: [IpAddr; 4] = [
    IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
    IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
    IpAddr::V4(Ipv4Addr::new(223, 5, 5, 5)),
    IpAddr::V4(Ipv4Addr::new(119, 29, 29, 29)),
];

/// Per-query timeout; generous on purpose, slow authoritative servers are
/// common right after record creation
const RESOLVER_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

const ACCOUNT_FILE: &str = "account.json";

/// Facade configuration
#[derive(Debug, Clone)]
pub struct AcmeOptions {
    /// Operator contact for CA registration
    pub contact_email: String,
    /// Use the CA's staging environment
    pub staging: bool,
    /// Override the directory URL entirely (takes precedence over
    /// `staging`)
    pub directory_url: Option<String>,
    /// Root directory for issued certificate files and the account key
    pub cert_dir: PathBuf,
}

/// Result of one issuance
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub cert_pem: String,
    pub key_pem: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// Wrapper around the external ACME client. One account key per facade,
/// generated on first use and persisted under the certificate directory.
pub struct AcmeIssuer {
    opts: AcmeOptions,
    registry: Arc<ProviderRegistry>,
    account: Mutex<Option<Account>>,
    resolvers: Vec<TokioResolver>,
}

impl AcmeIssuer {
    pub fn new(opts: AcmeOptions, registry: Arc<ProviderRegistry>) -> Self {
        let resolvers = RESOLVER_IPS
            .iter()
            .map(|ip| {
                let group = NameServerConfigGroup::from_ips_clear(&[*ip], 53, true);
                let config = ResolverConfig::from_parts(None, vec![], group);
                let mut builder = TokioResolver::builder_with_config(
                    config,
                    TokioConnectionProvider::default(),
                );
                builder.options_mut().timeout = RESOLVER_QUERY_TIMEOUT;
                builder.options_mut().attempts = 1;
                builder.build()
            })
            .collect();
        Self {
            opts,
            registry,
            account: Mutex::new(None),
            resolvers,
        }
    }

    /// Obtain a certificate for `domain` through DNS-01 with the given
    /// provider. The `mock` provider type short-circuits to a 90-day
    /// self-signed certificate and never contacts a CA (test only).
    pub async fn issue(
        &self,
        domain: &str,
        provider_type: &str,
        credentials: &HashMap<String, String>,
    ) -> Result<IssuedCertificate> {
        if canonical_tag(provider_type)? == "mock" {
            return self.issue_self_signed(domain).await;
        }
        let provider = self.registry.provider_for(provider_type, credentials)?;
        let (cert_pem, key_pem) = self.order_certificate(domain, provider.as_ref()).await?;
        self.persist(domain, &cert_pem, &key_pem).await
    }

    async fn order_certificate(
        &self,
        domain: &str,
        provider: &dyn ChallengeProvider,
    ) -> Result<(String, String)> {
        let account = self.account().await?;
        let acme_err =
            |detail: String| FleetError::acme(domain.to_string(), detail);

        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder::new(&identifiers))
            .await
            .map_err(|e| acme_err(format!("order creation failed: {e}")))?;

        // (token, record value) pairs presented on the provider, cleaned
        // up whatever happens after this point
        let mut presented: Vec<(String, String)> = Vec::new();
        let result = self
            .solve_and_finalize(domain, provider, &mut order, &mut presented)
            .await;

        for (token, value) in &presented {
            if let Err(e) = provider.cleanup(domain, token, value).await {
                tracing::warn!(domain, error = %e, "challenge record cleanup failed");
            }
        }
        result
    }

    async fn solve_and_finalize(
        &self,
        domain: &str,
        provider: &dyn ChallengeProvider,
        order: &mut instant_acme::Order,
        presented: &mut Vec<(String, String)>,
    ) -> Result<(String, String)> {
        let acme_err =
            |detail: String| FleetError::acme(domain.to_string(), detail);

        let mut authorizations = order.authorizations();
        while let Some(result) = authorizations.next().await {
            let mut authz =
                result.map_err(|e| acme_err(format!("authorization fetch failed: {e}")))?;
            match authz.status {
                AuthorizationStatus::Valid => continue,
                AuthorizationStatus::Pending => {}
                status => {
                    return Err(acme_err(format!(
                        "authorization in unexpected state {status:?}"
                    )));
                }
            }

            let mut challenge = authz
                .challenge(ChallengeType::Dns01)
                .ok_or_else(|| acme_err("no DNS-01 challenge offered".to_string()))?;
            let token = challenge.token.clone();
            let record_value = challenge.key_authorization().dns_value();

            provider.present(domain, &token, &record_value).await?;
            presented.push((token, record_value.clone()));

            self.wait_for_propagation(domain, &record_value, provider)
                .await?;
            challenge
                .set_ready()
                .await
                .map_err(|e| acme_err(format!("challenge ready signal failed: {e}")))?;
        }

        let status = order
            .poll_ready(&RetryPolicy::default())
            .await
            .map_err(|e| acme_err(format!("order poll failed: {e}")))?;
        if status != OrderStatus::Ready {
            return Err(acme_err(format!("order not ready: {status:?}")));
        }

        let key_pem = order
            .finalize()
            .await
            .map_err(|e| acme_err(format!("finalization failed: {e}")))?;
        let cert_pem = order
            .poll_certificate(&RetryPolicy::default())
            .await
            .map_err(|e| acme_err(format!("certificate download failed: {e}")))?;
        Ok((cert_pem, key_pem))
    }

    async fn wait_for_propagation(
        &self,
        domain: &str,
        expected: &str,
        provider: &dyn ChallengeProvider,
    ) -> Result<()> {
        let timing = provider.timing();
        let fqdn = challenge_record(domain);
        let deadline = tokio::time::Instant::now() + timing.deadline;
        tracing::info!(domain, record = %fqdn, "waiting for DNS propagation");
        loop {
            if self.record_visible(&fqdn, expected).await {
                return Ok(());
            }
            if tokio::time::Instant::now() + timing.interval >= deadline {
                return Err(FleetError::acme(
                    domain.to_string(),
                    format!(
                        "TXT record {fqdn} not visible within {:?}",
                        timing.deadline
                    ),
                ));
            }
            tokio::time::sleep(timing.interval).await;
        }
    }

    async fn record_visible(&self, fqdn: &str, expected: &str) -> bool {
        for resolver in &self.resolvers {
            match resolver.txt_lookup(fqdn.to_string()).await {
                Ok(lookup) => {
                    if lookup.iter().any(|r| r.to_string().contains(expected)) {
                        return true;
                    }
                }
                Err(e) => tracing::debug!(record = fqdn, error = %e, "TXT query failed"),
            }
        }
        false
    }

    fn directory_url(&self) -> String {
        if let Some(url) = &self.opts.directory_url {
            return url.clone();
        }
        if self.opts.staging {
            LetsEncrypt::Staging.url().to_string()
        } else {
            LetsEncrypt::Production.url().to_string()
        }
    }

    /// Load or register the global account. Credentials are kept as JSON
    /// next to the issued certificates, mode 0600.
    async fn account(&self) -> Result<Account> {
        let mut guard = self.account.lock().await;
        if let Some(account) = guard.as_ref() {
            return Ok(account.clone());
        }

        let path = self.opts.cert_dir.join(ACCOUNT_FILE);
        let account = if path.exists() {
            let raw = tokio::fs::read_to_string(&path).await?;
            let credentials: AccountCredentials = serde_json::from_str(&raw)?;
            Account::builder()
                .map_err(|e| FleetError::acme("account".to_string(), e.to_string()))?
                .from_credentials(credentials)
                .await
                .map_err(|e| {
                    FleetError::acme("account".to_string(), format!("credential restore: {e}"))
                })?
        } else {
            let contact = format!("mailto:{}", self.opts.contact_email);
            let (account, credentials) = Account::builder()
                .map_err(|e| FleetError::acme("account".to_string(), e.to_string()))?
                .create(
                    &NewAccount {
                        contact: &[&contact],
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    self.directory_url(),
                    None,
                )
                .await
                .map_err(|e| {
                    FleetError::acme("account".to_string(), format!("registration: {e}"))
                })?;
            tokio::fs::create_dir_all(&self.opts.cert_dir).await?;
            tokio::fs::write(&path, serde_json::to_string(&credentials)?).await?;
            set_mode(&path, 0o600).await?;
            tracing::info!(directory = %self.directory_url(), "ACME account registered");
            account
        };

        *guard = Some(account.clone());
        Ok(account)
    }

    /// Self-signed 90-day certificate used by the `mock` provider type
    async fn issue_self_signed(&self, domain: &str) -> Result<IssuedCertificate> {
        let mut params = rcgen::CertificateParams::new(vec![domain.to_string()])
            .map_err(|e| FleetError::certificate(format!("mock params: {e}")))?;
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(90);
        let key_pair = rcgen::KeyPair::generate()
            .map_err(|e| FleetError::certificate(format!("mock key: {e}")))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| FleetError::certificate(format!("mock issuance: {e}")))?;
        self.persist(domain, &cert.pem(), &key_pair.serialize_pem())
            .await
    }

    /// Write `<certDir>/<domain>/<domain>-<timestamp>.{crt,key}` and read
    /// the validity back out of the certificate itself
    async fn persist(
        &self,
        domain: &str,
        cert_pem: &str,
        key_pem: &str,
    ) -> Result<IssuedCertificate> {
        let (not_before, not_after) = certificate_validity(cert_pem)?;

        let dir = self.opts.cert_dir.join(domain);
        tokio::fs::create_dir_all(&dir).await?;
        let stamp = file_timestamp(Utc::now());
        let cert_path = dir.join(format!("{domain}-{stamp}.crt"));
        let key_path = dir.join(format!("{domain}-{stamp}.key"));
        tokio::fs::write(&cert_path, cert_pem).await?;
        set_mode(&cert_path, 0o644).await?;
        tokio::fs::write(&key_path, key_pem).await?;
        set_mode(&key_path, 0o600).await?;

        tracing::info!(
            domain,
            cert = %cert_path.display(),
            expires = %not_after,
            "certificate material written"
        );
        Ok(IssuedCertificate {
            cert_path,
            key_path,
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
            not_before,
            not_after,
        })
    }
}

/// Parse `NotBefore`/`NotAfter` out of the first certificate in a PEM chain
pub fn certificate_validity(cert_pem: &str) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| FleetError::certificate(format!("PEM parse: {e}")))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| FleetError::certificate(format!("X.509 parse: {e}")))?;
    let not_before = asn1_to_chrono(cert.validity().not_before.to_datetime())?;
    let not_after = asn1_to_chrono(cert.validity().not_after.to_datetime())?;
    Ok((not_before, not_after))
}

fn asn1_to_chrono(odt: time::OffsetDateTime) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(odt.unix_timestamp(), odt.nanosecond())
        .ok_or_else(|| FleetError::certificate("certificate timestamp out of range".to_string()))
}

async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer(dir: &Path) -> AcmeIssuer {
        AcmeIssuer::new(
            AcmeOptions {
                contact_email: "ops@example.com".to_string(),
                staging: true,
                directory_url: None,
                cert_dir: dir.to_path_buf(),
            },
            Arc::new(ProviderRegistry::new()),
        )
    }

    #[tokio::test]
    async fn test_mock_issuance_yields_90_day_cert() {
        let dir = tempfile::tempdir().unwrap();
        let issuer = issuer(dir.path());
        let issued = issuer
            .issue("test.example.com", "mock", &HashMap::new())
            .await
            .unwrap();

        assert!(issued.cert_path.exists());
        assert!(issued.key_path.exists());
        assert!(issued.cert_pem.contains("BEGIN CERTIFICATE"));
        let lifetime = issued.not_after - issued.not_before;
        assert_eq!(lifetime.num_days(), 90);
        assert!(issued.not_after > Utc::now() + chrono::Duration::days(30));
    }

    #[tokio::test]
    async fn test_validity_round_trips_through_parser() {
        let dir = tempfile::tempdir().unwrap();
        let issuer = issuer(dir.path());
        let issued = issuer
            .issue("roundtrip.example.com", "mock", &HashMap::new())
            .await
            .unwrap();
        let (_, not_after) = certificate_validity(&issued.cert_pem).unwrap();
        assert_eq!(not_after, issued.not_after);
    }

    #[tokio::test]
    async fn test_unknown_provider_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let issuer = issuer(dir.path());
        let err = issuer
            .issue("x.example.com", "definitely-not-a-provider", &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Configuration(_)));
    }
}
