//! Certificate lifecycle manager.
//!
//! Owns the domain set, the DNS provider registry and the deploy config
//! registry, all persisted through the shared store; drives renewals
//! through the scheduler's clustered check task and fans out to deployers
//! after successful renewals. Per-node mutations are serialized by the
//! manager's RW lock; the lock is released before auto-deploy detaches.

pub mod convert;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{RwLock, watch};
use uuid::Uuid;

use crate::acme::AcmeIssuer;
use crate::deploy::Deployer;
use crate::dns::{canonical_tag, validate_credentials};
use crate::error::{FleetError, Result};
use crate::scheduler::{ExecutionMode, Scheduler, Task, TaskFn};
use crate::store::{KvStore, keys};
use crate::types::{
    DeployConfig, DnsConfig, DnsProviderConfig, DomainCert, is_valid_domain, is_wildcard,
};

pub use convert::{CertFormat, ConvertedCertificate, ConvertedFile};

/// Name of the periodic renewal check task
pub const CERT_CHECK_TASK: &str = "cert_check_task";

/// Manager configuration
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Root prefix for all store keys
    pub namespace: String,
    /// Directory for issued certificate files
    pub cert_dir: PathBuf,
    /// Days before expiry at which a certificate becomes eligible for
    /// renewal
    pub renew_before_days: i64,
    /// Interval of the clustered check task
    pub check_interval: Duration,
    /// Delay before the first check after startup
    pub check_initial_delay: Duration,
    /// Per-run timeout of the check task
    pub check_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            namespace: "/certfleet/".to_string(),
            cert_dir: PathBuf::from("/var/lib/certfleet/certs"),
            renew_before_days: 30,
            check_interval: Duration::from_secs(24 * 3600),
            check_initial_delay: Duration::from_secs(60),
            check_timeout: Duration::from_secs(10 * 60),
        }
    }
}

/// Outcome of one renewal sweep
#[derive(Debug, Clone, Copy, Default)]
pub struct RenewalSweep {
    pub checked: usize,
    pub renewed: usize,
    pub failed: usize,
}

/// Outcome of one auto-deploy fan-out
#[derive(Debug, Clone, Copy, Default)]
pub struct DeployStats {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// The lifecycle engine; one per process
pub struct CertManager {
    store: Arc<dyn KvStore>,
    issuer: Arc<AcmeIssuer>,
    deployer: Arc<Deployer>,
    opts: ManagerOptions,
    /// Serializes mutations within this node
    mutate: RwLock<()>,
    shutdown_tx: watch::Sender<bool>,
    /// Handle for detaching background work from request contexts
    weak_self: Weak<CertManager>,
}

impl CertManager {
    pub fn new(
        store: Arc<dyn KvStore>,
        issuer: Arc<AcmeIssuer>,
        deployer: Arc<Deployer>,
        mut opts: ManagerOptions,
    ) -> Arc<Self> {
        if !opts.namespace.ends_with('/') {
            opts.namespace.push('/');
        }
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new_cyclic(|weak_self| Self {
            store,
            issuer,
            deployer,
            opts,
            mutate: RwLock::new(()),
            shutdown_tx,
            weak_self: weak_self.clone(),
        })
    }

    /// Stop detached auto-deploy work
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Register the periodic renewal check on the scheduler: clustered, so
    /// only the leader sweeps
    pub fn register_check_task(&self, scheduler: &Scheduler) -> Result<Uuid> {
        let manager = self.weak_self.clone();
        let run: TaskFn = Arc::new(move || {
            let manager = manager.clone();
            Box::pin(async move {
                match manager.upgrade() {
                    Some(manager) => manager.check_certificates().await.map(|_| ()),
                    None => Ok(()),
                }
            })
        });
        scheduler.register(Task::interval(
            CERT_CHECK_TASK,
            self.opts.check_initial_delay,
            self.opts.check_interval,
            ExecutionMode::Clustered,
            self.opts.check_timeout,
            run,
        ))
    }

    // ----- domains -----

    /// Issue a certificate for a new domain and persist its record. Fires
    /// auto-deploy asynchronously on success.
    pub async fn add_domain(&self, domain: &str, provider_name: &str) -> Result<DomainCert> {
        if !is_valid_domain(domain) {
            return Err(FleetError::configuration(format!(
                "invalid domain {domain:?}"
            )));
        }
        let provider = self.get_dns_provider(provider_name).await?;

        let key = self.cert_key(domain);
        if self.store.get(&key).await?.is_some() {
            return Err(FleetError::configuration(format!(
                "domain {domain} is already managed"
            )));
        }

        // Issuance can take minutes; keep it outside the mutation lock.
        let issued = self
            .issuer
            .issue(domain, &provider.provider_type, &provider.credentials)
            .await?;

        let guard = self.mutate.write().await;
        if self.store.get(&key).await?.is_some() {
            return Err(FleetError::configuration(format!(
                "domain {domain} is already managed"
            )));
        }
        let now = Utc::now();
        let record = DomainCert {
            domain: domain.to_string(),
            cert_path: issued.cert_path.display().to_string(),
            key_path: issued.key_path.display().to_string(),
            cert_pem: issued.cert_pem,
            key_pem: issued.key_pem,
            issued_at: issued.not_before,
            expires_at: issued.not_after,
            is_wildcard: is_wildcard(domain),
            last_renewal_at: now,
            dns_provider: provider_name.to_string(),
        };
        self.store.put(&key, &serde_json::to_string(&record)?).await?;
        drop(guard);

        tracing::info!(domain, provider = provider_name, expires = %record.expires_at, "domain added");
        self.spawn_auto_deploy(domain);
        Ok(record)
    }

    /// Delete the domain record. On-disk certificate files are kept.
    pub async fn remove_domain(&self, domain: &str) -> Result<()> {
        let _guard = self.mutate.write().await;
        let key = self.cert_key(domain);
        if self.store.get(&key).await?.is_none() {
            return Err(FleetError::not_found(format!(
                "domain {domain} is not managed"
            )));
        }
        self.store.delete(&key).await?;
        tracing::info!(domain, "domain removed");
        Ok(())
    }

    /// The domain's record with certificate material guaranteed present:
    /// in-record PEMs preferred, referenced paths and the newest on-disk
    /// pair retained as legacy fallbacks.
    pub async fn get_certificate(&self, domain: &str) -> Result<DomainCert> {
        let raw = self
            .store
            .get(&self.cert_key(domain))
            .await?
            .ok_or_else(|| FleetError::not_found(format!("domain {domain} is not managed")))?;
        let record: DomainCert = serde_json::from_str(&raw)?;
        self.hydrate(record).await
    }

    /// All managed domain records
    pub async fn list_domains(&self) -> Result<Vec<DomainCert>> {
        let prefix = format!("{}{}", self.opts.namespace, keys::CERTS);
        let map = self.store.get_prefix(&prefix).await?;
        let mut records = Vec::with_capacity(map.len());
        for (key, value) in map {
            match serde_json::from_str::<DomainCert>(&value) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(key, error = %e, "skipping undecodable domain record"),
            }
        }
        Ok(records)
    }

    /// Produce a format-specific bundle for the domain's current material
    pub async fn convert_certificate(
        &self,
        domain: &str,
        format: CertFormat,
    ) -> Result<ConvertedCertificate> {
        let record = self.get_certificate(domain).await?;
        convert::convert(format, domain, &record.cert_pem, &record.key_pem).await
    }

    // ----- renewal -----

    /// One renewal sweep over all managed domains. Per-domain errors are
    /// logged and do not abort the sweep.
    pub async fn check_certificates(&self) -> Result<RenewalSweep> {
        let now = Utc::now();
        let records = self.list_domains().await?;
        let mut sweep = RenewalSweep::default();
        for record in records {
            sweep.checked += 1;
            if !record.needs_renewal(self.opts.renew_before_days, now) {
                continue;
            }
            tracing::info!(
                domain = %record.domain,
                expires = %record.expires_at,
                "certificate due for renewal"
            );
            match self.renew_domain(&record).await {
                Ok(_) => sweep.renewed += 1,
                Err(e) => {
                    sweep.failed += 1;
                    tracing::error!(domain = %record.domain, error = %e, "renewal failed");
                }
            }
        }
        tracing::info!(
            checked = sweep.checked,
            renewed = sweep.renewed,
            failed = sweep.failed,
            "certificate check finished"
        );
        Ok(sweep)
    }

    async fn renew_domain(&self, record: &DomainCert) -> Result<DomainCert> {
        let (provider_type, credentials) = self.resolve_provider(&record.dns_provider).await?;
        let issued = self
            .issuer
            .issue(&record.domain, &provider_type, &credentials)
            .await?;

        let guard = self.mutate.write().await;
        let now = Utc::now();
        let updated = DomainCert {
            domain: record.domain.clone(),
            cert_path: issued.cert_path.display().to_string(),
            key_path: issued.key_path.display().to_string(),
            cert_pem: issued.cert_pem,
            key_pem: issued.key_pem,
            issued_at: issued.not_before,
            expires_at: issued.not_after,
            is_wildcard: record.is_wildcard,
            last_renewal_at: now,
            dns_provider: record.dns_provider.clone(),
        };
        self.store
            .put(&self.cert_key(&record.domain), &serde_json::to_string(&updated)?)
            .await?;
        drop(guard);

        tracing::info!(domain = %record.domain, expires = %updated.expires_at, "certificate renewed");
        self.spawn_auto_deploy(&record.domain);
        Ok(updated)
    }

    /// Provider credentials for a domain record: the named provider, or
    /// the legacy global default when the name no longer resolves
    async fn resolve_provider(&self, name: &str) -> Result<(String, HashMap<String, String>)> {
        if !name.is_empty() {
            if let Ok(provider) = self.get_dns_provider(name).await {
                return Ok((provider.provider_type, provider.credentials));
            }
        }
        if let Some(global) = self.get_dns_config().await? {
            return Ok((global.provider_type, global.credentials));
        }
        Err(FleetError::not_found(format!(
            "DNS provider {name:?} not found and no global default configured"
        )))
    }

    // ----- auto-deploy -----

    /// Deploy the renewed domain through every enabled auto-deploy config
    /// whose domain matches. Per-config failures are recorded and do not
    /// stop the fan-out.
    pub async fn auto_deploy_after_renewal(&self, domain: &str) -> Result<DeployStats> {
        let configs = self.list_deploy_configs().await?;
        let mut stats = DeployStats::default();
        for config in configs
            .into_iter()
            .filter(|c| c.enabled && c.auto_deploy && c.matches_domain(domain))
        {
            stats.attempted += 1;
            let result = self.deploy_config_once(&config).await;
            self.record_deploy_outcome(&config.id, &result).await;
            match result {
                Ok(()) => stats.succeeded += 1,
                Err(e) => {
                    stats.failed += 1;
                    tracing::error!(
                        domain,
                        config = %config.id,
                        error = %e,
                        "auto-deploy failed"
                    );
                }
            }
        }
        tracing::info!(
            domain,
            attempted = stats.attempted,
            succeeded = stats.succeeded,
            failed = stats.failed,
            "auto-deploy fan-out finished"
        );
        Ok(stats)
    }

    /// Detach the fan-out from the triggering request; it survives the
    /// caller but observes the manager's shutdown signal.
    fn spawn_auto_deploy(&self, domain: &str) {
        let Some(manager) = self.weak_self.upgrade() else {
            return;
        };
        let domain = domain.to_string();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.wait_for(|s| *s) => {}
                result = manager.auto_deploy_after_renewal(&domain) => {
                    if let Err(e) = result {
                        tracing::error!(domain, error = %e, "auto-deploy fan-out failed");
                    }
                }
            }
        });
    }

    // ----- DNS providers -----

    /// Create or update a named provider; credentials are validated
    /// against the recognized keys for the type
    pub async fn add_dns_provider(
        &self,
        name: &str,
        provider_type: &str,
        credentials: HashMap<String, String>,
    ) -> Result<DnsProviderConfig> {
        if name.is_empty() {
            return Err(FleetError::configuration("provider name cannot be empty"));
        }
        let tag = canonical_tag(provider_type)?;
        validate_credentials(tag, &credentials)?;

        let _guard = self.mutate.write().await;
        let key = self.provider_key(name);
        let now = Utc::now();
        let created_at = match self.store.get(&key).await? {
            Some(raw) => serde_json::from_str::<DnsProviderConfig>(&raw)
                .map(|existing| existing.created_at)
                .unwrap_or(now),
            None => now,
        };
        let config = DnsProviderConfig {
            name: name.to_string(),
            provider_type: provider_type.to_string(),
            credentials,
            created_at,
            updated_at: now,
        };
        self.store.put(&key, &serde_json::to_string(&config)?).await?;
        tracing::info!(provider = name, provider_type, "DNS provider saved");
        Ok(config)
    }

    pub async fn get_dns_provider(&self, name: &str) -> Result<DnsProviderConfig> {
        let raw = self
            .store
            .get(&self.provider_key(name))
            .await?
            .ok_or_else(|| FleetError::not_found(format!("DNS provider {name:?}")))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub async fn delete_dns_provider(&self, name: &str) -> Result<()> {
        let _guard = self.mutate.write().await;
        let key = self.provider_key(name);
        if self.store.get(&key).await?.is_none() {
            return Err(FleetError::not_found(format!("DNS provider {name:?}")));
        }
        self.store.delete(&key).await?;
        Ok(())
    }

    pub async fn list_dns_providers(&self) -> Result<Vec<DnsProviderConfig>> {
        let prefix = format!("{}{}", self.opts.namespace, keys::DNS_PROVIDERS);
        let map = self.store.get_prefix(&prefix).await?;
        let mut providers = Vec::with_capacity(map.len());
        for (key, value) in map {
            match serde_json::from_str::<DnsProviderConfig>(&value) {
                Ok(provider) => providers.push(provider),
                Err(e) => tracing::warn!(key, error = %e, "skipping undecodable provider record"),
            }
        }
        Ok(providers)
    }

    /// Legacy single-valued global default
    pub async fn set_dns_config(&self, config: DnsConfig) -> Result<()> {
        let tag = canonical_tag(&config.provider_type)?;
        validate_credentials(tag, &config.credentials)?;
        let key = format!("{}{}", self.opts.namespace, keys::DNS_CONFIG);
        self.store.put(&key, &serde_json::to_string(&config)?).await
    }

    pub async fn get_dns_config(&self) -> Result<Option<DnsConfig>> {
        let key = format!("{}{}", self.opts.namespace, keys::DNS_CONFIG);
        match self.store.get(&key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    // ----- deploy configs -----

    pub async fn add_deploy_config(&self, mut config: DeployConfig) -> Result<DeployConfig> {
        if config.id.is_empty() {
            config.id = Uuid::new_v4().to_string();
        }
        let now = Utc::now();
        config.created_at = now;
        config.updated_at = now;
        config.last_deploy_at = None;
        config.last_deploy_error = String::new();
        config.validate()?;

        let _guard = self.mutate.write().await;
        let key = self.deploy_key(&config.id);
        if self.store.get(&key).await?.is_some() {
            return Err(FleetError::configuration(format!(
                "deploy config {} already exists",
                config.id
            )));
        }
        self.store.put(&key, &serde_json::to_string(&config)?).await?;
        tracing::info!(config = %config.id, kind = %config.kind, "deploy config added");
        Ok(config)
    }

    pub async fn update_deploy_config(&self, mut config: DeployConfig) -> Result<DeployConfig> {
        let _guard = self.mutate.write().await;
        let key = self.deploy_key(&config.id);
        let raw = self.store.get(&key).await?.ok_or_else(|| {
            FleetError::not_found(format!("deploy config {}", config.id))
        })?;
        let existing: DeployConfig = serde_json::from_str(&raw)?;
        config.created_at = existing.created_at;
        config.last_deploy_at = existing.last_deploy_at;
        config.last_deploy_error = existing.last_deploy_error;
        config.updated_at = Utc::now();
        config.validate()?;
        self.store.put(&key, &serde_json::to_string(&config)?).await?;
        Ok(config)
    }

    pub async fn delete_deploy_config(&self, id: &str) -> Result<()> {
        let _guard = self.mutate.write().await;
        let key = self.deploy_key(id);
        if self.store.get(&key).await?.is_none() {
            return Err(FleetError::not_found(format!("deploy config {id}")));
        }
        self.store.delete(&key).await?;
        Ok(())
    }

    pub async fn get_deploy_config(&self, id: &str) -> Result<DeployConfig> {
        let raw = self
            .store
            .get(&self.deploy_key(id))
            .await?
            .ok_or_else(|| FleetError::not_found(format!("deploy config {id}")))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub async fn list_deploy_configs(&self) -> Result<Vec<DeployConfig>> {
        let prefix = format!("{}{}", self.opts.namespace, keys::DEPLOY_CONFIGS);
        let map = self.store.get_prefix(&prefix).await?;
        let mut configs = Vec::with_capacity(map.len());
        for (key, value) in map {
            match serde_json::from_str::<DeployConfig>(&value) {
                Ok(config) => configs.push(config),
                Err(e) => tracing::warn!(key, error = %e, "skipping undecodable deploy config"),
            }
        }
        Ok(configs)
    }

    /// Manual deploy of one config. Records the attempt on the config
    /// whatever the outcome.
    pub async fn deploy_certificate(&self, config_id: &str) -> Result<()> {
        let config = self.get_deploy_config(config_id).await?;
        if !config.enabled {
            return Err(FleetError::configuration(format!(
                "deploy config {config_id} is disabled"
            )));
        }
        let result = self.deploy_config_once(&config).await;
        self.record_deploy_outcome(config_id, &result).await;
        result
    }

    /// Non-mutating pre-flight check of a deploy config's target
    pub async fn probe_deploy_config(&self, config_id: &str) -> Result<()> {
        let config = self.get_deploy_config(config_id).await?;
        self.deployer.probe(&config).await
    }

    async fn deploy_config_once(&self, config: &DeployConfig) -> Result<()> {
        let cert = self.certificate_for_config(config).await?;
        self.deployer.deploy(config, &cert).await
    }

    /// The certificate a deploy config applies to: the exact record, or
    /// any record the config's (possibly wildcard) domain matches
    async fn certificate_for_config(&self, config: &DeployConfig) -> Result<DomainCert> {
        if let Ok(record) = self.get_certificate(&config.domain).await {
            return Ok(record);
        }
        for record in self.list_domains().await? {
            if config.matches_domain(&record.domain) {
                return self.hydrate(record).await;
            }
        }
        Err(FleetError::not_found(format!(
            "no managed certificate matches deploy config domain {:?}",
            config.domain
        )))
    }

    /// `last_deploy_at`/`last_deploy_error` are written after every
    /// attempt; concurrent deploys from different nodes are last-writer-wins
    async fn record_deploy_outcome(&self, config_id: &str, result: &Result<()>) {
        let key = self.deploy_key(config_id);
        let raw = match self.store.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(config = config_id, error = %e, "cannot record deploy outcome");
                return;
            }
        };
        let mut config: DeployConfig = match serde_json::from_str(&raw) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(config = config_id, error = %e, "cannot decode deploy config");
                return;
            }
        };
        config.last_deploy_at = Some(Utc::now());
        config.last_deploy_error = match result {
            Ok(()) => String::new(),
            Err(e) => e.to_string(),
        };
        match serde_json::to_string(&config) {
            Ok(value) => {
                if let Err(e) = self.store.put(&key, &value).await {
                    tracing::warn!(config = config_id, error = %e, "cannot persist deploy outcome");
                }
            }
            Err(e) => tracing::warn!(config = config_id, error = %e, "cannot encode deploy config"),
        }
    }

    // ----- internals -----

    fn cert_key(&self, domain: &str) -> String {
        format!("{}{}{domain}", self.opts.namespace, keys::CERTS)
    }

    fn provider_key(&self, name: &str) -> String {
        format!("{}{}{name}", self.opts.namespace, keys::DNS_PROVIDERS)
    }

    fn deploy_key(&self, id: &str) -> String {
        format!("{}{}{id}", self.opts.namespace, keys::DEPLOY_CONFIGS)
    }

    /// Ensure the record carries PEM content, falling back to the
    /// referenced paths and finally the newest on-disk pair. The store is
    /// authoritative once inline content exists.
    async fn hydrate(&self, mut record: DomainCert) -> Result<DomainCert> {
        if !record.cert_pem.is_empty() && !record.key_pem.is_empty() {
            return Ok(record);
        }
        if !record.cert_path.is_empty() && Path::new(&record.cert_path).exists() {
            record.cert_pem = tokio::fs::read_to_string(&record.cert_path).await?;
            record.key_pem = tokio::fs::read_to_string(&record.key_path).await?;
            return Ok(record);
        }
        let dir = self.opts.cert_dir.join(&record.domain);
        let (cert_path, key_path) = latest_cert_files(&dir).await?.ok_or_else(|| {
            FleetError::not_found(format!(
                "no certificate files for domain {}",
                record.domain
            ))
        })?;
        record.cert_pem = tokio::fs::read_to_string(&cert_path).await?;
        record.key_pem = tokio::fs::read_to_string(&key_path).await?;
        record.cert_path = cert_path.display().to_string();
        record.key_path = key_path.display().to_string();
        Ok(record)
    }
}

/// Newest `.crt` by mtime in a domain directory, with its sibling `.key`
async fn latest_cert_files(dir: &Path) -> Result<Option<(PathBuf, PathBuf)>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return Ok(None),
    };
    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("crt") {
            continue;
        }
        let modified = entry.metadata().await?.modified()?;
        if newest.as_ref().is_none_or(|(when, _)| modified > *when) {
            newest = Some((modified, path));
        }
    }
    match newest {
        Some((_, cert_path)) => {
            let key_path = cert_path.with_extension("key");
            if key_path.exists() {
                Ok(Some((cert_path, key_path)))
            } else {
                Ok(None)
            }
        }
        None => Ok(None),
    }
}
