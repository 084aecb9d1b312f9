#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use certfleet::acme::{AcmeIssuer, AcmeOptions};
use certfleet::deploy::Deployer;
use certfleet::dns::ProviderRegistry;
use certfleet::lock::{DEFAULT_SESSION_TTL, LockManager};
use certfleet::manager::{CertManager, ManagerOptions};
use certfleet::store::memory::MemoryStore;
use certfleet::types::{DeployConfig, DeployKind, LocalDeployConfig};

pub const NAMESPACE: &str = "/certfleet/";

/// A manager wired to an in-memory store and the mock issuance path
pub struct TestEnv {
    pub store: MemoryStore,
    pub manager: Arc<CertManager>,
    pub deployer: Arc<Deployer>,
    pub cert_dir: tempfile::TempDir,
}

pub async fn env() -> TestEnv {
    let store = MemoryStore::new();
    env_with(&store, 30).await
}

pub async fn env_with(store: &MemoryStore, renew_before_days: i64) -> TestEnv {
    let cert_dir = tempfile::tempdir().expect("temp cert dir");
    let registry = Arc::new(ProviderRegistry::new());
    let issuer = Arc::new(AcmeIssuer::new(
        AcmeOptions {
            contact_email: "ops@example.com".to_string(),
            staging: true,
            directory_url: None,
            cert_dir: cert_dir.path().to_path_buf(),
        },
        registry,
    ));
    let deployer = Arc::new(Deployer::new());
    let manager = CertManager::new(
        Arc::new(store.clone()),
        issuer,
        Arc::clone(&deployer),
        ManagerOptions {
            namespace: NAMESPACE.to_string(),
            cert_dir: cert_dir.path().to_path_buf(),
            renew_before_days,
            check_interval: Duration::from_secs(24 * 3600),
            check_initial_delay: Duration::from_secs(60),
            check_timeout: Duration::from_secs(600),
        },
    );
    TestEnv {
        store: store.clone(),
        manager,
        deployer,
        cert_dir,
    }
}

impl TestEnv {
    /// Register a mock-typed DNS provider under the given name
    pub async fn register_mock_provider(&self, name: &str) {
        self.manager
            .add_dns_provider(name, "mock", HashMap::new())
            .await
            .expect("register mock provider");
    }
}

pub async fn lock_manager(store: &MemoryStore) -> Arc<LockManager> {
    LockManager::new(Arc::new(store.clone()), NAMESPACE, DEFAULT_SESSION_TTL)
        .await
        .expect("lock manager")
}

/// A local deploy config writing into `dir`
pub fn local_deploy_config(
    domain: &str,
    dir: &std::path::Path,
    auto_deploy: bool,
    post_commands: &[&str],
) -> DeployConfig {
    let now = chrono::Utc::now();
    DeployConfig {
        id: String::new(),
        name: format!("local-{domain}"),
        domain: domain.to_string(),
        kind: DeployKind::Local,
        enabled: true,
        auto_deploy,
        local: Some(LocalDeployConfig {
            cert_path: dir.join(format!("{domain}.crt")).display().to_string(),
            key_path: dir.join(format!("{domain}.key")).display().to_string(),
            post_commands: post_commands.iter().map(|c| c.to_string()).collect(),
        }),
        remote: None,
        cloud: None,
        created_at: now,
        updated_at: now,
        last_deploy_at: None,
        last_deploy_error: String::new(),
    }
}

/// Poll until `check` returns true or the deadline passes
pub async fn wait_until<F>(deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let end = tokio::time::Instant::now() + deadline;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= end {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
