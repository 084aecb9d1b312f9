//! Certificate manager scenarios: issuance through the mock provider,
//! renewal eligibility, sweep idempotence and auto-deploy fan-out.

mod common;

use std::time::Duration;

use certfleet::error::FleetError;
use certfleet::store::KvStore;
use certfleet::store::memory::MemoryStore;
use certfleet::types::DomainCert;
use chrono::Utc;

use common::{env, env_with, local_deploy_config};

#[tokio::test]
async fn test_add_domain_stores_fresh_certificate() {
    let env = env().await;
    env.register_mock_provider("acme1").await;

    let record = env
        .manager
        .add_domain("test.example.com", "acme1")
        .await
        .unwrap();
    assert!(!record.cert_pem.is_empty());
    assert!(!record.key_pem.is_empty());
    assert!(record.expires_at > Utc::now() + chrono::Duration::days(30));
    assert!(!record.is_wildcard);

    // the store record is the source of truth
    let raw = env
        .store
        .get(&format!("{}certs/test.example.com", common::NAMESPACE))
        .await
        .unwrap()
        .expect("record persisted");
    let stored: DomainCert = serde_json::from_str(&raw).unwrap();
    assert_eq!(stored.domain, "test.example.com");
    assert_eq!(stored.dns_provider, "acme1");
    assert!(stored.cert_pem.contains("BEGIN CERTIFICATE"));

    // and the PEM parses back to the recorded expiry
    let (_, not_after) = certfleet::certificate_validity(&stored.cert_pem).unwrap();
    assert_eq!(not_after, stored.expires_at);
}

#[tokio::test]
async fn test_add_domain_preconditions() {
    let env = env().await;
    env.register_mock_provider("acme1").await;

    let err = env.manager.add_domain("not a domain", "acme1").await.unwrap_err();
    assert!(matches!(err, FleetError::Configuration(_)));

    let err = env
        .manager
        .add_domain("x.example.com", "missing-provider")
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::NotFound(_)));

    env.manager.add_domain("x.example.com", "acme1").await.unwrap();
    let err = env
        .manager
        .add_domain("x.example.com", "acme1")
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::Configuration(_)));
}

#[tokio::test]
async fn test_remove_domain_deletes_record_only() {
    let env = env().await;
    env.register_mock_provider("acme1").await;
    let record = env.manager.add_domain("gone.example.com", "acme1").await.unwrap();

    env.manager.remove_domain("gone.example.com").await.unwrap();
    let err = env
        .manager
        .get_certificate("gone.example.com")
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::NotFound(_)));
    // on-disk files are not garbage-collected
    assert!(std::path::Path::new(&record.cert_path).exists());

    let err = env.manager.remove_domain("gone.example.com").await.unwrap_err();
    assert!(matches!(err, FleetError::NotFound(_)));
}

#[tokio::test]
async fn test_check_renews_only_eligible_certificates() {
    let store = MemoryStore::new();
    let env = env_with(&store, 10).await;
    env.register_mock_provider("acme1").await;

    // a record three days from expiry with R=10 is eligible
    let now = Utc::now();
    let stale = DomainCert {
        domain: "stale.example.com".to_string(),
        cert_path: String::new(),
        key_path: String::new(),
        cert_pem: "old".to_string(),
        key_pem: "old".to_string(),
        issued_at: now - chrono::Duration::days(87),
        expires_at: now + chrono::Duration::days(3),
        is_wildcard: false,
        last_renewal_at: now - chrono::Duration::days(87),
        dns_provider: "acme1".to_string(),
    };
    store
        .put(
            &format!("{}certs/stale.example.com", common::NAMESPACE),
            &serde_json::to_string(&stale).unwrap(),
        )
        .await
        .unwrap();

    let sweep = env.manager.check_certificates().await.unwrap();
    assert_eq!(sweep.checked, 1);
    assert_eq!(sweep.renewed, 1);
    assert_eq!(sweep.failed, 0);

    let renewed = env.manager.get_certificate("stale.example.com").await.unwrap();
    assert!(renewed.last_renewal_at >= now - chrono::Duration::seconds(5));
    assert!(renewed.expires_at > now + chrono::Duration::days(80));
    assert!(renewed.cert_pem.contains("BEGIN CERTIFICATE"));

    // second pass in quick succession sees needs_renewal == false
    let second = env.manager.check_certificates().await.unwrap();
    assert_eq!(second.checked, 1);
    assert_eq!(second.renewed, 0);
}

#[tokio::test]
async fn test_wildcard_auto_deploy_fan_out() {
    let env = env().await;
    env.register_mock_provider("acme1").await;
    env.manager.add_domain("api.example.com", "acme1").await.unwrap();

    let target_a = tempfile::tempdir().unwrap();
    let target_b = tempfile::tempdir().unwrap();
    let a = env
        .manager
        .add_deploy_config(local_deploy_config(
            "*.example.com",
            target_a.path(),
            true,
            &[],
        ))
        .await
        .unwrap();
    let b = env
        .manager
        .add_deploy_config(local_deploy_config(
            "*.example.com",
            target_b.path(),
            true,
            &[],
        ))
        .await
        .unwrap();
    // not eligible: auto-deploy disabled
    env.manager
        .add_deploy_config(local_deploy_config(
            "*.example.com",
            target_a.path(),
            false,
            &[],
        ))
        .await
        .unwrap();
    // not eligible: different domain
    env.manager
        .add_deploy_config(local_deploy_config(
            "other.net",
            target_b.path(),
            true,
            &[],
        ))
        .await
        .unwrap();

    let stats = env
        .manager
        .auto_deploy_after_renewal("api.example.com")
        .await
        .unwrap();
    assert_eq!(stats.attempted, 2);
    assert_eq!(stats.succeeded, 2);
    assert_eq!(stats.failed, 0);

    for id in [&a.id, &b.id] {
        let config = env.manager.get_deploy_config(id).await.unwrap();
        assert!(config.last_deploy_at.is_some());
        assert!(config.last_deploy_error.is_empty());
    }
}

#[tokio::test]
async fn test_add_domain_triggers_async_auto_deploy() {
    let env = env().await;
    env.register_mock_provider("acme1").await;

    let target = tempfile::tempdir().unwrap();
    let config = env
        .manager
        .add_deploy_config(local_deploy_config(
            "auto.example.com",
            target.path(),
            true,
            &[],
        ))
        .await
        .unwrap();

    env.manager.add_domain("auto.example.com", "acme1").await.unwrap();

    // the fan-out is detached from the add_domain call, poll for it
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let current = env.manager.get_deploy_config(&config.id).await.unwrap();
        if current.last_deploy_at.is_some() {
            assert!(current.last_deploy_error.is_empty());
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "auto-deploy should run detached after add_domain"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn test_legacy_filesystem_fallback() {
    let env = env().await;
    env.register_mock_provider("acme1").await;
    let issued = env.manager.add_domain("legacy.example.com", "acme1").await.unwrap();

    // simulate a pre-inline record: paths only, no PEM content
    let now = Utc::now();
    let legacy = DomainCert {
        cert_pem: String::new(),
        key_pem: String::new(),
        cert_path: String::new(),
        key_path: String::new(),
        issued_at: now,
        expires_at: issued.expires_at,
        is_wildcard: false,
        last_renewal_at: now,
        domain: "legacy.example.com".to_string(),
        dns_provider: "acme1".to_string(),
    };
    env.store
        .put(
            &format!("{}certs/legacy.example.com", common::NAMESPACE),
            &serde_json::to_string(&legacy).unwrap(),
        )
        .await
        .unwrap();

    // hydration resolves the newest on-disk pair by mtime
    let record = env.manager.get_certificate("legacy.example.com").await.unwrap();
    assert!(record.cert_pem.contains("BEGIN CERTIFICATE"));
    assert!(!record.key_pem.is_empty());
}

#[tokio::test]
async fn test_dns_provider_crud_and_validation() {
    let env = env().await;

    let err = env
        .manager
        .add_dns_provider("bad", "no-such-provider", Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::Configuration(_)));

    let err = env
        .manager
        .add_dns_provider("cf", "cloudflare", Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::Configuration(_)));

    let mut creds = std::collections::HashMap::new();
    creds.insert("CF_API_TOKEN".to_string(), "token".to_string());
    env.manager
        .add_dns_provider("cf", "cloudflare", creds)
        .await
        .unwrap();

    let listed = env.manager.list_dns_providers().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "cf");

    env.manager.delete_dns_provider("cf").await.unwrap();
    let err = env.manager.get_dns_provider("cf").await.unwrap_err();
    assert!(matches!(err, FleetError::NotFound(_)));
}
