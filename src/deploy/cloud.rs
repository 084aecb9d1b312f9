//! Cloud SSL platform deployment.
//!
//! The vendor SDK sits behind [`CloudSslApi`]; the core uploads the
//! certificate, selects the account's SSL-eligible resources matching the
//! configured target domain, creates and starts a deployment job, and
//! polls it for a bounded time. Reaching the poll ceiling is not a deploy
//! failure: the cloud job continues asynchronously.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::deploy::certificate_material;
use crate::error::{FleetError, Result};
use crate::types::{CloudDeployConfig, DomainCert, domain_matches, file_timestamp};

/// Resource tags the SSL deployment service can target
pub const SSL_RESOURCE_TAGS: &[&str] = &[
    "CDN",
    "DCDN",
    "OSS",
    "SLB",
    "ALB",
    "NLB",
    "WAF",
    "GA",
    "LIVE",
    "VOD",
    "APIGateway",
    "FC",
    "MSE",
    "SAE",
    "CR",
    "webHosting",
    "DDoS",
];

const JOB_POLL_INTERVAL: Duration = Duration::from_secs(10);
const JOB_POLL_CEILING: Duration = Duration::from_secs(5 * 60);
const DEFAULT_CONTACT: &str = "default";

/// An SSL-eligible resource in the vendor account
#[derive(Debug, Clone)]
pub struct CloudResource {
    pub id: String,
    pub domain: String,
    pub resource_type: String,
}

/// State of a deployment job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudJobStatus {
    Pending,
    Running,
    Succeeded,
    Failed(String),
}

/// Contract of a cloud vendor's certificate service
#[async_trait]
pub trait CloudSslApi: Send + Sync {
    /// Upload the certificate pair; returns the vendor certificate id
    async fn upload_certificate(&self, name: &str, cert_pem: &str, key_pem: &str)
    -> Result<String>;

    async fn list_ssl_resources(&self) -> Result<Vec<CloudResource>>;

    async fn list_contacts(&self) -> Result<Vec<String>>;

    async fn create_deploy_job(
        &self,
        cert_id: &str,
        resource_ids: &[String],
        contacts: &[String],
    ) -> Result<String>;

    async fn start_deploy_job(&self, job_id: &str) -> Result<()>;

    async fn deploy_job_status(&self, job_id: &str) -> Result<CloudJobStatus>;

    /// Non-mutating connectivity check
    async fn probe(&self) -> Result<()>;
}

/// Factory resolving a cloud deploy config to a vendor adapter
pub type CloudApiFactory =
    Arc<dyn Fn(&CloudDeployConfig) -> Result<Arc<dyn CloudSslApi>> + Send + Sync>;

/// Upload, target, start and poll a deployment
pub async fn deploy(
    api: &dyn CloudSslApi,
    config: &CloudDeployConfig,
    cert: &DomainCert,
) -> Result<()> {
    for tag in &config.resource_types {
        if !SSL_RESOURCE_TAGS.contains(&tag.as_str()) {
            return Err(FleetError::configuration(format!(
                "unknown SSL resource type {tag:?}"
            )));
        }
    }
    let (cert_bytes, key_bytes) = certificate_material(cert).await?;
    let cert_pem = String::from_utf8_lossy(&cert_bytes).into_owned();
    let key_pem = String::from_utf8_lossy(&key_bytes).into_owned();

    let name = format!(
        "{}-{}",
        cert.domain.replace("*.", "wildcard.").replace('.', "-"),
        file_timestamp(Utc::now())
    );
    let cert_id = api.upload_certificate(&name, &cert_pem, &key_pem).await?;

    let resources = api.list_ssl_resources().await?;
    let selected: Vec<String> = resources
        .iter()
        .filter(|r| domain_matches(&config.target_domain, &r.domain))
        .filter(|r| {
            config.resource_types.is_empty() || config.resource_types.contains(&r.resource_type)
        })
        .map(|r| r.id.clone())
        .collect();
    if selected.is_empty() {
        return Err(FleetError::deploy(format!(
            "cloud: no SSL-eligible resources match {:?}",
            config.target_domain
        )));
    }

    let mut contacts = api.list_contacts().await?;
    if contacts.is_empty() {
        contacts.push(DEFAULT_CONTACT.to_string());
    }

    let job_id = api
        .create_deploy_job(&cert_id, &selected, &contacts)
        .await?;
    api.start_deploy_job(&job_id).await?;
    tracing::info!(
        domain = %cert.domain,
        job = %job_id,
        resources = selected.len(),
        "cloud deployment job started"
    );

    let deadline = tokio::time::Instant::now() + JOB_POLL_CEILING;
    loop {
        match api.deploy_job_status(&job_id).await? {
            CloudJobStatus::Succeeded => {
                tracing::info!(job = %job_id, "cloud deployment job succeeded");
                return Ok(());
            }
            CloudJobStatus::Failed(reason) => {
                return Err(FleetError::deploy(format!(
                    "cloud deployment job {job_id} failed: {reason}"
                )));
            }
            CloudJobStatus::Pending | CloudJobStatus::Running => {}
        }
        if tokio::time::Instant::now() + JOB_POLL_INTERVAL >= deadline {
            // Not a failure: the job keeps running on the vendor side.
            tracing::warn!(
                job = %job_id,
                ceiling = ?JOB_POLL_CEILING,
                "cloud deployment job still running at poll ceiling"
            );
            return Ok(());
        }
        tokio::time::sleep(JOB_POLL_INTERVAL).await;
    }
}

/// In-process vendor adapter for tests
pub struct MockCloudApi {
    resources: Vec<CloudResource>,
    contacts: Vec<String>,
    /// Polls a job reports `Running` before succeeding
    polls_until_success: u32,
    fail_job: Option<String>,
    uploaded: Mutex<Vec<String>>,
    jobs: Mutex<HashMap<String, u32>>,
}

impl MockCloudApi {
    pub fn new(resources: Vec<CloudResource>) -> Self {
        Self {
            resources,
            contacts: vec!["ops@example.com".to_string()],
            polls_until_success: 0,
            fail_job: None,
            uploaded: Mutex::new(Vec::new()),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_failing_job(mut self, reason: &str) -> Self {
        self.fail_job = Some(reason.to_string());
        self
    }

    pub fn uploaded_count(&self) -> usize {
        self.uploaded.lock().expect("uploads").len()
    }
}

#[async_trait]
impl CloudSslApi for MockCloudApi {
    async fn upload_certificate(
        &self,
        name: &str,
        _cert_pem: &str,
        _key_pem: &str,
    ) -> Result<String> {
        self.uploaded.lock().expect("uploads").push(name.to_string());
        Ok(format!("cert-{name}"))
    }

    async fn list_ssl_resources(&self) -> Result<Vec<CloudResource>> {
        Ok(self.resources.clone())
    }

    async fn list_contacts(&self) -> Result<Vec<String>> {
        Ok(self.contacts.clone())
    }

    async fn create_deploy_job(
        &self,
        cert_id: &str,
        resource_ids: &[String],
        _contacts: &[String],
    ) -> Result<String> {
        let job_id = format!("job-{cert_id}-{}", resource_ids.len());
        self.jobs.lock().expect("jobs").insert(job_id.clone(), 0);
        Ok(job_id)
    }

    async fn start_deploy_job(&self, _job_id: &str) -> Result<()> {
        Ok(())
    }

    async fn deploy_job_status(&self, job_id: &str) -> Result<CloudJobStatus> {
        if let Some(reason) = &self.fail_job {
            return Ok(CloudJobStatus::Failed(reason.clone()));
        }
        let mut jobs = self.jobs.lock().expect("jobs");
        let polls = jobs.entry(job_id.to_string()).or_insert(0);
        *polls += 1;
        if *polls > self.polls_until_success {
            Ok(CloudJobStatus::Succeeded)
        } else {
            Ok(CloudJobStatus::Running)
        }
    }

    async fn probe(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cert() -> DomainCert {
        let now = Utc::now();
        DomainCert {
            domain: "cdn.example.com".into(),
            cert_path: String::new(),
            key_path: String::new(),
            cert_pem: "cert".into(),
            key_pem: "key".into(),
            issued_at: now,
            expires_at: now + chrono::Duration::days(90),
            is_wildcard: false,
            last_renewal_at: now,
            dns_provider: "mock".into(),
        }
    }

    fn config() -> CloudDeployConfig {
        CloudDeployConfig {
            provider: "mock".into(),
            access_key_id: "id".into(),
            access_key_secret: "secret".into(),
            target_domain: "*.example.com".into(),
            resource_types: vec![],
        }
    }

    #[tokio::test]
    async fn test_deploy_targets_matching_resources() {
        let api = MockCloudApi::new(vec![
            CloudResource {
                id: "r1".into(),
                domain: "cdn.example.com".into(),
                resource_type: "CDN".into(),
            },
            CloudResource {
                id: "r2".into(),
                domain: "other.net".into(),
                resource_type: "SLB".into(),
            },
        ]);
        deploy(&api, &config(), &cert()).await.unwrap();
        assert_eq!(api.uploaded_count(), 1);
    }

    #[tokio::test]
    async fn test_deploy_fails_without_matching_resources() {
        let api = MockCloudApi::new(vec![CloudResource {
            id: "r1".into(),
            domain: "unrelated.org".into(),
            resource_type: "CDN".into(),
        }]);
        let err = deploy(&api, &config(), &cert()).await.unwrap_err();
        assert!(matches!(err, FleetError::Deploy(_)));
    }

    #[tokio::test]
    async fn test_failed_job_surfaces_reason() {
        let api = MockCloudApi::new(vec![CloudResource {
            id: "r1".into(),
            domain: "cdn.example.com".into(),
            resource_type: "CDN".into(),
        }])
        .with_failing_job("quota exceeded");
        let err = deploy(&api, &config(), &cert()).await.unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
    }
}
