/// Cloudflare DNS provider
use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::dns::{ChallengeProvider, PropagationTiming, challenge_record, default_timing, zone_candidates};
use crate::error::{FleetError, Result};

const API_BASE: &str = "https://api.cloudflare.com/client/v4";

/// Cloudflare authentication: a scoped API token, or the legacy global
/// key plus account email
#[derive(Debug, Clone)]
enum CloudflareAuth {
    Token(String),
    Key { key: String, email: String },
}

/// Cloudflare DNS provider; the zone is discovered by walking the domain
/// labels against the account's zones
#[derive(Debug)]
pub struct CloudflareProvider {
    auth: CloudflareAuth,
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct RecordCreateRequest<'a> {
    r#type: &'a str,
    name: &'a str,
    content: &'a str,
    ttl: u32,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct Zone {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Record {
    id: String,
}

impl CloudflareProvider {
    pub fn from_credentials(credentials: &HashMap<String, String>) -> Result<Self> {
        let auth = if let Some(token) = credentials.get("CF_API_TOKEN") {
            CloudflareAuth::Token(token.clone())
        } else {
            let key = credentials.get("CF_API_KEY").cloned().ok_or_else(|| {
                FleetError::configuration("cloudflare: CF_API_TOKEN or CF_API_KEY required")
            })?;
            let email = credentials.get("CF_API_EMAIL").cloned().ok_or_else(|| {
                FleetError::configuration("cloudflare: CF_API_EMAIL required with CF_API_KEY")
            })?;
            CloudflareAuth::Key { key, email }
        };
        Ok(Self {
            auth,
            http: reqwest::Client::new(),
        })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            CloudflareAuth::Token(token) => req.bearer_auth(token),
            CloudflareAuth::Key { key, email } => req
                .header("X-Auth-Key", key)
                .header("X-Auth-Email", email),
        }
    }

    async fn find_zone(&self, domain: &str) -> Result<Zone> {
        for candidate in zone_candidates(domain) {
            let url = format!("{API_BASE}/zones?name={candidate}");
            let response = self
                .authorize(self.http.get(&url))
                .send()
                .await
                .map_err(|e| {
                    FleetError::acme(domain.to_string(), format!("cloudflare zone lookup: {e}"))
                })?;
            if !response.status().is_success() {
                continue;
            }
            let body: ApiResponse<Vec<Zone>> = response.json().await.map_err(|e| {
                FleetError::acme(domain.to_string(), format!("cloudflare zone response: {e}"))
            })?;
            if let Some(zone) = body.result.unwrap_or_default().into_iter().next() {
                return Ok(zone);
            }
        }
        Err(FleetError::acme(
            domain.to_string(),
            "cloudflare: no zone found for domain".to_string(),
        ))
    }

    async fn find_records(&self, zone: &Zone, name: &str, content: &str) -> Result<Vec<Record>> {
        let url = format!(
            "{API_BASE}/zones/{}/dns_records?type=TXT&name={name}&content={content}",
            zone.id
        );
        let response = self
            .authorize(self.http.get(&url))
            .send()
            .await
            .map_err(|e| FleetError::acme(name.to_string(), format!("cloudflare record list: {e}")))?;
        let body: ApiResponse<Vec<Record>> = response.json().await.map_err(|e| {
            FleetError::acme(name.to_string(), format!("cloudflare record response: {e}"))
        })?;
        Ok(body.result.unwrap_or_default())
    }
}

#[async_trait]
impl ChallengeProvider for CloudflareProvider {
    async fn present(&self, domain: &str, _token: &str, key_auth: &str) -> Result<()> {
        let zone = self.find_zone(domain).await?;
        let name = challenge_record(domain);
        let payload = RecordCreateRequest {
            r#type: "TXT",
            name: &name,
            content: key_auth,
            ttl: self.timing().ttl_secs,
        };
        let url = format!("{API_BASE}/zones/{}/dns_records", zone.id);
        let response = self
            .authorize(self.http.post(&url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                FleetError::acme(domain.to_string(), format!("cloudflare record create: {e}"))
            })?;
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(FleetError::acme(
                domain.to_string(),
                format!("cloudflare record create failed: {text}"),
            ));
        }
        let body: ApiResponse<Record> = response.json().await.map_err(|e| {
            FleetError::acme(domain.to_string(), format!("cloudflare record response: {e}"))
        })?;
        if !body.success {
            return Err(FleetError::acme(
                domain.to_string(),
                "cloudflare rejected the record".to_string(),
            ));
        }
        tracing::debug!(domain, record = %name, "cloudflare TXT record created");
        Ok(())
    }

    async fn cleanup(&self, domain: &str, _token: &str, key_auth: &str) -> Result<()> {
        let zone = self.find_zone(domain).await?;
        let name = challenge_record(domain);
        for record in self.find_records(&zone, &name, key_auth).await? {
            let url = format!("{API_BASE}/zones/{}/dns_records/{}", zone.id, record.id);
            let response = self
                .authorize(self.http.delete(&url))
                .send()
                .await
                .map_err(|e| {
                    FleetError::acme(domain.to_string(), format!("cloudflare record delete: {e}"))
                })?;
            if !response.status().is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(FleetError::acme(
                    domain.to_string(),
                    format!("cloudflare record delete failed: {text}"),
                ));
            }
        }
        tracing::debug!(domain, record = %name, "cloudflare TXT record removed");
        Ok(())
    }

    fn timing(&self) -> PropagationTiming {
        default_timing("cloudflare")
    }
}
