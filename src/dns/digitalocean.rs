/// DigitalOcean DNS provider
use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::dns::{ChallengeProvider, PropagationTiming, challenge_record, default_timing, zone_candidates};
use crate::error::{FleetError, Result};

const API_BASE: &str = "https://api.digitalocean.com/v2";

/// DigitalOcean DNS provider authenticated with a personal access token
#[derive(Debug)]
pub struct DigitalOceanProvider {
    token: String,
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct RecordCreateRequest<'a> {
    r#type: &'a str,
    name: &'a str,
    data: &'a str,
    ttl: u32,
}

#[derive(Debug, Deserialize)]
struct RecordsResponse {
    domain_records: Vec<DomainRecord>,
}

#[derive(Debug, Deserialize)]
struct DomainRecord {
    id: u64,
    name: String,
    data: String,
}

impl DigitalOceanProvider {
    pub fn from_credentials(credentials: &HashMap<String, String>) -> Result<Self> {
        let token = credentials.get("DO_AUTH_TOKEN").cloned().ok_or_else(|| {
            FleetError::configuration("digitalocean: DO_AUTH_TOKEN required")
        })?;
        Ok(Self {
            token,
            http: reqwest::Client::new(),
        })
    }

    /// The registered root is the longest label suffix the account owns
    async fn find_root(&self, domain: &str) -> Result<String> {
        for candidate in zone_candidates(domain) {
            let url = format!("{API_BASE}/domains/{candidate}");
            let response = self
                .http
                .get(&url)
                .bearer_auth(&self.token)
                .send()
                .await
                .map_err(|e| {
                    FleetError::acme(domain.to_string(), format!("digitalocean domain lookup: {e}"))
                })?;
            if response.status().is_success() {
                return Ok(candidate);
            }
        }
        Err(FleetError::acme(
            domain.to_string(),
            "digitalocean: no registered domain found".to_string(),
        ))
    }
}

#[async_trait]
impl ChallengeProvider for DigitalOceanProvider {
    async fn present(&self, domain: &str, _token: &str, key_auth: &str) -> Result<()> {
        let root = self.find_root(domain).await?;
        let fqdn = challenge_record(domain);
        let relative = fqdn
            .strip_suffix(&format!(".{root}"))
            .unwrap_or(fqdn.as_str());
        let payload = RecordCreateRequest {
            r#type: "TXT",
            name: relative,
            data: key_auth,
            ttl: self.timing().ttl_secs,
        };
        let url = format!("{API_BASE}/domains/{root}/records");
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                FleetError::acme(domain.to_string(), format!("digitalocean record create: {e}"))
            })?;
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(FleetError::acme(
                domain.to_string(),
                format!("digitalocean record create failed: {text}"),
            ));
        }
        tracing::debug!(domain, record = %fqdn, "digitalocean TXT record created");
        Ok(())
    }

    async fn cleanup(&self, domain: &str, _token: &str, key_auth: &str) -> Result<()> {
        let root = self.find_root(domain).await?;
        let fqdn = challenge_record(domain);
        let relative = fqdn
            .strip_suffix(&format!(".{root}"))
            .unwrap_or(fqdn.as_str());
        let url = format!("{API_BASE}/domains/{root}/records?type=TXT&name={fqdn}");
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| {
                FleetError::acme(domain.to_string(), format!("digitalocean record list: {e}"))
            })?;
        let body: RecordsResponse = response.json().await.map_err(|e| {
            FleetError::acme(domain.to_string(), format!("digitalocean record response: {e}"))
        })?;

        for record in body
            .domain_records
            .iter()
            .filter(|r| r.name == relative && r.data == key_auth)
        {
            let url = format!("{API_BASE}/domains/{root}/records/{}", record.id);
            let response = self
                .http
                .delete(&url)
                .bearer_auth(&self.token)
                .send()
                .await
                .map_err(|e| {
                    FleetError::acme(domain.to_string(), format!("digitalocean record delete: {e}"))
                })?;
            if !response.status().is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(FleetError::acme(
                    domain.to_string(),
                    format!("digitalocean record delete failed: {text}"),
                ));
            }
        }
        tracing::debug!(domain, record = %fqdn, "digitalocean TXT record removed");
        Ok(())
    }

    fn timing(&self) -> PropagationTiming {
        default_timing("digitalocean")
    }
}
