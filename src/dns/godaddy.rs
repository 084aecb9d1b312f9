/// GoDaddy DNS provider
use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::dns::{ChallengeProvider, PropagationTiming, challenge_record, default_timing, zone_candidates};
use crate::error::{FleetError, Result};

const API_BASE: &str = "https://api.godaddy.com/v1";

/// GoDaddy DNS provider authenticated with an API key/secret pair
#[derive(Debug)]
pub struct GodaddyProvider {
    api_key: String,
    api_secret: String,
    http: reqwest::Client,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TxtRecord {
    name: String,
    data: String,
    ttl: u32,
}

impl GodaddyProvider {
    pub fn from_credentials(credentials: &HashMap<String, String>) -> Result<Self> {
        let api_key = credentials.get("GODADDY_API_KEY").cloned().ok_or_else(|| {
            FleetError::configuration("godaddy: GODADDY_API_KEY required")
        })?;
        let api_secret = credentials
            .get("GODADDY_API_SECRET")
            .cloned()
            .ok_or_else(|| FleetError::configuration("godaddy: GODADDY_API_SECRET required"))?;
        Ok(Self {
            api_key,
            api_secret,
            http: reqwest::Client::new(),
        })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header(
            "Authorization",
            format!("sso-key {}:{}", self.api_key, self.api_secret),
        )
    }

    async fn find_root(&self, domain: &str) -> Result<String> {
        for candidate in zone_candidates(domain) {
            let url = format!("{API_BASE}/domains/{candidate}");
            let response = self
                .authorize(self.http.get(&url))
                .send()
                .await
                .map_err(|e| {
                    FleetError::acme(domain.to_string(), format!("godaddy domain lookup: {e}"))
                })?;
            if response.status().is_success() {
                return Ok(candidate);
            }
        }
        Err(FleetError::acme(
            domain.to_string(),
            "godaddy: no registered domain found".to_string(),
        ))
    }

    async fn txt_records(&self, domain: &str, root: &str) -> Result<Vec<TxtRecord>> {
        let url = format!("{API_BASE}/domains/{root}/records/TXT");
        let response = self
            .authorize(self.http.get(&url))
            .send()
            .await
            .map_err(|e| FleetError::acme(domain.to_string(), format!("godaddy record list: {e}")))?;
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(FleetError::acme(
                domain.to_string(),
                format!("godaddy record list failed: {text}"),
            ));
        }
        response.json().await.map_err(|e| {
            FleetError::acme(domain.to_string(), format!("godaddy record response: {e}"))
        })
    }

    /// GoDaddy replaces the whole TXT record set on PUT
    async fn put_txt_records(
        &self,
        domain: &str,
        root: &str,
        records: &[TxtRecord],
    ) -> Result<()> {
        let url = format!("{API_BASE}/domains/{root}/records/TXT");
        let response = self
            .authorize(self.http.put(&url))
            .json(records)
            .send()
            .await
            .map_err(|e| {
                FleetError::acme(domain.to_string(), format!("godaddy record update: {e}"))
            })?;
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(FleetError::acme(
                domain.to_string(),
                format!("godaddy record update failed: {text}"),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ChallengeProvider for GodaddyProvider {
    async fn present(&self, domain: &str, _token: &str, key_auth: &str) -> Result<()> {
        let root = self.find_root(domain).await?;
        let fqdn = challenge_record(domain);
        let relative = fqdn
            .strip_suffix(&format!(".{root}"))
            .unwrap_or(fqdn.as_str())
            .to_string();

        let mut records = self.txt_records(domain, &root).await?;
        records.retain(|r| !(r.name == relative && r.data == key_auth));
        records.push(TxtRecord {
            name: relative,
            data: key_auth.to_string(),
            ttl: self.timing().ttl_secs,
        });
        self.put_txt_records(domain, &root, &records).await?;
        tracing::debug!(domain, record = %fqdn, "godaddy TXT record created");
        Ok(())
    }

    async fn cleanup(&self, domain: &str, _token: &str, key_auth: &str) -> Result<()> {
        let root = self.find_root(domain).await?;
        let fqdn = challenge_record(domain);
        let relative = fqdn
            .strip_suffix(&format!(".{root}"))
            .unwrap_or(fqdn.as_str());

        let mut records = self.txt_records(domain, &root).await?;
        let before = records.len();
        records.retain(|r| !(r.name == relative && r.data == key_auth));
        if records.len() != before {
            // GoDaddy rejects an empty record set; keep a placeholder.
            if records.is_empty() {
                records.push(TxtRecord {
                    name: "_certfleet".to_string(),
                    data: "cleanup".to_string(),
                    ttl: 600,
                });
            }
            self.put_txt_records(domain, &root, &records).await?;
        }
        tracing::debug!(domain, record = %fqdn, "godaddy TXT record removed");
        Ok(())
    }

    fn timing(&self) -> PropagationTiming {
        default_timing("godaddy")
    }
}
