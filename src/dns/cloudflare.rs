use anyhow::{Context, Result, anyhow};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::{DnsProviderAdapter, RecordType, http};
use crate::domain::{challenge_record_name, matches_zone};
use crate::error::RenewalError;

const API_BASE: &str = "https://api.cloudflare.com/client/v4";

pub struct CloudflareAdapter {
    api_token: String,
    /// Operator-pinned zone id; skips discovery entirely.
    zone_override: Option<String>,
    zone_cache: Option<String>,
}

#[derive(Deserialize)]
struct CloudflareZone {
    id: String,
    name: String,
}

#[derive(Deserialize)]
struct CloudflareZoneListResponse {
    result: Vec<CloudflareZone>,
    success: bool,
}

#[derive(Serialize)]
struct CloudflareDnsRecord {
    #[serde(rename = "type")]
    record_type: String,
    name: String,
    content: String,
    ttl: u32,
}

#[derive(Deserialize)]
struct CloudflareDnsRecordResult {
    id: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct CloudflareDnsRecordResponse {
    result: Option<CloudflareDnsRecordResult>,
    success: bool,
}

#[derive(Deserialize)]
struct CloudflareDnsRecordListResponse {
    result: Vec<CloudflareDnsRecordResult>,
    success: bool,
}

impl CloudflareAdapter {
    pub fn new(api_token: String, zone_override: Option<String>) -> Self {
        Self {
            api_token,
            zone_override,
            zone_cache: None,
        }
    }

    fn format_txt_content(value: &str) -> String {
        let trimmed = value.trim();
        if trimmed.starts_with('"') && trimmed.ends_with('"') {
            trimmed.to_string()
        } else {
            format!("\"{}\"", trimmed.trim_matches('"'))
        }
    }

    fn auth(&self, request: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        request
            .header("Authorization", format!("Bearer {}", self.api_token))
            .header("Content-Type", "application/json")
    }

    /// Longest-suffix match over the zones the token can list.
    fn discover_zone_id(&mut self, fqdn: &str) -> Result<String> {
        if let Some(zone_id) = &self.zone_override {
            return Ok(zone_id.clone());
        }
        if let Some(zone_id) = &self.zone_cache {
            return Ok(zone_id.clone());
        }

        let client = http::HttpClient::shared();
        let response = self
            .auth(client.get(format!("{API_BASE}/zones")))
            .send()
            .context("Failed to list Cloudflare zones")?;

        if !response.status().is_success() {
            if response.status() == 401 || response.status() == 403 {
                return Err(anyhow!("Cloudflare authentication failed: invalid API token"));
            }
            return Err(http::status_error("Cloudflare", response.status(), None));
        }

        let zone_list: CloudflareZoneListResponse = response
            .json()
            .context("Failed to parse Cloudflare zone list response")?;
        if !zone_list.success {
            return Err(anyhow!("Cloudflare API returned unsuccessful response"));
        }

        let zone = zone_list
            .result
            .iter()
            .filter(|zone| matches_zone(fqdn, &zone.name))
            .max_by_key(|zone| zone.name.len())
            .ok_or_else(|| anyhow!(RenewalError::ZoneNotFound(fqdn.to_string())))?;

        debug!("[dns-cloudflare] zone {} hosts {fqdn}", zone.name);
        self.zone_cache = Some(zone.id.clone());
        Ok(zone.id.clone())
    }

    fn list_txt_records(
        &mut self,
        zone_id: &str,
        record_name: &str,
    ) -> Result<Vec<CloudflareDnsRecordResult>> {
        let client = http::HttpClient::shared();
        let response = self
            .auth(client.get(format!(
                "{API_BASE}/zones/{zone_id}/dns_records?type=TXT&name={record_name}"
            )))
            .send()
            .context("Failed to list Cloudflare DNS records")?;

        if !response.status().is_success() {
            return Err(http::status_error("Cloudflare", response.status(), None));
        }
        let list: CloudflareDnsRecordListResponse = response
            .json()
            .context("Failed to parse Cloudflare DNS record list")?;
        if !list.success {
            return Err(anyhow!("Cloudflare API returned unsuccessful response"));
        }
        Ok(list.result)
    }

    fn post_record(&mut self, zone_id: &str, record: &CloudflareDnsRecord) -> Result<String> {
        let client = http::HttpClient::shared();
        let response = self
            .auth(client.post(format!("{API_BASE}/zones/{zone_id}/dns_records")))
            .json(record)
            .send()
            .context("Failed to create Cloudflare DNS record")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().unwrap_or_default();
            return Err(http::status_error("Cloudflare", status, Some(error_text)));
        }

        let result: CloudflareDnsRecordResponse = response
            .json()
            .context("Failed to parse Cloudflare DNS record response")?;
        if !result.success {
            return Err(anyhow!("Cloudflare API returned unsuccessful response"));
        }
        result
            .result
            .map(|record| record.id)
            .ok_or_else(|| anyhow!("Cloudflare API did not return record ID"))
    }
}

impl DnsProviderAdapter for CloudflareAdapter {
    fn create_txt_record(&mut self, fqdn: &str, value: &str) -> Result<String> {
        let zone_id = self.discover_zone_id(fqdn)?;
        let record = CloudflareDnsRecord {
            record_type: "TXT".to_string(),
            name: challenge_record_name(fqdn),
            content: Self::format_txt_content(value),
            ttl: 120,
        };
        self.post_record(&zone_id, &record)
    }

    fn cleanup_txt_records(&mut self, fqdn: &str) -> Result<()> {
        let zone_id = self.discover_zone_id(fqdn)?;
        let record_name = challenge_record_name(fqdn);
        let records = self.list_txt_records(&zone_id, &record_name)?;
        for record in records {
            self.delete_txt_record(&record.id)?;
        }
        Ok(())
    }

    fn delete_txt_record(&mut self, record_id: &str) -> Result<()> {
        // Deletion always follows a create or cleanup in the same renewal, so
        // the zone is already cached.
        let Some(zone_id) = self.zone_cache.clone().or_else(|| self.zone_override.clone())
        else {
            warn!("[dns-cloudflare] no zone known for record {record_id}, skipping delete");
            return Ok(());
        };
        let client = http::HttpClient::shared();
        let response = self
            .auth(client.delete(format!("{API_BASE}/zones/{zone_id}/dns_records/{record_id}")))
            .send()
            .context("Failed to delete Cloudflare DNS record")?;

        if response.status() == 404 {
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(http::status_error("Cloudflare", response.status(), None));
        }
        Ok(())
    }

    fn verify_txt_record(&mut self, fqdn: &str, expected_value: &str) -> Result<bool> {
        let zone_id = self.discover_zone_id(fqdn)?;
        let record_name = challenge_record_name(fqdn);
        let expected = Self::format_txt_content(expected_value);
        let records = self.list_txt_records(&zone_id, &record_name)?;
        Ok(records
            .iter()
            .any(|record| record.content.as_deref() == Some(expected.as_str())))
    }

    fn create_dns_record(
        &mut self,
        name: &str,
        value: &str,
        record_type: RecordType,
    ) -> Result<()> {
        let zone_id = self.discover_zone_id(name)?;
        let content = match record_type {
            RecordType::Txt => Self::format_txt_content(value),
            RecordType::Cname => value.trim_end_matches('.').to_string(),
        };
        let record = CloudflareDnsRecord {
            record_type: record_type.as_str().to_string(),
            name: name.to_string(),
            content,
            ttl: 120,
        };
        self.post_record(&zone_id, &record)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::CloudflareAdapter;

    #[test]
    fn txt_content_is_quoted_once() {
        assert_eq!(CloudflareAdapter::format_txt_content("abc"), "\"abc\"");
        assert_eq!(CloudflareAdapter::format_txt_content("\"abc\""), "\"abc\"");
        assert_eq!(CloudflareAdapter::format_txt_content("  abc  "), "\"abc\"");
    }
}
