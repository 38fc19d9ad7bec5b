use anyhow::{Context, Result, anyhow};
use log::debug;
use serde::{Deserialize, Serialize};

use super::{DnsProviderAdapter, RecordType, http};
use crate::domain::{challenge_record_name, matches_zone};
use crate::error::RenewalError;

const API_BASE: &str = "https://api.digitalocean.com/v2";

pub struct DigitalOceanAdapter {
    api_token: String,
    domain_cache: Option<String>,
}

#[derive(Deserialize)]
struct DigitalOceanDomain {
    name: String,
}

#[derive(Deserialize)]
struct DigitalOceanDomainListResponse {
    domains: Vec<DigitalOceanDomain>,
}

#[derive(Serialize)]
struct DigitalOceanDnsRecord {
    #[serde(rename = "type")]
    record_type: String,
    name: String,
    data: String,
    ttl: u32,
}

#[derive(Deserialize)]
struct DigitalOceanDnsRecordResponse {
    domain_record: DigitalOceanDnsRecordResult,
}

#[derive(Deserialize)]
struct DigitalOceanDnsRecordResult {
    id: u64,
}

#[derive(Deserialize)]
struct DigitalOceanDnsRecordListItem {
    id: u64,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Deserialize)]
struct DigitalOceanDnsRecordListResponse {
    domain_records: Vec<DigitalOceanDnsRecordListItem>,
}

impl DigitalOceanAdapter {
    pub fn new(api_token: String) -> Self {
        Self {
            api_token,
            domain_cache: None,
        }
    }

    /// DigitalOcean keys records by registered domain; discover it by
    /// longest-suffix match over the account's domains.
    fn discover_domain(&mut self, fqdn: &str) -> Result<String> {
        if let Some(domain) = &self.domain_cache {
            return Ok(domain.clone());
        }

        let client = http::HttpClient::shared();
        let response = client
            .get(format!("{API_BASE}/domains"))
            .header("Authorization", format!("Bearer {}", self.api_token))
            .send()
            .context("Failed to list DigitalOcean domains")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(http::status_error("DigitalOcean", status, Some(body)));
        }

        let list: DigitalOceanDomainListResponse = response
            .json()
            .context("Failed to parse DigitalOcean domain list")?;

        let domain = list
            .domains
            .iter()
            .filter(|domain| matches_zone(fqdn, &domain.name))
            .max_by_key(|domain| domain.name.len())
            .ok_or_else(|| anyhow!(RenewalError::ZoneNotFound(fqdn.to_string())))?;

        debug!("[dns-digitalocean] domain {} hosts {fqdn}", domain.name);
        self.domain_cache = Some(domain.name.clone());
        Ok(domain.name.clone())
    }

    /// "_acme-challenge.host.example.com" under "example.com" becomes
    /// "_acme-challenge.host"; the apex becomes "@".
    fn to_relative_name(domain: &str, record_name: &str) -> String {
        let record_name = record_name.trim_end_matches('.');
        let domain = domain.trim_end_matches('.');
        if record_name == domain {
            "@".to_string()
        } else if let Some(relative) = record_name.strip_suffix(&format!(".{domain}")) {
            relative.to_string()
        } else {
            record_name.to_string()
        }
    }

    fn format_txt_content(value: &str) -> String {
        value.trim().trim_matches('"').trim().to_string()
    }

    fn list_txt_records(
        &self,
        domain: &str,
        relative_name: &str,
    ) -> Result<Vec<DigitalOceanDnsRecordListItem>> {
        let client = http::HttpClient::shared();
        let response = client
            .get(format!(
                "{API_BASE}/domains/{domain}/records?type=TXT&name={relative_name}"
            ))
            .header("Authorization", format!("Bearer {}", self.api_token))
            .send()
            .context("Failed to list DigitalOcean DNS records")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(http::status_error("DigitalOcean", status, Some(body)));
        }

        let list: DigitalOceanDnsRecordListResponse = response
            .json()
            .context("Failed to parse DigitalOcean DNS record list")?;
        Ok(list.domain_records)
    }

    fn post_record(&self, domain: &str, record: &DigitalOceanDnsRecord) -> Result<u64> {
        let client = http::HttpClient::shared();
        let response = client
            .post(format!("{API_BASE}/domains/{domain}/records"))
            .header("Authorization", format!("Bearer {}", self.api_token))
            .header("Content-Type", "application/json")
            .json(record)
            .send()
            .context("Failed to create DigitalOcean DNS record")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().unwrap_or_default();
            return Err(http::status_error("DigitalOcean", status, Some(error_text)));
        }

        let result: DigitalOceanDnsRecordResponse = response
            .json()
            .context("Failed to parse DigitalOcean DNS record response")?;
        Ok(result.domain_record.id)
    }
}

impl DnsProviderAdapter for DigitalOceanAdapter {
    fn create_txt_record(&mut self, fqdn: &str, value: &str) -> Result<String> {
        let domain = self.discover_domain(fqdn)?;
        let record = DigitalOceanDnsRecord {
            record_type: "TXT".to_string(),
            name: Self::to_relative_name(&domain, &challenge_record_name(fqdn)),
            data: Self::format_txt_content(value),
            ttl: 300,
        };
        let id = self.post_record(&domain, &record)?;
        Ok(id.to_string())
    }

    fn cleanup_txt_records(&mut self, fqdn: &str) -> Result<()> {
        let domain = self.discover_domain(fqdn)?;
        let relative = Self::to_relative_name(&domain, &challenge_record_name(fqdn));
        let records = self.list_txt_records(&domain, &relative)?;
        for record in records {
            self.delete_txt_record(&record.id.to_string())?;
        }
        Ok(())
    }

    fn delete_txt_record(&mut self, record_id: &str) -> Result<()> {
        let Some(domain) = self.domain_cache.clone() else {
            log::warn!("[dns-digitalocean] no domain known for record {record_id}, skipping delete");
            return Ok(());
        };
        let client = http::HttpClient::shared();
        let response = client
            .delete(format!("{API_BASE}/domains/{domain}/records/{record_id}"))
            .header("Authorization", format!("Bearer {}", self.api_token))
            .send()
            .context("Failed to delete DigitalOcean DNS record")?;

        // 404 is fine, record already gone.
        if response.status().is_success() || response.status() == 404 {
            Ok(())
        } else {
            Err(http::status_error("DigitalOcean", response.status(), None))
        }
    }

    fn verify_txt_record(&mut self, fqdn: &str, expected_value: &str) -> Result<bool> {
        let domain = self.discover_domain(fqdn)?;
        let relative = Self::to_relative_name(&domain, &challenge_record_name(fqdn));
        let expected = Self::format_txt_content(expected_value);
        let records = self.list_txt_records(&domain, &relative)?;
        Ok(records.iter().any(|record| {
            record
                .data
                .as_deref()
                .map(Self::format_txt_content)
                .as_deref()
                == Some(expected.as_str())
        }))
    }

    fn create_dns_record(
        &mut self,
        name: &str,
        value: &str,
        record_type: RecordType,
    ) -> Result<()> {
        let domain = self.discover_domain(name)?;
        let data = match record_type {
            RecordType::Txt => Self::format_txt_content(value),
            // DigitalOcean requires CNAME targets to be absolute.
            RecordType::Cname => format!("{}.", value.trim_end_matches('.')),
        };
        let record = DigitalOceanDnsRecord {
            record_type: record_type.as_str().to_string(),
            name: Self::to_relative_name(&domain, name),
            data,
            ttl: 300,
        };
        self.post_record(&domain, &record)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::DigitalOceanAdapter;

    #[test]
    fn relative_name_strips_the_domain() {
        assert_eq!(
            DigitalOceanAdapter::to_relative_name(
                "example.com",
                "_acme-challenge.ucm01.example.com"
            ),
            "_acme-challenge.ucm01"
        );
    }

    #[test]
    fn apex_becomes_at() {
        assert_eq!(
            DigitalOceanAdapter::to_relative_name("example.com", "example.com"),
            "@"
        );
    }

    #[test]
    fn foreign_names_pass_through() {
        assert_eq!(
            DigitalOceanAdapter::to_relative_name("example.com", "other.net"),
            "other.net"
        );
    }

    #[test]
    fn txt_content_is_unquoted() {
        assert_eq!(DigitalOceanAdapter::format_txt_content("\"abc\""), "abc");
        assert_eq!(DigitalOceanAdapter::format_txt_content(" abc "), "abc");
    }
}
