use anyhow::{Context, Result, anyhow};
use log::debug;
use serde::Deserialize;
use serde_json::json;

use super::{DnsProviderAdapter, RecordType, http};
use crate::domain::{challenge_record_name, matches_zone};
use crate::error::RenewalError;

const ARM_BASE: &str = "https://management.azure.com";
const API_VERSION: &str = "2018-05-01";

/// Azure DNS over the ARM REST API. Authenticates with a service principal
/// via the OAuth2 client-credentials grant; the token is cached for the
/// lifetime of the adapter (one renewal).
pub struct AzureDnsAdapter {
    tenant_id: String,
    client_id: String,
    client_secret: String,
    subscription_id: String,
    resource_group: String,
    token_cache: Option<String>,
    zone_cache: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct ZoneListResponse {
    value: Vec<Zone>,
}

#[derive(Deserialize)]
struct Zone {
    name: String,
}

#[derive(Deserialize)]
struct TxtRecordSet {
    #[serde(default)]
    properties: Option<TxtRecordSetProperties>,
}

#[derive(Deserialize)]
struct TxtRecordSetProperties {
    #[serde(rename = "TXTRecords", default)]
    txt_records: Vec<TxtValue>,
}

#[derive(Deserialize)]
struct TxtValue {
    #[serde(default)]
    value: Vec<String>,
}

impl AzureDnsAdapter {
    pub fn new(
        tenant_id: String,
        client_id: String,
        client_secret: String,
        subscription_id: String,
        resource_group: String,
    ) -> Self {
        Self {
            tenant_id,
            client_id,
            client_secret,
            subscription_id,
            resource_group,
            token_cache: None,
            zone_cache: None,
        }
    }

    fn access_token(&mut self) -> Result<String> {
        if let Some(token) = &self.token_cache {
            return Ok(token.clone());
        }

        let client = http::HttpClient::shared();
        let url = format!(
            "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
            self.tenant_id
        );
        let response = client
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", "https://management.azure.com/.default"),
            ])
            .send()
            .context("Failed to request Azure access token")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(http::status_error("Azure DNS", status, Some(body)));
        }

        let token: TokenResponse = response
            .json()
            .context("Failed to parse Azure token response")?;
        self.token_cache = Some(token.access_token.clone());
        Ok(token.access_token)
    }

    fn discover_zone(&mut self, fqdn: &str) -> Result<String> {
        if let Some(zone) = &self.zone_cache {
            return Ok(zone.clone());
        }

        let token = self.access_token()?;
        let client = http::HttpClient::shared();
        let url = format!(
            "{ARM_BASE}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/dnsZones?api-version={API_VERSION}",
            self.subscription_id, self.resource_group
        );
        let response = client
            .get(&url)
            .bearer_auth(&token)
            .send()
            .context("Failed to list Azure DNS zones")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(http::status_error("Azure DNS", status, Some(body)));
        }

        let zones: ZoneListResponse = response
            .json()
            .context("Failed to parse Azure DNS zone list")?;

        let zone = zones
            .value
            .iter()
            .filter(|zone| matches_zone(fqdn, &zone.name))
            .max_by_key(|zone| zone.name.len())
            .ok_or_else(|| anyhow!(RenewalError::ZoneNotFound(fqdn.to_string())))?;

        debug!("[dns-azure] zone {} hosts {fqdn}", zone.name);
        self.zone_cache = Some(zone.name.clone());
        Ok(zone.name.clone())
    }

    /// "_acme-challenge.host.example.com" in zone "example.com" is the
    /// relative record set "_acme-challenge.host".
    fn relative_name(zone: &str, record_name: &str) -> String {
        let record_name = record_name.trim_end_matches('.');
        if record_name == zone {
            "@".to_string()
        } else if let Some(relative) = record_name.strip_suffix(&format!(".{zone}")) {
            relative.to_string()
        } else {
            record_name.to_string()
        }
    }

    fn record_set_url(&self, zone: &str, record_type: &str, relative: &str) -> String {
        format!(
            "{ARM_BASE}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/dnsZones/{zone}/{record_type}/{relative}?api-version={API_VERSION}",
            self.subscription_id, self.resource_group
        )
    }

    fn fetch_txt_values(&mut self, zone: &str, relative: &str) -> Result<Vec<String>> {
        let token = self.access_token()?;
        let client = http::HttpClient::shared();
        let response = client
            .get(self.record_set_url(zone, "TXT", relative))
            .bearer_auth(&token)
            .send()
            .context("Failed to fetch Azure DNS record set")?;

        if response.status() == 404 {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(http::status_error("Azure DNS", status, Some(body)));
        }

        let record_set: TxtRecordSet = response
            .json()
            .context("Failed to parse Azure DNS record set")?;
        Ok(record_set
            .properties
            .map(|props| {
                props
                    .txt_records
                    .into_iter()
                    .flat_map(|record| record.value)
                    .collect()
            })
            .unwrap_or_default())
    }

    fn delete_record_set(&mut self, zone: &str, record_type: &str, relative: &str) -> Result<()> {
        let token = self.access_token()?;
        let client = http::HttpClient::shared();
        let response = client
            .delete(self.record_set_url(zone, record_type, relative))
            .bearer_auth(&token)
            .send()
            .context("Failed to delete Azure DNS record set")?;

        // 404 means the record set never existed; 200/202/204 all mean gone.
        if response.status().is_success() || response.status() == 404 {
            Ok(())
        } else {
            Err(http::status_error("Azure DNS", response.status(), None))
        }
    }
}

impl DnsProviderAdapter for AzureDnsAdapter {
    fn create_txt_record(&mut self, fqdn: &str, value: &str) -> Result<String> {
        let zone = self.discover_zone(fqdn)?;
        let relative = Self::relative_name(&zone, &challenge_record_name(fqdn));

        let token = self.access_token()?;
        let body = json!({
            "properties": {
                "TTL": 300,
                "TXTRecords": [ { "value": [value] } ],
            }
        });
        let client = http::HttpClient::shared();
        let response = client
            .put(self.record_set_url(&zone, "TXT", &relative))
            .bearer_auth(&token)
            .json(&body)
            .send()
            .context("Failed to create Azure DNS record")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(http::status_error("Azure DNS", status, Some(body)));
        }

        // ARM addresses record sets by zone + relative name, not by id.
        Ok(format!("{zone}/TXT/{relative}"))
    }

    fn cleanup_txt_records(&mut self, fqdn: &str) -> Result<()> {
        let zone = self.discover_zone(fqdn)?;
        let relative = Self::relative_name(&zone, &challenge_record_name(fqdn));
        self.delete_record_set(&zone, "TXT", &relative)
    }

    fn delete_txt_record(&mut self, record_id: &str) -> Result<()> {
        let mut parts = record_id.splitn(3, '/');
        let (Some(zone), Some(record_type), Some(relative)) =
            (parts.next(), parts.next(), parts.next())
        else {
            log::warn!("[dns-azure] malformed record id {record_id}, skipping delete");
            return Ok(());
        };
        let zone = zone.to_string();
        let record_type = record_type.to_string();
        let relative = relative.to_string();
        self.delete_record_set(&zone, &record_type, &relative)
    }

    fn verify_txt_record(&mut self, fqdn: &str, expected_value: &str) -> Result<bool> {
        let zone = self.discover_zone(fqdn)?;
        let relative = Self::relative_name(&zone, &challenge_record_name(fqdn));
        let values = self.fetch_txt_values(&zone, &relative)?;
        Ok(values.iter().any(|value| value == expected_value))
    }

    fn create_dns_record(
        &mut self,
        name: &str,
        value: &str,
        record_type: RecordType,
    ) -> Result<()> {
        let zone = self.discover_zone(name)?;
        let relative = Self::relative_name(&zone, name);
        let (type_segment, body) = match record_type {
            RecordType::Txt => (
                "TXT",
                json!({
                    "properties": { "TTL": 300, "TXTRecords": [ { "value": [value] } ] }
                }),
            ),
            RecordType::Cname => (
                "CNAME",
                json!({
                    "properties": { "TTL": 300, "CNAMERecord": { "cname": value } }
                }),
            ),
        };

        let token = self.access_token()?;
        let client = http::HttpClient::shared();
        let response = client
            .put(self.record_set_url(&zone, type_segment, &relative))
            .bearer_auth(&token)
            .json(&body)
            .send()
            .context("Failed to create Azure DNS record")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(http::status_error("Azure DNS", status, Some(body)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::AzureDnsAdapter;

    #[test]
    fn relative_name_strips_the_zone() {
        assert_eq!(
            AzureDnsAdapter::relative_name("example.com", "_acme-challenge.ucm01.example.com"),
            "_acme-challenge.ucm01"
        );
        assert_eq!(AzureDnsAdapter::relative_name("example.com", "example.com"), "@");
    }

    #[test]
    fn record_id_round_trips_through_segments() {
        let id = "example.com/TXT/_acme-challenge.ucm01";
        let mut parts = id.splitn(3, '/');
        assert_eq!(parts.next(), Some("example.com"));
        assert_eq!(parts.next(), Some("TXT"));
        assert_eq!(parts.next(), Some("_acme-challenge.ucm01"));
    }
}
