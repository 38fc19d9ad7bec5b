use anyhow::{Context, Result, anyhow};
use aws_config::BehaviorVersion;
use aws_sdk_route53::Client;
use aws_sdk_route53::config::Credentials;
use aws_sdk_route53::types::{
    Change, ChangeAction, ChangeBatch, ResourceRecord, ResourceRecordSet, RrType,
};
use log::debug;

use super::{DnsProviderAdapter, RecordType};
use crate::domain::{challenge_record_name, matches_zone};
use crate::error::RenewalError;

/// Route 53 has no per-record ids; record sets are addressed by name. The
/// adapter hands the record name back as the id so deletes can find it again.
pub struct Route53Adapter {
    access_key: String,
    secret_key: String,
    hosted_zone_cache: Option<String>,
}

impl Route53Adapter {
    pub fn new(access_key: String, secret_key: String) -> Self {
        Self {
            access_key,
            secret_key,
            hosted_zone_cache: None,
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

    fn runtime() -> Result<tokio::runtime::Runtime> {
        tokio::runtime::Runtime::new().context("Failed to create tokio runtime")
    }

    async fn client(&self) -> Client {
        let credentials =
            Credentials::new(&self.access_key, &self.secret_key, None, None, "certfleet");
        let config = aws_config::defaults(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .load()
            .await;
        Client::new(&config)
    }

    async fn discover_hosted_zone_id(&mut self, fqdn: &str) -> Result<String> {
        if let Some(zone_id) = &self.hosted_zone_cache {
            return Ok(zone_id.clone());
        }

        let client = self.client().await;
        let mut paginator = client
            .list_hosted_zones()
            .into_paginator()
            .page_size(100)
            .send();

        let mut best: Option<(String, usize)> = None;
        while let Some(page) = paginator.next().await {
            let page = page.context("Failed to list Route 53 hosted zones")?;
            for zone in page.hosted_zones() {
                let zone_name = zone.name().trim_end_matches('.');
                if matches_zone(fqdn, zone_name)
                    && best.as_ref().map(|(_, len)| zone_name.len() > *len).unwrap_or(true)
                {
                    best = Some((zone.id().to_string(), zone_name.len()));
                }
            }
        }

        let (zone_id, _) =
            best.ok_or_else(|| anyhow!(RenewalError::ZoneNotFound(fqdn.to_string())))?;
        debug!("[dns-route53] hosted zone {zone_id} hosts {fqdn}");
        self.hosted_zone_cache = Some(zone_id.clone());
        Ok(zone_id)
    }

    async fn upsert_record(
        &mut self,
        record_name: &str,
        values: Vec<String>,
        rr_type: RrType,
        fqdn: &str,
    ) -> Result<()> {
        let hosted_zone_id = self.discover_hosted_zone_id(fqdn).await?;
        let client = self.client().await;

        let mut set = ResourceRecordSet::builder()
            .name(record_name)
            .ttl(300)
            .set_type(Some(rr_type));
        for value in values {
            set = set.resource_records(
                ResourceRecord::builder()
                    .value(value)
                    .build()
                    .map_err(|e| anyhow!("Failed to build ResourceRecord: {e}"))?,
            );
        }
        let record_set = set
            .build()
            .map_err(|e| anyhow!("Failed to build ResourceRecordSet: {e}"))?;

        let change = Change::builder()
            .action(ChangeAction::Upsert)
            .resource_record_set(record_set)
            .build()
            .map_err(|e| anyhow!("Failed to build Change: {e}"))?;
        let change_batch = ChangeBatch::builder()
            .changes(change)
            .build()
            .map_err(|e| anyhow!("Failed to build ChangeBatch: {e}"))?;

        client
            .change_resource_record_sets()
            .hosted_zone_id(&hosted_zone_id)
            .change_batch(change_batch)
            .send()
            .await
            .context("Failed to create Route 53 DNS record")?;
        Ok(())
    }

    async fn delete_record_set(&mut self, record_name: &str) -> Result<()> {
        let Some(hosted_zone_id) = self.hosted_zone_cache.clone() else {
            log::warn!("[dns-route53] no hosted zone known for {record_name}, skipping delete");
            return Ok(());
        };
        let client = self.client().await;

        let list_response = client
            .list_resource_record_sets()
            .hosted_zone_id(&hosted_zone_id)
            .send()
            .await
            .context("Failed to list Route 53 DNS records")?;

        let wanted = format!("{}.", record_name.trim_end_matches('.'));
        let Some(record_set) = list_response
            .resource_record_sets()
            .iter()
            .find(|set| set.name() == wanted && set.r#type() == &RrType::Txt)
            .cloned()
        else {
            // Already gone.
            return Ok(());
        };

        let change = Change::builder()
            .action(ChangeAction::Delete)
            .resource_record_set(record_set)
            .build()
            .map_err(|e| anyhow!("Failed to build Change: {e}"))?;
        let change_batch = ChangeBatch::builder()
            .changes(change)
            .build()
            .map_err(|e| anyhow!("Failed to build ChangeBatch: {e}"))?;

        client
            .change_resource_record_sets()
            .hosted_zone_id(&hosted_zone_id)
            .change_batch(change_batch)
            .send()
            .await
            .context("Failed to delete Route 53 DNS record")?;
        Ok(())
    }

    async fn record_has_value(
        &mut self,
        record_name: &str,
        expected_value: &str,
        fqdn: &str,
    ) -> Result<bool> {
        let hosted_zone_id = self.discover_hosted_zone_id(fqdn).await?;
        let client = self.client().await;

        let response = client
            .list_resource_record_sets()
            .hosted_zone_id(&hosted_zone_id)
            .send()
            .await
            .context("Failed to list Route 53 DNS records")?;

        let wanted = format!("{}.", record_name.trim_end_matches('.'));
        let Some(record_set) = response
            .resource_record_sets()
            .iter()
            .find(|set| set.name() == wanted && set.r#type() == &RrType::Txt)
        else {
            return Ok(false);
        };

        Ok(record_set
            .resource_records()
            .iter()
            .any(|record| record.value() == expected_value))
    }
}

impl DnsProviderAdapter for Route53Adapter {
    fn create_txt_record(&mut self, fqdn: &str, value: &str) -> Result<String> {
        let record_name = challenge_record_name(fqdn);
        let formatted = Self::format_txt_content(value);
        let rt = Self::runtime()?;
        rt.block_on(self.upsert_record(&record_name, vec![formatted], RrType::Txt, fqdn))?;
        Ok(record_name)
    }

    fn cleanup_txt_records(&mut self, fqdn: &str) -> Result<()> {
        let record_name = challenge_record_name(fqdn);
        let rt = Self::runtime()?;
        // Make sure the zone cache is primed even when cleanup runs first.
        rt.block_on(self.discover_hosted_zone_id(fqdn))?;
        rt.block_on(self.delete_record_set(&record_name))
    }

    fn delete_txt_record(&mut self, record_id: &str) -> Result<()> {
        let rt = Self::runtime()?;
        rt.block_on(self.delete_record_set(record_id))
    }

    fn verify_txt_record(&mut self, fqdn: &str, expected_value: &str) -> Result<bool> {
        let record_name = challenge_record_name(fqdn);
        let expected = Self::format_txt_content(expected_value);
        let rt = Self::runtime()?;
        rt.block_on(self.record_has_value(&record_name, &expected, fqdn))
    }

    fn create_dns_record(
        &mut self,
        name: &str,
        value: &str,
        record_type: RecordType,
    ) -> Result<()> {
        let (rr_type, formatted) = match record_type {
            RecordType::Txt => (RrType::Txt, Self::format_txt_content(value)),
            RecordType::Cname => (RrType::Cname, value.trim_end_matches('.').to_string()),
        };
        let rt = Self::runtime()?;
        rt.block_on(self.upsert_record(name, vec![formatted], rr_type, name))
    }
}

#[cfg(test)]
mod tests {
    use super::Route53Adapter;

    #[test]
    fn txt_content_is_quoted_once() {
        assert_eq!(Route53Adapter::format_txt_content("abc"), "\"abc\"");
        assert_eq!(Route53Adapter::format_txt_content("\"abc\""), "\"abc\"");
    }
}
