use std::collections::HashMap;

use anyhow::Result;

use crate::error::RenewalError;
use crate::storage::DnsProviderKind;

mod azure;
mod cloudflare;
mod custom;
mod digitalocean;
pub(crate) mod http;
mod google;
pub mod propagation;
mod route53;

pub use azure::AzureDnsAdapter;
pub use cloudflare::CloudflareAdapter;
pub use custom::ManualDnsAdapter;
pub use digitalocean::DigitalOceanAdapter;
pub use google::GoogleCloudDnsAdapter;
pub use propagation::{DohResolver, PropagationVerifier, TxtResolver};
pub use route53::Route53Adapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Txt,
    Cname,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Txt => "TXT",
            RecordType::Cname => "CNAME",
        }
    }
}

/// Uniform contract over every DNS provider. Methods take the identifier
/// FQDN; adapters derive `_acme-challenge.<fqdn>` themselves. Callers purge
/// stale records before creating — idempotency is not assumed.
pub trait DnsProviderAdapter: Send {
    /// Creates the challenge TXT record and returns the provider-side id.
    fn create_txt_record(&mut self, fqdn: &str, value: &str) -> Result<String>;

    /// Deletes every TXT record at `_acme-challenge.<fqdn>`.
    fn cleanup_txt_records(&mut self, fqdn: &str) -> Result<()>;

    /// Deletes one record by provider id. Absence is not an error.
    fn delete_txt_record(&mut self, record_id: &str) -> Result<()>;

    /// True once the record is visible through the provider's own API.
    fn verify_txt_record(&mut self, fqdn: &str, expected_value: &str) -> Result<bool>;

    /// Raw record creation, needed only for CNAME validation flows.
    fn create_dns_record(&mut self, name: &str, value: &str, record_type: RecordType)
    -> Result<()>;

    /// Manual providers publish nothing; the orchestrator surfaces
    /// instructions instead.
    fn is_manual(&self) -> bool {
        false
    }
}

/// Indirection over [`adapter_for_provider`] so the orchestrator can be
/// exercised against stub providers.
pub trait DnsAdapterFactory: Send + Sync {
    fn adapter_for(
        &self,
        kind: DnsProviderKind,
        settings: &HashMap<String, String>,
    ) -> Result<Box<dyn DnsProviderAdapter>, RenewalError>;
}

pub struct DefaultDnsAdapterFactory;

impl DnsAdapterFactory for DefaultDnsAdapterFactory {
    fn adapter_for(
        &self,
        kind: DnsProviderKind,
        settings: &HashMap<String, String>,
    ) -> Result<Box<dyn DnsProviderAdapter>, RenewalError> {
        adapter_for_provider(kind, settings)
    }
}

fn require<'a>(
    settings: &'a HashMap<String, String>,
    provider: DnsProviderKind,
    key: &str,
) -> Result<&'a str, RenewalError> {
    settings
        .get(key)
        .map(String::as_str)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| {
            RenewalError::ConfigMissing(format!(
                "{} setting {key} is not configured",
                provider.as_str()
            ))
        })
}

/// Maps the connection's provider choice plus its Settings rows to an
/// adapter. Missing credentials fail fast before any record is touched.
pub fn adapter_for_provider(
    kind: DnsProviderKind,
    settings: &HashMap<String, String>,
) -> Result<Box<dyn DnsProviderAdapter>, RenewalError> {
    match kind {
        DnsProviderKind::Cloudflare => {
            let token = require(settings, kind, "CF_KEY")?;
            let zone_override = settings.get("CF_ZONE").cloned().filter(|z| !z.is_empty());
            Ok(Box::new(CloudflareAdapter::new(token.to_string(), zone_override)))
        }
        DnsProviderKind::Digitalocean => {
            let token = require(settings, kind, "DO_TOKEN")?;
            Ok(Box::new(DigitalOceanAdapter::new(token.to_string())))
        }
        DnsProviderKind::Route53 => {
            let access_key = require(settings, kind, "AWS_ACCESS_KEY_ID")?;
            let secret_key = require(settings, kind, "AWS_SECRET_ACCESS_KEY")?;
            Ok(Box::new(Route53Adapter::new(
                access_key.to_string(),
                secret_key.to_string(),
            )))
        }
        DnsProviderKind::Azure => {
            let tenant_id = require(settings, kind, "AZURE_TENANT_ID")?;
            let client_id = require(settings, kind, "AZURE_CLIENT_ID")?;
            let client_secret = require(settings, kind, "AZURE_CLIENT_SECRET")?;
            let subscription_id = require(settings, kind, "AZURE_SUBSCRIPTION_ID")?;
            let resource_group = require(settings, kind, "AZURE_RESOURCE_GROUP")?;
            Ok(Box::new(AzureDnsAdapter::new(
                tenant_id.to_string(),
                client_id.to_string(),
                client_secret.to_string(),
                subscription_id.to_string(),
                resource_group.to_string(),
            )))
        }
        DnsProviderKind::Google => {
            let service_account_json = require(settings, kind, "GOOGLE_SERVICE_ACCOUNT_JSON")?;
            let project_override = settings
                .get("GOOGLE_PROJECT_ID")
                .cloned()
                .filter(|p| !p.is_empty());
            Ok(Box::new(GoogleCloudDnsAdapter::new(
                service_account_json.to_string(),
                project_override,
            )?))
        }
        DnsProviderKind::Custom => Ok(Box::new(ManualDnsAdapter::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_credentials_fail_fast() {
        let empty = HashMap::new();
        for kind in [
            DnsProviderKind::Cloudflare,
            DnsProviderKind::Digitalocean,
            DnsProviderKind::Route53,
            DnsProviderKind::Azure,
            DnsProviderKind::Google,
        ] {
            let err = adapter_for_provider(kind, &empty).err().unwrap();
            assert!(
                matches!(err, RenewalError::ConfigMissing(_)),
                "{kind:?} should require credentials"
            );
        }
    }

    #[test]
    fn blank_credentials_count_as_missing() {
        let mut settings = HashMap::new();
        settings.insert("CF_KEY".to_string(), "   ".to_string());
        let err = adapter_for_provider(DnsProviderKind::Cloudflare, &settings)
            .err()
            .unwrap();
        assert!(matches!(err, RenewalError::ConfigMissing(_)));
    }

    #[test]
    fn custom_provider_needs_no_credentials() {
        let adapter = adapter_for_provider(DnsProviderKind::Custom, &HashMap::new()).unwrap();
        assert!(adapter.is_manual());
    }

    #[test]
    fn cloudflare_provider_builds_with_token() {
        let mut settings = HashMap::new();
        settings.insert("CF_KEY".to_string(), "token".to_string());
        let adapter = adapter_for_provider(DnsProviderKind::Cloudflare, &settings).unwrap();
        assert!(!adapter.is_manual());
    }
}
