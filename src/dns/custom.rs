use anyhow::Result;
use log::info;

use super::propagation::{DohResolver, TxtResolver};
use super::{DnsProviderAdapter, RecordType};
use crate::domain::challenge_record_name;

/// The "custom" provider: no API to call. The orchestrator surfaces the
/// record name and value to the operator and waits for the record to appear
/// on public resolvers.
pub struct ManualDnsAdapter {
    resolver: DohResolver,
}

impl ManualDnsAdapter {
    pub fn new() -> Self {
        Self {
            resolver: DohResolver::google(),
        }
    }

    /// Operator-facing instructions for publishing the TXT record by hand.
    pub fn instructions(fqdn: &str, value: &str) -> String {
        format!(
            "Create a TXT record named {} with the value {} at your DNS provider, \
             then wait for it to propagate. The renewal continues automatically \
             once the record is visible.",
            challenge_record_name(fqdn),
            value
        )
    }
}

impl Default for ManualDnsAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsProviderAdapter for ManualDnsAdapter {
    fn create_txt_record(&mut self, fqdn: &str, _value: &str) -> Result<String> {
        info!(
            "[dns-manual] waiting for operator to publish {}",
            challenge_record_name(fqdn)
        );
        Ok("manual".to_string())
    }

    fn cleanup_txt_records(&mut self, _fqdn: &str) -> Result<()> {
        // Nothing to purge; the operator owns the records.
        Ok(())
    }

    fn delete_txt_record(&mut self, _record_id: &str) -> Result<()> {
        Ok(())
    }

    fn verify_txt_record(&mut self, fqdn: &str, expected_value: &str) -> Result<bool> {
        let record_name = challenge_record_name(fqdn);
        let observed = self.resolver.resolve(&record_name, RecordType::Txt)?;
        let expected = expected_value.trim().trim_matches('"');
        Ok(observed.iter().any(|value| value == expected))
    }

    fn create_dns_record(
        &mut self,
        _name: &str,
        _value: &str,
        _record_type: RecordType,
    ) -> Result<()> {
        Ok(())
    }

    fn is_manual(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instructions_name_the_record_and_value() {
        let text = ManualDnsAdapter::instructions("ucm01.lab.example.com", "token-value");
        assert!(text.contains("_acme-challenge.ucm01.lab.example.com"));
        assert!(text.contains("token-value"));
    }

    #[test]
    fn create_and_cleanup_are_no_ops() {
        let mut adapter = ManualDnsAdapter::new();
        assert_eq!(
            adapter.create_txt_record("a.example.com", "v").unwrap(),
            "manual"
        );
        assert!(adapter.cleanup_txt_records("a.example.com").is_ok());
        assert!(adapter.delete_txt_record("manual").is_ok());
        assert!(adapter.is_manual());
    }
}
