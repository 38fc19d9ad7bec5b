use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};

use crate::cancel::CancellationToken;
use crate::error::RenewalError;
use crate::settings::Environment;
use crate::storage::SslProvider;

pub mod client;

pub use client::{AcmeClient, AcmeIssuerFactory};

/// One DNS-01 challenge as returned with a new order.
#[derive(Debug, Clone)]
pub struct DnsChallenge {
    /// The identifier (domain) this challenge authorizes.
    pub identifier: String,
    pub url: String,
    pub token: String,
    pub status: String,
}

/// An order in flight: the resource URLs plus its DNS-01 challenges, one per
/// identifier, in identifier order.
#[derive(Debug, Clone)]
pub struct CertificateOrder {
    pub url: String,
    pub finalize_url: String,
    pub status: String,
    pub certificate_url: Option<String>,
    pub challenges: Vec<DnsChallenge>,
}

/// Certificate-authority operations the orchestrator drives. Implemented by
/// [`AcmeClient`]; test harnesses substitute their own.
pub trait Issuer: Send {
    /// Loads the stored account for this issuer's domain, or registers a new
    /// one with the given contact email.
    fn ensure_account(&mut self, contact_email: Option<&str>) -> Result<(), RenewalError>;

    fn request_certificate(&mut self, domains: &[String])
    -> Result<CertificateOrder, RenewalError>;

    /// `token || "." || base64url(sha256(JWK thumbprint))` per RFC 8555 §8.1.
    fn key_authorization(&self, challenge: &DnsChallenge) -> Result<String, RenewalError>;

    /// Signals the authority that the challenge record is in place.
    fn complete_challenge(&mut self, challenge: &DnsChallenge) -> Result<(), RenewalError>;

    /// Polls the order until every authorization has been validated (order
    /// status `ready`, or already `valid`). `invalid` is fatal.
    fn wait_for_order_completion(
        &mut self,
        order: &CertificateOrder,
        cancel: &CancellationToken,
    ) -> Result<CertificateOrder, RenewalError>;

    /// Submits the CSR, polls the order to `valid`, and downloads the issued
    /// PEM chain.
    fn finalize_certificate(
        &mut self,
        order: &CertificateOrder,
        csr_pem: &str,
        cancel: &CancellationToken,
    ) -> Result<String, RenewalError>;
}

/// Constructs an issuer bound to one (domain, environment) account. Boxed so
/// the orchestrator can be exercised against a stub authority.
pub trait IssuerFactory: Send + Sync {
    fn issuer_for(&self, fqdn: &str, provider: SslProvider)
    -> Result<Box<dyn Issuer>, RenewalError>;
}

/// The TXT value for a DNS-01 challenge: `base64url(sha256(key_auth))`.
pub fn dns_record_value(key_auth: &str) -> String {
    let digest = Sha256::digest(key_auth.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Maps the connection's authority choice and the runtime environment to an
/// ACME directory URL.
pub fn directory_url(provider: SslProvider, environment: Environment) -> &'static str {
    match (provider, environment) {
        (SslProvider::AcmePrimary, Environment::Production) => {
            "https://acme-v02.api.letsencrypt.org/directory"
        }
        (SslProvider::AcmePrimary, Environment::Staging) => {
            "https://acme-staging-v02.api.letsencrypt.org/directory"
        }
        (SslProvider::AcmeAlt, Environment::Production) => {
            "https://api.buypass.com/acme/directory"
        }
        (SslProvider::AcmeAlt, Environment::Staging) => {
            "https://api.test4.buypass.no/acme/directory"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns_record_value_is_unpadded_base64url() {
        // sha256 output is 32 bytes -> 43 chars base64url without padding.
        let value = dns_record_value("token.thumbprint");
        assert_eq!(value.len(), 43);
        assert!(!value.contains('='));
        assert!(!value.contains('+'));
        assert!(!value.contains('/'));
    }

    #[test]
    fn dns_record_value_is_deterministic() {
        assert_eq!(dns_record_value("abc"), dns_record_value("abc"));
        assert_ne!(dns_record_value("abc"), dns_record_value("abd"));
    }

    #[test]
    fn staging_flag_selects_staging_directories() {
        assert!(
            directory_url(SslProvider::AcmePrimary, Environment::Staging).contains("staging")
        );
        assert!(directory_url(SslProvider::AcmeAlt, Environment::Staging).contains("test"));
        assert_eq!(
            directory_url(SslProvider::AcmePrimary, Environment::Production),
            "https://acme-v02.api.letsencrypt.org/directory"
        );
    }
}
