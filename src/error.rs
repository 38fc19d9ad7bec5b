use thiserror::Error;

/// Everything that can end a renewal, in the shape the status surface reports it.
#[derive(Error, Debug)]
pub enum RenewalError {
    #[error("a renewal is already active for connection {0}")]
    AlreadyActive(i64),
    #[error("connection not found: {0}")]
    NotFound(i64),
    #[error("configuration missing: {0}")]
    ConfigMissing(String),
    #[error("CSR format invalid: {0}")]
    CsrFormatInvalid(String),
    #[error("device API error (HTTP {status}): {body}")]
    DeviceApiError { status: u16, body: String },
    #[error("ACME protocol error at {url}: {problem}")]
    AcmeProtocolError { url: String, problem: String },
    #[error("DNS provider error: {0}")]
    DnsProviderError(String),
    #[error("no hosted zone found for domain suffix: {0}")]
    ZoneNotFound(String),
    #[error("DNS propagation timeout for {0}")]
    PropagationTimeout(String),
    #[error("manual DNS entry was not published within the deadline for {0}")]
    ManualDnsTimeout(String),
    #[error("order became invalid: {0}")]
    OrderInvalid(String),
    #[error("certificate parse error: {0}")]
    CertificateParseError(String),
    #[error("renewal cancelled")]
    Cancelled,
    #[error("renewal interrupted")]
    Interrupted,
    #[error("internal error: {0}")]
    Internal(String),
}

impl RenewalError {
    pub fn dns(err: anyhow::Error) -> Self {
        RenewalError::DnsProviderError(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::RenewalError;

    #[test]
    fn messages_name_the_failure() {
        let err = RenewalError::PropagationTimeout("_acme-challenge.a.example.com".into());
        assert!(err.to_string().contains("propagation timeout"));

        let err = RenewalError::DeviceApiError {
            status: 500,
            body: "internal".into(),
        };
        assert!(err.to_string().contains("HTTP 500"));
    }

    #[test]
    fn dns_wrapper_keeps_context_chain() {
        let inner = anyhow::anyhow!("boom").context("Failed to create Cloudflare DNS record");
        let err = RenewalError::dns(inner);
        let msg = err.to_string();
        assert!(msg.contains("Cloudflare"));
        assert!(msg.contains("boom"));
    }
}
