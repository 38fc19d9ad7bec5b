use anyhow::{Result, anyhow};

pub fn normalize_domain(input: &str) -> Result<String> {
    let trimmed = input.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(anyhow!("domain name is required"));
    }
    Ok(trimmed.to_ascii_lowercase())
}

/// Joins hostname and domain into the FQDN the certificate is issued for.
pub fn fqdn(hostname: &str, domain: &str) -> Result<String> {
    let hostname = normalize_domain(hostname)?;
    let domain = normalize_domain(domain)?;
    Ok(format!("{hostname}.{domain}"))
}

/// The TXT record name the authority queries for a DNS-01 challenge.
pub fn challenge_record_name(identifier: &str) -> String {
    let trimmed = identifier.trim_end_matches('.');
    format!("_acme-challenge.{trimmed}")
}

pub fn matches_zone(domain_suffix: &str, zone_name: &str) -> bool {
    let domain_suffix = match normalize_domain(domain_suffix) {
        Ok(value) => value,
        Err(_) => return false,
    };
    let zone_name = match normalize_domain(zone_name) {
        Ok(value) => value,
        Err(_) => return false,
    };
    zone_name == domain_suffix || domain_suffix.ends_with(&format!(".{}", zone_name))
}

/// Splits a PEM bundle into individual certificate blocks, preserving order.
pub fn split_pem_chain(bundle: &str) -> Vec<String> {
    const END: &str = "-----END CERTIFICATE-----";
    let mut blocks = Vec::new();
    let mut rest = bundle;
    while let Some(pos) = rest.find(END) {
        let (block, tail) = rest.split_at(pos + END.len());
        let block = block.trim_start_matches(['\r', '\n']);
        if block.contains("-----BEGIN CERTIFICATE-----") {
            blocks.push(format!("{}\n", block.trim_end()));
        }
        rest = tail;
    }
    blocks
}

/// Normalizes a PEM block for equality comparison: strips whitespace noise
/// so the same certificate uploaded with different wrapping compares equal.
pub fn normalize_pem(pem: &str) -> String {
    pem.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fqdn_joins_and_lowercases() {
        assert_eq!(fqdn("UCM01", "Lab.Example.com").unwrap(), "ucm01.lab.example.com");
    }

    #[test]
    fn fqdn_rejects_empty_hostname() {
        assert!(fqdn("", "example.com").is_err());
    }

    #[test]
    fn challenge_record_name_prefixes() {
        assert_eq!(
            challenge_record_name("ucm01.lab.example.com."),
            "_acme-challenge.ucm01.lab.example.com"
        );
    }

    #[test]
    fn matches_exact_zone_name() {
        assert!(matches_zone("example.com", "example.com"));
        assert!(!matches_zone("example.com", "other.com"));
    }

    #[test]
    fn matches_subdomain_suffix() {
        assert!(matches_zone("sub.example.com", "example.com"));
        assert!(!matches_zone("example.com", "sub.example.com"));
    }

    #[test]
    fn split_pem_chain_preserves_order() {
        let bundle = "-----BEGIN CERTIFICATE-----\nAAA\n-----END CERTIFICATE-----\n\
                      -----BEGIN CERTIFICATE-----\nBBB\n-----END CERTIFICATE-----\n";
        let blocks = split_pem_chain(bundle);
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].contains("AAA"));
        assert!(blocks[1].contains("BBB"));
        assert!(blocks.iter().all(|b| b.ends_with("-----END CERTIFICATE-----\n")));
    }

    #[test]
    fn split_pem_chain_single_block() {
        let bundle = "-----BEGIN CERTIFICATE-----\nAAA\n-----END CERTIFICATE-----";
        assert_eq!(split_pem_chain(bundle).len(), 1);
    }

    #[test]
    fn normalize_pem_ignores_whitespace_noise() {
        let a = "-----BEGIN CERTIFICATE-----\r\n  AAA  \r\n-----END CERTIFICATE-----\r\n";
        let b = "-----BEGIN CERTIFICATE-----\nAAA\n-----END CERTIFICATE-----";
        assert_eq!(normalize_pem(a), normalize_pem(b));
    }
}
