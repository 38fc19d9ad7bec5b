//! Live DNS provider tests, gated on credentials so a plain `cargo test`
//! skips them. Set `DNS_TEST_CLOUDFLARE_TOKEN` / `DNS_TEST_CLOUDFLARE_DOMAIN`
//! (and the DigitalOcean equivalents) to run against real zones.

use std::env;

use anyhow::{Result, anyhow};
use certfleet::dns::{CloudflareAdapter, DigitalOceanAdapter, DnsProviderAdapter};

struct CloudflareTestConfig {
    token: String,
    /// An FQDN inside a zone the token can manage.
    domain: String,
}

fn load_cloudflare_config() -> Option<CloudflareTestConfig> {
    let token = env::var("DNS_TEST_CLOUDFLARE_TOKEN").ok()?;
    let domain = env::var("DNS_TEST_CLOUDFLARE_DOMAIN").ok()?;
    Some(CloudflareTestConfig { token, domain })
}

fn load_digitalocean_config() -> Option<(String, String)> {
    let token = env::var("DNS_TEST_DIGITALOCEAN_TOKEN").ok()?;
    let domain = env::var("DNS_TEST_DIGITALOCEAN_DOMAIN").ok()?;
    Some((token, domain))
}

#[test]
fn cloudflare_create_verify_delete_round_trip() -> Result<()> {
    let Some(config) = load_cloudflare_config() else {
        eprintln!("skipping: DNS_TEST_CLOUDFLARE_* not set");
        return Ok(());
    };
    let fqdn = format!("integration-test.{}", config.domain);
    let value = "certfleet-integration-test";

    let mut adapter = CloudflareAdapter::new(config.token.clone(), None);
    adapter.cleanup_txt_records(&fqdn)?;

    let record_id = adapter.create_txt_record(&fqdn, value)?;
    if record_id.is_empty() {
        return Err(anyhow!("expected Cloudflare to return a record id"));
    }
    if !adapter.verify_txt_record(&fqdn, value)? {
        return Err(anyhow!("created record not visible via Cloudflare API"));
    }

    adapter.delete_txt_record(&record_id)?;
    if adapter.verify_txt_record(&fqdn, value)? {
        return Err(anyhow!("record still visible after delete"));
    }
    Ok(())
}

#[test]
fn cloudflare_cleanup_is_idempotent() -> Result<()> {
    let Some(config) = load_cloudflare_config() else {
        eprintln!("skipping: DNS_TEST_CLOUDFLARE_* not set");
        return Ok(());
    };
    let fqdn = format!("integration-test-cleanup.{}", config.domain);

    let mut adapter = CloudflareAdapter::new(config.token, None);
    adapter.cleanup_txt_records(&fqdn)?;
    // A second pass over an empty name must not fail.
    adapter.cleanup_txt_records(&fqdn)?;
    Ok(())
}

#[test]
fn digitalocean_create_verify_delete_round_trip() -> Result<()> {
    let Some((token, domain)) = load_digitalocean_config() else {
        eprintln!("skipping: DNS_TEST_DIGITALOCEAN_* not set");
        return Ok(());
    };
    let fqdn = format!("integration-test.{domain}");
    let value = "certfleet-integration-test";

    let mut adapter = DigitalOceanAdapter::new(token);
    adapter.cleanup_txt_records(&fqdn)?;

    let record_id = adapter.create_txt_record(&fqdn, value)?;
    if !adapter.verify_txt_record(&fqdn, value)? {
        return Err(anyhow!("created record not visible via DigitalOcean API"));
    }

    adapter.delete_txt_record(&record_id)?;
    if adapter.verify_txt_record(&fqdn, value)? {
        return Err(anyhow!("record still visible after delete"));
    }
    Ok(())
}
