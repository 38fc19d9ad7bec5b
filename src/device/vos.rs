use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::json;

use super::DeviceApi;
use crate::domain::normalize_pem;
use crate::error::RenewalError;

const CERTMGR_BASE: &str = "/platformcom/api/v1/certmgr/config";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// REST adapter for VOS appliances. The appliance presents a self-signed
/// certificate until the renewal lands, so TLS validation is disabled; auth
/// is HTTP Basic with the connection credentials.
pub struct VosDevice {
    base_url: String,
    username: String,
    password: String,
    http: Client,
}

#[derive(Deserialize)]
struct CsrResponse {
    csr: String,
}

#[derive(Deserialize)]
struct TrustListResponse {
    #[serde(default)]
    certificates: Vec<TrustCertificate>,
}

#[derive(Deserialize)]
struct TrustCertificate {
    #[serde(default)]
    certificate: Option<String>,
}

impl VosDevice {
    pub fn new(host: &str, username: &str, password: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()
            .context("failed to build VOS HTTP client")?;
        Ok(Self {
            base_url: format!("https://{host}{CERTMGR_BASE}"),
            username: username.to_string(),
            password: password.to_string(),
            http,
        })
    }

    fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::blocking::Response, RenewalError> {
        self.http
            .post(format!("{}{path}", self.base_url))
            .basic_auth(&self.username, Some(&self.password))
            .json(body)
            .send()
            .map_err(|err| RenewalError::DeviceApiError {
                status: 0,
                body: err.to_string(),
            })
    }

    fn device_error(response: reqwest::blocking::Response) -> RenewalError {
        let status = response.status().as_u16();
        let body = response.text().unwrap_or_default();
        RenewalError::DeviceApiError { status, body }
    }
}

impl DeviceApi for VosDevice {
    fn generate_csr(
        &self,
        common_name: &str,
        alt_names: &[String],
    ) -> Result<String, RenewalError> {
        let mut body = json!({
            "service": "tomcat",
            "distribution": "this-server",
            "commonName": common_name,
            "keyType": "rsa",
            "keyLength": 2048,
            "hashAlgorithm": "sha256",
        });
        if !alt_names.is_empty() {
            body["altNames"] = json!(alt_names);
        }

        let response = self.post("/csr", &body)?;
        if response.status().as_u16() != 200 {
            return Err(Self::device_error(response));
        }
        let parsed: CsrResponse = response.json().map_err(|err| RenewalError::DeviceApiError {
            status: 200,
            body: format!("CSR response was not the expected JSON: {err}"),
        })?;
        info!("[vos] device generated CSR for {common_name}");
        Ok(parsed.csr)
    }

    fn upload_identity_certificate(&self, leaf_pem: &str) -> Result<(), RenewalError> {
        let body = json!({
            "service": "tomcat",
            "certificates": [leaf_pem],
        });
        let response = self.post("/identity/certificates", &body)?;
        match response.status().as_u16() {
            200 | 201 => {
                info!("[vos] identity certificate uploaded");
                Ok(())
            }
            _ => Err(Self::device_error(response)),
        }
    }

    fn list_trust_certificates(&self) -> Vec<String> {
        let result: Result<Vec<String>> = (|| {
            let response = self
                .http
                .get(format!(
                    "{}/trust/certificate?service=tomcat",
                    self.base_url
                ))
                .basic_auth(&self.username, Some(&self.password))
                .send()
                .context("trust certificate list request failed")?;
            if !response.status().is_success() {
                anyhow::bail!("trust certificate list returned HTTP {}", response.status());
            }
            let parsed: TrustListResponse = response
                .json()
                .context("trust certificate list was not the expected JSON")?;
            Ok(parsed
                .certificates
                .into_iter()
                .filter_map(|entry| entry.certificate)
                .collect())
        })();

        match result {
            Ok(certs) => certs,
            Err(err) => {
                // Treated as "no trusts known"; the upload path dedups anyway.
                warn!("[vos] failed to list trust certificates: {err:#}");
                Vec::new()
            }
        }
    }

    fn upload_trust_certificates(&self, chain_pems: &[String]) -> Result<(), RenewalError> {
        let existing = self.list_trust_certificates();
        let new_only = subtract_existing(&existing, chain_pems);
        if new_only.is_empty() {
            debug!("[vos] all {} trust certificate(s) already present", chain_pems.len());
            return Ok(());
        }

        let body = json!({
            "service": ["tomcat"],
            "certificates": new_only,
            "description": "Trust Certificate",
        });
        let response = self.post("/trust/certificates", &body)?;
        match response.status().as_u16() {
            200 | 201 => {
                info!("[vos] uploaded {} trust certificate(s)", new_only.len());
                Ok(())
            }
            _ => Err(Self::device_error(response)),
        }
    }
}

/// Drops candidates the device already trusts, comparing by normalized PEM.
fn subtract_existing(existing: &[String], candidates: &[String]) -> Vec<String> {
    let known: Vec<String> = existing.iter().map(|pem| normalize_pem(pem)).collect();
    candidates
        .iter()
        .filter(|candidate| !known.contains(&normalize_pem(candidate)))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::subtract_existing;

    const CERT_A: &str = "-----BEGIN CERTIFICATE-----\nAAA\n-----END CERTIFICATE-----\n";
    const CERT_B: &str = "-----BEGIN CERTIFICATE-----\nBBB\n-----END CERTIFICATE-----\n";

    #[test]
    fn known_certificates_are_subtracted() {
        let existing = vec![CERT_A.to_string()];
        let candidates = vec![CERT_A.to_string(), CERT_B.to_string()];
        let new_only = subtract_existing(&existing, &candidates);
        assert_eq!(new_only, vec![CERT_B.to_string()]);
    }

    #[test]
    fn whitespace_variants_compare_equal() {
        let existing = vec![CERT_A.replace('\n', "\r\n")];
        let candidates = vec![CERT_A.to_string()];
        assert!(subtract_existing(&existing, &candidates).is_empty());
    }

    #[test]
    fn empty_device_list_keeps_everything() {
        let candidates = vec![CERT_A.to_string(), CERT_B.to_string()];
        assert_eq!(subtract_existing(&[], &candidates).len(), 2);
    }
}
