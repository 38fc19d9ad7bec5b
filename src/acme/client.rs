use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use log::{debug, info, warn};
use reqwest::blocking::{Client, Response};
use ring::rand::SystemRandom;
use ring::signature::{ECDSA_P256_SHA256_FIXED_SIGNING, EcdsaKeyPair, KeyPair};
use serde::Deserialize;

use super::{CertificateOrder, DnsChallenge, Issuer, IssuerFactory};
use crate::cancel::CancellationToken;
use crate::certstore::CertificateStore;
use crate::error::RenewalError;
use crate::settings::RuntimeSettings;
use crate::storage::SslProvider;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const ORDER_DEADLINE: Duration = Duration::from_secs(120);
const ORDER_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AcmeDirectory {
    new_nonce: String,
    new_account: String,
    new_order: String,
}

#[derive(Debug, Deserialize)]
struct OrderResource {
    status: String,
    #[serde(default)]
    authorizations: Vec<String>,
    #[serde(default)]
    finalize: String,
    #[serde(default)]
    certificate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthorizationResource {
    status: String,
    identifier: IdentifierResource,
    #[serde(default)]
    challenges: Vec<ChallengeResource>,
}

#[derive(Debug, Deserialize)]
struct IdentifierResource {
    value: String,
}

#[derive(Debug, Deserialize)]
struct ChallengeResource {
    #[serde(rename = "type")]
    challenge_type: String,
    url: String,
    #[serde(default)]
    token: String,
    status: String,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

/// ES256 account key. The JWS layer needs raw `r || s` signatures, which is
/// exactly what the FIXED signing alg produces.
struct AccountKey {
    key_pair: EcdsaKeyPair,
    pkcs8_der: Vec<u8>,
}

impl AccountKey {
    fn generate() -> Result<Self> {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
            .map_err(|_| anyhow!("failed to generate ACME account key"))?;
        Self::from_pkcs8(pkcs8.as_ref())
    }

    fn from_pkcs8(der: &[u8]) -> Result<Self> {
        let rng = SystemRandom::new();
        let key_pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, der, &rng)
            .map_err(|_| anyhow!("failed to parse ACME account key"))?;
        Ok(Self {
            key_pair,
            pkcs8_der: der.to_vec(),
        })
    }

    fn from_pem(pem_str: &str) -> Result<Self> {
        let block = pem::parse(pem_str).context("account key is not valid PEM")?;
        Self::from_pkcs8(block.contents())
    }

    fn to_pem(&self) -> String {
        pem::encode(&pem::Pem::new("PRIVATE KEY", self.pkcs8_der.clone()))
    }

    fn jwk(&self) -> serde_json::Value {
        let public_key = self.key_pair.public_key().as_ref();
        // Uncompressed P-256 point: 0x04 || x (32 bytes) || y (32 bytes).
        let x = &public_key[1..33];
        let y = &public_key[33..65];
        serde_json::json!({
            "kty": "EC",
            "crv": "P-256",
            "x": URL_SAFE_NO_PAD.encode(x),
            "y": URL_SAFE_NO_PAD.encode(y),
        })
    }

    /// RFC 7638 thumbprint: sha256 over the required JWK members in
    /// lexicographic order.
    fn jwk_thumbprint(&self) -> String {
        let public_key = self.key_pair.public_key().as_ref();
        let x = &public_key[1..33];
        let y = &public_key[33..65];
        let jwk_json = format!(
            r#"{{"crv":"P-256","kty":"EC","x":"{}","y":"{}"}}"#,
            URL_SAFE_NO_PAD.encode(x),
            URL_SAFE_NO_PAD.encode(y),
        );
        let digest = ring::digest::digest(&ring::digest::SHA256, jwk_json.as_bytes());
        URL_SAFE_NO_PAD.encode(digest.as_ref())
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let rng = SystemRandom::new();
        let sig = self
            .key_pair
            .sign(&rng, data)
            .map_err(|_| anyhow!("ECDSA signing failed"))?;
        Ok(sig.as_ref().to_vec())
    }
}

/// RFC 8555 client bound to one (domain, environment) account. All authority
/// interactions are JWS-signed POSTs carrying a fresh single-use nonce from
/// the newNonce endpoint.
pub struct AcmeClient {
    directory_url: String,
    fqdn: String,
    store: CertificateStore,
    http: Client,
    directory: Option<AcmeDirectory>,
    account_key: Option<AccountKey>,
    account_url: Option<String>,
}

impl AcmeClient {
    pub fn new(directory_url: &str, fqdn: &str, store: CertificateStore) -> Result<Self> {
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build ACME HTTP client")?;
        Ok(Self {
            directory_url: directory_url.to_string(),
            fqdn: fqdn.to_string(),
            store,
            http,
            directory: None,
            account_key: None,
            account_url: None,
        })
    }

    fn directory(&mut self) -> Result<AcmeDirectory, RenewalError> {
        if let Some(dir) = &self.directory {
            return Ok(dir.clone());
        }
        let response = self
            .http
            .get(&self.directory_url)
            .send()
            .map_err(|err| self.protocol_error(&self.directory_url, &err.to_string()))?;
        if !response.status().is_success() {
            let problem = format!("directory returned HTTP {}", response.status());
            return Err(self.protocol_error(&self.directory_url, &problem));
        }
        let dir: AcmeDirectory = response
            .json()
            .map_err(|err| self.protocol_error(&self.directory_url, &err.to_string()))?;
        debug!("[acme] directory fetched from {}", self.directory_url);
        self.directory = Some(dir.clone());
        Ok(dir)
    }

    fn fresh_nonce(&mut self) -> Result<String, RenewalError> {
        let dir = self.directory()?;
        let response = self
            .http
            .head(&dir.new_nonce)
            .send()
            .map_err(|err| self.protocol_error(&dir.new_nonce, &err.to_string()))?;
        response
            .headers()
            .get("replay-nonce")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| self.protocol_error(&dir.new_nonce, "no replay-nonce header"))
    }

    fn build_jws(&self, url: &str, payload: &str, nonce: &str) -> Result<String> {
        let key = self
            .account_key
            .as_ref()
            .ok_or_else(|| anyhow!("account key not loaded"))?;

        // kid once the account exists; jwk only for newAccount.
        let header = if let Some(account_url) = &self.account_url {
            serde_json::json!({
                "alg": "ES256",
                "kid": account_url,
                "nonce": nonce,
                "url": url,
            })
        } else {
            serde_json::json!({
                "alg": "ES256",
                "jwk": key.jwk(),
                "nonce": nonce,
                "url": url,
            })
        };

        let protected = URL_SAFE_NO_PAD.encode(header.to_string().as_bytes());
        let payload_b64 = if payload.is_empty() {
            String::new() // POST-as-GET
        } else {
            URL_SAFE_NO_PAD.encode(payload.as_bytes())
        };

        let signing_input = format!("{protected}.{payload_b64}");
        let signature = key.sign(signing_input.as_bytes())?;

        Ok(serde_json::json!({
            "protected": protected,
            "payload": payload_b64,
            "signature": URL_SAFE_NO_PAD.encode(&signature),
        })
        .to_string())
    }

    fn signed_post(&mut self, url: &str, payload: &str) -> Result<Response, RenewalError> {
        let nonce = self.fresh_nonce()?;
        let body = self
            .build_jws(url, payload, &nonce)
            .map_err(|err| self.protocol_error(url, &format!("{err:#}")))?;
        self.http
            .post(url)
            .header("Content-Type", "application/jose+json")
            .body(body)
            .send()
            .map_err(|err| self.protocol_error(url, &err.to_string()))
    }

    /// POST with the problem document surfaced on any non-2xx response.
    fn signed_post_checked(&mut self, url: &str, payload: &str) -> Result<Response, RenewalError> {
        let response = self.signed_post(url, payload)?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().unwrap_or_default();
        let problem = problem_detail(&body)
            .unwrap_or_else(|| format!("HTTP {status}: {body}"));
        Err(self.protocol_error(url, &problem))
    }

    fn protocol_error(&self, url: &str, problem: &str) -> RenewalError {
        RenewalError::AcmeProtocolError {
            url: url.to_string(),
            problem: problem.to_string(),
        }
    }

    fn fetch_order(&mut self, order_url: &str) -> Result<OrderResource, RenewalError> {
        let response = self.signed_post_checked(order_url, "")?;
        response
            .json()
            .map_err(|err| self.protocol_error(order_url, &err.to_string()))
    }

    fn fetch_authorization(
        &mut self,
        auth_url: &str,
    ) -> Result<AuthorizationResource, RenewalError> {
        let response = self.signed_post_checked(auth_url, "")?;
        response
            .json()
            .map_err(|err| self.protocol_error(auth_url, &err.to_string()))
    }

    /// Collects the failed-authorization detail the authority attached to an
    /// invalid order, so the operator sees more than "invalid".
    fn invalid_order_detail(&mut self, order: &OrderResource) -> String {
        let mut details = Vec::new();
        for auth_url in order.authorizations.clone() {
            match self.fetch_authorization(&auth_url) {
                Ok(auth) => {
                    for challenge in auth.challenges {
                        if let Some(error) = challenge.error {
                            details.push(format!("{}: {}", auth.identifier.value, error));
                        }
                    }
                }
                Err(err) => warn!("[acme] failed to fetch authorization detail: {err}"),
            }
        }
        if details.is_empty() {
            "order invalid (no authorization detail available)".to_string()
        } else {
            details.join("; ")
        }
    }
}

impl Issuer for AcmeClient {
    fn ensure_account(&mut self, contact_email: Option<&str>) -> Result<(), RenewalError> {
        if let Some((key_pem, account_url)) = self.store.load_account(&self.fqdn) {
            let key = AccountKey::from_pem(&key_pem)
                .map_err(|err| RenewalError::ConfigMissing(format!("{err:#}")))?;
            self.account_key = Some(key);
            self.account_url = Some(account_url);
            debug!("[acme] loaded existing account for {}", self.fqdn);
            return Ok(());
        }

        let email = contact_email.ok_or_else(|| {
            RenewalError::ConfigMissing(
                "ACME contact email is not configured; cannot create account".to_string(),
            )
        })?;

        let key = AccountKey::generate()
            .map_err(|err| RenewalError::ConfigMissing(format!("{err:#}")))?;
        self.account_key = Some(key);
        self.account_url = None;

        let dir = self.directory()?;
        let payload = serde_json::json!({
            "termsOfServiceAgreed": true,
            "contact": [format!("mailto:{email}")],
        });
        let response = self.signed_post_checked(&dir.new_account, &payload.to_string())?;
        let account_url = response
            .headers()
            .get("location")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                self.protocol_error(&dir.new_account, "no Location header in account response")
            })?;

        let key_pem = self
            .account_key
            .as_ref()
            .map(AccountKey::to_pem)
            .unwrap_or_default();
        self.store
            .save_account(&self.fqdn, &key_pem, &account_url)
            .map_err(|err| self.protocol_error(&dir.new_account, &format!("{err:#}")))?;
        self.account_url = Some(account_url);
        info!("[acme] registered account for {}", self.fqdn);
        Ok(())
    }

    fn request_certificate(
        &mut self,
        domains: &[String],
    ) -> Result<CertificateOrder, RenewalError> {
        let dir = self.directory()?;
        let identifiers: Vec<serde_json::Value> = domains
            .iter()
            .map(|domain| serde_json::json!({ "type": "dns", "value": domain }))
            .collect();
        let payload = serde_json::json!({ "identifiers": identifiers });

        let response = self.signed_post_checked(&dir.new_order, &payload.to_string())?;
        let order_url = response
            .headers()
            .get("location")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                self.protocol_error(&dir.new_order, "no Location header in order response")
            })?;
        let order: OrderResource = response
            .json()
            .map_err(|err| self.protocol_error(&dir.new_order, &err.to_string()))?;

        let mut challenges = Vec::new();
        for auth_url in &order.authorizations {
            let auth = self.fetch_authorization(auth_url)?;
            debug!(
                "[acme] authorization for {} is {}",
                auth.identifier.value, auth.status
            );
            let challenge = auth
                .challenges
                .into_iter()
                .find(|challenge| challenge.challenge_type == "dns-01")
                .ok_or_else(|| {
                    self.protocol_error(
                        auth_url,
                        &format!("no DNS-01 challenge offered for {}", auth.identifier.value),
                    )
                })?;
            challenges.push(DnsChallenge {
                identifier: auth.identifier.value,
                url: challenge.url,
                token: challenge.token,
                status: challenge.status,
            });
        }

        info!(
            "[acme] order created for {} identifier(s), status {}",
            challenges.len(),
            order.status
        );
        Ok(CertificateOrder {
            url: order_url,
            finalize_url: order.finalize,
            status: order.status,
            certificate_url: order.certificate,
            challenges,
        })
    }

    fn key_authorization(&self, challenge: &DnsChallenge) -> Result<String, RenewalError> {
        let key = self.account_key.as_ref().ok_or_else(|| {
            RenewalError::ConfigMissing("ACME account key not loaded".to_string())
        })?;
        Ok(format!("{}.{}", challenge.token, key.jwk_thumbprint()))
    }

    fn complete_challenge(&mut self, challenge: &DnsChallenge) -> Result<(), RenewalError> {
        if challenge.status == "valid" {
            debug!("[acme] challenge for {} already valid", challenge.identifier);
            return Ok(());
        }
        // The ready signal is an empty JSON object, not a POST-as-GET.
        self.signed_post_checked(&challenge.url, "{}")?;
        Ok(())
    }

    fn wait_for_order_completion(
        &mut self,
        order: &CertificateOrder,
        cancel: &CancellationToken,
    ) -> Result<CertificateOrder, RenewalError> {
        let deadline = Instant::now() + ORDER_DEADLINE;
        loop {
            cancel.ensure_active()?;
            let resource = self.fetch_order(&order.url)?;
            match resource.status.as_str() {
                // `valid` only appears after finalization; `ready` means every
                // authorization passed.
                "ready" | "valid" => {
                    debug!("[acme] order {} reached {}", order.url, resource.status);
                    let mut updated = order.clone();
                    updated.status = resource.status;
                    updated.certificate_url = resource.certificate;
                    return Ok(updated);
                }
                "invalid" => {
                    let detail = self.invalid_order_detail(&resource);
                    return Err(RenewalError::OrderInvalid(detail));
                }
                other => {
                    debug!("[acme] order {} still {}", order.url, other);
                }
            }
            if Instant::now() >= deadline {
                return Err(RenewalError::OrderInvalid(format!(
                    "order did not complete within {}s",
                    ORDER_DEADLINE.as_secs()
                )));
            }
            cancel.sleep(ORDER_POLL_INTERVAL)?;
        }
    }

    fn finalize_certificate(
        &mut self,
        order: &CertificateOrder,
        csr_pem: &str,
        cancel: &CancellationToken,
    ) -> Result<String, RenewalError> {
        let csr_block = pem::parse(csr_pem)
            .map_err(|err| RenewalError::CsrFormatInvalid(err.to_string()))?;
        let csr_b64 = URL_SAFE_NO_PAD.encode(csr_block.contents());

        if order.status != "valid" {
            let payload = serde_json::json!({ "csr": csr_b64 });
            self.signed_post_checked(&order.finalize_url, &payload.to_string())?;
        }

        // The certificate URL appears once the order turns valid.
        let deadline = Instant::now() + ORDER_DEADLINE;
        let certificate_url = loop {
            cancel.ensure_active()?;
            let resource = self.fetch_order(&order.url)?;
            match resource.status.as_str() {
                "valid" => match resource.certificate {
                    Some(url) => break url,
                    None => {
                        return Err(RenewalError::OrderInvalid(
                            "order valid but no certificate URL".to_string(),
                        ));
                    }
                },
                "invalid" => {
                    let detail = self.invalid_order_detail(&resource);
                    return Err(RenewalError::OrderInvalid(detail));
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(RenewalError::OrderInvalid(format!(
                    "finalized order did not become valid within {}s",
                    ORDER_DEADLINE.as_secs()
                )));
            }
            cancel.sleep(ORDER_POLL_INTERVAL)?;
        };

        let response = self.signed_post_checked(&certificate_url, "")?;
        let chain = response
            .text()
            .map_err(|err| RenewalError::AcmeProtocolError {
                url: certificate_url.clone(),
                problem: err.to_string(),
            })?;
        info!("[acme] downloaded {} byte chain for {}", chain.len(), self.fqdn);
        Ok(chain)
    }
}

/// Builds [`AcmeClient`] issuers bound to the runtime environment and the
/// certificate store.
pub struct AcmeIssuerFactory {
    store: CertificateStore,
    settings: RuntimeSettings,
}

impl AcmeIssuerFactory {
    pub fn new(store: CertificateStore, settings: RuntimeSettings) -> Self {
        Self { store, settings }
    }
}

impl IssuerFactory for AcmeIssuerFactory {
    fn issuer_for(
        &self,
        fqdn: &str,
        provider: SslProvider,
    ) -> Result<Box<dyn Issuer>, RenewalError> {
        let url = super::directory_url(provider, self.settings.environment);
        let client = AcmeClient::new(url, fqdn, self.store.clone())
            .map_err(|err| RenewalError::ConfigMissing(format!("{err:#}")))?;
        Ok(Box::new(client))
    }
}

fn problem_detail(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let detail = value.get("detail")?.as_str()?;
    let problem_type = value
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or("about:blank");
    Some(format!("{problem_type}: {detail}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Environment;

    fn client() -> (tempfile::TempDir, AcmeClient) {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path(), Environment::Staging);
        let client = AcmeClient::new(
            "https://acme.example/directory",
            "ucm01.lab.example.com",
            store,
        )
        .unwrap();
        (dir, client)
    }

    #[test]
    fn account_key_pem_round_trips() {
        let key = AccountKey::generate().unwrap();
        let pem = key.to_pem();
        let reloaded = AccountKey::from_pem(&pem).unwrap();
        assert_eq!(key.pkcs8_der, reloaded.pkcs8_der);
        assert_eq!(key.jwk_thumbprint(), reloaded.jwk_thumbprint());
    }

    #[test]
    fn thumbprint_is_unpadded_base64url_sha256() {
        let key = AccountKey::generate().unwrap();
        let thumbprint = key.jwk_thumbprint();
        assert_eq!(thumbprint.len(), 43);
        assert!(!thumbprint.contains('='));
    }

    #[test]
    fn jwk_has_ec_p256_members() {
        let key = AccountKey::generate().unwrap();
        let jwk = key.jwk();
        assert_eq!(jwk["kty"], "EC");
        assert_eq!(jwk["crv"], "P-256");
        assert!(jwk["x"].is_string());
        assert!(jwk["y"].is_string());
    }

    #[test]
    fn jws_uses_jwk_before_account_and_kid_after() {
        let (_dir, mut client) = client();
        client.account_key = Some(AccountKey::generate().unwrap());

        let jws = client
            .build_jws("https://acme.example/new-acct", r#"{"a":1}"#, "nonce-1")
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&jws).unwrap();
        let protected = URL_SAFE_NO_PAD
            .decode(parsed["protected"].as_str().unwrap())
            .unwrap();
        let header: serde_json::Value = serde_json::from_slice(&protected).unwrap();
        assert_eq!(header["alg"], "ES256");
        assert!(header["jwk"].is_object());
        assert!(header.get("kid").is_none());
        assert_eq!(header["nonce"], "nonce-1");

        client.account_url = Some("https://acme.example/acct/7".to_string());
        let jws = client
            .build_jws("https://acme.example/order", r#"{"a":1}"#, "nonce-2")
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&jws).unwrap();
        let protected = URL_SAFE_NO_PAD
            .decode(parsed["protected"].as_str().unwrap())
            .unwrap();
        let header: serde_json::Value = serde_json::from_slice(&protected).unwrap();
        assert_eq!(header["kid"], "https://acme.example/acct/7");
        assert!(header.get("jwk").is_none());
    }

    #[test]
    fn post_as_get_has_empty_payload() {
        let (_dir, mut client) = client();
        client.account_key = Some(AccountKey::generate().unwrap());
        let jws = client
            .build_jws("https://acme.example/auth/1", "", "nonce-3")
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&jws).unwrap();
        assert_eq!(parsed["payload"], "");
    }

    #[test]
    fn build_jws_without_key_fails() {
        let (_dir, client) = client();
        assert!(client.build_jws("https://acme.example", "{}", "n").is_err());
    }

    #[test]
    fn key_authorization_joins_token_and_thumbprint() {
        let (_dir, mut client) = client();
        let key = AccountKey::generate().unwrap();
        let thumbprint = key.jwk_thumbprint();
        client.account_key = Some(key);
        let challenge = DnsChallenge {
            identifier: "a.example.com".into(),
            url: "https://acme.example/chall/1".into(),
            token: "tok-123".into(),
            status: "pending".into(),
        };
        let key_auth = client.key_authorization(&challenge).unwrap();
        assert_eq!(key_auth, format!("tok-123.{thumbprint}"));
    }

    #[test]
    fn ensure_account_without_email_or_stored_account_fails() {
        let (_dir, mut client) = client();
        let err = client.ensure_account(None).unwrap_err();
        assert!(matches!(err, RenewalError::ConfigMissing(_)));
    }

    #[test]
    fn problem_detail_extracts_type_and_detail() {
        let body = r#"{"type":"urn:ietf:params:acme:error:badNonce","detail":"stale nonce"}"#;
        let problem = problem_detail(body).unwrap();
        assert!(problem.contains("badNonce"));
        assert!(problem.contains("stale nonce"));
        assert!(problem_detail("not json").is_none());
    }
}
