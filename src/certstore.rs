use std::{
    collections::HashMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result, anyhow};
use chrono::{TimeZone, Utc};
use log::{debug, warn};
use x509_parser::pem::parse_x509_pem;

use crate::settings::Environment;

/// How much validity must remain before a stored certificate is renewed
/// rather than reused.
const REUSE_MARGIN_DAYS: i64 = 30;

/// Per-domain, per-environment filesystem store for CSRs, keys, certificate
/// chains, ACME account material, and the append-only renewal log.
///
/// Layout:
/// ```text
/// <root>/<fqdn>/csr.pem
/// <root>/<fqdn>/private_key.pem
/// <root>/<fqdn>/renewal.log
/// <root>/<fqdn>/<staging|prod>/certificate.pem
/// <root>/<fqdn>/<staging|prod>/chain.pem
/// <root>/<fqdn>/<staging|prod>/fullchain.pem
/// <root>/<fqdn>/<staging|prod>/account.key
/// <root>/<fqdn>/<staging|prod>/account.url
/// ```
#[derive(Clone)]
pub struct CertificateStore {
    root: PathBuf,
    environment: Environment,
    // Serializes same-FQDN access; renewals of different domains stay lock-free.
    domain_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl CertificateStore {
    pub fn new(root: impl Into<PathBuf>, environment: Environment) -> Self {
        Self {
            root: root.into(),
            environment,
            domain_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn domain_dir(&self, fqdn: &str) -> PathBuf {
        self.root.join(fqdn)
    }

    pub fn env_dir(&self, fqdn: &str) -> PathBuf {
        self.domain_dir(fqdn).join(self.environment.dir_name())
    }

    fn lock_for(&self, fqdn: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .domain_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(fqdn.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| anyhow!("path has no parent: {}", path.display()))?;
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("failed to create tempfile in {}", dir.display()))?;
        tmp.write_all(contents)
            .with_context(|| format!("failed to write {}", path.display()))?;
        tmp.persist(path)
            .with_context(|| format!("failed to persist {}", path.display()))?;
        Ok(())
    }

    pub fn save_csr(&self, fqdn: &str, csr_pem: &str) -> Result<()> {
        let lock = self.lock_for(fqdn);
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.write_atomic(&self.domain_dir(fqdn).join("csr.pem"), csr_pem.as_bytes())
    }

    pub fn load_csr(&self, fqdn: &str) -> Option<String> {
        fs::read_to_string(self.domain_dir(fqdn).join("csr.pem")).ok()
    }

    pub fn save_private_key(&self, fqdn: &str, key_pem: &str) -> Result<()> {
        let lock = self.lock_for(fqdn);
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.write_atomic(
            &self.domain_dir(fqdn).join("private_key.pem"),
            key_pem.as_bytes(),
        )
    }

    pub fn load_private_key(&self, fqdn: &str) -> Option<String> {
        fs::read_to_string(self.domain_dir(fqdn).join("private_key.pem")).ok()
    }

    /// Persists the issued chain as leaf, intermediates, and the full bundle.
    pub fn save_certificates(
        &self,
        fqdn: &str,
        leaf_pem: &str,
        chain_pem: &str,
        fullchain_pem: &str,
    ) -> Result<()> {
        let lock = self.lock_for(fqdn);
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let env_dir = self.env_dir(fqdn);
        self.write_atomic(&env_dir.join("certificate.pem"), leaf_pem.as_bytes())?;
        self.write_atomic(&env_dir.join("chain.pem"), chain_pem.as_bytes())?;
        self.write_atomic(&env_dir.join("fullchain.pem"), fullchain_pem.as_bytes())?;
        Ok(())
    }

    /// Convenience copies for general-purpose servers: `<fqdn>.crt` next to
    /// the PEM artifacts, and `<fqdn>.key` when a private key is on file.
    pub fn save_general_copies(&self, fqdn: &str) -> Result<()> {
        let lock = self.lock_for(fqdn);
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let env_dir = self.env_dir(fqdn);
        let fullchain = fs::read(env_dir.join("fullchain.pem"))
            .with_context(|| format!("fullchain.pem missing for {fqdn}"))?;
        self.write_atomic(&env_dir.join(format!("{fqdn}.crt")), &fullchain)?;
        if let Some(key) = self.load_private_key(fqdn) {
            self.write_atomic(&env_dir.join(format!("{fqdn}.key")), key.as_bytes())?;
        }
        Ok(())
    }

    pub fn load_certificate(&self, fqdn: &str) -> Option<String> {
        fs::read_to_string(self.env_dir(fqdn).join("certificate.pem")).ok()
    }

    pub fn load_fullchain(&self, fqdn: &str) -> Option<String> {
        fs::read_to_string(self.env_dir(fqdn).join("fullchain.pem")).ok()
    }

    /// Returns the stored chain when it is still worth reusing: the leaf
    /// parses and its notAfter is more than 30 days out. Parse and I/O
    /// problems mean "not reusable", never an error.
    pub fn reusable_certificate(&self, fqdn: &str) -> Option<String> {
        let pem = self
            .load_fullchain(fqdn)
            .or_else(|| self.load_certificate(fqdn))?;
        match Self::not_after(&pem) {
            Ok(not_after) => {
                let margin = Utc::now() + chrono::Duration::days(REUSE_MARGIN_DAYS);
                if not_after > margin {
                    debug!("[certstore] {fqdn} certificate valid until {not_after}, reusing");
                    Some(pem)
                } else {
                    debug!("[certstore] {fqdn} certificate expires {not_after}, renewing");
                    None
                }
            }
            Err(err) => {
                warn!("[certstore] failed to parse stored certificate for {fqdn}: {err:#}");
                None
            }
        }
    }

    pub fn not_after(pem: &str) -> Result<chrono::DateTime<Utc>> {
        let (_, pem_block) = parse_x509_pem(pem.as_bytes())
            .map_err(|e| anyhow!("failed to parse certificate PEM: {e}"))?;
        let cert = pem_block
            .parse_x509()
            .map_err(|e| anyhow!("failed to parse certificate DER: {e}"))?;
        Utc.timestamp_opt(cert.validity().not_after.timestamp(), 0)
            .single()
            .ok_or_else(|| anyhow!("certificate notAfter out of range"))
    }

    /// Appends one `ISO-8601 timestamp + " " + message` line to the
    /// per-domain renewal log.
    pub fn append_renewal_log(&self, fqdn: &str, message: &str) -> Result<()> {
        let lock = self.lock_for(fqdn);
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let dir = self.domain_dir(fqdn);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("renewal.log"))
            .context("failed to open renewal.log")?;
        writeln!(file, "{} {}", Utc::now().to_rfc3339(), message)
            .context("failed to append to renewal.log")?;
        Ok(())
    }

    pub fn save_account(&self, fqdn: &str, key_pem: &str, account_url: &str) -> Result<()> {
        let lock = self.lock_for(fqdn);
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let env_dir = self.env_dir(fqdn);
        self.write_atomic(&env_dir.join("account.key"), key_pem.as_bytes())?;
        self.write_atomic(&env_dir.join("account.url"), account_url.as_bytes())?;
        Ok(())
    }

    pub fn load_account(&self, fqdn: &str) -> Option<(String, String)> {
        let env_dir = self.env_dir(fqdn);
        let key = fs::read_to_string(env_dir.join("account.key")).ok()?;
        let url = fs::read_to_string(env_dir.join("account.url")).ok()?;
        let url = url.trim().to_string();
        if url.is_empty() {
            return None;
        }
        Some((key, url))
    }
}
