use std::collections::HashMap;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Row, params};
use serde::{Deserialize, Serialize};

use super::db::Db;
use crate::status::{RenewalState, RenewalStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationType {
    Vos,
    General,
    Portal,
}

impl ApplicationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationType::Vos => "vos",
            ApplicationType::General => "general",
            ApplicationType::Portal => "portal",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "vos" => Ok(ApplicationType::Vos),
            "general" => Ok(ApplicationType::General),
            "portal" => Ok(ApplicationType::Portal),
            other => Err(anyhow!("unknown application type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SslProvider {
    AcmePrimary,
    AcmeAlt,
}

impl SslProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            SslProvider::AcmePrimary => "acme_primary",
            SslProvider::AcmeAlt => "acme_alt",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "acme_primary" => Ok(SslProvider::AcmePrimary),
            "acme_alt" => Ok(SslProvider::AcmeAlt),
            other => Err(anyhow!("unknown ssl provider: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DnsProviderKind {
    Cloudflare,
    Digitalocean,
    Route53,
    Azure,
    Google,
    Custom,
}

impl DnsProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DnsProviderKind::Cloudflare => "cloudflare",
            DnsProviderKind::Digitalocean => "digitalocean",
            DnsProviderKind::Route53 => "route53",
            DnsProviderKind::Azure => "azure",
            DnsProviderKind::Google => "google",
            DnsProviderKind::Custom => "custom",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "cloudflare" => Ok(DnsProviderKind::Cloudflare),
            "digitalocean" => Ok(DnsProviderKind::Digitalocean),
            "route53" => Ok(DnsProviderKind::Route53),
            "azure" => Ok(DnsProviderKind::Azure),
            "google" => Ok(DnsProviderKind::Google),
            "custom" => Ok(DnsProviderKind::Custom),
            other => Err(anyhow!("unknown dns provider: {other}")),
        }
    }
}

/// One managed endpoint: the unit of renewal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: i64,
    pub name: String,
    pub application_type: ApplicationType,
    pub hostname: String,
    pub domain: String,
    pub alt_names: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl_provider: SslProvider,
    pub dns_provider: DnsProviderKind,
    pub custom_csr: Option<String>,
    pub enable_ssh: bool,
    pub auto_restart_service: bool,
    pub last_cert_issued: Option<DateTime<Utc>>,
    pub cert_count_this_week: i64,
    pub cert_count_reset_date: Option<DateTime<Utc>>,
}

/// Insert shape for new connections; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewConnection {
    pub name: String,
    pub application_type: ApplicationType,
    pub hostname: String,
    pub domain: String,
    pub alt_names: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl_provider: SslProvider,
    pub dns_provider: DnsProviderKind,
    pub custom_csr: Option<String>,
    pub enable_ssh: bool,
    pub auto_restart_service: bool,
}

#[derive(Debug, Clone)]
pub struct Setting {
    pub provider: String,
    pub key: String,
    pub value: String,
}

/// SQLite-backed store for Connections, Settings, and persisted renewal
/// statuses. The orchestrator treats this store as authoritative; its
/// in-memory status map is a cache on top.
#[derive(Clone)]
pub struct ConfigStore {
    db: Db,
}

impl ConfigStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn insert_connection(&self, new: &NewConnection) -> Result<Connection> {
        let conn = self.db.lock_conn()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"
            INSERT INTO connections (
                name, application_type, hostname, domain, alt_names, username, password,
                ssl_provider, dns_provider, custom_csr, enable_ssh, auto_restart_service,
                created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)
            "#,
            params![
                new.name,
                new.application_type.as_str(),
                new.hostname,
                new.domain,
                new.alt_names.join(","),
                new.username,
                new.password,
                new.ssl_provider.as_str(),
                new.dns_provider.as_str(),
                new.custom_csr,
                new.enable_ssh,
                new.auto_restart_service,
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_connection_by_id(id)?
            .ok_or_else(|| anyhow!("connection not found after insert: {id}"))
    }

    pub fn get_connection_by_id(&self, id: i64) -> Result<Option<Connection>> {
        let conn = self.db.lock_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, name, application_type, hostname, domain, alt_names, username, password,
                   ssl_provider, dns_provider, custom_csr, enable_ssh, auto_restart_service,
                   last_cert_issued, cert_count_this_week, cert_count_reset_date
            FROM connections
            WHERE id = ?1
            "#,
        )?;
        let mut rows = stmt.query(params![id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Self::row_to_connection(row)?))
        } else {
            Ok(None)
        }
    }

    /// Stamps the renewal-accounting fields after a successful issuance.
    /// The weekly counter resets once its reset date is more than 7 days old.
    pub fn record_certificate_issued(&self, id: i64, issued_at: DateTime<Utc>) -> Result<()> {
        let current = self
            .get_connection_by_id(id)?
            .ok_or_else(|| anyhow!("connection not found: {id}"))?;

        let week_expired = current
            .cert_count_reset_date
            .map(|reset| issued_at - reset > chrono::Duration::days(7))
            .unwrap_or(true);
        let (count, reset_date) = if week_expired {
            (1, issued_at)
        } else {
            (
                current.cert_count_this_week + 1,
                current.cert_count_reset_date.unwrap_or(issued_at),
            )
        };

        let conn = self.db.lock_conn()?;
        conn.execute(
            r#"
            UPDATE connections
            SET last_cert_issued = ?2,
                cert_count_this_week = ?3,
                cert_count_reset_date = ?4,
                updated_at = ?5
            WHERE id = ?1
            "#,
            params![
                id,
                issued_at.to_rfc3339(),
                count,
                reset_date.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn set_setting(&self, provider: &str, key: &str, value: &str) -> Result<()> {
        let conn = self.db.lock_conn()?;
        conn.execute(
            r#"
            INSERT INTO settings (provider, key, value, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(provider, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![provider, key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_settings_by_provider(&self, provider: &str) -> Result<HashMap<String, String>> {
        let conn = self.db.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT key, value FROM settings WHERE provider = ?1",
        )?;
        let mut rows = stmt.query(params![provider])?;
        let mut settings = HashMap::new();
        while let Some(row) = rows.next()? {
            settings.insert(row.get::<_, String>(0)?, row.get::<_, String>(1)?);
        }
        Ok(settings)
    }

    pub fn save_renewal_status(&self, status: &RenewalStatus) -> Result<()> {
        let logs = serde_json::to_string(&status.logs).context("failed to encode renewal logs")?;
        let conn = self.db.lock_conn()?;
        conn.execute(
            r#"
            INSERT INTO renewal_status (
                id, connection_id, state, message, error, start_time, end_time, logs, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                message = excluded.message,
                error = excluded.error,
                end_time = excluded.end_time,
                logs = excluded.logs,
                updated_at = excluded.updated_at
            "#,
            params![
                status.id,
                status.connection_id,
                status.state.as_str(),
                status.message,
                status.error,
                status.start_time.to_rfc3339(),
                status.end_time.map(|t| t.to_rfc3339()),
                logs,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Reconstructs a persisted status. Progress is recomputed from the
    /// state mapping; it is not stored.
    pub fn get_renewal_status(&self, id: &str) -> Result<Option<RenewalStatus>> {
        let conn = self.db.lock_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, connection_id, state, message, error, start_time, end_time, logs
            FROM renewal_status
            WHERE id = ?1
            "#,
        )?;
        let mut rows = stmt.query(params![id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Self::row_to_status(row)?))
        } else {
            Ok(None)
        }
    }

    /// Marks every non-terminal persisted status as failed. Invoked once at
    /// startup so statuses orphaned by a crash do not read as active forever.
    pub fn fail_interrupted_renewals(&self) -> Result<usize> {
        let conn = self.db.lock_conn()?;
        let changed = conn.execute(
            r#"
            UPDATE renewal_status
            SET state = 'failed',
                error = 'interrupted',
                message = 'interrupted',
                end_time = ?1,
                updated_at = ?1
            WHERE state NOT IN ('completed', 'failed')
            "#,
            params![Utc::now().to_rfc3339()],
        )?;
        Ok(changed)
    }

    fn row_to_connection(row: &Row<'_>) -> Result<Connection> {
        let alt_names_raw: String = row.get(5)?;
        let alt_names = alt_names_raw
            .split([',', ' '])
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        Ok(Connection {
            id: row.get(0)?,
            name: row.get(1)?,
            application_type: ApplicationType::parse(&row.get::<_, String>(2)?)?,
            hostname: row.get(3)?,
            domain: row.get(4)?,
            alt_names,
            username: row.get(6)?,
            password: row.get(7)?,
            ssl_provider: SslProvider::parse(&row.get::<_, String>(8)?)?,
            dns_provider: DnsProviderKind::parse(&row.get::<_, String>(9)?)?,
            custom_csr: row.get(10)?,
            enable_ssh: row.get(11)?,
            auto_restart_service: row.get(12)?,
            last_cert_issued: Self::parse_timestamp(row.get::<_, Option<String>>(13)?)?,
            cert_count_this_week: row.get(14)?,
            cert_count_reset_date: Self::parse_timestamp(row.get::<_, Option<String>>(15)?)?,
        })
    }

    fn row_to_status(row: &Row<'_>) -> Result<RenewalStatus> {
        let state = RenewalState::parse(&row.get::<_, String>(2)?)
            .ok_or_else(|| anyhow!("unknown renewal state in store"))?;
        let logs: Vec<String> = serde_json::from_str(&row.get::<_, String>(7)?)
            .context("failed to decode renewal logs")?;
        Ok(RenewalStatus {
            id: row.get(0)?,
            connection_id: row.get(1)?,
            state,
            message: row.get(3)?,
            progress: state.progress(),
            start_time: Self::parse_timestamp(Some(row.get::<_, String>(5)?))?
                .ok_or_else(|| anyhow!("missing start_time"))?,
            end_time: Self::parse_timestamp(row.get::<_, Option<String>>(6)?)?,
            error: row.get(4)?,
            logs,
            manual_dns_entry: None,
        })
    }

    fn parse_timestamp(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
        match raw {
            None => Ok(None),
            Some(raw) => {
                let parsed = DateTime::parse_from_rfc3339(&raw)
                    .with_context(|| format!("invalid timestamp in store: {raw}"))?;
                Ok(Some(parsed.with_timezone(&Utc)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::RenewalState;

    fn store() -> (tempfile::TempDir, ConfigStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::initialize(dir.path()).unwrap();
        (dir, ConfigStore::new(db))
    }

    fn sample_connection() -> NewConnection {
        NewConnection {
            name: "lab ucm".into(),
            application_type: ApplicationType::Vos,
            hostname: "ucm01".into(),
            domain: "lab.example.com".into(),
            alt_names: vec!["ucm01-ext.lab.example.com".into()],
            username: Some("admin".into()),
            password: Some("p".into()),
            ssl_provider: SslProvider::AcmePrimary,
            dns_provider: DnsProviderKind::Cloudflare,
            custom_csr: None,
            enable_ssh: true,
            auto_restart_service: false,
        }
    }

    #[test]
    fn connection_round_trips() {
        let (_dir, store) = store();
        let created = store.insert_connection(&sample_connection()).unwrap();
        let loaded = store.get_connection_by_id(created.id).unwrap().unwrap();
        assert_eq!(loaded.hostname, "ucm01");
        assert_eq!(loaded.application_type, ApplicationType::Vos);
        assert_eq!(loaded.dns_provider, DnsProviderKind::Cloudflare);
        assert_eq!(loaded.alt_names, vec!["ucm01-ext.lab.example.com"]);
        assert!(loaded.enable_ssh);
        assert!(loaded.last_cert_issued.is_none());
    }

    #[test]
    fn missing_connection_is_none() {
        let (_dir, store) = store();
        assert!(store.get_connection_by_id(42).unwrap().is_none());
    }

    #[test]
    fn weekly_counter_increments_then_resets() {
        let (_dir, store) = store();
        let created = store.insert_connection(&sample_connection()).unwrap();

        let first = Utc::now();
        store.record_certificate_issued(created.id, first).unwrap();
        store.record_certificate_issued(created.id, first).unwrap();
        let loaded = store.get_connection_by_id(created.id).unwrap().unwrap();
        assert_eq!(loaded.cert_count_this_week, 2);

        let next_week = first + chrono::Duration::days(8);
        store
            .record_certificate_issued(created.id, next_week)
            .unwrap();
        let loaded = store.get_connection_by_id(created.id).unwrap().unwrap();
        assert_eq!(loaded.cert_count_this_week, 1);
        assert_eq!(loaded.last_cert_issued.unwrap(), next_week);
    }

    #[test]
    fn settings_upsert_by_provider_and_key() {
        let (_dir, store) = store();
        store.set_setting("cloudflare", "CF_KEY", "token-1").unwrap();
        store.set_setting("cloudflare", "CF_KEY", "token-2").unwrap();
        store.set_setting("digitalocean", "DO_TOKEN", "do-1").unwrap();

        let cf = store.get_settings_by_provider("cloudflare").unwrap();
        assert_eq!(cf.get("CF_KEY").map(String::as_str), Some("token-2"));
        assert_eq!(cf.len(), 1);
        assert!(store.get_settings_by_provider("route53").unwrap().is_empty());
    }

    #[test]
    fn renewal_status_round_trips_with_recomputed_progress() {
        let (_dir, store) = store();
        let mut status = RenewalStatus::new("r-1".into(), 7);
        status.state = RenewalState::WaitingDnsPropagation;
        status.progress = 50;
        status.append_log("Created DNS TXT record");
        store.save_renewal_status(&status).unwrap();

        let loaded = store.get_renewal_status("r-1").unwrap().unwrap();
        assert_eq!(loaded.state, RenewalState::WaitingDnsPropagation);
        assert_eq!(loaded.progress, 50);
        assert_eq!(loaded.logs.len(), 1);
        assert!(loaded.end_time.is_none());
    }

    #[test]
    fn interrupted_recovery_fails_only_non_terminal() {
        let (_dir, store) = store();
        let mut active = RenewalStatus::new("r-active".into(), 1);
        active.state = RenewalState::CompletingValidation;
        store.save_renewal_status(&active).unwrap();

        let mut done = RenewalStatus::new("r-done".into(), 2);
        done.state = RenewalState::Completed;
        done.end_time = Some(Utc::now());
        store.save_renewal_status(&done).unwrap();

        assert_eq!(store.fail_interrupted_renewals().unwrap(), 1);

        let recovered = store.get_renewal_status("r-active").unwrap().unwrap();
        assert_eq!(recovered.state, RenewalState::Failed);
        assert_eq!(recovered.error.as_deref(), Some("interrupted"));
        assert!(recovered.end_time.is_some());

        let untouched = store.get_renewal_status("r-done").unwrap().unwrap();
        assert_eq!(untouched.state, RenewalState::Completed);
    }
}
