use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    thread,
};

use chrono::Utc;
use log::{error, info, warn};
use uuid::Uuid;

use crate::acme::{AcmeIssuerFactory, IssuerFactory};
use crate::cancel::CancellationToken;
use crate::certstore::CertificateStore;
use crate::device::{DeviceFactory, VosDeviceFactory};
use crate::dns::{DefaultDnsAdapterFactory, DnsAdapterFactory, PropagationVerifier};
use crate::error::RenewalError;
use crate::settings::RuntimeSettings;
use crate::ssh::{NoSshClient, SshClient};
use crate::status::{ManualDnsEntry, RenewalState, RenewalStatus};
use crate::storage::ConfigStore;

mod renewal;

pub(crate) struct OrchestratorInner {
    pub config: ConfigStore,
    pub certs: CertificateStore,
    pub issuers: Box<dyn IssuerFactory>,
    pub devices: Box<dyn DeviceFactory>,
    pub dns: Box<dyn DnsAdapterFactory>,
    pub ssh: Box<dyn SshClient>,
    pub verifier: PropagationVerifier,
    pub settings: RuntimeSettings,
    statuses: Mutex<HashMap<String, RenewalStatus>>,
    active: Mutex<HashSet<i64>>,
    cancels: Mutex<HashMap<String, CancellationToken>>,
}

/// Drives renewals end to end: one background thread per connection, a
/// mutex-guarded active set for single-flight, and the status map as the
/// in-memory cache over the persisted status store.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    pub fn new(config: ConfigStore, certs: CertificateStore, settings: RuntimeSettings) -> Self {
        let issuers = Box::new(AcmeIssuerFactory::new(certs.clone(), settings.clone()));
        Self::with_collaborators(
            config,
            certs,
            settings,
            issuers,
            Box::new(VosDeviceFactory),
            Box::new(DefaultDnsAdapterFactory),
            Box::new(NoSshClient),
            PropagationVerifier::public_panel(),
        )
    }

    /// Fully injected construction; production wiring goes through
    /// [`Orchestrator::new`].
    #[allow(clippy::too_many_arguments)]
    pub fn with_collaborators(
        config: ConfigStore,
        certs: CertificateStore,
        settings: RuntimeSettings,
        issuers: Box<dyn IssuerFactory>,
        devices: Box<dyn DeviceFactory>,
        dns: Box<dyn DnsAdapterFactory>,
        ssh: Box<dyn SshClient>,
        verifier: PropagationVerifier,
    ) -> Self {
        // Crash recovery: whatever was in flight when the process died is lost.
        match config.fail_interrupted_renewals() {
            Ok(0) => {}
            Ok(count) => warn!("[renewal] marked {count} interrupted renewal(s) as failed"),
            Err(err) => warn!("[renewal] failed to recover interrupted renewals: {err:#}"),
        }

        Self {
            inner: Arc::new(OrchestratorInner {
                config,
                certs,
                issuers,
                devices,
                dns,
                ssh,
                verifier,
                settings,
                statuses: Mutex::new(HashMap::new()),
                active: Mutex::new(HashSet::new()),
                cancels: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Starts a renewal for the connection and returns its status record
    /// immediately; the work happens on a background thread. At most one
    /// renewal per connection may be in flight.
    pub fn start_renewal(&self, connection_id: i64) -> Result<RenewalStatus, RenewalError> {
        let connection = self
            .inner
            .config
            .get_connection_by_id(connection_id)
            .map_err(|err| RenewalError::Internal(format!("{err:#}")))?
            .ok_or(RenewalError::NotFound(connection_id))?;

        // Insertion into the active set is the single-flight gate; everything
        // after it must go through the guard so the slot is always released.
        {
            let mut active = lock(&self.inner.active);
            if !active.insert(connection_id) {
                return Err(RenewalError::AlreadyActive(connection_id));
            }
        }

        // No fallible work between the insert above and the guard below; from
        // here the guard owns the slot.
        let renewal_id = Uuid::new_v4().to_string();
        let guard = ActiveGuard {
            inner: self.inner.clone(),
            connection_id,
            renewal_id: renewal_id.clone(),
        };
        let status = RenewalStatus::new(renewal_id.clone(), connection_id);
        lock(&self.inner.statuses).insert(renewal_id.clone(), status.clone());
        let cancel = CancellationToken::new();
        lock(&self.inner.cancels).insert(renewal_id.clone(), cancel.clone());
        self.persist_status(&status);

        let inner = self.inner.clone();
        let thread_status = status.clone();
        let spawned = thread::Builder::new()
            .name(format!("renewal-{renewal_id}"))
            .spawn(move || {
                // The guard lives for the whole task, so the active-set slot is
                // released on success, failure, and panic alike.
                let _guard = guard;
                let tracker = StatusTracker {
                    inner: inner.clone(),
                    renewal_id: thread_status.id.clone(),
                };
                info!(
                    "[renewal] {} started for connection {}",
                    thread_status.id, connection.id
                );
                match renewal::perform_renewal(&inner, &connection, &tracker, &cancel) {
                    Ok(()) => tracker.complete("Renewal completed"),
                    Err(err) => tracker.fail(&err),
                }
            });

        if let Err(err) = spawned {
            error!("[renewal] failed to spawn renewal thread: {err}");
            let tracker = StatusTracker {
                inner: self.inner.clone(),
                renewal_id: renewal_id.clone(),
            };
            tracker.fail(&RenewalError::Internal(err.to_string()));
            return Err(RenewalError::Internal(err.to_string()));
        }

        Ok(status)
    }

    /// Live status if present, else reconstructed from the store (progress
    /// recomputed from the state mapping) and cached.
    pub fn get_renewal_status(&self, renewal_id: &str) -> Option<RenewalStatus> {
        if let Some(status) = lock(&self.inner.statuses).get(renewal_id) {
            return Some(status.clone());
        }
        match self.inner.config.get_renewal_status(renewal_id) {
            Ok(Some(status)) => {
                lock(&self.inner.statuses).insert(renewal_id.to_string(), status.clone());
                Some(status)
            }
            Ok(None) => None,
            Err(err) => {
                warn!("[renewal] failed to load status {renewal_id}: {err:#}");
                None
            }
        }
    }

    /// Flips the renewal's cancellation token. The task observes it at its
    /// next suspension point. Idempotent; false when the id is unknown.
    pub fn cancel_renewal(&self, renewal_id: &str) -> bool {
        if let Some(token) = lock(&self.inner.cancels).get(renewal_id) {
            info!("[renewal] cancellation requested for {renewal_id}");
            token.cancel();
            true
        } else {
            false
        }
    }

    /// Connections with a renewal currently in flight.
    pub fn active_connections(&self) -> Vec<i64> {
        lock(&self.inner.active).iter().copied().collect()
    }

    fn persist_status(&self, status: &RenewalStatus) {
        if let Err(err) = self.inner.config.save_renewal_status(status) {
            warn!("[renewal] failed to persist status {}: {err:#}", status.id);
        }
    }
}

/// Releases the single-flight slot and the cancel token exactly once, even
/// when the renewal thread panics.
struct ActiveGuard {
    inner: Arc<OrchestratorInner>,
    connection_id: i64,
    renewal_id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        lock(&self.inner.active).remove(&self.connection_id);
        lock(&self.inner.cancels).remove(&self.renewal_id);
    }
}

/// Applies status mutations for one renewal: updates the in-memory record,
/// appends the log line, and persists best-effort.
pub(crate) struct StatusTracker {
    inner: Arc<OrchestratorInner>,
    renewal_id: String,
}

impl StatusTracker {
    fn update<F>(&self, mutate: F)
    where
        F: FnOnce(&mut RenewalStatus),
    {
        let snapshot = {
            let mut statuses = lock(&self.inner.statuses);
            let Some(status) = statuses.get_mut(&self.renewal_id) else {
                return;
            };
            mutate(status);
            status.clone()
        };
        if let Err(err) = self.inner.config.save_renewal_status(&snapshot) {
            warn!(
                "[renewal] failed to persist status {}: {err:#}",
                self.renewal_id
            );
        }
    }

    pub fn transition(&self, state: RenewalState, message: &str) {
        self.update(|status| {
            status.state = state;
            status.progress = state.progress();
            status.message = message.to_string();
            status.append_log(message);
        });
    }

    pub fn log(&self, message: &str) {
        info!("[renewal] {}: {message}", self.renewal_id);
        self.update(|status| status.append_log(message));
    }

    pub fn set_manual_dns_entry(&self, entry: ManualDnsEntry) {
        self.update(|status| status.manual_dns_entry = Some(entry));
    }

    pub fn complete(&self, message: &str) {
        info!("[renewal] {} completed", self.renewal_id);
        self.update(|status| {
            status.state = RenewalState::Completed;
            status.progress = RenewalState::Completed.progress();
            status.message = message.to_string();
            status.end_time = Some(Utc::now());
            status.append_log(message);
        });
    }

    pub fn fail(&self, err: &RenewalError) {
        error!("[renewal] {} failed: {err}", self.renewal_id);
        let message = err.to_string();
        self.update(|status| {
            status.state = RenewalState::Failed;
            status.progress = RenewalState::Failed.progress();
            status.message = message.clone();
            status.error = Some(message.clone());
            status.end_time = Some(Utc::now());
            status.append_log(&format!("ERROR: {message}"));
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
