use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle states of one renewal attempt, in happy-path order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenewalState {
    Pending,
    GeneratingCsr,
    CreatingAccount,
    RequestingCertificate,
    CreatingDnsChallenge,
    WaitingDnsPropagation,
    WaitingManualDns,
    CompletingValidation,
    DownloadingCertificate,
    UploadingCertificate,
    Completed,
    Failed,
}

impl RenewalState {
    /// Fixed state → progress mapping, used for live updates and for
    /// recomputing progress on records reconstructed from the store.
    pub fn progress(&self) -> u8 {
        match self {
            RenewalState::Pending => 0,
            RenewalState::GeneratingCsr => 10,
            RenewalState::CreatingAccount => 15,
            RenewalState::RequestingCertificate => 20,
            RenewalState::CreatingDnsChallenge => 30,
            RenewalState::WaitingDnsPropagation => 50,
            RenewalState::WaitingManualDns => 65,
            RenewalState::CompletingValidation => 70,
            RenewalState::DownloadingCertificate => 80,
            RenewalState::UploadingCertificate => 90,
            RenewalState::Completed => 100,
            RenewalState::Failed => 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RenewalState::Completed | RenewalState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RenewalState::Pending => "pending",
            RenewalState::GeneratingCsr => "generating_csr",
            RenewalState::CreatingAccount => "creating_account",
            RenewalState::RequestingCertificate => "requesting_certificate",
            RenewalState::CreatingDnsChallenge => "creating_dns_challenge",
            RenewalState::WaitingDnsPropagation => "waiting_dns_propagation",
            RenewalState::WaitingManualDns => "waiting_manual_dns",
            RenewalState::CompletingValidation => "completing_validation",
            RenewalState::DownloadingCertificate => "downloading_certificate",
            RenewalState::UploadingCertificate => "uploading_certificate",
            RenewalState::Completed => "completed",
            RenewalState::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let state = match raw {
            "pending" => RenewalState::Pending,
            "generating_csr" => RenewalState::GeneratingCsr,
            "creating_account" => RenewalState::CreatingAccount,
            "requesting_certificate" => RenewalState::RequestingCertificate,
            "creating_dns_challenge" => RenewalState::CreatingDnsChallenge,
            "waiting_dns_propagation" => RenewalState::WaitingDnsPropagation,
            "waiting_manual_dns" => RenewalState::WaitingManualDns,
            "completing_validation" => RenewalState::CompletingValidation,
            "downloading_certificate" => RenewalState::DownloadingCertificate,
            "uploading_certificate" => RenewalState::UploadingCertificate,
            "completed" => RenewalState::Completed,
            "failed" => RenewalState::Failed,
            _ => return None,
        };
        Some(state)
    }
}

/// Instructions surfaced to the operator when the custom DNS provider is in
/// play and the TXT record must be published by hand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualDnsEntry {
    pub record_name: String,
    pub record_value: String,
    pub instructions: String,
}

/// The only status surface a renewal has. Mutated exclusively by the owning
/// renewal task; readers get clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewalStatus {
    pub id: String,
    pub connection_id: i64,
    pub state: RenewalState,
    pub message: String,
    pub progress: u8,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub logs: Vec<String>,
    pub manual_dns_entry: Option<ManualDnsEntry>,
}

impl RenewalStatus {
    pub fn new(id: String, connection_id: i64) -> Self {
        Self {
            id,
            connection_id,
            state: RenewalState::Pending,
            message: "Renewal queued".to_string(),
            progress: 0,
            start_time: Utc::now(),
            end_time: None,
            error: None,
            logs: Vec::new(),
            manual_dns_entry: None,
        }
    }

    pub fn append_log(&mut self, message: &str) {
        self.logs
            .push(format!("{} {}", Utc::now().to_rfc3339(), message));
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HAPPY_PATH: [RenewalState; 10] = [
        RenewalState::Pending,
        RenewalState::GeneratingCsr,
        RenewalState::CreatingAccount,
        RenewalState::RequestingCertificate,
        RenewalState::CreatingDnsChallenge,
        RenewalState::WaitingDnsPropagation,
        RenewalState::CompletingValidation,
        RenewalState::DownloadingCertificate,
        RenewalState::UploadingCertificate,
        RenewalState::Completed,
    ];

    #[test]
    fn progress_is_monotone_over_happy_path() {
        let mut last = 0;
        for state in HAPPY_PATH {
            assert!(state.progress() >= last, "{state:?} regressed");
            last = state.progress();
        }
        assert_eq!(last, 100);
    }

    #[test]
    fn manual_dns_sits_between_propagation_and_validation() {
        assert!(
            RenewalState::WaitingManualDns.progress()
                > RenewalState::WaitingDnsPropagation.progress()
        );
        assert!(
            RenewalState::WaitingManualDns.progress()
                < RenewalState::CompletingValidation.progress()
        );
    }

    #[test]
    fn state_names_round_trip() {
        for state in HAPPY_PATH.into_iter().chain([
            RenewalState::WaitingManualDns,
            RenewalState::Failed,
        ]) {
            assert_eq!(RenewalState::parse(state.as_str()), Some(state));
        }
        assert_eq!(RenewalState::parse("bogus"), None);
    }

    #[test]
    fn only_completed_and_failed_are_terminal() {
        assert!(RenewalState::Completed.is_terminal());
        assert!(RenewalState::Failed.is_terminal());
        assert!(!RenewalState::UploadingCertificate.is_terminal());
    }

    #[test]
    fn log_lines_are_timestamped() {
        let mut status = RenewalStatus::new("r-1".into(), 1);
        status.append_log("CSR generated successfully");
        assert_eq!(status.logs.len(), 1);
        assert!(status.logs[0].ends_with("CSR generated successfully"));
        // RFC 3339 timestamps start with the year.
        assert!(status.logs[0].starts_with("20"));
    }
}
