use std::path::PathBuf;
use std::time::Duration;

/// Which authority endpoint a renewal talks to. The environment is part of
/// the on-disk key for accounts and artifacts, so staging runs never clobber
/// production material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Staging,
    Production,
}

impl Environment {
    pub fn from_env() -> Self {
        Self::from_flag(std::env::var("LETSENCRYPT_STAGING").ok().as_deref())
    }

    fn from_flag(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some("false") | Some("0") | Some("no") => Environment::Production,
            _ => Environment::Staging,
        }
    }

    pub fn dir_name(&self) -> &'static str {
        match self {
            Environment::Staging => "staging",
            Environment::Production => "prod",
        }
    }

    pub fn is_staging(&self) -> bool {
        matches!(self, Environment::Staging)
    }
}

/// Process-level knobs the orchestrator reads once at construction.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub environment: Environment,
    /// Forces DNS record cleanup even in staging.
    pub force_dns_cleanup: bool,
    pub accounts_dir: PathBuf,
    /// How long automated providers get to propagate a challenge record.
    pub propagation_deadline: Duration,
    /// How long the operator gets to publish a manual DNS entry.
    pub manual_dns_deadline: Duration,
}

impl RuntimeSettings {
    pub fn from_env() -> Self {
        let force_dns_cleanup = std::env::var("LETSENCRYPT_CLEANUP_DNS")
            .map(|raw| raw.trim() == "true")
            .unwrap_or(false);
        let accounts_dir = std::env::var("ACCOUNTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./accounts"));
        Self {
            environment: Environment::from_env(),
            force_dns_cleanup,
            accounts_dir,
            propagation_deadline: Duration::from_secs(120),
            manual_dns_deadline: Duration::from_secs(300),
        }
    }

    /// DNS challenge records are kept around in staging for debugging unless
    /// cleanup is forced.
    pub fn should_cleanup_dns(&self) -> bool {
        !self.environment.is_staging() || self.force_dns_cleanup
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_is_the_default() {
        assert_eq!(Environment::from_flag(None), Environment::Staging);
        assert_eq!(Environment::from_flag(Some("true")), Environment::Staging);
        assert_eq!(Environment::from_flag(Some("nonsense")), Environment::Staging);
    }

    #[test]
    fn production_requires_explicit_false() {
        assert_eq!(Environment::from_flag(Some("false")), Environment::Production);
        assert_eq!(Environment::from_flag(Some("0")), Environment::Production);
    }

    #[test]
    fn cleanup_policy_follows_environment() {
        let staging = RuntimeSettings {
            environment: Environment::Staging,
            force_dns_cleanup: false,
            accounts_dir: PathBuf::from("./accounts"),
            propagation_deadline: Duration::from_secs(120),
            manual_dns_deadline: Duration::from_secs(300),
        };
        assert!(!staging.should_cleanup_dns());

        let forced = RuntimeSettings {
            force_dns_cleanup: true,
            ..staging.clone()
        };
        assert!(forced.should_cleanup_dns());

        let prod = RuntimeSettings {
            environment: Environment::Production,
            force_dns_cleanup: false,
            ..staging.clone()
        };
        assert!(prod.should_cleanup_dns());
    }
}
