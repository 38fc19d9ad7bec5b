use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::Deserialize;

use super::RecordType;
use crate::cancel::CancellationToken;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// One recursive resolver the verifier can ask for a record.
pub trait TxtResolver: Send + Sync {
    fn name(&self) -> &str;
    /// Observed record values, unquoted. An empty vec means "not visible yet".
    fn resolve(&self, record_name: &str, record_type: RecordType) -> Result<Vec<String>>;
}

/// DNS-over-HTTPS resolver speaking the dns-json format (Google, Cloudflare).
pub struct DohResolver {
    name: String,
    endpoint: String,
}

impl DohResolver {
    pub fn new(name: &str, endpoint: &str) -> Self {
        Self {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
        }
    }

    pub fn google() -> Self {
        Self::new("google", "https://dns.google/resolve")
    }

    pub fn cloudflare() -> Self {
        Self::new("cloudflare", "https://cloudflare-dns.com/dns-query")
    }
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    #[serde(rename = "data")]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Status")]
    status: u32,
    #[serde(rename = "Answer")]
    answer: Option<Vec<DohAnswer>>,
}

impl TxtResolver for DohResolver {
    fn name(&self) -> &str {
        &self.name
    }

    fn resolve(&self, record_name: &str, record_type: RecordType) -> Result<Vec<String>> {
        let url = format!(
            "{}?name={}&type={}",
            self.endpoint,
            record_name,
            record_type.as_str()
        );
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(10))
            .build();
        let response = agent
            .get(&url)
            .set("Accept", "application/dns-json")
            .call()
            .with_context(|| format!("dns query failed for {record_name} via {}", self.name))?;
        let body = response.into_string()?;
        let parsed: DohResponse = serde_json::from_str(&body)
            .with_context(|| format!("failed to parse dns response for {record_name}"))?;

        // NXDOMAIN just means not visible yet; other non-zero codes are
        // resolver trouble and equally retryable.
        if parsed.status != 0 {
            return Ok(Vec::new());
        }
        let values = parsed
            .answer
            .unwrap_or_default()
            .into_iter()
            .filter_map(|answer| answer.data)
            .map(|data| trim_txt_quotes(&data))
            .collect();
        Ok(values)
    }
}

fn trim_txt_quotes(value: &str) -> String {
    value.trim().trim_matches('"').trim().to_string()
}

/// Polls a panel of resolvers until all of them return the expected value or
/// the deadline elapses. Transient resolver errors are logged and retried;
/// this never fails, it only reports.
pub struct PropagationVerifier {
    resolvers: Vec<Box<dyn TxtResolver>>,
    interval: Duration,
}

impl PropagationVerifier {
    pub fn new(resolvers: Vec<Box<dyn TxtResolver>>, interval: Duration) -> Self {
        Self {
            resolvers,
            interval,
        }
    }

    /// Panel of public resolvers at the default 10 s interval.
    pub fn public_panel() -> Self {
        Self::new(
            vec![
                Box::new(DohResolver::google()),
                Box::new(DohResolver::cloudflare()),
            ],
            DEFAULT_POLL_INTERVAL,
        )
    }

    /// True once every resolver in the panel has returned `expected_value`
    /// within `deadline`. Cancellation ends the wait early with `false`.
    pub fn wait_until_visible(
        &self,
        record_name: &str,
        expected_value: &str,
        record_type: RecordType,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> bool {
        let started = Instant::now();
        let expected = trim_txt_quotes(expected_value);
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return false;
            }
            attempt += 1;

            let mut all_seen = true;
            for resolver in &self.resolvers {
                match resolver.resolve(record_name, record_type) {
                    Ok(values) => {
                        let seen = values.iter().any(|value| trim_txt_quotes(value) == expected);
                        if !seen {
                            debug!(
                                "[dns-verify] {} does not see {} yet (attempt {attempt}, observed {:?})",
                                resolver.name(),
                                record_name,
                                values
                            );
                            all_seen = false;
                        }
                    }
                    Err(err) => {
                        warn!(
                            "[dns-verify] resolver {} failed for {record_name}: {err:#}",
                            resolver.name()
                        );
                        all_seen = false;
                    }
                }
            }

            if all_seen {
                debug!(
                    "[dns-verify] {record_name} visible on all {} resolver(s) after {}ms",
                    self.resolvers.len(),
                    started.elapsed().as_millis()
                );
                return true;
            }

            if started.elapsed() + self.interval > deadline {
                warn!(
                    "[dns-verify] {record_name} not globally visible after {}ms (attempt {attempt})",
                    started.elapsed().as_millis()
                );
                return false;
            }
            if cancel.sleep(self.interval).is_err() {
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedResolver {
        name: String,
        responses: Mutex<Vec<Result<Vec<String>>>>,
        calls: AtomicUsize,
    }

    impl ScriptedResolver {
        fn new(name: &str, responses: Vec<Result<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                responses: Mutex::new(responses),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl TxtResolver for ScriptedResolver {
        fn name(&self) -> &str {
            &self.name
        }

        fn resolve(&self, _record_name: &str, _record_type: RecordType) -> Result<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                responses.remove(0)
            } else {
                match responses.first() {
                    Some(Ok(values)) => Ok(values.clone()),
                    Some(Err(_)) => Err(anyhow::anyhow!("scripted failure")),
                    None => Ok(Vec::new()),
                }
            }
        }
    }

    fn verifier(resolvers: Vec<Box<dyn TxtResolver>>) -> PropagationVerifier {
        PropagationVerifier::new(resolvers, Duration::from_millis(10))
    }

    #[test]
    fn visible_when_all_resolvers_agree() {
        let panel = verifier(vec![
            Box::new(ScriptedResolver::new("a", vec![Ok(vec!["value".into()])])),
            Box::new(ScriptedResolver::new("b", vec![Ok(vec!["value".into()])])),
        ]);
        assert!(panel.wait_until_visible(
            "_acme-challenge.a.example.com",
            "value",
            RecordType::Txt,
            Duration::from_secs(1),
            &CancellationToken::new(),
        ));
    }

    #[test]
    fn not_visible_when_one_resolver_lags() {
        let panel = verifier(vec![
            Box::new(ScriptedResolver::new("a", vec![Ok(vec!["value".into()])])),
            Box::new(ScriptedResolver::new("b", vec![Ok(vec![])])),
        ]);
        assert!(!panel.wait_until_visible(
            "_acme-challenge.a.example.com",
            "value",
            RecordType::Txt,
            Duration::from_millis(50),
            &CancellationToken::new(),
        ));
    }

    #[test]
    fn lagging_resolver_catches_up_within_deadline() {
        let panel = verifier(vec![Box::new(ScriptedResolver::new(
            "a",
            vec![Ok(vec![]), Ok(vec![]), Ok(vec!["value".into()])],
        ))]);
        assert!(panel.wait_until_visible(
            "_acme-challenge.a.example.com",
            "value",
            RecordType::Txt,
            Duration::from_secs(2),
            &CancellationToken::new(),
        ));
    }

    #[test]
    fn resolver_errors_are_retried_not_fatal() {
        let panel = verifier(vec![Box::new(ScriptedResolver::new(
            "a",
            vec![Err(anyhow::anyhow!("boom")), Ok(vec!["value".into()])],
        ))]);
        assert!(panel.wait_until_visible(
            "_acme-challenge.a.example.com",
            "value",
            RecordType::Txt,
            Duration::from_secs(2),
            &CancellationToken::new(),
        ));
    }

    #[test]
    fn quoted_values_compare_equal() {
        let panel = verifier(vec![Box::new(ScriptedResolver::new(
            "a",
            vec![Ok(vec!["\"value\"".into()])],
        ))]);
        assert!(panel.wait_until_visible(
            "_acme-challenge.a.example.com",
            "value",
            RecordType::Txt,
            Duration::from_secs(1),
            &CancellationToken::new(),
        ));
    }

    #[test]
    fn cancellation_stops_the_wait() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let panel = verifier(vec![Box::new(ScriptedResolver::new(
            "a",
            vec![Ok(vec![])],
        ))]);
        assert!(!panel.wait_until_visible(
            "_acme-challenge.a.example.com",
            "value",
            RecordType::Txt,
            Duration::from_secs(30),
            &cancel,
        ));
    }
}
