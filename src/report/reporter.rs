//! Failure reporter.
//!
//! Connections that needed a split retry are reported, aggregated by SNI, as
//! DNS queries through the active [`Transport`]. Each report becomes a name
//! under the configured suffix:
//!
//! ```text
//! <success|failed>.<closed|timeout>.<bin>.<country>.<YYYYMMDD>.<sni>.<suffix>.
//! ```
//!
//! At most one query goes out per burst window, so reports cannot be lined up
//! with individual connections. Reporting is best-effort: nothing here ever
//! fails the connection being reported.

use crate::doh::transport::Transport;
use crate::report::batch::{Outcome, ReportBatch};
use crate::report::store::{load_or_create_salt, PersistentStore};
use crate::tunnel::tcp::TcpSocketSummary;
use hickory_resolver::proto::op::{Message, MessageType, OpCode, Query};
use hickory_resolver::proto::rr::{Name, RecordType};
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::OffsetDateTime;

/// Reporter tuning.
#[derive(Debug, Clone)]
pub struct ReporterConfig {
    /// Minimum spacing between outbound reports.
    pub burst: Duration,
    /// Number of pseudonymous buckets.
    pub bins: u32,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self { burst: Duration::from_secs(10), bins: 8 }
    }
}

impl ReporterConfig {
    pub fn with_burst(mut self, burst: Duration) -> Self {
        self.burst = burst;
        self
    }

    pub fn with_bins(mut self, bins: u32) -> Self {
        self.bins = bins.max(1);
        self
    }
}

#[derive(Clone)]
struct Settings {
    salt: Vec<u8>,
    suffix: String,
    country: String,
}

#[derive(Default)]
struct State {
    settings: Option<Settings>,
    dns: Option<Arc<dyn Transport>>,
    batch: ReportBatch,
    flushing: bool,
}

struct Inner {
    config: ReporterConfig,
    state: Mutex<State>,
}

/// Reports split-retry outcomes over DNS.
#[derive(Clone)]
pub struct FailureReporter {
    inner: Arc<Inner>,
}

impl Default for FailureReporter {
    fn default() -> Self {
        Self::new(ReporterConfig::default())
    }
}

impl FailureReporter {
    pub fn new(config: ReporterConfig) -> Self {
        Self { inner: Arc::new(Inner { config, state: Mutex::new(State::default()) }) }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enables reporting. `store` holds the per-install salt, `suffix` is the
    /// domain that receives reports and `country` a two-letter country code.
    pub fn configure(
        &self,
        store: &dyn PersistentStore,
        suffix: &str,
        country: &str,
    ) -> io::Result<()> {
        let salt = load_or_create_salt(store)?;
        let settings = Settings {
            salt,
            suffix: suffix.trim_matches('.').to_ascii_lowercase(),
            country: country.to_ascii_lowercase(),
        };
        tracing::debug!(suffix = %settings.suffix, country = %settings.country, "Reporter configured");
        self.state().settings = Some(settings);
        Ok(())
    }

    /// Sets or clears the transport used to deliver reports.
    pub fn set_dns(&self, dns: Option<Arc<dyn Transport>>) {
        self.state().dns = dns;
    }

    pub fn is_configured(&self) -> bool {
        self.state().settings.is_some()
    }

    /// Number of SNIs waiting for a flush.
    pub fn pending(&self) -> usize {
        self.state().batch.len()
    }

    /// Records the outcome of a closed connection.
    ///
    /// Connections that were never split, and reports made while the
    /// reporter is unconfigured or has no transport, are dropped.
    pub fn report(&self, summary: &TcpSocketSummary) {
        let Some(retry) = summary.retry.as_ref() else {
            return;
        };
        if retry.split == 0 {
            return;
        }

        let mut state = self.state();
        if state.settings.is_none() || state.dns.is_none() {
            tracing::debug!("Reporter not ready, dropping report");
            return;
        }
        if retry.sni.is_empty() {
            tracing::debug!("No SNI, dropping report");
            return;
        }

        let outcome = Outcome::new(summary.download_bytes > 0, retry.timeout);
        state.batch.record(&retry.sni, outcome);

        if state.flushing {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                state.flushing = true;
                handle.spawn(self.clone().flush());
            }
            Err(_) => {
                tracing::warn!("No runtime for report delivery");
                state.batch = ReportBatch::new();
            }
        }
    }

    async fn flush(self) {
        loop {
            tokio::time::sleep(self.inner.config.burst).await;

            let (dns, name) = {
                let mut state = self.state();
                let (Some(settings), Some(dns)) = (state.settings.clone(), state.dns.clone())
                else {
                    tracing::debug!("Reporter disabled, dropping pending reports");
                    state.batch = ReportBatch::new();
                    state.flushing = false;
                    return;
                };
                let Some((sni, outcome, _)) = state.batch.take_next() else {
                    state.flushing = false;
                    return;
                };
                let date = OffsetDateTime::now_utc();
                let bin = bin_for(&settings.salt, &date_label(date), self.inner.config.bins);
                (dns, report_name(outcome, bin, &settings, &sni, date))
            };

            send_report(&*dns, &name).await;
        }
    }
}

impl fmt::Debug for FailureReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("FailureReporter")
            .field("config", &self.inner.config)
            .field("configured", &state.settings.is_some())
            .field("pending", &state.batch.len())
            .finish()
    }
}

async fn send_report(dns: &dyn Transport, name: &str) {
    let query = match report_query(name) {
        Ok(query) => query,
        Err(e) => {
            tracing::warn!(error = %e, report = %name, "Failed to build report query");
            return;
        }
    };
    match dns.query(&query).await {
        Ok(_) => tracing::debug!(report = %name, "Report delivered"),
        Err(e) => tracing::warn!(error = %e, report = %name, "Report delivery failed"),
    }
}

fn date_label(date: OffsetDateTime) -> String {
    format!("{:04}{:02}{:02}", date.year(), u8::from(date.month()), date.day())
}

/// Pseudonymous bucket for this install on `date`.
fn bin_for(salt: &[u8], date: &str, bins: u32) -> u32 {
    let mut input = Vec::with_capacity(salt.len() + date.len());
    input.extend_from_slice(salt);
    input.extend_from_slice(date.as_bytes());
    let digest = boring::sha::sha256(&input);
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) % bins.max(1)
}

fn report_name(
    outcome: Outcome,
    bin: u32,
    settings: &Settings,
    sni: &str,
    date: OffsetDateTime,
) -> String {
    format!(
        "{}.{}.{}.{}.{}.{}.{}.",
        outcome.result_label(),
        outcome.cause_label(),
        bin,
        settings.country,
        date_label(date),
        sni,
        settings.suffix
    )
}

fn report_query(name: &str) -> Result<Vec<u8>, hickory_resolver::proto::ProtoError> {
    let mut msg = Message::new();
    msg.set_id(rand::random());
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(Name::from_ascii(name)?, RecordType::A));
    msg.to_vec()
}
