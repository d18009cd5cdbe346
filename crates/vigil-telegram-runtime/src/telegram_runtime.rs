//! Supervised Telegram long-poll runtime.
//!
//! One supervisor loop per account: it launches the poll runner, classifies
//! the failure that ended it, restarts with jittered backoff, resets failure
//! history after a stable run, and coordinates rate-limited operator alerts.
//! All persisted state (update offset, health snapshot) lives under the
//! account's state directory and is owned by this loop alone.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use vigil_core::{current_unix_timestamp_ms, write_text_atomic};

mod failure_classifier;
mod offset_store;
mod outage_notifier;
mod restart_backoff;
mod telegram_api_client;

pub use failure_classifier::{classify_poll_failure, FailureClass};
pub use offset_store::{UpdateOffsetStore, OFFSET_STATE_FILE_NAME};
pub use outage_notifier::{
    OutageNotifier, OutageNotifierConfig, DEFAULT_ALERT_COOLDOWN_MS,
    DEFAULT_ALERT_FAILURE_THRESHOLD, DEFAULT_STABILITY_WINDOW_MS,
};
pub use restart_backoff::{
    RestartBackoffPolicy, DEFAULT_RESTART_GROWTH_FACTOR, DEFAULT_RESTART_INITIAL_DELAY_MS,
    DEFAULT_RESTART_JITTER_RATIO, DEFAULT_RESTART_MAX_DELAY_MS,
};
pub use telegram_api_client::{
    TelegramApiClient, TelegramApiClientConfig, TelegramApiError, TelegramApiErrorKind,
    TelegramUpdate, DEFAULT_TRANSPORT_RETRY_BASE_DELAY_MS, DEFAULT_TRANSPORT_RETRY_BUDGET_MS,
};

#[cfg(test)]
mod tests;

pub const SUPERVISOR_HEALTH_FILE_NAME: &str = "supervisor-health.json";
const SUPERVISOR_HEALTH_SCHEMA_VERSION: u32 = 1;

/// External collaborator that processes one received update.
#[async_trait]
pub trait UpdateHandler: Send + Sync {
    /// Must tolerate redelivery: after a crash or session conflict the first
    /// batch after resumption can include updates a previous instance had
    /// already begun handling.
    async fn handle_update(&self, account_id: &str, update: &TelegramUpdate) -> Result<()>;
}

/// Out-of-band delivery channel for operator notifications.
#[async_trait]
pub trait AlertTransport: Send + Sync {
    async fn send_alert(&self, chat_id: i64, text: &str) -> Result<()>;
}

#[async_trait]
impl AlertTransport for TelegramApiClient {
    async fn send_alert(&self, chat_id: i64, text: &str) -> Result<()> {
        self.send_message(chat_id, text)
            .await
            .map_err(anyhow::Error::new)
    }
}

#[derive(Debug, Clone)]
/// Runtime configuration for one account's supervised polling session.
pub struct TelegramPollRuntimeConfig {
    pub account_id: String,
    pub bot_token: String,
    pub alert_chat_id: Option<i64>,
    pub api_base: String,
    pub state_dir: PathBuf,
    pub long_poll_seconds: u32,
    pub request_timeout_ms: u64,
    pub transport_retry_base_delay_ms: u64,
    pub transport_retry_budget_ms: u64,
    pub dispatch_concurrency: usize,
    pub allowed_updates: Vec<String>,
    pub restart_backoff: RestartBackoffPolicy,
    pub alert_failure_threshold: u32,
    pub alert_cooldown_ms: u64,
    pub stability_window_ms: u64,
    pub poll_once: bool,
}

impl TelegramPollRuntimeConfig {
    fn api_client_config(&self) -> TelegramApiClientConfig {
        TelegramApiClientConfig {
            api_base: self.api_base.clone(),
            bot_token: self.bot_token.clone(),
            request_timeout_ms: self.request_timeout_ms,
            long_poll_seconds: self.long_poll_seconds,
            allowed_updates: self.allowed_updates.clone(),
            transport_retry_base_delay_ms: self.transport_retry_base_delay_ms,
            transport_retry_budget_ms: self.transport_retry_budget_ms,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
/// Counters for one fetch/dispatch cycle.
pub struct PollCycleReport {
    pub fetched_updates: usize,
    pub dispatched_updates: usize,
    pub handler_failures: usize,
    pub offset_write_failures: usize,
}

/// Fetch-decode-dispatch mechanics for one account.
///
/// The runner never decides retry policy: every fetch error surfaces to the
/// supervisor, which is the single retry-or-stop decision point. The only
/// failures handled locally are offset writes, because losing a few seconds
/// of offset progress is strictly less harmful than stopping the bot.
pub struct TelegramPollRunner {
    config: TelegramPollRuntimeConfig,
    client: TelegramApiClient,
    offsets: UpdateOffsetStore,
    handler: Arc<dyn UpdateHandler>,
}

impl TelegramPollRunner {
    pub fn new(config: TelegramPollRuntimeConfig, handler: Arc<dyn UpdateHandler>) -> Result<Self> {
        let client = TelegramApiClient::new(config.api_client_config())?;
        let offset_path =
            account_state_dir(&config.state_dir, &config.account_id).join(OFFSET_STATE_FILE_NAME);
        let offsets = UpdateOffsetStore::load(offset_path)?;
        Ok(Self {
            config,
            client,
            offsets,
            handler,
        })
    }

    pub fn client(&self) -> &TelegramApiClient {
        &self.client
    }

    pub fn last_update_id(&self) -> Option<u64> {
        self.offsets.last_update_id()
    }

    /// One long-poll fetch starting just past the stored offset.
    pub async fn fetch_batch(&self) -> Result<Vec<TelegramUpdate>> {
        let wire_offset = self
            .offsets
            .last_update_id()
            .map(|update_id| update_id.saturating_add(1));
        self.client
            .fetch_updates(wire_offset)
            .await
            .map_err(anyhow::Error::new)
    }

    /// Dispatches a fetched batch in increasing update-id order with bounded
    /// concurrency, advancing the offset past each completed update.
    ///
    /// `buffered` yields completions in submission order, so the offset never
    /// moves past an id while a lower id is still in flight. Handler errors
    /// are the handler's own concern: the update still counts as delivered
    /// (at-least-once with idempotent consumers), otherwise one poison update
    /// would wedge the account forever.
    pub async fn dispatch_batch(&mut self, updates: Vec<TelegramUpdate>) -> PollCycleReport {
        let mut report = PollCycleReport {
            fetched_updates: updates.len(),
            ..PollCycleReport::default()
        };
        if updates.is_empty() {
            return report;
        }
        let handler = Arc::clone(&self.handler);
        let account_id = self.config.account_id.clone();
        let mut completions = futures_util::stream::iter(updates.into_iter().map(|update| {
            let handler = Arc::clone(&handler);
            let account_id = account_id.clone();
            async move {
                let outcome = handler.handle_update(account_id.as_str(), &update).await;
                (update.update_id, outcome)
            }
        }))
        .buffered(self.config.dispatch_concurrency.max(1));

        while let Some((update_id, outcome)) = completions.next().await {
            report.dispatched_updates = report.dispatched_updates.saturating_add(1);
            if let Err(error) = outcome {
                report.handler_failures = report.handler_failures.saturating_add(1);
                eprintln!(
                    "telegram update handler failed: account={} update_id={update_id} error={error:#}",
                    self.config.account_id
                );
            }
            if let Err(error) = self.offsets.record_processed(update_id) {
                report.offset_write_failures = report.offset_write_failures.saturating_add(1);
                eprintln!(
                    "telegram offset write failed: account={} update_id={update_id} error={error:#}",
                    self.config.account_id
                );
            }
        }
        report
    }
}

/// Top-level control loop for one account.
///
/// States: Starting -> Running -> Failed -> Backoff -> Starting, with the
/// cancellation signal leading out of every state. Returns `Ok(())` on
/// cancellation or one-shot completion and `Err` only for fatal failures.
pub async fn run_telegram_poll_supervisor(
    config: TelegramPollRuntimeConfig,
    handler: Arc<dyn UpdateHandler>,
    mut cancel_rx: watch::Receiver<bool>,
) -> Result<()> {
    let account_dir = account_state_dir(&config.state_dir, &config.account_id);
    let health_path = account_dir.join(SUPERVISOR_HEALTH_FILE_NAME);
    let mut health = match load_supervisor_health(&health_path) {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => SupervisorHealthSnapshot::default(),
        Err(error) => {
            // The snapshot is observability state only; never refuse to start
            // over it.
            eprintln!(
                "telegram supervisor health unreadable, starting fresh: account={} error={error:#}",
                config.account_id
            );
            SupervisorHealthSnapshot::default()
        }
    };
    let mut runner = TelegramPollRunner::new(config.clone(), handler)?;
    let mut notifier = OutageNotifier::new(OutageNotifierConfig {
        account_id: config.account_id.clone(),
        alert_chat_id: config.alert_chat_id,
        failure_threshold: config.alert_failure_threshold,
        cooldown: Duration::from_millis(config.alert_cooldown_ms),
    });
    let stability_window = Duration::from_millis(config.stability_window_ms);
    let mut attempt: u32 = 0;
    let mut run_started = Instant::now();
    let mut stable_run_handled = false;

    println!(
        "telegram supervisor started: account={} state_dir={}",
        config.account_id,
        account_dir.display()
    );

    loop {
        if *cancel_rx.borrow() {
            println!("telegram supervisor aborted: account={}", config.account_id);
            return Ok(());
        }

        let fetched = tokio::select! {
            // The gateway only ever flips the flag to true; a closed channel
            // also means shutdown. Dropping the fetch future cancels the
            // in-flight long poll and any pending transport retry sleep.
            _ = cancel_rx.changed() => {
                println!("telegram supervisor aborted: account={}", config.account_id);
                return Ok(());
            }
            fetched = runner.fetch_batch() => fetched,
        };

        match fetched {
            Ok(updates) => {
                let report = runner.dispatch_batch(updates).await;
                println!(
                    "telegram poll cycle: account={} fetched={} dispatched={} handler_failures={} offset_write_failures={} last_update_id={}",
                    config.account_id,
                    report.fetched_updates,
                    report.dispatched_updates,
                    report.handler_failures,
                    report.offset_write_failures,
                    render_optional_u64(runner.last_update_id()),
                );
                if !stable_run_handled && run_started.elapsed() >= stability_window {
                    // The connection was healthy long enough: prior failure
                    // history is stale.
                    stable_run_handled = true;
                    attempt = 0;
                    notifier.record_stable_run(runner.client()).await;
                    health.failure_streak = 0;
                    health.last_stable_unix_ms = current_unix_timestamp_ms();
                    if let Err(error) = persist_supervisor_health(&health_path, &health) {
                        eprintln!(
                            "telegram supervisor health write failed: account={} error={error:#}",
                            config.account_id
                        );
                    }
                }
                if config.poll_once {
                    println!(
                        "telegram poll one-shot complete: account={}",
                        config.account_id
                    );
                    return Ok(());
                }
            }
            Err(error) => {
                let ran_for = run_started.elapsed();
                if ran_for >= stability_window && !stable_run_handled {
                    notifier.record_stable_run(runner.client()).await;
                    health.last_stable_unix_ms = current_unix_timestamp_ms();
                }
                attempt = restart_attempt_after(attempt, ran_for, stability_window);
                let class = classify_poll_failure(&error);
                let error_text = format!("{error:#}");
                health.failure_streak = attempt;
                health.restarts_total = health.restarts_total.saturating_add(1);
                health.last_failure_code = class.as_str().to_string();
                health.last_failure_message = error_text.clone();
                health.last_failure_unix_ms = current_unix_timestamp_ms();
                if let Err(persist_error) = persist_supervisor_health(&health_path, &health) {
                    eprintln!(
                        "telegram supervisor health write failed: account={} error={persist_error:#}",
                        config.account_id
                    );
                }

                if !class.is_retryable() {
                    notifier
                        .record_fatal(class.as_str(), error_text.as_str(), runner.client())
                        .await;
                    eprintln!(
                        "telegram supervisor stopped: account={} reason={} error={error_text}",
                        config.account_id,
                        class.as_str()
                    );
                    return Err(error);
                }
                if config.poll_once {
                    return Err(error);
                }

                let delay = config.restart_backoff.delay_for_attempt(attempt);
                eprintln!(
                    "telegram supervisor restart: account={} attempt={attempt} reason={} delay_ms={}",
                    config.account_id,
                    class.as_str(),
                    delay.as_millis()
                );
                notifier
                    .record_failure(attempt, class.as_str(), error_text.as_str(), runner.client())
                    .await;

                tokio::select! {
                    _ = cancel_rx.changed() => {
                        println!("telegram supervisor aborted: account={}", config.account_id);
                        return Ok(());
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                run_started = Instant::now();
                stable_run_handled = false;
            }
        }
    }
}

/// Attempt number to use for the next restart. A run that lasted past the
/// stability window makes the previous streak stale, so the failure ending
/// it counts as a fresh first attempt.
fn restart_attempt_after(previous: u32, ran_for: Duration, stability_window: Duration) -> u32 {
    if ran_for >= stability_window {
        1
    } else {
        previous.saturating_add(1)
    }
}

fn supervisor_health_schema_version() -> u32 {
    SUPERVISOR_HEALTH_SCHEMA_VERSION
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Best-effort observability snapshot persisted next to the offset file.
/// The supervisor writes it on failures and stability resets but never reads
/// it back for decisions.
pub struct SupervisorHealthSnapshot {
    #[serde(default = "supervisor_health_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub failure_streak: u32,
    #[serde(default)]
    pub restarts_total: u64,
    #[serde(default)]
    pub last_failure_code: String,
    #[serde(default)]
    pub last_failure_message: String,
    #[serde(default)]
    pub last_failure_unix_ms: u64,
    #[serde(default)]
    pub last_stable_unix_ms: u64,
}

impl Default for SupervisorHealthSnapshot {
    fn default() -> Self {
        Self {
            schema_version: SUPERVISOR_HEALTH_SCHEMA_VERSION,
            failure_streak: 0,
            restarts_total: 0,
            last_failure_code: String::new(),
            last_failure_message: String::new(),
            last_failure_unix_ms: 0,
            last_stable_unix_ms: 0,
        }
    }
}

pub fn load_supervisor_health(path: &Path) -> Result<Option<SupervisorHealthSnapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read supervisor health {}", path.display()))?;
    let parsed = serde_json::from_str::<SupervisorHealthSnapshot>(&raw)
        .with_context(|| format!("failed to parse supervisor health {}", path.display()))?;
    if parsed.schema_version != SUPERVISOR_HEALTH_SCHEMA_VERSION {
        bail!(
            "unsupported supervisor health schema {} in {}",
            parsed.schema_version,
            path.display()
        );
    }
    Ok(Some(parsed))
}

fn persist_supervisor_health(path: &Path, snapshot: &SupervisorHealthSnapshot) -> Result<()> {
    let payload = serde_json::to_string_pretty(snapshot)
        .context("failed to serialize supervisor health snapshot")?;
    write_text_atomic(path, payload.as_str())
        .with_context(|| format!("failed to write supervisor health {}", path.display()))
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
/// Offline per-account summary for `--status` reporting.
pub struct TelegramSupervisorStatusReport {
    pub account_id: String,
    pub state_path: String,
    pub last_update_id: Option<u64>,
    pub failure_streak: u32,
    pub restarts_total: u64,
    pub last_failure_code: String,
    pub last_failure_unix_ms: u64,
    pub last_stable_unix_ms: u64,
}

pub fn load_telegram_supervisor_status_report(
    state_dir: &Path,
    account_id: &str,
) -> Result<TelegramSupervisorStatusReport> {
    let account_dir = account_state_dir(state_dir, account_id);
    let offsets = UpdateOffsetStore::load(account_dir.join(OFFSET_STATE_FILE_NAME))?;
    let health = load_supervisor_health(&account_dir.join(SUPERVISOR_HEALTH_FILE_NAME))?
        .unwrap_or_default();
    Ok(TelegramSupervisorStatusReport {
        account_id: account_id.to_string(),
        state_path: account_dir.display().to_string(),
        last_update_id: offsets.last_update_id(),
        failure_streak: health.failure_streak,
        restarts_total: health.restarts_total,
        last_failure_code: health.last_failure_code,
        last_failure_unix_ms: health.last_failure_unix_ms,
        last_stable_unix_ms: health.last_stable_unix_ms,
    })
}

pub fn render_telegram_supervisor_status_report(report: &TelegramSupervisorStatusReport) -> String {
    format!(
        "telegram supervisor status: account={} last_update_id={} failure_streak={} restarts_total={} last_failure_code={} last_failure_unix_ms={} last_stable_unix_ms={} state_path={}",
        report.account_id,
        render_optional_u64(report.last_update_id),
        report.failure_streak,
        report.restarts_total,
        if report.last_failure_code.is_empty() {
            "none"
        } else {
            report.last_failure_code.as_str()
        },
        report.last_failure_unix_ms,
        report.last_stable_unix_ms,
        report.state_path,
    )
}

pub fn account_state_dir(state_dir: &Path, account_id: &str) -> PathBuf {
    state_dir.join("accounts").join(sanitize_for_path(account_id))
}

pub(crate) fn sanitize_for_path(raw: &str) -> String {
    let sanitized = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                ch
            } else {
                '_'
            }
        })
        .collect::<String>();
    let trimmed = sanitized.trim_matches('_');
    if trimmed.is_empty() {
        "account".to_string()
    } else {
        trimmed.to_string()
    }
}

fn render_optional_u64(value: Option<u64>) -> String {
    value
        .map(|value| value.to_string())
        .unwrap_or_else(|| "none".to_string())
}
