use std::time::{Duration, Instant};

use super::AlertTransport;

pub const DEFAULT_ALERT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_ALERT_COOLDOWN_MS: u64 = 30 * 60 * 1_000;
pub const DEFAULT_STABILITY_WINDOW_MS: u64 = 5 * 60 * 1_000;
const ALERT_ERROR_TEXT_MAX_CHARS: usize = 100;

#[derive(Debug, Clone)]
/// Alerting settings for one account.
pub struct OutageNotifierConfig {
    pub account_id: String,
    pub alert_chat_id: Option<i64>,
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

#[derive(Debug, Clone)]
struct OutageWindow {
    started: Instant,
    alert_sent: bool,
}

/// Rate-limited out-of-band notifications for one account's outages.
///
/// At most one degradation alert fires per outage window, and a recovery
/// notice fires exactly once per window that alerted — a streak that stays
/// under the threshold produces neither. Delivery failures are swallowed:
/// the alert channel rides the same transport whose outage is being
/// reported, so it is expected to be down too.
pub struct OutageNotifier {
    config: OutageNotifierConfig,
    window: Option<OutageWindow>,
    last_alert_at: Option<Instant>,
}

impl OutageNotifier {
    pub fn new(config: OutageNotifierConfig) -> Self {
        Self {
            config,
            window: None,
            last_alert_at: None,
        }
    }

    /// Records one classified supervisor failure; returns whether an alert
    /// went out for it.
    pub async fn record_failure(
        &mut self,
        attempt: u32,
        failure_label: &str,
        error_text: &str,
        transport: &dyn AlertTransport,
    ) -> bool {
        let window = self.window.get_or_insert_with(|| OutageWindow {
            started: Instant::now(),
            alert_sent: false,
        });
        let cooldown_elapsed = match self.last_alert_at {
            None => true,
            Some(at) => at.elapsed() >= self.config.cooldown,
        };
        if window.alert_sent || attempt < self.config.failure_threshold || !cooldown_elapsed {
            return false;
        }
        window.alert_sent = true;
        self.last_alert_at = Some(Instant::now());
        let text = format!(
            "vigil: account {} polling degraded (attempt {attempt}, {failure_label}): {}",
            self.config.account_id,
            truncate_for_alert(error_text, ALERT_ERROR_TEXT_MAX_CHARS)
        );
        self.deliver("outage", text.as_str(), transport).await;
        true
    }

    /// Fatal failures alert immediately: no threshold, no cooldown.
    pub async fn record_fatal(
        &mut self,
        failure_label: &str,
        error_text: &str,
        transport: &dyn AlertTransport,
    ) {
        let window = self.window.get_or_insert_with(|| OutageWindow {
            started: Instant::now(),
            alert_sent: false,
        });
        window.alert_sent = true;
        self.last_alert_at = Some(Instant::now());
        let text = format!(
            "vigil: account {} polling stopped ({failure_label}): {}",
            self.config.account_id,
            truncate_for_alert(error_text, ALERT_ERROR_TEXT_MAX_CHARS)
        );
        self.deliver("fatal", text.as_str(), transport).await;
    }

    /// Closes the current outage window after a stable run. Sends the one
    /// recovery notice, with the outage duration, when the window alerted;
    /// returns whether a notice went out.
    pub async fn record_stable_run(&mut self, transport: &dyn AlertTransport) -> bool {
        let Some(window) = self.window.take() else {
            return false;
        };
        if !window.alert_sent {
            return false;
        }
        self.last_alert_at = Some(Instant::now());
        let text = format!(
            "vigil: account {} polling recovered after {}s",
            self.config.account_id,
            window.started.elapsed().as_secs()
        );
        self.deliver("recovery", text.as_str(), transport).await;
        true
    }

    async fn deliver(&self, kind: &str, text: &str, transport: &dyn AlertTransport) {
        let Some(chat_id) = self.config.alert_chat_id else {
            println!(
                "telegram outage notice (no alert chat configured): account={} kind={kind} text={text}",
                self.config.account_id
            );
            return;
        };
        if let Err(error) = transport.send_alert(chat_id, text).await {
            eprintln!(
                "telegram outage notice delivery failed: account={} kind={kind} error={error:#}",
                self.config.account_id
            );
        }
    }
}

pub(crate) fn truncate_for_alert(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let mut truncated = String::new();
    for ch in value.chars().take(max_chars) {
        truncated.push(ch);
    }
    truncated.push_str("...");
    truncated
}
