use std::fmt;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde_json::Value;

pub const DEFAULT_TRANSPORT_RETRY_BASE_DELAY_MS: u64 = 2_000;
pub const DEFAULT_TRANSPORT_RETRY_BUDGET_MS: u64 = 30 * 60 * 1_000;
const TRANSPORT_RETRY_MAX_DELAY_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Enumerates supported `TelegramApiErrorKind` values.
pub enum TelegramApiErrorKind {
    /// Connection-level failure before an HTTP status was received.
    Transport,
    /// The request exceeded the per-call timeout.
    Timeout,
    /// The Bot API answered with a non-success status or `ok: false`.
    Status,
    /// The response body was not a usable Bot API envelope.
    Decode,
}

impl TelegramApiErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::Status => "status",
            Self::Decode => "decode",
        }
    }
}

/// Typed Bot API failure carried through anyhow chains so the supervisor's
/// classifier can downcast it.
#[derive(Debug, Clone)]
pub struct TelegramApiError {
    pub kind: TelegramApiErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

impl TelegramApiError {
    fn transport(error: &reqwest::Error) -> Self {
        let kind = if error.is_timeout() {
            TelegramApiErrorKind::Timeout
        } else {
            TelegramApiErrorKind::Transport
        };
        Self {
            kind,
            status: None,
            message: format!("telegram request failed: {error}"),
        }
    }

    fn status(status: u16, description: Option<&str>) -> Self {
        let message = match description {
            Some(description) => {
                format!("telegram api rejected request: status={status} description={description}")
            }
            None => format!("telegram api rejected request: status={status}"),
        };
        Self {
            kind: TelegramApiErrorKind::Status,
            status: Some(status),
            message,
        }
    }

    fn decode(detail: impl Into<String>) -> Self {
        Self {
            kind: TelegramApiErrorKind::Decode,
            status: None,
            message: detail.into(),
        }
    }
}

impl fmt::Display for TelegramApiError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.message)
    }
}

impl std::error::Error for TelegramApiError {}

/// One raw update as returned by `getUpdates`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelegramUpdate {
    pub update_id: u64,
    pub payload: Value,
}

#[derive(Debug, Clone)]
/// Connection settings for one account's Bot API client.
pub struct TelegramApiClientConfig {
    pub api_base: String,
    pub bot_token: String,
    pub request_timeout_ms: u64,
    pub long_poll_seconds: u32,
    pub allowed_updates: Vec<String>,
    pub transport_retry_base_delay_ms: u64,
    pub transport_retry_budget_ms: u64,
}

/// Bot API client for one account: long-poll fetches plus out-of-band
/// operator messages.
#[derive(Debug)]
pub struct TelegramApiClient {
    config: TelegramApiClientConfig,
    http: reqwest::Client,
}

impl TelegramApiClient {
    pub fn new(config: TelegramApiClientConfig) -> Result<Self> {
        if config.api_base.trim().is_empty() {
            bail!("telegram api base cannot be empty");
        }
        if config.bot_token.trim().is_empty() {
            bail!("telegram bot token cannot be empty");
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms.max(1)))
            .build()
            .context("failed to build telegram http client")?;
        Ok(Self { config, http })
    }

    /// Long-poll fetch starting at `offset` (the wire offset, i.e. one past
    /// the last processed update id).
    ///
    /// Transient transport failures retry in here with a doubling delay until
    /// the retry budget window is spent, so sub-minute blips and sleep/wake
    /// cycles never surface to the supervisor. Conflict, auth, and other
    /// non-transient statuses surface immediately.
    pub async fn fetch_updates(
        &self,
        offset: Option<u64>,
    ) -> Result<Vec<TelegramUpdate>, TelegramApiError> {
        let url = self.method_url("getUpdates");
        let started = Instant::now();
        let mut attempt = 0usize;
        loop {
            attempt = attempt.saturating_add(1);
            let mut request = self
                .http
                .get(url.as_str())
                .query(&[("timeout", self.config.long_poll_seconds.to_string())]);
            if let Some(offset) = offset {
                request = request.query(&[("offset", offset.to_string())]);
            }
            if !self.config.allowed_updates.is_empty() {
                let encoded =
                    serde_json::to_string(&self.config.allowed_updates).map_err(|error| {
                        TelegramApiError::decode(format!("failed to encode allowed_updates: {error}"))
                    })?;
                request = request.query(&[("allowed_updates", encoded)]);
            }

            let error = match self.execute_poll_request(request).await {
                Ok(updates) => return Ok(updates),
                Err(error) => error,
            };
            let delay_ms = self.transport_retry_delay_ms(attempt);
            if !transport_error_is_retryable(&error)
                || !self.retry_budget_allows(started, delay_ms)
            {
                return Err(error);
            }
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    /// Delivers an operator message. Single attempt: alert delivery is
    /// best-effort and the caller swallows failures.
    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), TelegramApiError> {
        let url = self.method_url("sendMessage");
        let response = self
            .http
            .post(url.as_str())
            .json(&serde_json::json!({ "chat_id": chat_id, "text": text }))
            .send()
            .await
            .map_err(|error| TelegramApiError::transport(&error))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|error| TelegramApiError::transport(&error))?;
        let payload = serde_json::from_str::<Value>(&body).unwrap_or(Value::Null);
        let description = payload.get("description").and_then(Value::as_str);
        if !(200..300).contains(&status) {
            return Err(TelegramApiError::status(status, description));
        }
        let ok = payload.get("ok").and_then(Value::as_bool).unwrap_or(false);
        if !ok {
            return Err(TelegramApiError::decode(
                "telegram sendMessage envelope missing ok=true",
            ));
        }
        Ok(())
    }

    async fn execute_poll_request(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<Vec<TelegramUpdate>, TelegramApiError> {
        let response = request
            .send()
            .await
            .map_err(|error| TelegramApiError::transport(&error))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|error| TelegramApiError::transport(&error))?;
        let payload = serde_json::from_str::<Value>(&body).unwrap_or(Value::Null);
        let description = payload.get("description").and_then(Value::as_str);
        if !(200..300).contains(&status) {
            return Err(TelegramApiError::status(status, description));
        }
        let ok = payload.get("ok").and_then(Value::as_bool).unwrap_or(false);
        if !ok {
            // Some deployments answer 200 with ok=false plus an error_code.
            let error_code = payload
                .get("error_code")
                .and_then(Value::as_u64)
                .and_then(|code| u16::try_from(code).ok());
            return Err(match error_code {
                Some(code) => TelegramApiError::status(code, description),
                None => TelegramApiError::decode("telegram getUpdates envelope missing ok=true"),
            });
        }
        let Some(entries) = payload.get("result").and_then(Value::as_array) else {
            return Err(TelegramApiError::decode(
                "telegram getUpdates response missing result[]",
            ));
        };
        let mut updates = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(update_id) = entry.get("update_id").and_then(Value::as_u64) else {
                return Err(TelegramApiError::decode(
                    "telegram update entry missing update_id",
                ));
            };
            updates.push(TelegramUpdate {
                update_id,
                payload: entry.clone(),
            });
        }
        // Batches are documented to arrive ordered; sort defensively anyway.
        updates.sort_by_key(|update| update.update_id);
        Ok(updates)
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token
        )
    }

    fn transport_retry_delay_ms(&self, attempt: usize) -> u64 {
        let shift = attempt.saturating_sub(1).min(6);
        self.config
            .transport_retry_base_delay_ms
            .saturating_mul(1_u64 << shift)
            .min(TRANSPORT_RETRY_MAX_DELAY_MS)
    }

    fn retry_budget_allows(&self, started: Instant, delay_ms: u64) -> bool {
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        retry_budget_allows_delay(elapsed_ms, delay_ms, self.config.transport_retry_budget_ms)
    }
}

fn transport_error_is_retryable(error: &TelegramApiError) -> bool {
    match error.kind {
        TelegramApiErrorKind::Transport | TelegramApiErrorKind::Timeout => true,
        TelegramApiErrorKind::Status => match error.status {
            Some(429) => true,
            Some(status) => (500..600).contains(&status),
            None => false,
        },
        TelegramApiErrorKind::Decode => false,
    }
}

fn retry_budget_allows_delay(elapsed_ms: u64, delay_ms: u64, budget_ms: u64) -> bool {
    if budget_ms == 0 {
        return true;
    }
    elapsed_ms.saturating_add(delay_ms) <= budget_ms
}
