use super::telegram_api_client::{TelegramApiError, TelegramApiErrorKind};

/// Closed set of restart policies for a failed polling session.
///
/// Unrecognized failures deliberately classify as `UnknownRetryable` rather
/// than `Fatal`: mislabeling an unknown-but-transient error as fatal would
/// silently kill the bot, so fatal conditions are enumerated explicitly and
/// everything else keeps retrying. Every restart logs the classified label,
/// which keeps an endlessly retrying unknown condition discoverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Another consumer is long-polling the same bot token (HTTP 409). The
    /// fix is usually "stop the other process", not "wait for the network".
    SessionConflict,
    /// Transient transport failure: timeout, connection reset, DNS, 429, 5xx.
    RecoverableNetwork,
    /// Not recognized as any of the above; retried with backoff.
    UnknownRetryable,
    /// Revoked or malformed bot token. No amount of retrying will help.
    Fatal,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionConflict => "session_conflict",
            Self::RecoverableNetwork => "recoverable_network",
            Self::UnknownRetryable => "unknown_retryable",
            Self::Fatal => "fatal",
        }
    }

    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Fatal)
    }
}

/// Labels the error a polling session died with.
pub fn classify_poll_failure(error: &anyhow::Error) -> FailureClass {
    let Some(api_error) = error.downcast_ref::<TelegramApiError>() else {
        return FailureClass::UnknownRetryable;
    };
    match api_error.kind {
        TelegramApiErrorKind::Transport | TelegramApiErrorKind::Timeout => {
            FailureClass::RecoverableNetwork
        }
        TelegramApiErrorKind::Status => match api_error.status {
            Some(409) => FailureClass::SessionConflict,
            // 401 is a revoked token, 404 a malformed one.
            Some(401) | Some(404) => FailureClass::Fatal,
            Some(429) => FailureClass::RecoverableNetwork,
            Some(status) if (500..600).contains(&status) => FailureClass::RecoverableNetwork,
            _ => FailureClass::UnknownRetryable,
        },
        TelegramApiErrorKind::Decode => FailureClass::UnknownRetryable,
    }
}
