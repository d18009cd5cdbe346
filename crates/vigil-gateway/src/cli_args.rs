use std::path::PathBuf;

use clap::{ArgAction, Parser};

use vigil_telegram_runtime::{
    DEFAULT_ALERT_COOLDOWN_MS, DEFAULT_ALERT_FAILURE_THRESHOLD, DEFAULT_RESTART_GROWTH_FACTOR,
    DEFAULT_RESTART_INITIAL_DELAY_MS, DEFAULT_RESTART_JITTER_RATIO, DEFAULT_RESTART_MAX_DELAY_MS,
    DEFAULT_STABILITY_WINDOW_MS, DEFAULT_TRANSPORT_RETRY_BASE_DELAY_MS,
    DEFAULT_TRANSPORT_RETRY_BUDGET_MS,
};

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u32(value: &str) -> Result<u32, String> {
    let parsed = value
        .parse::<u32>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_f64(value: &str) -> Result<f64, String> {
    let parsed = value
        .parse::<f64>()
        .map_err(|error| format!("failed to parse float: {error}"))?;
    if !parsed.is_finite() || parsed <= 0.0 {
        return Err("value must be a finite number greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_jitter_ratio(value: &str) -> Result<f64, String> {
    let parsed = value
        .parse::<f64>()
        .map_err(|error| format!("failed to parse float: {error}"))?;
    if !parsed.is_finite() || !(0.0..1.0).contains(&parsed) {
        return Err("value must be in range 0.0..1.0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "vigil-gateway",
    about = "Resilient Telegram long-poll gateway supervisor",
    version
)]
pub struct Cli {
    /// Directory holding per-account offsets and supervisor health state.
    #[arg(long, default_value = ".vigil")]
    pub state_dir: PathBuf,

    /// Accounts file: a JSON array of {account_id, bot_token, alert_chat_id}.
    /// Defaults to accounts.json inside the state directory.
    #[arg(long)]
    pub accounts_file: Option<PathBuf>,

    /// Telegram Bot API base URL; override for tests or self-hosted relays.
    #[arg(long, default_value = "https://api.telegram.org")]
    pub api_base: String,

    /// Seconds the server may hold an empty getUpdates call open.
    #[arg(long, default_value_t = 25)]
    pub long_poll_seconds: u32,

    /// Per-call HTTP timeout; must exceed the long-poll hold.
    #[arg(long, default_value_t = 30_000, value_parser = parse_positive_u64)]
    pub request_timeout_ms: u64,

    /// First transport-level retry delay for transient fetch failures.
    #[arg(long, default_value_t = DEFAULT_TRANSPORT_RETRY_BASE_DELAY_MS, value_parser = parse_positive_u64)]
    pub transport_retry_base_delay_ms: u64,

    /// Wall-clock window the transport keeps retrying transient failures
    /// before the supervisor sees them; sized to ride out sleep/wake cycles.
    #[arg(long, default_value_t = DEFAULT_TRANSPORT_RETRY_BUDGET_MS, value_parser = parse_positive_u64)]
    pub transport_retry_budget_ms: u64,

    /// Concurrent update dispatches per fetched batch.
    #[arg(long, default_value_t = 4, value_parser = parse_positive_usize)]
    pub dispatch_concurrency: usize,

    /// Update kinds to request from getUpdates (comma separated); empty means
    /// the server default set.
    #[arg(long, value_delimiter = ',')]
    pub allowed_updates: Vec<String>,

    /// First supervisor restart delay.
    #[arg(long, default_value_t = DEFAULT_RESTART_INITIAL_DELAY_MS, value_parser = parse_positive_u64)]
    pub restart_initial_delay_ms: u64,

    /// Supervisor restart delay cap.
    #[arg(long, default_value_t = DEFAULT_RESTART_MAX_DELAY_MS, value_parser = parse_positive_u64)]
    pub restart_max_delay_ms: u64,

    /// Multiplier applied to the restart delay per attempt.
    #[arg(long, default_value_t = DEFAULT_RESTART_GROWTH_FACTOR, value_parser = parse_positive_f64)]
    pub restart_growth_factor: f64,

    /// Jitter applied to restart delays, as a fraction of the delay.
    #[arg(long, default_value_t = DEFAULT_RESTART_JITTER_RATIO, value_parser = parse_jitter_ratio)]
    pub restart_jitter_ratio: f64,

    /// Consecutive failures before the outage alert fires.
    #[arg(long, default_value_t = DEFAULT_ALERT_FAILURE_THRESHOLD, value_parser = parse_positive_u32)]
    pub alert_failure_threshold: u32,

    /// Minimum spacing between operator alerts of any kind.
    #[arg(long, default_value_t = DEFAULT_ALERT_COOLDOWN_MS, value_parser = parse_positive_u64)]
    pub alert_cooldown_ms: u64,

    /// Healthy run length after which failure history resets.
    #[arg(long, default_value_t = DEFAULT_STABILITY_WINDOW_MS, value_parser = parse_positive_u64)]
    pub stability_window_ms: u64,

    /// Run one fetch/dispatch cycle per account, then exit.
    #[arg(long, action = ArgAction::SetTrue)]
    pub poll_once: bool,

    /// Print per-account offset and supervisor health without polling.
    #[arg(long, action = ArgAction::SetTrue)]
    pub status: bool,
}
