//! Gateway binary: spawns one supervised Telegram long-poll session per
//! configured account and wires process shutdown into their cancellation
//! signal.

mod accounts;
mod cli_args;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use clap::Parser;
use tokio::sync::watch;

use accounts::{load_accounts_config, AccountConfig};
use cli_args::Cli;
use vigil_telegram_runtime::{
    load_telegram_supervisor_status_report, render_telegram_supervisor_status_report,
    run_telegram_poll_supervisor, RestartBackoffPolicy, TelegramPollRuntimeConfig, TelegramUpdate,
    UpdateHandler,
};

/// Placeholder for the external agent: acknowledges every update with a log
/// line. Re-running it for a redelivered update is harmless, which is exactly
/// the idempotence the runtime asks of real handlers.
struct AckLoggingHandler;

#[async_trait]
impl UpdateHandler for AckLoggingHandler {
    async fn handle_update(&self, account_id: &str, update: &TelegramUpdate) -> Result<()> {
        println!(
            "telegram update received: account={account_id} update_id={}",
            update.update_id
        );
        Ok(())
    }
}

fn accounts_file_path(cli: &Cli) -> PathBuf {
    cli.accounts_file
        .clone()
        .unwrap_or_else(|| cli.state_dir.join("accounts.json"))
}

fn runtime_config_for_account(cli: &Cli, account: &AccountConfig) -> TelegramPollRuntimeConfig {
    TelegramPollRuntimeConfig {
        account_id: account.account_id.clone(),
        bot_token: account.bot_token.clone(),
        alert_chat_id: account.alert_chat_id,
        api_base: cli.api_base.clone(),
        state_dir: cli.state_dir.clone(),
        long_poll_seconds: cli.long_poll_seconds,
        request_timeout_ms: cli.request_timeout_ms,
        transport_retry_base_delay_ms: cli.transport_retry_base_delay_ms,
        transport_retry_budget_ms: cli.transport_retry_budget_ms,
        dispatch_concurrency: cli.dispatch_concurrency,
        allowed_updates: cli.allowed_updates.clone(),
        restart_backoff: RestartBackoffPolicy {
            initial_delay_ms: cli.restart_initial_delay_ms,
            max_delay_ms: cli.restart_max_delay_ms,
            growth_factor: cli.restart_growth_factor,
            jitter_ratio: cli.restart_jitter_ratio,
        },
        alert_failure_threshold: cli.alert_failure_threshold,
        alert_cooldown_ms: cli.alert_cooldown_ms,
        stability_window_ms: cli.stability_window_ms,
        poll_once: cli.poll_once,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.request_timeout_ms <= u64::from(cli.long_poll_seconds).saturating_mul(1_000) {
        bail!("--request-timeout-ms must exceed the --long-poll-seconds hold");
    }

    let accounts_file = accounts_file_path(&cli);
    let accounts = load_accounts_config(&accounts_file)?;

    if cli.status {
        for account in &accounts {
            let report =
                load_telegram_supervisor_status_report(&cli.state_dir, &account.account_id)?;
            println!("{}", render_telegram_supervisor_status_report(&report));
        }
        return Ok(());
    }

    println!(
        "vigil gateway starting: accounts={} state_dir={} poll_once={}",
        accounts.len(),
        cli.state_dir.display(),
        cli.poll_once
    );

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let handler: Arc<dyn UpdateHandler> = Arc::new(AckLoggingHandler);
    let mut supervisors = Vec::with_capacity(accounts.len());
    for account in &accounts {
        let config = runtime_config_for_account(&cli, account);
        let handle = tokio::spawn(run_telegram_poll_supervisor(
            config,
            Arc::clone(&handler),
            cancel_rx.clone(),
        ));
        supervisors.push((account.account_id.clone(), handle));
    }
    drop(cancel_rx);

    let shutdown = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("vigil gateway shutdown requested");
        }
        let _ = cancel_tx.send(true);
    });

    let mut failed_supervisors = 0usize;
    for (account_id, handle) in supervisors {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                failed_supervisors = failed_supervisors.saturating_add(1);
                eprintln!("telegram supervisor failed: account={account_id} error={error:#}");
            }
            Err(join_error) => {
                failed_supervisors = failed_supervisors.saturating_add(1);
                eprintln!("telegram supervisor panicked: account={account_id} error={join_error}");
            }
        }
    }
    shutdown.abort();

    if failed_supervisors > 0 {
        bail!("{failed_supervisors} supervisor task(s) stopped with a fatal error");
    }
    Ok(())
}
