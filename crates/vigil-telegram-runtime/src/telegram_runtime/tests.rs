use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use async_trait::async_trait;
use httpmock::prelude::*;
use serde_json::{json, Value};
use tokio::sync::watch;

use super::*;

fn runtime_config(api_base: &str, state_dir: &Path) -> TelegramPollRuntimeConfig {
    TelegramPollRuntimeConfig {
        account_id: "ops-bot".to_string(),
        bot_token: "poll-token".to_string(),
        alert_chat_id: None,
        api_base: api_base.to_string(),
        state_dir: state_dir.to_path_buf(),
        long_poll_seconds: 0,
        request_timeout_ms: 2_000,
        // The first transport retry delay already exceeds this budget, so
        // transport failures surface to the supervisor immediately.
        transport_retry_base_delay_ms: 10,
        transport_retry_budget_ms: 1,
        dispatch_concurrency: 2,
        allowed_updates: Vec::new(),
        restart_backoff: RestartBackoffPolicy {
            initial_delay_ms: 1,
            max_delay_ms: 2,
            growth_factor: 1.5,
            jitter_ratio: 0.0,
        },
        alert_failure_threshold: 3,
        alert_cooldown_ms: 30 * 60 * 1_000,
        stability_window_ms: 60 * 60 * 1_000,
        poll_once: false,
    }
}

#[derive(Default)]
struct RecordingHandler {
    seen: Mutex<Vec<u64>>,
    fail_ids: HashSet<u64>,
}

impl RecordingHandler {
    fn failing_on(ids: &[u64]) -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            fail_ids: ids.iter().copied().collect(),
        }
    }

    fn seen(&self) -> Vec<u64> {
        self.seen.lock().expect("seen lock").clone()
    }
}

#[async_trait]
impl UpdateHandler for RecordingHandler {
    async fn handle_update(&self, _account_id: &str, update: &TelegramUpdate) -> Result<()> {
        self.seen.lock().expect("seen lock").push(update.update_id);
        if self.fail_ids.contains(&update.update_id) {
            bail!("handler rejected update {}", update.update_id);
        }
        Ok(())
    }
}

fn update_batch(ids: &[u64]) -> Value {
    json!({
        "ok": true,
        "result": ids.iter().map(|id| json!({
            "update_id": id,
            "message": {"message_id": id, "text": "ping", "chat": {"id": 7}}
        })).collect::<Vec<_>>()
    })
}

#[tokio::test]
async fn functional_poll_once_processes_batch_in_order_and_advances_offset() {
    let temp = tempfile::tempdir().expect("tempdir");
    let server = MockServer::start();
    let poll_mock = server.mock(|when, then| {
        when.method(GET).path("/botpoll-token/getUpdates");
        then.status(200).json_body(update_batch(&[5, 6, 7]));
    });

    let mut config = runtime_config(&server.base_url(), temp.path());
    config.poll_once = true;
    config.dispatch_concurrency = 1;
    let handler = Arc::new(RecordingHandler::default());
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    run_telegram_poll_supervisor(config, handler.clone(), cancel_rx)
        .await
        .expect("one-shot run");

    assert_eq!(handler.seen(), vec![5, 6, 7]);
    poll_mock.assert_calls(1);

    let report = load_telegram_supervisor_status_report(temp.path(), "ops-bot").expect("status");
    assert_eq!(report.last_update_id, Some(7));
}

#[tokio::test]
async fn functional_next_session_resumes_past_stored_offset() {
    let temp = tempfile::tempdir().expect("tempdir");
    let offset_path = account_state_dir(temp.path(), "ops-bot").join(OFFSET_STATE_FILE_NAME);
    let mut store = UpdateOffsetStore::load(offset_path).expect("load store");
    store.record_processed(7).expect("seed offset");

    let server = MockServer::start();
    let poll_mock = server.mock(|when, then| {
        when.method(GET)
            .path("/botpoll-token/getUpdates")
            .query_param("offset", "8");
        then.status(200).json_body(json!({"ok": true, "result": []}));
    });

    let mut config = runtime_config(&server.base_url(), temp.path());
    config.poll_once = true;
    let handler = Arc::new(RecordingHandler::default());
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    run_telegram_poll_supervisor(config, handler, cancel_rx)
        .await
        .expect("one-shot run");
    poll_mock.assert_calls(1);
}

#[tokio::test]
async fn regression_handler_failure_still_advances_offset() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = runtime_config("https://api.telegram.org", temp.path());
    let handler = Arc::new(RecordingHandler::failing_on(&[6]));
    let mut runner = TelegramPollRunner::new(config, handler.clone()).expect("runner");

    let updates = [5, 6, 7]
        .iter()
        .map(|id| TelegramUpdate {
            update_id: *id,
            payload: json!({"update_id": id}),
        })
        .collect::<Vec<_>>();
    let report = runner.dispatch_batch(updates).await;

    assert_eq!(report.dispatched_updates, 3);
    assert_eq!(report.handler_failures, 1);
    assert_eq!(report.offset_write_failures, 0);
    assert_eq!(runner.last_update_id(), Some(7));
    let mut seen = handler.seen();
    seen.sort_unstable();
    assert_eq!(seen, vec![5, 6, 7]);
}

#[tokio::test]
async fn regression_offset_write_failure_does_not_abort_dispatch() {
    let temp = tempfile::tempdir().expect("tempdir");
    // A plain file where the account directory belongs makes every offset
    // write fail while leaving the store loadable.
    std::fs::create_dir_all(temp.path().join("accounts")).expect("accounts dir");
    std::fs::write(temp.path().join("accounts").join("ops-bot"), "").expect("blocker file");

    let config = runtime_config("https://api.telegram.org", temp.path());
    let handler = Arc::new(RecordingHandler::default());
    let mut runner = TelegramPollRunner::new(config, handler.clone()).expect("runner");

    let updates = [1, 2]
        .iter()
        .map(|id| TelegramUpdate {
            update_id: *id,
            payload: json!({"update_id": id}),
        })
        .collect::<Vec<_>>();
    let report = runner.dispatch_batch(updates).await;

    assert_eq!(report.dispatched_updates, 2);
    assert_eq!(report.offset_write_failures, 2);
    assert_eq!(report.handler_failures, 0);
    let mut seen = handler.seen();
    seen.sort_unstable();
    assert_eq!(seen, vec![1, 2]);
}

#[tokio::test]
async fn integration_repeated_failures_alert_once_at_threshold() {
    let temp = tempfile::tempdir().expect("tempdir");
    let server = MockServer::start();
    let poll_mock = server.mock(|when, then| {
        when.method(GET).path("/botpoll-token/getUpdates");
        then.status(503).json_body(json!({"ok": false}));
    });
    let alert_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/botpoll-token/sendMessage")
            .body_includes("polling degraded");
        then.status(200).json_body(json!({"ok": true, "result": {}}));
    });

    let mut config = runtime_config(&server.base_url(), temp.path());
    config.alert_chat_id = Some(42);
    let handler = Arc::new(RecordingHandler::default());
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let supervisor = tokio::spawn(run_telegram_poll_supervisor(config, handler, cancel_rx));
    tokio::time::sleep(Duration::from_millis(300)).await;
    cancel_tx.send(true).expect("cancel");
    supervisor
        .await
        .expect("join")
        .expect("supervisor exits cleanly on cancel");

    assert!(
        poll_mock.calls() >= 4,
        "expected several restarts, saw {} fetches",
        poll_mock.calls()
    );
    alert_mock.assert_calls(1);

    let report = load_telegram_supervisor_status_report(temp.path(), "ops-bot").expect("status");
    assert_eq!(report.last_failure_code, "recoverable_network");
    assert!(report.failure_streak >= 3);
    assert!(report.restarts_total >= 3);
}

#[tokio::test]
async fn integration_session_conflict_is_retried_with_distinct_label() {
    let temp = tempfile::tempdir().expect("tempdir");
    let server = MockServer::start();
    let poll_mock = server.mock(|when, then| {
        when.method(GET).path("/botpoll-token/getUpdates");
        then.status(409).json_body(json!({
            "ok": false,
            "error_code": 409,
            "description": "Conflict: terminated by other getUpdates request"
        }));
    });

    let config = runtime_config(&server.base_url(), temp.path());
    let handler = Arc::new(RecordingHandler::default());
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let supervisor = tokio::spawn(run_telegram_poll_supervisor(config, handler, cancel_rx));
    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel_tx.send(true).expect("cancel");
    supervisor
        .await
        .expect("join")
        .expect("conflicts must keep retrying, not stop the supervisor");

    assert!(
        poll_mock.calls() >= 3,
        "expected conflict retries, saw {} fetches",
        poll_mock.calls()
    );
    let report = load_telegram_supervisor_status_report(temp.path(), "ops-bot").expect("status");
    assert_eq!(report.last_failure_code, "session_conflict");
}

#[tokio::test]
async fn regression_fatal_auth_failure_stops_supervisor_and_alerts_immediately() {
    let temp = tempfile::tempdir().expect("tempdir");
    let server = MockServer::start();
    let poll_mock = server.mock(|when, then| {
        when.method(GET).path("/botpoll-token/getUpdates");
        then.status(401).json_body(json!({
            "ok": false,
            "error_code": 401,
            "description": "Unauthorized"
        }));
    });
    let alert_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/botpoll-token/sendMessage")
            .body_includes("polling stopped");
        then.status(200).json_body(json!({"ok": true, "result": {}}));
    });

    let mut config = runtime_config(&server.base_url(), temp.path());
    config.alert_chat_id = Some(42);
    let handler = Arc::new(RecordingHandler::default());
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    let error = run_telegram_poll_supervisor(config, handler, cancel_rx)
        .await
        .expect_err("revoked credentials are fatal");
    assert!(error.to_string().contains("status=401"));

    poll_mock.assert_calls(1);
    alert_mock.assert_calls(1);

    let report = load_telegram_supervisor_status_report(temp.path(), "ops-bot").expect("status");
    assert_eq!(report.last_failure_code, "fatal");
    assert_eq!(report.failure_streak, 1);
}

#[tokio::test]
async fn regression_cancellation_during_backoff_exits_promptly() {
    let temp = tempfile::tempdir().expect("tempdir");
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/botpoll-token/getUpdates");
        then.status(503).json_body(json!({"ok": false}));
    });

    let mut config = runtime_config(&server.base_url(), temp.path());
    config.restart_backoff = RestartBackoffPolicy {
        initial_delay_ms: 60_000,
        max_delay_ms: 60_000,
        growth_factor: 1.5,
        jitter_ratio: 0.0,
    };
    let handler = Arc::new(RecordingHandler::default());
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let supervisor = tokio::spawn(run_telegram_poll_supervisor(config, handler, cancel_rx));
    tokio::time::sleep(Duration::from_millis(100)).await;
    let cancelled_at = Instant::now();
    cancel_tx.send(true).expect("cancel");
    supervisor
        .await
        .expect("join")
        .expect("cancellation exits cleanly");
    assert!(
        cancelled_at.elapsed() < Duration::from_secs(5),
        "cancellation must not wait out the remaining backoff"
    );
}

#[tokio::test]
async fn functional_stable_run_resets_failure_history() {
    let temp = tempfile::tempdir().expect("tempdir");
    let account_dir = account_state_dir(temp.path(), "ops-bot");
    std::fs::create_dir_all(&account_dir).expect("account dir");
    let seeded = SupervisorHealthSnapshot {
        failure_streak: 5,
        restarts_total: 7,
        last_failure_code: "recoverable_network".to_string(),
        ..SupervisorHealthSnapshot::default()
    };
    std::fs::write(
        account_dir.join(SUPERVISOR_HEALTH_FILE_NAME),
        serde_json::to_string_pretty(&seeded).expect("encode"),
    )
    .expect("seed health");

    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/botpoll-token/getUpdates");
        then.status(200).json_body(json!({"ok": true, "result": []}));
    });

    let mut config = runtime_config(&server.base_url(), temp.path());
    config.stability_window_ms = 50;
    let handler = Arc::new(RecordingHandler::default());
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let supervisor = tokio::spawn(run_telegram_poll_supervisor(config, handler, cancel_rx));
    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel_tx.send(true).expect("cancel");
    supervisor.await.expect("join").expect("clean exit");

    let report = load_telegram_supervisor_status_report(temp.path(), "ops-bot").expect("status");
    assert_eq!(report.failure_streak, 0);
    assert_eq!(report.restarts_total, 7);
    assert!(report.last_stable_unix_ms > 0);
}

#[test]
fn unit_restart_attempt_after_applies_stability_reset() {
    let window = Duration::from_secs(300);
    assert_eq!(restart_attempt_after(0, Duration::from_secs(1), window), 1);
    assert_eq!(restart_attempt_after(7, Duration::from_secs(60), window), 8);
    assert_eq!(restart_attempt_after(7, Duration::from_secs(301), window), 1);
    assert_eq!(restart_attempt_after(7, window, window), 1);
}

#[test]
fn unit_sanitize_for_path_keeps_safe_characters() {
    assert_eq!(sanitize_for_path("ops-bot"), "ops-bot");
    assert_eq!(sanitize_for_path("team/bot #1"), "team_bot__1");
    assert_eq!(sanitize_for_path("///"), "account");
}

#[test]
fn functional_status_report_renders_none_for_missing_state() {
    let temp = tempfile::tempdir().expect("tempdir");
    let report = load_telegram_supervisor_status_report(temp.path(), "ops-bot").expect("status");
    let rendered = render_telegram_supervisor_status_report(&report);
    assert!(rendered.contains("account=ops-bot"));
    assert!(rendered.contains("last_update_id=none"));
    assert!(rendered.contains("last_failure_code=none"));
    assert!(rendered.contains("failure_streak=0"));
}

#[test]
fn functional_status_report_reflects_persisted_state() {
    let temp = tempfile::tempdir().expect("tempdir");
    let offset_path = account_state_dir(temp.path(), "ops-bot").join(OFFSET_STATE_FILE_NAME);
    let mut store = UpdateOffsetStore::load(offset_path).expect("load store");
    store.record_processed(41).expect("seed offset");

    let report = load_telegram_supervisor_status_report(temp.path(), "ops-bot").expect("status");
    let rendered = render_telegram_supervisor_status_report(&report);
    assert!(rendered.contains("last_update_id=41"));
    assert!(rendered.contains("state_path="));
}
