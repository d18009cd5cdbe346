use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// One configured bot identity, immutable for the process lifetime.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AccountConfig {
    pub account_id: String,
    pub bot_token: String,
    #[serde(default)]
    pub alert_chat_id: Option<i64>,
}

/// Loads the accounts file: a JSON array of bot account entries.
pub fn load_accounts_config(path: &Path) -> Result<Vec<AccountConfig>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read accounts file {}", path.display()))?;
    let accounts = serde_json::from_str::<Vec<AccountConfig>>(&raw)
        .with_context(|| format!("failed to parse accounts file {}", path.display()))?;
    if accounts.is_empty() {
        bail!("accounts file {} lists no accounts", path.display());
    }
    let mut seen = BTreeSet::new();
    for account in &accounts {
        if account.account_id.trim().is_empty() {
            bail!(
                "accounts file {} contains an entry with an empty account_id",
                path.display()
            );
        }
        if account.bot_token.trim().is_empty() {
            bail!("account '{}' has an empty bot_token", account.account_id);
        }
        if !seen.insert(account.account_id.as_str()) {
            bail!("account '{}' is listed more than once", account.account_id);
        }
    }
    Ok(accounts)
}

#[cfg(test)]
mod tests {
    use super::load_accounts_config;
    use tempfile::tempdir;

    #[test]
    fn functional_load_accounts_parses_entries_with_optional_alert_chat() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("accounts.json");
        std::fs::write(
            &path,
            r#"[
                {"account_id": "ops-bot", "bot_token": "token-a", "alert_chat_id": 42},
                {"account_id": "qa-bot", "bot_token": "token-b"}
            ]"#,
        )
        .expect("write accounts");

        let accounts = load_accounts_config(&path).expect("load accounts");
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].account_id, "ops-bot");
        assert_eq!(accounts[0].alert_chat_id, Some(42));
        assert_eq!(accounts[1].alert_chat_id, None);
    }

    #[test]
    fn unit_load_accounts_rejects_empty_list() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("accounts.json");
        std::fs::write(&path, "[]").expect("write accounts");
        let error = load_accounts_config(&path).expect_err("empty list");
        assert!(error.to_string().contains("lists no accounts"));
    }

    #[test]
    fn regression_load_accounts_rejects_duplicate_account_ids() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("accounts.json");
        std::fs::write(
            &path,
            r#"[
                {"account_id": "ops-bot", "bot_token": "token-a"},
                {"account_id": "ops-bot", "bot_token": "token-b"}
            ]"#,
        )
        .expect("write accounts");
        let error = load_accounts_config(&path).expect_err("duplicate ids");
        assert!(error.to_string().contains("listed more than once"));
    }

    #[test]
    fn regression_load_accounts_rejects_blank_credentials() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("accounts.json");
        std::fs::write(
            &path,
            r#"[{"account_id": "ops-bot", "bot_token": "  "}]"#,
        )
        .expect("write accounts");
        let error = load_accounts_config(&path).expect_err("blank token");
        assert!(error.to_string().contains("empty bot_token"));
    }

    #[test]
    fn unit_load_accounts_reports_missing_file_with_path() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("missing.json");
        let error = load_accounts_config(&path).expect_err("missing file");
        assert!(error.to_string().contains("failed to read accounts file"));
    }
}
