use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use vigil_core::{current_unix_timestamp_ms, write_text_atomic};

pub const OFFSET_STATE_FILE_NAME: &str = "offset.json";
const OFFSET_STATE_SCHEMA_VERSION: u32 = 1;

fn offset_state_schema_version() -> u32 {
    OFFSET_STATE_SCHEMA_VERSION
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UpdateOffsetState {
    #[serde(default = "offset_state_schema_version")]
    schema_version: u32,
    #[serde(default)]
    last_update_id: Option<u64>,
    #[serde(default)]
    updated_unix_ms: u64,
}

impl Default for UpdateOffsetState {
    fn default() -> Self {
        Self {
            schema_version: OFFSET_STATE_SCHEMA_VERSION,
            last_update_id: None,
            updated_unix_ms: 0,
        }
    }
}

/// Durable "last processed update id" record for one account.
///
/// Single writer: the supervisor loop that owns the account. Deleting the
/// file on disk is the documented operator procedure for "start from the
/// newest update".
#[derive(Debug)]
pub struct UpdateOffsetStore {
    path: PathBuf,
    state: UpdateOffsetState,
}

impl UpdateOffsetStore {
    /// A missing file is an empty store, never an error.
    pub fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read offset state {}", path.display()))?;
            let parsed = serde_json::from_str::<UpdateOffsetState>(&raw)
                .with_context(|| format!("failed to parse offset state {}", path.display()))?;
            if parsed.schema_version != OFFSET_STATE_SCHEMA_VERSION {
                bail!(
                    "unsupported offset state schema {} in {}",
                    parsed.schema_version,
                    path.display()
                );
            }
            parsed
        } else {
            UpdateOffsetState::default()
        };
        Ok(Self { path, state })
    }

    pub fn last_update_id(&self) -> Option<u64> {
        self.state.last_update_id
    }

    /// Records `update_id` as fully processed. No-op when the stored value is
    /// already at or past `update_id`; returns whether the offset advanced.
    pub fn record_processed(&mut self, update_id: u64) -> Result<bool> {
        if matches!(self.state.last_update_id, Some(stored) if update_id <= stored) {
            return Ok(false);
        }
        self.state.last_update_id = Some(update_id);
        self.state.updated_unix_ms = current_unix_timestamp_ms();
        self.save()?;
        Ok(true)
    }

    fn save(&self) -> Result<()> {
        let payload = serde_json::to_string_pretty(&self.state)
            .context("failed to serialize offset state")?;
        write_text_atomic(&self.path, payload.as_str())
            .with_context(|| format!("failed to write offset state {}", self.path.display()))
    }
}
