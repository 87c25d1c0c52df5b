//! Run state record, kept as a small JSON file beside the database.
//!
//! Read at the start of every run and rewritten at the end, whether the run
//! succeeded or not.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    #[serde(default)]
    pub last_extract_time: Option<NaiveDateTime>,
    #[serde(default)]
    pub last_transform_time: Option<NaiveDateTime>,
    #[serde(default)]
    pub last_load_time: Option<NaiveDateTime>,
    #[serde(default)]
    pub last_run_time: Option<NaiveDateTime>,
    #[serde(default)]
    pub last_run_status: Option<RunStatus>,
}

impl RunState {
    /// Load the state file. A missing or unreadable file yields defaults.
    pub fn load(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => return Self::default(),
        };
        match serde_json::from_str(&content) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable run state");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create state directory: {}", parent.display())
                })?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write run state: {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn missing_file_gives_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert_eq!(RunState::load(&tmp.path().join("none.json")), RunState::default());
    }

    #[test]
    fn corrupt_file_gives_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(RunState::load(&path), RunState::default());
    }

    #[test]
    fn saved_state_reads_back() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("state.json");
        let when = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(8, 30, 0)
            .unwrap();
        let state = RunState {
            last_run_time: Some(when),
            last_load_time: Some(when),
            last_run_status: Some(RunStatus::Error),
            ..Default::default()
        };
        state.save(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"last_run_status\": \"error\""));
        assert_eq!(RunState::load(&path), state);
    }
}
