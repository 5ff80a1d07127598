//! Persisted model metadata.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a catalogue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    NotInstalled,
    Downloading,
    Ready,
    Active,
}

/// One catalogue entry, identified by a caller-chosen `model_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub model_id: String,
    #[serde(default)]
    pub repo_id: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub state: ModelState,
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    #[serde(default)]
    pub active_path: Option<PathBuf>,
}

impl ModelMetadata {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            repo_id: None,
            filename: None,
            checksum: None,
            tags: BTreeSet::new(),
            state: ModelState::NotInstalled,
            local_path: None,
            active_path: None,
        }
    }
}
