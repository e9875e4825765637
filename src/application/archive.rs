//! Flow Archive
//!
//! Durable history of terminal rebalance flows, one JSON file per asset,
//! truncated to the most recent N entries for audit.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::flow::RebalanceFlow;
use crate::domain::types::AssetId;

#[derive(Debug, Error, Clone)]
pub enum ArchiveError {
    #[error("failed to create archive directory: {0}")]
    DirectoryError(String),

    #[error("failed to serialize flow history: {0}")]
    SerializationError(String),

    #[error("failed to read flow history: {0}")]
    ReadError(String),

    #[error("failed to write flow history: {0}")]
    WriteError(String),

    #[error("flow history file is corrupted: {0}")]
    CorruptedFile(String),
}

/// An archived flow with its archival wall-clock time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedFlow {
    pub archived_at: DateTime<Utc>,
    pub flow: RebalanceFlow,
}

/// File-backed flow history, last N terminal flows per asset.
pub struct FlowArchive {
    data_dir: PathBuf,
    keep_per_asset: usize,
}

impl FlowArchive {
    pub fn new(data_dir: impl Into<PathBuf>, keep_per_asset: usize) -> Self {
        Self {
            data_dir: data_dir.into(),
            keep_per_asset,
        }
    }

    /// Append a terminal flow to its asset's history, truncating to the
    /// retention limit (oldest entries dropped first).
    pub fn archive(&self, flow: &RebalanceFlow) -> Result<(), ArchiveError> {
        fs::create_dir_all(&self.data_dir)
            .map_err(|e| ArchiveError::DirectoryError(e.to_string()))?;

        let mut history = self.load(&flow.asset_id)?;
        history.push(ArchivedFlow {
            archived_at: Utc::now(),
            flow: flow.clone(),
        });
        if history.len() > self.keep_per_asset {
            let excess = history.len() - self.keep_per_asset;
            history.drain(..excess);
        }

        let path = self.history_path(&flow.asset_id);
        let content = serde_json::to_string_pretty(&history)
            .map_err(|e| ArchiveError::SerializationError(e.to_string()))?;
        fs::write(&path, content).map_err(|e| ArchiveError::WriteError(e.to_string()))?;

        tracing::debug!(
            "Archived flow {} for {} ({} kept)",
            flow.flow_id,
            flow.asset_id,
            history.len()
        );
        Ok(())
    }

    /// Load the archived history for an asset, oldest first.
    pub fn load(&self, asset: &AssetId) -> Result<Vec<ArchivedFlow>, ArchiveError> {
        let path = self.history_path(asset);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content =
            fs::read_to_string(&path).map_err(|e| ArchiveError::ReadError(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| ArchiveError::CorruptedFile(e.to_string()))
    }

    /// Path of the history file for an asset. The id is sanitized so an
    /// asset name can never resolve outside the data directory.
    pub fn history_path(&self, asset: &AssetId) -> PathBuf {
        let safe: String = asset
            .as_str()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.data_dir.join(format!("flows_{safe}.json"))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}
