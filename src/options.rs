// Export configuration.

use crate::error::{ExportError, Result};
use crate::snapshot::ExportQuery;
use crate::streaming::StreamOptions;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub slot: String,
    /// Create the slot when it does not exist.
    pub create_slot: bool,
    /// Export existing table contents before streaming. Requires creating
    /// the slot in this run.
    pub initial_snapshot: bool,
    pub max_snapshot_jobs: usize,
    pub reconnect_delay: Duration,
    pub status_interval: Duration,
    /// Logical decoding output plugin.
    pub plugin: String,
    /// Options passed to the output plugin on `START_REPLICATION`.
    pub plugin_options: Vec<(String, String)>,
    pub export_query: ExportQuery,
    /// Fold inheritance children and partitions into their root table.
    pub merge_partitions: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        ExportOptions {
            slot: "postgres_cdc".to_string(),
            create_slot: false,
            initial_snapshot: false,
            max_snapshot_jobs: 1,
            reconnect_delay: Duration::from_secs(10),
            status_interval: Duration::from_secs(10),
            plugin: "wal2json".to_string(),
            plugin_options: Vec::new(),
            export_query: ExportQuery::default(),
            merge_partitions: true,
        }
    }
}

impl ExportOptions {
    pub fn new(slot: &str) -> Self {
        ExportOptions {
            slot: slot.to_string(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.slot.trim().is_empty() {
            return Err(ExportError::Config("slot name must not be empty".into()));
        }
        if self.plugin.trim().is_empty() {
            return Err(ExportError::Config("output plugin must not be empty".into()));
        }
        if self.max_snapshot_jobs == 0 {
            return Err(ExportError::Config(
                "max_snapshot_jobs must be at least 1".into(),
            ));
        }
        if let ExportQuery::Function(name) = &self.export_query
            && name.trim().is_empty()
        {
            return Err(ExportError::Config("export function name is empty".into()));
        }
        Ok(())
    }

    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            reconnect_delay: self.reconnect_delay,
            status_interval: self.status_interval,
            plugin_options: self.plugin_options.clone(),
            ..StreamOptions::default()
        }
    }
}
