// Slot management for logical replication

use super::message::Lsn;
use super::stream::ReplicationClient;
use crate::connection::{QueryConnection, run_query};
use crate::error::{ExportError, Result};
use crate::table::quote_literal;
use tracing::{info, warn};

/// A slot as returned by creation. `snapshot` names the exported snapshot
/// and is only usable while the creating connection stays open and idle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationSlot {
    pub name: String,
    pub resume_position: Lsn,
    pub snapshot: Option<String>,
    pub plugin: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotStatus {
    Existing { resume_position: Lsn, plugin: String },
    Missing,
}

#[derive(Debug, Clone)]
pub struct Slot {
    pub name: String,
    pub plugin: String,
}

impl Slot {
    pub fn new(name: &str, plugin: &str) -> Self {
        Slot {
            name: name.to_string(),
            plugin: plugin.to_string(),
        }
    }

    pub fn status_query(&self) -> String {
        format!(
            "SELECT coalesce(confirmed_flush_lsn, restart_lsn)::text, plugin \
             FROM pg_catalog.pg_replication_slots WHERE slot_name = {}",
            quote_literal(&self.name)
        )
    }

    /// Look the slot up on a regular connection.
    pub fn resolve<C: QueryConnection>(&self, conn: &mut C) -> Result<SlotStatus> {
        let rows = run_query(conn, &self.status_query())?;
        let Some(row) = rows.first() else {
            info!(slot = %self.name, "replication slot does not exist");
            return Ok(SlotStatus::Missing);
        };
        let resume_position = match row.get(0) {
            Some(lsn) => lsn.parse()?,
            None => Lsn::ZERO,
        };
        let plugin = row.get(1).unwrap_or_default().to_string();
        if plugin != self.plugin {
            warn!(
                slot = %self.name,
                existing = %plugin,
                requested = %self.plugin,
                "existing slot uses a different output plugin"
            );
        }
        info!(slot = %self.name, %resume_position, "found existing replication slot");
        Ok(SlotStatus::Existing {
            resume_position,
            plugin,
        })
    }

    pub fn create<R: ReplicationClient>(&self, repl: &mut R) -> Result<ReplicationSlot> {
        info!(slot = %self.name, plugin = %self.plugin, "creating logical replication slot");
        let slot = repl.create_slot(&self.name, &self.plugin)?;
        info!(
            slot = %slot.name,
            consistent_point = %slot.resume_position,
            snapshot = ?slot.snapshot,
            "created replication slot"
        );
        Ok(slot)
    }

    /// Best-effort removal. Failures are only logged so the error that led
    /// here reaches the caller unchanged.
    pub fn drop_quietly<R: ReplicationClient>(&self, repl: &mut R) {
        match repl.drop_slot(&self.name) {
            Ok(()) => info!(slot = %self.name, "dropped replication slot"),
            Err(e) => warn!(slot = %self.name, error = %e, "failed to drop replication slot"),
        }
    }
}

/// Slot lifecycle as seen by an export run.
pub(crate) fn check_status(
    slot: &Slot,
    status: &SlotStatus,
    create_slot: bool,
    initial_snapshot: bool,
) -> Result<()> {
    match status {
        SlotStatus::Existing { .. } if initial_snapshot => {
            Err(ExportError::SlotAlreadyExists(slot.name.clone()))
        }
        SlotStatus::Existing { .. } => Ok(()),
        SlotStatus::Missing if create_slot => Ok(()),
        SlotStatus::Missing => Err(ExportError::SlotDoesNotExist(slot.name.clone())),
    }
}
