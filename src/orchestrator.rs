use crate::catalog::list_tables;
use crate::change::Consumer;
use crate::connection::Connect;
use crate::error::{ExportError, Result};
use crate::logical_replication::slot::check_status;
use crate::logical_replication::{Lsn, ReplicationSlot, Slot, SlotStatus};
use crate::options::ExportOptions;
use crate::policy::SnapshotPolicy;
use crate::snapshot::{SnapshotExport, export_snapshot};
use crate::streaming::stream_changes;
use std::sync::atomic::AtomicBool;
use tracing::info;

/// State after slot setup and the optional snapshot, ready to stream.
pub struct Prepared<R> {
    /// Replication connection that created the slot, if any.
    pub replication: Option<R>,
    pub resume_position: Lsn,
    pub created: bool,
}

/// Drives one export run: resolve or create the slot, export the initial
/// snapshot, then stream changes.
pub struct Exporter<'a, K: Connect> {
    connector: &'a K,
    options: &'a ExportOptions,
}

impl<'a, K: Connect> Exporter<'a, K> {
    pub fn new(connector: &'a K, options: &'a ExportOptions) -> Self {
        Self { connector, options }
    }

    pub fn run<P, F>(&self, policy: &P, consumer: &mut F, shutdown: &AtomicBool) -> Result<Lsn>
    where
        P: SnapshotPolicy + ?Sized,
        F: Consumer + ?Sized,
    {
        let prepared = self.prepare(policy, consumer)?;
        stream_changes(
            self.connector,
            prepared.replication,
            &self.options.slot,
            prepared.resume_position,
            consumer,
            &self.options.stream_options(),
            shutdown,
        )
    }

    /// Everything up to the first `START_REPLICATION`. A slot created here
    /// is dropped again if the snapshot export fails.
    pub fn prepare<P, F>(&self, policy: &P, consumer: &mut F) -> Result<Prepared<K::Replication>>
    where
        P: SnapshotPolicy + ?Sized,
        F: Consumer + ?Sized,
    {
        let opts = self.options;
        opts.validate()?;
        let slot = Slot::new(&opts.slot, &opts.plugin);
        let mut master = self.connector.query()?;
        let status = slot.resolve(&mut master)?;
        check_status(&slot, &status, opts.create_slot, opts.initial_snapshot)?;

        if let SlotStatus::Existing {
            resume_position, ..
        } = status
        {
            return Ok(Prepared {
                replication: None,
                resume_position,
                created: false,
            });
        }

        let mut replication = self.connector.replication()?;
        let created = slot.create(&mut replication)?;
        if opts.initial_snapshot {
            // The exported snapshot lives only as long as `replication` stays
            // open and idle.
            if let Err(e) = self.initial_snapshot(master, &created, policy, consumer) {
                slot.drop_quietly(&mut replication);
                return Err(e);
            }
        } else {
            drop(master);
        }
        Ok(Prepared {
            replication: Some(replication),
            resume_position: created.resume_position,
            created: true,
        })
    }

    fn initial_snapshot<P, F>(
        &self,
        mut master: K::Query,
        created: &ReplicationSlot,
        policy: &P,
        consumer: &mut F,
    ) -> Result<()>
    where
        P: SnapshotPolicy + ?Sized,
        F: Consumer + ?Sized,
    {
        let snapshot = created
            .snapshot
            .as_deref()
            .ok_or_else(|| ExportError::SlotCreation {
                slot: created.name.clone(),
                reason: "server did not export a snapshot".to_string(),
            })?;
        let tables = list_tables(&mut master, self.options.merge_partitions)?;
        info!(tables = tables.len(), "listed tables for initial snapshot");
        let export = SnapshotExport {
            snapshot,
            position: created.resume_position,
            max_jobs: self.options.max_snapshot_jobs,
            query: &self.options.export_query,
        };
        let exported = export_snapshot(self.connector, master, &export, tables, policy, consumer)?;
        info!(
            tables = exported.tables,
            rows = exported.rows,
            "initial snapshot complete"
        );
        Ok(())
    }
}
