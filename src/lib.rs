//! Main library entry point for postgres-cdc.
//!
//! Exports the contents of a PostgreSQL database as one consistent
//! snapshot and then streams every later change from a logical replication
//! slot, starting exactly where the snapshot left off.

pub mod args;
pub mod catalog;
pub mod change;
pub mod connection;
pub mod error;
pub mod logical_replication;
pub mod options;
pub mod orchestrator;
pub mod policy;
pub mod readiness;
pub mod snapshot;
pub mod streaming;
pub mod table;
pub mod writer;

#[cfg(test)]
pub(crate) mod testing;

// Re-export key types for ergonomic access

pub use self::table::*;
pub use change::{ChangeMessage, Consumer, Origin};
pub use connection::{Connect, PgConnection, PgConnector, QueryConnection};
pub use error::{ExportError, Result};
pub use logical_replication::{
    ChangeStream, LogicalReplicationStream, Lsn, PgReplication, ReplicationClient, Slot,
    SlotStatus,
};
pub use options::ExportOptions;
pub use orchestrator::{Exporter, Prepared};
pub use policy::{SnapshotPolicy, TableFilter, TablePattern, export_all};
pub use snapshot::{ExportQuery, SnapshotExport, export_snapshot};
pub use streaming::{StreamOptions, stream_changes};
pub use writer::JsonLinesWriter;
