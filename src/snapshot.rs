//! Snapshot scheduler.
//!
//! Exports the selected tables under one exported snapshot. Up to
//! `max_jobs` tables are exported at once, each on its own connection bound
//! to the snapshot with `SET TRANSACTION SNAPSHOT`; connections are reused
//! once their table is exhausted. Everything runs on the calling thread:
//! concurrency is the number of outstanding connections, and the only
//! blocking call is [`wait_ready`].
//!
//! Rows of one table arrive in scan order; rows of different tables may
//! interleave arbitrarily.

use crate::change::{ChangeMessage, Consumer, Origin};
use crate::connection::{Connect, Fetch, QueryConnection, run_query};
use crate::error::{ExportError, Result};
use crate::logical_replication::Lsn;
use crate::policy::SnapshotPolicy;
use crate::readiness::wait_ready;
use crate::table::{TableDescriptor, quote_literal};
use itertools::Itertools;
use std::cell::Cell;
use std::collections::VecDeque;
use tracing::{debug, info};

/// Statement used to stream one table's rows.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ExportQuery {
    /// Build the insert envelope with `json_build_object` / `row_to_json`.
    #[default]
    RowToJson,
    /// Call a server-side export function `f(relname, relnamespace, only)`.
    Function(String),
}

impl ExportQuery {
    pub fn statement(&self, table: &TableDescriptor) -> String {
        match self {
            ExportQuery::RowToJson => {
                let mut fields = vec![
                    "'command', 'INSERT'".to_string(),
                    "'xid', 0".to_string(),
                    "'dbname', pg_catalog.current_database()".to_string(),
                    format!("'relname', {}", quote_literal(&table.name)),
                    format!("'relnamespace', {}", quote_literal(&table.namespace)),
                ];
                if !table.key.is_empty() {
                    let key = serde_json::Value::from(table.key.clone()).to_string();
                    fields.push(format!("'key', {}::json", quote_literal(&key)));
                }
                fields.push("'newtuple', pg_catalog.row_to_json(t)".to_string());
                format!(
                    "SELECT pg_catalog.json_build_object({})::text FROM {}{} AS t",
                    fields.iter().join(", "),
                    if table.with_descendants { "" } else { "ONLY " },
                    table.quoted()
                )
            }
            ExportQuery::Function(function) => format!(
                "SELECT {function}({}, {}, {})",
                quote_literal(&table.name),
                quote_literal(&table.namespace),
                !table.with_descendants
            ),
        }
    }
}

/// Open a repeatable-read transaction that sees exactly `snapshot`.
pub fn begin_snapshot_sql(snapshot: &str) -> String {
    format!(
        "BEGIN TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY; SET TRANSACTION SNAPSHOT {}",
        quote_literal(snapshot)
    )
}

/// Parameters shared by every export job of one run.
#[derive(Debug, Clone)]
pub struct SnapshotExport<'a> {
    /// Exported snapshot name returned by slot creation.
    pub snapshot: &'a str,
    /// Slot consistent point, stamped on every exported row.
    pub position: Lsn,
    pub max_jobs: usize,
    pub query: &'a ExportQuery,
}

#[derive(Debug)]
pub struct Exported<C> {
    /// The master connection, handed back to the caller.
    pub master: C,
    pub tables: usize,
    pub rows: u64,
    pub connections_opened: usize,
}

#[derive(Debug)]
enum Job {
    Idle,
    /// Handshake in progress; the table is exported once bound.
    Connecting(TableDescriptor),
    /// Snapshot transaction being opened.
    Binding(TableDescriptor),
    Exporting { table: TableDescriptor, rows: u64 },
}

/// Fixed-order connection slots; index 0 is the master connection.
struct Pool<C> {
    conns: Vec<C>,
    jobs: Vec<Job>,
}

impl<C: QueryConnection> Pool<C> {
    fn new(master: C) -> Self {
        Pool {
            conns: vec![master],
            jobs: vec![Job::Idle],
        }
    }

    fn idle(&self) -> Option<usize> {
        self.jobs.iter().position(|job| matches!(job, Job::Idle))
    }

    fn active(&self) -> Vec<usize> {
        self.jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| !matches!(job, Job::Idle))
            .map(|(idx, _)| idx)
            .collect()
    }

    fn active_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|job| !matches!(job, Job::Idle))
            .count()
    }

    fn push(&mut self, conn: C, job: Job) {
        self.conns.push(conn);
        self.jobs.push(job);
    }

    /// Close every connection but the master.
    fn into_master(self) -> Option<C> {
        self.conns.into_iter().next()
    }
}

struct Progress {
    tables: usize,
    rows: u64,
}

/// Export `tables` (filtered by `policy`) under `export.snapshot`, feeding
/// each row to `consumer`. Any error aborts the whole export; the caller is
/// responsible for dropping the slot.
pub fn export_snapshot<K, P, F>(
    connector: &K,
    mut master: K::Query,
    export: &SnapshotExport<'_>,
    tables: Vec<TableDescriptor>,
    policy: &P,
    consumer: &mut F,
) -> Result<Exported<K::Query>>
where
    K: Connect,
    P: SnapshotPolicy + ?Sized,
    F: Consumer + ?Sized,
{
    let max_jobs = export.max_jobs.max(1);
    info!(
        snapshot = export.snapshot,
        position = %export.position,
        max_jobs,
        "exporting tables"
    );
    run_query(&mut master, &begin_snapshot_sql(export.snapshot))?;

    let mut queue: VecDeque<TableDescriptor> = tables.into();
    let mut pool = Pool::new(master);
    let mut progress = Progress { tables: 0, rows: 0 };

    while !queue.is_empty() || pool.active_count() > 0 {
        // Hand out work without blocking.
        while pool.idle().is_some() || pool.active_count() < max_jobs {
            let Some(table) = queue.pop_front() else {
                break;
            };
            if !policy.include(&table) {
                debug!(%table, "table excluded from snapshot");
                continue;
            }
            info!(%table, size = table.approximate_size, "next table");
            match pool.idle() {
                Some(idx) => {
                    debug!(connection = idx, "using an idle connection");
                    pool.conns[idx].send(&export.query.statement(&table))?;
                    pool.jobs[idx] = Job::Exporting { table, rows: 0 };
                }
                None => {
                    info!(
                        connection = pool.active_count() + 1,
                        max_jobs, "making a new connection"
                    );
                    let conn = connector.query()?;
                    pool.push(conn, Job::Connecting(table));
                }
            }
        }

        let active = pool.active();
        if active.is_empty() {
            continue;
        }
        let idx = wait_ready(&mut pool.conns, &active)?;
        step(&mut pool, idx, export, consumer, &mut progress)?;
    }

    let connections_opened = pool.conns.len() - 1;
    let mut master = pool
        .into_master()
        .ok_or_else(|| ExportError::Connection("master connection lost".to_string()))?;
    run_query(&mut master, "COMMIT")?;
    info!(
        tables = progress.tables,
        rows = progress.rows,
        connections_opened,
        "snapshot export finished"
    );
    Ok(Exported {
        master,
        tables: progress.tables,
        rows: progress.rows,
        connections_opened,
    })
}

/// Advance the job on a connection the multiplexer reported ready.
fn step<C, F>(
    pool: &mut Pool<C>,
    idx: usize,
    export: &SnapshotExport<'_>,
    consumer: &mut F,
    progress: &mut Progress,
) -> Result<()>
where
    C: QueryConnection,
    F: Consumer + ?Sized,
{
    let conn = &mut pool.conns[idx];
    let job = std::mem::replace(&mut pool.jobs[idx], Job::Idle);
    pool.jobs[idx] = match job {
        Job::Idle => Job::Idle,
        Job::Connecting(table) => {
            conn.send(&begin_snapshot_sql(export.snapshot))?;
            Job::Binding(table)
        }
        Job::Binding(table) => match conn.fetch()? {
            Fetch::Done => {
                conn.send(&export.query.statement(&table))?;
                Job::Exporting { table, rows: 0 }
            }
            Fetch::Row(_) | Fetch::Pending => Job::Binding(table),
        },
        Job::Exporting { table, rows } => match conn.fetch()? {
            Fetch::Row(row) => {
                let payload = row.get(0).ok_or_else(|| {
                    ExportError::Query(format!("export of {table} returned a NULL row"))
                })?;
                let unused = Cell::new(export.position);
                let message = ChangeMessage::new(
                    export.position,
                    payload.as_bytes(),
                    Origin::Snapshot(&table),
                    &unused,
                );
                consumer.consume(&message).map_err(ExportError::Consumer)?;
                progress.rows += 1;
                Job::Exporting {
                    table,
                    rows: rows + 1,
                }
            }
            Fetch::Pending => Job::Exporting { table, rows },
            Fetch::Done => {
                info!(%table, rows, connection = idx, "table exported");
                progress.tables += 1;
                Job::Idle
            }
        },
    };
    Ok(())
}
