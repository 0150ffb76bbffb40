// Query primitive: non-blocking connections driven by the readiness multiplexer.

pub mod pg;

pub use pg::{PgConnection, PgConnector};

use crate::error::Result;
use crate::logical_replication::ReplicationClient;
use std::collections::VecDeque;
use std::os::fd::RawFd;

/// What a non-blocking connection needs before it can make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A result (or the established connection) can be consumed without blocking.
    Ready,
    /// Waiting for the socket to become readable.
    Read,
    /// Waiting for the socket to become writable.
    Write,
}

/// Anything the readiness multiplexer can wait on.
pub trait Pollable {
    /// Advance internal state without blocking and report readiness.
    fn poll(&mut self) -> Result<Readiness>;
    fn socket(&self) -> Result<RawFd>;
}

/// One result row, all columns in text format.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Row(pub Vec<Option<String>>);

impl Row {
    pub fn get(&self, column: usize) -> Option<&str> {
        self.0.get(column).and_then(|v| v.as_deref())
    }
}

/// Outcome of a single non-blocking fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetch {
    Row(Row),
    /// More input is needed; wait for readiness again.
    Pending,
    /// The statement finished and the connection accepts a new one.
    Done,
}

pub trait QueryConnection: Pollable {
    /// Dispatch `sql` without waiting for its results.
    fn send(&mut self, sql: &str) -> Result<()>;
    /// Fetch the next row of the running statement. Only valid after
    /// `poll()` reported `Readiness::Ready`.
    fn fetch(&mut self) -> Result<Fetch>;
}

/// Opens connections to one data source.
pub trait Connect {
    type Query: QueryConnection;
    type Replication: ReplicationClient;

    /// Start a non-blocking connection; it is usable once `poll()` reports ready.
    fn query(&self) -> Result<Self::Query>;
    fn replication(&self) -> Result<Self::Replication>;
}

/// Run `sql` to completion on a single connection, suspending only in the
/// readiness multiplexer.
pub fn run_query<C: QueryConnection>(conn: &mut C, sql: &str) -> Result<Vec<Row>> {
    wait_until_ready(conn)?;
    conn.send(sql)?;
    let mut rows = Vec::new();
    loop {
        wait_until_ready(conn)?;
        match conn.fetch()? {
            Fetch::Row(row) => rows.push(row),
            Fetch::Pending => continue,
            Fetch::Done => return Ok(rows),
        }
    }
}

fn wait_until_ready<C: Pollable>(conn: &mut C) -> Result<()> {
    crate::readiness::wait_ready(std::slice::from_mut(conn), &[0])?;
    Ok(())
}

/// Buffer of rows decoded from one result set, drained one `fetch` at a time.
#[derive(Debug, Default)]
pub(crate) struct RowBuffer(VecDeque<Row>);

impl RowBuffer {
    pub(crate) fn push(&mut self, row: Row) {
        self.0.push_back(row);
    }

    pub(crate) fn pop(&mut self) -> Option<Row> {
        self.0.pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
