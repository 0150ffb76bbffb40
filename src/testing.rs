// Scripted stand-ins for the query and replication primitives.

use crate::connection::{Connect, Fetch, Pollable, QueryConnection, Readiness, Row};
use crate::error::{ExportError, Result};
use crate::logical_replication::{
    ChangeStream, Lsn, PrimaryKeepAlive, ReplicationClient, ReplicationMessage, ReplicationSlot,
    XLogData,
};
use crate::snapshot::ExportQuery;
use crate::table::TableDescriptor;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Result of a scripted statement.
#[derive(Debug, Clone)]
pub struct Script {
    rows: Vec<Row>,
    pending: bool,
    error: Option<String>,
}

impl Script {
    pub fn rows(rows: Vec<Vec<Option<&str>>>) -> Self {
        Script {
            rows: rows
                .into_iter()
                .map(|r| Row(r.into_iter().map(|v| v.map(str::to_string)).collect()))
                .collect(),
            pending: false,
            error: None,
        }
    }

    pub fn error(message: &str) -> Self {
        Script {
            rows: Vec::new(),
            pending: false,
            error: Some(message.to_string()),
        }
    }

    /// Interleave a `Fetch::Pending` before every row.
    pub fn with_pending(mut self) -> Self {
        self.pending = true;
        self
    }

    fn steps(&self) -> VecDeque<Step> {
        let mut steps = VecDeque::new();
        for row in &self.rows {
            if self.pending {
                steps.push_back(Step::Pending);
            }
            steps.push_back(Step::Row(row.clone()));
        }
        match &self.error {
            Some(message) => steps.push_back(Step::Fail(message.clone())),
            None => steps.push_back(Step::Done),
        }
        steps
    }
}

#[derive(Debug, Clone)]
enum Step {
    Row(Row),
    Pending,
    Fail(String),
    Done,
}

/// A frame the fake server streams, keyed by its WAL position.
#[derive(Debug, Clone)]
pub enum Frame {
    Data(Lsn, String),
    KeepAlive(Lsn, bool),
}

impl Frame {
    fn lsn(&self) -> Lsn {
        match self {
            Frame::Data(lsn, _) | Frame::KeepAlive(lsn, _) => *lsn,
        }
    }
}

#[derive(Default)]
struct State {
    scripts: HashMap<String, Script>,
    tables: HashMap<String, Vec<Option<String>>>,
    failing_tables: HashMap<String, String>,
    statements: HashMap<usize, Vec<String>>,
    exported: Vec<String>,
    opened: usize,
    closed: usize,
    connection_limit: Option<usize>,
    in_flight: usize,
    max_in_flight: usize,

    slots: HashMap<String, Lsn>,
    dropped: Vec<String>,
    replication_opened: usize,
    starts: Vec<Lsn>,
    status_updates: Vec<Lsn>,
    wal: Vec<Frame>,
    disconnects: VecDeque<usize>,
    failing_starts: usize,
    stop_when_drained: Option<Arc<AtomicBool>>,
}

/// Shared fake data source; implements [`Connect`].
#[derive(Clone, Default)]
pub struct FakeSource {
    state: Rc<RefCell<State>>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, sql: &str, script: Script) {
        self.state
            .borrow_mut()
            .scripts
            .insert(sql.to_string(), script);
    }

    pub fn table(&self, name: &str, rows: Vec<String>) {
        self.table_with_nulls(name, rows.into_iter().map(Some).collect());
    }

    /// Like [`FakeSource::table`], but `None` rows come back as SQL NULL.
    pub fn table_with_nulls(&self, name: &str, rows: Vec<Option<String>>) {
        self.state.borrow_mut().tables.insert(name.to_string(), rows);
    }

    pub fn failing_table(&self, name: &str, message: &str) {
        let mut state = self.state.borrow_mut();
        state.tables.insert(name.to_string(), Vec::new());
        state
            .failing_tables
            .insert(name.to_string(), message.to_string());
    }

    /// Fail every connection attempt once `n` connections have been opened.
    pub fn refuse_connections_after(&self, n: usize) {
        self.state.borrow_mut().connection_limit = Some(n);
    }

    /// An already established connection.
    pub fn open(&self) -> FakeConnection {
        FakeConnection::new(self.state.clone(), true)
    }

    pub fn opened(&self) -> usize {
        self.state.borrow().opened
    }

    pub fn live(&self) -> usize {
        let state = self.state.borrow();
        state.opened - state.closed
    }

    pub fn statements(&self, conn: usize) -> Vec<String> {
        self.state
            .borrow()
            .statements
            .get(&conn)
            .cloned()
            .unwrap_or_default()
    }

    pub fn exported_tables(&self) -> Vec<String> {
        self.state.borrow().exported.clone()
    }

    pub fn max_concurrent_exports(&self) -> usize {
        self.state.borrow().max_in_flight
    }

    pub fn existing_slot(&self, name: &str, confirmed: Lsn) {
        self.state
            .borrow_mut()
            .slots
            .insert(name.to_string(), confirmed);
    }

    pub fn has_slot(&self, name: &str) -> bool {
        self.state.borrow().slots.contains_key(name)
    }

    pub fn dropped_slots(&self) -> Vec<String> {
        self.state.borrow().dropped.clone()
    }

    pub fn replication_opened(&self) -> usize {
        self.state.borrow().replication_opened
    }

    pub fn starts(&self) -> Vec<Lsn> {
        self.state.borrow().starts.clone()
    }

    pub fn status_updates(&self) -> Vec<Lsn> {
        self.state.borrow().status_updates.clone()
    }

    pub fn push_frame(&self, frame: Frame) {
        self.state.borrow_mut().wal.push(frame);
    }

    /// Break the next stream session after it delivered `n` frames.
    pub fn disconnect_after(&self, n: usize) {
        self.state.borrow_mut().disconnects.push_back(n);
    }

    pub fn fail_starts(&self, n: usize) {
        self.state.borrow_mut().failing_starts = n;
    }

    pub fn stop_when_drained(&self, flag: Arc<AtomicBool>) {
        self.state.borrow_mut().stop_when_drained = Some(flag);
    }

    pub fn remove_slot(&self, name: &str) {
        self.state.borrow_mut().slots.remove(name);
    }
}

impl Connect for FakeSource {
    type Query = FakeConnection;
    type Replication = FakeReplication;

    fn query(&self) -> Result<FakeConnection> {
        let state = self.state.borrow();
        if state
            .connection_limit
            .is_some_and(|limit| state.opened >= limit)
        {
            return Err(ExportError::Connection("too many clients already".into()));
        }
        drop(state);
        Ok(FakeConnection::new(self.state.clone(), false))
    }

    fn replication(&self) -> Result<FakeReplication> {
        Ok(FakeReplication::new(self))
    }
}

pub struct FakeConnection {
    id: usize,
    state: Rc<RefCell<State>>,
    connected: bool,
    polls: usize,
    steps: VecDeque<Step>,
    export: Option<String>,
    socket: UnixStream,
    _peer: UnixStream,
}

impl FakeConnection {
    fn new(state: Rc<RefCell<State>>, connected: bool) -> Self {
        let (socket, mut peer) = UnixStream::pair().expect("socket pair");
        // Keep the socket readable and writable so OS waits return at once.
        peer.write_all(b"!").expect("prime socket");
        let id = {
            let mut s = state.borrow_mut();
            s.opened += 1;
            s.opened - 1
        };
        FakeConnection {
            id,
            state,
            connected,
            polls: 0,
            steps: VecDeque::new(),
            export: None,
            socket,
            _peer: peer,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    fn export_target(&self, sql: &str) -> Option<String> {
        let state = self.state.borrow();
        state
            .tables
            .keys()
            .find(|name| {
                let table: TableDescriptor = name.parse().unwrap();
                sql.ends_with(&format!("{} AS t", table.quoted()))
                    || sql == ExportQuery::Function("export_json".into()).statement(&table)
            })
            .cloned()
    }
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        self.state.borrow_mut().closed += 1;
    }
}

impl Pollable for FakeConnection {
    fn poll(&mut self) -> Result<Readiness> {
        self.polls += 1;
        // Alternate so the multiplexer exercises its OS wait and rotates.
        if self.polls % 2 == 1 {
            return Ok(if self.connected {
                Readiness::Read
            } else {
                Readiness::Write
            });
        }
        self.connected = true;
        Ok(Readiness::Ready)
    }

    fn socket(&self) -> Result<RawFd> {
        Ok(self.socket.as_raw_fd())
    }
}

impl QueryConnection for FakeConnection {
    fn send(&mut self, sql: &str) -> Result<()> {
        if !self.connected {
            return Err(ExportError::Query("connection not established".into()));
        }
        if !self.steps.is_empty() {
            return Err(ExportError::Query("another statement is in progress".into()));
        }
        let mut state = self.state.borrow_mut();
        state
            .statements
            .entry(self.id)
            .or_default()
            .push(sql.to_string());
        if let Some(script) = state.scripts.get(sql) {
            self.steps = script.steps();
            return Ok(());
        }
        if sql.starts_with("BEGIN") || sql == "COMMIT" {
            self.steps = VecDeque::from([Step::Done]);
            return Ok(());
        }
        drop(state);
        let Some(table) = self.export_target(sql) else {
            return Err(ExportError::Query(format!("unexpected statement: {sql}")));
        };
        let mut state = self.state.borrow_mut();
        state.exported.push(table.clone());
        state.in_flight += 1;
        state.max_in_flight = state.max_in_flight.max(state.in_flight);
        self.steps = match state.failing_tables.get(&table) {
            Some(message) => VecDeque::from([Step::Fail(message.clone())]),
            None => state.tables[&table]
                .iter()
                .map(|payload| Step::Row(Row(vec![payload.clone()])))
                .chain([Step::Done])
                .collect(),
        };
        self.export = Some(table);
        Ok(())
    }

    fn fetch(&mut self) -> Result<Fetch> {
        match self.steps.pop_front() {
            Some(Step::Row(row)) => Ok(Fetch::Row(row)),
            Some(Step::Pending) => Ok(Fetch::Pending),
            Some(Step::Fail(message)) => Err(ExportError::Query(message)),
            Some(Step::Done) | None => {
                if self.export.take().is_some() {
                    self.state.borrow_mut().in_flight -= 1;
                }
                Ok(Fetch::Done)
            }
        }
    }
}

pub struct FakeReplication {
    state: Rc<RefCell<State>>,
}

impl FakeReplication {
    pub fn new(source: &FakeSource) -> Self {
        source.state.borrow_mut().replication_opened += 1;
        FakeReplication {
            state: source.state.clone(),
        }
    }
}

impl ReplicationClient for FakeReplication {
    type Stream = FakeStream;

    fn create_slot(&mut self, name: &str, plugin: &str) -> Result<ReplicationSlot> {
        let mut state = self.state.borrow_mut();
        if state.slots.contains_key(name) {
            return Err(ExportError::SlotCreation {
                slot: name.to_string(),
                reason: "already exists".into(),
            });
        }
        let consistent_point = Lsn(100);
        state.slots.insert(name.to_string(), consistent_point);
        Ok(ReplicationSlot {
            name: name.to_string(),
            resume_position: consistent_point,
            snapshot: Some("00000003-00000002-1".into()),
            plugin: plugin.to_string(),
        })
    }

    fn drop_slot(&mut self, name: &str) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.slots.remove(name).is_none() {
            return Err(ExportError::Query(format!("slot {name} does not exist")));
        }
        state.dropped.push(name.to_string());
        Ok(())
    }

    fn start_replication(
        self,
        slot: &str,
        from: Lsn,
        _options: &[(String, String)],
    ) -> Result<FakeStream> {
        let mut state = self.state.borrow_mut();
        state.starts.push(from);
        let Some(&confirmed) = state.slots.get(slot) else {
            return Err(ExportError::SlotDoesNotExist(slot.to_string()));
        };
        if state.failing_starts > 0 {
            state.failing_starts -= 1;
            return Err(ExportError::Connection("connection refused".into()));
        }
        let start = from.max(confirmed);
        let pending = state
            .wal
            .iter()
            .filter(|frame| frame.lsn() > start)
            .cloned()
            .collect();
        let budget = state.disconnects.pop_front();
        drop(state);
        Ok(FakeStream {
            state: self.state.clone(),
            slot: slot.to_string(),
            pending,
            budget,
        })
    }
}

pub struct FakeStream {
    state: Rc<RefCell<State>>,
    slot: String,
    pending: VecDeque<Frame>,
    budget: Option<usize>,
}

impl ChangeStream for FakeStream {
    fn recv(&mut self, _timeout: Duration) -> Result<Option<ReplicationMessage>> {
        if self.budget == Some(0) {
            return Err(ExportError::Connection("server closed the connection".into()));
        }
        let Some(frame) = self.pending.pop_front() else {
            if let Some(flag) = &self.state.borrow().stop_when_drained {
                flag.store(true, Ordering::SeqCst);
            }
            return Ok(None);
        };
        if let Some(budget) = self.budget.as_mut() {
            *budget -= 1;
        }
        Ok(Some(match frame {
            Frame::Data(lsn, payload) => ReplicationMessage::XLogData(XLogData {
                wal_start: lsn,
                wal_end: lsn,
                timestamp: 0,
                data: payload.into_bytes(),
            }),
            Frame::KeepAlive(lsn, reply_requested) => {
                ReplicationMessage::PrimaryKeepAlive(PrimaryKeepAlive {
                    wal_end: lsn,
                    timestamp: 0,
                    reply_requested,
                })
            }
        }))
    }

    fn send_status(&mut self, flushed: Lsn) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.status_updates.push(flushed);
        if let Some(confirmed) = state.slots.get_mut(&self.slot) {
            *confirmed = (*confirmed).max(flushed);
        }
        Ok(())
    }
}
