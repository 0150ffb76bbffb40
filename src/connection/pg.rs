// libpq-backed query primitive.

use super::{Connect, Fetch, Pollable, QueryConnection, Readiness, Row, RowBuffer};
use crate::error::{ExportError, Result};
use crate::logical_replication::PgReplication;
use std::os::fd::RawFd;
use tracing::debug;

/// Connects both kinds of connections to the same DSN.
#[derive(Clone, Debug)]
pub struct PgConnector {
    dsn: String,
}

impl PgConnector {
    pub fn new(dsn: &str) -> Self {
        PgConnector {
            dsn: dsn.to_string(),
        }
    }

    pub fn dsn(&self) -> &str {
        &self.dsn
    }
}

impl Connect for PgConnector {
    type Query = PgConnection;
    type Replication = PgReplication;

    fn query(&self) -> Result<PgConnection> {
        PgConnection::start(&self.dsn)
    }

    fn replication(&self) -> Result<PgReplication> {
        PgReplication::connect(&self.dsn)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Idle,
    Busy,
}

/// A libpq connection in non-blocking mode. Statements run in single-row
/// mode so large result sets are streamed instead of buffered.
pub struct PgConnection {
    conn: libpq::Connection,
    phase: Phase,
    rows: RowBuffer,
}

impl PgConnection {
    /// Begin connecting without blocking; drive with `poll()`.
    pub fn start(dsn: &str) -> Result<Self> {
        let conn = libpq::Connection::start(dsn)
            .map_err(|e| ExportError::Connection(format!("{e:?}")))?;
        Ok(PgConnection {
            conn,
            phase: Phase::Connecting,
            rows: RowBuffer::default(),
        })
    }

    fn last_error(&self) -> String {
        self.conn
            .error_message()
            .unwrap_or("unknown error")
            .trim()
            .to_string()
    }

    fn poll_connect(&mut self) -> Result<Readiness> {
        match self.conn.poll() {
            libpq::poll::Status::Reading | libpq::poll::Status::Active => Ok(Readiness::Read),
            libpq::poll::Status::Writing => Ok(Readiness::Write),
            libpq::poll::Status::Ok => {
                self.conn
                    .set_non_blocking(true)
                    .map_err(|e| ExportError::Connection(format!("{e:?}")))?;
                self.phase = Phase::Idle;
                debug!("connection established");
                Ok(Readiness::Ready)
            }
            libpq::poll::Status::Failed => Err(ExportError::Connection(self.last_error())),
        }
    }

    fn poll_busy(&mut self) -> Result<Readiness> {
        if !self.rows.is_empty() {
            return Ok(Readiness::Ready);
        }
        if self.conn.flush().is_err() {
            let broken = self.conn.status() == libpq::connection::Status::Bad;
            return unsent_output(broken, || self.last_error());
        }
        self.conn
            .consume_input()
            .map_err(|_| ExportError::Connection(self.last_error()))?;
        if self.conn.is_busy() {
            Ok(Readiness::Read)
        } else {
            Ok(Readiness::Ready)
        }
    }
}

/// A failed flush means either output is still queued in libpq or the
/// connection broke; only the connection status tells them apart.
fn unsent_output(broken: bool, message: impl FnOnce() -> String) -> Result<Readiness> {
    if broken {
        Err(ExportError::Connection(message()))
    } else {
        Ok(Readiness::Write)
    }
}

impl Pollable for PgConnection {
    fn poll(&mut self) -> Result<Readiness> {
        match self.phase {
            Phase::Connecting => self.poll_connect(),
            Phase::Idle => Ok(Readiness::Ready),
            Phase::Busy => self.poll_busy(),
        }
    }

    fn socket(&self) -> Result<RawFd> {
        self.conn
            .socket()
            .map_err(|_| ExportError::Connection(self.last_error()))
    }
}

impl QueryConnection for PgConnection {
    fn send(&mut self, sql: &str) -> Result<()> {
        if self.phase != Phase::Idle {
            return Err(ExportError::Query(
                "connection is not idle, cannot send a new statement".to_string(),
            ));
        }
        self.conn
            .send_query(sql)
            .map_err(|_| ExportError::Query(self.last_error()))?;
        // Single-row mode only applies to statements returning rows; failure
        // here means the statement was not accepted.
        self.conn
            .set_single_row_mode()
            .map_err(|_| ExportError::Query(self.last_error()))?;
        self.phase = Phase::Busy;
        Ok(())
    }

    fn fetch(&mut self) -> Result<Fetch> {
        loop {
            if let Some(row) = self.rows.pop() {
                return Ok(Fetch::Row(row));
            }
            if self.phase != Phase::Busy {
                return Ok(Fetch::Done);
            }
            if self.conn.is_busy() {
                return Ok(Fetch::Pending);
            }
            let Some(result) = self.conn.result() else {
                self.phase = Phase::Idle;
                return Ok(Fetch::Done);
            };
            match result.status() {
                libpq::Status::SingleTuple | libpq::Status::TuplesOk => {
                    for tuple in 0..result.ntuples() {
                        let row = (0..result.nfields())
                            .map(|field| {
                                result
                                    .value(tuple, field)
                                    .map(|v| String::from_utf8_lossy(v).into_owned())
                            })
                            .collect();
                        self.rows.push(Row(row));
                    }
                }
                libpq::Status::CommandOk | libpq::Status::EmptyQuery => {}
                status => {
                    let message = self.last_error();
                    return Err(ExportError::Query(format!("{status:?}: {message}")));
                }
            }
        }
    }
}
