// Replication primitive: slot commands and the CopyBoth change stream.

use super::message::{Lsn, ReplicationMessage, standby_status_update};
use super::slot::ReplicationSlot;
use crate::connection::Readiness;
use crate::error::{ExportError, Result};
use crate::readiness::wait_socket;
use crate::table::{option_list, quote_ident};
use std::time::{Duration, Instant, SystemTime};
use tracing::debug;

/// A connection speaking the replication protocol.
pub trait ReplicationClient {
    type Stream: ChangeStream;

    fn create_slot(&mut self, name: &str, plugin: &str) -> Result<ReplicationSlot>;
    fn drop_slot(&mut self, name: &str) -> Result<()>;
    /// Turn the connection into a change stream starting at `from`.
    fn start_replication(
        self,
        slot: &str,
        from: Lsn,
        options: &[(String, String)],
    ) -> Result<Self::Stream>
    where
        Self: Sized;
}

pub trait ChangeStream {
    /// Next protocol frame, or `None` if nothing arrived within `timeout`.
    fn recv(&mut self, timeout: Duration) -> Result<Option<ReplicationMessage>>;
    /// Report `flushed` as durably processed.
    fn send_status(&mut self, flushed: Lsn) -> Result<()>;
}

pub struct PgReplication {
    conn: libpq::Connection,
}

fn last_error(conn: &libpq::Connection) -> String {
    conn.error_message()
        .unwrap_or("unknown error")
        .trim()
        .to_string()
}

fn column(result: &libpq::PQResult, field: usize) -> Option<String> {
    result
        .value(0, field)
        .map(|v| String::from_utf8_lossy(v).into_owned())
}

impl PgReplication {
    pub fn connect(conninfo: &str) -> Result<Self> {
        let conninfo = with_replication_param(conninfo);
        let conn = libpq::Connection::new(&conninfo)
            .map_err(|e| ExportError::Connection(format!("{e:?}")))?;
        Ok(PgReplication { conn })
    }
}

impl ReplicationClient for PgReplication {
    type Stream = LogicalReplicationStream;

    fn create_slot(&mut self, name: &str, plugin: &str) -> Result<ReplicationSlot> {
        let command = format!(
            "CREATE_REPLICATION_SLOT {} LOGICAL {}",
            quote_ident(name),
            quote_ident(plugin)
        );
        let res = self.conn.exec(&command);
        if res.status() != libpq::Status::TuplesOk || res.ntuples() != 1 {
            return Err(ExportError::SlotCreation {
                slot: name.to_string(),
                reason: last_error(&self.conn),
            });
        }
        let consistent_point = column(&res, 1).ok_or_else(|| ExportError::SlotCreation {
            slot: name.to_string(),
            reason: "server returned no consistent point".to_string(),
        })?;
        Ok(ReplicationSlot {
            name: column(&res, 0).unwrap_or_else(|| name.to_string()),
            resume_position: consistent_point.parse()?,
            snapshot: column(&res, 2),
            plugin: column(&res, 3).unwrap_or_else(|| plugin.to_string()),
        })
    }

    fn drop_slot(&mut self, name: &str) -> Result<()> {
        let res = self
            .conn
            .exec(&format!("DROP_REPLICATION_SLOT {}", quote_ident(name)));
        if res.status() != libpq::Status::CommandOk {
            return Err(ExportError::Query(last_error(&self.conn)));
        }
        Ok(())
    }

    fn start_replication(
        self,
        slot: &str,
        from: Lsn,
        options: &[(String, String)],
    ) -> Result<LogicalReplicationStream> {
        let command = format!(
            "START_REPLICATION SLOT {} LOGICAL {}{}",
            quote_ident(slot),
            from,
            option_list(options)
        );
        let res = self.conn.exec(&command);
        if res.status() != libpq::Status::CopyBoth {
            let message = last_error(&self.conn);
            if message.contains("does not exist") {
                return Err(ExportError::SlotDoesNotExist(slot.to_string()));
            }
            return Err(ExportError::Connection(format!(
                "failed to start replication: status {:?}, error: {message}",
                res.status()
            )));
        }
        debug!(%slot, %from, "replication stream started");
        Ok(LogicalReplicationStream {
            conn: self.conn,
            slot_name: slot.to_string(),
        })
    }
}

/// A started CopyBoth stream. Reads never block longer than asked.
pub struct LogicalReplicationStream {
    conn: libpq::Connection,
    slot_name: String,
}

impl LogicalReplicationStream {
    pub fn slot_name(&self) -> &str {
        &self.slot_name
    }

    fn buffered(&mut self) -> Result<Option<ReplicationMessage>> {
        match self.conn.copy_data(true) {
            Ok(buf) if !buf.is_empty() => ReplicationMessage::parse(&buf).map(Some),
            _ => Ok(None),
        }
    }

    /// Errors once the server has left copy mode or the connection dropped.
    fn ensure_streaming(&mut self) -> Result<()> {
        if self.conn.is_busy() {
            return Ok(());
        }
        match self.conn.result() {
            Some(res) if res.status() != libpq::Status::CopyBoth => {
                Err(ExportError::Connection(format!(
                    "replication stream ended: status {:?}, error: {}",
                    res.status(),
                    last_error(&self.conn)
                )))
            }
            _ => Ok(()),
        }
    }
}

impl ChangeStream for LogicalReplicationStream {
    fn recv(&mut self, timeout: Duration) -> Result<Option<ReplicationMessage>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(msg) = self.buffered()? {
                return Ok(Some(msg));
            }
            self.ensure_streaming()?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let fd = self
                .conn
                .socket()
                .map_err(|_| ExportError::Connection(last_error(&self.conn)))?;
            if wait_socket(fd, Readiness::Read, remaining)? {
                self.conn
                    .consume_input()
                    .map_err(|_| ExportError::Connection(last_error(&self.conn)))?;
            }
        }
    }

    fn send_status(&mut self, flushed: Lsn) -> Result<()> {
        let buf = standby_status_update(flushed, SystemTime::now(), false);
        self.conn
            .put_copy_data(&buf)
            .map_err(|_| ExportError::Connection(last_error(&self.conn)))?;
        self.conn
            .flush()
            .map_err(|_| ExportError::Connection(last_error(&self.conn)))?;
        debug!(slot = %self.slot_name, %flushed, "sent standby status update");
        Ok(())
    }
}

fn with_replication_param(conninfo: &str) -> String {
    let mut conninfo = conninfo.trim().to_string();
    if !conninfo.contains("replication=") {
        if conninfo.starts_with("postgres://") || conninfo.starts_with("postgresql://") {
            if conninfo.contains('?') {
                conninfo.push_str("&replication=database");
            } else {
                conninfo.push_str("?replication=database");
            }
        } else {
            if !conninfo.is_empty() && !conninfo.ends_with(' ') {
                conninfo.push(' ');
            }
            conninfo.push_str("replication=database");
        }
    }
    conninfo
}
