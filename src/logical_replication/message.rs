// Replication protocol frames carried inside CopyData on a streaming connection.

use crate::error::{ExportError, Result};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds between the Unix epoch and the PostgreSQL epoch (2000-01-01).
const PG_EPOCH_OFFSET_SECS: u64 = 946_684_800;

/// A WAL position (log sequence number).
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);
}

impl FromStr for Lsn {
    type Err = ExportError;

    /// Parse the textual `X/Y` form, e.g. `0/16B6C50`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ExportError::Protocol(format!("invalid LSN {s:?}"));
        let (hi, lo) = s.trim().split_once('/').ok_or_else(invalid)?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| invalid())?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| invalid())?;
        Ok(Lsn((u64::from(hi) << 32) | u64::from(lo)))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl From<u64> for Lsn {
    fn from(val: u64) -> Self {
        Lsn(val)
    }
}

#[derive(Debug, PartialEq)]
pub enum ReplicationMessage {
    XLogData(XLogData),
    PrimaryKeepAlive(PrimaryKeepAlive),
}

#[derive(Debug, PartialEq)]
pub struct XLogData {
    pub wal_start: Lsn,
    pub wal_end: Lsn,
    pub timestamp: i64,
    pub data: Vec<u8>,
}

#[derive(Debug, PartialEq)]
pub struct PrimaryKeepAlive {
    pub wal_end: Lsn,
    pub timestamp: i64,
    pub reply_requested: bool,
}

fn be_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(bytes)
}

impl ReplicationMessage {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        match buf.split_first() {
            Some((b'w', body)) if body.len() >= 24 => {
                Ok(ReplicationMessage::XLogData(XLogData {
                    wal_start: Lsn(be_u64(body, 0)),
                    wal_end: Lsn(be_u64(body, 8)),
                    timestamp: be_u64(body, 16) as i64,
                    data: body[24..].to_vec(),
                }))
            }
            Some((b'k', body)) if body.len() >= 17 => {
                Ok(ReplicationMessage::PrimaryKeepAlive(PrimaryKeepAlive {
                    wal_end: Lsn(be_u64(body, 0)),
                    timestamp: be_u64(body, 8) as i64,
                    reply_requested: body[16] != 0,
                }))
            }
            Some((tag, body)) => Err(ExportError::Protocol(format!(
                "unexpected replication message {:?} ({} bytes)",
                *tag as char,
                body.len()
            ))),
            None => Err(ExportError::Protocol("empty replication message".into())),
        }
    }
}

/// Microseconds since the PostgreSQL epoch.
pub fn pg_timestamp(now: SystemTime) -> i64 {
    let since_unix = now.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    let since_pg = since_unix.saturating_sub(Duration::from_secs(PG_EPOCH_OFFSET_SECS));
    since_pg.as_micros() as i64
}

/// Standby status update ('r'): written, flushed and applied positions are
/// all reported as `flushed`.
pub fn standby_status_update(flushed: Lsn, now: SystemTime, reply_requested: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(34);
    buf.push(b'r');
    for _ in 0..3 {
        buf.extend_from_slice(&flushed.0.to_be_bytes());
    }
    buf.extend_from_slice(&pg_timestamp(now).to_be_bytes());
    buf.push(u8::from(reply_requested));
    buf
}
