//! Messages delivered to the application and the consumer contract.

use crate::logical_replication::Lsn;
use crate::table::TableDescriptor;
use std::cell::Cell;

/// Where a message came from.
#[derive(Debug, Clone, Copy)]
pub enum Origin<'a> {
    /// A row of the initial snapshot of `table`.
    Snapshot(&'a TableDescriptor),
    /// A change read from the replication slot.
    Stream,
}

/// One unit of output: an exported row or a decoded change.
#[derive(Debug)]
pub struct ChangeMessage<'a> {
    /// End position of the message in the source's log. Snapshot rows carry
    /// the slot's consistent point.
    pub position: Lsn,
    pub payload: &'a [u8],
    pub origin: Origin<'a>,
    flushed: &'a Cell<Lsn>,
}

impl<'a> ChangeMessage<'a> {
    pub(crate) fn new(
        position: Lsn,
        payload: &'a [u8],
        origin: Origin<'a>,
        flushed: &'a Cell<Lsn>,
    ) -> Self {
        ChangeMessage {
            position,
            payload,
            origin,
            flushed,
        }
    }

    /// Declare everything up to and including this message durably
    /// processed, letting the source discard older log. Has no effect on
    /// snapshot rows.
    pub fn acknowledge(&self) {
        if self.position > self.flushed.get() {
            self.flushed.set(self.position);
        }
    }

    pub fn payload_str(&self) -> std::borrow::Cow<'a, str> {
        String::from_utf8_lossy(self.payload)
    }

    pub fn payload_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_slice(self.payload)
    }
}

/// Receives every message exactly once, synchronously. Returning an error
/// aborts the running export or stream.
pub trait Consumer {
    fn consume(&mut self, message: &ChangeMessage<'_>) -> anyhow::Result<()>;
}

impl<F> Consumer for F
where
    F: FnMut(&ChangeMessage<'_>) -> anyhow::Result<()>,
{
    fn consume(&mut self, message: &ChangeMessage<'_>) -> anyhow::Result<()> {
        self(message)
    }
}
