// JSON-lines output for the command line client.

use crate::change::{ChangeMessage, Consumer};
use anyhow::Context;
use serde_json::Value;
use std::io::Write;

/// Writes one payload per line and acknowledges once a transaction has been
/// written out completely.
pub struct JsonLinesWriter<W: Write> {
    out: W,
    written: u64,
}

impl<W: Write> JsonLinesWriter<W> {
    pub fn new(out: W) -> Self {
        JsonLinesWriter { out, written: 0 }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Consumer for JsonLinesWriter<W> {
    fn consume(&mut self, message: &ChangeMessage<'_>) -> anyhow::Result<()> {
        let payload = message.payload.trim_ascii_end();
        self.out
            .write_all(payload)
            .and_then(|()| self.out.write_all(b"\n"))
            .context("failed to write change")?;
        self.written += 1;
        if ends_transaction(payload) {
            self.out.flush().context("failed to flush output")?;
            message.acknowledge();
        }
        Ok(())
    }
}

/// Whether `payload` is the last message of a transaction for the output
/// formats this client understands.
pub fn ends_transaction(payload: &[u8]) -> bool {
    // test_decoding: "COMMIT 1234"
    if payload.starts_with(b"COMMIT") {
        return true;
    }
    let Ok(Value::Object(obj)) = serde_json::from_slice::<Value>(payload) else {
        return false;
    };
    // wal2json format-version 1 writes the whole transaction as one object.
    obj.contains_key("change")
        || obj.get("command").and_then(Value::as_str) == Some("COMMIT")
        || obj.get("action").and_then(Value::as_str) == Some("C")
}
