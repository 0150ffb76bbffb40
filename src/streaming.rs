// Change streaming with reconnect and acknowledgement bookkeeping.

use crate::change::{ChangeMessage, Consumer, Origin};
use crate::connection::Connect;
use crate::error::{ExportError, Result};
use crate::logical_replication::{ChangeStream, Lsn, ReplicationClient, ReplicationMessage};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Pause between a lost stream and the next attempt.
    pub reconnect_delay: Duration,
    /// Maximum time between standby status updates.
    pub status_interval: Duration,
    /// Longest single wait for data; bounds how late shutdown is noticed.
    pub poll_interval: Duration,
    pub plugin_options: Vec<(String, String)>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        StreamOptions {
            reconnect_delay: Duration::from_secs(10),
            status_interval: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
            plugin_options: Vec::new(),
        }
    }
}

/// Stream decoded changes from `slot` into `consumer` until `shutdown` is
/// set. Lost connections are retried after `reconnect_delay`, resuming from
/// the last acknowledged position. `initial` is used for the first attempt
/// when given. Returns the last acknowledged position.
pub fn stream_changes<K, F>(
    connector: &K,
    initial: Option<K::Replication>,
    slot: &str,
    resume: Lsn,
    consumer: &mut F,
    options: &StreamOptions,
    shutdown: &AtomicBool,
) -> Result<Lsn>
where
    K: Connect,
    F: Consumer + ?Sized,
{
    let mut acknowledged = resume;
    let mut initial = initial;
    info!(slot, %resume, "streaming changes");
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        let conn = match initial.take() {
            Some(conn) => Ok(conn),
            None => connector.replication(),
        };
        let attempt = conn
            .and_then(|conn| conn.start_replication(slot, acknowledged, &options.plugin_options))
            .and_then(|mut stream| {
                run_session(&mut stream, &mut *consumer, options, shutdown, &mut acknowledged)
            });
        match attempt {
            Ok(()) => break,
            Err(e) if e.is_transient() => {
                warn!(
                    slot,
                    error = %e,
                    resume = %acknowledged,
                    delay = ?options.reconnect_delay,
                    "replication stream lost, reconnecting"
                );
                sleep_unless_shutdown(options.reconnect_delay, shutdown);
            }
            Err(e) => return Err(e),
        }
    }
    info!(slot, acknowledged = %acknowledged, "streaming stopped");
    Ok(acknowledged)
}

/// Pump one connected stream. Returns `Ok` only when shutdown was requested.
fn run_session<S, F>(
    stream: &mut S,
    consumer: &mut F,
    options: &StreamOptions,
    shutdown: &AtomicBool,
    acknowledged: &mut Lsn,
) -> Result<()>
where
    S: ChangeStream,
    F: Consumer + ?Sized,
{
    let mut last_status = Instant::now();
    while !shutdown.load(Ordering::Relaxed) {
        match stream.recv(options.poll_interval)? {
            Some(ReplicationMessage::XLogData(xlog)) => {
                let flushed = Cell::new(*acknowledged);
                let message =
                    ChangeMessage::new(xlog.wal_start, &xlog.data, Origin::Stream, &flushed);
                consumer.consume(&message).map_err(ExportError::Consumer)?;
                if flushed.get() > *acknowledged {
                    *acknowledged = flushed.get();
                    stream.send_status(*acknowledged)?;
                    last_status = Instant::now();
                }
            }
            Some(ReplicationMessage::PrimaryKeepAlive(keepalive)) => {
                debug!(
                    wal_end = %keepalive.wal_end,
                    reply_requested = keepalive.reply_requested,
                    "keepalive"
                );
                if keepalive.reply_requested {
                    stream.send_status(*acknowledged)?;
                    last_status = Instant::now();
                }
            }
            None => {}
        }
        if last_status.elapsed() >= options.status_interval {
            stream.send_status(*acknowledged)?;
            last_status = Instant::now();
        }
    }
    Ok(())
}

fn sleep_unless_shutdown(delay: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + delay;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() || shutdown.load(Ordering::Relaxed) {
            return;
        }
        thread::sleep(remaining.min(Duration::from_millis(100)));
    }
}
