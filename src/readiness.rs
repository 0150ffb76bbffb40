//! Readiness multiplexer.
//!
//! The only place the process blocks while exporting: every other component
//! suspends by calling [`wait_ready`] (or [`wait_socket`] for the replication
//! stream, which needs a bounded wait so shutdown can be observed).

use crate::connection::{Pollable, Readiness};
use crate::error::{ExportError, Result};
use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};
use tracing::warn;

/// Block until one of `conns[i]` for `i` in `candidates` is ready and return
/// that index. No fairness between ties: the first ready candidate wins.
pub fn wait_ready<C: Pollable>(conns: &mut [C], candidates: &[usize]) -> Result<usize> {
    if candidates.is_empty() {
        return Err(ExportError::Config(
            "wait_ready needs at least one connection".to_string(),
        ));
    }
    let mut fds = Vec::with_capacity(candidates.len());
    loop {
        fds.clear();
        for &idx in candidates {
            let conn = &mut conns[idx];
            let events = match conn.poll()? {
                Readiness::Ready => return Ok(idx),
                Readiness::Read => libc::POLLIN,
                Readiness::Write => libc::POLLOUT,
            };
            fds.push(libc::pollfd {
                fd: conn.socket()?,
                events,
                revents: 0,
            });
        }
        // Interrupted waits just re-poll.
        poll_fds(&mut fds, None)?;
    }
}

/// Wait up to `timeout` for `fd` to satisfy `interest`. Returns `false` on timeout.
pub fn wait_socket(fd: RawFd, interest: Readiness, timeout: Duration) -> Result<bool> {
    let events = match interest {
        Readiness::Ready => return Ok(true),
        Readiness::Read => libc::POLLIN,
        Readiness::Write => libc::POLLOUT,
    };
    let deadline = Instant::now() + timeout;
    let mut fds = [libc::pollfd {
        fd,
        events,
        revents: 0,
    }];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match poll_fds(&mut fds, Some(remaining))? {
            Some(n) => return Ok(n > 0),
            None if remaining.is_zero() => return Ok(false),
            None => continue,
        }
    }
}

/// One `poll(2)` call. `Ok(None)` means the wait was interrupted by a signal.
fn poll_fds(fds: &mut [libc::pollfd], timeout: Option<Duration>) -> Result<Option<usize>> {
    let timeout_ms = match timeout {
        None => -1,
        Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
    };
    // SAFETY: `fds` is an exclusively borrowed slice of `pollfd` and its length
    // is passed alongside, so the kernel only writes `revents` inside it.
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if rc >= 0 {
        return Ok(Some(rc as usize));
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::Interrupted {
        warn!(error = %err, "readiness wait interrupted, retrying");
        return Ok(None);
    }
    Err(err.into())
}
