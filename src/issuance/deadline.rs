//! Bounded calls into blocking backends.
//!
//! The call runs on a helper thread; the caller stops waiting at the
//! deadline. A late result is dropped with the channel and never committed.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Why a bounded call produced no result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadlineError {
    Elapsed,
    Spawn(String),
    Panicked,
}

/// Run `f` on a helper thread and wait at most `timeout` for its result.
pub fn run_with_deadline<T, F>(name: &str, timeout: Duration, f: F) -> Result<T, DeadlineError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name(format!("devtrust-{}", name))
        .spawn(move || {
            let _ = tx.send(f());
        })
        .map_err(|e| DeadlineError::Spawn(e.to_string()))?;

    rx.recv_timeout(timeout).map_err(|e| match e {
        mpsc::RecvTimeoutError::Timeout => DeadlineError::Elapsed,
        mpsc::RecvTimeoutError::Disconnected => DeadlineError::Panicked,
    })
}
