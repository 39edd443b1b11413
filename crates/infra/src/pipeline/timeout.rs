use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeoutError {
    #[error("operation timed out after {0:?}")]
    Elapsed(Duration),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
}

/// Run `f` on a helper thread and wait at most `limit` for its result.
///
/// On expiry the helper keeps running detached; its result is dropped.
pub fn run_with_timeout<T, F>(limit: Duration, f: F) -> Result<T, TimeoutError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    thread::Builder::new()
        .name("signalhub-timeout".to_string())
        .spawn(move || {
            let _ = tx.send(f());
        })
        .map_err(|e| TimeoutError::Spawn(e.to_string()))?;

    match rx.recv_timeout(limit) {
        Ok(value) => Ok(value),
        Err(mpsc::RecvTimeoutError::Timeout) => Err(TimeoutError::Elapsed(limit)),
        // The helper panicked before sending.
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            Err(TimeoutError::Spawn("worker thread exited without a result".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_fast_results() {
        assert_eq!(run_with_timeout(Duration::from_secs(1), || 7), Ok(7));
    }

    #[test]
    fn expires_slow_work() {
        let result = run_with_timeout(Duration::from_millis(20), || {
            thread::sleep(Duration::from_millis(500));
            1
        });
        assert_eq!(result, Err(TimeoutError::Elapsed(Duration::from_millis(20))));
    }
}
