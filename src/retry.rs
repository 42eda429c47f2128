//! Fixed-backoff retry shared by the HTTP sender and the database driver.
//!
//! The schedule is three attempts with delays of 1, 3 and 5 seconds after
//! the first, second and third failures. Only transient errors are retried;
//! everything else returns to the caller on first failure. When all attempts
//! fail the last observed error is propagated -- never a silent default.

use crate::error::Error;
use std::thread;
use std::time::Duration;

/// The shared backoff schedule, in seconds.
pub const RETRY_DELAYS_SECS: [u64; 3] = [1, 3, 5];

/// Run `op` under the fixed backoff schedule.
///
/// # Examples
///
/// ```
/// use ingot::error::Error;
/// use ingot::retry::retry;
///
/// let mut calls = 0;
/// let res: Result<u32, Error> = retry("demo", || {
///     calls += 1;
///     Ok(calls)
/// });
/// assert_eq!(res.unwrap(), 1);
/// ```
pub fn retry<T, F>(what: &str, mut op: F) -> Result<T, Error>
where
    F: FnMut() -> Result<T, Error>,
{
    let mut last_err = None;
    for (attempt, delay) in RETRY_DELAYS_SECS.iter().enumerate() {
        match op() {
            Ok(val) => return Ok(val),
            Err(err) => {
                if !err.is_transient() {
                    return Err(err);
                }
                warn!(
                    "{}: attempt {}/{} failed: {}",
                    what,
                    attempt + 1,
                    RETRY_DELAYS_SECS.len(),
                    err
                );
                last_err = Some(err);
                thread::sleep(Duration::from_secs(*delay));
            }
        }
    }
    // last_err is always set when the loop runs to exhaustion
    Err(last_err.unwrap_or_else(|| Error::Transient(format!("{}: no attempts ran", what))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn first_success_returns_immediately() {
        let calls = AtomicUsize::new(0);
        let res: Result<(), Error> = retry("t", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(res.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn non_transient_does_not_retry() {
        let calls = AtomicUsize::new(0);
        let res: Result<(), Error> = retry("t", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Storage("broken".to_string()))
        });
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transient_exhausts_all_attempts_and_surfaces_last_error() {
        let calls = AtomicUsize::new(0);
        let start = Instant::now();
        let res: Result<(), Error> = retry("t", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Transient(format!("boom {}", n)))
        });
        assert_eq!(calls.load(Ordering::SeqCst), RETRY_DELAYS_SECS.len());
        match res {
            Err(Error::Transient(msg)) => assert_eq!(msg, "boom 2"),
            other => panic!("expected transient error, got {:?}", other),
        }
        // every failure sleeps its delay, the last included: 1s + 3s + 5s
        assert!(start.elapsed() >= Duration::from_secs(9));
    }

    #[test]
    fn transient_then_success_recovers() {
        let calls = AtomicUsize::new(0);
        let res: Result<u32, Error> = retry("t", || {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::Transient("flap".to_string()))
            } else {
                Ok(99)
            }
        });
        assert_eq!(res.unwrap(), 99);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
