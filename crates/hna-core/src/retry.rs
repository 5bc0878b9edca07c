use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

/// Retry a fallible operation with a fixed delay between attempts.
///
/// - `max_attempts`: Total attempts (including the first).
/// - `delay`: Sleep between failures.
/// - `label`: Description for log messages.
pub fn retry<F, T>(max_attempts: u32, delay: Duration, label: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut last_err = None;

    for attempt in 1..=max_attempts {
        match f() {
            Ok(val) => return Ok(val),
            Err(e) => {
                if attempt < max_attempts {
                    warn!(
                        attempt,
                        max_attempts,
                        error = %e,
                        "{} failed, retrying",
                        label,
                    );
                    thread::sleep(delay);
                }
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap())
}
