//! Module implementing the bounded-retry policy wrapped around flaky
//! materialize-to-disk operations.
//!
//! Saving a filtered recording is empirically flaky (resource contention,
//! transient I/O failure), so the persist step clears any partial state at
//! the destination and tries again a bounded number of times before giving up.
use std::fs;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use crate::error::SpikelineError;
use crate::{MAX_PERSIST_ATTEMPTS, PERSIST_RETRY_DELAY};

/// Remove and recreate a folder, destroying any pre-existing contents.
pub fn reset_folder<P: AsRef<Path>>(path: P) -> Result<(), SpikelineError> {
    let path = path.as_ref();
    if path.exists() {
        fs::remove_dir_all(path)?;
    }
    fs::create_dir_all(path)?;
    Ok(())
}

/// A bounded-retry policy: maximum number of attempts, fixed delay between
/// attempts, and the retryable-error predicate of [`SpikelineError`].
#[derive(Debug, PartialEq, Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: MAX_PERSIST_ATTEMPTS,
            delay: PERSIST_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Create a retry policy with the specified attempt cap and inter-attempt
    /// delay. The function returns an error for a zero attempt cap.
    pub fn build(max_attempts: usize, delay: Duration) -> Result<Self, SpikelineError> {
        if max_attempts == 0 {
            return Err(SpikelineError::InvalidParameter(
                "Retry policy must allow at least one attempt".to_string(),
            ));
        }
        Ok(RetryPolicy {
            max_attempts,
            delay,
        })
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Materialize something to the destination folder, retrying on transient
    /// failure. Before every attempt the policy waits the fixed delay and
    /// resets the destination, so each attempt starts from a clean folder.
    ///
    /// Non-transient errors propagate immediately; once the attempt cap is
    /// reached, the last underlying error propagates.
    pub fn persist<T, F>(&self, destination: &Path, mut op: F) -> Result<T, SpikelineError>
    where
        F: FnMut(&Path) -> Result<T, SpikelineError>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            sleep(self.delay);
            log::debug!("Persist attempt {} of {}", attempt, self.max_attempts);

            match reset_folder(destination).and_then(|_| op(destination)) {
                Ok(value) => {
                    log::info!("Persist succeeded on attempt {}", attempt);
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    log::warn!("Persist attempt {} failed: {}", attempt, e);
                }
                Err(e) => {
                    log::error!(
                        "Persist failed after {} attempt{}: {}",
                        attempt,
                        if attempt == 1 { "" } else { "s" },
                        e
                    );
                    return Err(e);
                }
            }
        }
    }
}
