use crate::config::CleanupConfig;
use std::{io, path::Path, thread, time::Duration};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay slept after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(500))
    }
}

impl From<&CleanupConfig> for RetryPolicy {
    fn from(config: &CleanupConfig) -> Self {
        Self::new(config.max_attempts, Duration::from_millis(config.base_delay_ms))
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::ResourceBusy
    )
}

/// Deletes `path`, retrying while the file is locked or busy.
///
/// A missing file counts as deleted. Returns `false` once the retry budget is
/// spent or a non-transient error occurs; the failure is logged, never raised.
pub fn remove_file_with_retry(path: &Path, policy: &RetryPolicy) -> bool {
    remove_with(path, policy, |p| std::fs::remove_file(p), thread::sleep)
}

pub(crate) fn remove_with<R, S>(
    path: &Path,
    policy: &RetryPolicy,
    mut remove: R,
    mut sleep: S,
) -> bool
where
    R: FnMut(&Path) -> io::Result<()>,
    S: FnMut(Duration),
{
    for attempt in 1..=policy.max_attempts {
        match remove(path) {
            Ok(()) => {
                if attempt > 1 {
                    tracing::debug!("Deleted {:?} on attempt {}", path, attempt);
                }
                return true;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => return true,
            Err(e) if is_transient(&e) && attempt < policy.max_attempts => {
                let delay = policy.delay_after(attempt);
                tracing::debug!(
                    "Delete of {:?} failed (attempt {}/{}): {}; retrying in {:?}",
                    path,
                    attempt,
                    policy.max_attempts,
                    e,
                    delay
                );
                sleep(delay);
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to delete {:?} after {} attempts: {}",
                    path,
                    attempt,
                    e
                );
                return false;
            }
        }
    }
    false
}
