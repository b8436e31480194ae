//! Client-disconnect monitor (spec.md §4.1 step 8, §5).
//!
//! Polls a caller-supplied liveness check at a fixed interval while a
//! response is in progress; after enough consecutive failures it
//! signals the shared completion event so the generator and, for
//! streaming, the upstream "stop generation" control both react on
//! their next yield.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

const STREAMING_POLL_INTERVAL: Duration = Duration::from_millis(200);
const STREAMING_FAILURE_THRESHOLD: u32 = 3;
const NON_STREAMING_POLL_INTERVAL: Duration = Duration::from_millis(300);
const NON_STREAMING_FAILURE_THRESHOLD: u32 = 1;

/// Shared between the generator task and the disconnect monitor: set
/// once by whichever side finishes (or detects disconnect) first.
#[derive(Default)]
pub struct CompletionEvent {
    notify: Notify,
    fired: std::sync::atomic::AtomicBool,
}

impl CompletionEvent {
    pub fn fire(&self) {
        if !self.fired.swap(true, std::sync::atomic::Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        if self.is_fired() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Polls `is_alive` until it reports disconnected `threshold` times in a
/// row or `completion` fires from elsewhere. Returns true if it detected
/// a disconnect (as opposed to exiting because completion already fired).
pub async fn monitor(
    is_alive: impl Fn() -> bool,
    completion: Arc<CompletionEvent>,
    streaming: bool,
) -> bool {
    let (interval, threshold) = if streaming {
        (STREAMING_POLL_INTERVAL, STREAMING_FAILURE_THRESHOLD)
    } else {
        (NON_STREAMING_POLL_INTERVAL, NON_STREAMING_FAILURE_THRESHOLD)
    };

    let mut consecutive_failures = 0u32;
    loop {
        if completion.is_fired() {
            return false;
        }
        tokio::time::sleep(interval).await;
        if completion.is_fired() {
            return false;
        }

        if is_alive() {
            consecutive_failures = 0;
        } else {
            consecutive_failures += 1;
            if consecutive_failures >= threshold {
                completion.fire();
                return true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32};

    #[tokio::test]
    async fn fires_completion_after_threshold_failures_streaming() {
        let completion = Arc::new(CompletionEvent::default());
        let calls = AtomicU32::new(0);

        let detected = monitor(
            || {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                false
            },
            completion.clone(),
            true,
        )
        .await;

        assert!(detected);
        assert!(completion.is_fired());
        assert!(calls.load(std::sync::atomic::Ordering::SeqCst) >= STREAMING_FAILURE_THRESHOLD);
    }

    #[tokio::test]
    async fn stops_immediately_when_completion_already_fired() {
        let completion = Arc::new(CompletionEvent::default());
        completion.fire();
        let alive = AtomicBool::new(true);

        let detected = monitor(|| alive.load(std::sync::atomic::Ordering::SeqCst), completion, false).await;
        assert!(!detected);
    }
}
