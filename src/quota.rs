//! Quota state machine (spec.md §4.5, §9).
//!
//! Tracks per-model token usage against soft/hard limits. Crossing the
//! soft limit sets `needs_rotation` (a graceful signal the queue worker
//! checks between requests); crossing the hard limit flags the model
//! exhausted and fails the in-flight request outright. A background
//! watchdog drains `is_exceeded` by driving the rotation coordinator and
//! clears quota state once a new profile is live.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::capability::{Clock, PageController};
use crate::error::GatewayError;
use crate::interceptor::QuotaSignal;
use crate::rotation::RotationCoordinator;
use crate::runtime_state::{LastErrorKind, SharedRuntimeState};

#[derive(Debug, Clone)]
pub struct QuotaLimits {
    pub soft_limit: u64,
    pub hard_limit: u64,
    pub per_model_overrides: HashMap<String, u64>,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            soft_limit: 650_000,
            hard_limit: 800_000,
            per_model_overrides: HashMap::new(),
        }
    }
}

pub struct QuotaMonitor {
    state: SharedRuntimeState,
    limits: QuotaLimits,
}

impl QuotaMonitor {
    pub fn new(state: SharedRuntimeState, limits: QuotaLimits) -> Self {
        Self { state, limits }
    }

    fn limit_for(&self, model_key: &str) -> u64 {
        self.limits
            .per_model_overrides
            .get(model_key)
            .copied()
            .unwrap_or(self.limits.hard_limit)
    }

    /// Adds `count` tokens to `model_id`'s running total. Returns
    /// [`GatewayError::QuotaExceeded`] once the per-model hard limit is
    /// crossed; sets the soft `needs_rotation` signal once the soft
    /// limit is crossed, without failing the request.
    pub async fn increment_token_count(&self, model_id: &str, count: u64) -> Result<(), GatewayError> {
        if count == 0 {
            return Ok(());
        }
        let model_key = if model_id.is_empty() { "default".to_string() } else { model_id.to_lowercase() };
        let usage = self.state.quota.add_tokens(&model_key, count).await;
        let limit = self.limit_for(&model_key);

        if usage >= limit {
            tracing::error!(model = %model_key, usage, limit, "hard quota limit reached, marking model exhausted");
            self.state.quota.mark_exhausted(&model_key).await;
            self.set_quota_exceeded(LastErrorKind::QuotaExceeded).await;
            crate::telemetry::track_quota_exceeded(&model_key);
            return Err(GatewayError::QuotaExceeded);
        }

        if usage >= self.limits.soft_limit && !self.state.quota.needs_rotation.load(Ordering::SeqCst) {
            tracing::warn!(model = %model_key, usage, soft_limit = self.limits.soft_limit, "soft quota limit reached, requesting rotation");
            self.state.quota.needs_rotation.store(true, Ordering::SeqCst);
        }

        Ok(())
    }

    /// Flags global quota exhaustion from an upstream signal (spec.md
    /// §4.3 `jserror` classification) rather than local token counting.
    pub async fn observe_signal(&self, signal: QuotaSignal, model_id: Option<&str>) {
        match signal {
            QuotaSignal::QuotaExceeded => {
                if let Some(model) = model_id {
                    self.state.quota.mark_exhausted(&model.to_lowercase()).await;
                }
                self.set_quota_exceeded(LastErrorKind::QuotaExceeded).await;
            }
            QuotaSignal::RateLimit => self.set_quota_exceeded(LastErrorKind::RateLimit).await,
            QuotaSignal::None => {}
        }
    }

    async fn set_quota_exceeded(&self, kind: LastErrorKind) {
        if !self.state.quota.is_exceeded.swap(true, Ordering::SeqCst) {
            self.state.quota.set_last_error_kind(kind).await;
            tracing::error!(?kind, "global quota-exceeded flag set");
        }
    }

    pub async fn reset(&self) {
        self.state.quota.reset().await;
        tracing::info!("quota status reset");
    }

    pub fn is_exceeded(&self) -> bool {
        self.state.quota.is_exceeded.load(Ordering::SeqCst)
    }

    pub fn needs_rotation(&self) -> bool {
        self.state.quota.needs_rotation.load(Ordering::SeqCst)
    }
}

/// Background task: polls `is_exceeded`, drives a rotation attempt when
/// it's set, and resets quota state once a replacement profile is live.
/// Runs for the lifetime of the process; exits on shutdown.
pub async fn run_watchdog(
    monitor: Arc<QuotaMonitor>,
    rotation: Arc<RotationCoordinator>,
    page: Arc<dyn PageController>,
    clock: Arc<dyn Clock>,
) {
    loop {
        if monitor.state.is_shutting_down.load(Ordering::SeqCst) {
            tracing::info!("quota watchdog exiting, shutdown in progress");
            return;
        }

        if monitor.is_exceeded() {
            let queued = monitor.state.queued_request_count.load(Ordering::SeqCst);
            let model = monitor.state.current_model_id.read().await.clone();
            match rotation.perform(model.as_deref(), page.as_ref(), queued, clock.as_ref()).await {
                Ok(true) => {
                    monitor.reset().await;
                }
                Ok(false) => {
                    tracing::warn!("rotation attempt yielded no usable profile, retrying shortly");
                    clock.sleep(Duration::from_secs(5)).await;
                }
                Err(err) => {
                    tracing::error!(?err, "rotation attempt failed");
                    clock.sleep(Duration::from_secs(5)).await;
                }
            }
        } else {
            clock.sleep(Duration::from_millis(200)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime_state::RuntimeState;

    fn monitor() -> QuotaMonitor {
        QuotaMonitor::new(RuntimeState::shared(), QuotaLimits { soft_limit: 10, hard_limit: 20, per_model_overrides: HashMap::new() })
    }

    #[tokio::test]
    async fn soft_limit_sets_needs_rotation_without_failing() {
        let m = monitor();
        m.increment_token_count("gemini-pro", 11).await.unwrap();
        assert!(m.needs_rotation());
        assert!(!m.is_exceeded());
    }

    #[tokio::test]
    async fn hard_limit_fails_and_sets_exceeded() {
        let m = monitor();
        let err = m.increment_token_count("gemini-pro", 25).await.unwrap_err();
        assert!(matches!(err, GatewayError::QuotaExceeded));
        assert!(m.is_exceeded());
    }

    #[tokio::test]
    async fn per_model_override_takes_precedence() {
        let mut overrides = HashMap::new();
        overrides.insert("gemini-flash".to_string(), 5u64);
        let m = QuotaMonitor::new(RuntimeState::shared(), QuotaLimits { soft_limit: 10, hard_limit: 20, per_model_overrides: overrides });
        let err = m.increment_token_count("gemini-flash", 6).await.unwrap_err();
        assert!(matches!(err, GatewayError::QuotaExceeded));
    }

    #[tokio::test]
    async fn reset_clears_exceeded_flag() {
        let m = monitor();
        m.increment_token_count("gemini-pro", 25).await.unwrap_err();
        m.reset().await;
        assert!(!m.is_exceeded());
        assert!(!m.needs_rotation());
    }
}
