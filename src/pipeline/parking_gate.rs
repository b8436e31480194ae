//! Parking gate (spec.md §4.2).
//!
//! Guards admission into the queue: a request waits here while a
//! rotation is in progress or quota is flagged exceeded, bounded by a
//! 60s total wait with a 30s sub-wait on the rotation lock itself.

use std::time::Duration;

use crate::error::GatewayError;
use crate::runtime_state::SharedRuntimeState;

const TOTAL_WAIT: Duration = Duration::from_secs(60);
const SUB_WAIT: Duration = Duration::from_secs(30);

pub struct ParkingGate {
    state: SharedRuntimeState,
}

impl ParkingGate {
    pub fn new(state: SharedRuntimeState) -> Self {
        Self { state }
    }

    /// Blocks until admission is safe. Increments `queued_request_count`
    /// for the duration of the wait so the depletion guard can see
    /// traffic pressure.
    pub async fn wait(&self) -> Result<(), GatewayError> {
        use std::sync::atomic::Ordering;

        if self.is_clear() {
            return Ok(());
        }

        self.state.queued_request_count.fetch_add(1, Ordering::SeqCst);
        let result = self.wait_inner().await;
        self.state.queued_request_count.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn is_clear(&self) -> bool {
        self.state.rotation_lock.is_set() && !self.state.quota.is_exceeded.load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn wait_inner(&self) -> Result<(), GatewayError> {
        let deadline = tokio::time::Instant::now() + TOTAL_WAIT;

        loop {
            if self.is_clear() {
                return Ok(());
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(GatewayError::ProcessingTimeoutAtGate);
            }

            let wait_for = remaining.min(SUB_WAIT);
            self.state.rotation_lock.wait(wait_for).await;

            if tokio::time::Instant::now() >= deadline {
                return Err(GatewayError::ProcessingTimeoutAtGate);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime_state::RuntimeState;

    #[tokio::test]
    async fn passes_through_when_lock_set_and_quota_ok() {
        let state = RuntimeState::shared();
        let gate = ParkingGate::new(state);
        gate.wait().await.unwrap();
    }

    #[tokio::test]
    async fn waits_while_rotation_lock_is_cleared_then_proceeds() {
        let state = RuntimeState::shared();
        state.rotation_lock.clear();
        let gate = ParkingGate::new(state.clone());

        let waiter = tokio::spawn({
            let gate_state = state.clone();
            async move {
                let gate = ParkingGate::new(gate_state);
                gate.wait().await
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        state.rotation_lock.set();

        let result = tokio::time::timeout(Duration::from_secs(2), waiter).await.unwrap().unwrap();
        assert!(result.is_ok());
        let _ = gate;
    }
}
