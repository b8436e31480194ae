//! Capability interfaces the core consumes (spec.md §6).
//!
//! The source program wires these up with dynamic dispatch and
//! monkey-patched hot paths; here they're explicit traits passed in at
//! construction, which both documents intent and gives test seams (design
//! note: replace dynamic dispatch with capability interfaces).

use async_trait::async_trait;
use std::time::Duration;

use crate::error::GatewayError;

/// A cancellation check callback: returns true if the caller should abort.
pub type CancelCheck = std::sync::Arc<dyn Fn() -> bool + Send + Sync>;

/// Parameters the UI caches per-model; opaque to the pipeline beyond equality.
pub type UiParams = serde_json::Value;

#[derive(Debug, Clone)]
pub struct SubmitAttachment {
    pub uri: String,
}

#[derive(Debug, Clone)]
pub struct ModelListEntry {
    pub id: String,
    pub display_name: String,
}

/// Drives the headless-browser session. Every method accepts a
/// cancellation check and must raise [`GatewayError::ClientCancelled`] if it
/// returns true partway through, rather than swallowing the cancellation.
#[async_trait]
pub trait PageController: Send + Sync {
    async fn is_ready(&self) -> bool;

    async fn submit(
        &self,
        prompt: &str,
        attachments: &[SubmitAttachment],
        cancel_check: CancelCheck,
    ) -> Result<(), GatewayError>;

    async fn adjust_parameters(
        &self,
        params: &UiParams,
        model_id: &str,
        model_list: &[ModelListEntry],
        cancel_check: CancelCheck,
    ) -> Result<(), GatewayError>;

    async fn switch_model(&self, model_id: &str) -> Result<(), GatewayError>;

    /// Swaps the browser session's cookie jar to `profile_path` without a
    /// full page reload ("soft swap", spec.md §4.6).
    async fn apply_auth_profile(&self, profile_path: &str) -> Result<(), GatewayError>;

    async fn clear_chat_history(&self, cancel_check: CancelCheck) -> Result<(), GatewayError>;

    /// Clicks the upstream "stop generation" control, used by the
    /// disconnect monitor to cancel an in-flight streaming submission.
    async fn stop_generation(&self) -> Result<(), GatewayError>;

    async fn reload(&self) -> Result<(), GatewayError>;

    /// Persists the live session's cookies back to `profile_path`.
    /// Returns false (not an error) when there's no active session to
    /// save from, mirroring the source's best-effort refresh.
    async fn save_cookies(&self, profile_path: &str) -> Result<bool, GatewayError>;
}

/// Abstracted wall-clock, swappable for deterministic tests.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now_unix(&self) -> i64;
    async fn sleep(&self, d: Duration);
}

pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now_unix(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }

    async fn sleep(&self, d: Duration) {
        tokio::time::sleep(d).await;
    }
}

/// One fragment of an in-flight upstream response, as produced by the
/// interceptor and consumed by response assembly.
#[derive(Debug, Clone)]
pub enum InterceptorEvent {
    Body(String),
    Reason(String),
    Function { name: String, arguments: serde_json::Value },
    Done,
    Error(String),
}

/// Per-request stream of interceptor events. The interceptor exposes one of
/// these per request; response assembly pulls from it until `Done`/`Error`.
#[async_trait]
pub trait InterceptorStream: Send + Sync {
    async fn next_event(&mut self) -> Option<InterceptorEvent>;
}

/// Opens the interceptor event stream for a submitted request. The raw
/// network capture that feeds it is the browser-driver's concern (out of
/// scope here); this is the seam the pipeline uses to obtain the decoded
/// stream once `PageController::submit` has kicked off generation.
#[async_trait]
pub trait ResponseCapture: Send + Sync {
    async fn open_stream(&self, req_id: &str) -> Box<dyn InterceptorStream>;
}
