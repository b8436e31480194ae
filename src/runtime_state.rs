//! Reified runtime state (spec.md §3 `QuotaState`, §4.2, §5).
//!
//! The source keeps this as a module-level singleton mixing `asyncio`
//! primitives and `threading.Event`s. Per the design notes, that's split
//! here into one struct with an explicit synchronization primitive per
//! field: async-aware signals (`tokio::sync::Notify`/`RwLock`) for fields
//! only ever touched from async tasks, and a plain `AtomicBool` for the
//! shutdown flag so it stays signal-safe and readable from anywhere.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Notify, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastErrorKind {
    RateLimit,
    QuotaExceeded,
}

/// Per-process quota bookkeeping (spec.md §3 `QuotaState`).
#[derive(Default)]
pub struct QuotaState {
    pub is_exceeded: AtomicBool,
    pub needs_rotation: AtomicBool,
    pub is_recovering: AtomicBool,
    inner: RwLock<QuotaInner>,
}

#[derive(Default)]
struct QuotaInner {
    last_error_kind: Option<LastErrorKind>,
    per_model_tokens: HashMap<String, u64>,
    exhausted_models: HashSet<String>,
    last_rotation_at: Option<i64>,
}

impl QuotaState {
    pub async fn last_error_kind(&self) -> Option<LastErrorKind> {
        self.inner.read().await.last_error_kind
    }

    pub async fn set_last_error_kind(&self, kind: LastErrorKind) {
        self.inner.write().await.last_error_kind = Some(kind);
    }

    pub async fn per_model_tokens(&self, model: &str) -> u64 {
        *self.inner.read().await.per_model_tokens.get(model).unwrap_or(&0)
    }

    pub async fn add_tokens(&self, model: &str, count: u64) -> u64 {
        let mut inner = self.inner.write().await;
        let entry = inner.per_model_tokens.entry(model.to_string()).or_insert(0);
        *entry += count;
        *entry
    }

    pub async fn mark_exhausted(&self, model: &str) {
        self.inner.write().await.exhausted_models.insert(model.to_string());
    }

    pub async fn exhausted_models(&self) -> HashSet<String> {
        self.inner.read().await.exhausted_models.clone()
    }

    pub async fn last_rotation_at(&self) -> Option<i64> {
        self.inner.read().await.last_rotation_at
    }

    pub async fn set_last_rotation_at(&self, ts: i64) {
        self.inner.write().await.last_rotation_at = Some(ts);
    }

    /// Testable property #6: after reset, per_model_tokens and
    /// exhausted_models are both empty.
    pub async fn reset(&self) {
        self.is_exceeded.store(false, Ordering::SeqCst);
        self.needs_rotation.store(false, Ordering::SeqCst);
        let mut inner = self.inner.write().await;
        inner.last_error_kind = None;
        inner.per_model_tokens.clear();
        inner.exhausted_models.clear();
    }
}

/// Parking gate signal pair: `rotation_lock` set = requests may proceed;
/// cleared = parked for the duration of a rotation. Paired with
/// `recovery_event` (set = not recovering).
pub struct RotationLock {
    open: AtomicBool,
    notify: Notify,
}

impl Default for RotationLock {
    fn default() -> Self {
        Self {
            open: AtomicBool::new(true),
            notify: Notify::new(),
        }
    }
}

impl RotationLock {
    pub fn is_set(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn set(&self) {
        self.open.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Waits until set, bounded by `timeout`. Returns false on timeout.
    pub async fn wait(&self, timeout: std::time::Duration) -> bool {
        if self.is_set() {
            return true;
        }
        let waited = tokio::time::timeout(timeout, self.notify.notified()).await;
        waited.is_ok() || self.is_set()
    }
}

/// Process-wide state shared between the pipeline, rotation coordinator,
/// and quota monitor.
pub struct RuntimeState {
    pub quota: QuotaState,
    pub rotation_lock: RotationLock,
    pub recovery_event: RotationLock,
    pub queued_request_count: AtomicUsize,
    pub current_stream_req_id: RwLock<Option<String>>,
    pub is_shutting_down: AtomicBool,
    pub current_auth_profile_path: RwLock<Option<String>>,
    pub current_model_id: RwLock<Option<String>>,
    pub last_rotation_at: AtomicI64,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            quota: QuotaState::default(),
            rotation_lock: RotationLock::default(),
            recovery_event: RotationLock::default(),
            queued_request_count: AtomicUsize::new(0),
            current_stream_req_id: RwLock::new(None),
            is_shutting_down: AtomicBool::new(false),
            current_auth_profile_path: RwLock::new(None),
            current_model_id: RwLock::new(None),
            last_rotation_at: AtomicI64::new(0),
        }
    }
}

pub type SharedRuntimeState = Arc<RuntimeState>;

impl RuntimeState {
    pub fn shared() -> SharedRuntimeState {
        Arc::new(Self::default())
    }

    /// A rotation completed within the last ~45s: used by the zombie-stream
    /// guard (spec.md §5, §9) to drop stale empty `done=true` events that
    /// belong to the pre-rotation stream.
    pub fn rotation_recent(&self, now_unix: i64) -> bool {
        let last = self.last_rotation_at.load(Ordering::SeqCst);
        last != 0 && now_unix - last < 45
    }
}
