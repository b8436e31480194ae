//! Cookie refresh (spec.md §6 `COOKIE_REFRESH_*`).
//!
//! Persists the live session's cookies back to the active auth profile
//! file on three triggers: a periodic background interval, every
//! `request_interval`-th successful request, and best-effort on
//! shutdown. Mirrors the source's `cookie_refresh.py` three-trigger
//! design; the actual cookie extraction lives behind
//! [`PageController::save_cookies`], out of scope here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::capability::{Clock, PageController};
use crate::runtime_state::SharedRuntimeState;

#[derive(Debug, Clone)]
pub struct CookieRefreshConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub on_request_enabled: bool,
    pub request_interval: u64,
    pub on_shutdown: bool,
    pub fallback_profile_path: Option<String>,
}

pub struct CookieRefresher {
    config: CookieRefreshConfig,
    page: Arc<dyn PageController>,
    state: SharedRuntimeState,
    requests_since_refresh: AtomicU64,
    save_lock: Mutex<()>,
}

impl CookieRefresher {
    pub fn new(config: CookieRefreshConfig, page: Arc<dyn PageController>, state: SharedRuntimeState) -> Self {
        Self { config, page, state, requests_since_refresh: AtomicU64::new(0), save_lock: Mutex::new(()) }
    }

    async fn active_profile_path(&self) -> Option<String> {
        if let Some(p) = self.state.current_auth_profile_path.read().await.clone() {
            return Some(p);
        }
        self.config.fallback_profile_path.clone()
    }

    pub async fn save_now(&self) -> bool {
        if !self.config.enabled {
            return false;
        }
        let Some(profile_path) = self.active_profile_path().await else {
            tracing::debug!("no active auth profile path, skipping cookie save");
            return false;
        };

        let _guard = self.save_lock.lock().await;
        match self.page.save_cookies(&profile_path).await {
            Ok(saved) => {
                if saved {
                    tracing::info!(profile = %profile_path, "cookies saved to auth profile");
                }
                saved
            }
            Err(err) => {
                tracing::warn!(?err, profile = %profile_path, "failed to save cookies");
                false
            }
        }
    }

    /// Called after a successful request; saves once every
    /// `request_interval` requests when on-request refresh is enabled.
    pub async fn maybe_refresh_on_request(&self) {
        if !self.config.on_request_enabled || self.config.request_interval == 0 {
            return;
        }
        let count = self.requests_since_refresh.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.config.request_interval {
            self.requests_since_refresh.store(0, Ordering::SeqCst);
            self.save_now().await;
        }
    }

    pub async fn shutdown_save(&self) {
        if self.config.on_shutdown {
            self.save_now().await;
        }
    }

    /// Background periodic task; exits once shutdown is flagged.
    pub async fn run_periodic(&self, clock: Arc<dyn Clock>) {
        if !self.config.enabled || self.config.interval_secs == 0 {
            return;
        }
        loop {
            clock.sleep(Duration::from_secs(self.config.interval_secs)).await;
            if self.state.is_shutting_down.load(Ordering::SeqCst) {
                return;
            }
            self.save_now().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CancelCheck, ModelListEntry, SubmitAttachment, UiParams};
    use crate::error::GatewayError;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct RecordingPage {
        saves: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl PageController for RecordingPage {
        async fn is_ready(&self) -> bool {
            true
        }
        async fn submit(&self, _: &str, _: &[SubmitAttachment], _: CancelCheck) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn adjust_parameters(&self, _: &UiParams, _: &str, _: &[ModelListEntry], _: CancelCheck) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn switch_model(&self, _: &str) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn apply_auth_profile(&self, _: &str) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn clear_chat_history(&self, _: CancelCheck) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn stop_generation(&self) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn reload(&self) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn save_cookies(&self, profile_path: &str) -> Result<bool, GatewayError> {
            self.saves.lock().unwrap().push(profile_path.to_string());
            Ok(true)
        }
    }

    fn config(on_request_enabled: bool, request_interval: u64) -> CookieRefreshConfig {
        CookieRefreshConfig {
            enabled: true,
            interval_secs: 3600,
            on_request_enabled,
            request_interval,
            on_shutdown: true,
            fallback_profile_path: Some("auth_profiles/saved/default.json".to_string()),
        }
    }

    #[tokio::test]
    async fn saves_after_the_configured_number_of_requests() {
        let page = Arc::new(RecordingPage { saves: StdMutex::new(vec![]) });
        let state = crate::runtime_state::RuntimeState::shared();
        let refresher = CookieRefresher::new(config(true, 3), page.clone(), state);

        refresher.maybe_refresh_on_request().await;
        refresher.maybe_refresh_on_request().await;
        assert!(page.saves.lock().unwrap().is_empty());

        refresher.maybe_refresh_on_request().await;
        assert_eq!(page.saves.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disabled_config_never_saves() {
        let page = Arc::new(RecordingPage { saves: StdMutex::new(vec![]) });
        let state = crate::runtime_state::RuntimeState::shared();
        let mut cfg = config(true, 1);
        cfg.enabled = false;
        let refresher = CookieRefresher::new(cfg, page.clone(), state);

        refresher.maybe_refresh_on_request().await;
        assert!(page.saves.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn shutdown_save_respects_on_shutdown_flag() {
        let page = Arc::new(RecordingPage { saves: StdMutex::new(vec![]) });
        let state = crate::runtime_state::RuntimeState::shared();
        let mut cfg = config(false, 0);
        cfg.on_shutdown = false;
        let refresher = CookieRefresher::new(cfg, page.clone(), state);

        refresher.shutdown_save().await;
        assert!(page.saves.lock().unwrap().is_empty());
    }
}
