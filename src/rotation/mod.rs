//! Auth-profile rotation coordinator (spec.md §4.6, §9).
//!
//! Mirrors the source's `perform_auth_rotation`: acquire the rotation
//! lock, put the exhausted profile in cooldown, pick a replacement with
//! smart-priority selection, soft-swap its cookies into the live
//! session, canary-test it, and retry with the next candidate on
//! failure. A depletion guard caps rotation attempts per rolling window
//! so a fully-exhausted pool degrades to slow retries instead of
//! spinning.

pub mod cooldown;
pub mod profile_store;

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use rand::Rng as _;

use crate::capability::{Clock, PageController};
use crate::error::GatewayError;
use crate::runtime_state::{LastErrorKind, SharedRuntimeState};

use cooldown::{normalize_model_id, CooldownFile};
use profile_store::{candidate_profiles, AuthProfile, ProfileDirectories, UsageLedger};

#[derive(Debug, Clone)]
pub struct RotationConfig {
    pub auto_rotate: bool,
    pub depletion_guard_normal: usize,
    pub depletion_guard_high_traffic: usize,
    pub high_traffic_queue_threshold: usize,
    pub rotation_window_secs: i64,
    pub rate_limit_cooldown_secs: i64,
    pub quota_exceeded_cooldown_secs: i64,
    pub profile_base_dir: PathBuf,
    pub cooldown_file_path: PathBuf,
    pub usage_ledger_path: PathBuf,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            auto_rotate: true,
            depletion_guard_normal: 3,
            depletion_guard_high_traffic: 10,
            high_traffic_queue_threshold: 5,
            rotation_window_secs: 60,
            rate_limit_cooldown_secs: 300,
            quota_exceeded_cooldown_secs: 14_400,
            profile_base_dir: PathBuf::from("auth_profiles"),
            cooldown_file_path: PathBuf::from("config/cooldowns.json"),
            usage_ledger_path: PathBuf::from("config/profile_usage.json"),
        }
    }
}

/// Result of one locked rotation attempt (comment 2 of the review:
/// `perform` needs to know whether to leave `rotation_lock` cleared).
enum RotationOutcome {
    Rotated,
    /// No usable candidate after the sleep-and-retry step. When
    /// `lock_permanently_cleared` is set, the depletion guard had tripped
    /// and even the emergency pool came up empty — the lock stays
    /// cleared so the parking gate blocks new admissions until an
    /// operator intervenes.
    NoneAvailable { lock_permanently_cleared: bool },
}

pub struct RotationCoordinator {
    config: RotationConfig,
    cooldown_file: CooldownFile,
    usage: UsageLedger,
    rotation_timestamps: tokio::sync::Mutex<Vec<i64>>,
    state: SharedRuntimeState,
}

impl RotationCoordinator {
    pub fn new(config: RotationConfig, state: SharedRuntimeState) -> Self {
        let cooldown_file = CooldownFile::new(config.cooldown_file_path.clone());
        let usage = UsageLedger::new(config.usage_ledger_path.clone());
        Self {
            config,
            cooldown_file,
            usage,
            rotation_timestamps: tokio::sync::Mutex::new(Vec::new()),
            state,
        }
    }

    pub fn usage_ledger(&self) -> &UsageLedger {
        &self.usage
    }

    /// Top-level entry point: serializes concurrent rotation attempts
    /// behind `rotation_lock`, a second caller just waits for the first
    /// to finish rather than rotating twice.
    pub async fn perform(
        &self,
        target_model_id: Option<&str>,
        page: &dyn PageController,
        queued_count: usize,
        clock: &dyn Clock,
    ) -> Result<bool, GatewayError> {
        if !self.config.auto_rotate {
            tracing::info!("auth rotation disabled, skipping");
            return Ok(false);
        }

        if !self.state.rotation_lock.is_set() {
            tracing::info!("rotation already in progress, waiting for completion");
            self.state.rotation_lock.wait(Duration::from_secs(60)).await;
            return Ok(true);
        }

        self.state.rotation_lock.clear();
        let outcome = self.perform_locked(target_model_id, page, queued_count, clock).await;

        let leave_cleared = matches!(outcome, Ok(RotationOutcome::NoneAvailable { lock_permanently_cleared: true }));
        if leave_cleared {
            tracing::error!("rotation lock left cleared: depletion guard tripped and no emergency profile is usable");
        } else {
            self.state.rotation_lock.set();
        }

        self.state.last_rotation_at.store(clock.now_unix(), Ordering::SeqCst);
        self.state.quota.set_last_rotation_at(clock.now_unix()).await;
        outcome.map(|o| matches!(o, RotationOutcome::Rotated))
    }

    async fn perform_locked(
        &self,
        target_model_id: Option<&str>,
        page: &dyn PageController,
        queued_count: usize,
        clock: &dyn Clock,
    ) -> Result<RotationOutcome, GatewayError> {
        let now = clock.now_unix();

        let depleted = {
            let mut timestamps = self.rotation_timestamps.lock().await;
            timestamps.retain(|t| now - t < self.config.rotation_window_secs);
            let effective_limit = if queued_count > self.config.high_traffic_queue_threshold {
                self.config.depletion_guard_high_traffic
            } else {
                self.config.depletion_guard_normal
            };
            let depleted = timestamps.len() >= effective_limit;
            timestamps.push(now);
            depleted
        };

        if depleted {
            tracing::error!(
                "rotation depletion guard tripped; pool may be fully exhausted, \
                 continuing with emergency profiles only"
            );
        }

        let mut cooldowns = self.cooldown_file.load().await;

        if let Some(old_path) = self.state.current_auth_profile_path.read().await.clone() {
            match self.state.quota.last_error_kind().await {
                Some(LastErrorKind::RateLimit) => {
                    let expiry = Utc
                        .timestamp_opt(now + self.config.rate_limit_cooldown_secs, 0)
                        .single()
                        .unwrap_or_else(Utc::now);
                    cooldowns.set_global_cooldown(&old_path, expiry);
                }
                _ => {
                    let expiry = Utc
                        .timestamp_opt(now + self.config.quota_exceeded_cooldown_secs, 0)
                        .single()
                        .unwrap_or_else(Utc::now);
                    let mut models = self.state.quota.exhausted_models().await;
                    if let Some(target) = target_model_id {
                        models.insert(normalize_model_id(target));
                    }
                    for model in &models {
                        cooldowns.set_model_cooldown(&old_path, model, expiry);
                    }
                }
            }
            self.cooldown_file.save(&cooldowns).await.ok();
        }

        let dirs = ProfileDirectories::under(&self.config.profile_base_dir);
        let mut candidates = candidate_profiles(&dirs);
        if depleted {
            candidates.retain(|p| p.path.starts_with(&dirs.emergency));
        }

        let mut select_now = now;
        let mut retried_wait = false;
        loop {
            let Some(best) = self.select_best(&candidates, &cooldowns, target_model_id, select_now).await else {
                if !retried_wait {
                    let now_dt = Utc.timestamp_opt(select_now, 0).single().unwrap_or_else(Utc::now);
                    if let Some(expiry) = cooldowns.soonest_expiry(now_dt) {
                        let wait = (expiry - now_dt).to_std().unwrap_or(Duration::ZERO) + Duration::from_secs(1);
                        tracing::warn!(wait_secs = wait.as_secs(), "no candidate available, waiting for soonest cooldown expiry");
                        clock.sleep(wait).await;
                        retried_wait = true;
                        select_now = clock.now_unix();
                        continue;
                    }
                }
                tracing::error!("no available auth profiles in standard or emergency pools");
                crate::telemetry::track_rotation("exhausted");
                return Ok(RotationOutcome::NoneAvailable { lock_permanently_cleared: depleted });
            };

            page.apply_auth_profile(&best.path.to_string_lossy()).await?;

            let canary_ok = self.canary_test(page).await;
            if canary_ok {
                *self.state.current_auth_profile_path.write().await = Some(best.path.to_string_lossy().into_owned());
                tracing::info!(profile = %best.display_name(), "rotation complete, profile passed canary test");
                crate::telemetry::track_rotation("success");
                return Ok(RotationOutcome::Rotated);
            }

            tracing::warn!(profile = %best.display_name(), "canary test failed, trying next candidate");
            let expiry = Utc.timestamp_opt(select_now + self.config.rate_limit_cooldown_secs, 0).single().unwrap_or_else(Utc::now);
            cooldowns.set_global_cooldown(&best.path.to_string_lossy(), expiry);
            self.cooldown_file.save(&cooldowns).await.ok();
            candidates.retain(|p| p.path != best.path);
        }
    }

    async fn canary_test(&self, page: &dyn PageController) -> bool {
        if self.state.is_shutting_down.load(Ordering::SeqCst) {
            return true;
        }
        if page.reload().await.is_err() {
            return false;
        }
        page.is_ready().await
    }

    /// Picks the candidate minimizing `(-efficiency, usage, random)`
    /// (spec.md §4.6 smart priority), skipping anything currently in
    /// cooldown for the target model.
    async fn select_best(
        &self,
        candidates: &[AuthProfile],
        cooldowns: &cooldown::CooldownStore,
        target_model_id: Option<&str>,
        now_unix: i64,
    ) -> Option<AuthProfile> {
        let now = Utc.timestamp_opt(now_unix, 0).single().unwrap_or_else(Utc::now);
        let normalized_target = target_model_id.map(normalize_model_id);

        let mut scored = Vec::new();
        for profile in candidates {
            let path_str = profile.path.to_string_lossy().into_owned();
            if !cooldowns.is_usable(&path_str, normalized_target.as_deref(), now) {
                continue;
            }
            let efficiency = cooldowns.efficiency_score(&path_str, normalized_target.as_deref(), now);
            let usage = self.usage.usage_for(&profile.path).await;
            let tie_breaker: f64 = rand::rng().random();
            scored.push((-(efficiency as i64), usage, tie_breaker, profile.clone()));
        }

        scored
            .into_iter()
            .min_by(|a, b| {
                a.0.cmp(&b.0)
                    .then(a.1.cmp(&b.1))
                    .then(a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal))
            })
            .map(|(_, _, _, p)| p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{ModelListEntry, SubmitAttachment, UiParams};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct FakePage {
        ready: AtomicUsize,
        applied: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PageController for FakePage {
        async fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst) != 0
        }
        async fn submit(&self, _: &str, _: &[SubmitAttachment], _: crate::capability::CancelCheck) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn adjust_parameters(&self, _: &UiParams, _: &str, _: &[ModelListEntry], _: crate::capability::CancelCheck) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn switch_model(&self, _: &str) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn apply_auth_profile(&self, path: &str) -> Result<(), GatewayError> {
            self.applied.lock().unwrap().push(path.to_string());
            Ok(())
        }
        async fn clear_chat_history(&self, _: crate::capability::CancelCheck) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn stop_generation(&self) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn reload(&self) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn save_cookies(&self, _: &str) -> Result<bool, GatewayError> {
            Ok(true)
        }
    }

    struct FakeClock;
    #[async_trait]
    impl Clock for FakeClock {
        fn now_unix(&self) -> i64 {
            1_700_000_000
        }
        async fn sleep(&self, _: Duration) {}
    }

    #[tokio::test]
    async fn rotation_skips_when_disabled() {
        let mut config = RotationConfig::default();
        config.auto_rotate = false;
        let state = crate::runtime_state::RuntimeState::shared();
        let coordinator = RotationCoordinator::new(config, state);
        let page = FakePage { ready: AtomicUsize::new(1), applied: std::sync::Mutex::new(vec![]) };

        let rotated = coordinator.perform(Some("gemini-pro"), &page, 0, &FakeClock).await.unwrap();
        assert!(!rotated);
        assert!(page.applied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rotation_returns_false_with_no_candidates() {
        let dir = std::env::temp_dir().join(format!("rotation-empty-{}", std::process::id()));
        let mut config = RotationConfig::default();
        config.profile_base_dir = dir.join("auth_profiles");
        config.cooldown_file_path = dir.join("cooldowns.json");
        config.usage_ledger_path = dir.join("usage.json");

        let state = crate::runtime_state::RuntimeState::shared();
        let coordinator = RotationCoordinator::new(config, state);
        let page = FakePage { ready: AtomicUsize::new(1), applied: std::sync::Mutex::new(vec![]) };

        let rotated = coordinator.perform(Some("gemini-pro"), &page, 0, &FakeClock).await.unwrap();
        assert!(!rotated);
    }

    #[tokio::test]
    async fn rotation_selects_and_applies_a_candidate() {
        let dir = std::env::temp_dir().join(format!("rotation-ok-{}", std::process::id()));
        let saved = dir.join("auth_profiles").join("saved");
        tokio::fs::create_dir_all(&saved).await.unwrap();
        tokio::fs::write(saved.join("p1.json"), "{}").await.unwrap();

        let mut config = RotationConfig::default();
        config.profile_base_dir = dir.join("auth_profiles");
        config.cooldown_file_path = dir.join("cooldowns.json");
        config.usage_ledger_path = dir.join("usage.json");

        let state = crate::runtime_state::RuntimeState::shared();
        let coordinator = RotationCoordinator::new(config, state);
        let page = FakePage { ready: AtomicUsize::new(1), applied: std::sync::Mutex::new(vec![]) };

        let rotated = coordinator.perform(Some("gemini-pro"), &page, 0, &FakeClock).await.unwrap();
        assert!(rotated);
        assert_eq!(page.applied.lock().unwrap().len(), 1);

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
