//! Auth-profile discovery and usage tracking (spec.md §4.6, §9).
//!
//! Profiles are JSON cookie jars on disk under a small tier of
//! directories: `saved`/`active` (standard tier) and `emergency`
//! (fallback tier, scanned only when the standard tier is empty). Usage
//! is a separate JSON ledger keyed by absolute path, with basename
//! reconciliation so a profile moved between directories keeps its
//! wear-leveling count.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct AuthProfile {
    pub path: PathBuf,
}

impl AuthProfile {
    pub fn display_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.to_string_lossy().into_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieHealth {
    Healthy,
    Warning,
    Critical,
    Error,
}

#[derive(Debug, Default)]
pub struct CookieHealthReport {
    pub total: usize,
    pub expired: usize,
    pub valid: usize,
    pub critical_expired: Vec<String>,
    pub status: Option<CookieHealth>,
}

const CRITICAL_COOKIES: &[&str] = &[
    "SID", "HSID", "SSID", "APISID", "SAPISID", "SIDCC", "__Secure-1PSID", "__Secure-3PSID",
];

/// Scans cookie jar JSON for expired critical auth cookies (spec.md §9,
/// "cookie health check" supplemental feature).
pub fn check_cookie_health(profile_path: &Path, now_unix: f64) -> CookieHealthReport {
    let mut report = CookieHealthReport::default();
    let Ok(contents) = std::fs::read_to_string(profile_path) else {
        report.status = Some(CookieHealth::Error);
        return report;
    };
    let Ok(data): Result<serde_json::Value, _> = serde_json::from_str(&contents) else {
        report.status = Some(CookieHealth::Error);
        return report;
    };
    let cookies = data.get("cookies").and_then(|v| v.as_array()).cloned().unwrap_or_default();
    report.total = cookies.len();

    for cookie in &cookies {
        let name = cookie.get("name").and_then(|v| v.as_str()).unwrap_or("");
        let expires = cookie.get("expires").and_then(|v| v.as_f64()).unwrap_or(-1.0);
        if expires < 0.0 {
            report.valid += 1;
        } else if expires < now_unix {
            report.expired += 1;
            if CRITICAL_COOKIES.contains(&name) {
                report.critical_expired.push(name.to_string());
            }
        } else {
            report.valid += 1;
        }
    }

    report.status = Some(if !report.critical_expired.is_empty() {
        CookieHealth::Critical
    } else if report.total > 0 && report.expired as f64 > report.total as f64 * 0.3 {
        CookieHealth::Warning
    } else {
        CookieHealth::Healthy
    });
    report
}

pub struct ProfileDirectories {
    pub saved: PathBuf,
    pub active: PathBuf,
    pub emergency: PathBuf,
}

impl ProfileDirectories {
    pub fn under(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        Self {
            saved: base.join("saved"),
            active: base.join("active"),
            emergency: base.join("emergency"),
        }
    }

    /// Standard tier scanned first; emergency profiles are included in
    /// the scan too so a healthy emergency profile isn't artificially
    /// excluded, but callers fall back to emergency-only if the
    /// standard-tier scan yields nothing.
    fn standard_tier(&self) -> Vec<&Path> {
        vec![&self.saved, &self.active, &self.emergency]
    }

    fn emergency_tier(&self) -> Vec<&Path> {
        vec![&self.emergency]
    }
}

fn list_json_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return vec![];
    };
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|ext| ext == "json").unwrap_or(false))
        .collect()
}

/// Lists all candidate profiles across directories, standard tier first
/// with emergency-only fallback (spec.md §4.6 two-tier selection).
pub fn candidate_profiles(dirs: &ProfileDirectories) -> Vec<AuthProfile> {
    let standard: Vec<AuthProfile> = dirs
        .standard_tier()
        .into_iter()
        .flat_map(list_json_files)
        .map(|path| AuthProfile { path })
        .collect();
    if !standard.is_empty() {
        return standard;
    }
    dirs.emergency_tier()
        .into_iter()
        .flat_map(list_json_files)
        .map(|path| AuthProfile { path })
        .collect()
}

#[derive(Serialize, Deserialize, Default)]
struct UsageLedgerData(HashMap<String, u64>);

pub struct UsageLedger {
    path: PathBuf,
    lock: Mutex<()>,
}

impl UsageLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn key_for(path: &Path) -> String {
        path.canonicalize()
            .unwrap_or_else(|_| path.to_path_buf())
            .to_string_lossy()
            .into_owned()
    }

    async fn load(&self) -> UsageLedgerData {
        let Ok(contents) = tokio::fs::read_to_string(&self.path).await else {
            return UsageLedgerData::default();
        };
        serde_json::from_str(&contents).unwrap_or_default()
    }

    async fn save(&self, data: &UsageLedgerData) {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        if let Ok(serialized) = serde_json::to_string_pretty(&data.0) {
            tokio::fs::write(&self.path, serialized).await.ok();
        }
    }

    /// Reads usage for a profile, reconciling by basename if the exact
    /// path isn't present (handles profiles moved between tiers).
    pub async fn usage_for(&self, profile_path: &Path) -> u64 {
        let data = self.load().await;
        let key = Self::key_for(profile_path);
        if let Some(v) = data.0.get(&key) {
            return *v;
        }
        let basename = profile_path.file_name().map(|n| n.to_os_string());
        data.0
            .iter()
            .find(|(k, _)| {
                basename
                    .as_ref()
                    .map(|b| Path::new(k).file_name() == Some(b.as_os_str()))
                    .unwrap_or(false)
            })
            .map(|(_, v)| *v)
            .unwrap_or(0)
    }

    pub async fn increment(&self, profile_path: &Path, tokens: u64) {
        if !profile_path.exists() {
            return;
        }
        let _guard = self.lock.lock().await;
        let mut data = self.load().await;
        let key = Self::key_for(profile_path);

        let reconciled_key = if data.0.contains_key(&key) {
            Some(key.clone())
        } else {
            let basename = profile_path.file_name().map(|n| n.to_os_string());
            data.0
                .keys()
                .find(|k| {
                    basename
                        .as_ref()
                        .map(|b| Path::new(k.as_str()).file_name() == Some(b.as_os_str()))
                        .unwrap_or(false)
                })
                .cloned()
        };

        if let Some(old_key) = reconciled_key {
            if old_key != key {
                let value = data.0.remove(&old_key).unwrap_or(0);
                data.0.insert(key.clone(), value);
            }
        }

        let entry = data.0.entry(key).or_insert(0);
        *entry += tokens;
        self.save(&data).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_health_flags_critical_expired() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("profile-health-{}.json", std::process::id()));
        std::fs::write(
            &path,
            serde_json::json!({
                "cookies": [
                    {"name": "SID", "expires": 100.0},
                    {"name": "misc", "expires": -1}
                ]
            })
            .to_string(),
        )
        .unwrap();

        let report = check_cookie_health(&path, 1_000_000.0);
        assert_eq!(report.status, Some(CookieHealth::Critical));
        assert_eq!(report.critical_expired, vec!["SID".to_string()]);

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn usage_ledger_reconciles_by_basename() {
        let dir = std::env::temp_dir().join(format!("usage-ledger-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let profile_a = dir.join("a.json");
        tokio::fs::write(&profile_a, "{}").await.unwrap();

        let ledger = UsageLedger::new(dir.join("usage.json"));
        ledger.increment(&profile_a, 100).await;

        tokio::fs::rename(&profile_a, dir.join("b.json")).await.unwrap();
        let moved = dir.join("b.json");
        let usage = ledger.usage_for(&moved).await;
        assert_eq!(usage, 100);

        ledger.increment(&moved, 50).await;
        assert_eq!(ledger.usage_for(&moved).await, 150);

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
