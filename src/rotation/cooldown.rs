//! Cooldown store (spec.md §3 `CooldownStore`, §6, §9).
//!
//! Persisted mapping `profile path -> entry`, where an entry is either a
//! legacy single ISO-8601 timestamp or a nested `{modelKey: timestamp}`
//! map. `modelKey = "global"` means "unusable for all models". Readers
//! must accept both shapes; writers must not silently downgrade a nested
//! entry back to a flat one on rewrite (spec.md §9 "backward-compatible
//! cooldown file").

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

pub const GLOBAL_KEY: &str = "global";

#[derive(Debug, Clone)]
pub enum CooldownEntry {
    Legacy(DateTime<Utc>),
    PerModel(HashMap<String, DateTime<Utc>>),
}

impl CooldownEntry {
    fn expiry_for(&self, model_key: Option<&str>) -> Option<DateTime<Utc>> {
        match self {
            CooldownEntry::Legacy(ts) => Some(*ts),
            CooldownEntry::PerModel(map) => {
                if let Some(ts) = map.get(GLOBAL_KEY) {
                    return Some(*ts);
                }
                model_key.and_then(|k| map.get(k)).copied()
            }
        }
    }

    fn is_active(&self, model_key: Option<&str>, now: DateTime<Utc>) -> bool {
        self.expiry_for(model_key).map(|ts| ts > now).unwrap_or(false)
    }

    fn soonest_future_expiry(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            CooldownEntry::Legacy(ts) if *ts > now => Some(*ts),
            CooldownEntry::Legacy(_) => None,
            CooldownEntry::PerModel(map) => map.values().filter(|ts| **ts > now).min().copied(),
        }
    }
}

#[derive(Default, Clone)]
pub struct CooldownStore {
    entries: HashMap<String, CooldownEntry>,
}

impl CooldownStore {
    pub fn is_usable(&self, profile_path: &str, model_key: Option<&str>, now: DateTime<Utc>) -> bool {
        match self.entries.get(profile_path) {
            Some(entry) => !entry.is_active(model_key, now),
            None => true,
        }
    }

    /// Count of currently-active cooldowns on `profile_path` for models
    /// other than `target_model` — the "efficiency" score (spec.md §4.6,
    /// glossary).
    pub fn efficiency_score(&self, profile_path: &str, target_model: Option<&str>, now: DateTime<Utc>) -> usize {
        let Some(CooldownEntry::PerModel(map)) = self.entries.get(profile_path) else {
            return 0;
        };
        map.iter()
            .filter(|(model, ts)| {
                model.as_str() != GLOBAL_KEY
                    && Some(model.as_str()) != target_model
                    && **ts > now
            })
            .count()
    }

    pub fn soonest_expiry(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.entries
            .values()
            .filter_map(|e| e.soonest_future_expiry(now))
            .min()
    }

    pub fn set_global_cooldown(&mut self, profile_path: &str, expiry: DateTime<Utc>) {
        self.upsert_model(profile_path, GLOBAL_KEY, expiry);
    }

    pub fn set_model_cooldown(&mut self, profile_path: &str, model_key: &str, expiry: DateTime<Utc>) {
        self.upsert_model(profile_path, model_key, expiry);
    }

    fn upsert_model(&mut self, profile_path: &str, model_key: &str, expiry: DateTime<Utc>) {
        let entry = self
            .entries
            .entry(profile_path.to_string())
            .or_insert_with(|| CooldownEntry::PerModel(HashMap::new()));
        match entry {
            CooldownEntry::PerModel(map) => {
                map.insert(model_key.to_string(), expiry);
            }
            CooldownEntry::Legacy(ts) => {
                let mut map = HashMap::new();
                map.insert(GLOBAL_KEY.to_string(), *ts);
                map.insert(model_key.to_string(), expiry);
                *entry = CooldownEntry::PerModel(map);
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawEntry {
    Legacy(String),
    PerModel(HashMap<String, String>),
}

pub struct CooldownFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl CooldownFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub async fn load(&self) -> CooldownStore {
        let _guard = self.lock.lock().await;
        let Ok(contents) = tokio::fs::read_to_string(&self.path).await else {
            return CooldownStore::default();
        };
        let Ok(raw): Result<HashMap<String, Value>, _> = serde_json::from_str(&contents) else {
            return CooldownStore::default();
        };

        let mut entries = HashMap::new();
        for (profile, value) in raw {
            match value {
                Value::String(s) => {
                    if let Ok(ts) = DateTime::parse_from_rfc3339(&s) {
                        entries.insert(profile, CooldownEntry::Legacy(ts.with_timezone(&Utc)));
                    }
                }
                Value::Object(map) => {
                    let mut model_cooldowns = HashMap::new();
                    for (model_id, ts_val) in map {
                        if let Value::String(s) = ts_val {
                            if let Ok(ts) = DateTime::parse_from_rfc3339(&s) {
                                model_cooldowns.insert(model_id, ts.with_timezone(&Utc));
                            }
                        }
                    }
                    if !model_cooldowns.is_empty() {
                        entries.insert(profile, CooldownEntry::PerModel(model_cooldowns));
                    }
                }
                _ => {}
            }
        }
        CooldownStore { entries }
    }

    pub async fn save(&self, store: &CooldownStore) -> std::io::Result<()> {
        let _guard = self.lock.lock().await;
        let mut raw: HashMap<String, RawEntry> = HashMap::new();
        for (profile, entry) in &store.entries {
            match entry {
                CooldownEntry::Legacy(ts) => {
                    raw.insert(profile.clone(), RawEntry::Legacy(ts.to_rfc3339()));
                }
                CooldownEntry::PerModel(map) => {
                    let serialized = map
                        .iter()
                        .map(|(k, v)| (k.clone(), v.to_rfc3339()))
                        .collect();
                    raw.insert(profile.clone(), RawEntry::PerModel(serialized));
                }
            }
        }
        if let Some(parent) = Path::new(&self.path).parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        let serialized = serde_json::to_string_pretty(&raw)?;
        tokio::fs::write(&self.path, serialized).await
    }
}

/// Normalizes a model id for cooldown keying and matching (spec.md §4.6):
/// case-insensitive, collapses spaces/dots to hyphens, then a small
/// canonicalization table.
pub fn normalize_model_id(model_id: &str) -> String {
    if model_id.is_empty() {
        return "default".to_string();
    }
    let normalized = model_id.to_lowercase().replace(' ', "-").replace('.', "-");
    if normalized.contains("gemini") {
        if normalized.contains("gemini-1-5-pro") {
            return "gemini-1.5-pro".to_string();
        }
        if normalized.contains("gemini-2-5-pro") {
            return "gemini-2.5-pro".to_string();
        }
        if normalized.contains("gemini-3-1-pro") {
            return "gemini-3.1-pro".to_string();
        }
        if normalized.contains("gemini-3-pro-preview") {
            return "gemini-3-pro-preview".to_string();
        }
        if normalized.contains("gemini-pro") {
            return "gemini-pro".to_string();
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_gemini_aliases() {
        assert_eq!(normalize_model_id("gemini 1.5 pro"), "gemini-1.5-pro");
        assert_eq!(normalize_model_id(""), "default");
    }

    #[test]
    fn efficiency_counts_other_models_only() {
        let mut store = CooldownStore::default();
        let now = Utc::now();
        let future = now + chrono::Duration::seconds(60);
        store.set_model_cooldown("p1", "gemini-pro", future);
        store.set_model_cooldown("p1", "gemini-flash", future);
        assert_eq!(store.efficiency_score("p1", Some("gemini-pro"), now), 1);
    }

    #[tokio::test]
    async fn round_trip_preserves_legacy_and_nested() {
        let dir = std::env::temp_dir().join(format!("cooldown-test-{}", uuid_like()));
        let file = CooldownFile::new(dir.join("cooldowns.json"));

        let mut store = CooldownStore::default();
        let now = Utc::now();
        let future = now + chrono::Duration::seconds(120);
        store.entries.insert("legacy-profile".into(), CooldownEntry::Legacy(future));
        store.set_model_cooldown("nested-profile", "gemini-pro", future);

        file.save(&store).await.unwrap();
        let loaded = file.load().await;

        assert!(loaded.entries.contains_key("legacy-profile"));
        assert!(loaded.is_usable("nested-profile", Some("gemini-pro"), now) == false);
        assert!(loaded.is_usable("nested-profile", Some("gemini-flash"), now));

        tokio::fs::remove_dir_all(dir.parent().unwrap().join(dir.file_name().unwrap())).await.ok();
    }

    fn uuid_like() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos() as u64
    }
}
