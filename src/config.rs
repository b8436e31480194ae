//! Process configuration, loaded once at startup from the environment
//! (spec.md §6). Every knob named in the external-interfaces section has
//! a field here; nothing reaches into `std::env` outside this module.

use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    Headless,
    Debug,
    VirtualHeadless,
    DirectDebugNoBrowser,
}

impl LaunchMode {
    fn parse(s: &str) -> Self {
        match s {
            "debug" => LaunchMode::Debug,
            "virtual_headless" => LaunchMode::VirtualHeadless,
            "direct_debug_no_browser" => LaunchMode::DirectDebugNoBrowser,
            _ => LaunchMode::Headless,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: String,
    pub api_keys: Vec<String>,

    pub launch_mode: LaunchMode,
    pub server_port_info: Option<String>,
    pub stream_port: u16,
    pub active_auth_json_path: Option<PathBuf>,

    pub auto_rotate_auth_profile: bool,
    pub auto_auth_rotation_on_startup: bool,

    pub quota_soft_limit: u64,
    pub quota_hard_limit: u64,
    pub quota_model_overrides: HashMap<String, u64>,

    pub rate_limit_cooldown_secs: i64,
    pub quota_exceeded_cooldown_secs: i64,

    pub response_completion_timeout_secs: f64,
    pub high_traffic_queue_threshold: usize,
    pub rotation_depletion_guard_high_traffic: usize,

    pub cookie_refresh_enabled: bool,
    pub cookie_refresh_interval_secs: u64,
    pub cookie_refresh_on_request_enabled: bool,
    pub cookie_refresh_request_interval_secs: u64,
    pub cookie_refresh_on_shutdown: bool,

    pub mcp_http_endpoint: Option<String>,
    pub mcp_http_timeout_secs: u64,

    pub profile_base_dir: PathBuf,
    pub cooldown_file_path: PathBuf,
    pub usage_ledger_path: PathBuf,

    pub otlp_endpoint: Option<String>,
    pub service_name: String,
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_string(key).and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_string(key) {
        Some(s) => matches!(s.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

/// Parses `QUOTA_LIMIT_<MODEL_ID>` style overrides out of the process
/// environment (spec.md §6, §9 "model-specific quota overrides").
fn model_quota_overrides() -> HashMap<String, u64> {
    std::env::vars()
        .filter_map(|(key, value)| {
            let model_key = key.strip_prefix("QUOTA_LIMIT_")?;
            let limit: u64 = value.parse().ok()?;
            Some((model_key.to_lowercase().replace('_', "-"), limit))
        })
        .collect()
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let listen_addr = env_string("LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let api_keys = env_string("GATEWAY_API_KEYS")
            .map(|s| s.split(',').map(|k| k.trim().to_string()).filter(|k| !k.is_empty()).collect())
            .unwrap_or_default();

        Ok(Self {
            listen_addr,
            api_keys,

            launch_mode: env_string("LAUNCH_MODE").map(|s| LaunchMode::parse(&s)).unwrap_or(LaunchMode::Headless),
            server_port_info: env_string("SERVER_PORT_INFO"),
            stream_port: env_parsed("STREAM_PORT", 0u16),
            active_auth_json_path: env_string("ACTIVE_AUTH_JSON_PATH").map(PathBuf::from),

            auto_rotate_auth_profile: env_bool("AUTO_ROTATE_AUTH_PROFILE", true),
            auto_auth_rotation_on_startup: env_bool("AUTO_AUTH_ROTATION_ON_STARTUP", false),

            quota_soft_limit: env_parsed("QUOTA_SOFT_LIMIT", 650_000u64),
            quota_hard_limit: env_parsed("QUOTA_HARD_LIMIT", 800_000u64),
            quota_model_overrides: model_quota_overrides(),

            rate_limit_cooldown_secs: env_parsed("RATE_LIMIT_COOLDOWN_SECONDS", 300i64),
            quota_exceeded_cooldown_secs: env_parsed("QUOTA_EXCEEDED_COOLDOWN_SECONDS", 14_400i64),

            response_completion_timeout_secs: env_parsed("RESPONSE_COMPLETION_TIMEOUT", 300.0f64),
            high_traffic_queue_threshold: env_parsed("HIGH_TRAFFIC_QUEUE_THRESHOLD", 5usize),
            rotation_depletion_guard_high_traffic: env_parsed("ROTATION_DEPLETION_GUARD_HIGH_TRAFFIC", 10usize),

            cookie_refresh_enabled: env_bool("COOKIE_REFRESH_ENABLED", false),
            cookie_refresh_interval_secs: env_parsed("COOKIE_REFRESH_INTERVAL_SECONDS", 3600u64),
            cookie_refresh_on_request_enabled: env_bool("COOKIE_REFRESH_ON_REQUEST_ENABLED", false),
            cookie_refresh_request_interval_secs: env_parsed("COOKIE_REFRESH_REQUEST_INTERVAL", 600u64),
            cookie_refresh_on_shutdown: env_bool("COOKIE_REFRESH_ON_SHUTDOWN", true),

            mcp_http_endpoint: env_string("MCP_HTTP_ENDPOINT"),
            mcp_http_timeout_secs: env_parsed("MCP_HTTP_TIMEOUT", 30u64),

            profile_base_dir: env_string("AUTH_PROFILE_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("auth_profiles")),
            cooldown_file_path: env_string("COOLDOWN_FILE_PATH").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("config/cooldowns.json")),
            usage_ledger_path: env_string("USAGE_LEDGER_PATH").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("config/profile_usage.json")),

            otlp_endpoint: env_string("OTEL_EXPORTER_OTLP_ENDPOINT"),
            service_name: env_string("OTEL_SERVICE_NAME").unwrap_or_else(|| "camoufox-gateway".to_string()),
        })
    }

    pub fn quota_limits(&self) -> crate::quota::QuotaLimits {
        crate::quota::QuotaLimits {
            soft_limit: self.quota_soft_limit,
            hard_limit: self.quota_hard_limit,
            per_model_overrides: self.quota_model_overrides.clone(),
        }
    }

    pub fn rotation_config(&self) -> crate::rotation::RotationConfig {
        crate::rotation::RotationConfig {
            auto_rotate: self.auto_rotate_auth_profile,
            depletion_guard_normal: 3,
            depletion_guard_high_traffic: self.rotation_depletion_guard_high_traffic,
            high_traffic_queue_threshold: self.high_traffic_queue_threshold,
            rotation_window_secs: 60,
            rate_limit_cooldown_secs: self.rate_limit_cooldown_secs,
            quota_exceeded_cooldown_secs: self.quota_exceeded_cooldown_secs,
            profile_base_dir: self.profile_base_dir.clone(),
            cooldown_file_path: self.cooldown_file_path.clone(),
            usage_ledger_path: self.usage_ledger_path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_overrides_are_parsed_and_normalized() {
        std::env::set_var("QUOTA_LIMIT_GEMINI_PRO", "900000");
        let overrides = model_quota_overrides();
        assert_eq!(overrides.get("gemini-pro"), Some(&900_000));
        std::env::remove_var("QUOTA_LIMIT_GEMINI_PRO");
    }

    #[test]
    fn launch_mode_defaults_to_headless() {
        assert!(matches!(LaunchMode::parse("bogus"), LaunchMode::Headless));
        assert!(matches!(LaunchMode::parse("debug"), LaunchMode::Debug));
    }
}
