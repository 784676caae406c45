use crate::parser::types::TestConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

const CONFIG_FILE: &str = ".mut.yaml";

/// Durations as numbers (seconds) or strings like "5s" / "500ms"
mod duration {
    use crate::parser::yaml::parse_duration;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use serde_yaml::Value;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{}ms", d.as_millis()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let value = Value::deserialize(d)?;
        parse_duration(&value).ok_or_else(|| D::Error::custom(format!("invalid duration: {:?}", value)))
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => super::serialize(d, s),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            match Value::deserialize(d)? {
                Value::Null => Ok(None),
                value => parse_duration(&value)
                    .map(Some)
                    .ok_or_else(|| D::Error::custom(format!("invalid duration: {:?}", value))),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Layer-1 window for actions that resolve a target; falls back to implicit_wait
    #[serde(with = "duration::option")]
    pub tap: Option<Duration>,
    #[serde(with = "duration")]
    pub wait_for: Duration,
    /// Per-call timeout of the vision judge
    #[serde(with = "duration")]
    pub verify_screen: Duration,
    /// Lookup window of if_present / if_absent
    #[serde(with = "duration")]
    pub condition: Duration,
    /// Layer-1 window after a recovery decision
    #[serde(with = "duration")]
    pub recovery_retry: Duration,
    /// Whole-test deadline
    #[serde(with = "duration::option")]
    pub test: Option<Duration>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            tap: None,
            wait_for: Duration::from_secs(10),
            verify_screen: Duration::from_secs(10),
            condition: Duration::from_secs(2),
            recovery_retry: Duration::from_secs(2),
            test: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Extra whole-step attempts for action steps
    pub count: u32,
    #[serde(with = "duration")]
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            count: 0,
            delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    #[serde(with = "duration")]
    pub implicit_wait: Duration,
    #[serde(with = "duration")]
    pub poll_interval: Duration,
    /// Consecutive identical frames required before a lookup
    pub stability_frames: u32,
    pub ai_recovery: bool,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            implicit_wait: Duration::from_secs(5),
            poll_interval: Duration::from_millis(500),
            stability_frames: 1,
            ai_recovery: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub max_concurrency: usize,
    pub max_retries: u32,
    #[serde(with = "duration")]
    pub backoff_base: Duration,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
            max_retries: 2,
            backoff_base: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrollConfig {
    pub max_scrolls: u32,
    pub distance_percent: f64,
}

impl Default for ScrollConfig {
    fn default() -> Self {
        Self {
            max_scrolls: 10,
            distance_percent: 30.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwipeConfig {
    #[serde(with = "duration")]
    pub duration: Duration,
    pub distance_percent: f64,
    /// Re-issue a swipe that left the screen unchanged
    pub retry_if_no_change: bool,
    /// Total swipe attempts when retrying
    pub retry_limit: u32,
    /// Pause before comparing the screen after a swipe
    #[serde(with = "duration")]
    pub settle: Duration,
}

impl Default for SwipeConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_millis(300),
            distance_percent: 30.0,
            retry_if_no_change: false,
            retry_limit: 3,
            settle: Duration::from_millis(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LongPressConfig {
    #[serde(with = "duration")]
    pub duration: Duration,
}

impl Default for LongPressConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_millis(500),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: Option<String>,
    pub google_api_key: Option<String>,
    pub model: String,
    pub verbose: bool,
    /// Application id used by launch_app/terminate_app when neither step nor test names one
    pub app: Option<String>,
    /// Attach a screenshot to every failed step
    pub snapshot_on_failure: bool,
    pub timeouts: Timeouts,
    pub retry: RetryConfig,
    pub resilience: ResilienceConfig,
    pub verification: VerificationConfig,
    pub scroll: ScrollConfig,
    pub swipe: SwipeConfig,
    pub long_press: LongPressConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: None,
            google_api_key: None,
            model: "gemini-2.0-flash".to_string(),
            verbose: false,
            app: None,
            snapshot_on_failure: false,
            timeouts: Timeouts::default(),
            retry: RetryConfig::default(),
            resilience: ResilienceConfig::default(),
            verification: VerificationConfig::default(),
            scroll: ScrollConfig::default(),
            swipe: SwipeConfig::default(),
            long_press: LongPressConfig::default(),
        }
    }
}

impl Config {
    /// Load `~/.mut.yaml`, then `./.mut.yaml`, then environment overrides
    pub fn load() -> Result<Self> {
        let global = dirs::home_dir().map(|h| h.join(CONFIG_FILE));
        let project = std::env::current_dir()
            .ok()
            .map(|d| d.join(CONFIG_FILE));
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::load_from(global.as_deref(), project.as_deref(), &env)
    }

    /// Layered load with explicit sources
    pub fn load_from(
        global: Option<&Path>,
        project: Option<&Path>,
        env: &HashMap<String, String>,
    ) -> Result<Self> {
        let mut merged = Value::Mapping(Default::default());

        for path in [global, project].into_iter().flatten() {
            if let Some(layer) = read_layer(path) {
                deep_merge(&mut merged, layer);
            }
        }

        let mut config: Config =
            serde_yaml::from_value(merged).context("Failed to build configuration")?;
        config.apply_env(env);
        Ok(config)
    }

    fn apply_env(&mut self, env: &HashMap<String, String>) {
        let get = |key: &str| env.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        if let Some(device) = get("MUT_DEVICE") {
            self.device = Some(device.to_string());
        }
        if let Some(key) = get("GOOGLE_API_KEY") {
            self.google_api_key = Some(key.to_string());
        }
        if let Some(v) = get("MUT_VERBOSE") {
            self.verbose = parse_bool(v);
        }
        if let Some(v) = get("MUT_IMPLICIT_WAIT") {
            match crate::parser::parse_duration_str(v) {
                Some(d) => self.resilience.implicit_wait = d,
                None => log::warn!("Ignoring invalid MUT_IMPLICIT_WAIT={}", v),
            }
        }
        if let Some(v) = get("MUT_AI_RECOVERY") {
            self.resilience.ai_recovery = parse_bool(v);
        }
    }

    /// Effective config for one test: the script's `config:` block wins
    pub fn with_test_overrides(&self, test: &TestConfig) -> Self {
        let mut config = self.clone();
        if test.app.is_some() {
            config.app = test.app.clone();
        }
        if test.device.is_some() {
            config.device = test.device.clone();
        }
        for (key, value) in &test.timeouts {
            let value = *value;
            match key.as_str() {
                "tap" => config.timeouts.tap = Some(value),
                "wait_for" => config.timeouts.wait_for = value,
                "verify_screen" => config.timeouts.verify_screen = value,
                "condition" => config.timeouts.condition = value,
                "recovery_retry" => config.timeouts.recovery_retry = value,
                "test" => config.timeouts.test = Some(value),
                "implicit_wait" => config.resilience.implicit_wait = value,
                other => log::warn!("Unknown timeout key '{}' in test config", other),
            }
        }
        config
    }

    /// Layer-1 window for target-resolving actions
    pub fn action_timeout(&self) -> Duration {
        self.timeouts.tap.unwrap_or(self.resilience.implicit_wait)
    }
}

pub fn parse_bool(v: &str) -> bool {
    matches!(v.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

/// Read one config file; unreadable or invalid files are skipped
fn read_layer(path: &Path) -> Option<Value> {
    if !path.is_file() {
        return None;
    }
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            log::warn!("Cannot read {}: {}", path.display(), e);
            return None;
        }
    };
    let value: Value = match serde_yaml::from_str(&content) {
        Ok(Value::Null) => return None,
        Ok(v @ Value::Mapping(_)) => v,
        Ok(_) => {
            log::warn!("Ignoring {}: top level must be a mapping", path.display());
            return None;
        }
        Err(e) => {
            log::warn!("Ignoring invalid config {}: {}", path.display(), e);
            return None;
        }
    };
    if let Err(e) = serde_yaml::from_value::<Config>(value.clone()) {
        log::warn!("Ignoring invalid config {}: {}", path.display(), e);
        return None;
    }
    log::debug!("Loaded config layer {}", path.display());
    Some(value)
}

/// Merge `overlay` into `base`; nested mappings merge key by key
fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                let nested = value.is_mapping()
                    && base_map.get(&key).map_or(false, Value::is_mapping);
                match base_map.get_mut(&key) {
                    Some(existing) if nested => deep_merge(existing, value),
                    _ => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
