//! Configuration loading with env-var overrides.
//!
//! Reads `config/default.toml` relative to the current working directory,
//! then applies `DOSSIER_DATA_DIR` and `DOSSIER_LOG_LEVEL` env overrides.
//! The generator API key comes only from the `LLM_API_KEY` env var —
//! never from TOML.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::error::KbError;

/// Generator (LLM endpoint) configuration, from `[generator]`.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Which backend is active (`"openai"` or `"scripted"`).
    pub provider: String,
    /// Full chat completions endpoint URL.
    pub api_base_url: String,
    /// Model name passed in the request body.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Per-request HTTP timeout in seconds.
    pub timeout_seconds: u64,
}

/// Resource and retry limits, from `[limits]`.
#[derive(Debug, Clone)]
pub struct LimitsConfig {
    /// How many snapshots are auto-registered (metadata-only) at bootstrap.
    pub max_resident_full: usize,
    /// Snapshots larger than this are skipped during bulk enumeration.
    pub max_snapshot_bytes: u64,
    /// Global admission: concurrent first-time builds across all keys.
    pub max_concurrent_builds: usize,
    /// Call-and-parse cycles before a generation is abandoned.
    pub max_generation_attempts: u32,
    /// Linear backoff unit between generation attempts.
    pub retry_base_delay_ms: u64,
    /// Serialized prompt inputs are capped at this many characters.
    pub max_input_chars: usize,
    /// At most this many prior history items feed a regeneration prompt.
    pub history_fan_in: usize,
    /// Process memory ceiling consulted by the refresh scheduler.
    pub memory_ceiling_mb: u64,
}

/// When the scheduled refresh fires, from `[scheduler.trigger]`.
#[derive(Debug, Clone)]
pub enum TriggerConfig {
    /// Daily at a fixed wall-clock time in a fixed UTC offset.
    DailyAt { hour: u32, minute: u32, utc_offset_minutes: i32 },
    /// Every N seconds, starting one interval after startup.
    Interval { every_secs: u64 },
}

/// Batch refresh scheduler configuration, from `[scheduler]`.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Whether the trigger is registered at all.
    pub enabled: bool,
    /// Whether the registered trigger starts firing without manual action.
    pub auto_start: bool,
    pub trigger: TriggerConfig,
    /// Keys per sequential batch.
    pub batch_size: usize,
    /// Pause after each key, letting working buffers drop before the next.
    pub inter_key_delay_ms: u64,
    /// Longer pause between batches.
    pub inter_batch_delay_ms: u64,
}

/// Fully-resolved service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub service_name: String,
    /// Directory holding the `records/` snapshot tree (already expanded, no `~`).
    pub data_dir: PathBuf,
    pub log_level: String,
    /// Retrieval-augmented `ask` by default; `false` switches to the fixed
    /// "unavailable" fallback.
    pub ask_enabled: bool,
    pub generator: GeneratorConfig,
    pub limits: LimitsConfig,
    pub scheduler: SchedulerConfig,
    /// API key from `LLM_API_KEY` — `None` for keyless local models.
    pub llm_api_key: Option<String>,
}

// ── Raw TOML shapes — serde targets before resolution ────────────────────────

#[derive(Deserialize)]
struct RawConfig {
    service: RawService,
    #[serde(default)]
    generator: RawGenerator,
    #[serde(default)]
    limits: RawLimits,
    #[serde(default)]
    scheduler: RawScheduler,
}

#[derive(Deserialize)]
struct RawService {
    name: String,
    data_dir: String,
    log_level: String,
    #[serde(default = "default_true")]
    ask_enabled: bool,
}

#[derive(Deserialize)]
struct RawGenerator {
    #[serde(default = "default_provider")]
    provider: String,
    #[serde(default = "default_api_base_url")]
    api_base_url: String,
    #[serde(default = "default_model")]
    model: String,
    #[serde(default = "default_temperature")]
    temperature: f32,
    #[serde(default = "default_timeout_seconds")]
    timeout_seconds: u64,
}

impl Default for RawGenerator {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_base_url: default_api_base_url(),
            model: default_model(),
            temperature: default_temperature(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

fn default_provider() -> String { "scripted".to_string() }
fn default_api_base_url() -> String { "https://api.novita.ai/openai/v1/chat/completions".to_string() }
fn default_model() -> String { "deepseek/deepseek-r1-distill-qwen-32b".to_string() }
fn default_temperature() -> f32 { 0.2 }
fn default_timeout_seconds() -> u64 { 60 }

#[derive(Deserialize)]
struct RawLimits {
    #[serde(default = "default_max_resident_full")]
    max_resident_full: usize,
    #[serde(default = "default_max_snapshot_bytes")]
    max_snapshot_bytes: u64,
    #[serde(default = "default_max_concurrent_builds")]
    max_concurrent_builds: usize,
    #[serde(default = "default_max_generation_attempts")]
    max_generation_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    retry_base_delay_ms: u64,
    #[serde(default = "default_max_input_chars")]
    max_input_chars: usize,
    #[serde(default = "default_history_fan_in")]
    history_fan_in: usize,
    #[serde(default = "default_memory_ceiling_mb")]
    memory_ceiling_mb: u64,
}

impl Default for RawLimits {
    fn default() -> Self {
        Self {
            max_resident_full: default_max_resident_full(),
            max_snapshot_bytes: default_max_snapshot_bytes(),
            max_concurrent_builds: default_max_concurrent_builds(),
            max_generation_attempts: default_max_generation_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            max_input_chars: default_max_input_chars(),
            history_fan_in: default_history_fan_in(),
            memory_ceiling_mb: default_memory_ceiling_mb(),
        }
    }
}

fn default_max_resident_full() -> usize { 10 }
fn default_max_snapshot_bytes() -> u64 { 5 * 1024 * 1024 }
fn default_max_concurrent_builds() -> usize { 2 }
fn default_max_generation_attempts() -> u32 { 3 }
fn default_retry_base_delay_ms() -> u64 { 1000 }
fn default_max_input_chars() -> usize { 8000 }
fn default_history_fan_in() -> usize { 5 }
fn default_memory_ceiling_mb() -> u64 { 3072 }

#[derive(Deserialize)]
struct RawScheduler {
    #[serde(default = "default_false")]
    enabled: bool,
    #[serde(default = "default_false")]
    auto_start: bool,
    #[serde(default)]
    trigger: RawTrigger,
    #[serde(default = "default_batch_size")]
    batch_size: usize,
    #[serde(default = "default_inter_key_delay_ms")]
    inter_key_delay_ms: u64,
    #[serde(default = "default_inter_batch_delay_ms")]
    inter_batch_delay_ms: u64,
}

impl Default for RawScheduler {
    fn default() -> Self {
        Self {
            enabled: default_false(),
            auto_start: default_false(),
            trigger: RawTrigger::default(),
            batch_size: default_batch_size(),
            inter_key_delay_ms: default_inter_key_delay_ms(),
            inter_batch_delay_ms: default_inter_batch_delay_ms(),
        }
    }
}

#[derive(Deserialize)]
struct RawTrigger {
    /// `"daily"` or `"interval"`.
    #[serde(default = "default_trigger_kind")]
    kind: String,
    #[serde(default = "default_trigger_hour")]
    hour: u32,
    #[serde(default)]
    minute: u32,
    /// Offset of the trigger's wall clock from UTC, in minutes.
    #[serde(default = "default_utc_offset_minutes")]
    utc_offset_minutes: i32,
    #[serde(default = "default_every_secs")]
    every_secs: u64,
}

impl Default for RawTrigger {
    fn default() -> Self {
        Self {
            kind: default_trigger_kind(),
            hour: default_trigger_hour(),
            minute: 0,
            utc_offset_minutes: default_utc_offset_minutes(),
            every_secs: default_every_secs(),
        }
    }
}

fn default_trigger_kind() -> String { "daily".to_string() }
fn default_trigger_hour() -> u32 { 2 }
// Africa/Nairobi (UTC+3) — the deployment the defaults were tuned for.
fn default_utc_offset_minutes() -> i32 { 180 }
fn default_every_secs() -> u64 { 86_400 }
fn default_batch_size() -> usize { 2 }
fn default_inter_key_delay_ms() -> u64 { 2000 }
fn default_inter_batch_delay_ms() -> u64 { 10_000 }

fn default_true() -> bool { true }
fn default_false() -> bool { false }

// ── Loading ──────────────────────────────────────────────────────────────────

/// Load config from `config/default.toml`, then apply env-var overrides.
pub fn load() -> Result<Config, KbError> {
    let data_dir_override = env::var("DOSSIER_DATA_DIR").ok();
    let log_level_override = env::var("DOSSIER_LOG_LEVEL").ok();
    load_from(
        Path::new("config/default.toml"),
        data_dir_override.as_deref(),
        log_level_override.as_deref(),
    )
}

/// Internal loader — accepts an explicit path and optional overrides.
/// Tests pass overrides directly instead of mutating env vars.
pub fn load_from(
    path: &Path,
    data_dir_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<Config, KbError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| KbError::Config(format!("cannot read {}: {e}", path.display())))?;

    let parsed: RawConfig = toml::from_str(&raw)
        .map_err(|e| KbError::Config(format!("parse error in {}: {e}", path.display())))?;

    let s = parsed.service;
    let data_dir_str = data_dir_override.unwrap_or(&s.data_dir).to_string();
    let data_dir = expand_home(&data_dir_str);
    let log_level = log_level_override.unwrap_or(&s.log_level).to_string();
    crate::logger::parse_level(&log_level)?;

    let trigger = resolve_trigger(&parsed.scheduler.trigger)?;

    Ok(Config {
        service_name: s.name,
        data_dir,
        log_level,
        ask_enabled: s.ask_enabled,
        generator: GeneratorConfig {
            provider: parsed.generator.provider,
            api_base_url: parsed.generator.api_base_url,
            model: parsed.generator.model,
            temperature: parsed.generator.temperature,
            timeout_seconds: parsed.generator.timeout_seconds,
        },
        limits: LimitsConfig {
            max_resident_full: parsed.limits.max_resident_full,
            max_snapshot_bytes: parsed.limits.max_snapshot_bytes,
            max_concurrent_builds: parsed.limits.max_concurrent_builds,
            max_generation_attempts: parsed.limits.max_generation_attempts.max(1),
            retry_base_delay_ms: parsed.limits.retry_base_delay_ms,
            max_input_chars: parsed.limits.max_input_chars,
            history_fan_in: parsed.limits.history_fan_in,
            memory_ceiling_mb: parsed.limits.memory_ceiling_mb,
        },
        scheduler: SchedulerConfig {
            enabled: parsed.scheduler.enabled,
            auto_start: parsed.scheduler.auto_start,
            trigger,
            batch_size: parsed.scheduler.batch_size.max(1),
            inter_key_delay_ms: parsed.scheduler.inter_key_delay_ms,
            inter_batch_delay_ms: parsed.scheduler.inter_batch_delay_ms,
        },
        llm_api_key: env::var("LLM_API_KEY").ok(),
    })
}

fn resolve_trigger(raw: &RawTrigger) -> Result<TriggerConfig, KbError> {
    match raw.kind.as_str() {
        "daily" => {
            if raw.hour > 23 || raw.minute > 59 {
                return Err(KbError::Config(format!(
                    "invalid daily trigger time {:02}:{:02}",
                    raw.hour, raw.minute
                )));
            }
            Ok(TriggerConfig::DailyAt {
                hour: raw.hour,
                minute: raw.minute,
                utc_offset_minutes: raw.utc_offset_minutes,
            })
        }
        "interval" => {
            if raw.every_secs == 0 {
                return Err(KbError::Config("interval trigger requires every_secs > 0".into()));
            }
            Ok(TriggerConfig::Interval { every_secs: raw.every_secs })
        }
        other => Err(KbError::Config(format!("unknown trigger kind: '{other}'"))),
    }
}

/// Expand a leading `~` to the user's home directory.
/// Absolute or relative paths without `~` are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

// ── test helpers ──────────────────────────────────────────────────────────────

/// Safe `Config` for tests — scripted generator, zero scheduler delays,
/// no API keys, no external calls.
impl Config {
    pub fn test_default(data_dir: &Path) -> Self {
        Self {
            service_name: "test".into(),
            data_dir: data_dir.to_path_buf(),
            log_level: "info".into(),
            ask_enabled: true,
            generator: GeneratorConfig {
                provider: "scripted".into(),
                api_base_url: "http://localhost:0/v1/chat/completions".into(),
                model: "test-model".into(),
                temperature: 0.0,
                timeout_seconds: 1,
            },
            limits: LimitsConfig {
                max_resident_full: 10,
                max_snapshot_bytes: 5 * 1024 * 1024,
                max_concurrent_builds: 2,
                max_generation_attempts: 3,
                retry_base_delay_ms: 0,
                max_input_chars: 8000,
                history_fan_in: 5,
                memory_ceiling_mb: 3072,
            },
            scheduler: SchedulerConfig {
                enabled: false,
                auto_start: false,
                trigger: TriggerConfig::Interval { every_secs: 86_400 },
                batch_size: 2,
                inter_key_delay_ms: 0,
                inter_batch_delay_ms: 0,
            },
            llm_api_key: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MINIMAL_TOML: &str = r#"
[service]
name = "test-svc"
data_dir = "~/.dossier"
log_level = "info"
"#;

    fn write_toml(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn parse_basic_config() {
        let f = write_toml(MINIMAL_TOML);
        let cfg = load_from(f.path(), None, None).unwrap();
        assert_eq!(cfg.service_name, "test-svc");
        assert_eq!(cfg.log_level, "info");
        // Baseline knobs come from defaults.
        assert_eq!(cfg.limits.max_concurrent_builds, 2);
        assert_eq!(cfg.limits.max_generation_attempts, 3);
        assert_eq!(cfg.limits.max_snapshot_bytes, 5 * 1024 * 1024);
        assert_eq!(cfg.scheduler.batch_size, 2);
        assert!(!cfg.scheduler.enabled);
    }

    #[test]
    fn daily_trigger_resolves() {
        let f = write_toml(&format!(
            "{MINIMAL_TOML}\n[scheduler]\nenabled = true\n\n[scheduler.trigger]\nkind = \"daily\"\nhour = 2\nminute = 30\n"
        ));
        let cfg = load_from(f.path(), None, None).unwrap();
        match cfg.scheduler.trigger {
            TriggerConfig::DailyAt { hour, minute, .. } => {
                assert_eq!(hour, 2);
                assert_eq!(minute, 30);
            }
            _ => panic!("expected daily trigger"),
        }
    }

    #[test]
    fn bad_trigger_kind_errors() {
        let f = write_toml(&format!(
            "{MINIMAL_TOML}\n[scheduler.trigger]\nkind = \"hourly\"\n"
        ));
        let err = load_from(f.path(), None, None).unwrap_err();
        assert!(err.to_string().contains("hourly"));
    }

    #[test]
    fn bad_daily_time_errors() {
        let f = write_toml(&format!(
            "{MINIMAL_TOML}\n[scheduler.trigger]\nkind = \"daily\"\nhour = 25\n"
        ));
        assert!(load_from(f.path(), None, None).is_err());
    }

    #[test]
    fn data_dir_override_wins() {
        let f = write_toml(MINIMAL_TOML);
        let cfg = load_from(f.path(), Some("/tmp/test-override"), None).unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/test-override"));
    }

    #[test]
    fn log_level_override_wins() {
        let f = write_toml(MINIMAL_TOML);
        let cfg = load_from(f.path(), None, Some("debug")).unwrap();
        assert_eq!(cfg.log_level, "debug");
    }

    #[test]
    fn invalid_log_level_rejected_at_load() {
        let f = write_toml(MINIMAL_TOML);
        let err = load_from(f.path(), None, Some("verbose")).unwrap_err();
        assert!(err.to_string().contains("verbose"));
    }

    #[test]
    fn tilde_expands_to_home() {
        let home = dirs::home_dir().expect("home dir must exist in test env");
        let expanded = expand_home("~/.dossier");
        assert!(expanded.starts_with(&home));
        assert!(expanded.ends_with(".dossier"));
    }

    #[test]
    fn missing_file_errors() {
        let result = load_from(Path::new("/nonexistent/config.toml"), None, None);
        assert!(result.unwrap_err().to_string().contains("config error"));
    }
}
