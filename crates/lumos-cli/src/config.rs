//! Operator configuration – reads/writes `~/.lumos/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lumos_kernel::WatchdogConfig;
use lumos_runtime::{EngineConfig, SystemConfig};
use serde::{Deserialize, Serialize};

/// Persisted operator configuration.
///
/// Every field has its own default so a partial file still loads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Period between heartbeats to the external supervisor.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Maximum time one heartbeat iteration may take.
    #[serde(default = "default_heartbeat_budget_ms")]
    pub heartbeat_budget_ms: u64,

    /// Silence after which the supervisor cuts laser power on its own.
    #[serde(default = "default_supervisor_timeout_ms")]
    pub supervisor_timeout_ms: u64,

    /// Highest laser power, in watts, any protocol may command.
    #[serde(default = "default_power_ceiling_w")]
    pub power_ceiling_w: f64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_line_timeout_s")]
    pub line_timeout_s: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// JSON-lines audit log.  Defaults to `~/.lumos/audit.jsonl`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_log: Option<PathBuf>,

    /// Set to `false` to run without an audit trail.
    #[serde(default = "default_audit_enabled")]
    pub audit_enabled: bool,
}

fn default_heartbeat_interval_ms() -> u64 {
    500
}
fn default_heartbeat_budget_ms() -> u64 {
    400
}
fn default_supervisor_timeout_ms() -> u64 {
    1000
}
fn default_power_ceiling_w() -> f64 {
    5.0
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    1000
}
fn default_line_timeout_s() -> u64 {
    120
}
fn default_poll_interval_ms() -> u64 {
    50
}
fn default_audit_enabled() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_budget_ms: default_heartbeat_budget_ms(),
            supervisor_timeout_ms: default_supervisor_timeout_ms(),
            power_ceiling_w: default_power_ceiling_w(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            line_timeout_s: default_line_timeout_s(),
            poll_interval_ms: default_poll_interval_ms(),
            audit_log: None,
            audit_enabled: default_audit_enabled(),
        }
    }
}

impl Config {
    /// Audit log location, or `None` when auditing is disabled.
    pub fn audit_path(&self, home: &Path) -> Option<PathBuf> {
        if !self.audit_enabled {
            return None;
        }
        Some(
            self.audit_log
                .clone()
                .unwrap_or_else(|| home.join(".lumos").join("audit.jsonl")),
        )
    }

    /// Turn the persisted values into the library configuration.
    ///
    /// Fails when the heartbeat timings leave no margin before the
    /// supervisor timeout or the power ceiling is not a positive number.
    pub fn system_config(&self, home: &Path) -> Result<SystemConfig, String> {
        let watchdog = WatchdogConfig::new(
            Duration::from_millis(self.heartbeat_interval_ms),
            Duration::from_millis(self.heartbeat_budget_ms),
            Duration::from_millis(self.supervisor_timeout_ms),
        )
        .map_err(|e| format!("Invalid heartbeat settings: {e}"))?;
        if !(self.power_ceiling_w.is_finite() && self.power_ceiling_w > 0.0) {
            return Err(format!(
                "Invalid power ceiling {} W: must be a positive number",
                self.power_ceiling_w
            ));
        }
        Ok(SystemConfig {
            watchdog,
            engine: EngineConfig {
                max_attempts: self.max_attempts,
                retry_backoff: Duration::from_millis(self.retry_backoff_ms),
                line_timeout: Duration::from_secs(self.line_timeout_s),
                poll_interval: Duration::from_millis(self.poll_interval_ms),
                power_ceiling_w: self.power_ceiling_w,
            },
            audit_path: self.audit_path(home),
        })
    }
}

/// The operator's home directory, or `.` when none is set.
pub fn home_dir() -> PathBuf {
    PathBuf::from(
        std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Return the path to `~/.lumos/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home_dir())
}

pub(crate) fn config_path_for_home(home: &Path) -> PathBuf {
    home.join(".lumos").join("config.toml")
}

/// Load the config from disk with `LUMOS_*` overrides applied.  Returns
/// `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    let mut cfg = load_from(&config_path())?;
    if let Some(cfg) = cfg.as_mut() {
        apply_env_overrides(cfg);
    }
    Ok(cfg)
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `LUMOS_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `LUMOS_POWER_CEILING_W` | `power_ceiling_w` |
/// | `LUMOS_HEARTBEAT_INTERVAL_MS` | `heartbeat_interval_ms` |
/// | `LUMOS_SUPERVISOR_TIMEOUT_MS` | `supervisor_timeout_ms` |
/// | `LUMOS_AUDIT_LOG` | `audit_log` |
///
/// Unparseable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("LUMOS_POWER_CEILING_W")
        && let Ok(watts) = v.parse::<f64>()
    {
        cfg.power_ceiling_w = watts;
    }
    if let Ok(v) = std::env::var("LUMOS_HEARTBEAT_INTERVAL_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.heartbeat_interval_ms = ms;
    }
    if let Ok(v) = std::env::var("LUMOS_SUPERVISOR_TIMEOUT_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.supervisor_timeout_ms = ms;
    }
    if let Ok(v) = std::env::var("LUMOS_AUDIT_LOG")
        && !v.is_empty()
    {
        cfg.audit_log = Some(PathBuf::from(v));
    }
}

/// Save the config to disk, creating `~/.lumos/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
