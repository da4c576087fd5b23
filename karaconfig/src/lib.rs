//! # KaraHost configuration
//!
//! YAML configuration of the display host:
//! - embedded defaults (`karahost.yaml`) merged with `config.yaml` from the
//!   configuration directory
//! - environment overrides `KARAHOST_CONFIG__SECTION__KEY=value`
//! - typed getters falling back to defaults
//! - a lazily loaded global instance
//!
//! ```no_run
//! use karaconfig::get_config;
//!
//! let config = get_config();
//! let server = config.get_server_url();
//! let up_next = config.get_up_next_count();
//! config.set_server_url("http://192.168.1.20:8000")?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, anyhow};
use dirs::home_dir;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use serde_yaml::{Mapping, Number, Value};
use tracing::{debug, info, warn};

const DEFAULT_CONFIG: &str = include_str!("karahost.yaml");

/// Environment variable naming the configuration directory
pub const ENV_CONFIG_DIR: &str = "KARAHOST_CONFIG";
const ENV_PREFIX: &str = "KARAHOST_CONFIG__";
const CONFIG_DIR_NAME: &str = ".karahost";
const CONFIG_FILE_NAME: &str = "config.yaml";

const DEFAULT_SERVER_URL: &str = "http://localhost:8000";
const DEFAULT_EVENTS_PATH: &str = "/sse";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 45;
const DEFAULT_RECONNECT_INITIAL_DELAY_MS: u64 = 500;
const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_RECONNECT_MAX_ATTEMPTS: u64 = 10;
const DEFAULT_KEY_TRACK_BASE: i64 = 4;
const DEFAULT_MANIFEST_TEMPLATE: &str = "dash/{id}/{id}.mpd";
const DEFAULT_AUTOPLAY: bool = true;
const DEFAULT_HYDRATE_ON_START: bool = true;
const DEFAULT_UP_NEXT: u64 = 2;
const DEFAULT_LOG_MIN_LEVEL: &str = "INFO";
const DEFAULT_LOG_ENABLE_CONSOLE: bool = true;

lazy_static! {
    static ref CONFIG: Arc<Config> = Arc::new(Config::load_or_default(""));
}

macro_rules! impl_u64_config {
    ($getter:ident, $setter:ident, $path:expr, $default:expr) => {
        pub fn $getter(&self) -> u64 {
            match self.get_value($path) {
                Ok(Value::Number(n)) if n.as_u64().is_some() => n.as_u64().unwrap_or($default),
                Ok(Value::String(s)) if s.trim().parse::<u64>().is_ok() => {
                    s.trim().parse().unwrap_or($default)
                }
                Ok(other) => {
                    warn!(path = %$path.join("."), value = ?other, default = $default, "not an unsigned integer, using default");
                    $default
                }
                Err(_) => $default,
            }
        }

        pub fn $setter(&self, value: u64) -> Result<()> {
            self.set_value($path, Value::Number(Number::from(value)))
        }
    };
}

macro_rules! impl_bool_config {
    ($getter:ident, $setter:ident, $path:expr, $default:expr) => {
        pub fn $getter(&self) -> bool {
            match self.get_value($path) {
                Ok(Value::Bool(b)) => b,
                Ok(other) => {
                    warn!(path = %$path.join("."), value = ?other, default = $default, "not a boolean, using default");
                    $default
                }
                Err(_) => $default,
            }
        }

        pub fn $setter(&self, value: bool) -> Result<()> {
            self.set_value($path, Value::Bool(value))
        }
    };
}

macro_rules! impl_string_config {
    ($getter:ident, $setter:ident, $path:expr, $default:expr) => {
        pub fn $getter(&self) -> String {
            match self.get_value($path) {
                Ok(Value::String(s)) if !s.trim().is_empty() => s,
                _ => $default.to_string(),
            }
        }

        pub fn $setter(&self, value: impl Into<String>) -> Result<()> {
            self.set_value($path, Value::String(value.into()))
        }
    };
}

/// Configuration of the display host.
///
/// Values live in a YAML tree; every setter writes the file back, except for
/// an in-memory configuration (see [`Config::in_memory`]).
#[derive(Debug)]
pub struct Config {
    config_dir: Option<PathBuf>,
    path: Option<PathBuf>,
    data: Mutex<Value>,
    load_error: Option<String>,
    overrides: Vec<String>,
}

impl Clone for Config {
    fn clone(&self) -> Self {
        Self {
            config_dir: self.config_dir.clone(),
            path: self.path.clone(),
            data: Mutex::new(self.data.lock().clone()),
            load_error: self.load_error.clone(),
            overrides: self.overrides.clone(),
        }
    }
}

impl Config {
    /// Picks the configuration directory.
    ///
    /// Order: `directory` if not empty, `$KARAHOST_CONFIG`, `./.karahost`,
    /// `~/.karahost`, and finally `./.karahost` (created later).
    pub fn find_config_dir(directory: &str) -> PathBuf {
        if !directory.is_empty() {
            return PathBuf::from(directory);
        }

        if let Ok(from_env) = env::var(ENV_CONFIG_DIR) {
            if !from_env.is_empty() {
                info!(env_var = ENV_CONFIG_DIR, path = %from_env, "config directory from environment");
                return PathBuf::from(from_env);
            }
        }

        let local = PathBuf::from(CONFIG_DIR_NAME);
        if local.exists() {
            return local;
        }

        if let Some(home) = home_dir() {
            let in_home = home.join(CONFIG_DIR_NAME);
            if in_home.exists() {
                return in_home;
            }
        }

        local
    }

    /// Creates the directory if needed and checks it can be read and written.
    fn prepare_config_dir(path: &Path) -> Result<()> {
        if !path.exists() {
            fs::create_dir_all(path)?;
        }
        if !path.is_dir() {
            return Err(anyhow!("{} is not a directory", path.display()));
        }

        let marker = path.join(".write_test");
        fs::write(&marker, b"karahost")?;
        fs::remove_file(&marker)?;
        fs::read_dir(path)?;
        Ok(())
    }

    /// Loads the configuration from `directory` (empty for the default search).
    ///
    /// The embedded defaults are merged with `config.yaml`, keys are
    /// lower-cased, environment overrides are applied, and the result is
    /// written back to `config.yaml`.
    pub fn load_config(directory: &str) -> Result<Self> {
        let config_dir = Self::find_config_dir(directory);
        Self::prepare_config_dir(&config_dir)?;
        info!(config_dir = %config_dir.display(), "using config directory");

        let path = config_dir.join(CONFIG_FILE_NAME);
        let mut tree: Value = serde_yaml::from_str(DEFAULT_CONFIG)?;

        match fs::read_to_string(&path) {
            Ok(text) => {
                info!(config_file = %path.display(), "loaded config file");
                let external: Value = serde_yaml::from_str(&text)?;
                // Un fichier vide se lit comme null : rien à fusionner.
                if !external.is_null() {
                    merge_yaml(&mut tree, &lower_keys(external));
                }
            }
            Err(_) => {
                info!(config_file = %path.display(), "no config file, using embedded defaults");
            }
        }

        let mut tree = lower_keys(tree);
        let overrides = apply_env_overrides(&mut tree, env::vars());

        let config = Config {
            config_dir: Some(config_dir),
            path: Some(path),
            data: Mutex::new(tree),
            load_error: None,
            overrides,
        };
        config.save()?;
        Ok(config)
    }

    /// Loads from `directory`, or falls back to the in-memory defaults.
    pub fn load_or_default(directory: &str) -> Self {
        match Self::load_config(directory) {
            Ok(config) => config,
            Err(err) => {
                warn!(error = %err, "cannot load configuration, using built-in defaults");
                Self {
                    load_error: Some(format!("{err:#}")),
                    ..Self::in_memory()
                }
            }
        }
    }

    /// Embedded defaults plus environment overrides, never saved.
    pub fn in_memory() -> Self {
        let mut tree = serde_yaml::from_str::<Value>(DEFAULT_CONFIG)
            .map(lower_keys)
            .unwrap_or_else(|_| Value::Mapping(Mapping::new()));
        let overrides = apply_env_overrides(&mut tree, env::vars());
        Config {
            config_dir: None,
            path: None,
            data: Mutex::new(tree),
            load_error: None,
            overrides,
        }
    }

    pub fn config_dir(&self) -> Option<&Path> {
        self.config_dir.as_deref()
    }

    /// Why the configuration directory was rejected, when the built-in
    /// defaults were used instead.
    pub fn load_error(&self) -> Option<&str> {
        self.load_error.as_deref()
    }

    /// Environment variables applied on top of the file.
    pub fn overrides(&self) -> &[String] {
        &self.overrides
    }

    /// Writes the tree to `config.yaml`; no-op for an in-memory configuration.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let yaml = serde_yaml::to_string(&*self.data.lock())?;
        fs::write(path, yaml)?;
        debug!(config_file = %path.display(), "configuration saved");
        Ok(())
    }

    /// Sets the value at `path` (e.g. `&["server", "url"]`) and saves.
    pub fn set_value(&self, path: &[&str], value: Value) -> Result<()> {
        set_in_tree(&mut self.data.lock(), path, value)?;
        self.save()
    }

    /// Value at `path`; error when a segment is missing.
    pub fn get_value(&self, path: &[&str]) -> Result<Value> {
        let data = self.data.lock();
        let mut node = &*data;
        for (depth, segment) in path.iter().enumerate() {
            let Value::Mapping(map) = node else {
                return Err(anyhow!("{} is not a mapping", path[..depth].join(".")));
            };
            node = map
                .get(segment.to_lowercase().as_str())
                .ok_or_else(|| anyhow!("{} is not set", path[..=depth].join(".")))?;
        }
        Ok(node.clone())
    }

    impl_string_config!(
        get_server_url,
        set_server_url,
        &["server", "url"],
        DEFAULT_SERVER_URL
    );

    impl_string_config!(
        get_events_path,
        set_events_path,
        &["server", "events_path"],
        DEFAULT_EVENTS_PATH
    );

    impl_u64_config!(
        get_request_timeout_secs,
        set_request_timeout_secs,
        &["server", "request_timeout_secs"],
        DEFAULT_REQUEST_TIMEOUT_SECS
    );

    impl_u64_config!(
        get_idle_timeout_secs,
        set_idle_timeout_secs,
        &["stream", "idle_timeout_secs"],
        DEFAULT_IDLE_TIMEOUT_SECS
    );

    impl_u64_config!(
        get_reconnect_initial_delay_ms,
        set_reconnect_initial_delay_ms,
        &["stream", "reconnect", "initial_delay_ms"],
        DEFAULT_RECONNECT_INITIAL_DELAY_MS
    );

    impl_u64_config!(
        get_reconnect_max_delay_ms,
        set_reconnect_max_delay_ms,
        &["stream", "reconnect", "max_delay_ms"],
        DEFAULT_RECONNECT_MAX_DELAY_MS
    );

    /// Reconnect attempts before giving up; `None` retries forever.
    ///
    /// An explicit `null` (or `unbounded`) in the file means no limit.
    pub fn get_reconnect_max_attempts(&self) -> Option<u32> {
        let path = &["stream", "reconnect", "max_attempts"];
        match self.get_value(path) {
            Ok(Value::Null) => None,
            Ok(Value::String(s)) if s.eq_ignore_ascii_case("unbounded") => None,
            Ok(Value::Number(n)) if n.as_u64().is_some() => n
                .as_u64()
                .map(|n| u32::try_from(n).unwrap_or(u32::MAX)),
            Ok(other) => {
                warn!(value = ?other, "invalid stream.reconnect.max_attempts, using default");
                Some(DEFAULT_RECONNECT_MAX_ATTEMPTS as u32)
            }
            Err(_) => Some(DEFAULT_RECONNECT_MAX_ATTEMPTS as u32),
        }
    }

    pub fn set_reconnect_max_attempts(&self, attempts: Option<u32>) -> Result<()> {
        let value = attempts.map_or(Value::Null, |n| Value::Number(Number::from(n)));
        self.set_value(&["stream", "reconnect", "max_attempts"], value)
    }

    /// Audio track id for a zero key offset.
    pub fn get_key_track_base(&self) -> i32 {
        match self.get_value(&["player", "key_track_base"]) {
            Ok(Value::Number(n)) => n
                .as_i64()
                .and_then(|n| i32::try_from(n).ok())
                .unwrap_or(DEFAULT_KEY_TRACK_BASE as i32),
            _ => DEFAULT_KEY_TRACK_BASE as i32,
        }
    }

    pub fn set_key_track_base(&self, base: i32) -> Result<()> {
        self.set_value(&["player", "key_track_base"], Value::Number(Number::from(base)))
    }

    impl_string_config!(
        get_manifest_template,
        set_manifest_template,
        &["player", "manifest_template"],
        DEFAULT_MANIFEST_TEMPLATE
    );

    impl_bool_config!(
        get_autoplay,
        set_autoplay,
        &["player", "autoplay"],
        DEFAULT_AUTOPLAY
    );

    impl_bool_config!(
        get_hydrate_on_start,
        set_hydrate_on_start,
        &["player", "hydrate_on_start"],
        DEFAULT_HYDRATE_ON_START
    );

    /// Value encoded in the QR banner, `None` when not configured.
    pub fn get_qr_code(&self) -> Option<String> {
        match self.get_value(&["display", "qr_code"]) {
            Ok(Value::String(s)) if !s.trim().is_empty() => Some(s),
            _ => None,
        }
    }

    pub fn set_qr_code(&self, value: impl Into<String>) -> Result<()> {
        self.set_value(&["display", "qr_code"], Value::String(value.into()))
    }

    /// Number of queued songs shown in the "up next" list.
    pub fn get_up_next_count(&self) -> usize {
        usize::try_from(self.get_up_next()).unwrap_or(usize::MAX)
    }

    impl_u64_config!(
        get_up_next,
        set_up_next,
        &["display", "up_next"],
        DEFAULT_UP_NEXT
    );

    impl_string_config!(
        get_log_min_level,
        set_log_min_level,
        &["logger", "min_level"],
        DEFAULT_LOG_MIN_LEVEL
    );

    impl_bool_config!(
        get_log_enable_console,
        set_log_enable_console,
        &["logger", "enable_console"],
        DEFAULT_LOG_ENABLE_CONSOLE
    );
}

/// Global configuration, loaded on first access.
///
/// When no configuration directory is usable the built-in defaults are used.
pub fn get_config() -> Arc<Config> {
    CONFIG.clone()
}

fn set_in_tree(node: &mut Value, path: &[&str], value: Value) -> Result<()> {
    let Some((first, rest)) = path.split_first() else {
        *node = value;
        return Ok(());
    };
    let Value::Mapping(map) = node else {
        return Err(anyhow!("cannot set {first}: parent is not a mapping"));
    };

    let key = Value::String(first.to_lowercase());
    if rest.is_empty() {
        map.insert(key, value);
        Ok(())
    } else {
        let child = map
            .entry(key)
            .or_insert(Value::Mapping(Mapping::new()));
        set_in_tree(child, rest, value)
    }
}

// Overrides `KARAHOST_CONFIG__A__B=v` ; la valeur est relue comme du YAML.
fn apply_env_overrides(
    tree: &mut Value,
    vars: impl IntoIterator<Item = (String, String)>,
) -> Vec<String> {
    let mut applied = Vec::new();
    for (name, raw) in vars {
        let Some(path) = name.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let segments: Vec<&str> = path.split("__").filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            continue;
        }
        let value = serde_yaml::from_str::<Value>(&raw).unwrap_or_else(|_| Value::String(raw.clone()));
        match set_in_tree(tree, &segments, value) {
            Ok(()) => {
                info!(variable = %name, "configuration overridden from environment");
                applied.push(name);
            }
            Err(err) => warn!(variable = %name, error = %err, "ignoring configuration override"),
        }
    }
    applied
}

fn lower_keys(value: Value) -> Value {
    match value {
        Value::Mapping(map) => Value::Mapping(
            map.into_iter()
                .map(|(k, v)| {
                    let k = match k {
                        Value::String(s) => Value::String(s.to_lowercase()),
                        other => other,
                    };
                    (k, lower_keys(v))
                })
                .collect(),
        ),
        Value::Sequence(items) => Value::Sequence(items.into_iter().map(lower_keys).collect()),
        other => other,
    }
}

/// Recursive merge: mappings are merged key by key, anything else from
/// `external` replaces the default.
fn merge_yaml(default: &mut Value, external: &Value) {
    match (default, external) {
        (Value::Mapping(base), Value::Mapping(over)) => {
            for (key, value) in over {
                if let Some(existing) = base.get_mut(key) {
                    merge_yaml(existing, value);
                } else {
                    base.insert(key.clone(), value.clone());
                }
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}
