use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::zone::RoleClass;

const DEFAULT_CHIP: &str = "/dev/gpiochip0";
const PERSIST_DIRS: [&str; 2] = ["/var/lib/zonebridge", "/etc/zonebridge"];

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HttpConfig {
    pub unix_socket: Option<String>,
    pub host: Option<String>,
    pub path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    /// Blank means anonymous.
    pub username: String,
    pub password: String,
    pub discovery_prefix: String,
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            discovery_prefix: "homeassistant".to_string(),
            keep_alive_secs: 30,
        }
    }
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct PinConfig {
    #[serde(default = "default_chip")]
    pub chip: String,
    pub line: u32,
}

fn default_chip() -> String {
    DEFAULT_CHIP.to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ZoneConfig {
    pub key: String,
    pub name: String,
    #[serde(flatten)]
    pub pin: PinConfig,
    #[serde(default)]
    pub class: RoleClass,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct TimingConfig {
    pub debounce_ms: u64,
    pub poll_interval_ms: u64,
    pub aggregate_interval_ms: u64,
    pub tap_hold_ms: u64,
    pub edge_settle_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 120,
            poll_interval_ms: 50,
            aggregate_interval_ms: 1000,
            tap_hold_ms: 500,
            edge_settle_ms: 20,
        }
    }
}

impl TimingConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn aggregate_interval(&self) -> Duration {
        Duration::from_millis(self.aggregate_interval_ms)
    }

    pub fn tap_hold(&self) -> Duration {
        Duration::from_millis(self.tap_hold_ms)
    }

    pub fn edge_settle(&self) -> Duration {
        Duration::from_millis(self.edge_settle_ms)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub mqtt: MqttConfig,
    pub zones: Vec<ZoneConfig>,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub persist_path: Option<PathBuf>,
    #[serde(default)]
    pub http: Option<HttpConfig>,
    #[serde(default = "default_broadcast_capacity")]
    pub event_broadcast_capacity: usize,
}

fn default_broadcast_capacity() -> usize {
    64
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, AppError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;
        let mut config: AppConfig = serde_json::from_str(&contents)
            .map_err(|e| AppError::Config(format!("Invalid config json: {e}")))?;
        config.apply_overrides(|name| env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `MQTT_*` and `HA_DISCOVERY_PREFIX` overrides from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = lookup("MQTT_PORT") {
            self.mqtt.port = port
                .trim()
                .parse()
                .map_err(|_| AppError::Config(format!("Invalid MQTT_PORT: {port}")))?;
        }
        if let Some(user) = lookup("MQTT_USER") {
            self.mqtt.username = user;
        }
        if let Some(pass) = lookup("MQTT_PASS") {
            self.mqtt.password = pass;
        }
        if let Some(prefix) = lookup("HA_DISCOVERY_PREFIX") {
            self.mqtt.discovery_prefix = prefix;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.zones.is_empty() {
            return Err(AppError::Config("at least one zone is required".into()));
        }

        let mut keys = HashSet::new();
        let mut pins = HashSet::new();
        for zone in &self.zones {
            if zone.key.trim().is_empty() {
                return Err(AppError::Config("zone key must not be empty".into()));
            }
            if !keys.insert(zone.key.as_str()) {
                return Err(AppError::Config(format!("duplicate zone key {}", zone.key)));
            }
            if !pins.insert(&zone.pin) {
                return Err(AppError::Config(format!(
                    "pin {}:{} bound to more than one zone",
                    zone.pin.chip, zone.pin.line
                )));
            }
        }

        let t = &self.timing;
        let timings = [
            t.debounce_ms,
            t.poll_interval_ms,
            t.aggregate_interval_ms,
            t.tap_hold_ms,
            t.edge_settle_ms,
        ];
        if timings.contains(&0) {
            return Err(AppError::Config("timing intervals must be non-zero".into()));
        }
        if self.event_broadcast_capacity == 0 {
            return Err(AppError::Config(
                "event_broadcast_capacity must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Stable controller identity: the configured id, else the host name.
    pub fn device_id(&self) -> String {
        match &self.device_id {
            Some(id) => slugify(id),
            None => slugify(&host_name()),
        }
    }

    /// Configured persistence path, else the first usable state directory.
    pub fn resolve_persist_path(&self, device_id: &str) -> PathBuf {
        if let Some(path) = &self.persist_path {
            return path.clone();
        }

        let file = format!("{device_id}_zones.json");
        let mut dirs: Vec<PathBuf> = PERSIST_DIRS.iter().map(PathBuf::from).collect();
        let home = env::var_os("HOME").map(PathBuf::from);
        if let Some(home) = &home {
            dirs.push(home.join(".config").join("zonebridge"));
        }

        for dir in dirs {
            if fs::create_dir_all(&dir).is_ok() {
                return dir.join(&file);
            }
        }
        home.unwrap_or_else(env::temp_dir).join(file)
    }
}

pub fn slugify(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.trim().to_lowercase().chars() {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
            c
        } else {
            '_'
        };
        if c == '_' && out.ends_with('_') {
            continue;
        }
        out.push(c);
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "monitor".to_string()
    } else {
        trimmed.to_string()
    }
}

fn host_name() -> String {
    ["/proc/sys/kernel/hostname", "/etc/hostname"]
        .iter()
        .find_map(|path| fs::read_to_string(path).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| env::var("HOSTNAME").ok())
        .unwrap_or_default()
}
