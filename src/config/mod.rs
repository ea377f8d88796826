use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "PSPWM_";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub timing: TimingConfig,
    pub simulator: SimulatorConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub base_url: String,
    pub command_path: String,
    pub events_path: String,
    pub state_event: String,
    pub request_timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://192.168.4.1".to_string(),
            command_path: "/cmd".to_string(),
            events_path: "/events".to_string(),
            state_event: "hw_app_state".to_string(),
            request_timeout_ms: 5000,
        }
    }
}

impl DeviceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimingConfig {
    pub request_interval_ms: u64,
    pub reconnect_delay_ms: u64,
    pub watchdog_timeout_ms: u64,
    pub push_interval_ms: u64,
    pub slider_grace_factor: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            request_interval_ms: 300,
            reconnect_delay_ms: 3000,
            watchdog_timeout_ms: 1500,
            push_interval_ms: 750,
            slider_grace_factor: 1.5,
        }
    }
}

impl TimingConfig {
    pub fn request_interval(&self) -> Duration {
        Duration::from_millis(self.request_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms)
    }

    /// How long a released slider keeps ignoring pushes, so a snapshot that was
    /// already in flight cannot snap it back.
    pub fn slider_release_grace(&self) -> Duration {
        self.try_slider_release_grace().unwrap_or(Duration::MAX)
    }

    fn try_slider_release_grace(&self) -> Option<Duration> {
        let push = Duration::from_millis(self.push_interval_ms);
        let secs = push.as_secs_f64() * self.slider_grace_factor;
        Duration::try_from_secs_f64(secs).ok()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub port: u16,
    pub push_interval_ms: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            port: 8088,
            push_interval_ms: 750,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = Self::default();
        let config_path = active_config_path();

        if let Ok(raw) = fs::read_to_string(&config_path) {
            match toml::from_str::<Config>(&raw) {
                Ok(file_config) => config = file_config,
                Err(err) => {
                    tracing::warn!(
                        path = %config_path.display(),
                        error = %err,
                        "ignoring unreadable config file"
                    )
                }
            }
        }

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        // Device settings
        if let Ok(val) = env::var(format!("{}BASE_URL", ENV_PREFIX)) {
            self.device.base_url = val;
        }
        if let Ok(val) = env::var(format!("{}COMMAND_PATH", ENV_PREFIX)) {
            self.device.command_path = val;
        }
        if let Ok(val) = env::var(format!("{}EVENTS_PATH", ENV_PREFIX)) {
            self.device.events_path = val;
        }
        if let Ok(val) = env::var(format!("{}STATE_EVENT", ENV_PREFIX)) {
            self.device.state_event = val;
        }
        if let Ok(val) = env::var(format!("{}REQUEST_TIMEOUT_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.device.request_timeout_ms = ms;
            }
        }

        // Timing settings
        if let Ok(val) = env::var(format!("{}REQUEST_INTERVAL_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.timing.request_interval_ms = ms;
            }
        }
        if let Ok(val) = env::var(format!("{}RECONNECT_DELAY_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.timing.reconnect_delay_ms = ms;
            }
        }
        if let Ok(val) = env::var(format!("{}WATCHDOG_TIMEOUT_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.timing.watchdog_timeout_ms = ms;
            }
        }
        if let Ok(val) = env::var(format!("{}PUSH_INTERVAL_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.timing.push_interval_ms = ms;
            }
        }
        if let Ok(val) = env::var(format!("{}SLIDER_GRACE_FACTOR", ENV_PREFIX)) {
            if let Ok(factor) = val.parse() {
                self.timing.slider_grace_factor = factor;
            }
        }

        // Simulator settings
        if let Ok(val) = env::var(format!("{}SIM_PORT", ENV_PREFIX)) {
            if let Ok(port) = val.parse() {
                self.simulator.port = port;
            }
        }
        if let Ok(val) = env::var(format!("{}SIM_PUSH_INTERVAL_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.simulator.push_interval_ms = ms;
            }
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        let base_url = self.device.base_url.trim();
        if base_url.is_empty() {
            return Err("device.base_url must be set".into());
        }
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err("device.base_url must be an http(s) URL".into());
        }
        if !self.device.command_path.starts_with('/') {
            return Err("device.command_path must start with '/'".into());
        }
        if !self.device.events_path.starts_with('/') {
            return Err("device.events_path must start with '/'".into());
        }
        if self.device.state_event.trim().is_empty() {
            return Err("device.state_event must be set".into());
        }
        if self.device.request_timeout_ms == 0 {
            return Err("device.request_timeout_ms must be non-zero".into());
        }
        if self.timing.request_interval_ms == 0 {
            return Err("timing.request_interval_ms must be non-zero".into());
        }
        if self.timing.reconnect_delay_ms == 0 {
            return Err("timing.reconnect_delay_ms must be non-zero".into());
        }
        if self.timing.watchdog_timeout_ms == 0 {
            return Err("timing.watchdog_timeout_ms must be non-zero".into());
        }
        if self.timing.push_interval_ms == 0 {
            return Err("timing.push_interval_ms must be non-zero".into());
        }
        let factor = self.timing.slider_grace_factor;
        if !factor.is_finite() || factor <= 0.0 {
            return Err("timing.slider_grace_factor must be a positive number".into());
        }
        if self.timing.try_slider_release_grace().is_none() {
            return Err("timing.slider_grace_factor is too large for push_interval_ms".into());
        }
        if self.simulator.port == 0 {
            return Err("simulator.port must be non-zero".into());
        }
        if self.simulator.push_interval_ms == 0 {
            return Err("simulator.push_interval_ms must be non-zero".into());
        }
        Ok(())
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err("config.toml already exists".into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home)
        .join(".config")
        .join("pspwm-remote")
        .join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = Config::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        parsed.validate().unwrap();
    }

    #[test]
    fn partial_file_keeps_section_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [device]
            base_url = "http://10.0.0.7"

            [timing]
            request_interval_ms = 200
            "#,
        )
        .unwrap();
        assert_eq!(parsed.device.base_url, "http://10.0.0.7");
        assert_eq!(parsed.device.events_path, "/events");
        assert_eq!(parsed.timing.request_interval_ms, 200);
        assert_eq!(parsed.timing.reconnect_delay_ms, 3000);
        parsed.validate().unwrap();
    }

    #[test]
    fn default_slider_grace_is_one_and_a_half_push_intervals() {
        let timing = TimingConfig::default();
        assert_eq!(timing.slider_release_grace(), Duration::from_millis(1125));
    }

    #[test]
    fn validate_rejects_bad_base_url() {
        let mut cfg = Config::default();
        cfg.device.base_url = "  ".to_string();
        assert!(cfg.validate().is_err());
        cfg.device.base_url = "ftp://device".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_relative_paths() {
        let mut cfg = Config::default();
        cfg.device.command_path = "cmd".to_string();
        assert!(cfg.validate().is_err());
        cfg.device.command_path = "/cmd".to_string();
        cfg.device.events_path = "events".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_timings() {
        let mut cfg = Config::default();
        cfg.timing.request_interval_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.timing.watchdog_timeout_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.timing.reconnect_delay_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_non_positive_grace_factor() {
        let mut cfg = Config::default();
        cfg.timing.slider_grace_factor = 0.0;
        assert!(cfg.validate().is_err());
        cfg.timing.slider_grace_factor = f64::NAN;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_grace_factor_that_overflows() {
        let mut cfg = Config::default();
        cfg.timing.slider_grace_factor = 1e20;
        assert!(cfg.validate().is_err());
        assert_eq!(cfg.timing.slider_release_grace(), Duration::MAX);
    }

    #[test]
    fn write_default_refuses_to_overwrite() {
        let dir = env::temp_dir().join(format!("pspwm-remote-cfg-{}", std::process::id()));
        let path = dir.join(CONFIG_FILE);
        let _ = fs::remove_file(&path);
        Config::write_default(&path).unwrap();
        assert!(Config::write_default(&path).is_err());
        let raw = fs::read_to_string(&path).unwrap();
        let parsed: Config = toml::from_str(&raw).unwrap();
        assert_eq!(parsed.timing.watchdog_timeout_ms, 1500);
        let _ = fs::remove_dir_all(&dir);
    }
}
