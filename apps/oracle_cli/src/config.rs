use std::{collections::HashMap, fs, path::Path, time::Duration};

use oracle_client::ControllerOptions;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub pulse_decay_ms: u64,
    pub step_delay_ms: u64,
    pub server_url: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pulse_decay_ms: 1000,
            step_delay_ms: 400,
            server_url: None,
        }
    }
}

impl Settings {
    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            pulse_decay: Duration::from_millis(self.pulse_decay_ms),
        }
    }

    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }

    fn merge_toml(&mut self, raw: &str) {
        let file_cfg = match toml::from_str::<HashMap<String, toml::Value>>(raw) {
            Ok(file_cfg) => file_cfg,
            Err(err) => {
                warn!("ignoring unreadable config file: {err}");
                return;
            }
        };

        if let Some(v) = file_cfg.get("pulse_decay_ms").and_then(toml_millis) {
            self.pulse_decay_ms = v;
        }
        if let Some(v) = file_cfg.get("step_delay_ms").and_then(toml_millis) {
            self.step_delay_ms = v;
        }
        if let Some(v) = file_cfg.get("server_url").and_then(toml::Value::as_str) {
            self.server_url = non_blank(v);
        }
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for key in ["ORACLE_PULSE_DECAY_MS", "APP__PULSE_DECAY_MS"] {
            if let Some(v) = lookup(key).and_then(|v| v.trim().parse().ok()) {
                self.pulse_decay_ms = v;
            }
        }
        for key in ["ORACLE_STEP_DELAY_MS", "APP__STEP_DELAY_MS"] {
            if let Some(v) = lookup(key).and_then(|v| v.trim().parse().ok()) {
                self.step_delay_ms = v;
            }
        }
        for key in ["ORACLE_SERVER_URL", "APP__SERVER_URL"] {
            if let Some(v) = lookup(key) {
                self.server_url = non_blank(&v);
            }
        }
    }
}

/// Defaults, then the TOML file at `path` if present, then environment.
pub fn load_settings(path: &Path) -> Settings {
    let mut settings = Settings::default();
    if let Ok(raw) = fs::read_to_string(path) {
        settings.merge_toml(&raw);
    }
    settings.apply_env(|key| std::env::var(key).ok());
    settings
}

fn toml_millis(value: &toml::Value) -> Option<u64> {
    match value {
        toml::Value::Integer(v) => u64::try_from(*v).ok(),
        toml::Value::String(v) => v.trim().parse().ok(),
        _ => None,
    }
}

fn non_blank(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
