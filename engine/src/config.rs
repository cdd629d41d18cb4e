use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_ENV: &str = "PLUGHOST_CONFIG";
pub const SAMPLE_RATE_ENV: &str = "PLUGHOST_SAMPLE_RATE";
pub const BLOCK_SIZE_ENV: &str = "PLUGHOST_BLOCK_SIZE";
pub const HOST_NAME_ENV: &str = "PLUGHOST_HOST_NAME";

pub const DEFAULT_HOST_NAME: &str = "plughost";
pub const DEFAULT_SAMPLE_RATE: f64 = 48_000.0;
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 512;
pub const DEFAULT_MIDI_QUEUE_CAPACITY: usize = 128;
pub const DEFAULT_PARAMETER_QUEUE_CAPACITY: usize = 64;

/// Host-wide settings shared by every loaded plugin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Reported to plugins through `IHostApplication::getName`.
    pub host_name: String,
    pub sample_rate: f64,
    pub max_block_size: usize,
    /// Events accepted per block before `queue_midi_event` starts failing.
    pub midi_queue_capacity: usize,
    /// Distinct parameter ids that can be queued for a single block.
    pub parameter_queue_capacity: usize,
    /// Scanned in addition to the platform install locations.
    pub extra_search_paths: Vec<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host_name: DEFAULT_HOST_NAME.to_string(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            midi_queue_capacity: DEFAULT_MIDI_QUEUE_CAPACITY,
            parameter_queue_capacity: DEFAULT_PARAMETER_QUEUE_CAPACITY,
            extra_search_paths: Vec::new(),
        }
    }
}

impl HostConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, String> {
        let config: Self =
            toml::from_str(text).map_err(|e| format!("Invalid host configuration: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read host configuration {}: {e}", path.display()))?;
        Self::from_toml_str(&text)
    }

    /// Defaults, then the file named by `PLUGHOST_CONFIG`, then individual
    /// environment overrides.
    pub fn from_env() -> Result<Self, String> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) if !path.is_empty() => Self::load(Path::new(&path))?,
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), String>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup(HOST_NAME_ENV) {
            let name = name.trim();
            if !name.is_empty() {
                self.host_name = name.to_string();
            }
        }
        if let Some(rate) = lookup(SAMPLE_RATE_ENV) {
            self.sample_rate = rate
                .trim()
                .parse()
                .map_err(|e| format!("{SAMPLE_RATE_ENV}={rate:?} is not a number: {e}"))?;
        }
        if let Some(block) = lookup(BLOCK_SIZE_ENV) {
            self.max_block_size = block
                .trim()
                .parse()
                .map_err(|e| format!("{BLOCK_SIZE_ENV}={block:?} is not a block size: {e}"))?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(format!("Sample rate must be positive, got {}", self.sample_rate));
        }
        if self.max_block_size == 0 || self.max_block_size > i32::MAX as usize {
            return Err(format!("Invalid max block size {}", self.max_block_size));
        }
        if self.midi_queue_capacity == 0 {
            return Err("MIDI queue capacity must be at least 1".to_string());
        }
        if self.parameter_queue_capacity == 0 {
            return Err("Parameter queue capacity must be at least 1".to_string());
        }
        Ok(())
    }
}
