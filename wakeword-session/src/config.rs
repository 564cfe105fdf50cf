/// Session configuration
///
/// Loaded from a JSON file (path in `WAKEWORD_CONFIG`) with individual
/// environment overrides on top. Defaults reproduce the stock web client:
/// one `memory` pattern, threshold 0.5, averaged threshold 0.20, gain 1.2.

use crate::audio::CaptureConstraints;
use crate::engine::{EngineAssets, RegisteredPattern, TuningParams};
use crate::session::StartOptions;
use crate::wake_flag::WAKE_FLAG_RESET;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Environment variable naming the JSON config file
pub const CONFIG_PATH_ENV: &str = "WAKEWORD_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {name}: {value:?}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub tuning: TuningParams,

    /// Patterns loaded before audio is connected
    pub patterns: Vec<RegisteredPattern>,

    pub assets: EngineAssets,

    pub capture: CaptureConstraints,

    /// How long the wake flag stays set after a detection
    pub wake_flag_reset_ms: u64,

    /// Maximum detection log length; unbounded when absent
    pub log_capacity: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tuning: TuningParams::default(),
            patterns: vec![RegisteredPattern::new("memory", "static/memory.rpw")],
            assets: EngineAssets::default(),
            capture: CaptureConstraints::default(),
            wake_flag_reset_ms: WAKE_FLAG_RESET.as_millis() as u64,
            log_capacity: None,
        }
    }
}

impl SessionConfig {
    /// Load from `WAKEWORD_CONFIG` if set (defaults otherwise), apply
    /// environment overrides, and validate
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => {
                debug!("{} not set, using default configuration", CONFIG_PATH_ENV);
                Self::default()
            }
        };

        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;

        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!("Loading configuration from {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Apply `WAKEWORD_*` overrides using `lookup` to read variables
    ///
    /// `WAKEWORD_MODEL_PATH` replaces the model location of the first
    /// pattern (adding a `memory` pattern when none is configured).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = parse_env(&lookup, "WAKEWORD_THRESHOLD")? {
            self.tuning.threshold = value;
        }

        if let Some(value) = parse_env(&lookup, "WAKEWORD_AVERAGED_THRESHOLD")? {
            self.tuning.averaged_threshold = value;
        }

        if let Some(value) = parse_env(&lookup, "WAKEWORD_GAIN")? {
            self.tuning.gain = value;
        }

        if let Some(path) = lookup("WAKEWORD_MODEL_PATH") {
            match self.patterns.first_mut() {
                Some(pattern) => pattern.model_location = path,
                None => self.patterns.push(RegisteredPattern::new("memory", path)),
            }
        }

        if let Some(device) = lookup("WAKEWORD_DEVICE") {
            self.capture.device_name = Some(device);
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = |name: &str, value: f32| {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{} must be between 0.0 and 1.0, got {}",
                    name, value
                )));
            }
            Ok(())
        };

        unit("threshold", self.tuning.threshold)?;
        unit("averaged_threshold", self.tuning.averaged_threshold)?;

        if !(self.tuning.gain > 0.0) || !self.tuning.gain.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "gain must be a positive number, got {}",
                self.tuning.gain
            )));
        }

        if self.capture.channel_count != 1 {
            return Err(ConfigError::Invalid(format!(
                "capture must be mono, got {} channels",
                self.capture.channel_count
            )));
        }

        for pattern in &self.patterns {
            if pattern.name.trim().is_empty() {
                return Err(ConfigError::Invalid("pattern name is empty".to_string()));
            }
            if pattern.model_location.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "pattern '{}' has no model location",
                    pattern.name
                )));
            }
        }

        if self.wake_flag_reset_ms == 0 {
            return Err(ConfigError::Invalid(
                "wake_flag_reset_ms must be greater than 0".to_string(),
            ));
        }

        if self.log_capacity == Some(0) {
            return Err(ConfigError::Invalid(
                "log_capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn wake_flag_reset(&self) -> Duration {
        Duration::from_millis(self.wake_flag_reset_ms)
    }

    /// Options for `SessionController::start`
    pub fn start_options(&self) -> StartOptions {
        StartOptions {
            tuning: self.tuning,
            patterns: self.patterns.clone(),
            assets: self.assets.clone(),
            capture: self.capture.clone(),
        }
    }
}

fn parse_env<F>(lookup: &F, name: &'static str) -> Result<Option<f32>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse::<f32>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { name, value }),
        None => Ok(None),
    }
}
