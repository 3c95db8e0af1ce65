//! Persistent settings for the alignment tool.
//! Persisted in the platform-specific config directory via `directories::ProjectDirs`.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::calibration::{AlignerConfig, TransformCadence};
use crate::camera::FeedConfig;
use crate::machine::DuetConfig;
use crate::vision::{DetectorConfig, OverlayOptions};

/// Settings load/save errors.
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Cannot determine config directory")]
    NoConfigDir,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Application settings that can be saved and loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Controller base URL
    pub printer_url: String,
    /// Controller password (RRF2 boards)
    pub printer_password: String,
    /// Snapshot URL of the alignment camera
    pub camera_url: String,
    /// Delay between camera reads in milliseconds
    pub camera_poll_ms: u64,
    /// Passes over the tool list
    pub cycles: u32,
    /// Tools to align; empty means every tool
    pub tools: Vec<u32>,
    pub samples_per_position: usize,
    /// Corrective moves per tool before it is abandoned
    pub move_budget: u32,
    /// Status poll interval in milliseconds
    pub poll_interval_ms: u64,
    pub cadence: TransformCadence,
    pub probe_z: bool,
    /// Persist offsets with M500 after a run
    pub save_offsets: bool,
    /// Maximum retries for controller requests
    pub max_retries: u32,
    /// Retry delay in milliseconds
    pub retry_delay_ms: u64,
    pub crosshair: bool,
    pub xray: bool,
    /// TTF font for preview captions; empty disables captions
    pub font_path: String,
    /// Default export file
    pub export_path: String,
    pub detector: DetectorConfig,
}

impl Default for AppSettings {
    fn default() -> Self {
        let aligner = AlignerConfig::default();
        let duet = DuetConfig::default();
        Self {
            printer_url: duet.base_url,
            printer_password: duet.password,
            camera_url: "http://localhost:8080/?action=snapshot".to_string(),
            camera_poll_ms: FeedConfig::default().poll_interval.as_millis() as u64,
            cycles: aligner.cycles,
            tools: Vec::new(),
            samples_per_position: aligner.samples_per_position,
            move_budget: aligner.move_budget,
            poll_interval_ms: aligner.poll_interval.as_millis() as u64,
            cadence: aligner.cadence,
            probe_z: aligner.probe_z,
            save_offsets: aligner.save_offsets,
            max_retries: duet.max_retries,
            retry_delay_ms: duet.retry_delay.as_millis() as u64,
            crosshair: true,
            xray: false,
            font_path: String::new(),
            export_path: "output.json".to_string(),
            detector: DetectorConfig::default(),
        }
    }
}

impl AppSettings {
    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from("org", "nozzle-align", "nozzle-align")
    }

    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the settings file path.
    pub fn settings_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("settings.json"))
    }

    /// Get logs directory path.
    pub fn logs_dir() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.data_dir().join("logs"))
    }

    /// Load settings from the config file, falling back to defaults when
    /// there is none or it cannot be read.
    pub fn load() -> Self {
        let Some(path) = Self::settings_path() else {
            return Self::default();
        };
        match Self::load_from(&path) {
            Ok(settings) => settings,
            Err(SettingsError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable settings");
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        let content = fs::read_to_string(path)?;
        let mut loaded: Self = serde_json::from_str(&content)?;
        loaded.backfill();
        Ok(loaded)
    }

    /// Save settings to the config file.
    pub fn save(&self) -> Result<(), SettingsError> {
        let path = Self::settings_path().ok_or(SettingsError::NoConfigDir)?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    // Zeroed intervals in older files would spin the poll loops.
    fn backfill(&mut self) {
        let defaults = Self::default();
        if self.printer_url.is_empty() {
            self.printer_url = defaults.printer_url;
        }
        if self.poll_interval_ms == 0 {
            self.poll_interval_ms = defaults.poll_interval_ms;
        }
        if self.camera_poll_ms == 0 {
            self.camera_poll_ms = defaults.camera_poll_ms;
        }
        if self.samples_per_position == 0 {
            self.samples_per_position = defaults.samples_per_position;
        }
        if self.cycles == 0 {
            self.cycles = defaults.cycles;
        }
    }

    /// Apply overrides from the environment (call after `dotenvy::dotenv()`).
    pub fn apply_env(&mut self) -> Result<(), SettingsError> {
        self.apply_vars(|name| env::var(name).ok())
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), SettingsError> {
        if let Some(url) = var("PRINTER_URL") {
            self.printer_url = url;
        }
        if let Some(password) = var("PRINTER_PASSWORD") {
            self.printer_password = password;
        }
        if let Some(url) = var("CAMERA_URL") {
            self.camera_url = url;
        }
        if let Some(value) = var("ALIGN_CYCLES") {
            self.cycles = parse_var("ALIGN_CYCLES", &value)?;
        }
        if let Some(value) = var("ALIGN_TOOLS") {
            self.tools = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| parse_var("ALIGN_TOOLS", s))
                .collect::<Result<_, _>>()?;
        }
        if let Some(value) = var("ALIGN_CADENCE") {
            self.cadence = match value.to_lowercase().as_str() {
                "per-session" | "session" => TransformCadence::PerSession,
                "per-tool" | "tool" => TransformCadence::PerTool,
                _ => {
                    return Err(SettingsError::InvalidEnv {
                        var: "ALIGN_CADENCE",
                        value,
                    })
                }
            };
        }
        if let Some(value) = var("ALIGN_LOOSE") {
            self.detector.loose = value == "1" || value.eq_ignore_ascii_case("true");
        }
        if let Some(value) = var("DUET_MAX_RETRIES") {
            self.max_retries = parse_var("DUET_MAX_RETRIES", &value)?;
        }
        if let Some(path) = var("OVERLAY_FONT") {
            self.font_path = path;
        }
        Ok(())
    }

    pub fn duet_config(&self) -> DuetConfig {
        DuetConfig::default()
            .with_base_url(&self.printer_url)
            .with_password(&self.printer_password)
            .with_max_retries(self.max_retries)
            .with_retry_delay(Duration::from_millis(self.retry_delay_ms))
    }

    pub fn feed_config(&self) -> FeedConfig {
        FeedConfig::default().with_poll_interval(Duration::from_millis(self.camera_poll_ms))
    }

    pub fn aligner_config(&self) -> AlignerConfig {
        let mut config = AlignerConfig::default()
            .with_cycles(self.cycles)
            .with_cadence(self.cadence)
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_samples_per_position(self.samples_per_position)
            .with_move_budget(self.move_budget)
            .with_save_offsets(self.save_offsets);
        if !self.tools.is_empty() {
            config = config.with_tools(self.tools.clone());
        }
        config.probe_z = self.probe_z;
        config.overlay = OverlayOptions {
            crosshair: self.crosshair,
            xray: self.xray,
        };
        config
    }
}

fn parse_var<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, SettingsError> {
    value.trim().parse().map_err(|_| SettingsError::InvalidEnv {
        var,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut settings = AppSettings::default();
        settings.printer_url = "http://duet.local".to_string();
        settings.tools = vec![0, 2];
        settings.cadence = TransformCadence::PerTool;
        settings.detector.loose = true;
        settings.save_to(&path).unwrap();

        let loaded = AppSettings::load_from(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_partial_file_is_backfilled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"camera_url": "http://cam/snap", "poll_interval_ms": 0}"#).unwrap();

        let loaded = AppSettings::load_from(&path).unwrap();
        assert_eq!(loaded.camera_url, "http://cam/snap");
        assert_eq!(loaded.poll_interval_ms, 500);
        assert_eq!(loaded.detector, DetectorConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        let mut settings = AppSettings::default();
        settings
            .apply_vars(vars(&[
                ("PRINTER_URL", "http://10.0.0.5"),
                ("ALIGN_CYCLES", "4"),
                ("ALIGN_TOOLS", "1, 3"),
                ("ALIGN_CADENCE", "per-tool"),
                ("ALIGN_LOOSE", "true"),
            ]))
            .unwrap();
        assert_eq!(settings.printer_url, "http://10.0.0.5");
        assert_eq!(settings.cycles, 4);
        assert_eq!(settings.tools, vec![1, 3]);
        assert_eq!(settings.cadence, TransformCadence::PerTool);
        assert!(settings.detector.loose);
    }

    #[test]
    fn test_invalid_env_value() {
        let mut settings = AppSettings::default();
        let err = settings.apply_vars(vars(&[("ALIGN_CYCLES", "many")])).unwrap_err();
        assert!(matches!(err, SettingsError::InvalidEnv { var: "ALIGN_CYCLES", .. }));
    }

    #[test]
    fn test_aligner_config_from_settings() {
        let mut settings = AppSettings::default();
        settings.cycles = 3;
        settings.tools = vec![1];
        let config = settings.aligner_config();
        assert_eq!(config.cycles, 3);
        assert_eq!(config.tools, Some(vec![1]));
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert!(config.overlay.crosshair);
    }
}
