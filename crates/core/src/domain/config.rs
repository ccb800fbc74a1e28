//! Configuration management for decibender
//!
//! Settings are seeded at process start and stay session-only: edits made on a
//! surface are never written back. The file is written only on explicit request
//! (`decibender config init`).
//!
//! ```toml
//! [analysis]
//! initial_rms_seconds = 3.0
//! shift_step_db = 6.0
//! adjustment_hold_secs = 7.0
//! block_rate_hz = 12.0
//!
//! [analysis.initial_thresholds]
//! too_loud = -20.0
//! too_quiet = -80.0
//! grace = 8.0
//!
//! [viewer]
//! id = "viewer"
//! mode = "read_reconcile"
//! ...
//! ```

use crate::domain::loudness::RmsSeconds;
use crate::domain::surface::SurfaceRole;
use crate::domain::thresholds::{Adjustment, ThresholdSet};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, instrument};

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Settings of the analysis process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Used when the init handshake carries no thresholds
    pub initial_thresholds: ThresholdSet,

    /// Used when the init handshake carries no window
    pub initial_rms_seconds: RmsSeconds,

    /// Shift applied per louder/quieter command, in dB
    pub shift_step_db: f32,

    /// Classification pause after an adjustment, in seconds (0 = disabled)
    pub adjustment_hold_secs: f32,

    /// Capture blocks per second fed to the RMS window
    pub block_rate_hz: f32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            initial_thresholds: ThresholdSet::VIEWER_SEED,
            initial_rms_seconds: RmsSeconds::DEFAULT,
            shift_step_db: Adjustment::DEFAULT_STEP_DB,
            adjustment_hold_secs: 7.0,
            // 48 kHz capture in 4000-frame blocks
            block_rate_hz: 12.0,
        }
    }
}

impl AnalysisConfig {
    pub fn adjustment_hold(&self) -> Duration {
        Duration::try_from_secs_f32(self.adjustment_hold_secs).unwrap_or(Duration::ZERO)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.shift_step_db.is_finite() && self.shift_step_db > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "analysis.shift_step_db must be positive, got {}",
                self.shift_step_db
            )));
        }
        if !(self.adjustment_hold_secs.is_finite() && self.adjustment_hold_secs >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "analysis.adjustment_hold_secs must not be negative, got {}",
                self.adjustment_hold_secs
            )));
        }
        if !(self.block_rate_hz.is_finite() && self.block_rate_hz > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "analysis.block_rate_hz must be positive, got {}",
                self.block_rate_hz
            )));
        }
        Ok(())
    }
}

/// Complete configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecibenderConfig {
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default = "SurfaceRole::viewer")]
    pub viewer: SurfaceRole,
    #[serde(default = "SurfaceRole::admin")]
    pub admin: SurfaceRole,
}

impl Default for DecibenderConfig {
    fn default() -> Self {
        Self {
            analysis: AnalysisConfig::default(),
            viewer: SurfaceRole::viewer(),
            admin: SurfaceRole::admin(),
        }
    }
}

impl DecibenderConfig {
    pub fn validate(&self) -> Result<()> {
        self.analysis.validate()?;
        self.viewer.validate().map_err(ConfigError::Invalid)?;
        self.admin.validate().map_err(ConfigError::Invalid)?;
        if self.viewer.id == self.admin.id {
            return Err(ConfigError::Invalid(format!(
                "viewer and admin share the surface id '{}'",
                self.viewer.id
            )));
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load and validate configuration from a TOML file
    #[instrument(skip(path))]
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;

        debug!("Configuration loaded successfully");
        Ok(config)
    }

    /// Save configuration to a TOML file
    #[instrument(skip(self, path))]
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!(path = %path.display(), "Saving configuration");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::write(path, self.to_toml_string()?).await?;

        debug!("Configuration saved successfully");
        Ok(())
    }
}

/// Locates and loads `decibender.toml`
pub struct ConfigManager {
    config_dir: PathBuf,
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new(config_dir: PathBuf) -> Self {
        let config_path = config_dir.join("decibender.toml");
        Self {
            config_dir,
            config_path,
        }
    }

    /// Manager for an explicit file path
    pub fn for_file(path: PathBuf) -> Self {
        let config_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            config_dir,
            config_path: path,
        }
    }

    /// `~/.config/decibender` on Linux, the platform equivalent elsewhere
    pub fn default_config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("decibender"))
            .ok_or_else(|| ConfigError::Invalid("Could not determine config directory".to_string()))
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load configuration, falling back to built-in defaults
    ///
    /// A missing file is not created. A corrupt or invalid file is copied to
    /// `decibender.toml.corrupt` and left in place.
    #[instrument(skip(self))]
    pub async fn load(&self) -> DecibenderConfig {
        if !self.config_path.exists() {
            info!(
                path = %self.config_path.display(),
                "Config file not found, using defaults"
            );
            return DecibenderConfig::default();
        }

        match DecibenderConfig::load_from_file(&self.config_path).await {
            Ok(config) => config,
            Err(e) => {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to load config, using defaults"
                );

                let backup_path = self.config_path.with_extension("toml.corrupt");
                if let Err(copy_err) = fs::copy(&self.config_path, &backup_path).await {
                    error!(
                        path = %backup_path.display(),
                        error = %copy_err,
                        "Failed to backup corrupt config"
                    );
                }

                DecibenderConfig::default()
            }
        }
    }

    #[instrument(skip(self, config))]
    pub async fn save(&self, config: &DecibenderConfig) -> Result<()> {
        config.validate()?;
        fs::create_dir_all(&self.config_dir).await?;
        config.save_to_file(&self.config_path).await
    }

    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }
}
