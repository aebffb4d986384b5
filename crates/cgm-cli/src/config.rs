//! Configuration loading and management.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cgm_core::{
    ArtifactNaming, ClockSettings, ConvertOptions, DEFAULT_DEVICE_TIME_FORMAT,
    DEFAULT_FILENAME_TIME_FORMAT, DEFAULT_WINDOW_DAYS, OffsetPolicy, RecordKind, WindowAlignment,
    WindowConfig,
};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

/// File name of the `SQLite` store when `sqlite_path` is unset.
pub const DEFAULT_SQLITE_FILE: &str = "cgm.sqlite";

/// Where converted batches are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// One JSON file per artifact.
    #[default]
    Json,
    /// One row per artifact in a `SQLite` database.
    Sqlite,
}

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Directory artifacts are written to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    pub window_days: u32,
    pub window_alignment: WindowAlignment,
    pub offset_granularity_minutes: u32,
    pub device_time_format: String,
    pub filename_time_format: String,
    pub store: StoreKind,
    /// Database path for the `sqlite` store. Defaults to `<output>/cgm.sqlite`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sqlite_path: Option<PathBuf>,
    /// Record kinds to convert. Empty converts every kind.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub record_types: Vec<RecordKind>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: None,
            window_days: DEFAULT_WINDOW_DAYS,
            window_alignment: WindowAlignment::default(),
            offset_granularity_minutes: OffsetPolicy::default().granularity_minutes(),
            device_time_format: DEFAULT_DEVICE_TIME_FORMAT.to_string(),
            filename_time_format: DEFAULT_FILENAME_TIME_FORMAT.to_string(),
            store: StoreKind::default(),
            sqlite_path: None,
            record_types: Vec::new(),
        }
    }
}

impl Config {
    /// Loads configuration, optionally from a specific file.
    ///
    /// Later sources override earlier ones: defaults, the user config file,
    /// `config_path`, then `CGM_*` environment variables.
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        // Load from default config location
        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        // Load from specified config file
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Load from environment variables (CGM_*)
        figment = figment.merge(Env::prefixed("CGM_"));

        figment.extract()
    }

    /// Run options with `window_days` in place of the configured window.
    pub fn convert_options(&self, window_days: u32) -> Result<ConvertOptions> {
        let window = WindowConfig::days(window_days)
            .context("invalid window")?
            .with_alignment(self.window_alignment);
        let offset_policy = OffsetPolicy::new(self.offset_granularity_minutes)
            .context("invalid offset_granularity_minutes")?;
        Ok(ConvertOptions {
            window,
            clock: ClockSettings {
                device_time_format: self.device_time_format.clone(),
                offset_policy,
            },
            kinds: (!self.record_types.is_empty()).then(|| self.record_types.clone()),
        })
    }

    /// Artifact naming from `filename_time_format`.
    pub fn naming(&self) -> Result<ArtifactNaming> {
        ArtifactNaming::with_time_format(&self.filename_time_format)
            .context("invalid filename_time_format")
    }

    /// The `SQLite` database used for an output directory.
    pub fn sqlite_path_for(&self, output_dir: &Path) -> PathBuf {
        self.sqlite_path
            .clone()
            .unwrap_or_else(|| output_dir.join(DEFAULT_SQLITE_FILE))
    }
}

/// Returns the platform-specific config directory for cgm.
///
/// On Linux: `~/.config/cgm`
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("cgm"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_library_defaults() {
        let config = Config::default();
        let options = config.convert_options(config.window_days).unwrap();
        assert_eq!(options, ConvertOptions::default());
        assert_eq!(config.naming().unwrap(), ArtifactNaming::default());
    }

    #[test]
    fn test_config_file_overrides_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("cgm.toml");
        std::fs::write(
            &path,
            r#"
output_dir = "/data/cgm"
window_days = 14
window_alignment = "start_of_day"
store = "sqlite"
record_types = ["glucose", "carb"]
"#,
        )
        .unwrap();

        let config = Config::load_from(Some(&path)).unwrap();
        assert_eq!(config.output_dir, Some(PathBuf::from("/data/cgm")));
        assert_eq!(config.window_days, 14);
        assert_eq!(config.window_alignment, WindowAlignment::StartOfDay);
        assert_eq!(config.store, StoreKind::Sqlite);
        assert_eq!(config.offset_granularity_minutes, 15);
        assert_eq!(
            config.convert_options(14).unwrap().kinds,
            Some(vec![RecordKind::GlucoseRead, RecordKind::Meal])
        );
        assert_eq!(
            config.sqlite_path_for(Path::new("/data/cgm")),
            PathBuf::from("/data/cgm/cgm.sqlite")
        );
    }

    #[test]
    fn test_invalid_granularity_is_rejected() {
        let config = Config {
            offset_granularity_minutes: 7,
            ..Config::default()
        };
        assert!(config.convert_options(7).is_err());
    }

    #[test]
    fn test_invalid_filename_format_is_rejected() {
        let config = Config {
            filename_time_format: "%Q".to_string(),
            ..Config::default()
        };
        let err = config.naming().unwrap_err();
        assert!(format!("{err:#}").contains("invalid filename_time_format"));
    }

    #[test]
    fn test_zero_window_is_rejected() {
        assert!(Config::default().convert_options(0).is_err());
    }

    #[test]
    fn test_dirs_config_path_ends_with_cgm() {
        let path = dirs_config_path().unwrap();
        assert_eq!(path.file_name().unwrap(), "cgm");
    }
}
