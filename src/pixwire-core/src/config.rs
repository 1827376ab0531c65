use crate::paths::AppDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

const CURRENT_CONFIG_VERSION: u32 = 1;

/// Largest number of bytes a single pixel may occupy (RGBA, 32-bit float).
pub const MAX_BYTES_PER_PIXEL: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_config_version")]
    pub config_version: u32,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub host: HostSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            logging: LoggingConfig::default(),
            host: HostSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    /// Rolled files kept in the log dir. `0` turns file logging off.
    #[serde(default = "default_max_log_files")]
    pub max_log_files: usize,
    /// Also log to stdout. Off by default since the CLI prints results there.
    #[serde(default = "default_stdout_enabled")]
    pub stdout: bool,
    #[serde(default)]
    pub file_name: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_log_files: default_max_log_files(),
            stdout: default_stdout_enabled(),
            file_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Settings the host uses when launching and talking to plug-ins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSettings {
    /// Directories searched for relative plug-in program names, in order.
    #[serde(default)]
    pub plugin_path: Vec<PathBuf>,
    #[serde(default = "default_tile_dimension")]
    pub tile_width: u32,
    #[serde(default = "default_tile_dimension")]
    pub tile_height: u32,
    /// Offer a shared memory segment for tile transfer where the launcher
    /// supports it.
    #[serde(default = "default_use_shm")]
    pub use_shm: bool,
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    #[serde(default)]
    pub install_cmap: bool,
    #[serde(default)]
    pub use_xshm: bool,
    #[serde(default = "default_color_cube")]
    pub color_cube: [u8; 4],
    /// How long a closing plug-in gets to exit on its own before it is killed.
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
    /// Staging buffer size for the pipe transport.
    #[serde(default = "default_pipe_buffer_size")]
    pub pipe_buffer_size: usize,
    /// Per-direction capacity of the in-process shared buffer transport.
    #[serde(default = "default_shared_buffer_size")]
    pub shared_buffer_size: usize,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            plugin_path: Vec::new(),
            tile_width: default_tile_dimension(),
            tile_height: default_tile_dimension(),
            use_shm: default_use_shm(),
            gamma: default_gamma(),
            install_cmap: false,
            use_xshm: false,
            color_cube: default_color_cube(),
            close_grace_ms: default_close_grace_ms(),
            pipe_buffer_size: default_pipe_buffer_size(),
            shared_buffer_size: default_shared_buffer_size(),
        }
    }
}

impl HostSettings {
    /// Bytes needed to hold one tile at the deepest supported pixel format.
    pub fn max_tile_bytes(&self) -> usize {
        self.tile_width as usize * self.tile_height as usize * MAX_BYTES_PER_PIXEL
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.tile_width == 0 || self.tile_height == 0 {
            return Err(ValidationError::TileDimensions {
                width: self.tile_width,
                height: self.tile_height,
            });
        }
        if self.pipe_buffer_size == 0 {
            return Err(ValidationError::BufferSize {
                name: "pipe_buffer_size",
                size: 0,
                minimum: 1,
            });
        }
        // A full tile plus its TileData header has to fit in one write.
        let minimum = self.max_tile_bytes() + 64;
        if self.shared_buffer_size < minimum {
            return Err(ValidationError::BufferSize {
                name: "shared_buffer_size",
                size: self.shared_buffer_size,
                minimum,
            });
        }
        if !self.gamma.is_finite() || self.gamma <= 0.0 {
            return Err(ValidationError::Gamma(self.gamma));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("config validation failed: {0}")]
    Validation(ValidationError),
    #[error("failed to prepare configuration directories: {0}")]
    Directories(#[from] crate::paths::DirsError),
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("unsupported config_version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("tile dimensions must be non-zero, got {width}x{height}")]
    TileDimensions { width: u32, height: u32 },
    #[error("{name} of {size} bytes is below the minimum of {minimum}")]
    BufferSize {
        name: &'static str,
        size: usize,
        minimum: usize,
    },
    #[error("gamma must be a positive finite number, got {0}")]
    Gamma(f64),
}

impl Config {
    pub fn load_or_default(dirs: &AppDirs) -> Result<Self, ConfigError> {
        dirs.ensure_exists()?;
        let path = Self::config_path(dirs);
        if !path.exists() {
            let mut config = Self::default();
            config.host.plugin_path.push(dirs.plugin_dir().to_path_buf());
            return Ok(config);
        }

        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let mut config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        config.validate().map_err(ConfigError::Validation)?;
        if config.host.plugin_path.is_empty() {
            config.host.plugin_path.push(dirs.plugin_dir().to_path_buf());
        }
        Ok(config)
    }

    pub fn config_path(dirs: &AppDirs) -> PathBuf {
        dirs.config_dir().join("config.toml")
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.config_version != CURRENT_CONFIG_VERSION {
            return Err(ValidationError::UnsupportedVersion {
                found: self.config_version,
                expected: CURRENT_CONFIG_VERSION,
            });
        }
        self.host.validate()
    }
}

fn default_config_version() -> u32 {
    CURRENT_CONFIG_VERSION
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_max_log_files() -> usize {
    7
}

fn default_stdout_enabled() -> bool {
    false
}

fn default_tile_dimension() -> u32 {
    64
}

fn default_use_shm() -> bool {
    true
}

fn default_gamma() -> f64 {
    1.0
}

fn default_color_cube() -> [u8; 4] {
    [6, 6, 4, 24]
}

fn default_close_grace_ms() -> u64 {
    10
}

fn default_pipe_buffer_size() -> usize {
    1024
}

fn default_shared_buffer_size() -> usize {
    2 * 64 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.logging.max_log_files, 7);
        assert!(!config.logging.stdout);
        assert_eq!(config.logging.level, LogLevel::Info);
        assert_eq!(config.host.tile_width, 64);
        assert_eq!(config.host.shared_buffer_size, 131072);
    }

    #[test]
    fn invalid_version_rejected() {
        let mut config = Config::default();
        config.config_version = CURRENT_CONFIG_VERSION + 1;
        let result = config.validate();
        assert!(matches!(
            result,
            Err(ValidationError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn zero_tile_size_rejected() {
        let mut config = Config::default();
        config.host.tile_height = 0;
        assert!(matches!(
            config.validate(),
            Err(ValidationError::TileDimensions { .. })
        ));
    }

    #[test]
    fn shared_buffer_must_hold_a_tile() {
        let mut config = Config::default();
        config.host.shared_buffer_size = 4096;
        assert!(matches!(
            config.validate(),
            Err(ValidationError::BufferSize {
                name: "shared_buffer_size",
                ..
            })
        ));
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [host]
            tile_width = 128
            plugin_path = ["/opt/pixwire/plug-ins"]

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.host.tile_width, 128);
        assert_eq!(config.host.tile_height, 64);
        assert_eq!(config.host.color_cube, [6, 6, 4, 24]);
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_missing_file_uses_plugin_dir() {
        let root = tempfile::tempdir().unwrap();
        let dirs = AppDirs::with_roots(&root.path().join("cfg"), &root.path().join("data"));
        let config = Config::load_or_default(&dirs).unwrap();
        assert_eq!(config.host.plugin_path, vec![dirs.plugin_dir().to_path_buf()]);
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let root = tempfile::tempdir().unwrap();
        let dirs = AppDirs::with_roots(&root.path().join("cfg"), &root.path().join("data"));
        dirs.ensure_exists().unwrap();
        fs::write(Config::config_path(&dirs), "host = 3").unwrap();
        let err = Config::load_or_default(&dirs).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { path, .. } if path.ends_with("config.toml")));
    }
}
