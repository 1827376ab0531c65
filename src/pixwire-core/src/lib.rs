pub mod config;
pub mod logging;
pub mod paths;

pub use config::{Config, ConfigError, HostSettings, LogLevel, LoggingConfig, ValidationError};
pub use logging::{init_logging, LoggingError, LoggingGuard, LOG_ENV};
pub use paths::{AppDirs, DirsError};

pub const APP_NAME: &str = "pixwire";
pub const APP_AUTHOR: &str = "Pixwire";
pub const APP_QUALIFIER: &str = "org";
