use crate::{APP_AUTHOR, APP_NAME, APP_QUALIFIER};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct AppDirs {
    config_dir: PathBuf,
    data_dir: PathBuf,
    plugin_dir: PathBuf,
    log_dir: PathBuf,
}

impl AppDirs {
    pub fn discover() -> Result<Self, DirsError> {
        let dirs = ProjectDirs::from(APP_QUALIFIER, APP_AUTHOR, APP_NAME)
            .ok_or(DirsError::MissingProjectDirs)?;
        Ok(Self::with_roots(dirs.config_dir(), dirs.data_dir()))
    }

    /// Lay out the directory tree under explicit roots. Used by tests and by
    /// hosts that keep their state outside the platform defaults.
    pub fn with_roots(config_dir: &Path, data_dir: &Path) -> Self {
        Self {
            config_dir: config_dir.to_path_buf(),
            data_dir: data_dir.to_path_buf(),
            plugin_dir: data_dir.join("plug-ins"),
            log_dir: data_dir.join("logs"),
        }
    }

    pub fn ensure_exists(&self) -> Result<(), DirsError> {
        for dir in [
            &self.config_dir,
            &self.data_dir,
            &self.plugin_dir,
            &self.log_dir,
        ] {
            std::fs::create_dir_all(dir).map_err(|source| DirsError::CreateDirectory {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Default location searched for plug-in executables.
    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

#[derive(Debug, Error)]
pub enum DirsError {
    #[error("unable to determine project directories for pixwire")]
    MissingProjectDirs,
    #[error("failed to create directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_returns_dirs() {
        let dirs = AppDirs::discover().expect("should build dirs");
        assert!(dirs.log_dir().ends_with("logs"));
        assert!(dirs.plugin_dir().ends_with("plug-ins"));
    }

    #[test]
    fn ensure_exists_creates_tree() {
        let root = tempfile::tempdir().unwrap();
        let dirs = AppDirs::with_roots(&root.path().join("cfg"), &root.path().join("data"));
        dirs.ensure_exists().unwrap();
        assert!(dirs.config_dir().is_dir());
        assert!(dirs.plugin_dir().is_dir());
        assert!(dirs.log_dir().is_dir());
    }
}
