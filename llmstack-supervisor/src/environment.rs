//! Environment Provider: resolves the data root, reads the optional
//! configuration file and creates the base directories.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use crate::config::{CONFIG_FILE_NAME, FileConfig, StackConfig};
use crate::error::{Result, SupervisorError};

#[derive(Debug, Clone, Default)]
pub struct EnvironmentProvider {
    data_root: Option<PathBuf>,
    config_file: Option<PathBuf>,
}

impl EnvironmentProvider {
    /// `data_root` and `config_file` are the operator's explicit choices
    /// (command line or environment); both fall back to defaults.
    pub fn new(data_root: Option<PathBuf>, config_file: Option<PathBuf>) -> Self {
        Self {
            data_root,
            config_file,
        }
    }

    /// `$XDG_DATA_HOME/llmstack`, usually `~/.local/share/llmstack`.
    pub fn default_data_root() -> Result<PathBuf> {
        let dirs = xdg::BaseDirectories::with_prefix("llmstack")
            .map_err(|e| SupervisorError::DataRoot(e.to_string()))?;
        Ok(dirs.get_data_home())
    }

    /// Resolve the configuration for this invocation.
    ///
    /// An explicitly named configuration file must exist; the implicit
    /// `<data_root>/llmstack.yaml` is optional. A `data_root` set inside the
    /// file wins over the one used to locate it.
    pub async fn load(&self) -> Result<StackConfig> {
        let initial_root = match &self.data_root {
            Some(root) => root.clone(),
            None => Self::default_data_root()?,
        };

        let file = match &self.config_file {
            Some(path) => read_config(path).await?,
            None => {
                let implicit = initial_root.join(CONFIG_FILE_NAME);
                if fs::try_exists(&implicit).await.unwrap_or(false) {
                    read_config(&implicit).await?
                } else {
                    debug!("No configuration file at {}", implicit.display());
                    FileConfig::default()
                }
            }
        };

        let data_root = match (&self.data_root, &file.data_root) {
            (Some(explicit), _) => explicit.clone(),
            (None, Some(from_file)) => from_file.clone(),
            (None, None) => initial_root,
        };

        let home = std::env::var_os("HOME").map(PathBuf::from);
        StackConfig::resolve(
            data_root,
            file,
            home.as_deref(),
            std::env::var_os("PATH"),
        )
    }

    /// Create the data root, log directory and state directory.
    pub async fn ensure_directories(config: &StackConfig) -> Result<()> {
        for dir in [&config.data_root, &config.log_dir, &config.state_dir] {
            ensure_dir(dir).await?;
        }
        Ok(())
    }
}

pub(crate) async fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .await
        .map_err(|source| SupervisorError::Directory {
            path: dir.to_path_buf(),
            source,
        })
}

async fn read_config(path: &Path) -> Result<FileConfig> {
    let contents = fs::read_to_string(path)
        .await
        .map_err(|e| SupervisorError::io(path, e))?;
    debug!("Loaded configuration from {}", path.display());
    FileConfig::from_yaml(path, &contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_implicit_config_file_is_read() {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join(CONFIG_FILE_NAME), "webui:\n  port: 3000\n").unwrap();

        let provider = EnvironmentProvider::new(Some(root.path().to_path_buf()), None);
        let config = provider.load().await.unwrap();

        assert_eq!(config.data_root, root.path());
        assert_eq!(config.webui.port, 3000);
    }

    #[tokio::test]
    async fn test_missing_explicit_config_is_an_error() {
        let root = TempDir::new().unwrap();
        let provider = EnvironmentProvider::new(
            Some(root.path().to_path_buf()),
            Some(root.path().join("nope.yaml")),
        );
        assert!(matches!(
            provider.load().await,
            Err(SupervisorError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn test_ensure_directories_creates_layout() {
        let root = TempDir::new().unwrap();
        let data_root = root.path().join("data");
        let provider = EnvironmentProvider::new(Some(data_root.clone()), None);
        let config = provider.load().await.unwrap();

        EnvironmentProvider::ensure_directories(&config).await.unwrap();

        assert!(data_root.join("logs").is_dir());
        assert!(data_root.join("state").is_dir());
    }

    #[tokio::test]
    async fn test_uncreatable_directory_is_reported() {
        let root = TempDir::new().unwrap();
        let blocker = root.path().join("file");
        std::fs::write(&blocker, "").unwrap();

        let err = ensure_dir(&blocker.join("sub")).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Directory { .. }));
    }
}
