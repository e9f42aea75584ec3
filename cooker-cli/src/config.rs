//! Layered configuration: defaults, then an optional TOML file, then
//! command-line overrides applied by the caller.

use std::{
    fs,
    path::{Path, PathBuf},
};

use cooker_core::{cook::CookerConfig, types::Platform};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_CONFIG_LOCATIONS: &[&str] = &["cooker.toml", "config/cooker.toml"];

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file {} does not exist", path.display())]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration file {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration file {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Where content comes from and where artifacts go.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub content_root: PathBuf,
    pub output: PathBuf,
    /// Defaults to `<output>/.cook-cache`.
    pub cache_dir: Option<PathBuf>,
    pub platforms: Vec<String>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            content_root: PathBuf::from("content"),
            output: PathBuf::from("cooked"),
            cache_dir: None,
            platforms: vec![std::env::consts::OS.to_string()],
        }
    }
}

impl ProjectConfig {
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| self.output.join(".cook-cache"))
    }

    pub fn platforms(&self) -> Vec<Platform> {
        Platform::parse_list(&self.platforms.join(","))
    }
}

/// Contents of a `cooker.toml`: a `[project]` table next to the scheduler
/// sections (`[queue]`, `[gc]`, `[distribution]`, ...).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub project: ProjectConfig,
    #[serde(flatten)]
    pub cook: CookerConfig,
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: FileConfig,
    /// The file the configuration came from, if any.
    pub path: Option<PathBuf>,
}

#[derive(Debug)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    search_defaults: bool,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            config_path: None,
            search_defaults: true,
        }
    }

    /// An explicit path must exist; without one the default locations are
    /// searched.
    pub fn with_config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    pub fn without_default_locations(mut self) -> Self {
        self.search_defaults = false;
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let path = match &self.config_path {
            Some(explicit) if !explicit.exists() => {
                return Err(ConfigLoadError::MissingConfig {
                    path: explicit.clone(),
                });
            }
            Some(explicit) => Some(explicit.clone()),
            None if self.search_defaults => DEFAULT_CONFIG_LOCATIONS
                .iter()
                .map(PathBuf::from)
                .find(|candidate| candidate.exists()),
            None => None,
        };

        let config = match &path {
            Some(path) => read_file_config(path)?,
            None => FileConfig::default(),
        };
        Ok(ConfigLoad { config, path })
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConfigLoader::new()
            .with_config_path(Some(dir.path().join("absent.toml")))
            .load()
            .unwrap_err();
        assert!(matches!(err, ConfigLoadError::MissingConfig { .. }));
    }

    #[test]
    fn file_sections_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cooker.toml");
        fs::write(
            &path,
            r#"
[project]
content_root = "assets"
platforms = ["linux", "console"]

[distribution]
workers = 3
heartbeat_interval_ms = 250

[gc]
items_per_collection = 10
"#,
        )
        .unwrap();

        let load = ConfigLoader::new()
            .with_config_path(Some(path.clone()))
            .load()
            .unwrap();
        let config = load.config;
        assert_eq!(load.path, Some(path));
        assert_eq!(config.project.content_root, PathBuf::from("assets"));
        assert_eq!(config.project.output, PathBuf::from("cooked"));
        assert_eq!(config.project.cache_dir(), PathBuf::from("cooked/.cook-cache"));
        assert_eq!(
            config.project.platforms(),
            vec![Platform::new("linux"), Platform::new("console")]
        );
        assert_eq!(config.cook.distribution.workers, 3);
        assert_eq!(config.cook.distribution.heartbeat_interval_ms, 250);
        assert_eq!(config.cook.gc.items_per_collection, 10);
        assert_eq!(
            config.cook.queue.desired_load_population,
            CookerConfig::default().queue.desired_load_population
        );
    }

    #[test]
    fn malformed_file_reports_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cooker.toml");
        fs::write(&path, "[distribution]\nworkers = \"many\"\n").unwrap();
        let err = ConfigLoader::new()
            .with_config_path(Some(path.clone()))
            .load()
            .unwrap_err();
        assert!(err.to_string().contains(&path.display().to_string()));
    }

    #[test]
    fn no_file_means_defaults() {
        let load = ConfigLoader::new().without_default_locations().load().unwrap();
        assert!(load.path.is_none());
        assert_eq!(load.config.cook.distribution.workers, 0);
    }
}
