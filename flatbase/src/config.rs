use crate::error::{FlatbaseError, Result};
use crate::schema::ConversionStrategy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the optional configuration file inside the data directory.
pub const CONFIG_FILE: &str = "flatbase.yaml";

/// How new record ids are generated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdStrategy {
    #[default]
    Uuid,
    Ulid,
    Nanoid,
}

impl IdStrategy {
    pub fn generate(&self) -> String {
        match self {
            IdStrategy::Uuid => uuid::Uuid::new_v4().to_string(),
            IdStrategy::Ulid => ulid::Ulid::new().to_string().to_lowercase(),
            IdStrategy::Nanoid => nanoid::nanoid!(),
        }
    }
}

/// Store configuration. Every key is optional in `flatbase.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding one flat file per collection.
    pub data_dir: PathBuf,
    /// Extension of collection files, without the dot.
    pub extension: String,
    /// Page size used when a query does not set one.
    pub default_limit: usize,
    /// Strategy applied when writing values into typed columns.
    pub conversion_strategy: ConversionStrategy,
    /// Upper bound for strings under the `truncate` strategy.
    pub max_string_length: Option<usize>,
    pub id_strategy: IdStrategy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            data_dir: PathBuf::from("data"),
            extension: "csv".to_string(),
            default_limit: 10,
            conversion_strategy: ConversionStrategy::Cast,
            max_string_length: None,
            id_strategy: IdStrategy::Uuid,
        }
    }
}

impl StoreConfig {
    /// Defaults rooted at `dir`.
    pub fn for_dir(dir: impl AsRef<Path>) -> Self {
        StoreConfig {
            data_dir: dir.as_ref().to_path_buf(),
            ..StoreConfig::default()
        }
    }

    /// Load `flatbase.yaml` from `dir` if present. The data directory is always `dir`.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::for_dir(dir));
        }
        let content = std::fs::read_to_string(&path)?;
        let mut config = Self::from_yaml_str(&content)?;
        config.data_dir = dir.to_path_buf();
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: StoreConfig = serde_yaml::from_str(content)?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.extension.is_empty() || self.extension.contains(['.', '/', '\\']) {
            return Err(FlatbaseError::Request(format!(
                "Invalid collection file extension '{}'",
                self.extension
            )));
        }
        Ok(())
    }
}
