//! Configuration management

use anyhow::Result;
use serde::Deserialize;

use crate::db::DEFAULT_BATCH_SIZE;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub aggregate: AggregateConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path of the SQLite file, created if missing
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default)]
    pub directories: Vec<String>,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Re-read files that already have stored records
    #[serde(default)]
    pub force_reload: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregateConfig {
    /// Server or client addresses to restrict statistics to. Empty means all.
    #[serde(default)]
    pub domain_filters: Vec<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            directories: Vec::new(),
            extensions: default_extensions(),
            force_reload: false,
            batch_size: default_batch_size(),
        }
    }
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            domain_filters: Vec::new(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_extensions() -> Vec<String> {
    vec![".log".to_string()]
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

/// Overrides taken from the command line, applied on top of file and env
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub directories: Option<Vec<String>>,
    pub extensions: Option<Vec<String>>,
    pub domain_filters: Option<Vec<String>>,
    pub force_reload: bool,
    pub debug: bool,
}

impl Config {
    pub fn load(config_path: &str, overrides: &Overrides) -> Result<Self> {
        let builder = config::Config::builder()
            .set_default("database.url", "logtally.db")?
            .set_default("logging.level", "info")?
            .add_source(config::File::with_name(config_path).required(false))
            .add_source(
                config::Environment::with_prefix("LOGTALLY")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("ingest.directories")
                    .with_list_parse_key("ingest.extensions")
                    .with_list_parse_key("aggregate.domain_filters")
                    .try_parsing(true),
            );

        let settings = builder.build()?;
        let mut config: Config = settings.try_deserialize()?;
        config.apply(overrides);
        config.normalize();

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    fn apply(&mut self, overrides: &Overrides) {
        if let Some(directories) = &overrides.directories {
            self.ingest.directories = directories.clone();
        }
        if let Some(extensions) = &overrides.extensions {
            self.ingest.extensions = extensions.clone();
        }
        if let Some(filters) = &overrides.domain_filters {
            self.aggregate.domain_filters = filters.clone();
        }
        if overrides.force_reload {
            self.ingest.force_reload = true;
        }
        if overrides.debug {
            self.logging.level = "debug".to_string();
        }
    }

    /// Trim list entries and give every extension a leading dot
    pub fn normalize(&mut self) {
        self.ingest.directories = clean_list(&self.ingest.directories);
        self.ingest.extensions = clean_list(&self.ingest.extensions)
            .into_iter()
            .map(|ext| normalize_extension(&ext))
            .collect();
        self.aggregate.domain_filters = clean_list(&self.aggregate.domain_filters);
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if self.ingest.extensions.is_empty() {
            anyhow::bail!("At least one log file extension is required");
        }
        if self.ingest.batch_size == 0 || self.aggregate.batch_size == 0 {
            anyhow::bail!("Batch sizes must be greater than zero");
        }

        // Validate logging level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid logging level '{}'. Must be one of: {:?}",
                self.logging.level,
                valid_levels
            );
        }

        Ok(())
    }
}

/// Split a comma-delimited argument the way the CLI accepts lists
pub fn split_list(raw: &str) -> Vec<String> {
    clean_list(&raw.split(',').map(str::to_string).collect::<Vec<_>>())
}

fn clean_list(items: &[String]) -> Vec<String> {
    items
        .iter()
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn normalize_extension(ext: &str) -> String {
    let ext = ext.trim().to_ascii_lowercase();
    if ext.starts_with('.') {
        ext
    } else {
        format!(".{ext}")
    }
}
