use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::info;
use serde::Deserialize;
use thiserror::Error;

use crate::entity::{Association, FieldType};
use crate::system;

pub const MAX_NUM_THREADS: usize = 15;
pub const REST_TOKEN_ENV: &str = "BULK_LOADER_REST_TOKEN";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("list_delimiter must not be blank")]
    BlankDelimiter,
    #[error("num_threads must be in the range of 0 to 15, got {0}")]
    ThreadCount(usize),
    #[error("entity '{0}' does not match a supported entity")]
    UnknownEntity(String),
    #[error("exist_fields for {0} contains a blank field name")]
    BlankExistField(String),
    #[error("{entity}.{association} refers to unknown entity '{target}'")]
    UnknownAssociationEntity { entity: String, association: String, target: String },
    #[error("Invalid association '{association}' on {entity} in column '{column}'")]
    UnknownAssociation { entity: String, association: String, column: String },
    #[error("Invalid address field format: '{column}' Must use 'address.{column}' in csv header")]
    BareAddressField { column: String },
    #[error("Cannot perform {command} because exist field is not specified for entity: {entity}")]
    MissingExistFields { command: String, entity: String },
    #[error("rest.base_url is not configured")]
    MissingBaseUrl,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct EntityConfig {
    #[serde(default)]
    pub exist_fields: Vec<String>,
    #[serde(default)]
    pub fields: HashMap<String, FieldType>,
    #[serde(default)]
    pub associations: HashMap<String, Association>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RestConfig {
    pub base_url: Option<String>,
    pub rest_token: Option<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct LoaderConfig {
    pub list_delimiter: String,
    pub wildcard_matching: bool,
    pub num_threads: usize,
    pub queue_capacity: usize,
    pub date_format: String,
    pub process_empty_associations: bool,
    pub drain_poll_seconds: u64,
    pub results_dir: PathBuf,
    pub rest: RestConfig,
    pub entities: HashMap<String, EntityConfig>,
}

fn default_timeout_seconds() -> u64 {
    120
}

impl Default for RestConfig {
    fn default() -> Self {
        Self { base_url: None, rest_token: None, timeout_seconds: default_timeout_seconds() }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            list_delimiter: ";".to_string(),
            wildcard_matching: false,
            num_threads: 0,
            queue_capacity: 0,
            date_format: "%m/%d/%Y".to_string(),
            process_empty_associations: false,
            drain_poll_seconds: 60,
            results_dir: PathBuf::from("results"),
            rest: RestConfig::default(),
            entities: HashMap::new(),
        }
    }
}

impl LoaderConfig {
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading configuration from: {}", path.display());
        let file = File::open(path).with_context(|| format!("Failed to open configuration file: {}", path.display()))?;
        let mut config: LoaderConfig = serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse configuration YAML from {}", path.display()))?;
        if let Ok(token) = std::env::var(REST_TOKEN_ENV) {
            config.rest.rest_token = Some(token);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.list_delimiter.trim().is_empty() {
            return Err(ConfigError::BlankDelimiter);
        }
        if self.num_threads > MAX_NUM_THREADS {
            return Err(ConfigError::ThreadCount(self.num_threads));
        }
        for (entity, entity_config) in &self.entities {
            if entity_config.exist_fields.iter().any(|f| f.trim().is_empty()) {
                return Err(ConfigError::BlankExistField(entity.clone()));
            }
        }
        Ok(())
    }

    /// Configured exist fields for an entity, matched case-insensitively on the entity name.
    pub fn exist_fields(&self, entity: &str) -> &[String] {
        self.entities
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(entity))
            .map(|(_, c)| c.exist_fields.as_slice())
            .unwrap_or(&[])
    }

    /// Worker count with 0 meaning "twice the cores plus one", never above the cap.
    pub fn worker_threads(&self) -> usize {
        let requested = if self.num_threads == 0 { num_cpus::get() * 2 + 1 } else { self.num_threads };
        requested.clamp(1, MAX_NUM_THREADS)
    }

    pub fn work_queue_capacity(&self) -> usize {
        if self.queue_capacity > 0 {
            return self.queue_capacity;
        }
        system::default_queue_capacity()
    }

    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_secs(self.drain_poll_seconds.max(1))
    }
}
