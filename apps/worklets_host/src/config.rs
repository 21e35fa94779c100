use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use worklets::{EngineKind, WorkletRuntimeConfig, WorkletsError};

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file '{0}': {1}")]
    IoError(String, #[source] std::io::Error),

    #[error("JSON parse error: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Schema validation failed: {0}")]
    ValidationError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Worklets(#[from] WorkletsError),
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_engine() -> String {
    "quickjs".to_string()
}

/// How a task is handed to its runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TaskMode {
    /// `execute_sync`: the caller blocks and receives the result
    #[default]
    Sync,
    /// `run_async_guarded`: queued on the runtime's home thread
    Async,
}

/// One worklet runtime to create at startup
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RuntimeEntry {
    #[schemars(description = "Numeric runtime id, unique across the configuration")]
    pub id: u64,

    #[schemars(description = "Runtime name, unique across the configuration")]
    pub name: String,

    #[serde(default = "default_true")]
    #[schemars(description = "Build the runtime with a recursive lock (required for sync tasks)")]
    pub supports_locking: bool,

    #[serde(default)]
    #[schemars(description = "Exposed to scripts as __DEV__")]
    pub is_dev_bundle: bool,

    #[serde(default = "default_engine")]
    #[schemars(description = "Script engine: quickjs, hermes, jsc, v8")]
    pub engine: String,

    /// Bootstrap bundle, relative to the configuration file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(description = "Bootstrap bundle evaluated at creation, relative to the configuration file")]
    pub bootstrap_file: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(description = "Source label of the bootstrap bundle (defaults to the file path)")]
    pub source_url: Option<String>,
}

impl RuntimeEntry {
    /// Build the library configuration, reading the bootstrap bundle if one is set
    ///
    /// # Arguments
    /// * `base_dir` - Directory relative bootstrap paths are resolved against
    pub fn to_runtime_config(&self, base_dir: &Path) -> Result<WorkletRuntimeConfig> {
        let engine = EngineKind::from_name(&self.engine)?;
        let mut config = WorkletRuntimeConfig::new(self.id, self.name.clone())
            .with_locking(self.supports_locking)
            .with_dev_bundle(self.is_dev_bundle)
            .with_engine(engine);

        if let Some(file) = &self.bootstrap_file {
            let path = base_dir.join(file);
            let path_str = path.to_string_lossy().to_string();
            let script =
                fs::read_to_string(&path).map_err(|e| ConfigError::IoError(path_str.clone(), e))?;
            let source_url = self.source_url.clone().unwrap_or(path_str);
            config = config.with_script(script, source_url);
        }

        config.validate()?;
        Ok(config)
    }
}

/// A worklet to run once all runtimes exist
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TaskConfig {
    #[schemars(description = "Name of the runtime the task runs on")]
    pub runtime: String,

    #[schemars(description = "Worklet code: a function expression, closure reachable as this.__closure")]
    pub code: String,

    #[serde(default)]
    #[schemars(description = "Closure variables captured by the worklet")]
    pub closure: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub mode: TaskMode,
}

/// Host configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HostConfig {
    /// Logging level
    #[serde(default = "default_log_level")]
    #[schemars(description = "Log level: trace, debug, info, warn, error")]
    #[schemars(regex(pattern = r"^(trace|debug|info|warn|error)$"))]
    pub log_level: String,

    #[serde(default)]
    #[schemars(description = "Worklet runtimes created at startup")]
    pub runtimes: Vec<RuntimeEntry>,

    #[serde(default)]
    #[schemars(description = "Values exposed to every runtime through __workletsModuleProxy")]
    pub capabilities: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    #[schemars(description = "Worklets run in order once every runtime is created")]
    pub tasks: Vec<TaskConfig>,
}

impl HostConfig {
    /// Load and validate from JSON file
    pub fn from_json_file(path: &str) -> Result<Self> {
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::IoError(path.to_string(), e))?;

        Self::from_json_str(&content)
    }

    /// Load and validate from JSON string
    pub fn from_json_str(json: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json)?;

        let schema_json = serde_json::to_value(Self::schema())?;
        let compiled = jsonschema::validator_for(&schema_json)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        compiled
            .validate(&value)
            .map_err(|e| ConfigError::ValidationError(format!("{}", e)))?;

        let config: HostConfig = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    pub fn schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(HostConfig)
    }

    /// Cross-field checks the schema cannot express
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        let mut ids = HashSet::new();
        for runtime in &self.runtimes {
            if runtime.name.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("Runtime {} has an empty name", runtime.id)));
            }
            if !names.insert(runtime.name.as_str()) {
                return Err(ConfigError::Invalid(format!("Duplicate runtime name '{}'", runtime.name)));
            }
            if !ids.insert(runtime.id) {
                return Err(ConfigError::Invalid(format!("Duplicate runtime id {}", runtime.id)));
            }
            EngineKind::from_name(&runtime.engine)?;
        }

        for (index, task) in self.tasks.iter().enumerate() {
            let Some(runtime) = self.runtimes.iter().find(|r| r.name == task.runtime) else {
                return Err(ConfigError::Invalid(format!(
                    "Task #{} targets unknown runtime '{}'",
                    index, task.runtime
                )));
            };
            if task.mode == TaskMode::Sync && !runtime.supports_locking {
                return Err(ConfigError::Invalid(format!(
                    "Task #{} is sync but runtime '{}' is built without locking",
                    index, task.runtime
                )));
            }
        }
        Ok(())
    }
}
