/// Engine kind enumeration
///
/// Identifies which script engine backs an execution context. The choice is made
/// once, when a runtime is configured; runtime and scheduler code never branch on it.

use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkletsError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    QuickJs,
    Hermes,
    #[serde(alias = "jsc")]
    JavaScriptCore,
    V8,
}

impl EngineKind {
    /// Determine the engine kind from its configuration name
    ///
    /// # Arguments
    /// * `name` - Engine name, case-insensitive (`quickjs`, `hermes`, `jsc`, `v8`, ...)
    ///
    /// # Errors
    /// Returns a configuration error if the name is not recognized
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "quickjs" | "qjs" => Ok(EngineKind::QuickJs),
            "hermes" => Ok(EngineKind::Hermes),
            "jsc" | "javascriptcore" => Ok(EngineKind::JavaScriptCore),
            "v8" => Ok(EngineKind::V8),
            other => Err(WorkletsError::Configuration(format!("Unknown engine: {}", other))),
        }
    }

    /// Get the human-readable name of this engine
    pub fn name(&self) -> &'static str {
        match self {
            EngineKind::QuickJs => "QuickJS",
            EngineKind::Hermes => "Hermes",
            EngineKind::JavaScriptCore => "JavaScriptCore",
            EngineKind::V8 => "V8",
        }
    }

    /// Whether a backend for this engine is compiled into this build
    pub fn is_available(&self) -> bool {
        match self {
            EngineKind::QuickJs => cfg!(feature = "quickjs"),
            EngineKind::Hermes | EngineKind::JavaScriptCore | EngineKind::V8 => false,
        }
    }

    /// All engines with a compiled-in backend
    pub fn available() -> Vec<EngineKind> {
        [EngineKind::QuickJs, EngineKind::Hermes, EngineKind::JavaScriptCore, EngineKind::V8]
            .into_iter()
            .filter(EngineKind::is_available)
            .collect()
    }
}
