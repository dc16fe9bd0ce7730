use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::resolver::ArbitrationPolicy;

pub const DEFAULT_CONTEXT_NAME: &str = "default";
pub const DEFAULT_CONTEXT_PATH: &str = "/";
pub const DEFAULT_ENGINE_NAME: &str = "in-process";

macro_rules! define_const {
    ($name: ident, $val: expr, $type: ty) => {
        fn $name() -> $type {
            $val
        }
    };
}

define_const!(default_context_name, DEFAULT_CONTEXT_NAME.to_string(), String);
define_const!(default_context_path, DEFAULT_CONTEXT_PATH.to_string(), String);
define_const!(default_engine_name, DEFAULT_ENGINE_NAME.to_string(), String);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub arbitration: ArbitrationPolicy,
    /// The context elements without explicit targets are bound to.
    #[serde(default = "default_context_name")]
    pub default_context: String,
    #[serde(default = "default_context_path")]
    pub default_context_path: String,
    #[serde(default)]
    pub engine: EngineSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            arbitration: ArbitrationPolicy::default(),
            default_context: default_context_name(),
            default_context_path: default_context_path(),
            engine: EngineSettings::default(),
        }
    }
}

/// Opaque engine settings, only interpreted by the engine adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_engine_name")]
    pub name: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            name: default_engine_name(),
            properties: BTreeMap::new(),
        }
    }
}

impl EngineSettings {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}
