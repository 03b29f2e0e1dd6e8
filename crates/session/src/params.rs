use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::Figment;
use figment::providers::{Format, Json, Serialized};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

const CONFIG_DIRECTORY_NAME: &str = "quill";
const DEFAULTS_FILE_NAME: &str = "ai-defaults.json";

/// Process-wide generation defaults, merged from the config file over the
/// built-in values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiDefaults {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u64,
    pub top_p: f64,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
    /// Extra system prompt applied only to regenerated turns when non-empty.
    pub custom_prompt: String,
}

impl Default for AiDefaults {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.7,
            max_tokens: 1024,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            custom_prompt: String::new(),
        }
    }
}

/// Immutable parameter snapshot taken at attempt start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiParams {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u64,
    pub top_p: f64,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
}

/// Per-call overrides; unset fields fall back to the process-wide defaults.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AiOverrides {
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    pub top_p: Option<f64>,
    pub frequency_penalty: Option<f64>,
    pub presence_penalty: Option<f64>,
}

impl AiOverrides {
    pub fn resolve(&self, defaults: &AiDefaults) -> AiParams {
        AiParams {
            model: self.model.clone().unwrap_or_else(|| defaults.model.clone()),
            temperature: self.temperature.unwrap_or(defaults.temperature),
            max_tokens: self.max_tokens.unwrap_or(defaults.max_tokens),
            top_p: self.top_p.unwrap_or(defaults.top_p),
            frequency_penalty: self.frequency_penalty.unwrap_or(defaults.frequency_penalty),
            presence_penalty: self.presence_penalty.unwrap_or(defaults.presence_penalty),
        }
    }
}

/// Lock-free holder for the current defaults; readers take cheap snapshots.
#[derive(Debug, Clone)]
pub struct AiDefaultsStore {
    defaults: Arc<ArcSwap<AiDefaults>>,
}

impl Default for AiDefaultsStore {
    fn default() -> Self {
        Self::new(AiDefaults::default())
    }
}

impl AiDefaultsStore {
    pub fn new(defaults: AiDefaults) -> Self {
        Self {
            defaults: Arc::new(ArcSwap::from_pointee(defaults)),
        }
    }

    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(CONFIG_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(format!(".{CONFIG_DIRECTORY_NAME}")))
            .join(DEFAULTS_FILE_NAME)
    }

    /// Loads defaults from the given JSON file, falling back to built-ins for
    /// missing fields. A malformed file logs a warning and yields built-ins.
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            tracing::info!(path = %path.display(), "defaults file not found, using built-ins");
            return Self::default();
        }

        let figment =
            Figment::from(Serialized::defaults(AiDefaults::default())).merge(Json::file(path));

        match figment.extract::<AiDefaults>() {
            Ok(defaults) => Self::new(defaults),
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "failed to parse AI defaults, using built-ins"
                );
                Self::default()
            }
        }
    }

    pub fn load() -> Self {
        Self::load_from(&Self::default_config_path())
    }

    pub fn snapshot(&self) -> Arc<AiDefaults> {
        self.defaults.load_full()
    }

    pub fn update(&self, defaults: AiDefaults) {
        self.defaults.store(Arc::new(defaults));
    }
}
