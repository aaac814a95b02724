use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};

use studyhub_answer::{
    AnswerConfig, DEFAULT_ANSWER_ENDPOINT, DEFAULT_ANSWER_MODEL, DEFAULT_ANSWER_TIMEOUT,
    DEFAULT_HISTORY_LIMIT,
};

pub const CONFIG_DIRECTORY_NAME: &str = "studyhub";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const HISTORY_BLOB_FILE_NAME: &str = "history.json";
pub const DATABASE_FILE_NAME: &str = "studyhub.db";

/// Which store backing the hub runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-memory logs mirrored to a single JSON history blob.
    Memory,
    /// Durable sqlite database with store-assigned ordering.
    Sqlite,
}

/// Remote responder settings as they appear in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerSettings {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for AnswerSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            endpoint: default_endpoint(),
            model: default_model(),
            timeout_secs: default_timeout_secs(),
            history_limit: default_history_limit(),
        }
    }
}

impl AnswerSettings {
    /// Key from the file, or the conventional environment variable when the
    /// file leaves it blank.
    pub fn resolved_api_key(&self) -> Option<String> {
        if !self.api_key.trim().is_empty() {
            return Some(self.api_key.trim().to_string());
        }

        std::env::var("OPENAI_API_KEY")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    /// Connection config for the answer client; `None` without an api key.
    pub fn to_answer_config(&self) -> Option<AnswerConfig> {
        let api_key = self.resolved_api_key()?;
        Some(
            AnswerConfig::new(api_key)
                .with_endpoint(self.endpoint.clone())
                .with_model(self.model.clone())
                .with_timeout(Duration::from_secs(self.timeout_secs))
                .with_history_limit(self.history_limit),
        )
    }

    pub fn normalized(mut self) -> Self {
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = if self.endpoint.trim().is_empty() {
            default_endpoint()
        } else {
            self.endpoint.trim().to_string()
        };
        self.model = if self.model.trim().is_empty() {
            default_model()
        } else {
            self.model.trim().to_string()
        };
        if self.timeout_secs == 0 {
            self.timeout_secs = default_timeout_secs();
        }
        if self.history_limit == 0 {
            self.history_limit = default_history_limit();
        }
        self
    }
}

/// Hub configuration, loaded leniently: a missing or malformed file falls
/// back to defaults rather than failing startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,
    /// Overrides the default data directory when set.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub answer: AnswerSettings,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            data_dir: None,
            answer: AnswerSettings::default(),
        }
    }
}

impl HubConfig {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(CONFIG_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".studyhub"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(CONFIG_FILE_NAME)
    }

    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|path| path.join(CONFIG_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".studyhub"))
    }

    pub fn load() -> Self {
        Self::load_from(&Self::default_config_path())
    }

    pub fn load_from(path: &PathBuf) -> Self {
        if !path.exists() {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            return Self::default();
        }

        let figment =
            Figment::from(Serialized::defaults(Self::default())).merge(Json::file(path));

        match figment.extract::<Self>() {
            Ok(config) => config.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "failed to parse config, using defaults"
                );
                Self::default()
            }
        }
    }

    pub fn normalized(mut self) -> Self {
        self.answer = self.answer.normalized();
        self
    }

    fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(Self::default_data_dir)
    }

    /// Location of the local history blob (memory backend).
    pub fn history_blob_path(&self) -> PathBuf {
        self.data_dir().join(HISTORY_BLOB_FILE_NAME)
    }

    /// Location of the sqlite database (sqlite backend).
    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join(DATABASE_FILE_NAME)
    }
}

fn default_backend() -> StoreBackend {
    StoreBackend::Sqlite
}

fn default_endpoint() -> String {
    DEFAULT_ANSWER_ENDPOINT.to_string()
}

fn default_model() -> String {
    DEFAULT_ANSWER_MODEL.to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_ANSWER_TIMEOUT.as_secs()
}

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = HubConfig::load_from(&PathBuf::from("/nonexistent/config.json"));
        assert_eq!(config, HubConfig::default());
        assert_eq!(config.backend, StoreBackend::Sqlite);
    }

    #[test]
    fn file_values_override_defaults() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let path = scratch.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            r#"{"backend":"memory","answer":{"model":"gpt-4o","timeout_secs":5}}"#,
        )
        .expect("write config");

        let config = HubConfig::load_from(&path);
        assert_eq!(config.backend, StoreBackend::Memory);
        assert_eq!(config.answer.model, "gpt-4o");
        assert_eq!(config.answer.timeout_secs, 5);
        // Untouched fields keep their defaults.
        assert_eq!(config.answer.endpoint, DEFAULT_ANSWER_ENDPOINT);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let path = scratch.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "{broken").expect("write config");

        assert_eq!(HubConfig::load_from(&path), HubConfig::default());
    }

    #[test]
    fn normalization_restores_blank_fields() {
        let settings = AnswerSettings {
            api_key: "  key  ".to_string(),
            endpoint: "   ".to_string(),
            model: String::new(),
            timeout_secs: 0,
            history_limit: 0,
        }
        .normalized();

        assert_eq!(settings.api_key, "key");
        assert_eq!(settings.endpoint, DEFAULT_ANSWER_ENDPOINT);
        assert_eq!(settings.model, DEFAULT_ANSWER_MODEL);
        assert!(settings.timeout_secs > 0);
        assert!(settings.history_limit > 0);
    }
}
