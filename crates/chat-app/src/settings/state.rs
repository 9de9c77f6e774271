use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use lumen_llm::{DEFAULT_OPENAI_MODEL, ProviderConfig};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use snafu::{ResultExt, Snafu};

use crate::chat::DEFAULT_WELCOME_MESSAGE;

pub const DEFAULT_PROVIDER_ID: &str = "openai";
pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";
pub const SETTINGS_DIRECTORY_NAME: &str = "lumen";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const SETTINGS_ENV_PREFIX: &str = "LUMEN_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSettings {
    #[serde(default = "default_provider_id", deserialize_with = "lenient_string")]
    pub provider_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub api_key: String,
    #[serde(default = "default_endpoint", deserialize_with = "lenient_string")]
    pub endpoint: String,
    #[serde(default = "default_model_name", deserialize_with = "lenient_string")]
    pub model_name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub preamble: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default = "default_welcome_message", deserialize_with = "lenient_string")]
    pub welcome_message: String,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            endpoint: default_endpoint(),
            model_name: default_model_name(),
            preamble: String::new(),
            temperature: None,
            max_tokens: None,
            welcome_message: default_welcome_message(),
        }
    }
}

impl ChatSettings {
    /// Builds the session config; a blank key still yields a config so the
    /// backend can report the problem.
    pub fn to_provider_config(&self) -> ProviderConfig {
        let mut config = ProviderConfig::new(
            &self.provider_id,
            &self.api_key,
            &self.endpoint,
            &self.model_name,
        )
        .with_preamble(self.preamble.clone());

        if let Some(temperature) = self.temperature {
            config = config.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.max_tokens {
            config = config.with_max_tokens(max_tokens);
        }
        config
    }

    pub fn is_valid(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    pub fn normalized(mut self) -> Self {
        self.provider_id = non_blank_or(self.provider_id, default_provider_id);
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = non_blank_or(self.endpoint, default_endpoint);
        self.model_name = non_blank_or(self.model_name, default_model_name);
        self.preamble = self.preamble.trim().to_string();
        self.welcome_message = non_blank_or(self.welcome_message, default_welcome_message);
        // Providers reject temperatures outside this range outright.
        self.temperature = self
            .temperature
            .filter(|value| value.is_finite())
            .map(|value| value.clamp(0.0, 2.0));
        self.max_tokens = self.max_tokens.filter(|value| *value > 0);
        self
    }

    /// Layers serialized defaults, an optional JSON file, then `LUMEN_*` variables.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(SETTINGS_ENV_PREFIX))
    }

    pub fn from_figment(figment: &Figment) -> Result<Self, SettingsError> {
        figment
            .extract::<Self>()
            .map(Self::normalized)
            .map_err(Box::new)
            .context(ExtractSettingsSnafu {
                stage: "extract-settings",
            })
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<ChatSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".lumen"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Result<Self, SettingsError> {
        let settings = Self::load_from_disk(&config_path)?;
        Ok(Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        })
    }

    pub fn load() -> Result<Self, SettingsError> {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<ChatSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: ChatSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> Result<ChatSettings, SettingsError> {
        if path.exists() {
            tracing::info!("loading settings from {:?}", path);
        } else {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }

        ChatSettings::from_figment(&ChatSettings::figment(path))
    }

    fn persist(&self, settings: &ChatSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("invalid settings on `{stage}`: {source}"))]
    ExtractSettings {
        stage: &'static str,
        source: Box<figment::Error>,
    },
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

/// Accepts any scalar for a text field. Env values such as `LUMEN_API_KEY=12345`
/// arrive as numbers.
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    struct LenientString;

    impl Visitor<'_> for LenientString {
        type Value = String;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or a scalar value")
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<String, E> {
            Ok(value.to_string())
        }

        fn visit_string<E: de::Error>(self, value: String) -> Result<String, E> {
            Ok(value)
        }

        fn visit_char<E: de::Error>(self, value: char) -> Result<String, E> {
            Ok(value.to_string())
        }

        fn visit_bool<E: de::Error>(self, value: bool) -> Result<String, E> {
            Ok(value.to_string())
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<String, E> {
            Ok(value.to_string())
        }

        fn visit_i128<E: de::Error>(self, value: i128) -> Result<String, E> {
            Ok(value.to_string())
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<String, E> {
            Ok(value.to_string())
        }

        fn visit_u128<E: de::Error>(self, value: u128) -> Result<String, E> {
            Ok(value.to_string())
        }

        fn visit_f64<E: de::Error>(self, value: f64) -> Result<String, E> {
            Ok(value.to_string())
        }
    }

    deserializer.deserialize_any(LenientString)
}

fn non_blank_or(value: String, fallback: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_string()
    }
}

fn default_provider_id() -> String {
    DEFAULT_PROVIDER_ID.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_model_name() -> String {
    DEFAULT_OPENAI_MODEL.to_string()
}

fn default_welcome_message() -> String {
    DEFAULT_WELCOME_MESSAGE.to_string()
}
