use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use crate::pipeline::PipelineSettings;

pub const DEFAULT_INBOUND_BODY_MAX_BYTES: usize = 25 * 1024 * 1024;
pub const DEFAULT_CONFIG_FILE: &str = "lead_service.toml";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 9200;
const DEFAULT_STORE_PATH: &str = "./state/leads.db";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error("postgres store selected but LEAD_DATABASE_URL/DATABASE_URL is not set")]
    MissingDatabaseUrl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Sqlite,
    Postgres,
}

impl FromStr for StoreBackend {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ServiceConfigFile {
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    features: FeaturesSection,
}

#[derive(Debug, Deserialize, Default)]
struct ServerSection {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
struct FeaturesSection {
    gmail_verification_automation: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub store_backend: StoreBackend,
    pub store_path: PathBuf,
    pub database_url: Option<String>,
    /// Mailgun webhook signing key; signature checks are skipped without it
    /// unless `require_signature` is set.
    pub mailgun_signing_key: Option<String>,
    pub require_signature: bool,
    pub gmail_verification_automation: bool,
    pub inbound_body_max_bytes: usize,
    pub twilio_from_number: Option<String>,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let file = match resolve_config_path() {
            Some(path) => load_config_file(&path)?,
            None => ServiceConfigFile::default(),
        };
        Self::from_file_and_env(file)
    }

    fn from_file_and_env(file: ServiceConfigFile) -> Result<Self, ConfigError> {
        let host = env_var_non_empty("LEAD_SERVICE_HOST")
            .or(file.server.host)
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = match env_var_non_empty("LEAD_SERVICE_PORT") {
            Some(value) => value.parse::<u16>().map_err(|_| ConfigError::InvalidValue {
                key: "LEAD_SERVICE_PORT",
                value,
            })?,
            None => file.server.port.unwrap_or(DEFAULT_PORT),
        };

        let store_backend = match env_var_non_empty("LEAD_STORE_BACKEND") {
            Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
                key: "LEAD_STORE_BACKEND",
                value,
            })?,
            None => StoreBackend::Sqlite,
        };
        let store_path = PathBuf::from(
            env_var_non_empty("LEAD_STORE_PATH").unwrap_or_else(|| DEFAULT_STORE_PATH.to_string()),
        );
        let database_url =
            env_var_non_empty("LEAD_DATABASE_URL").or_else(|| env_var_non_empty("DATABASE_URL"));
        if store_backend == StoreBackend::Postgres && database_url.is_none() {
            return Err(ConfigError::MissingDatabaseUrl);
        }

        let gmail_verification_automation =
            match env_var_non_empty("GMAIL_VERIFICATION_AUTOMATION") {
                Some(_) => env_flag("GMAIL_VERIFICATION_AUTOMATION", true),
                None => file.features.gmail_verification_automation.unwrap_or(true),
            };

        let inbound_body_max_bytes = env_var_non_empty("INBOUND_BODY_MAX_BYTES")
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_INBOUND_BODY_MAX_BYTES);

        Ok(Self {
            host,
            port,
            store_backend,
            store_path,
            database_url,
            mailgun_signing_key: env_var_non_empty("MAILGUN_SIGNING_KEY"),
            require_signature: env_flag("INBOUND_REQUIRE_SIGNATURE", false),
            gmail_verification_automation,
            inbound_body_max_bytes,
            twilio_from_number: env_var_non_empty("TWILIO_FROM_NUMBER"),
        })
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            gmail_verification_automation: self.gmail_verification_automation,
        }
    }
}

fn resolve_config_path() -> Option<PathBuf> {
    if let Some(path) = env_var_non_empty("LEAD_SERVICE_CONFIG_PATH") {
        return Some(PathBuf::from(path));
    }
    let direct = env::current_dir().ok()?.join(DEFAULT_CONFIG_FILE);
    direct.exists().then_some(direct)
}

fn load_config_file(path: &Path) -> Result<ServiceConfigFile, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn env_flag(key: &str, default: bool) -> bool {
    match env_var_non_empty(key) {
        Some(value) => matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "y"),
        None => default,
    }
}

fn env_var_non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
