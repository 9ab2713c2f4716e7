use secrecy::SecretString;
use std::path::PathBuf;
use thiserror::Error;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_VAULT_DIR: &str = "vault";
const DEFAULT_MAX_FILE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Neither VAULT_KEY nor VAULT_PASSPHRASE is set")]
    MissingKey,

    #[error("VAULT_KEY and VAULT_PASSPHRASE are mutually exclusive")]
    ConflictingKeys,

    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Where the vault key comes from.
#[derive(Debug, Clone)]
pub enum KeySource {
    /// 64 hex characters.
    Hex(SecretString),
    /// Stretched with Argon2id over the salt stored in the vault.
    Passphrase(SecretString),
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub key: KeySource,
    pub max_file_size: usize,
    pub purge_orphans: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_format: LogFormat,
    pub storage: StorageConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any name -> value lookup. Empty values
    /// count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let key = match (get("VAULT_KEY"), get("VAULT_PASSPHRASE")) {
            (Some(hex), None) => KeySource::Hex(SecretString::from(hex)),
            (None, Some(passphrase)) => KeySource::Passphrase(SecretString::from(passphrase)),
            (Some(_), Some(_)) => return Err(ConfigError::ConflictingKeys),
            (None, None) => return Err(ConfigError::MissingKey),
        };

        let port = match get("PORT") {
            Some(raw) => raw.trim().parse().map_err(|e| ConfigError::Invalid {
                name: "PORT",
                reason: format!("{e}"),
            })?,
            None => DEFAULT_PORT,
        };

        let max_file_size = match get("VAULT_MAX_FILE_BYTES") {
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(0) => {
                    return Err(ConfigError::Invalid {
                        name: "VAULT_MAX_FILE_BYTES",
                        reason: "must be greater than zero".into(),
                    });
                }
                Ok(n) => n,
                Err(e) => {
                    return Err(ConfigError::Invalid {
                        name: "VAULT_MAX_FILE_BYTES",
                        reason: e.to_string(),
                    });
                }
            },
            None => DEFAULT_MAX_FILE_BYTES,
        };

        let purge_orphans = match get("VAULT_PURGE_ORPHANS") {
            Some(raw) => parse_bool("VAULT_PURGE_ORPHANS", &raw)?,
            None => false,
        };

        let log_format = match get("LOG_FORMAT").map(|v| v.trim().to_ascii_lowercase()) {
            None => LogFormat::Text,
            Some(v) if v == "text" => LogFormat::Text,
            Some(v) if v == "json" => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "LOG_FORMAT",
                    reason: format!("expected text or json, got {other}"),
                });
            }
        };

        Ok(Self {
            host: get("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port,
            log_format,
            storage: StorageConfig {
                data_dir: PathBuf::from(get("VAULT_DIR").unwrap_or_else(|| DEFAULT_VAULT_DIR.into())),
                key,
                max_file_size,
                purge_orphans,
            },
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_bool(name: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::Invalid {
            name,
            reason: format!("expected a boolean, got {other}"),
        }),
    }
}
