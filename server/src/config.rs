//! JSON configuration model.
//!
//! A single file carries an optional `server` section (transport, stream
//! store, client registry, channel ACLs) and an optional `client` section
//! (identity and passphrase-protected private key). Listener and whistler
//! sets are kept in ordered collections so the emitted JSON is stable.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
};

use ed25519_dalek::SigningKey;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    crypto,
    error::ConfigError,
    secret::SecretProvider,
};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 1758;
pub const DEFAULT_REDIS_URL: &str = "redis://localhost";
pub const DEFAULT_REDIS_MAX_CONNECTIONS: usize = 50;
/// Seconds between two passes of the background trim task.
pub const DEFAULT_REDIS_TRIM_FREQ: u64 = 20;

static NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]+([_-][a-z0-9]+)*$").expect("invalid name pattern"));

/// Validate a client guid against the naming convention.
pub fn validate_guid(guid: &str) -> Result<(), ConfigError> {
    if NAME_PATTERN.is_match(guid) {
        Ok(())
    } else {
        Err(ConfigError::InvalidGuid(guid.to_string()))
    }
}

/// Validate a channel name against the naming convention.
pub fn validate_channel(channel: &str) -> Result<(), ConfigError> {
    if NAME_PATTERN.is_match(channel) {
        Ok(())
    } else {
        Err(ConfigError::InvalidChannel(channel.to_string()))
    }
}

/// Per-channel ACLs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub whistlers: BTreeSet<String>,
    #[serde(default)]
    pub listeners: BTreeSet<String>,
}

/// Stream store connection parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_trim_freq")]
    pub trim_freq: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            trim_freq: default_trim_freq(),
            max_connections: default_max_connections(),
        }
    }
}

/// Server section: transport, store, client registry and channel ACLs.
///
/// Public keys stay in their base64 transport encoding here and are decoded
/// at the point of use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub clients: BTreeMap<String, String>,
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelConfig>,
}

/// Client section: identity, server endpoint and private key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub guid: String,
    #[serde(default = "default_client_url")]
    pub url: String,
    #[serde(default = "default_capath")]
    pub capath: PathBuf,
    /// base64 PKCS#8 DER, encrypted with the provider-supplied passphrase
    pub prikey: String,
}

impl ClientConfig {
    /// Decrypt the private key with a passphrase from the given provider.
    pub fn private_key(&self, provider: &SecretProvider) -> Result<SigningKey, ConfigError> {
        let secret = provider.fetch();
        crypto::load_private_key(&self.prikey, secret.as_deref()).map_err(ConfigError::PrivateKey)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientConfig>,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        let config: Config = serde_json::from_str(&text).map_err(|source| ConfigError::Decode {
            path: path.to_owned(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        // serializing our own model cannot fail
        let text = serde_json::to_string_pretty(self).expect("config serialization failed");
        fs::write(path, text).map_err(|source| ConfigError::Write {
            path: path.to_owned(),
            source,
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(server) = &self.server {
            for (guid, pubkey) in &server.clients {
                validate_guid(guid)?;
                crypto::load_public_key(pubkey).map_err(|source| ConfigError::ClientKey {
                    guid: guid.clone(),
                    source,
                })?;
            }
            for (name, channel) in &server.channels {
                validate_channel(name)?;
                for guid in channel.whistlers.iter().chain(&channel.listeners) {
                    validate_guid(guid)?;
                }
            }
        }
        if let Some(client) = &self.client {
            validate_guid(&client.guid)?;
        }
        Ok(())
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_redis_url() -> String {
    DEFAULT_REDIS_URL.to_string()
}

fn default_trim_freq() -> u64 {
    DEFAULT_REDIS_TRIM_FREQ
}

fn default_max_connections() -> usize {
    DEFAULT_REDIS_MAX_CONNECTIONS
}

fn default_client_url() -> String {
    format!("http://{DEFAULT_HOST}:{DEFAULT_PORT}")
}

fn default_capath() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_default()
        .join(".config/marmot/ca.pem")
}
