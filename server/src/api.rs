//! Wire types shared by whistlers, listeners and the server.

use std::{collections::HashMap, fmt, str::FromStr};

use ed25519_dalek::{SigningKey, VerifyingKey};
use redis::Value;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{crypto, error::BackendError};

/// Message severity level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Critical,
    Error,
    Warning,
    #[default]
    Info,
    Debug,
}

impl Level {
    pub const ALL: [Level; 5] = [
        Level::Critical,
        Level::Error,
        Level::Warning,
        Level::Info,
        Level::Debug,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Critical => "CRITICAL",
            Level::Error => "ERROR",
            Level::Warning => "WARNING",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown message level: {0}")]
pub struct ParseLevelError(String);

impl FromStr for Level {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CRITICAL" => Ok(Level::Critical),
            "ERROR" => Ok(Level::Error),
            "WARNING" => Ok(Level::Warning),
            "INFO" => Ok(Level::Info),
            "DEBUG" => Ok(Level::Debug),
            other => Err(ParseLevelError(other.to_string())),
        }
    }
}

/// Signed message envelope.
///
/// The default value doubles as the sentinel appended when a channel stream
/// is created, so a fresh stream always has a last-generated id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub channel: String,
    pub content: String,
    pub whistler: String,
    pub level: Level,
    pub signature: String,
}

impl Message {
    /// Digest covered by the signature: `SHA256(channel ":" LEVEL ":" content)`.
    pub fn digest(&self) -> [u8; 32] {
        let data = format!("{}:{}:{}", self.channel, self.level, self.content);
        crypto::hash_data(data.as_bytes())
    }

    /// Update the signature over the envelope digest.
    pub fn sign(mut self, prikey: &SigningKey) -> Self {
        self.signature = crypto::sign_digest(prikey, &self.digest());
        self
    }

    /// Verify the signature over the envelope digest.
    pub fn verify(&self, pubkey: &VerifyingKey) -> bool {
        crypto::verify_digest(pubkey, &self.digest(), &self.signature)
    }

    /// Field/value pairs for a stream-entry append.
    pub fn to_entry(&self) -> [(&'static str, String); 5] {
        [
            ("channel", self.channel.clone()),
            ("content", self.content.clone()),
            ("whistler", self.whistler.clone()),
            ("level", self.level.to_string()),
            ("signature", self.signature.clone()),
        ]
    }

    /// Parse an envelope back out of stream-entry fields. Strict: a missing
    /// field or an unknown level is a malformed entry.
    pub fn from_entry(map: &HashMap<String, Value>) -> Result<Self, BackendError> {
        fn field(map: &HashMap<String, Value>, name: &str) -> Result<String, BackendError> {
            let value = map
                .get(name)
                .ok_or_else(|| BackendError::Entry(format!("missing field: {name}")))?;
            redis::from_redis_value(value).map_err(BackendError::from)
        }

        Ok(Message {
            channel: field(map, "channel")?,
            content: field(map, "content")?,
            whistler: field(map, "whistler")?,
            level: field(map, "level")?
                .parse()
                .map_err(|e| BackendError::Entry(format!("{e}")))?,
            signature: field(map, "signature")?,
        })
    }
}

/// `POST /api/whistle` request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhistleRequest {
    pub messages: Vec<Message>,
}

/// `POST /api/whistle` response body, one flag per request message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhistleResponse {
    pub published: Vec<bool>,
}
