//! Private-key passphrase providers.
//!
//! The provider is selected once at startup and passed into the config-load
//! path; nothing here is ambient state.

use std::str::FromStr;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use thiserror::Error;
use tracing::warn;

/// Environment variable consulted by [`SecretProvider::Env`].
pub const ENV_PK_SECRET: &str = "MARMOT_PK_SECRET";

/// Where the private-key passphrase comes from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SecretProvider {
    /// Read `MARMOT_PK_SECRET`
    Env,
    /// Ask on the terminal
    #[default]
    Prompt,
    /// Generate a one-shot random passphrase and print it
    Generated,
}

impl SecretProvider {
    /// Fetch the passphrase; `None` means the key material is unencrypted.
    pub fn fetch(&self) -> Option<Vec<u8>> {
        match self {
            SecretProvider::Env => match std::env::var(ENV_PK_SECRET) {
                Ok(secret) if !secret.is_empty() => Some(secret.into_bytes()),
                _ => {
                    warn!("cannot find {ENV_PK_SECRET} environment variable");
                    None
                }
            },
            SecretProvider::Prompt => {
                let secret = rpassword::prompt_password("private key secret please: ").ok()?;
                if secret.is_empty() {
                    None
                } else {
                    Some(secret.into_bytes())
                }
            }
            SecretProvider::Generated => {
                let mut raw = [0u8; 16];
                rand::rngs::OsRng.fill_bytes(&mut raw);
                let secret = URL_SAFE_NO_PAD.encode(raw);
                println!("generated private key secret: {secret}");
                Some(secret.into_bytes())
            }
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown secret provider: {0}")]
pub struct ParseSecretProviderError(String);

impl FromStr for SecretProvider {
    type Err = ParseSecretProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "env" => Ok(SecretProvider::Env),
            "prompt" => Ok(SecretProvider::Prompt),
            "generated" => Ok(SecretProvider::Generated),
            other => Err(ParseSecretProviderError(other.to_string())),
        }
    }
}
