//! Secret lookup for SSH prompts.
//!
//! A credential source answers "what is the secret for this prompt" without
//! user interaction. The keychain-backed source stores SSH passwords and key
//! passphrases under the `sqltunnel-ssh` service, keyed per login/host/port.

use anyhow::{Context, Result};
use keyring::Entry;
use std::fmt;
use std::path::Path;

/// Keyring service name for SSH passwords
const SSH_KEYRING_SERVICE: &str = "sqltunnel-ssh";

/// Identifies which secret a prompt is asking for
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CredentialKey {
    Password {
        login: String,
        host: String,
        port: u16,
    },
    Passphrase {
        login: String,
        host: String,
        port: u16,
        key_name: String,
    },
}

impl CredentialKey {
    pub fn password(login: &str, host: &str, port: u16) -> Self {
        CredentialKey::Password {
            login: login.to_string(),
            host: host.to_string(),
            port,
        }
    }

    /// Uses the key filename to distinguish passphrases for different keys
    pub fn passphrase(login: &str, host: &str, port: u16, key_path: &str) -> Self {
        let key_name = Path::new(key_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("key");
        CredentialKey::Passphrase {
            login: login.to_string(),
            host: host.to_string(),
            port,
            key_name: key_name.to_string(),
        }
    }
}

impl fmt::Display for CredentialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialKey::Password { login, host, port } => {
                write!(f, "{}@{}:{}", login, host, port)
            }
            CredentialKey::Passphrase {
                login,
                host,
                port,
                key_name,
            } => write!(f, "key:{}@{}:{}:{}", login, host, port, key_name),
        }
    }
}

/// Anything that can produce a secret for a prompt without asking the user.
pub trait CredentialSource: Send + Sync {
    fn lookup(&self, key: &CredentialKey) -> Option<String>;

    /// Persist a secret the user typed that turned out to be correct.
    fn remember(&self, _key: &CredentialKey, _secret: &str) -> Result<()> {
        Ok(())
    }
}

impl<F> CredentialSource for F
where
    F: Fn(&CredentialKey) -> Option<String> + Send + Sync,
{
    fn lookup(&self, key: &CredentialKey) -> Option<String> {
        self(key)
    }
}

/// A single fixed secret, returned for every key
#[derive(Clone)]
pub struct StaticCredentials {
    secret: String,
}

impl StaticCredentials {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl CredentialSource for StaticCredentials {
    fn lookup(&self, _key: &CredentialKey) -> Option<String> {
        Some(self.secret.clone())
    }
}

/// System keychain (macOS Keychain, Secret Service, Windows Credential Manager)
#[derive(Debug, Clone)]
pub struct KeychainCredentials {
    service: String,
}

impl Default for KeychainCredentials {
    fn default() -> Self {
        Self {
            service: SSH_KEYRING_SERVICE.to_string(),
        }
    }
}

impl KeychainCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &CredentialKey) -> Result<Entry> {
        Entry::new(&self.service, &key.to_string()).context("Failed to create keyring entry")
    }

    /// Store a secret in the keychain
    pub fn store(&self, key: &CredentialKey, secret: &str) -> Result<()> {
        self.entry(key)?
            .set_password(secret)
            .context("Failed to store SSH secret in keychain")
    }

    /// Delete a secret from the keychain. A missing entry is not an error.
    pub fn delete(&self, key: &CredentialKey) -> Result<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) => {
                tracing::info!("Deleted SSH secret for {} from keychain", key);
                Ok(())
            }
            Err(keyring::Error::NoEntry) => {
                tracing::debug!("No keychain secret to delete for {}", key);
                Ok(())
            }
            Err(e) => Err(e).context("Failed to delete SSH secret from keychain"),
        }
    }
}

impl CredentialSource for KeychainCredentials {
    fn lookup(&self, key: &CredentialKey) -> Option<String> {
        match self.entry(key).and_then(|e| Ok(e.get_password()?)) {
            Ok(secret) => Some(secret),
            Err(e) => {
                tracing::debug!("No keychain secret for {}: {}", key, e);
                None
            }
        }
    }

    fn remember(&self, key: &CredentialKey, secret: &str) -> Result<()> {
        self.store(key, secret)
    }
}
