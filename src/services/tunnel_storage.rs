use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::ssh::TunnelConfig;

const STORAGE_VERSION: &str = "1.0";

/// A named tunnel configuration. Secrets are never part of a profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelProfile {
    pub name: String,
    pub config: TunnelConfig,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl TunnelProfile {
    pub fn new(name: impl Into<String>, config: TunnelConfig) -> Self {
        Self {
            name: name.into(),
            config,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TunnelStorage {
    pub tunnels: Vec<TunnelProfile>,
    pub version: String,
}

impl Default for TunnelStorage {
    fn default() -> Self {
        Self {
            tunnels: Vec::new(),
            version: STORAGE_VERSION.to_string(),
        }
    }
}

/// Load tunnel profiles from the JSON file
pub async fn load_profiles(file_path: &Path) -> Result<Vec<TunnelProfile>> {
    if !file_path.exists() {
        // Return empty vec if file doesn't exist
        return Ok(Vec::new());
    }

    let content = async_fs::read_to_string(file_path)
        .await
        .context("Failed to read tunnels file")?;

    if content.trim().is_empty() {
        return Ok(Vec::new());
    }

    let storage: TunnelStorage =
        serde_json::from_str(&content).context("Failed to parse tunnels JSON")?;

    Ok(storage.tunnels)
}

/// Save tunnel profiles to the JSON file
pub async fn save_profiles(file_path: &Path, tunnels: &[TunnelProfile]) -> Result<()> {
    // Ensure the parent directory exists
    if let Some(parent) = file_path.parent() {
        async_fs::create_dir_all(parent)
            .await
            .context("Failed to create sqltunnel directory")?;
    }

    let storage = TunnelStorage {
        tunnels: tunnels.to_vec(),
        version: STORAGE_VERSION.to_string(),
    };

    let json_content =
        serde_json::to_string_pretty(&storage).context("Failed to serialize tunnels")?;

    async_fs::write(file_path, json_content)
        .await
        .context("Failed to write tunnels file")?;

    Ok(())
}

/// Get the default tunnels file path (~/.sqltunnel/tunnels.json)
pub fn default_profiles_path() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
    Ok(home.join(".sqltunnel").join("tunnels.json"))
}

/// Find a saved profile by name
pub async fn find_profile(file_path: &Path, name: &str) -> Result<Option<TunnelProfile>> {
    let tunnels = load_profiles(file_path).await?;
    Ok(tunnels.into_iter().find(|t| t.name == name))
}

/// Add a profile, replacing any existing one with the same name
pub async fn upsert_profile(file_path: &Path, profile: TunnelProfile) -> Result<()> {
    let mut tunnels = load_profiles(file_path).await?;

    match tunnels.iter_mut().find(|t| t.name == profile.name) {
        Some(existing) => *existing = profile,
        None => tunnels.push(profile),
    }

    save_profiles(file_path, &tunnels).await
}

/// Remove a profile by name. Returns whether it existed.
pub async fn remove_profile(file_path: &Path, name: &str) -> Result<bool> {
    let mut tunnels = load_profiles(file_path).await?;

    let initial_len = tunnels.len();
    tunnels.retain(|t| t.name != name);

    let was_removed = tunnels.len() < initial_len;
    if was_removed {
        save_profiles(file_path, &tunnels).await?;
    }

    Ok(was_removed)
}
