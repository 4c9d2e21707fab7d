//! TOML configuration file I/O
//!
//! Handles loading and saving the directory file: the server list, saved
//! profiles, the account's plan, and optional orchestrator/tunnel settings.

use crate::config::{OrchestratorConfig, TunnelConfig};
use crate::error::{ConfigError, VeilError};
use crate::types::{Endpoint, Profile, ProfileTarget, Tier, UserEntitlement};
use crate::vpn::selector::StaticDirectory;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Account section of the directory file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountConfig {
    #[serde(default)]
    pub tier: Tier,
}

/// Complete TOML directory file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryFile {
    #[serde(default)]
    pub account: AccountConfig,

    #[serde(rename = "server", default)]
    pub servers: Vec<Endpoint>,

    #[serde(rename = "profile", default)]
    pub profiles: Vec<Profile>,

    /// Orchestrator settings (optional)
    #[serde(default)]
    pub orchestrator: Option<OrchestratorConfig>,

    /// External tunnel client (optional)
    #[serde(default)]
    pub tunnel: Option<TunnelConfig>,
}

impl DirectoryFile {
    pub fn new(account: AccountConfig, servers: Vec<Endpoint>) -> Self {
        Self {
            account,
            servers,
            profiles: Vec::new(),
            orchestrator: None,
            tunnel: None,
        }
    }

    /// Load and validate a directory file
    pub fn from_file(path: &Path) -> Result<Self, VeilError> {
        let contents = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => VeilError::Config(ConfigError::LoadFailed {
                path: path.to_string_lossy().to_string(),
            }),
            _ => VeilError::Config(ConfigError::IoError {
                message: format!("Failed to read directory file: {}", e),
            }),
        })?;

        let file: DirectoryFile = toml::from_str(&contents).map_err(|e| {
            VeilError::Config(ConfigError::ValidationError {
                message: format!("Failed to parse directory file: {}", e),
            })
        })?;

        file.validate()
            .map_err(|message| VeilError::Config(ConfigError::ValidationError { message }))?;

        info!(
            "Loaded directory: {} servers, {} profiles, account tier {}",
            file.servers.len(),
            file.profiles.len(),
            file.account.tier
        );
        if file.orchestrator.is_none() {
            debug!("No orchestrator section in directory file, defaults will be used");
        }

        Ok(file)
    }

    /// Save the directory file, creating its parent directory if needed
    pub fn to_file(&self, path: &Path) -> Result<(), VeilError> {
        self.validate()
            .map_err(|message| VeilError::Config(ConfigError::ValidationError { message }))?;

        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                VeilError::Config(ConfigError::IoError {
                    message: format!("Failed to create config directory: {}", e),
                })
            })?;
        }

        std::fs::write(path, contents).map_err(|_e| {
            VeilError::Config(ConfigError::SaveFailed {
                path: path.to_string_lossy().to_string(),
            })
        })?;

        info!("Saved directory file to {:?}", path);
        Ok(())
    }

    /// Validate servers, profiles and optional sections
    pub fn validate(&self) -> Result<(), String> {
        let mut ids = HashSet::new();
        for server in &self.servers {
            if server.id.is_empty() {
                return Err("Server id cannot be empty".to_string());
            }
            if server.host.is_empty() {
                return Err(format!("Server {} has an empty host", server.id));
            }
            if server.country.is_empty() {
                return Err(format!("Server {} has an empty country", server.id));
            }
            if !server.score.is_finite() || server.score < 0.0 {
                return Err(format!("Server {} has an invalid score", server.id));
            }
            if !ids.insert(server.id.as_str()) {
                return Err(format!("Duplicate server id: {}", server.id));
            }
        }

        let mut names = HashSet::new();
        for profile in &self.profiles {
            if !names.insert(profile.name.as_str()) {
                return Err(format!("Duplicate profile name: {}", profile.name));
            }
            if let ProfileTarget::Server(id) = &profile.target {
                if !ids.contains(id.as_str()) {
                    return Err(format!(
                        "Profile {} references unknown server {}",
                        profile.name, id
                    ));
                }
            }
        }

        if let Some(orchestrator) = &self.orchestrator {
            orchestrator
                .validate()
                .map_err(|e| format!("Invalid orchestrator settings: {}", e))?;
        }
        if let Some(tunnel) = &self.tunnel {
            tunnel
                .validate()
                .map_err(|e| format!("Invalid tunnel settings: {}", e))?;
        }

        Ok(())
    }

    pub fn directory(&self) -> StaticDirectory {
        StaticDirectory::new(self.servers.clone()).with_profiles(self.profiles.clone())
    }

    pub fn entitlement(&self) -> UserEntitlement {
        UserEntitlement::new(self.account.tier)
    }

    /// Orchestrator settings, or defaults if not configured
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        self.orchestrator.clone().unwrap_or_default()
    }

    /// Tunnel client settings, or defaults if not configured
    pub fn tunnel_config(&self) -> TunnelConfig {
        self.tunnel.clone().unwrap_or_default()
    }
}

/// Default directory file name
const DIRECTORY_FILE_NAME: &str = "servers.toml";

/// Get the default configuration directory
///
/// Returns ~/.config/veil, or VEIL_CONFIG_DIR if set
pub fn get_config_dir() -> Result<PathBuf, VeilError> {
    if let Ok(config_dir) = std::env::var("VEIL_CONFIG_DIR") {
        return Ok(PathBuf::from(config_dir));
    }

    let home = std::env::var("HOME").map_err(|_| {
        VeilError::Config(ConfigError::IoError {
            message: "HOME environment variable not set".to_string(),
        })
    })?;

    Ok(PathBuf::from(home).join(".config").join("veil"))
}

/// Get the default directory file path
pub fn get_config_path() -> Result<PathBuf, VeilError> {
    Ok(get_config_dir()?.join(DIRECTORY_FILE_NAME))
}

/// Load the directory file from its default location
pub fn load_directory() -> Result<DirectoryFile, VeilError> {
    let path = get_config_path()?;
    DirectoryFile::from_file(&path)
}

/// Check if a directory file exists at the default location
pub fn config_exists() -> Result<bool, VeilError> {
    Ok(get_config_path()?.exists())
}
