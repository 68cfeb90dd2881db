// SPDX-FileCopyrightText: 2025 cfgpush contributors
// SPDX-License-Identifier: MIT

//! Controller settings model.
//!
//! cfgpush reads one TOML settings file describing the configuration
//! repository and every deployable host. The recognized keys keep the spelling
//! used by the on-disk formats of the rest of the system (`Hostname`,
//! `RemoteBackupDir`, `MaximumConcurrency`, ...), and the comma-separated
//! keys (`GroupTags`, `GroupDirs`, `IgnoreDirectories`) stay CSV strings.
//!
//! A minimal settings file looks like:
//!
//! ```toml
//! RepositoryPath = "~/configs"
//! UniversalDirectory = "UniversalConfs"
//!
//! [Hosts.web01]
//! Hostname = "10.0.4.11"
//! User = "deploy"
//! IdentityFile = "~/.ssh/id_ed25519"
//! ```

use crate::{
    utils::{expand_path, is_yes, split_csv},
    Error, Result,
};

use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::{Path, PathBuf},
};
use tracing::debug;

/// Deployment state value that removes a host from every plan.
pub const OFFLINE_STATE: &str = "offline";

/// Repository-wide controller settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Path to the configuration repository to deploy from.
    #[serde(rename = "RepositoryPath")]
    pub repository_path: String,

    /// Reserved top-level directory applied to every host.
    #[serde(rename = "UniversalDirectory", default = "default_universal_directory")]
    pub universal_directory: String,

    /// CSV of top-level directories applied to group-tagged hosts.
    #[serde(rename = "GroupDirs", default)]
    pub group_dirs: String,

    /// CSV of top-level directories never considered for deployment.
    #[serde(rename = "IgnoreDirectories", default)]
    pub ignore_directories: String,

    /// Path to the known_hosts file consulted for every connection.
    #[serde(rename = "UserKnownHostsFile", default = "default_known_hosts")]
    pub user_known_hosts_file: String,

    /// Path to the credential vault for password-required hosts.
    #[serde(rename = "PasswordVault", default)]
    pub password_vault: Option<String>,

    /// Upper bound on concurrent per-host deployments.
    #[serde(rename = "MaximumConcurrency", default = "default_concurrency")]
    pub maximum_concurrency: usize,

    /// Whether commit-removed files are deleted from their hosts.
    #[serde(rename = "AllowDeletions", default)]
    pub allow_deletions: bool,

    /// Per-host endpoint entries keyed by host name.
    #[serde(rename = "Hosts", default)]
    pub hosts: BTreeMap<String, HostEntry>,
}

fn default_universal_directory() -> String {
    "UniversalConfs".into()
}

fn default_known_hosts() -> String {
    "~/.ssh/known_hosts".into()
}

fn default_concurrency() -> usize {
    10
}

impl Settings {
    /// Load settings from a TOML file.
    ///
    /// # Errors
    ///
    /// - Return [`Error::BadSettings`] if the file is missing or malformed.
    /// - Return [`Error::InvalidSetting`] if a recognized key holds an
    ///   invalid value.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        debug!("Load settings at {:?}", path.as_ref());
        let data = fs::read_to_string(path.as_ref()).map_err(|error| Error::BadSettings {
            path: path.as_ref().into(),
            reason: error.to_string(),
        })?;

        data.parse().map_err(|error| match error {
            Error::BadSettings { reason, .. } => {
                Error::BadSettings { path: path.as_ref().into(), reason }
            }
            error => error,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.maximum_concurrency == 0 {
            return Err(Error::InvalidSetting {
                key: "MaximumConcurrency".into(),
                reason: "must be at least 1".into(),
            });
        }

        if self.universal_directory.trim().is_empty() {
            return Err(Error::InvalidSetting {
                key: "UniversalDirectory".into(),
                reason: "must not be empty".into(),
            });
        }

        for (name, host) in &self.hosts {
            if host.hostname.trim().is_empty() {
                return Err(Error::InvalidSetting {
                    key: format!("Hosts.{name}.Hostname"),
                    reason: "must not be empty".into(),
                });
            }
        }

        Ok(())
    }

    /// Expanded absolute path to the configuration repository.
    ///
    /// # Errors
    ///
    /// - Return [`Error::BadPathExpansion`] if expansion fails.
    pub fn repository_path(&self) -> Result<PathBuf> {
        expand_path(&self.repository_path)
    }

    /// Expanded absolute path to the known_hosts file.
    ///
    /// # Errors
    ///
    /// - Return [`Error::BadPathExpansion`] if expansion fails.
    pub fn known_hosts_path(&self) -> Result<PathBuf> {
        expand_path(&self.user_known_hosts_file)
    }

    /// Top-level group directory names.
    pub fn group_dirs(&self) -> Vec<String> {
        split_csv(&self.group_dirs)
    }

    /// Top-level directory names excluded from planning.
    pub fn ignore_dirs(&self) -> Vec<String> {
        split_csv(&self.ignore_directories)
    }

    /// Get single host entry by name.
    ///
    /// # Errors
    ///
    /// - Return [`Error::NoHostEntry`] if host does not exist in settings.
    pub fn host(&self, name: impl AsRef<str>) -> Result<&HostEntry> {
        self.hosts
            .get(name.as_ref())
            .ok_or_else(|| Error::NoHostEntry { name: name.as_ref().into() })
    }
}

impl std::str::FromStr for Settings {
    type Err = Error;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let settings: Settings = toml::from_str(data).map_err(|error| Error::BadSettings {
            path: "<inline>".into(),
            reason: error.to_string(),
        })?;

        settings.validate()?;

        Ok(settings)
    }
}

/// Per-host endpoint entry in the settings file.
#[derive(Debug, Clone, Deserialize)]
pub struct HostEntry {
    /// Address to dial, IPv4, IPv6, or resolvable name.
    #[serde(rename = "Hostname")]
    pub hostname: String,

    /// SSH port of the endpoint.
    #[serde(rename = "Port", default = "default_port")]
    pub port: u16,

    /// Login user for the SSH session.
    #[serde(rename = "User", default = "default_user")]
    pub user: String,

    /// Private key used to authenticate; agent keys are tried when absent.
    #[serde(rename = "IdentityFile", default)]
    pub identity_file: Option<String>,

    /// Remote scratch directory holding pre-deployment backups.
    #[serde(rename = "RemoteBackupDir", default = "default_backup_dir")]
    pub remote_backup_dir: String,

    /// Remote scratch path used as the transfer landing zone.
    #[serde(rename = "RemoteTransferBuffer", default = "default_transfer_buffer")]
    pub remote_transfer_buffer: String,

    /// Deployment state; `"offline"` removes the host from every plan.
    #[serde(rename = "DeploymentState", default = "default_deployment_state")]
    pub deployment_state: String,

    /// `"yes"` opts the host out of the universal directory overlay.
    #[serde(rename = "IgnoreUniversal", default)]
    pub ignore_universal: String,

    /// CSV of group directory names this host subscribes to.
    #[serde(rename = "GroupTags", default)]
    pub group_tags: String,

    /// `"yes"` marks the host as needing a sudo password from the vault.
    #[serde(rename = "PasswordRequired", default)]
    pub password_required: String,
}

fn default_port() -> u16 {
    22
}

fn default_user() -> String {
    "root".into()
}

fn default_backup_dir() -> String {
    "/tmp/.cfgpush_backups".into()
}

fn default_transfer_buffer() -> String {
    "/tmp/.cfgpush_buffer".into()
}

fn default_deployment_state() -> String {
    "online".into()
}

impl HostEntry {
    /// Endpoint socket expression, bracketing bare IPv6 addresses.
    pub fn endpoint(&self) -> String {
        if self.hostname.contains(':') && !self.hostname.starts_with('[') {
            format!("[{}]:{}", self.hostname, self.port)
        } else {
            format!("{}:{}", self.hostname, self.port)
        }
    }

    /// Determine if host is marked offline.
    pub fn is_offline(&self) -> bool {
        self.deployment_state.trim().eq_ignore_ascii_case(OFFLINE_STATE)
    }

    /// Determine if host opted out of the universal overlay.
    pub fn ignores_universal(&self) -> bool {
        is_yes(&self.ignore_universal)
    }

    /// Determine if host needs a vault password for sudo.
    pub fn needs_password(&self) -> bool {
        is_yes(&self.password_required)
    }

    /// Group directory names this host subscribes to.
    pub fn groups(&self) -> HashSet<String> {
        split_csv(&self.group_tags).into_iter().collect()
    }

    /// Expanded identity file path, if one is configured.
    ///
    /// # Errors
    ///
    /// - Return [`Error::BadPathExpansion`] if expansion fails.
    pub fn identity_path(&self) -> Result<Option<PathBuf>> {
        self.identity_file.as_deref().map(expand_path).transpose()
    }
}
