// SPDX-FileCopyrightText: 2025 cfgpush contributors
// SPDX-License-Identifier: MIT

//! Deployment plan model.
//!
//! A plan is built in one pass and never mutated after the workers take it:
//! the action map from the repository reader is joined with metadata and file
//! bodies, overlaid per host with the universal and group directories, and
//! checked against the planning invariants. Hosts marked offline, hosts
//! outside the override expression, and hosts with nothing to deploy never
//! appear.
//!
//! A host shadows a universal or group file by shipping its own file with the
//! same remote tail; such overlay paths are __denied__ for that host so a
//! repository-wide default can never clobber a deliberate per-host variant.

use crate::{
    config::Settings,
    metadata::{extract_metadata, hash_bytes, resolve_artifact},
    repo::ConfigRepository,
    utils::glob_match,
    Error, Result,
};

use git2::Oid;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, instrument, warn};

/// Action attached to every planned repository path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileAction {
    /// Write file content, new or modified.
    Create,

    /// Remove the file and prune newly empty parent directories.
    Delete,

    /// Create a directory described by a directory-metadata file.
    DirCreate,

    /// Converge metadata of a directory described by a directory-metadata
    /// file.
    DirModify,

    /// Create a symbolic link pointing at a remote absolute path.
    SymlinkCreate {
        /// Remote absolute path the link points at.
        target: String,
    },

    /// Diagnostic sentinel for undeployable tree entries.
    Unsupported,
}

impl FileAction {
    /// Short label for logs and the dry-run table.
    pub fn label(&self) -> &'static str {
        match self {
            FileAction::Create => "create",
            FileAction::Delete => "delete",
            FileAction::DirCreate => "dir create",
            FileAction::DirModify => "dir modify",
            FileAction::SymlinkCreate { .. } => "symlink create",
            FileAction::Unsupported => "unsupported",
        }
    }

    /// Determine if the action deploys file content.
    pub fn carries_content(&self) -> bool {
        matches!(self, FileAction::Create)
    }

    /// Determine if the action targets a directory.
    pub fn is_directory(&self) -> bool {
        matches!(self, FileAction::DirCreate | FileAction::DirModify)
    }
}

/// Everything the deployer needs to know about one planned path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Action to take for this path.
    pub action: FileAction,

    /// Remote owner of the deployed file or directory.
    pub owner: String,

    /// Remote group of the deployed file or directory.
    pub group: String,

    /// Remote POSIX permission bits.
    pub permissions: u32,

    /// Content size in bytes.
    pub size: u64,

    /// Lowercase 64-hex SHA-256 of the content, when the action carries any.
    pub hash: Option<String>,

    /// Whether reload commands must run after deployment.
    pub reload_required: bool,

    /// Ordered reload command list.
    pub reload_commands: Vec<String>,

    /// Whether check commands must run before deployment.
    pub checks_required: bool,

    /// Ordered check command list.
    pub check_commands: Vec<String>,

    /// Whether install commands are available for opted-in runs.
    pub install_optional: bool,

    /// Ordered install command list.
    pub install_commands: Vec<String>,
}

impl FileInfo {
    /// Info for actions that carry nothing but the action itself.
    pub fn action_only(action: FileAction) -> Self {
        Self {
            action,
            owner: String::new(),
            group: String::new(),
            permissions: 0,
            size: 0,
            hash: None,
            reload_required: false,
            reload_commands: Vec::new(),
            checks_required: false,
            check_commands: Vec::new(),
            install_optional: false,
            install_commands: Vec::new(),
        }
    }
}

/// Connection and deployment endpoint of a single host, plus its resolved
/// file list.
#[derive(Debug, Clone)]
pub struct EndpointInfo {
    /// Host name, i.e. its top-level repository directory.
    pub name: String,

    /// Socket expression to dial, `host:port` with IPv6 brackets.
    pub endpoint: String,

    /// Login user for the SSH session.
    pub user: String,

    /// Private key path; agent authentication is used when absent.
    pub identity_file: Option<std::path::PathBuf>,

    /// Whether the sudo password must come from the vault.
    pub password_required: bool,

    /// Remote scratch path used as the transfer landing zone.
    pub transfer_buffer: String,

    /// Remote scratch directory holding pre-deployment backups.
    pub backup_dir: String,

    /// Repository paths this host deploys, in filter order.
    pub files: Vec<String>,
}

/// Immutable deployment plan handed to the workers.
#[derive(Debug, Default, Clone)]
pub struct DeploymentPlan {
    /// Full hex id of the commit the plan was built from.
    pub commit_id: String,

    /// Per-host endpoints with their resolved file lists.
    pub hosts: BTreeMap<String, EndpointInfo>,

    /// Info for every planned repository path.
    pub files: HashMap<String, FileInfo>,

    /// Deduplicated file bodies keyed by content hash.
    pub content: HashMap<String, Vec<u8>>,
}

impl DeploymentPlan {
    /// Determine if the plan deploys nothing.
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Total planned path count across all hosts.
    pub fn total_files(&self) -> usize {
        self.hosts.values().map(|host| host.files.len()).sum()
    }
}

/// Absolute remote path selected by a repository path.
///
/// The first segment names the host or overlay directory; the remainder is
/// the remote path. Directory actions resolve to the metadata file's parent
/// directory.
pub fn remote_path(repo_path: &str, action: &FileAction) -> String {
    let tail = match repo_path.split_once('/') {
        Some((_, tail)) => tail,
        None => repo_path,
    };

    if action.is_directory() {
        match tail.rsplit_once('/') {
            Some((dir, _)) => format!("/{dir}"),
            None => "/".into(),
        }
    } else {
        format!("/{tail}")
    }
}

/// Build the deployment plan for one classified action map.
///
/// # Errors
///
/// - Return [`Error::BadMetadata`] or [`Error::BadArtifactPointer`] if a
///   planned file cannot be loaded.
/// - Return [`Error::RemotePathCollision`] if two planned paths of one host
///   resolve to the same remote path.
/// - Return [`Error::Git2`] if a planned blob cannot be read.
#[instrument(skip_all, level = "debug")]
pub fn assemble(
    settings: &Settings,
    repository: &ConfigRepository,
    commit_id: Oid,
    actions: BTreeMap<String, FileAction>,
    host_override: &[String],
) -> Result<DeploymentPlan> {
    let mut plan = DeploymentPlan { commit_id: commit_id.to_string(), ..Default::default() };

    for (path, action) in &actions {
        let info = load_file_info(repository, commit_id, path, action, &mut plan.content)?;
        plan.files.insert(path.clone(), info);
    }

    let group_dirs: HashSet<String> = settings.group_dirs().into_iter().collect();
    let tree_paths = repository.tree_paths(commit_id)?;
    let chosen: HashSet<String> = if host_override.is_empty() {
        settings.hosts.keys().cloned().collect()
    } else {
        glob_match(host_override.iter().cloned(), settings.hosts.keys().cloned())
            .into_iter()
            .collect()
    };

    for (name, entry) in &settings.hosts {
        if entry.is_offline() {
            debug!("Host {name:?} is offline, skipping");
            continue;
        }

        if !chosen.contains(name) {
            continue;
        }

        let groups = entry.groups();
        for tag in &groups {
            if !group_dirs.contains(tag) {
                warn!("Host {name:?} tags group {tag:?} that GroupDirs does not declare");
            }
        }

        let host_tails: HashSet<String> = tree_paths
            .iter()
            .filter_map(|path| path.split_once('/'))
            .filter(|(first, _)| *first == name.as_str())
            .map(|(_, tail)| tail.to_string())
            .collect();

        let files: Vec<String> = actions
            .iter()
            .filter(|(_, action)| !matches!(**action, FileAction::Unsupported))
            .map(|(path, _)| path)
            .filter(|path| {
                host_keeps_path(
                    name,
                    entry.ignores_universal(),
                    &groups,
                    &settings.universal_directory,
                    &host_tails,
                    path.as_str(),
                )
            })
            .cloned()
            .collect();

        if files.is_empty() {
            debug!("Host {name:?} has nothing to deploy, skipping");
            continue;
        }

        check_remote_collisions(name, &files, &plan.files)?;

        plan.hosts.insert(
            name.clone(),
            EndpointInfo {
                name: name.clone(),
                endpoint: entry.endpoint(),
                user: entry.user.clone(),
                identity_file: entry.identity_path()?,
                password_required: entry.needs_password(),
                transfer_buffer: entry.remote_transfer_buffer.clone(),
                backup_dir: entry.remote_backup_dir.clone(),
                files,
            },
        );
    }

    debug!("Planned {} files across {} hosts", plan.total_files(), plan.hosts.len());

    Ok(plan)
}

fn load_file_info(
    repository: &ConfigRepository,
    commit_id: Oid,
    path: &str,
    action: &FileAction,
    content: &mut HashMap<String, Vec<u8>>,
) -> Result<FileInfo> {
    match action {
        FileAction::Delete | FileAction::SymlinkCreate { .. } | FileAction::Unsupported => {
            Ok(FileInfo::action_only(action.clone()))
        }
        FileAction::DirCreate | FileAction::DirModify => {
            let bytes = repository.read_blob(commit_id, path)?;
            let (header, _) = extract_metadata(path, &bytes)?;
            let (owner, group) = header.owner_group(path)?;
            let permissions = header.permission_bits(path)?;

            Ok(FileInfo {
                owner,
                group,
                permissions,
                ..FileInfo::action_only(action.clone())
            })
        }
        FileAction::Create => {
            let bytes = repository.read_blob(commit_id, path)?;
            let (header, body) = extract_metadata(path, &bytes)?;
            let (owner, group) = header.owner_group(path)?;
            let permissions = header.permission_bits(path)?;

            let (hash, body) = match &header.external_content_location {
                Some(location) => resolve_artifact(path, location, &body)?,
                None => (hash_bytes(&body), body),
            };

            let size = body.len() as u64;
            content.entry(hash.clone()).or_insert(body);

            Ok(FileInfo {
                action: FileAction::Create,
                owner,
                group,
                permissions,
                size,
                hash: Some(hash),
                reload_required: !header.reload_commands.is_empty(),
                reload_commands: header.reload_commands,
                checks_required: !header.check_commands.is_empty(),
                check_commands: header.check_commands,
                install_optional: !header.install_commands.is_empty(),
                install_commands: header.install_commands,
            })
        }
    }
}

// Overlay rule of the host/file filter: a path survives for a host when its
// first segment is the host itself, the universal directory (unless the host
// opted out), or a group the host subscribes to; overlay paths shadowed by a
// host-local file with the same tail are denied.
pub(crate) fn host_keeps_path(
    host: &str,
    ignore_universal: bool,
    groups: &HashSet<String>,
    universal_dir: &str,
    host_tails: &HashSet<String>,
    path: &str,
) -> bool {
    let Some((first, tail)) = path.split_once('/') else {
        return false;
    };

    if first == host {
        return true;
    }

    if first == universal_dir {
        return !ignore_universal && !host_tails.contains(tail);
    }

    if groups.contains(first) {
        return !host_tails.contains(tail);
    }

    false
}

fn check_remote_collisions(
    host: &str,
    files: &[String],
    infos: &HashMap<String, FileInfo>,
) -> Result<()> {
    let mut seen: HashMap<String, &str> = HashMap::new();
    for path in files {
        let action = infos.get(path).map(|info| &info.action).unwrap_or(&FileAction::Create);
        let remote = remote_path(path, action);
        if let Some(first) = seen.insert(remote.clone(), path) {
            return Err(Error::RemotePathCollision {
                host: host.into(),
                first: first.into(),
                second: path.clone(),
                remote,
            });
        }
    }

    Ok(())
}
