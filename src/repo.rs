// SPDX-FileCopyrightText: 2025 cfgpush contributors
// SPDX-License-Identifier: MIT

//! Configuration repository reading.
//!
//! The configuration repository is the single source of truth: top-level
//! directories name hosts (plus the universal and group directories), and
//! everything below a top-level directory mirrors the absolute path on the
//! remote side. This module resolves commits, diffs them against their first
//! parent, walks full trees, and classifies every touched path into the
//! action the deployer should take. Files sitting directly in the repository
//! root carry no host and are always skipped.

use crate::{
    metadata::DIR_METADATA_NAME,
    plan::FileAction,
    utils::glob_match,
    Error, Result,
};

use git2::{
    Commit, Delta, DiffFile, DiffFindOptions, DiffOptions, FileMode, ObjectType, Oid, Repository,
    Tree,
};
use std::{
    collections::{BTreeMap, VecDeque},
    path::{Path, PathBuf},
};
use tracing::{debug, instrument, warn};

/// Path classification policy for a single run.
#[derive(Debug, Default, Clone)]
pub struct ReaderPolicy {
    /// Whether commit-removed files become `Delete` actions.
    pub allow_deletions: bool,

    /// Top-level directories excluded from planning.
    pub ignore_dirs: Vec<String>,

    /// Glob patterns restricting the planned repository paths, empty = all.
    pub file_override: Vec<String>,
}

/// Open handle on the configuration repository.
pub struct ConfigRepository {
    repository: Repository,
}

impl ConfigRepository {
    /// Open the configuration repository at a local path.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Git2`] if the path is not a Git repository.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let repository = Repository::open(path.as_ref())?;
        Ok(Self { repository })
    }

    /// Resolve a commit expression, defaulting to HEAD.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Git2`] if the expression does not name a commit.
    pub fn resolve_commit(&self, spec: Option<&str>) -> Result<Oid> {
        let spec = spec.unwrap_or("HEAD");
        let commit = self.repository.revparse_single(spec)?.peel_to_commit()?;
        Ok(commit.id())
    }

    /// Classify the patch between a commit and its first parent.
    ///
    /// Initial commits diff against the empty tree. Renames and copies are
    /// detected; the "to" side yields a create-flavored action, the "from"
    /// side a `Delete` when deletions are allowed or the file moved to a
    /// different top-level directory.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Git2`] if the commit cannot be read or diffed.
    /// - Return [`Error::SymlinkEscape`] if a changed symlink points outside
    ///   the repository.
    #[instrument(skip(self, policy), level = "debug")]
    pub fn changed_actions(
        &self,
        commit_id: Oid,
        policy: &ReaderPolicy,
    ) -> Result<BTreeMap<String, FileAction>> {
        let commit = self.repository.find_commit(commit_id)?;
        let tree = commit.tree()?;
        let parent_tree =
            if commit.parent_count() == 0 { None } else { Some(commit.parent(0)?.tree()?) };

        let mut opts = DiffOptions::new();
        opts.ignore_submodules(true);
        let mut diff = self.repository.diff_tree_to_tree(
            parent_tree.as_ref(),
            Some(&tree),
            Some(&mut opts),
        )?;
        let mut find = DiffFindOptions::new();
        find.renames(true).copies(true);
        diff.find_similar(Some(&mut find))?;

        let mut actions = BTreeMap::new();
        for delta in diff.deltas() {
            match delta.status() {
                Delta::Added => {
                    if let Some(path) = valid_path(&delta.new_file(), policy) {
                        let action =
                            self.classify_entry(&commit, &path, delta.new_file().mode(), false)?;
                        actions.insert(path, action);
                    }
                }
                Delta::Modified | Delta::Typechange => {
                    if let Some(path) = valid_path(&delta.new_file(), policy) {
                        let action =
                            self.classify_entry(&commit, &path, delta.new_file().mode(), true)?;
                        actions.insert(path, action);
                    }
                }
                Delta::Deleted => {
                    if !policy.allow_deletions {
                        continue;
                    }
                    if let Some(path) = valid_path(&delta.old_file(), policy) {
                        actions.insert(path, FileAction::Delete);
                    }
                }
                Delta::Renamed | Delta::Copied => {
                    let new_segment = delta
                        .new_file()
                        .path()
                        .and_then(Path::to_str)
                        .and_then(first_segment)
                        .map(str::to_owned);
                    if let Some(path) = valid_path(&delta.new_file(), policy) {
                        let action =
                            self.classify_entry(&commit, &path, delta.new_file().mode(), true)?;
                        actions.insert(path, action);
                    }

                    let Some(old_path) = valid_path(&delta.old_file(), policy) else {
                        continue;
                    };
                    let crossed_hosts = first_segment(&old_path) != new_segment.as_deref();
                    if crossed_hosts || policy.allow_deletions {
                        actions.insert(old_path, FileAction::Delete);
                    }
                }
                status => {
                    debug!("Skip delta with status {status:?}");
                }
            }
        }

        retain_overridden(&mut actions, policy);
        debug!("Classified {} changed paths", actions.len());

        Ok(actions)
    }

    /// Classify every file of a commit's full tree as a create-flavored
    /// action.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Git2`] if the tree cannot be walked.
    /// - Return [`Error::SymlinkEscape`] if a symlink points outside the
    ///   repository.
    #[instrument(skip(self, policy), level = "debug")]
    pub fn full_tree_actions(
        &self,
        commit_id: Oid,
        policy: &ReaderPolicy,
    ) -> Result<BTreeMap<String, FileAction>> {
        let commit = self.repository.find_commit(commit_id)?;

        let mut actions = BTreeMap::new();
        for (path, mode) in self.walk_tree(commit.tree()?)? {
            if !path_is_deployable(&path, policy) {
                continue;
            }
            let action = self.classify_entry(&commit, &path, mode, false)?;
            actions.insert(path, action);
        }

        retain_overridden(&mut actions, policy);
        debug!("Classified {} tree paths", actions.len());

        Ok(actions)
    }

    /// Classify an explicit list of repository paths against a commit tree.
    ///
    /// Used to replay a failure journal: every listed path is looked up in
    /// the commit the journal recorded and classified as if freshly created.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Git2`] if a listed path is absent from the commit.
    pub fn actions_for_paths(
        &self,
        commit_id: Oid,
        paths: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<BTreeMap<String, FileAction>> {
        let commit = self.repository.find_commit(commit_id)?;
        let tree = commit.tree()?;

        let mut actions = BTreeMap::new();
        for path in paths {
            let path = path.into();
            let entry = tree.get_path(Path::new(&path))?;
            let mode = file_mode_of(entry.filemode());
            let action = self.classify_entry(&commit, &path, mode, false)?;
            actions.insert(path, action);
        }

        Ok(actions)
    }

    /// Every blob path in a commit's tree.
    ///
    /// Feeds the universal-override denial sets: a host shadows a universal
    /// file with any file it ships, whether or not the commit touched it.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Git2`] if the tree cannot be walked.
    pub fn tree_paths(&self, commit_id: Oid) -> Result<Vec<String>> {
        let commit = self.repository.find_commit(commit_id)?;
        let paths = self.walk_tree(commit.tree()?)?.into_iter().map(|(path, _)| path).collect();

        Ok(paths)
    }

    /// Read a blob's content at a path within a commit tree.
    ///
    /// # Errors
    ///
    /// - Return [`Error::Git2`] if the path has no blob in the tree.
    pub fn read_blob(&self, commit_id: Oid, path: impl AsRef<Path>) -> Result<Vec<u8>> {
        let commit = self.repository.find_commit(commit_id)?;
        let entry = commit.tree()?.get_path(path.as_ref())?;
        let blob = entry.to_object(&self.repository)?.peel_to_blob()?;

        Ok(blob.content().to_vec())
    }

    // Iterate through all trees of the commit, collecting the full path and
    // file mode of every blob until the queue is exhausted.
    fn walk_tree<'repo>(&'repo self, tree: Tree<'repo>) -> Result<Vec<(String, FileMode)>> {
        let mut entries = Vec::new();
        let mut trees_and_paths: VecDeque<(Tree<'repo>, PathBuf)> = VecDeque::new();
        trees_and_paths.push_front((tree, PathBuf::new()));

        while let Some((tree, path)) = trees_and_paths.pop_front() {
            for tree_entry in tree.iter() {
                let name = String::from_utf8_lossy(tree_entry.name_bytes()).into_owned();
                match tree_entry.kind() {
                    Some(ObjectType::Tree) => {
                        let next_tree = self.repository.find_tree(tree_entry.id())?;
                        trees_and_paths.push_front((next_tree, path.join(name)));
                    }
                    Some(ObjectType::Blob) => {
                        let full_path = path.join(name).to_string_lossy().replace('\\', "/");
                        entries.push((full_path, file_mode_of(tree_entry.filemode())));
                    }
                    _ => continue,
                }
            }
        }

        Ok(entries)
    }

    fn classify_entry(
        &self,
        commit: &Commit<'_>,
        path: &str,
        mode: FileMode,
        modifies: bool,
    ) -> Result<FileAction> {
        match mode {
            FileMode::Link => {
                let blob = commit
                    .tree()?
                    .get_path(Path::new(path))?
                    .to_object(&self.repository)?
                    .peel_to_blob()?;
                let target = String::from_utf8_lossy(blob.content()).trim().to_string();
                let resolved = resolve_link_target(path, &target)?;
                Ok(FileAction::SymlinkCreate { target: resolved })
            }
            FileMode::Blob | FileMode::BlobExecutable | FileMode::BlobGroupWritable => {
                if Path::new(path).file_name().is_some_and(|n| n == DIR_METADATA_NAME) {
                    Ok(if modifies { FileAction::DirModify } else { FileAction::DirCreate })
                } else {
                    Ok(FileAction::Create)
                }
            }
            mode => {
                warn!("Path {path:?} has unsupported file mode {mode:?}");
                Ok(FileAction::Unsupported)
            }
        }
    }
}

impl std::fmt::Debug for ConfigRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConfigRepository {{ path: {:?} }}", self.repository.path())
    }
}

fn file_mode_of(raw: i32) -> FileMode {
    match raw {
        0o040000 => FileMode::Tree,
        0o100644 => FileMode::Blob,
        0o100664 => FileMode::BlobGroupWritable,
        0o100755 => FileMode::BlobExecutable,
        0o120000 => FileMode::Link,
        0o160000 => FileMode::Commit,
        _ => FileMode::Unreadable,
    }
}

fn valid_path(file: &DiffFile<'_>, policy: &ReaderPolicy) -> Option<String> {
    let path = file.path()?.to_str()?.to_string();
    path_is_deployable(&path, policy).then_some(path)
}

fn path_is_deployable(path: &str, policy: &ReaderPolicy) -> bool {
    let Some(first) = first_segment(path) else {
        return false;
    };

    // INVARIANT: Repository root files carry no host and never deploy.
    if !path[first.len()..].starts_with('/') {
        return false;
    }

    !policy.ignore_dirs.iter().any(|dir| dir == first)
}

fn first_segment(path: &str) -> Option<&str> {
    let first = path.split('/').next()?;
    (!first.is_empty()).then_some(first)
}

fn retain_overridden(actions: &mut BTreeMap<String, FileAction>, policy: &ReaderPolicy) {
    if policy.file_override.is_empty() {
        return;
    }

    let keep = glob_match(policy.file_override.iter().cloned(), actions.keys().cloned());
    actions.retain(|path, _| keep.contains(path));
}

/// Resolve a symlink blob's target to the remote absolute path it selects.
///
/// The target is interpreted relative to the link's directory inside the
/// repository; the resolved path must stay inside a top-level host directory.
///
/// # Errors
///
/// - Return [`Error::SymlinkEscape`] if the target is absolute, climbs out of
///   the repository, or lands in the repository root.
pub fn resolve_link_target(link_path: &str, target: &str) -> Result<String> {
    let escape = || Error::SymlinkEscape { path: link_path.into(), target: target.into() };

    if target.starts_with('/') || target.is_empty() {
        return Err(escape());
    }

    let mut parts: Vec<&str> = link_path.split('/').collect();
    parts.pop();

    for component in target.split('/') {
        match component {
            "" | "." => continue,
            ".." => {
                if parts.pop().is_none() {
                    return Err(escape());
                }
            }
            component => parts.push(component),
        }
    }

    if parts.len() < 2 {
        return Err(escape());
    }

    Ok(format!("/{}", parts[1..].join("/")))
}
