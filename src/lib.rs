// SPDX-FileCopyrightText: 2025 cfgpush contributors
// SPDX-License-Identifier: MIT

#![allow(clippy::missing_docs_in_private_items)]
#![warn(
    missing_docs,
    clippy::missing_errors_doc,
    clippy::missing_panic_doc,
)]

//! Git-driven agentless configuration deployment.
//!
//! A cfgpush repository is a Git repository whose top-level directories name
//! target hosts, plus one reserved __universal__ directory applied to every
//! host and optional __group__ directories applied to tagged hosts. Committing
//! configuration files and running cfgpush diffs the commit against its
//! parent, derives a per-host file-action plan, and fans out over SSH to
//! back up, transfer, verify, and reload each file, rolling back on failure.
//! Failures land in a journal so a later `deploy-failures` run can replay
//! only the failed subset.

pub mod cmd;
pub mod config;
pub mod deploy;
pub mod metadata;
pub mod plan;
pub mod repo;
pub mod session;
pub mod tracker;
pub mod utils;
pub mod vault;

use std::path::PathBuf;

/// Result type of whole crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error variants of whole crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Home directory cannot be determined.
    #[error("Cannot determine path to home directory")]
    NoWayHome,

    /// Settings file missing or malformed.
    #[error("Cannot load settings from {path:?}: {reason}")]
    BadSettings {
        /// Path to offending settings file.
        path: PathBuf,

        /// Why the file cannot be used.
        reason: String,
    },

    /// Settings entry holds an invalid value.
    #[error("Invalid setting {key:?}: {reason}")]
    InvalidSetting {
        /// Offending settings key.
        key: String,

        /// What went wrong with it.
        reason: String,
    },

    /// Host was requested that the settings file does not define.
    #[error("Host {name:?} not defined in settings")]
    NoHostEntry {
        /// Name of undefined host.
        name: String,
    },

    /// Path expansion of a configured path failed.
    #[error("Cannot expand path {path:?}: {reason}")]
    BadPathExpansion {
        /// Path that failed to expand.
        path: String,

        /// Expansion failure.
        reason: String,
    },

    /// Repository file carries a malformed metadata header.
    #[error("File {path:?} has malformed metadata: {reason}")]
    BadMetadata {
        /// Repository path of offending file.
        path: String,

        /// What is wrong with the header.
        reason: String,
    },

    /// Artifact pointer file cannot be resolved to real content.
    #[error("File {path:?} has unresolvable artifact pointer: {reason}")]
    BadArtifactPointer {
        /// Repository path of pointer file.
        path: String,

        /// Why the pointer cannot be resolved.
        reason: String,
    },

    /// Symbolic link in the repository points outside of it.
    #[error("Symlink {path:?} escapes the repository with target {target:?}")]
    SymlinkEscape {
        /// Repository path of the link entry.
        path: String,

        /// Target recorded in the link blob.
        target: String,
    },

    /// Two planned files for one host land on the same remote path.
    #[error("Host {host:?}: {first:?} and {second:?} both deploy to {remote:?}")]
    RemotePathCollision {
        /// Host whose plan collides.
        host: String,

        /// First repository path.
        first: String,

        /// Second repository path.
        second: String,

        /// Shared remote target path.
        remote: String,
    },

    /// TCP dial to an endpoint failed after retries.
    #[error("Cannot reach {endpoint}")]
    Dial {
        /// Endpoint socket in `host:port` form.
        endpoint: String,

        /// Underlying socket failure.
        #[source]
        source: std::io::Error,
    },

    /// Endpoint socket expression does not resolve to an address.
    #[error("Endpoint {endpoint:?} does not resolve to a socket address")]
    BadEndpoint {
        /// Offending endpoint expression.
        endpoint: String,
    },

    /// Remote host presented a key that conflicts with known_hosts.
    #[error("Host key for {host:?} does not match known_hosts entry")]
    HostKeyMismatch {
        /// Host whose key changed.
        host: String,
    },

    /// Remote host presented no usable host key.
    #[error("No host key available for {host:?}")]
    HostKeyUnavailable {
        /// Host that presented no key.
        host: String,
    },

    /// Operator declined the host key at the trust prompt.
    #[error("Host key for {host:?} was not trusted")]
    HostKeyRejected {
        /// Host whose key was declined.
        host: String,
    },

    /// Operator aborted the run at the trust prompt.
    #[error("Run aborted at host key prompt")]
    HostKeyAborted,

    /// SSH authentication failed for every configured method.
    #[error("Authentication failed for {user}@{host}")]
    AuthFailed {
        /// Login user.
        user: String,

        /// Host that refused authentication.
        host: String,
    },

    /// Remote command exceeded its timeout and was cut off.
    #[error("Command {command:?} timed out after {seconds}s")]
    CommandTimeout {
        /// Command that was cut off.
        command: String,

        /// Timeout that expired.
        seconds: u64,
    },

    /// Remote command exited non-zero.
    #[error("Command {command:?} failed: {stderr}")]
    CommandFailed {
        /// Command that failed.
        command: String,

        /// Captured standard error.
        stderr: String,
    },

    /// Remote side refused the file transfer target.
    #[error("Permission denied writing {path:?} on remote")]
    UploadDenied {
        /// Remote path that was refused.
        path: String,
    },

    /// Post-deployment hash verification failed.
    #[error("Remote hash of {path:?} is {actual}, expected {expected}")]
    HashMismatch {
        /// Remote path whose content is wrong.
        path: String,

        /// Hash the plan expected.
        expected: String,

        /// Hash the remote reported.
        actual: String,
    },

    /// Symbolic link target path is already occupied on the remote.
    #[error("Refusing to create symlink over existing path {path:?}")]
    SymlinkPathExists {
        /// Occupied remote path.
        path: String,
    },

    /// Deployment worker died from a panic.
    #[error("Deployment worker for {host:?} panicked")]
    WorkerPanic {
        /// Host whose worker died.
        host: String,
    },

    /// Failure journal exists but cannot be replayed.
    #[error("Failure journal {path:?} is malformed: {reason}")]
    BadJournal {
        /// Path to the journal file.
        path: PathBuf,

        /// Why it cannot be parsed.
        reason: String,
    },

    /// Failure journal is absent when a replay was requested.
    #[error("No failure journal at {path:?}, nothing to replay")]
    NoJournal {
        /// Expected journal location.
        path: PathBuf,
    },

    /// Underlying Git operation failed.
    #[error(transparent)]
    Git2(#[from] git2::Error),

    /// Underlying SSH operation failed.
    #[error(transparent)]
    Ssh(#[from] ssh2::Error),

    /// Underlying file system operation failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Interactive prompt failed.
    #[error(transparent)]
    Prompt(#[from] inquire::InquireError),
}
