// SPDX-FileCopyrightText: 2025 cfgpush contributors
// SPDX-License-Identifier: MIT

//! Per-host deployment engine and concurrency supervisor.
//!
//! Each host gets one worker and one SSH session. The worker partitions the
//! host's planned files into __reload groups__, sets of files sharing an
//! identical reload command list that commit or roll back together, plus a
//! flat list for everything without reload commands. Every file then runs the
//! transactional protocol: install and check commands, backup of the existing
//! remote file, hash comparison, SFTP upload into the transfer buffer, move
//! into place, ownership and mode convergence, and post-deployment hash
//! verification with restore-from-backup on mismatch. A failing reload
//! command restores every file of its group.
//!
//! The supervisor bounds in-flight workers with `MaximumConcurrency`. A
//! bound of one runs hosts in plan order and stops at the first journaled
//! failure; any larger bound always joins every host and aggregates failures
//! in the journal. A panicking worker is confined to its host.

use crate::{
    plan::{remote_path, DeploymentPlan, EndpointInfo, FileAction, FileInfo},
    session::{ConnectOptions, HostKeyPrompt, RemoteSession, TrustDecision, TrustSettings},
    tracker::FailureJournal,
    utils::sh_quote,
    vault::{SecretPrompt, Vault},
    Error, Result,
};

use futures::{stream, StreamExt};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use inquire::{Password, Select};
use sha2::{Digest, Sha256};
use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tracing::{debug, info, instrument, warn};

/// Timeout for quick metadata commands: mkdir, chmod, chown, rm, rmdir.
const META_TIMEOUT: u64 = 10;

/// Timeout for copy and listing commands: cp, mv, ls.
const COPY_TIMEOUT: u64 = 30;

/// Timeout for end-of-run cleanup commands.
const CLEANUP_TIMEOUT: u64 = 30;

/// Timeout for checks, installs, reloads, and remote hashing.
const EXEC_TIMEOUT: u64 = 90;

/// Safety bound on upward empty-directory pruning.
const PRUNE_BOUND: usize = 64_000;

/// Global run counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct Metrics {
    /// Files deployed successfully across all hosts.
    pub deployed_files: u64,

    /// Hosts with at least one successfully deployed file.
    pub touched_hosts: u64,
}

/// Long-lived shared state handed to every worker.
pub struct Services {
    /// Failure journal collecting soft failures.
    pub journal: FailureJournal,

    /// Unlocked sudo passwords.
    pub vault: Vault,

    /// Run counters, guarded for concurrent workers.
    metrics: Mutex<Metrics>,

    /// Serializes known_hosts file appends.
    pub known_hosts_lock: Mutex<()>,

    /// Sticky "trust every further unknown key" flag.
    pub trust_all: AtomicBool,

    /// Raised when the operator aborts at a trust prompt.
    abort: AtomicBool,

    /// Per-host progress bars; prompts suspend them.
    pub progress: MultiProgress,
}

impl Services {
    /// Construct run services around a journal and vault.
    pub fn new(journal: FailureJournal, vault: Vault, progress: MultiProgress) -> Self {
        Self {
            journal,
            vault,
            metrics: Mutex::new(Metrics::default()),
            known_hosts_lock: Mutex::new(()),
            trust_all: AtomicBool::new(false),
            abort: AtomicBool::new(false),
            progress,
        }
    }

    /// Snapshot of the run counters.
    ///
    /// # Panics
    ///
    /// Will panic if the metrics mutex is poisoned.
    pub fn metrics(&self) -> Metrics {
        *self.metrics.lock().unwrap()
    }

    /// Determine if the operator aborted the run.
    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Services {{ metrics: {:?} }}", self.metrics())
    }
}

/// Knobs of a single deployment run.
#[derive(Debug, Clone)]
pub struct DeployOptions {
    /// Plan and report without opening any connection.
    pub dry_run: bool,

    /// Execute install command lists.
    pub with_install: bool,

    /// Upper bound on concurrent per-host workers.
    pub max_concurrency: usize,

    /// known_hosts file consulted by every session.
    pub known_hosts_path: PathBuf,
}

/// Deploy the whole plan across its hosts.
///
/// Soft failures land in the journal, never in the return value.
///
/// # Errors
///
/// Currently infallible; the signature leaves room for pre-dispatch failures.
pub async fn deploy_plan(
    plan: Arc<DeploymentPlan>,
    services: Arc<Services>,
    opts: DeployOptions,
) -> Result<()> {
    let hosts: Vec<String> = plan.hosts.keys().cloned().collect();
    info!(
        "Dispatching {} hosts with concurrency {}",
        hosts.len(),
        opts.max_concurrency
    );

    if opts.max_concurrency == 1 {
        // Serial mode is fail-fast: the first journaled failure stops the
        // remaining hosts so the operator can intervene early.
        for name in hosts {
            if !services.journal.is_empty() {
                warn!("Failures recorded, aborting remaining hosts in serial mode");
                break;
            }
            if services.aborted() {
                break;
            }
            run_host_worker(name, plan.clone(), services.clone(), opts.clone()).await;
        }
    } else {
        stream::iter(hosts)
            .for_each_concurrent(Some(opts.max_concurrency), |name| {
                let plan = plan.clone();
                let services = services.clone();
                let opts = opts.clone();
                async move {
                    run_host_worker(name, plan, services, opts).await;
                }
            })
            .await;
    }

    Ok(())
}

// One worker: spawn the blocking deployment, confine panics, journal
// host-level failures with the host's whole file list at index 0.
async fn run_host_worker(
    name: String,
    plan: Arc<DeploymentPlan>,
    services: Arc<Services>,
    opts: DeployOptions,
) {
    let worker_plan = plan.clone();
    let worker_services = services.clone();
    let worker_name = name.clone();
    let result = tokio::task::spawn_blocking(move || {
        deploy_host(&worker_name, &worker_plan, &worker_services, &opts)
    })
    .await;

    let files = plan.hosts.get(&name).map(|host| host.files.clone()).unwrap_or_default();
    match result {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            if matches!(error, Error::HostKeyAborted) {
                services.abort.store(true, Ordering::Relaxed);
            }
            warn!("Host {name:?} failed: {error}");
            services.journal.record_host_failure(name.as_str(), files, error);
        }
        Err(join_error) => {
            warn!("Worker for {name:?} panicked: {join_error}");
            services.journal.record_host_failure(
                name.as_str(),
                files,
                Error::WorkerPanic { host: name.clone() },
            );
        }
    }
}

#[instrument(skip(plan, services, opts), level = "debug")]
fn deploy_host(
    name: &str,
    plan: &DeploymentPlan,
    services: &Services,
    opts: &DeployOptions,
) -> Result<()> {
    let Some(host) = plan.hosts.get(name) else {
        return Ok(());
    };

    if services.aborted() {
        warn!("Run aborted, skipping host {name:?}");
        return Ok(());
    }

    let (groups, singles) = partition_reload_groups(&host.files, &plan.files);
    debug!(
        "Host {name:?}: {} reload groups, {} standalone paths",
        groups.len(),
        singles.len()
    );

    if opts.dry_run {
        info!("Dry run: would deploy {} files to {name:?}", host.files.len());
        return Ok(());
    }

    let password =
        if host.password_required { Some(services.vault.unlock(&host.name)?) } else { None };

    let bar = services.progress.add(ProgressBar::no_length());
    let style = ProgressStyle::with_template("{spinner:.green} {elapsed_precise:.green}  {msg}")
        .unwrap();
    bar.set_style(style);
    bar.set_message(format!("{name} - connecting"));
    bar.enable_steady_tick(Duration::from_millis(100));

    let result = deploy_host_connected(host, plan, services, opts, password, &bar, &groups, &singles);
    bar.finish_and_clear();

    result
}

#[allow(clippy::too_many_arguments)]
fn deploy_host_connected(
    host: &EndpointInfo,
    plan: &DeploymentPlan,
    services: &Services,
    opts: &DeployOptions,
    password: Option<String>,
    bar: &ProgressBar,
    groups: &BTreeMap<String, Vec<String>>,
    singles: &[String],
) -> Result<()> {
    let trust_prompt = ProgressBarTrust::new(services.progress.clone());
    let secret_prompt = ProgressBarSecret::new(services.progress.clone());

    let session = RemoteSession::connect(
        &ConnectOptions {
            host: &host.name,
            endpoint: &host.endpoint,
            user: &host.user,
            identity_file: host.identity_file.as_deref(),
            secrets: &secret_prompt,
        },
        &TrustSettings {
            known_hosts_path: &opts.known_hosts_path,
            file_lock: &services.known_hosts_lock,
            trust_all: &services.trust_all,
            prompt: &trust_prompt,
        },
    )?;
    bar.set_message(format!("{} - deploying", host.name));

    let mut deployer = HostDeployer {
        host,
        plan,
        services,
        session,
        password,
        with_install: opts.with_install,
        succeeded: 0,
    };

    deployer.make_backup_dir()?;

    for paths in groups.values() {
        deployer.deploy_reload_group(paths);
    }
    for path in singles {
        deployer.deploy_single(path);
    }

    deployer.cleanup();

    let mut metrics = services.metrics.lock().unwrap();
    metrics.deployed_files += deployer.succeeded as u64;
    if deployer.succeeded > 0 {
        metrics.touched_hosts += 1;
    }
    drop(metrics);

    info!("Host {:?}: {} files deployed", host.name, deployer.succeeded);

    Ok(())
}

enum FileOutcome {
    /// Content was uploaded and verified.
    Uploaded {
        remote: String,
        backup: Option<String>,
    },

    /// Remote content already matched; only metadata was converged.
    Converged,
}

struct HostDeployer<'run> {
    host: &'run EndpointInfo,
    plan: &'run DeploymentPlan,
    services: &'run Services,
    session: RemoteSession,
    password: Option<String>,
    with_install: bool,
    succeeded: usize,
}

impl HostDeployer<'_> {
    fn run(&self, command: &str, timeout: u64) -> Result<String> {
        let disable_sudo = self.host.user == "root";
        self.session.run_command(command, "root", disable_sudo, self.password.as_deref(), timeout)
    }

    fn make_backup_dir(&self) -> Result<()> {
        self.run(&format!("mkdir -p {}", sh_quote(&self.host.backup_dir)), META_TIMEOUT)?;
        Ok(())
    }

    fn file_index(&self, path: &str) -> usize {
        self.host.files.iter().position(|p| p == path).map_or(1, |i| i + 1)
    }

    fn deploy_reload_group(&mut self, paths: &[String]) {
        let mut needs_reload = paths.len();
        let mut failed = false;
        let mut rollback: Vec<(String, Option<String>)> = Vec::new();

        for path in paths {
            let Some(info) = self.plan.files.get(path) else {
                continue;
            };
            match self.deploy_file(path, info) {
                Ok(FileOutcome::Converged) => {
                    needs_reload -= 1;
                    self.succeeded += 1;
                }
                Ok(FileOutcome::Uploaded { remote, backup }) => {
                    rollback.push((remote, backup));
                    self.succeeded += 1;
                }
                Err(error) => {
                    warn!("File {path:?} failed on {:?}: {error}", self.host.name);
                    failed = true;
                    self.services.journal.record_file_failure(
                        self.host.name.as_str(),
                        path.as_str(),
                        self.file_index(path),
                        error,
                    );
                }
            }
        }

        if failed || needs_reload == 0 {
            debug!("Skipping reload for group of {} files", paths.len());
            return;
        }

        let Some(commands) =
            paths.first().and_then(|path| self.plan.files.get(path)).map(|info| &info.reload_commands)
        else {
            return;
        };

        for command in commands {
            if let Err(error) = self.run(command, EXEC_TIMEOUT) {
                warn!("Reload {command:?} failed on {:?}: {error}", self.host.name);
                self.services.journal.record_host_failure(
                    self.host.name.as_str(),
                    paths.to_vec(),
                    error,
                );

                for (remote, backup) in &rollback {
                    if let Err(error) = self.restore_file(remote, backup.as_deref()) {
                        warn!("Restore of {remote:?} failed: {error}");
                    }
                }
                self.succeeded -= rollback.len();
                break;
            }
        }
    }

    fn deploy_single(&mut self, path: &str) {
        let Some(info) = self.plan.files.get(path) else {
            return;
        };

        let remote = remote_path(path, &info.action);
        let result = match &info.action {
            FileAction::Create => self.deploy_file(path, info).map(|_| ()),
            FileAction::Delete => self.delete_path(&remote),
            FileAction::SymlinkCreate { target } => self.create_symlink(&remote, target),
            FileAction::DirCreate | FileAction::DirModify => {
                self.converge_directory(&remote, info)
            }
            FileAction::Unsupported => {
                warn!("Skipping unsupported entry {path:?}");
                return;
            }
        };

        match result {
            Ok(()) => self.succeeded += 1,
            Err(error) => {
                warn!("File {path:?} failed on {:?}: {error}", self.host.name);
                self.services.journal.record_file_failure(
                    self.host.name.as_str(),
                    path,
                    self.file_index(path),
                    error,
                );
            }
        }
    }

    // Transactional per-file protocol: install, check, backup, compare,
    // upload, move, chown, chmod, verify, restore on mismatch.
    fn deploy_file(&self, path: &str, info: &FileInfo) -> Result<FileOutcome> {
        let remote = remote_path(path, &info.action);

        if self.with_install && info.install_optional {
            for command in &info.install_commands {
                self.run(command, EXEC_TIMEOUT)?;
            }
        }

        if info.checks_required {
            for command in &info.check_commands {
                self.run(command, EXEC_TIMEOUT)?;
            }
        }

        let local_hash =
            info.hash.as_deref().expect("create actions always carry a content hash");

        let backup = self.backup_file(&remote)?;
        let pre_hash = if backup.is_some() { Some(self.remote_hash(&remote)?) } else { None };

        if pre_hash.as_deref() == Some(local_hash) {
            debug!("Content of {remote:?} already matches, converging metadata");
            self.converge_metadata(&remote, info)?;
            return Ok(FileOutcome::Converged);
        }

        let body = self
            .plan
            .content
            .get(local_hash)
            .expect("planned content is always present in the body store");
        self.session.upload(body, &self.host.transfer_buffer)?;
        self.run(
            &format!("mv {} {}", sh_quote(&self.host.transfer_buffer), sh_quote(&remote)),
            COPY_TIMEOUT,
        )?;
        self.run(
            &format!("chown {}:{} {}", info.owner, info.group, sh_quote(&remote)),
            META_TIMEOUT,
        )?;
        self.run(&format!("chmod {:o} {}", info.permissions, sh_quote(&remote)), META_TIMEOUT)?;

        let post_hash = self.remote_hash(&remote)?;
        if post_hash != local_hash {
            self.restore_file(&remote, backup.as_deref())?;
            return Err(Error::HashMismatch {
                path: remote,
                expected: local_hash.into(),
                actual: post_hash,
            });
        }

        Ok(FileOutcome::Uploaded { remote, backup })
    }

    fn backup_file(&self, remote: &str) -> Result<Option<String>> {
        if !self.remote_exists(remote)? {
            return Ok(None);
        }

        let backup = format!("{}/{}", self.host.backup_dir, encode_backup_name(remote));
        self.run(&format!("cp -p {} {}", sh_quote(remote), sh_quote(&backup)), COPY_TIMEOUT)?;

        Ok(Some(backup))
    }

    fn restore_file(&self, remote: &str, backup: Option<&str>) -> Result<()> {
        match backup {
            Some(backup) => {
                self.run(&format!("cp -p {} {}", sh_quote(backup), sh_quote(remote)), COPY_TIMEOUT)?;
            }
            None => {
                self.run(&format!("rm -f {}", sh_quote(remote)), META_TIMEOUT)?;
            }
        }

        Ok(())
    }

    fn remote_exists(&self, remote: &str) -> Result<bool> {
        match self.run(&format!("ls -d {}", sh_quote(remote)), COPY_TIMEOUT) {
            Ok(_) => Ok(true),
            Err(Error::CommandFailed { .. }) => Ok(false),
            Err(error) => Err(error),
        }
    }

    fn remote_hash(&self, remote: &str) -> Result<String> {
        let command = format!("sha256sum {}", sh_quote(remote));
        let output = self.run(&command, EXEC_TIMEOUT)?;
        parse_sha256_output(&output).ok_or_else(|| Error::CommandFailed {
            command,
            stderr: format!("unexpected sha256sum output {output:?}"),
        })
    }

    fn converge_metadata(&self, remote: &str, info: &FileInfo) -> Result<()> {
        let listing = self.run(&format!("ls -ld {}", sh_quote(remote)), COPY_TIMEOUT)?;
        let current = parse_ls_long(&listing);

        let owner_differs = current
            .as_ref()
            .is_none_or(|meta| meta.owner != info.owner || meta.group != info.group);
        if owner_differs {
            self.run(
                &format!("chown {}:{} {}", info.owner, info.group, sh_quote(remote)),
                META_TIMEOUT,
            )?;
        }

        let mode_differs = current.as_ref().is_none_or(|meta| meta.mode_bits != info.permissions);
        if mode_differs {
            self.run(&format!("chmod {:o} {}", info.permissions, sh_quote(remote)), META_TIMEOUT)?;
        }

        Ok(())
    }

    fn delete_path(&self, remote: &str) -> Result<()> {
        match self.run(&format!("rm {}", sh_quote(remote)), META_TIMEOUT) {
            Ok(_) => {}
            Err(Error::CommandFailed { stderr, .. }) if is_no_such_file(&stderr) => {
                debug!("Path {remote:?} already absent");
            }
            Err(error) => return Err(error),
        }

        // Prune newly empty parent directories, bounded upward walk.
        let mut current = parent_dir(remote);
        for _ in 0..PRUNE_BOUND {
            let Some(dir) = current else {
                break;
            };
            if dir == "/" {
                break;
            }

            let listing = self.run(&format!("ls -A {}", sh_quote(&dir)), COPY_TIMEOUT)?;
            if !listing.is_empty() {
                break;
            }

            self.run(&format!("rmdir {}", sh_quote(&dir)), META_TIMEOUT)?;
            debug!("Pruned empty directory {dir:?}");
            current = parent_dir(&dir);
        }

        Ok(())
    }

    fn create_symlink(&self, remote: &str, target: &str) -> Result<()> {
        if self.remote_exists(remote)? {
            return Err(Error::SymlinkPathExists { path: remote.into() });
        }

        self.run(&format!("ln -s {} {}", sh_quote(target), sh_quote(remote)), META_TIMEOUT)?;

        Ok(())
    }

    fn converge_directory(&self, remote: &str, info: &FileInfo) -> Result<()> {
        self.run(&format!("mkdir -p {}", sh_quote(remote)), META_TIMEOUT)?;
        self.converge_metadata(remote, info)
    }

    fn cleanup(&self) {
        let commands = [
            format!("rm {}", sh_quote(&self.host.transfer_buffer)),
            format!("rm -r {}", sh_quote(&self.host.backup_dir)),
        ];

        for command in commands {
            match self.run(&command, CLEANUP_TIMEOUT) {
                Ok(_) => {}
                Err(Error::CommandFailed { stderr, .. }) if is_no_such_file(&stderr) => {}
                Err(error) => warn!("Cleanup {command:?} failed on {:?}: {error}", self.host.name),
            }
        }
    }
}

/// Partition a host's planned paths into reload groups and the standalone
/// list.
///
/// Reload-set identity is a stable digest of the ordered command list, so
/// files sharing an identical list land in one group regardless of their
/// order in the plan.
pub fn partition_reload_groups(
    files: &[String],
    infos: &HashMap<String, FileInfo>,
) -> (BTreeMap<String, Vec<String>>, Vec<String>) {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut singles = Vec::new();

    for path in files {
        match infos.get(path) {
            Some(info) if info.reload_required && info.action.carries_content() => {
                groups.entry(reload_set_digest(&info.reload_commands)).or_default().push(path.clone());
            }
            _ => singles.push(path.clone()),
        }
    }

    (groups, singles)
}

/// Stable digest identifying an ordered reload command list.
pub fn reload_set_digest(commands: &[String]) -> String {
    let mut hasher = Sha256::new();
    for command in commands {
        hasher.update(command.as_bytes());
        hasher.update(b"\n");
    }

    hex::encode(hasher.finalize())
}

// Reversible encoding keying backups by their origin path.
pub(crate) fn encode_backup_name(path: &str) -> String {
    path.replace('%', "%25").replace('/', "%2F")
}

pub(crate) fn parent_dir(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }

    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) => Some("/".into()),
        Some((parent, _)) => Some(parent.into()),
        None => None,
    }
}

fn is_no_such_file(stderr: &str) -> bool {
    stderr.to_lowercase().contains("no such file")
}

pub(crate) fn parse_sha256_output(output: &str) -> Option<String> {
    let first = output.split_whitespace().next()?;
    if first.len() == 64 && first.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(first.to_lowercase())
    } else {
        None
    }
}

/// Metadata of a remote path as reported by `ls -ld`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RemoteMetadata {
    pub(crate) mode_bits: u32,
    pub(crate) owner: String,
    pub(crate) group: String,
}

pub(crate) fn parse_ls_long(line: &str) -> Option<RemoteMetadata> {
    let mut fields = line.split_whitespace();
    let mode = fields.next()?;
    let _links = fields.next()?;
    let owner = fields.next()?.to_string();
    let group = fields.next()?.to_string();

    if mode.len() < 10 || !mode.is_ascii() {
        return None;
    }
    let mode_bits = symbolic_mode_bits(&mode[1..10])?;

    Some(RemoteMetadata { mode_bits, owner, group })
}

// rwxr-sr-t style permission string to octal bits, including setuid, setgid,
// and sticky markers.
pub(crate) fn symbolic_mode_bits(symbolic: &str) -> Option<u32> {
    let chars: Vec<char> = symbolic.chars().collect();
    if chars.len() != 9 {
        return None;
    }

    let mut bits = 0;
    for (i, &c) in chars.iter().enumerate() {
        let bit = 1 << (8 - i);
        match (c, i % 3, i) {
            ('-', _, _) => {}
            ('r', 0, _) | ('w', 1, _) | ('x', 2, _) => bits |= bit,
            ('s', _, 2) => bits |= bit | 0o4000,
            ('S', _, 2) => bits |= 0o4000,
            ('s', _, 5) => bits |= bit | 0o2000,
            ('S', _, 5) => bits |= 0o2000,
            ('t', _, 8) => bits |= bit | 0o1000,
            ('T', _, 8) => bits |= 0o1000,
            _ => return None,
        }
    }

    Some(bits)
}

/// Trust prompt that suspends the progress bars while the operator answers.
pub struct ProgressBarTrust {
    bars: MultiProgress,
}

impl ProgressBarTrust {
    /// Construct a trust prompt over the run's progress bars.
    pub fn new(bars: MultiProgress) -> Self {
        Self { bars }
    }
}

impl HostKeyPrompt for ProgressBarTrust {
    fn decide(&self, host: &str, fingerprint: &str) -> Result<TrustDecision> {
        self.bars.suspend(|| {
            info!("Unknown host key for {host}, SHA256 fingerprint {fingerprint}");
            let choice = Select::new(
                "Trust this host key?",
                vec!["add", "add all", "skip", "abort"],
            )
            .prompt()?;

            Ok(match choice {
                "add" => TrustDecision::Add,
                "add all" => TrustDecision::AddAll,
                "skip" => TrustDecision::Skip,
                _ => TrustDecision::Abort,
            })
        })
    }
}

/// Secret prompt that suspends the progress bars while the operator types.
pub struct ProgressBarSecret {
    bars: MultiProgress,
}

impl ProgressBarSecret {
    /// Construct a secret prompt over the run's progress bars.
    pub fn new(bars: MultiProgress) -> Self {
        Self { bars }
    }
}

impl SecretPrompt for ProgressBarSecret {
    fn secret(&self, prompt: &str) -> Result<String> {
        self.bars
            .suspend(|| Ok(Password::new(prompt).without_confirmation().prompt()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use simple_test_case::test_case;

    fn decode_backup_name(name: &str) -> String {
        name.replace("%2F", "/").replace("%25", "%")
    }

    fn create_info(reload_commands: Vec<String>) -> FileInfo {
        FileInfo {
            reload_required: !reload_commands.is_empty(),
            reload_commands,
            ..FileInfo::action_only(FileAction::Create)
        }
    }

    #[test]
    fn smoke_partition_reload_groups() {
        let mut infos = HashMap::new();
        infos.insert("host1/etc/a.conf".to_string(), create_info(vec!["svc reload".into()]));
        infos.insert("host1/etc/b.conf".to_string(), create_info(vec!["svc reload".into()]));
        infos.insert("host1/etc/c.conf".to_string(), create_info(vec!["other reload".into()]));
        infos.insert("host1/etc/motd".to_string(), create_info(Vec::new()));
        infos.insert("host1/etc/old".to_string(), FileInfo::action_only(FileAction::Delete));

        let files: Vec<String> = vec![
            "host1/etc/a.conf".into(),
            "host1/etc/b.conf".into(),
            "host1/etc/c.conf".into(),
            "host1/etc/motd".into(),
            "host1/etc/old".into(),
        ];
        let (groups, singles) = partition_reload_groups(&files, &infos);

       pretty_assertions::assert_eq!(groups.len(), 2);
        let shared = groups.get(&reload_set_digest(&["svc reload".into()])).unwrap();
       pretty_assertions::assert_eq!(shared, &vec!["host1/etc/a.conf".to_string(), "host1/etc/b.conf".to_string()]);
       pretty_assertions::assert_eq!(singles, vec!["host1/etc/motd", "host1/etc/old"]);
    }

    #[test]
    fn smoke_reload_set_digest_is_order_sensitive() {
        let forward = reload_set_digest(&["a".into(), "b".into()]);
        let backward = reload_set_digest(&["b".into(), "a".into()]);
        assert_ne!(forward, backward);

        // Digest separates commands, concatenation cannot collide.
        let joined = reload_set_digest(&["ab".into()]);
        let split = reload_set_digest(&["a".into(), "b".into()]);
        assert_ne!(joined, split);
    }

    #[test_case("/etc/nginx/nginx.conf", "%2Fetc%2Fnginx%2Fnginx.conf"; "plain path")]
    #[test_case("/opt/100%/app.conf", "%2Fopt%2F100%25%2Fapp.conf"; "percent in path")]
    #[test]
    fn smoke_backup_name_round_trip(path: &str, encoded: &str) {
       pretty_assertions::assert_eq!(encode_backup_name(path), encoded);
       pretty_assertions::assert_eq!(decode_backup_name(encoded), path);
    }

    #[test_case("/srv/x/y", Some("/srv/x"); "deep path")]
    #[test_case("/srv", Some("/"); "top level")]
    #[test_case("/", None; "root")]
    #[test]
    fn smoke_parent_dir(path: &str, expect: Option<&str>) {
       pretty_assertions::assert_eq!(parent_dir(path), expect.map(ToString::to_string));
    }

    #[test_case("rwxr-xr-x", Some(0o755); "typical dir")]
    #[test_case("rw-r-----", Some(0o640); "restricted file")]
    #[test_case("---------", Some(0); "no permissions")]
    #[test_case("rwsr-xr-x", Some(0o4755); "setuid")]
    #[test_case("rwxr-sr-x", Some(0o2755); "setgid")]
    #[test_case("rwxrwxrwt", Some(0o1777); "sticky")]
    #[test_case("rwSr--r--", Some(0o4644); "setuid without execute")]
    #[test_case("rwxrwx", None; "too short")]
    #[test_case("rwqr-xr-x", None; "bad symbol")]
    #[test]
    fn smoke_symbolic_mode_bits(symbolic: &str, expect: Option<u32>) {
       pretty_assertions::assert_eq!(symbolic_mode_bits(symbolic), expect);
    }

    #[test]
    fn smoke_parse_ls_long() {
        let line = "-rw-r----- 1 www-data www-data 1279 Jul 30 11:02 /etc/nginx/nginx.conf";
        let meta = parse_ls_long(line).unwrap();
       pretty_assertions::assert_eq!(
            meta,
            RemoteMetadata { mode_bits: 0o640, owner: "www-data".into(), group: "www-data".into() }
        );

        // SELinux hosts append a dot to the mode column.
        let line = "drwxr-xr-x. 2 root root 4096 Jul 30 11:02 /srv/app";
        let meta = parse_ls_long(line).unwrap();
       pretty_assertions::assert_eq!(meta.mode_bits, 0o755);
       pretty_assertions::assert_eq!(meta.owner, "root");

       pretty_assertions::assert_eq!(parse_ls_long("total 12"), None);
       pretty_assertions::assert_eq!(parse_ls_long(""), None);
    }

    #[test]
    fn smoke_parse_sha256_output() {
        let hash = "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03";
        let output = format!("{hash}  /etc/motd");
       pretty_assertions::assert_eq!(parse_sha256_output(&output), Some(hash.to_string()));

        let upper = format!("{}  /etc/motd", hash.to_uppercase());
       pretty_assertions::assert_eq!(parse_sha256_output(&upper), Some(hash.to_string()));

       pretty_assertions::assert_eq!(parse_sha256_output("sha256sum: missing operand"), None);
       pretty_assertions::assert_eq!(parse_sha256_output(""), None);
    }
}
