// SPDX-FileCopyrightText: 2025 cfgpush contributors
// SPDX-License-Identifier: MIT

//! Command set implementation.
//!
//! This module is the forward facing API of the internal library. It is meant
//! to be used in `main` of the cfgpush binary: parse the command line, load
//! settings, read the repository, build the plan, and hand it to the
//! deployment supervisor. Soft failures are journaled by the deployer; only
//! pre-plan errors bubble out of here.

use crate::{
    config::Settings,
    deploy::{deploy_plan, DeployOptions, ProgressBarSecret, Services},
    plan::{assemble, remote_path, DeploymentPlan},
    repo::{ConfigRepository, ReaderPolicy},
    tracker::{FailureJournal, JOURNAL_FILE_NAME},
    utils::{config_dir, glob_match},
    vault::Vault,
    Result,
};

use clap::{Args, Parser, Subcommand};
use indicatif::MultiProgress;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{info, instrument, warn};

/// cfgpush public command set CLI.
#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "\n  cfgpush [options] <command>",
    subcommand_help_heading = "Commands",
    version
)]
pub struct Cfgpush {
    /// Path to the controller settings file.
    #[arg(short, long, value_name = "path")]
    pub settings: Option<PathBuf>,

    /// Logging verbosity from 0 (errors only) to 5 (full trace).
    #[arg(short, long, default_value_t = 2, value_name = "level")]
    pub verbosity: u8,

    /// Command-set interfaces.
    #[command(subcommand)]
    pub command: Command,
}

impl Cfgpush {
    /// Run cfgpush command based on given arguments.
    ///
    /// # Errors
    ///
    /// Will fail for pre-plan fatal errors: bad settings, unreadable
    /// repository, unresolvable commit, malformed metadata, or a missing
    /// journal on replay. Per-file deployment failures are journaled and do
    /// not fail the run.
    pub async fn run(self) -> Result<()> {
        let settings_path = match &self.settings {
            Some(path) => path.clone(),
            None => config_dir()?.join("cfgpush.toml"),
        };

        match self.command {
            Command::DeployChanges(opts) => run_deploy_changes(&settings_path, opts).await,
            Command::DeployAll(opts) => run_deploy_all(&settings_path, opts).await,
            Command::DeployFailures(opts) => run_deploy_failures(&settings_path, opts).await,
        }
    }
}

/// Full command-set of cfgpush.
#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Deploy the files a commit changed against its first parent.
    #[command(override_usage = "cfgpush deploy-changes [options] [commit]")]
    DeployChanges(DeployChangesOptions),

    /// Deploy every file of a commit's full tree.
    #[command(override_usage = "cfgpush deploy-all [options] [commit]")]
    DeployAll(DeployAllOptions),

    /// Replay the failed subset recorded by the previous run.
    #[command(override_usage = "cfgpush deploy-failures [options]")]
    DeployFailures(DeployFailuresOptions),
}

/// Options shared by every deployment mode.
#[derive(Args, Clone, Debug, Default)]
pub struct CommonOptions {
    /// Glob patterns of hosts to deploy, all configured hosts if absent.
    #[arg(short = 'H', long = "hosts", value_delimiter = ',', value_name = "pattern")]
    pub hosts: Vec<String>,

    /// Build and show the plan without opening any connection.
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Run install command lists for files that carry them.
    #[arg(short = 'w', long)]
    pub with_install: bool,
}

/// Deploy the files a commit changed against its first parent.
#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
pub struct DeployChangesOptions {
    /// Commit to diff against its first parent, HEAD if absent.
    #[arg(value_name = "commit")]
    pub commit: Option<String>,

    /// Glob patterns restricting the planned repository paths.
    #[arg(short, long, value_delimiter = ',', value_name = "pattern")]
    pub files: Vec<String>,

    #[command(flatten)]
    pub common: CommonOptions,
}

/// Deploy every file of a commit's full tree.
#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
pub struct DeployAllOptions {
    /// Commit whose tree is deployed, HEAD if absent.
    #[arg(value_name = "commit")]
    pub commit: Option<String>,

    /// Glob patterns restricting the planned repository paths.
    #[arg(short, long, value_delimiter = ',', value_name = "pattern")]
    pub files: Vec<String>,

    #[command(flatten)]
    pub common: CommonOptions,
}

/// Replay the failed subset recorded by the previous run.
#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
pub struct DeployFailuresOptions {
    #[command(flatten)]
    pub common: CommonOptions,
}

#[instrument(skip_all, level = "debug")]
async fn run_deploy_changes(settings_path: &Path, opts: DeployChangesOptions) -> Result<()> {
    let settings = Settings::load(settings_path)?;
    let repository = ConfigRepository::open(settings.repository_path()?)?;
    let commit_id = repository.resolve_commit(opts.commit.as_deref())?;

    let policy = ReaderPolicy {
        allow_deletions: settings.allow_deletions,
        ignore_dirs: settings.ignore_dirs(),
        file_override: opts.files,
    };
    let actions = repository.changed_actions(commit_id, &policy)?;

    let plan = assemble(&settings, &repository, commit_id, actions, &opts.common.hosts)?;
    dispatch(&settings, settings_path, plan, &opts.common, false).await
}

#[instrument(skip_all, level = "debug")]
async fn run_deploy_all(settings_path: &Path, opts: DeployAllOptions) -> Result<()> {
    let settings = Settings::load(settings_path)?;
    let repository = ConfigRepository::open(settings.repository_path()?)?;
    let commit_id = repository.resolve_commit(opts.commit.as_deref())?;

    let policy = ReaderPolicy {
        allow_deletions: settings.allow_deletions,
        ignore_dirs: settings.ignore_dirs(),
        file_override: opts.files,
    };
    let actions = repository.full_tree_actions(commit_id, &policy)?;

    let plan = assemble(&settings, &repository, commit_id, actions, &opts.common.hosts)?;
    dispatch(&settings, settings_path, plan, &opts.common, false).await
}

#[instrument(skip_all, level = "debug")]
async fn run_deploy_failures(settings_path: &Path, opts: DeployFailuresOptions) -> Result<()> {
    let settings = Settings::load(settings_path)?;
    let repository = ConfigRepository::open(settings.repository_path()?)?;

    let replay = FailureJournal::replay(journal_path(settings_path))?;
    info!(
        "Replaying {} failed files against commit {}",
        replay.files().len(),
        replay.commit_id
    );

    let commit_id = repository.resolve_commit(Some(&replay.commit_id))?;
    let actions = repository.actions_for_paths(commit_id, replay.files())?;

    // The journal supplies the host override; explicit -H patterns narrow it.
    let mut hosts = replay.hosts();
    if !opts.common.hosts.is_empty() {
        hosts = glob_match(opts.common.hosts.iter().cloned(), hosts);
    }

    let plan = assemble(&settings, &repository, commit_id, actions, &hosts)?;
    dispatch(&settings, settings_path, plan, &opts.common, true).await
}

async fn dispatch(
    settings: &Settings,
    settings_path: &Path,
    plan: DeploymentPlan,
    common: &CommonOptions,
    replaying: bool,
) -> Result<()> {
    let journal = FailureJournal::new(journal_path(settings_path));

    if plan.is_empty() {
        info!("Nothing to deploy");
        if replaying && !common.dry_run {
            journal.remove()?;
        }
        return Ok(());
    }

    info!("Deployment plan:\n{}", tablize_plan(&plan));
    if common.dry_run {
        info!("Dry run, no connections will be opened");
    }

    let progress = MultiProgress::new();
    let vault = Vault::new(Box::new(ProgressBarSecret::new(progress.clone())));
    let services = Arc::new(Services::new(journal, vault, progress));

    let opts = DeployOptions {
        dry_run: common.dry_run,
        with_install: common.with_install,
        max_concurrency: settings.maximum_concurrency,
        known_hosts_path: settings.known_hosts_path()?,
    };

    let commit_id = plan.commit_id.clone();
    deploy_plan(Arc::new(plan), services.clone(), opts).await?;
    services.vault.clear();

    if services.aborted() {
        warn!("Run was aborted at a host key prompt");
    }

    if !services.journal.is_empty() {
        services.journal.persist(&commit_id)?;
        warn!(
            "Failures were recorded; run `cfgpush deploy-failures` to retry them from {:?}",
            services.journal.path()
        );
    } else if replaying && !common.dry_run {
        services.journal.remove()?;
    }

    let metrics = services.metrics();
    info!(
        "Deployed {} files across {} hosts",
        metrics.deployed_files, metrics.touched_hosts
    );

    Ok(())
}

fn journal_path(settings_path: &Path) -> PathBuf {
    match settings_path.parent() {
        Some(parent) => parent.join(JOURNAL_FILE_NAME),
        None => PathBuf::from(JOURNAL_FILE_NAME),
    }
}

fn tablize_plan(plan: &DeploymentPlan) -> String {
    let mut builder = tabled::builder::Builder::new();
    builder.push_record(["host", "action", "repository path", "remote path"]);

    for (name, host) in &plan.hosts {
        for path in &host.files {
            let Some(info) = plan.files.get(path) else {
                continue;
            };
            builder.push_record([
                name.as_str(),
                info.action.label(),
                path.as_str(),
                remote_path(path, &info.action).as_str(),
            ]);
        }
    }

    let mut table = builder.build();
    table.with(tabled::settings::Style::ascii_rounded());

    table.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    use clap::CommandFactory;

    #[test]
    fn cli_verify_structure() {
        Cfgpush::command().debug_assert();
    }

    #[test]
    fn cli_parses_modes_and_overrides() {
        let cli = Cfgpush::try_parse_from([
            "cfgpush",
            "-v",
            "4",
            "deploy-changes",
            "HEAD~2",
            "-H",
            "web*,db01",
            "--files",
            "web01/etc/*",
            "--dry-run",
        ])
        .unwrap();

       pretty_assertions::assert_eq!(cli.verbosity, 4);
        let Command::DeployChanges(opts) = cli.command else {
            panic!("expected deploy-changes");
        };
       pretty_assertions::assert_eq!(opts.commit.as_deref(), Some("HEAD~2"));
       pretty_assertions::assert_eq!(opts.common.hosts, vec!["web*", "db01"]);
       pretty_assertions::assert_eq!(opts.files, vec!["web01/etc/*"]);
        assert!(opts.common.dry_run);
        assert!(!opts.common.with_install);
    }

    #[test]
    fn cli_journal_path_sits_beside_settings() {
        let path = journal_path(Path::new("/etc/cfgpush/cfgpush.toml"));
       pretty_assertions::assert_eq!(path, Path::new("/etc/cfgpush/failtracker.log"));
    }
}
