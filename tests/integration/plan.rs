// SPDX-FileCopyrightText: 2025 cfgpush contributors
// SPDX-License-Identifier: MIT

use crate::{framed_file, plain_header, GitFixture};

use cfgpush::{
    config::Settings,
    metadata::hash_bytes,
    plan::{assemble, FileAction},
    repo::{ConfigRepository, ReaderPolicy},
    tracker::FailureJournal,
};

use anyhow::Result;
use indoc::{formatdoc, indoc};
use sealed_test::prelude::*;
use std::fs;

fn reader_policy(settings: &Settings) -> ReaderPolicy {
    ReaderPolicy {
        allow_deletions: settings.allow_deletions,
        ignore_dirs: settings.ignore_dirs(),
        file_override: Vec::new(),
    }
}

#[sealed_test]
fn fresh_create_plans_single_upload() -> Result<()> {
    let fixture = GitFixture::new("repo")?;
    let motd = framed_file(&plain_header("root:root", 644), "hello\n");
    let commit = fixture.stage_and_commit("host1/etc/motd", &motd)?;

    let settings: Settings = indoc! {r#"
        RepositoryPath = "repo"

        [Hosts.host1]
        Hostname = "10.0.0.1"
    "#}
    .parse()?;
    let repository = ConfigRepository::open("repo")?;
    let actions = repository.changed_actions(commit, &reader_policy(&settings))?;
    let plan = assemble(&settings, &repository, commit, actions, &[])?;

   pretty_assertions::assert_eq!(plan.commit_id, commit.to_string());
   pretty_assertions::assert_eq!(plan.hosts.len(), 1);
   pretty_assertions::assert_eq!(plan.hosts["host1"].files, vec!["host1/etc/motd"]);
   pretty_assertions::assert_eq!(plan.hosts["host1"].endpoint, "10.0.0.1:22");

    let info = &plan.files["host1/etc/motd"];
   pretty_assertions::assert_eq!(info.action, FileAction::Create);
   pretty_assertions::assert_eq!(info.owner, "root");
   pretty_assertions::assert_eq!(info.group, "root");
   pretty_assertions::assert_eq!(info.permissions, 0o644);
    assert!(!info.reload_required);

    let hash = hash_bytes(b"hello\n");
   pretty_assertions::assert_eq!(info.hash.as_deref(), Some(hash.as_str()));
   pretty_assertions::assert_eq!(plan.content[&hash], b"hello\n");

    Ok(())
}

#[sealed_test]
fn universal_overlay_respects_overrides_and_opt_out() -> Result<()> {
    let fixture = GitFixture::new("repo")?;
    let issue = framed_file(&plain_header("root:root", 644), "universal issue\n");
    fixture.stage_and_commit("UniversalConfs/etc/issue", &issue)?;
    let own_issue = framed_file(&plain_header("root:root", 600), "host2 issue\n");
    let commit = fixture.stage_and_commit("host2/etc/issue", &own_issue)?;

    let settings: Settings = indoc! {r#"
        RepositoryPath = "repo"

        [Hosts.host1]
        Hostname = "10.0.0.1"

        [Hosts.host2]
        Hostname = "10.0.0.2"

        [Hosts.host3]
        Hostname = "10.0.0.3"
        IgnoreUniversal = "yes"
    "#}
    .parse()?;
    let repository = ConfigRepository::open("repo")?;
    let actions = repository.full_tree_actions(commit, &reader_policy(&settings))?;
    let plan = assemble(&settings, &repository, commit, actions, &[])?;

    // host1 inherits the universal file, host2 shadows it with its own, and
    // host3 opted out of the overlay leaving it with nothing to deploy.
   pretty_assertions::assert_eq!(plan.hosts["host1"].files, vec!["UniversalConfs/etc/issue"]);
   pretty_assertions::assert_eq!(plan.hosts["host2"].files, vec!["host2/etc/issue"]);
    assert!(!plan.hosts.contains_key("host3"));

    Ok(())
}

#[sealed_test]
fn group_overlay_applies_to_tagged_hosts_only() -> Result<()> {
    let fixture = GitFixture::new("repo")?;
    let nginx = framed_file(&plain_header("www-data:www-data", 640), "server {}\n");
    let commit = fixture.stage_and_commit("WebServers/etc/nginx/nginx.conf", &nginx)?;

    let settings: Settings = indoc! {r#"
        RepositoryPath = "repo"
        GroupDirs = "WebServers"

        [Hosts.web01]
        Hostname = "10.0.0.1"
        GroupTags = "WebServers"

        [Hosts.db01]
        Hostname = "10.0.0.2"
    "#}
    .parse()?;
    let repository = ConfigRepository::open("repo")?;
    let actions = repository.full_tree_actions(commit, &reader_policy(&settings))?;
    let plan = assemble(&settings, &repository, commit, actions, &[])?;

   pretty_assertions::assert_eq!(plan.hosts["web01"].files, vec!["WebServers/etc/nginx/nginx.conf"]);
    assert!(!plan.hosts.contains_key("db01"));

    Ok(())
}

#[sealed_test]
fn offline_host_never_appears_in_plan() -> Result<()> {
    let fixture = GitFixture::new("repo")?;
    let motd = framed_file(&plain_header("root:root", 644), "hello\n");
    let commit = fixture.stage_and_commit("host1/etc/motd", &motd)?;

    let settings: Settings = indoc! {r#"
        RepositoryPath = "repo"

        [Hosts.host1]
        Hostname = "10.0.0.1"
        DeploymentState = "offline"
    "#}
    .parse()?;
    let repository = ConfigRepository::open("repo")?;
    let actions = repository.changed_actions(commit, &reader_policy(&settings))?;
    let plan = assemble(&settings, &repository, commit, actions, &[])?;

    assert!(plan.is_empty());

    Ok(())
}

#[sealed_test]
fn no_op_commit_produces_empty_plan() -> Result<()> {
    let fixture = GitFixture::new("repo")?;
    let motd = framed_file(&plain_header("root:root", 644), "hello\n");
    fixture.stage_and_commit("host1/etc/motd", &motd)?;
    let unchanged = fixture.stage_and_commit("host1/etc/motd", &motd)?;

    let settings: Settings = indoc! {r#"
        RepositoryPath = "repo"

        [Hosts.host1]
        Hostname = "10.0.0.1"
    "#}
    .parse()?;
    let repository = ConfigRepository::open("repo")?;
    let actions = repository.changed_actions(unchanged, &reader_policy(&settings))?;
    let plan = assemble(&settings, &repository, unchanged, actions, &[])?;

    assert!(plan.is_empty());

    Ok(())
}

#[sealed_test]
fn deletions_enter_plan_only_when_allowed() -> Result<()> {
    let fixture = GitFixture::new("repo")?;
    let motd = framed_file(&plain_header("root:root", 644), "hello\n");
    fixture.stage_and_commit("host1/etc/motd", &motd)?;
    let keep = framed_file(&plain_header("root:root", 644), "keep\n");
    fixture.stage_and_commit("host1/etc/keep", &keep)?;
    let removal = fixture.remove_and_commit("host1/etc/motd")?;

    let allowing: Settings = indoc! {r#"
        RepositoryPath = "repo"
        AllowDeletions = true

        [Hosts.host1]
        Hostname = "10.0.0.1"
    "#}
    .parse()?;
    let repository = ConfigRepository::open("repo")?;
    let actions = repository.changed_actions(removal, &reader_policy(&allowing))?;
    let plan = assemble(&allowing, &repository, removal, actions, &[])?;
   pretty_assertions::assert_eq!(plan.hosts["host1"].files, vec!["host1/etc/motd"]);
   pretty_assertions::assert_eq!(plan.files["host1/etc/motd"].action, FileAction::Delete);

    let denying: Settings = indoc! {r#"
        RepositoryPath = "repo"

        [Hosts.host1]
        Hostname = "10.0.0.1"
    "#}
    .parse()?;
    let actions = repository.changed_actions(removal, &reader_policy(&denying))?;
    let plan = assemble(&denying, &repository, removal, actions, &[])?;
    assert!(plan.is_empty());

    Ok(())
}

#[sealed_test]
fn journal_replay_seeds_hosts_and_actions() -> Result<()> {
    let fixture = GitFixture::new("repo")?;
    let a = framed_file(&plain_header("root:root", 644), "a\n");
    fixture.stage_and_commit("host2/etc/a", &a)?;
    let b = framed_file(&plain_header("root:root", 644), "b\n");
    let commit = fixture.stage_and_commit("host1/etc/b", &b)?;

    let journal = formatdoc! {r#"
        commitid:{commit}
        {{"EndpointName":"host2","Files":["host2/etc/a"],"ErrorMessage":"x"}}
    "#};
    fs::write("failtracker.log", journal)?;

    let settings: Settings = indoc! {r#"
        RepositoryPath = "repo"

        [Hosts.host1]
        Hostname = "10.0.0.1"

        [Hosts.host2]
        Hostname = "10.0.0.2"
    "#}
    .parse()?;
    let repository = ConfigRepository::open("repo")?;

    let replay = FailureJournal::replay("failtracker.log")?;
   pretty_assertions::assert_eq!(replay.commit_id, commit.to_string());

    let commit_id = repository.resolve_commit(Some(&replay.commit_id))?;
    let actions = repository.actions_for_paths(commit_id, replay.files())?;
    let plan = assemble(&settings, &repository, commit_id, actions, &replay.hosts())?;

    // Only the journaled host and file are replayed, host1 stays untouched.
   pretty_assertions::assert_eq!(plan.hosts.len(), 1);
   pretty_assertions::assert_eq!(plan.hosts["host2"].files, vec!["host2/etc/a"]);
   pretty_assertions::assert_eq!(plan.files["host2/etc/a"].action, FileAction::Create);

    Ok(())
}

#[sealed_test]
fn artifact_pointer_loads_local_bytes() -> Result<()> {
    let blob = b"big binary artifact";
    fs::write("blob.bin", blob)?;
    let hash = hash_bytes(blob);

    let fixture = GitFixture::new("repo")?;
    let location = format!("file://{}/blob.bin", std::env::current_dir()?.display());
    let header = formatdoc! {r#"
        {{ "TargetFileOwnerGroup": "root:root",
           "TargetFilePermissions": 600,
           "ExternalContentLocation": "{location}" }}
    "#};
    let pointer = framed_file(header.trim_end(), &format!("{hash}\n"));
    let commit = fixture.stage_and_commit("host1/opt/blob.bin", &pointer)?;

    let settings: Settings = indoc! {r#"
        RepositoryPath = "repo"

        [Hosts.host1]
        Hostname = "10.0.0.1"
    "#}
    .parse()?;
    let repository = ConfigRepository::open("repo")?;
    let actions = repository.changed_actions(commit, &reader_policy(&settings))?;
    let plan = assemble(&settings, &repository, commit, actions, &[])?;

    let info = &plan.files["host1/opt/blob.bin"];
   pretty_assertions::assert_eq!(info.hash.as_deref(), Some(hash.as_str()));
   pretty_assertions::assert_eq!(info.size, blob.len() as u64);
   pretty_assertions::assert_eq!(plan.content[&hash], blob);

    Ok(())
}

#[sealed_test]
fn symlink_entry_resolves_to_remote_target() -> Result<()> {
    let fixture = GitFixture::new("repo")?;
    let real = framed_file(&plain_header("root:root", 644), "real\n");
    fixture.stage_and_commit("host1/etc/app/real.conf", &real)?;
    let commit = fixture.stage_symlink_and_commit("host1/etc/app.conf", "app/real.conf")?;

    let settings: Settings = indoc! {r#"
        RepositoryPath = "repo"

        [Hosts.host1]
        Hostname = "10.0.0.1"
    "#}
    .parse()?;
    let repository = ConfigRepository::open("repo")?;
    let actions = repository.changed_actions(commit, &reader_policy(&settings))?;
    let plan = assemble(&settings, &repository, commit, actions, &[])?;

   pretty_assertions::assert_eq!(
        plan.files["host1/etc/app.conf"].action,
        FileAction::SymlinkCreate { target: "/etc/app/real.conf".into() }
    );

    Ok(())
}
