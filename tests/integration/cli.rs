// SPDX-FileCopyrightText: 2025 cfgpush contributors
// SPDX-License-Identifier: MIT

use crate::{framed_file, plain_header, GitFixture};

use anyhow::Result;
use assert_cmd::Command;
use indoc::indoc;
use sealed_test::prelude::*;
use std::fs;

#[sealed_test]
fn dry_run_deploy_changes_reports_plan() -> Result<()> {
    let fixture = GitFixture::new("repo")?;
    let motd = framed_file(&plain_header("root:root", 644), "hello\n");
    fixture.stage_and_commit("host1/etc/motd", &motd)?;

    fs::write(
        "settings.toml",
        indoc! {r#"
            RepositoryPath = "repo"

            [Hosts.host1]
            Hostname = "10.0.0.1"
        "#},
    )?;

    Command::cargo_bin("cfgpush")?
        .args(["-s", "settings.toml", "-v", "3", "deploy-changes", "--dry-run"])
        .assert()
        .success();

    Ok(())
}

#[sealed_test]
fn deploy_failures_without_journal_is_fatal() -> Result<()> {
    let fixture = GitFixture::new("repo")?;
    let motd = framed_file(&plain_header("root:root", 644), "hello\n");
    fixture.stage_and_commit("host1/etc/motd", &motd)?;

    fs::write(
        "settings.toml",
        indoc! {r#"
            RepositoryPath = "repo"

            [Hosts.host1]
            Hostname = "10.0.0.1"
        "#},
    )?;

    Command::cargo_bin("cfgpush")?
        .args(["-s", "settings.toml", "deploy-failures"])
        .assert()
        .failure();

    Ok(())
}

#[sealed_test]
fn missing_settings_file_is_fatal() {
    Command::cargo_bin("cfgpush")
        .unwrap()
        .args(["-s", "nonexistent.toml", "deploy-all"])
        .assert()
        .failure();
}
