// SPDX-FileCopyrightText: 2025 cfgpush contributors
// SPDX-License-Identifier: MIT

use cfgpush::cmd::Cfgpush;

use clap::Parser;
use std::process;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cfgpush::parse();
    init_tracing(cli.verbosity);

    let code = match cli.run().await {
        Ok(()) => ExitCode::Success,
        Err(error) => {
            tracing::error!("{error}");
            let mut source = std::error::Error::source(&error);
            while let Some(cause) = source {
                tracing::error!("caused by: {cause}");
                source = cause.source();
            }
            ExitCode::Failure
        }
    }
    .into();

    process::exit(code);
}

// Verbosity 0-5 influences logging only; RUST_LOG wins when set.
fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();
}

#[derive(Debug)]
enum ExitCode {
    Success,
    Failure,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        match code {
            ExitCode::Success => 0,
            ExitCode::Failure => 1,
        }
    }
}
