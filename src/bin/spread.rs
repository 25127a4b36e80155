// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use spread::{
    config::RunSettings,
    path::{default_settings_path, expand},
    push::{Interrupt, PushOrchestrator},
    remote::ssh::Ssh2Transport,
};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::MultiProgress;
use std::{path::PathBuf, process::exit, sync::Arc};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "spread [options] <spread-command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to settings file.
    #[arg(short, long, global = true, value_name = "path")]
    pub settings: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    async fn run(self) -> Result<()> {
        let path = match self.settings {
            Some(path) => expand(path)?,
            None => default_settings_path()?,
        };
        let settings = RunSettings::load(&path)
            .with_context(|| format!("failed to load settings from {:?}", path.display()))?;

        match self.command {
            Command::Push(opts) => run_push(settings, opts).await,
            Command::List => run_list(&settings),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Push configuration file to servers.
    #[command(override_usage = "spread push [options] [<server>]...")]
    Push(PushOptions),

    /// List configured servers.
    #[command(override_usage = "spread list [options]")]
    List,
}

#[derive(Args, Clone, Debug)]
struct PushOptions {
    /// Servers to push to, every configured server if none given.
    #[arg(value_name = "server")]
    pub servers: Vec<String>,

    /// Local configuration file overriding the settings file.
    #[arg(short, long, value_name = "path")]
    pub config: Option<PathBuf>,

    /// Hook variant to run instead of the plain hook scripts.
    #[arg(short, long, value_name = "name")]
    pub variant: Option<String>,
}

#[tokio::main]
async fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run().await {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

async fn run() -> Result<()> {
    Cli::parse().run().await
}

async fn run_push(settings: RunSettings, opts: PushOptions) -> Result<()> {
    let content = opts.config.map(expand).transpose()?;
    let transport = Ssh2Transport::new(settings.timeout());
    let orchestrator =
        PushOrchestrator::new(transport, Arc::new(settings)).with_progress(MultiProgress::new());

    let cancel = orchestrator.cancel_handle();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            match cancel.interrupt() {
                Interrupt::Cancel => {
                    warn!("interrupted, finishing in-flight servers only (interrupt again to abort)");
                }
                Interrupt::Abort => {
                    error!("interrupted again, aborting");
                    exit(130);
                }
            }
        }
    });

    let report = orchestrator
        .run(&opts.servers, content.as_deref(), opts.variant.as_deref())
        .await?;

    for line in report.to_string().lines() {
        info!("{line}");
    }

    if !report.is_success() {
        bail!(
            "push incomplete: {} failed, {} skipped",
            report.failed().len(),
            report.skipped().len()
        );
    }

    Ok(())
}

fn run_list(settings: &RunSettings) -> Result<()> {
    if settings.servers.is_empty() {
        warn!("no servers configured");
        return Ok(());
    }

    for profile in settings.servers.values() {
        let destination = settings
            .destination_for(profile)
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<no target path>".into());
        let mut methods = Vec::new();
        if profile.private_key_path.is_some() {
            methods.push("key");
        }
        if profile.password.is_some() {
            methods.push("password");
        }

        info!(
            "{}: {} -> {destination} [{}]",
            profile.name,
            profile.endpoint(),
            methods.join(", ")
        );
    }

    Ok(())
}
