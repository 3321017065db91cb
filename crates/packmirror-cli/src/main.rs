// PackMirror - Mirror Git Repositories to Object Storage
// Copyright (C) 2025 PackMirror Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published
// by the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.

mod logging;

use anyhow::{bail, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use console::style;
use logging::{init_tracing, LogFormat};
use packmirror_mirror::{mirror_all, MirrorConfig};
use std::io;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "packmirror")]
#[command(version, about = "Mirror git repositories into object storage")]
#[command(
    long_about = "PackMirror downloads a repository over the git smart-HTTP protocol and \
rewrites every object into its loose form in an S3 bucket, so that a standard \
git client can clone the result over plain HTTP."
)]
#[command(propagate_version = true)]
#[command(author = "PackMirror Contributors")]
struct Cli {
    /// Source repository base URL; repeat to mirror several repositories
    #[arg(long, value_name = "URL")]
    source: Vec<String>,

    /// Destination s3://bucket/prefix, paired with --source by position
    #[arg(long, value_name = "S3_URL")]
    target: Vec<String>,

    /// Number of concurrent object workers
    #[arg(long, value_name = "N", default_value_t = 10)]
    object_workers: usize,

    /// Number of concurrent large-file workers
    #[arg(long, value_name = "N", default_value_t = 10)]
    lfs_workers: usize,

    /// Capacity of the pending large-file queue
    #[arg(long, value_name = "N", default_value_t = 10_000)]
    lfs_queue: usize,

    /// Keep-alive interval for the pack download, in seconds
    #[arg(long, value_name = "SECONDS", default_value_t = 1)]
    keepalive_interval: u64,

    /// Timeout for one pack chunk to arrive, in seconds
    #[arg(long, value_name = "SECONDS", default_value_t = 60)]
    chunk_timeout: u64,

    /// How long a delta waits for its base object, in seconds
    #[arg(long, value_name = "SECONDS", default_value_t = 60)]
    base_wait_timeout: u64,

    /// Custom S3 endpoint (MinIO and friends)
    #[arg(long, value_name = "URL")]
    s3_endpoint: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log output format
    #[arg(long, value_enum, default_value = "compact")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    fn pairs(&self) -> Result<Vec<(String, String)>> {
        if self.source.is_empty() {
            bail!("at least one --source/--target pair is required");
        }
        if self.source.len() != self.target.len() {
            bail!(
                "{} --source options but {} --target options; they pair by position",
                self.source.len(),
                self.target.len()
            );
        }
        Ok(self
            .source
            .iter()
            .cloned()
            .zip(self.target.iter().cloned())
            .collect())
    }

    fn config(&self) -> MirrorConfig {
        MirrorConfig {
            object_workers: self.object_workers,
            lfs_workers: self.lfs_workers,
            lfs_queue_capacity: self.lfs_queue,
            keepalive_interval: Duration::from_secs(self.keepalive_interval.max(1)),
            chunk_timeout: Duration::from_secs(self.chunk_timeout.max(1)),
            base_wait_timeout: Duration::from_secs(self.base_wait_timeout.max(1)),
            s3_endpoint: self.s3_endpoint.clone(),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Some(Commands::Completions { shell }) = cli.command {
        generate(shell, &mut Cli::command(), "packmirror", &mut io::stdout());
        return;
    }

    init_tracing(cli.log_format, cli.verbose, cli.quiet);

    if let Err(e) = run(&cli).await {
        eprintln!("{} {e:#}", style("error:").red().bold());
        std::process::exit(1);
    }
}

async fn run(cli: &Cli) -> Result<()> {
    let pairs = cli.pairs()?;
    let summaries = mirror_all(&pairs, &cli.config()).await?;

    if !cli.quiet {
        for summary in &summaries {
            println!(
                "{} {}: {} refs, {} objects ({} from deltas), {} large files, {} failures",
                style("✓").green().bold(),
                style(&summary.source).cyan(),
                summary.refs,
                summary.objects_uploaded,
                summary.deltas_resolved,
                summary.lfs_payloads,
                summary.failures,
            );
        }
    }
    Ok(())
}
