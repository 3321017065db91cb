// SPDX-License-Identifier: AGPL-3.0
// Copyright (C) 2025 PackMirror Contributors

//! Tracing subscriber setup for the CLI.
//!
//! `RUST_LOG` wins when set; otherwise the verbosity flags pick the default
//! level. The format mirrors what the flags advertise: human-oriented
//! pretty/compact output, or JSON for log shippers.

use clap::ValueEnum;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Log output format selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Multi-line human-readable output
    Pretty,
    /// Single-line output
    Compact,
    /// JSON lines
    Json,
}

/// Initialize the global tracing subscriber.
pub fn init_tracing(format: LogFormat, verbose: bool, quiet: bool) {
    let default_level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).init(),
        LogFormat::Compact => registry.with(fmt::layer().compact()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}
