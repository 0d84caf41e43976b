// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::fs::OpenOptions;
use std::io;
use std::str::FromStr;

use anyhow::Context;
use serde::Deserialize;
use serde::Serialize;
use slog::o;
use slog::Drain;

/// How log records are rendered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Unstructured, human-readable text
    Human,
    /// Bunyan-style json, one record per line
    #[default]
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "human" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("invalid log format: {s}")),
        }
    }
}

// Both formats are pushed through slog_async, so the caller never blocks on
// the underlying writer.
fn build<W>(name: &'static str, format: LogFormat, w: W) -> slog::Logger
where
    W: io::Write + Send + 'static,
{
    match format {
        LogFormat::Human => {
            let decorator = slog_term::PlainDecorator::new(w);
            let drain = slog_term::FullFormat::new(decorator).build().fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            slog::Logger::root(drain, o!("name" => name))
        }
        LogFormat::Json => {
            let drain = slog_bunyan::with_name(name, w).build().fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            slog::Logger::root(drain, o!())
        }
    }
}

/// Build the root logger for a process.  If `log_file` is set, records are
/// appended to that file; otherwise they go to stdout.
pub fn init(
    name: &'static str,
    log_file: &Option<String>,
    format: LogFormat,
) -> anyhow::Result<slog::Logger> {
    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {path}"))?;
            Ok(build(name, format, file))
        }
        None => Ok(build(name, format, io::stdout())),
    }
}
