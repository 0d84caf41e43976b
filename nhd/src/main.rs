// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::io::{stdout, Write};
use std::path::PathBuf;

use anyhow::Context;
use colored::Colorize;
use slog::info;
use structopt::StructOpt;
use tabwriter::TabWriter;

use nhd::config::Config;
use nhd::script::{self, ReplayReport, Script};
use nhd::ArpTable;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "nhd",
    about = "ARP / next-hop table manager for the switch ASIC"
)]
struct Opt {
    #[structopt(long, short, help = "TOML configuration file")]
    config: Option<PathBuf>,

    #[structopt(
        long,
        about = "send log data to the named file rather than stdout"
    )]
    log_file: Option<String>,

    #[structopt(
        long,
        short = "l",
        about = "log format",
        help = "format logs for 'human' or 'json' consumption"
    )]
    log_format: Option<common::logging::LogFormat>,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Replay a scripted workload against a fresh table and print the
    /// resulting table state.
    Replay {
        #[structopt(long, help = "print the results as json")]
        json: bool,

        #[structopt(help = "script of table operations to replay")]
        script: PathBuf,
    },
    /// Print the effective configuration.
    DumpConfig,
}

// Settings from the command line take precedence over the config file.
fn build_config(opt: &Opt) -> anyhow::Result<Config> {
    let mut config = match &opt.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(log_file) = &opt.log_file {
        config.log_file = Some(log_file.clone());
    }
    if let Some(log_format) = opt.log_format {
        config.log_format = log_format;
    }
    Ok(config)
}

fn print_report(
    table: &ArpTable,
    report: &ReplayReport,
) -> anyhow::Result<()> {
    let summary = table.summary();
    let mut tw = TabWriter::new(stdout());

    writeln!(tw, "{}\t{}", "Table".underline(), "Value".underline())?;
    writeln!(tw, "size\t{}", summary.size)?;
    writeln!(tw, "reserved\t{}", summary.reserved)?;
    writeln!(tw, "capacity\t{}", summary.capacity)?;
    writeln!(
        tw,
        "used\t{} ({:.1}%)",
        summary.used_entries,
        summary.usage_ratio * 100.0
    )?;
    writeln!(tw, "free extents\t{}", summary.free_extents)?;
    writeln!(tw, "largest free extent\t{}", summary.largest_free_extent)?;
    writeln!(tw, "moves\t{}", summary.moves)?;
    writeln!(tw, "compactions\t{}", summary.compactions)?;
    writeln!(tw)?;

    writeln!(
        tw,
        "{}\t{}\t{}",
        "Size".underline(),
        "Blocks".underline(),
        "Free extents".underline()
    )?;
    for (alloc, free) in
        summary.alloc_histogram.iter().zip(&summary.free_histogram)
    {
        writeln!(tw, "{}\t{}\t{}", alloc.range, alloc.count, free.count)?;
    }
    writeln!(tw)?;

    writeln!(
        tw,
        "{}\t{}\t{}\t{}\t{}",
        "Block".underline(),
        "Offset".underline(),
        "Length".underline(),
        "Options".underline(),
        "Clients".underline()
    )?;
    for b in table.blocks(None) {
        let clients: Vec<String> =
            b.clients.iter().map(|c| c.to_string()).collect();
        writeln!(
            tw,
            "{}\t{}\t{}\t{}\t{}",
            b.handle,
            b.offset,
            b.length,
            b.options,
            clients.join(",")
        )?;
    }
    writeln!(tw)?;

    writeln!(
        tw,
        "{}\t{}\t{}\t{}\t{}",
        "Group".underline(),
        "Type".underline(),
        "Range".underline(),
        "Active".underline(),
        "Paths".underline()
    )?;
    for g in table.groups() {
        let range = match (g.first, g.last) {
            (Some(first), Some(last)) => format!("{first}-{last}"),
            _ => "-".to_string(),
        };
        let paths = match (g.path_count, g.path_count_type) {
            (Some(count), Some(kind)) => format!("{count} ({kind})"),
            _ => "-".to_string(),
        };
        writeln!(
            tw,
            "{}\t{}\t{}\t{}\t{}",
            g.id, g.group_type, range, g.active, paths
        )?;
    }

    if !report.failures.is_empty() {
        writeln!(tw)?;
        writeln!(
            tw,
            "{}\t{}\t{}",
            "Step".underline(),
            "Op".underline(),
            "Error".underline()
        )?;
        for f in &report.failures {
            writeln!(tw, "{}\t{}\t{}", f.step, f.op, f.error.red())?;
        }
    }
    tw.flush()?;
    Ok(())
}

fn replay(config: Config, path: PathBuf, json: bool) -> anyhow::Result<()> {
    let log =
        common::logging::init("nhd", &config.log_file, config.log_format)?;
    let script = Script::load(&path)
        .with_context(|| format!("loading script {}", path.display()))?;
    info!(log, "replaying {} steps", script.steps.len());

    let asic_hdl = asic::Handle::new(&log, &config.asic)
        .context("initializing the asic")?;
    let table = ArpTable::new(&log, asic_hdl, &config)?;
    let report = script::run(&log, &table, &script);
    table.verify().context("table is inconsistent after replay")?;

    if json {
        let out = serde_json::json!({
            "summary": table.summary(),
            "blocks": table.blocks(None),
            "free_extents": table.free_extents(),
            "groups": table.groups(),
            "replay": report,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        print_report(&table, &report)?;
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();
    let config = build_config(&opt)?;

    match opt.cmd {
        Command::Replay { json, script } => replay(config, script, json),
        Command::DumpConfig => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
