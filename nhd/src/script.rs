// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Scripted workloads.  The table keeps no state of its own across a
//! restart; its contents are rebuilt by replaying the group operations that
//! created them.  A script is a TOML list of those operations:
//!
//! ```toml
//! [[step]]
//! op = "create_group"
//! name = "web"
//! group_type = "normal_unicast"
//!
//! [[step]]
//! op = "add_next_hops"
//! group = "web"
//! next_hops = [ { mac = "a8:40:25:00:00:01", port = 1 } ]
//! ```
//!
//! Objects are referred to by the names given to them when they were
//! created.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use slog::{debug, warn};

use common::network::MacAddr;

use crate::block::{BlockHandle, BlockOptions, Client};
use crate::defrag::CompactionReport;
use crate::ecmp::{GroupId, GroupType, NextHop, NextHopData};
use crate::table::ArpTable;
use crate::types::{NhdError, NhdResult};

#[derive(Clone, Debug, Deserialize)]
pub struct NextHopSpec {
    pub mac: MacAddr,
    #[serde(default)]
    pub vlan: u16,
    pub port: u16,
}

impl NextHopSpec {
    fn to_next_hop(&self) -> NhdResult<NextHop> {
        Ok(NextHop::Arp(NextHopData::arp(self.mac, self.vlan, self.port)?))
    }
}

#[derive(Clone, Debug, Deserialize, strum::IntoStaticStr)]
#[serde(tag = "op", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Step {
    CreateGroup {
        name: String,
        group_type: GroupType,
    },
    DeleteGroup {
        group: String,
    },
    AddNextHops {
        group: String,
        next_hops: Vec<NextHopSpec>,
    },
    DeleteNextHops {
        group: String,
        next_hops: Vec<NextHopSpec>,
    },
    ReplaceNextHop {
        group: String,
        old: NextHopSpec,
        new: NextHopSpec,
    },
    AddGlort {
        group: String,
        glort: u64,
    },
    MoveMulticastGroup {
        group: String,
    },
    AllocBlock {
        name: String,
        client: Client,
        length: u32,
        #[serde(default)]
        pinned: bool,
    },
    FreeBlock {
        name: String,
    },
    Compact,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Script {
    #[serde(default, rename = "step")]
    pub steps: Vec<Step>,
}

impl Script {
    pub fn load(path: impl AsRef<Path>) -> NhdResult<Script> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            NhdError::Config(format!("reading {}: {e}", path.display()))
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> NhdResult<Script> {
        Ok(toml::from_str(contents)?)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StepFailure {
    pub step: usize,
    pub op: &'static str,
    pub error: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ReplayReport {
    pub steps: usize,
    pub failures: Vec<StepFailure>,
    pub compactions: Vec<CompactionReport>,
}

#[derive(Default)]
struct Names {
    groups: BTreeMap<String, GroupId>,
    blocks: BTreeMap<String, (BlockHandle, Client)>,
}

impl Names {
    fn group(&self, name: &str) -> NhdResult<GroupId> {
        self.groups
            .get(name)
            .copied()
            .ok_or_else(|| NhdError::Missing(format!("no group named {name}")))
    }

    fn block(&self, name: &str) -> NhdResult<(BlockHandle, Client)> {
        self.blocks
            .get(name)
            .copied()
            .ok_or_else(|| NhdError::Missing(format!("no block named {name}")))
    }
}

fn hops(specs: &[NextHopSpec]) -> NhdResult<Vec<NextHop>> {
    specs.iter().map(NextHopSpec::to_next_hop).collect()
}

fn run_step(
    table: &ArpTable,
    names: &mut Names,
    report: &mut ReplayReport,
    step: &Step,
) -> NhdResult<()> {
    match step {
        Step::CreateGroup { name, group_type } => {
            if names.groups.contains_key(name) {
                return Err(NhdError::Exists(format!("group {name}")));
            }
            let id = table.create_group(*group_type)?;
            names.groups.insert(name.clone(), id);
        }
        Step::DeleteGroup { group } => {
            table.delete_group(names.group(group)?)?;
            names.groups.remove(group);
        }
        Step::AddNextHops { group, next_hops } => {
            table.add_next_hops(names.group(group)?, &hops(next_hops)?)?;
        }
        Step::DeleteNextHops { group, next_hops } => {
            table.delete_next_hops(names.group(group)?, &hops(next_hops)?)?;
        }
        Step::ReplaceNextHop { group, old, new } => {
            table.replace_next_hop(
                names.group(group)?,
                &old.to_next_hop()?,
                &new.to_next_hop()?,
            )?;
        }
        Step::AddGlort { group, glort } => {
            let hop = NextHop::Glort(*glort);
            table.add_next_hops(names.group(group)?, &[hop])?;
        }
        Step::MoveMulticastGroup { group } => {
            table.move_multicast_group(names.group(group)?)?;
        }
        Step::AllocBlock {
            name,
            client,
            length,
            pinned,
        } => {
            if names.blocks.contains_key(name) {
                return Err(NhdError::Exists(format!("block {name}")));
            }
            let options = if *pinned {
                BlockOptions::DO_NOT_MOVE
            } else {
                BlockOptions::NONE
            };
            let handle = table.alloc_block(*client, *length, options, 0)?;
            names.blocks.insert(name.clone(), (handle, *client));
        }
        Step::FreeBlock { name } => {
            let (handle, client) = names.block(name)?;
            table.free_block(client, handle)?;
            names.blocks.remove(name);
        }
        Step::Compact => report.compactions.push(table.compact()),
    }
    Ok(())
}

/// Replay every step of `script` against `table`.  A step that fails is
/// recorded in the report and the replay carries on with the next one.
pub fn run(
    log: &slog::Logger,
    table: &ArpTable,
    script: &Script,
) -> ReplayReport {
    let mut names = Names::default();
    let mut report = ReplayReport::default();
    for (idx, step) in script.steps.iter().enumerate() {
        let op: &'static str = step.into();
        report.steps += 1;
        match run_step(table, &mut names, &mut report, step) {
            Ok(()) => debug!(log, "replayed step"; "step" => idx, "op" => op),
            Err(e) => {
                warn!(log, "step failed"; "step" => idx, "op" => op,
                    "error" => %e);
                report.failures.push(StepFailure {
                    step: idx,
                    op,
                    error: e.to_string(),
                });
            }
        }
    }
    report
}
