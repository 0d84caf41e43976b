// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Delivery of block-move notifications to the subsystems that own or
//! observe a block.
//!
//! Every notification is delivered synchronously, with the table lock held,
//! before the move is considered complete.  Handlers must therefore not call
//! back into the table.  A handler that fails is logged and skipped; the move
//! itself stands.

use serde::Serialize;
use slog::{debug, error};

use crate::block::BlockHandle;
use crate::block::Client;
use crate::ecmp::EcmpEngine;
use crate::ecmp::GroupId;
use crate::types::{NhdError, NhdResult};

/// Where a block is in the course of a relocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MovePhase {
    /// A single-step move straight into free space
    Direct,
    /// The first half of a staged move, parking the block in staging
    Intermediate,
    /// The second half of a staged move, out of staging to its new home
    Final,
    /// A group's rows were migrated to a freshly allocated block
    Realloc,
}

/// A description of one relocation.  The rows at `new_offset` are already
/// valid when this is delivered, and those at `old_offset` are not yet
/// reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BlockMove {
    pub handle: BlockHandle,
    pub old_offset: u32,
    pub new_offset: u32,
    pub length: u32,
    pub opaque: u64,
    pub phase: MovePhase,
}

/// Implemented by each subsystem that needs to know when a block it uses
/// changes address.
pub trait MoveHandler: Send {
    fn block_moved(&mut self, mv: &BlockMove) -> anyhow::Result<()>;

    /// Called for subsystems bound to an ECMP group, rather than to the
    /// group's block directly.
    fn group_moved(
        &mut self,
        _group: GroupId,
        mv: &BlockMove,
    ) -> anyhow::Result<()> {
        self.block_moved(mv)
    }
}

pub struct Notifier {
    log: slog::Logger,
    lbg: Option<Box<dyn MoveHandler>>,
    vn: Option<Box<dyn MoveHandler>>,
    acl: Option<Box<dyn MoveHandler>>,
    delivered: u64,
    failed: u64,
}

impl Notifier {
    pub fn new(log: &slog::Logger) -> Self {
        Notifier {
            log: log.new(slog::o!("unit" => "notify")),
            lbg: None,
            vn: None,
            acl: None,
            delivered: 0,
            failed: 0,
        }
    }

    // ECMP is served in-process by the group engine, so it never gets an
    // external handler slot.
    fn slot(
        &mut self,
        client: Client,
    ) -> Option<&mut Option<Box<dyn MoveHandler>>> {
        match client {
            Client::Lbg => Some(&mut self.lbg),
            Client::Vn => Some(&mut self.vn),
            Client::Acl => Some(&mut self.acl),
            Client::Ecmp | Client::None => None,
        }
    }

    pub fn set_handler(
        &mut self,
        client: Client,
        handler: Box<dyn MoveHandler>,
    ) -> NhdResult<()> {
        let slot = self.slot(client).ok_or_else(|| {
            NhdError::InvalidArgument(format!(
                "client {client} does not take move handlers"
            ))
        })?;
        *slot = Some(handler);
        debug!(self.log, "installed move handler"; "client" => %client);
        Ok(())
    }

    pub fn clear_handler(&mut self, client: Client) -> NhdResult<()> {
        match self.slot(client) {
            Some(slot) => {
                *slot = None;
                Ok(())
            }
            None => Err(NhdError::InvalidArgument(format!(
                "client {client} does not take move handlers"
            ))),
        }
    }

    pub fn has_handler(&self, client: Client) -> bool {
        match client {
            Client::Lbg => self.lbg.is_some(),
            Client::Vn => self.vn.is_some(),
            Client::Acl => self.acl.is_some(),
            Client::Ecmp | Client::None => false,
        }
    }

    fn record(&mut self, client: Client, result: anyhow::Result<()>) {
        match result {
            Ok(()) => self.delivered += 1,
            Err(e) => {
                self.failed += 1;
                error!(self.log, "move handler failed";
                    "client" => %client, "error" => %e);
            }
        }
    }

    /// Tell `client` that a block it is bound to has moved.
    pub fn deliver(&mut self, client: Client, mv: &BlockMove) {
        let result = match self.slot(client) {
            Some(Some(handler)) => handler.block_moved(mv),
            _ => return,
        };
        self.record(client, result);
    }

    /// Tell `client` that the block backing `group` has moved.
    pub fn deliver_group(
        &mut self,
        client: Client,
        group: GroupId,
        mv: &BlockMove,
    ) {
        let result = match self.slot(client) {
            Some(Some(handler)) => handler.group_moved(group, mv),
            _ => return,
        };
        self.record(client, result);
    }

    /// Fan a move out to every client bound to the block, in binding order.
    /// The ECMP engine updates its own bookkeeping and then names the
    /// clients bound to the affected group, who are told in turn.
    pub fn dispatch(
        &mut self,
        ecmp: &mut EcmpEngine,
        asic_hdl: &asic::Handle,
        clients: &[Client],
        mv: &BlockMove,
    ) {
        debug!(self.log, "block moved";
            "handle" => %mv.handle,
            "old" => mv.old_offset,
            "new" => mv.new_offset,
            "phase" => %mv.phase);
        for client in clients {
            match client {
                Client::Ecmp => {
                    if let Some((group, observers)) =
                        ecmp.block_moved(asic_hdl, mv)
                    {
                        for observer in observers {
                            self.deliver_group(observer, group, mv);
                        }
                    }
                }
                Client::None => {}
                other => self.deliver(*other, mv),
            }
        }
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }
}
