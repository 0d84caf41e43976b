// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The ECMP group engine.
//!
//! A group's next hops live in a single table block, owned by the `Ecmp`
//! client.  Slots `[0, active)` hold the active next hops in insertion order,
//! and any remaining slots in the block are padded with cyclic copies of the
//! active entries so that the hardware hash never lands on an empty row.
//!
//! When a group outgrows its block, a new block is allocated, the rows are
//! migrated, and only then is the group switched over and the old block
//! released.  At no point does the hardware see a partially populated group.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use slog::{debug, error, info, warn};

use aal::{McTarget, RegisterOps, ReplicationOps};
use common::network::{validate_vlan, MacAddr};

use crate::block::{BlockHandle, BlockOptions, Client};
use crate::config::EcmpConfig;
use crate::notify::{BlockMove, MovePhase};
use crate::table::TableState;
use crate::types::{NhdError, NhdResult};

/// Width of a next-hop payload, in 32-bit words.
pub const NEXTHOP_WORDS: usize = 4;

/// The most subsystems that may follow a single group.
pub const MAX_GROUP_CLIENTS: usize = 2;

const NEXTHOP_VALID: u32 = 0x8000_0000;

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ecmp{}", self.0)
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum GroupType {
    Undefined,
    NormalUnicast,
    DropMulticast,
    NormalMulticast,
    MulticastOfMulticast,
}

impl GroupType {
    /// Does this group keep an entry in the replication table?
    pub fn is_multicast(self) -> bool {
        matches!(
            self,
            GroupType::NormalMulticast | GroupType::MulticastOfMulticast
        )
    }
}

/// Raw next-hop row contents.  The engine never interprets these words.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct NextHopData(pub [u32; NEXTHOP_WORDS]);

impl NextHopData {
    /// Build an ARP rewrite row.  A `vlan` of 0 leaves the packet untagged.
    pub fn arp(mac: MacAddr, vlan: u16, port: u16) -> NhdResult<Self> {
        if vlan != 0 {
            validate_vlan(vlan)?;
        }
        let mac: u64 = mac.into();
        Ok(NextHopData([
            ((vlan as u32) << 16) | ((mac >> 32) as u32 & 0xffff),
            mac as u32,
            NEXTHOP_VALID | port as u32,
            0,
        ]))
    }

    pub fn mac(&self) -> MacAddr {
        MacAddr::from(((self.0[0] as u64 & 0xffff) << 32) | self.0[1] as u64)
    }

    pub fn vlan(&self) -> u16 {
        (self.0[0] >> 16) as u16
    }

    pub fn port(&self) -> u16 {
        self.0[2] as u16
    }
}

impl fmt::Display for NextHopData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.0[2] & NEXTHOP_VALID != 0 {
            write!(
                f,
                "{} vlan {} port {}",
                self.mac(),
                self.vlan(),
                self.port()
            )
        } else {
            let w = &self.0;
            write!(f, "{:08x}:{:08x}:{:08x}:{:08x}", w[0], w[1], w[2], w[3])
        }
    }
}

/// A single path in a group: either a row in the table, or a glort that
/// multicast flood groups carry inline instead of a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NextHop {
    Arp(NextHopData),
    Glort(u64),
}

/// One populated row of a group's block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct NextHopEntry {
    pub group: GroupId,
    pub block: BlockHandle,
    pub slot: u32,
    pub data: NextHopData,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PathCountType {
    PowerOfTwo,
    Arbitrary,
}

/// Hash-selection parameters for a block of `len` rows.  A power-of-two
/// length is selected by masking `log2(len)` hash bits; anything else needs
/// the full count as a divisor.
pub fn path_count_parameters(len: u32) -> (u32, PathCountType) {
    if len.is_power_of_two() {
        (len.trailing_zeros(), PathCountType::PowerOfTwo)
    } else {
        (len, PathCountType::Arbitrary)
    }
}

/// What get_used() should look at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsedTarget {
    Group(GroupId),
    Index(u32),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EcmpGroupInfo {
    pub id: GroupId,
    pub group_type: GroupType,
    pub block: Option<BlockHandle>,
    pub index_range: Option<(u32, u32)>,
    pub block_length: u32,
    pub active_count: u32,
    pub path_count: Option<(u32, PathCountType)>,
    pub glort: Option<u64>,
    pub clients: Vec<Client>,
    pub mc_dest: Option<u32>,
}

pub(crate) struct EcmpGroup {
    id: GroupId,
    group_type: GroupType,
    block: Option<BlockHandle>,
    // Current offset and length of the block; meaningless without one.
    base: u32,
    length: u32,
    entries: Vec<NextHopData>,
    glort: Option<u64>,
    glort_count: u32,
    clients: Vec<Client>,
    mc_dest: Option<u32>,
}

impl EcmpGroup {
    fn new(id: GroupId, group_type: GroupType) -> Self {
        EcmpGroup {
            id,
            group_type,
            block: None,
            base: 0,
            length: 0,
            entries: Vec::new(),
            glort: None,
            glort_count: 0,
            clients: Vec::new(),
            mc_dest: None,
        }
    }

    pub(crate) fn block(&self) -> Option<BlockHandle> {
        self.block
    }

    pub(crate) fn base(&self) -> u32 {
        self.base
    }

    pub(crate) fn length(&self) -> u32 {
        self.length
    }

    pub(crate) fn active_count(&self) -> u32 {
        self.entries.len() as u32 + self.glort_count
    }

    fn index_range(&self) -> Option<(u32, u32)> {
        self.block.map(|_| (self.base, self.base + self.length - 1))
    }

    // Where this group's replication entry should point, if it needs one
    fn mc_target(&self) -> Option<McTarget> {
        if !self.group_type.is_multicast() {
            None
        } else if self.block.is_some() {
            Some(McTarget::Index {
                base: self.base,
                count: self.length,
            })
        } else {
            self.glort.map(McTarget::Glort)
        }
    }

    fn info(&self) -> EcmpGroupInfo {
        EcmpGroupInfo {
            id: self.id,
            group_type: self.group_type,
            block: self.block,
            index_range: self.index_range(),
            block_length: self.length,
            active_count: self.active_count(),
            path_count: self.block.map(|_| path_count_parameters(self.length)),
            glort: self.glort,
            clients: self.clients.clone(),
            mc_dest: self.mc_dest,
        }
    }

    // Point the replication table at the group's current location.  A new
    // entry is reserved before the old one is given back, so replicated
    // traffic always has somewhere live to go.
    fn sync_replication(
        &mut self,
        log: &slog::Logger,
        asic_hdl: &asic::Handle,
    ) -> NhdResult<()> {
        let new = match self.mc_target() {
            Some(target) => Some(asic_hdl.mc_entry_reserve(self.id.0, target)?),
            None => None,
        };
        self.replace_replication(log, asic_hdl, new);
        Ok(())
    }

    // Adopt `new` as the group's replication entry and give back the one it
    // held before.
    fn replace_replication(
        &mut self,
        log: &slog::Logger,
        asic_hdl: &asic::Handle,
        new: Option<u32>,
    ) {
        let old = std::mem::replace(&mut self.mc_dest, new);
        if let Some(old) = old {
            if let Err(e) = asic_hdl.mc_entry_free(old) {
                error!(log, "failed to release replication entry";
                    "group" => %self.id, "dest" => old, "error" => %e);
            }
        }
        debug!(log, "synced replication entry";
            "group" => %self.id, "old" => ?old, "new" => ?new);
    }
}

pub struct EcmpEngine {
    log: slog::Logger,
    config: EcmpConfig,
    next_id: u32,
    groups: BTreeMap<GroupId, EcmpGroup>,
}

impl EcmpEngine {
    pub fn new(log: &slog::Logger, config: &EcmpConfig) -> Self {
        EcmpEngine {
            log: log.new(slog::o!("unit" => "ecmp")),
            config: config.clone(),
            next_id: 1,
            groups: BTreeMap::new(),
        }
    }

    fn group(&self, id: GroupId) -> NhdResult<&EcmpGroup> {
        self.groups
            .get(&id)
            .ok_or_else(|| NhdError::Missing(format!("no such group: {id}")))
    }

    fn group_mut(&mut self, id: GroupId) -> NhdResult<&mut EcmpGroup> {
        self.groups
            .get_mut(&id)
            .ok_or_else(|| NhdError::Missing(format!("no such group: {id}")))
    }

    pub(crate) fn groups(&self) -> impl Iterator<Item = &EcmpGroup> {
        self.groups.values()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.groups.clear();
    }

    /// Bring the engine's view of a block up to date after it has been
    /// relocated.  Returns the group that owns the block along with the
    /// subsystems following it, so they can be told in turn.
    pub(crate) fn block_moved(
        &mut self,
        asic_hdl: &asic::Handle,
        mv: &BlockMove,
    ) -> Option<(GroupId, Vec<Client>)> {
        let log = self.log.clone();
        // A group block's opaque value is the id of the group it backs
        let Some(group) = u32::try_from(mv.opaque)
            .ok()
            .and_then(|id| self.groups.get_mut(&GroupId(id)))
            .filter(|g| g.block == Some(mv.handle))
        else {
            // The block was just allocated and is not yet attached to its
            // group, or the group has already let go of it.
            debug!(log, "ignoring move of unattached block";
                "handle" => %mv.handle);
            return None;
        };
        group.base = mv.new_offset;
        if let Err(e) = group.sync_replication(&log, asic_hdl) {
            error!(log, "failed to move replication entry";
                "group" => %group.id, "error" => %e);
        }
        Some((group.id, group.clients.clone()))
    }
}

// Group operations span the engine, the allocator, and the hardware, so they
// are implemented against the table's state as a whole.
impl TableState {
    fn write_row(
        &self,
        asic_hdl: &asic::Handle,
        slot: u32,
        data: &NextHopData,
    ) -> NhdResult<()> {
        let mut row = vec![0u32; self.geometry.entry_words as usize];
        row[..NEXTHOP_WORDS].copy_from_slice(&data.0);
        asic_hdl.write_words(self.geometry.row_addr(slot), &row)?;
        Ok(())
    }

    fn clear_rows(&self, asic_hdl: &asic::Handle, base: u32, count: u32) {
        let row = vec![0u32; self.geometry.entry_words as usize];
        for slot in base..base + count {
            let addr = self.geometry.row_addr(slot);
            if let Err(e) = asic_hdl.write_words(addr, &row) {
                warn!(self.log, "failed to clear row"; "slot" => slot,
                    "error" => %e);
            }
        }
    }

    // Write `entries` to the block at `base`, padding the rest of the block
    // with cyclic copies of them.
    fn fill_block(
        &self,
        asic_hdl: &asic::Handle,
        base: u32,
        length: u32,
        entries: &[NextHopData],
        first: usize,
    ) -> NhdResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        for idx in first..length as usize {
            let data = &entries[idx % entries.len()];
            self.write_row(asic_hdl, base + idx as u32, data)?;
        }
        Ok(())
    }

    pub(crate) fn create_group(
        &mut self,
        group_type: GroupType,
    ) -> NhdResult<GroupId> {
        if group_type == GroupType::Undefined {
            return Err(NhdError::InvalidArgument(
                "a group must have a defined type".into(),
            ));
        }
        let id = GroupId(self.ecmp.next_id);
        self.ecmp.next_id += 1;
        self.ecmp.groups.insert(id, EcmpGroup::new(id, group_type));
        info!(self.ecmp.log, "created group";
            "group" => %id, "type" => %group_type);
        Ok(id)
    }

    pub(crate) fn delete_group(
        &mut self,
        asic_hdl: &asic::Handle,
        id: GroupId,
    ) -> NhdResult<()> {
        let group = self.ecmp.group(id)?;
        if group.active_count() > 0 {
            return Err(NhdError::Busy(format!(
                "group {id} still has {} next hops",
                group.active_count()
            )));
        }
        let mut group = self.ecmp.groups.remove(&id).ok_or_else(|| {
            NhdError::Missing(format!("no such group: {id}"))
        })?;
        // An empty group never holds a block.  It may still have a stale
        // replication entry if a previous release failed.
        if let Some(dest) = group.mc_dest.take() {
            if let Err(e) = asic_hdl.mc_entry_free(dest) {
                error!(self.ecmp.log, "failed to release replication entry";
                    "group" => %id, "dest" => dest, "error" => %e);
            }
        }
        info!(self.ecmp.log, "deleted group"; "group" => %id,
            "clients" => ?group.clients);
        Ok(())
    }

    pub(crate) fn add_next_hops(
        &mut self,
        asic_hdl: &asic::Handle,
        id: GroupId,
        hops: &[NextHop],
    ) -> NhdResult<()> {
        let group = self.ecmp.group(id)?;
        if hops.is_empty() {
            return Err(NhdError::InvalidArgument("no next hops given".into()));
        }
        if group.group_type == GroupType::DropMulticast {
            return Err(NhdError::InvalidArgument(format!(
                "group {id} drops all traffic and takes no next hops"
            )));
        }

        let glorts: Vec<u64> = hops
            .iter()
            .filter_map(|h| match h {
                NextHop::Glort(g) => Some(*g),
                NextHop::Arp(_) => None,
            })
            .collect();
        if glorts.is_empty() {
            let data: Vec<NextHopData> = hops
                .iter()
                .filter_map(|h| match h {
                    NextHop::Arp(d) => Some(*d),
                    NextHop::Glort(_) => None,
                })
                .collect();
            self.add_arp_next_hops(asic_hdl, id, &data)
        } else if glorts.len() == hops.len() {
            self.add_glort_next_hops(asic_hdl, id, &glorts)
        } else {
            Err(NhdError::InvalidArgument(
                "cannot mix glort and table next hops".into(),
            ))
        }
    }

    fn add_glort_next_hops(
        &mut self,
        asic_hdl: &asic::Handle,
        id: GroupId,
        glorts: &[u64],
    ) -> NhdResult<()> {
        let log = self.ecmp.log.clone();
        let group = self.ecmp.group_mut(id)?;
        if !group.group_type.is_multicast() {
            return Err(NhdError::InvalidArgument(format!(
                "only multicast groups take glort next hops, not {}",
                group.group_type
            )));
        }
        if group.block.is_some() {
            return Err(NhdError::InvalidArgument(format!(
                "group {id} already has table next hops"
            )));
        }
        let glort = glorts[0];
        if glorts.iter().any(|g| *g != glort)
            || group.glort.is_some_and(|g| g != glort)
        {
            return Err(NhdError::InvalidArgument(format!(
                "group {id} can only carry a single glort override"
            )));
        }

        let first = group.glort.is_none();
        group.glort = Some(glort);
        group.glort_count += glorts.len() as u32;
        if first {
            if let Err(e) = group.sync_replication(&log, asic_hdl) {
                group.glort = None;
                group.glort_count = 0;
                return Err(e);
            }
        }
        debug!(log, "folded glort next hops"; "group" => %id,
            "glort" => glort, "count" => group.glort_count);
        Ok(())
    }

    fn add_arp_next_hops(
        &mut self,
        asic_hdl: &asic::Handle,
        id: GroupId,
        data: &[NextHopData],
    ) -> NhdResult<()> {
        let group = self.ecmp.group(id)?;
        if group.glort.is_some() {
            return Err(NhdError::InvalidArgument(format!(
                "group {id} carries a glort override"
            )));
        }
        let active = group.entries.len();
        let needed = (active + data.len()) as u32;

        // Room in the current block: write the new rows in place and repad.
        if group.block.is_some() && needed <= group.length {
            let (base, length) = (group.base, group.length);
            let mut entries = group.entries.clone();
            entries.extend_from_slice(data);
            self.fill_block(asic_hdl, base, length, &entries, active)?;
            self.ecmp.group_mut(id)?.entries = entries;
            debug!(self.ecmp.log, "added next hops in place";
                "group" => %id, "active" => needed);
            return Ok(());
        }

        let new_len = self.ecmp.config.block_length(needed);
        let new_hdl = self.request_block(
            asic_hdl,
            Client::Ecmp,
            new_len,
            BlockOptions::NONE,
            id.0 as u64,
        )?;
        // The allocation may have compacted the table, moving both the old
        // block and the new one, so every offset is looked up afresh.
        let new_base = self.blocks.get(new_hdl)?.offset;
        let group = self.ecmp.group(id)?;
        let old = group.block.map(|h| (h, group.base, group.length));
        let mut entries = group.entries.clone();
        entries.extend_from_slice(data);

        // The replication entry for the new location is reserved before the
        // group switches over; the old one stays live until then.
        let multicast = group.group_type.is_multicast();
        let prepare = |state: &TableState| -> NhdResult<Option<u32>> {
            if let Some((_, old_base, _)) = old {
                state.copy_rows(asic_hdl, old_base, new_base, active as u32)?;
            }
            state.fill_block(asic_hdl, new_base, new_len, &entries, active)?;
            if !multicast {
                return Ok(None);
            }
            let target = McTarget::Index {
                base: new_base,
                count: new_len,
            };
            Ok(Some(asic_hdl.mc_entry_reserve(id.0, target)?))
        };
        let mc_dest = match prepare(self) {
            Ok(dest) => dest,
            Err(e) => {
                error!(self.ecmp.log, "failed to prepare new block";
                    "group" => %id, "error" => %e);
                self.clear_rows(asic_hdl, new_base, new_len);
                self.release_block(Client::Ecmp, new_hdl)?;
                return Err(e);
            }
        };

        let log = self.ecmp.log.clone();
        let group = self.ecmp.group_mut(id)?;
        group.block = Some(new_hdl);
        group.base = new_base;
        group.length = new_len;
        group.entries = entries;
        group.replace_replication(&log, asic_hdl, mc_dest);
        let clients = group.clients.clone();
        info!(log, "group moved to new block";
            "group" => %id, "block" => %new_hdl,
            "base" => new_base, "length" => new_len);

        if let Some((old_hdl, old_base, old_len)) = old {
            let mv = BlockMove {
                handle: new_hdl,
                old_offset: old_base,
                new_offset: new_base,
                length: new_len,
                opaque: id.0 as u64,
                phase: MovePhase::Realloc,
            };
            for client in clients {
                self.notifier.deliver_group(client, id, &mv);
            }
            // Anyone watching the old block follows the group to the new one
            for observer in self.detach_observers(old_hdl)? {
                self.blocks.register_client(new_hdl, observer)?;
                self.notifier.deliver(observer, &mv);
            }
            if self.release_block(Client::Ecmp, old_hdl)? {
                self.clear_rows(asic_hdl, old_base, old_len);
            }
        }
        Ok(())
    }

    // Unbind every client but the engine from a group block, returning them
    // in binding order.
    fn detach_observers(
        &mut self,
        handle: BlockHandle,
    ) -> NhdResult<Vec<Client>> {
        let observers: Vec<Client> = self
            .blocks
            .get(handle)?
            .clients()
            .iter()
            .copied()
            .filter(|c| *c != Client::Ecmp)
            .collect();
        for observer in &observers {
            self.blocks.unregister_client(handle, *observer)?;
        }
        Ok(observers)
    }

    pub(crate) fn delete_next_hops(
        &mut self,
        asic_hdl: &asic::Handle,
        id: GroupId,
        hops: &[NextHop],
    ) -> NhdResult<()> {
        let group = self.ecmp.group(id)?;
        if hops.is_empty() {
            return Err(NhdError::InvalidArgument("no next hops given".into()));
        }

        // Validate the whole request before touching anything.
        let mut survivors = group.entries.clone();
        let mut glorts_removed = 0;
        for hop in hops {
            match hop {
                NextHop::Arp(data) => {
                    let Some(idx) = survivors.iter().position(|e| e == data)
                    else {
                        return Err(NhdError::Missing(format!(
                            "group {id} has no next hop {data}"
                        )));
                    };
                    survivors.remove(idx);
                }
                NextHop::Glort(g) => {
                    if group.glort != Some(*g)
                        || glorts_removed >= group.glort_count
                    {
                        return Err(NhdError::Missing(format!(
                            "group {id} has no glort next hop {g:#x}"
                        )));
                    }
                    glorts_removed += 1;
                }
            }
        }

        let log = self.ecmp.log.clone();
        if glorts_removed > 0 {
            let group = self.ecmp.group_mut(id)?;
            group.glort_count -= glorts_removed;
            if group.glort_count == 0 {
                group.glort = None;
                group.sync_replication(&log, asic_hdl)?;
            }
        }

        let group = self.ecmp.group(id)?;
        let Some(block) = group.block else {
            return Ok(());
        };
        if survivors.len() == group.entries.len() {
            return Ok(());
        }
        let (base, length) = (group.base, group.length);

        if survivors.is_empty() {
            let group = self.ecmp.group_mut(id)?;
            group.entries.clear();
            group.block = None;
            group.base = 0;
            group.length = 0;
            group.sync_replication(&log, asic_hdl)?;
            let observers = self.detach_observers(block)?;
            if !observers.is_empty() {
                debug!(log, "group emptied; dropped block observers";
                    "group" => %id, "observers" => ?observers);
            }
            if self.release_block(Client::Ecmp, block)? {
                self.clear_rows(asic_hdl, base, length);
            }
            debug!(log, "last next hop removed; released block";
                "group" => %id, "block" => %block);
        } else {
            self.fill_block(asic_hdl, base, length, &survivors, 0)?;
            let active = survivors.len();
            self.ecmp.group_mut(id)?.entries = survivors;
            debug!(log, "removed next hops"; "group" => %id,
                "active" => active);
        }
        Ok(())
    }

    pub(crate) fn replace_next_hop(
        &mut self,
        asic_hdl: &asic::Handle,
        id: GroupId,
        old: &NextHop,
        new: &NextHop,
    ) -> NhdResult<()> {
        let log = self.ecmp.log.clone();
        let group = self.ecmp.group(id)?;
        match (old, new) {
            (NextHop::Arp(old), NextHop::Arp(new)) => {
                let Some(slot) = group.entries.iter().position(|e| e == old)
                else {
                    return Err(NhdError::Missing(format!(
                        "group {id} has no next hop {old}"
                    )));
                };
                let mut entries = group.entries.clone();
                entries[slot] = *new;
                // Rewriting the padding also refreshes any copies of the
                // replaced entry.
                self.fill_block(
                    asic_hdl,
                    group.base,
                    group.length,
                    &entries,
                    slot,
                )?;
                self.ecmp.group_mut(id)?.entries = entries;
                debug!(log, "replaced next hop"; "group" => %id,
                    "slot" => slot);
                Ok(())
            }
            (NextHop::Glort(old), NextHop::Glort(new)) => {
                if group.glort != Some(*old) {
                    return Err(NhdError::Missing(format!(
                        "group {id} has no glort next hop {old:#x}"
                    )));
                }
                let group = self.ecmp.group_mut(id)?;
                group.glort = Some(*new);
                if let Err(e) = group.sync_replication(&log, asic_hdl) {
                    group.glort = Some(*old);
                    return Err(e);
                }
                Ok(())
            }
            _ => Err(NhdError::InvalidArgument(
                "cannot replace a glort with a table next hop".into(),
            )),
        }
    }

    pub(crate) fn set_next_hops(
        &mut self,
        asic_hdl: &asic::Handle,
        id: GroupId,
        first: u32,
        data: &[NextHopData],
    ) -> NhdResult<()> {
        let group = self.ecmp.group(id)?;
        if group.block.is_none() {
            return Err(NhdError::Missing(format!(
                "group {id} has no table block"
            )));
        }
        let active = group.entries.len() as u32;
        let end = first.saturating_add(data.len() as u32);
        if first > active || end > group.length || data.is_empty() {
            return Err(NhdError::InvalidArgument(format!(
                "range [{first}, {end}) is not writable in group {id} \
                 with {active} of {} slots active",
                group.length
            )));
        }
        let mut entries = group.entries.clone();
        for (idx, d) in data.iter().enumerate() {
            let slot = first as usize + idx;
            if slot < entries.len() {
                entries[slot] = *d;
            } else {
                entries.push(*d);
            }
        }
        self.fill_block(asic_hdl, group.base, group.length, &entries, 0)?;
        self.ecmp.group_mut(id)?.entries = entries;
        Ok(())
    }

    pub(crate) fn get_index_range(&self, id: GroupId) -> NhdResult<(u32, u32)> {
        self.ecmp.group(id)?.index_range().ok_or_else(|| {
            NhdError::Missing(format!("group {id} has no table block"))
        })
    }

    pub(crate) fn get_used(
        &self,
        asic_hdl: &asic::Handle,
        target: UsedTarget,
        reset: bool,
    ) -> NhdResult<bool> {
        let (first, count) = match target {
            UsedTarget::Group(id) => {
                let (first, last) = self.get_index_range(id)?;
                (first, last - first + 1)
            }
            UsedTarget::Index(idx) => {
                if idx == 0 || idx >= self.geometry.size {
                    return Err(NhdError::InvalidArgument(format!(
                        "index {idx} is outside the table"
                    )));
                }
                (idx, 1)
            }
        };

        // Gather the bits word by word, so each word is read and reset once.
        let mut words: BTreeMap<u32, u32> = BTreeMap::new();
        for slot in first..first + count {
            let (addr, bit) = self.geometry.used_bit(slot);
            *words.entry(addr).or_default() |= bit;
        }
        let mut used = false;
        for (addr, mask) in words {
            let hits = asic_hdl.read_word(addr)? & mask;
            if hits != 0 {
                used = true;
                if reset {
                    asic_hdl.mask_word(addr, hits, 0)?;
                }
            }
        }
        Ok(used)
    }

    pub(crate) fn register_group_client(
        &mut self,
        id: GroupId,
        client: Client,
    ) -> NhdResult<()> {
        if matches!(client, Client::None | Client::Ecmp) {
            return Err(NhdError::InvalidArgument(format!(
                "client {client} cannot follow a group"
            )));
        }
        let group = self.ecmp.group_mut(id)?;
        if group.clients.contains(&client) {
            Err(NhdError::InvalidArgument(format!(
                "client {client} already follows group {id}"
            )))
        } else if group.clients.len() >= MAX_GROUP_CLIENTS {
            Err(NhdError::CapacityExceeded(format!(
                "group {id} already has {MAX_GROUP_CLIENTS} clients"
            )))
        } else {
            group.clients.push(client);
            Ok(())
        }
    }

    pub(crate) fn unregister_group_client(
        &mut self,
        id: GroupId,
        client: Client,
    ) -> NhdResult<()> {
        let group = self.ecmp.group_mut(id)?;
        match group.clients.iter().position(|c| *c == client) {
            Some(idx) => {
                group.clients.remove(idx);
                Ok(())
            }
            None => Err(NhdError::NotOwner(format!(
                "client {client} does not follow group {id}"
            ))),
        }
    }

    /// Reissue the group's replication entry against its current location.
    pub(crate) fn move_multicast_group(
        &mut self,
        asic_hdl: &asic::Handle,
        id: GroupId,
    ) -> NhdResult<u32> {
        let log = self.ecmp.log.clone();
        let group = self.ecmp.group_mut(id)?;
        if !group.group_type.is_multicast() {
            return Err(NhdError::InvalidArgument(format!(
                "group {id} is not a multicast group"
            )));
        }
        if group.mc_target().is_none() {
            return Err(NhdError::Missing(format!(
                "group {id} has nothing to replicate to"
            )));
        }
        group.sync_replication(&log, asic_hdl)?;
        group
            .mc_dest
            .ok_or_else(|| NhdError::Other("replication entry not set".into()))
    }

    pub(crate) fn group_info(&self, id: GroupId) -> NhdResult<EcmpGroupInfo> {
        Ok(self.ecmp.group(id)?.info())
    }

    pub(crate) fn group_next_hops(
        &self,
        id: GroupId,
    ) -> NhdResult<Vec<NextHopEntry>> {
        let group = self.ecmp.group(id)?;
        let Some(block) = group.block else {
            return Ok(Vec::new());
        };
        Ok(group
            .entries
            .iter()
            .enumerate()
            .map(|(slot, data)| NextHopEntry {
                group: id,
                block,
                slot: slot as u32,
                data: *data,
            })
            .collect())
    }

    pub(crate) fn group_infos(&self) -> Vec<EcmpGroupInfo> {
        self.ecmp.groups().map(EcmpGroup::info).collect()
    }
}
