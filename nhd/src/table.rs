// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The per-switch table instance.
//!
//! All of the table's state sits behind a single lock.  Every public
//! operation takes that lock for its full duration, so allocation, release,
//! compaction, and group updates on one table are totally ordered, and any
//! move notifications they trigger have been delivered by the time the call
//! returns.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;

use slog::{debug, info};

use aal::RegisterOps;

use crate::block::{BlockHandle, BlockInfo, BlockOptions, BlockStore, Client};
use crate::config::{Config, DefragConfig, TableConfig};
use crate::defrag::CompactionReport;
use crate::ecmp::{
    EcmpEngine, EcmpGroupInfo, GroupId, GroupType, NextHop, NextHopData,
    NextHopEntry, UsedTarget,
};
use crate::freemap::FreeMap;
use crate::notify::{MoveHandler, Notifier};
use crate::stats::{Histogram, TableStats};
use crate::types::{NhdError, NhdResult};
use crate::views::{
    BlockView, FreeExtentView, GroupView, HistogramBucket, TableSummary,
};

// Each table gets a distinct instance number, stamped into every handle it
// issues.
static NEXT_INSTANCE: AtomicU16 = AtomicU16::new(1);

pub(crate) struct TableState {
    pub(crate) log: slog::Logger,
    pub(crate) instance: u16,
    pub(crate) geometry: TableConfig,
    pub(crate) defrag: DefragConfig,
    pub(crate) blocks: BlockStore,
    pub(crate) freemap: FreeMap,
    pub(crate) stats: TableStats,
    pub(crate) notifier: Notifier,
    pub(crate) ecmp: EcmpEngine,
}

impl TableState {
    fn new(log: &slog::Logger, instance: u16, config: &Config) -> Self {
        let geometry = config.table.clone();
        TableState {
            log: log.clone(),
            instance,
            freemap: FreeMap::new(
                log,
                format!("arp{instance}"),
                1,
                geometry.available_end(),
            ),
            geometry,
            defrag: config.defrag.clone(),
            blocks: BlockStore::new(instance),
            stats: TableStats::default(),
            notifier: Notifier::new(log),
            ecmp: EcmpEngine::new(log, &config.ecmp),
        }
    }

    // Is `offset` in the staging region?
    pub(crate) fn in_staging(&self, offset: u32) -> bool {
        offset >= self.geometry.staging_base()
    }

    /// Check every structural invariant of the table, returning a
    /// description of the first violation found.
    pub(crate) fn verify(&self) -> NhdResult<()> {
        let fail = |msg: String| Err(NhdError::Other(msg));

        // Blocks and free extents, taken together, tile the available region
        // exactly once.  A block parked in staging is the only thing allowed
        // above it.
        let staging = self.geometry.staging_base();
        let mut ranges: Vec<(u32, u32, bool)> = Vec::new();
        let mut parked = 0;
        for (handle, ctl) in self.blocks.iter() {
            if ctl.offset >= staging {
                parked += 1;
                if ctl.offset + ctl.length > self.geometry.size {
                    return fail(format!("block {handle} overruns table"));
                }
                if !ctl.options.contains(BlockOptions::SWAP_INTERMEDIATE) {
                    return fail(format!(
                        "block {handle} in staging without swap flag"
                    ));
                }
            } else {
                ranges.push((ctl.offset, ctl.length, true));
            }
        }
        if parked > 1 {
            return fail(format!("{parked} blocks parked in staging"));
        }
        ranges.extend(self.freemap.extents().map(|(o, l)| (o, l, false)));
        ranges.sort_unstable();

        let mut next = 1;
        let mut prev_free = false;
        for (offset, len, used) in ranges {
            if offset != next {
                return fail(format!(
                    "partition broken at {next}: next range starts at {offset}"
                ));
            }
            if !used && prev_free {
                return fail(format!("uncoalesced free extent at {offset}"));
            }
            prev_free = !used;
            next = offset + len;
        }
        if next != staging {
            return fail(format!(
                "partition ends at {next}, expected {staging}"
            ));
        }

        let free_hist =
            Histogram::from_lengths(self.freemap.extents().map(|(_, l)| l));
        if &free_hist != self.freemap.histogram() {
            return fail("free histogram out of sync".into());
        }
        let alloc_hist =
            Histogram::from_lengths(self.blocks.iter().map(|(_, b)| b.length));
        if alloc_hist != self.stats.alloc_hist {
            return fail("allocation histogram out of sync".into());
        }

        // Every group with a block must agree with the block store about
        // where it is.
        for group in self.ecmp.groups() {
            let Some(handle) = group.block() else {
                if group.length() != 0 {
                    return fail("blockless group has a length".into());
                }
                continue;
            };
            let ctl = match self.blocks.get(handle) {
                Ok(ctl) => ctl,
                Err(e) => return fail(format!("group block lost: {e}")),
            };
            if ctl.offset != group.base() || ctl.length != group.length() {
                return fail(format!(
                    "group block {handle} is at {}+{}, group thinks {}+{}",
                    ctl.offset,
                    ctl.length,
                    group.base(),
                    group.length()
                ));
            }
            if !ctl.is_bound(Client::Ecmp) {
                return fail(format!("group block {handle} not bound to ecmp"));
            }
        }
        Ok(())
    }

    fn summary(&self) -> TableSummary {
        let capacity = self.freemap.capacity();
        let free = self.freemap.free_entries();
        let mut per_client: BTreeMap<Client, usize> = BTreeMap::new();
        for (_, ctl) in self.blocks.iter() {
            if let Some(owner) = ctl.clients().first() {
                *per_client.entry(*owner).or_default() += 1;
            }
        }
        TableSummary {
            instance: self.instance,
            size: self.geometry.size,
            reserved: self.geometry.reserved,
            capacity,
            free_entries: free,
            used_entries: capacity - free,
            usage_ratio: (capacity - free) as f64 / capacity as f64,
            first_free: self.freemap.extents().next().map(|(o, _)| o),
            last_free: self
                .freemap
                .last_extent()
                .map(|(offset, len)| offset + len - 1),
            largest_free_extent: self.freemap.largest_free_extent(),
            free_extents: self.freemap.extent_count(),
            blocks: self.blocks.len(),
            groups: self.ecmp.len(),
            blocks_per_client: per_client,
            alloc_histogram: HistogramBucket::from_histogram(
                &self.stats.alloc_hist,
            ),
            free_histogram: HistogramBucket::from_histogram(
                self.freemap.histogram(),
            ),
            allocs: self.stats.allocs,
            frees: self.stats.frees,
            failed_allocs: self.stats.failed_allocs,
            moves: self.stats.moves,
            compactions: self.stats.compactions,
            notifications: self.notifier.delivered(),
            failed_notifications: self.notifier.failed(),
        }
    }
}

/// A single ARP / next-hop table on one switch.
pub struct ArpTable {
    log: slog::Logger,
    asic_hdl: asic::Handle,
    state: Mutex<TableState>,
}

impl ArpTable {
    pub fn new(
        log: &slog::Logger,
        asic_hdl: asic::Handle,
        config: &Config,
    ) -> NhdResult<Self> {
        config.validate()?;
        let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        let log = log.new(slog::o!("unit" => "arp_table",
            "instance" => instance));
        info!(log, "created table";
            "size" => config.table.size,
            "reserved" => config.table.reserved,
            "capacity" => config.table.capacity());
        let state = TableState::new(&log, instance, config);
        Ok(ArpTable {
            log,
            asic_hdl,
            state: Mutex::new(state),
        })
    }

    pub fn asic(&self) -> &asic::Handle {
        &self.asic_hdl
    }

    pub fn instance(&self) -> u16 {
        self.state.lock().unwrap().instance
    }

    /// Allocate a block of `length` rows on behalf of `client`.  ECMP blocks
    /// are managed by the group engine and cannot be requested directly.
    pub fn alloc_block(
        &self,
        client: Client,
        length: u32,
        options: BlockOptions,
        opaque: u64,
    ) -> NhdResult<BlockHandle> {
        if client == Client::Ecmp {
            return Err(NhdError::InvalidArgument(
                "ecmp blocks are allocated through group operations".into(),
            ));
        }
        let mut state = self.state.lock().unwrap();
        state.request_block(&self.asic_hdl, client, length, options, opaque)
    }

    /// Drop `client`'s binding to a block, releasing the block once nothing
    /// else is bound to it.
    pub fn free_block(
        &self,
        client: Client,
        handle: BlockHandle,
    ) -> NhdResult<()> {
        let mut state = self.state.lock().unwrap();
        if client == Client::Ecmp {
            return Err(NhdError::InvalidArgument(
                "ecmp blocks are released through group operations".into(),
            ));
        }
        state.release_block(client, handle).map(|_| ())
    }

    pub fn register_block_client(
        &self,
        handle: BlockHandle,
        client: Client,
    ) -> NhdResult<()> {
        let mut state = self.state.lock().unwrap();
        state.blocks.register_client(handle, client)?;
        debug!(self.log, "registered client";
            "handle" => %handle, "client" => %client);
        Ok(())
    }

    pub fn unregister_block_client(
        &self,
        handle: BlockHandle,
        client: Client,
    ) -> NhdResult<()> {
        let mut state = self.state.lock().unwrap();
        state.blocks.unregister_client(handle, client)?;
        debug!(self.log, "unregistered client";
            "handle" => %handle, "client" => %client);
        Ok(())
    }

    pub fn block_info(&self, handle: BlockHandle) -> NhdResult<BlockInfo> {
        self.state.lock().unwrap().blocks.get_info(handle)
    }

    pub fn set_block_opaque(
        &self,
        handle: BlockHandle,
        opaque: u64,
    ) -> NhdResult<()> {
        self.state.lock().unwrap().blocks.set_opaque(handle, opaque)
    }

    /// Copy `count` rows from `src` (starting `src_off` rows into it) to
    /// `dst` (starting `dst_off` rows in).  `client` must be bound to both.
    pub fn copy_entries(
        &self,
        client: Client,
        src: BlockHandle,
        dst: BlockHandle,
        count: u32,
        src_off: u32,
        dst_off: u32,
    ) -> NhdResult<()> {
        let state = self.state.lock().unwrap();
        state.copy_entries(
            &self.asic_hdl,
            client,
            (src, src_off),
            (dst, dst_off),
            count,
        )
    }

    /// Write a raw row at `index` rows into a block.
    pub fn write_entry(
        &self,
        client: Client,
        handle: BlockHandle,
        index: u32,
        data: &NextHopData,
    ) -> NhdResult<()> {
        let state = self.state.lock().unwrap();
        let slot = state.block_slot(client, handle, index)?;
        let mut row = vec![0u32; state.geometry.entry_words as usize];
        row[..data.0.len()].copy_from_slice(&data.0);
        self.asic_hdl
            .write_words(state.geometry.row_addr(slot), &row)
            .map_err(NhdError::from)
    }

    pub fn read_entry(
        &self,
        client: Client,
        handle: BlockHandle,
        index: u32,
    ) -> NhdResult<NextHopData> {
        let state = self.state.lock().unwrap();
        let slot = state.block_slot(client, handle, index)?;
        let mut data = NextHopData::default();
        self.asic_hdl
            .read_words(state.geometry.row_addr(slot), &mut data.0)?;
        Ok(data)
    }

    /// Run a compaction pass now, regardless of how full the table is.
    pub fn compact(&self) -> CompactionReport {
        let mut state = self.state.lock().unwrap();
        state.compact(&self.asic_hdl)
    }

    pub fn set_move_handler(
        &self,
        client: Client,
        handler: Box<dyn MoveHandler>,
    ) -> NhdResult<()> {
        self.state.lock().unwrap().notifier.set_handler(client, handler)
    }

    pub fn clear_move_handler(&self, client: Client) -> NhdResult<()> {
        self.state.lock().unwrap().notifier.clear_handler(client)
    }

    pub fn create_group(&self, group_type: GroupType) -> NhdResult<GroupId> {
        self.state.lock().unwrap().create_group(group_type)
    }

    pub fn delete_group(&self, id: GroupId) -> NhdResult<()> {
        let mut state = self.state.lock().unwrap();
        state.delete_group(&self.asic_hdl, id)
    }

    pub fn add_next_hops(
        &self,
        id: GroupId,
        hops: &[NextHop],
    ) -> NhdResult<()> {
        let mut state = self.state.lock().unwrap();
        state.add_next_hops(&self.asic_hdl, id, hops)
    }

    pub fn delete_next_hops(
        &self,
        id: GroupId,
        hops: &[NextHop],
    ) -> NhdResult<()> {
        let mut state = self.state.lock().unwrap();
        state.delete_next_hops(&self.asic_hdl, id, hops)
    }

    /// Overwrite a single next hop in place.  This never moves the group.
    pub fn replace_next_hop(
        &self,
        id: GroupId,
        old: &NextHop,
        new: &NextHop,
    ) -> NhdResult<()> {
        let mut state = self.state.lock().unwrap();
        state.replace_next_hop(&self.asic_hdl, id, old, new)
    }

    /// Overwrite slots `[first, first + data.len())` of the group.  `first`
    /// may be at most the number of active next hops, so the active range
    /// stays contiguous.
    pub fn set_next_hops(
        &self,
        id: GroupId,
        first: u32,
        data: &[NextHopData],
    ) -> NhdResult<()> {
        let mut state = self.state.lock().unwrap();
        state.set_next_hops(&self.asic_hdl, id, first, data)
    }

    /// The first and last table index currently backing the group.
    pub fn get_index_range(&self, id: GroupId) -> NhdResult<(u32, u32)> {
        self.state.lock().unwrap().get_index_range(id)
    }

    /// Has the hardware hit any row of the target since the bits were last
    /// reset?
    pub fn get_used(
        &self,
        target: UsedTarget,
        reset: bool,
    ) -> NhdResult<bool> {
        let state = self.state.lock().unwrap();
        state.get_used(&self.asic_hdl, target, reset)
    }

    pub fn register_group_client(
        &self,
        id: GroupId,
        client: Client,
    ) -> NhdResult<()> {
        self.state.lock().unwrap().register_group_client(id, client)
    }

    pub fn unregister_group_client(
        &self,
        id: GroupId,
        client: Client,
    ) -> NhdResult<()> {
        self.state.lock().unwrap().unregister_group_client(id, client)
    }

    /// Reissue the group's replication-table entry, returning the new
    /// destination index.
    pub fn move_multicast_group(&self, id: GroupId) -> NhdResult<u32> {
        let mut state = self.state.lock().unwrap();
        state.move_multicast_group(&self.asic_hdl, id)
    }

    pub fn group_info(&self, id: GroupId) -> NhdResult<EcmpGroupInfo> {
        self.state.lock().unwrap().group_info(id)
    }

    pub fn group_next_hops(
        &self,
        id: GroupId,
    ) -> NhdResult<Vec<NextHopEntry>> {
        self.state.lock().unwrap().group_next_hops(id)
    }

    pub fn summary(&self) -> TableSummary {
        self.state.lock().unwrap().summary()
    }

    /// All blocks, optionally limited to those owned by one client, in
    /// offset order.
    pub fn blocks(&self, owner: Option<Client>) -> Vec<BlockView> {
        let state = self.state.lock().unwrap();
        state
            .blocks
            .by_offset()
            .into_iter()
            .filter_map(|h| state.blocks.get(h).ok().map(|ctl| (h, ctl)))
            .filter(|(_, ctl)| {
                owner.map_or(true, |o| ctl.clients().first() == Some(&o))
            })
            .map(|(h, ctl)| BlockView::new(h, ctl))
            .collect()
    }

    pub fn free_extents(&self) -> Vec<FreeExtentView> {
        let state = self.state.lock().unwrap();
        state
            .freemap
            .extents()
            .map(|(offset, length)| FreeExtentView { offset, length })
            .collect()
    }

    pub fn groups(&self) -> Vec<GroupView> {
        let state = self.state.lock().unwrap();
        state.group_infos().into_iter().map(GroupView::from).collect()
    }

    pub fn verify(&self) -> NhdResult<()> {
        self.state.lock().unwrap().verify()
    }

    /// Forget every block and group, returning the table to its initial
    /// state.  Rows are not cleared and replication entries are not
    /// released; this is for use after the device itself has been reset.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        info!(self.log, "resetting table");
        state.blocks.clear();
        state.ecmp.clear();
        state.freemap.reset();
        state.stats = TableStats::default();
    }
}
