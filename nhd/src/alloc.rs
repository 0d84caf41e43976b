// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Block allocation and release.

use slog::{debug, info, warn};

use crate::block::{BlockHandle, BlockOptions, Client};
use crate::stats::Histogram;
use crate::table::TableState;
use crate::types::{NhdError, NhdResult};

impl TableState {
    fn validate_request(
        &self,
        client: Client,
        length: u32,
        options: BlockOptions,
    ) -> NhdResult<()> {
        if client == Client::None {
            Err(NhdError::InvalidArgument(
                "blocks must be owned by a client".into(),
            ))
        } else if length == 0 {
            Err(NhdError::InvalidArgument("zero-length block".into()))
        } else if length > self.geometry.capacity() {
            Err(NhdError::InvalidArgument(format!(
                "{length} entries exceeds table capacity of {}",
                self.geometry.capacity()
            )))
        } else if options.intersects(
            BlockOptions::SWAP_INTERMEDIATE | BlockOptions::SWAP_FINAL,
        ) {
            Err(NhdError::InvalidArgument(format!(
                "option flags {options} are reserved for compaction"
            )))
        } else {
            Ok(())
        }
    }

    fn try_allocate(
        &mut self,
        client: Client,
        length: u32,
        options: BlockOptions,
        opaque: u64,
    ) -> NhdResult<Option<BlockHandle>> {
        let Some(offset) = self.freemap.find_free_extent(length) else {
            return Ok(None);
        };
        self.freemap.mark_used(offset, length)?;
        let handle =
            self.blocks.insert(client, offset, length, options, opaque);
        self.stats.record_alloc(length);
        self.age();
        debug!(self.log, "allocated block";
            "handle" => %handle,
            "client" => %client,
            "offset" => offset,
            "length" => length);
        Ok(Some(handle))
    }

    pub(crate) fn request_block(
        &mut self,
        asic_hdl: &asic::Handle,
        client: Client,
        length: u32,
        options: BlockOptions,
        opaque: u64,
    ) -> NhdResult<BlockHandle> {
        self.validate_request(client, length, options)?;

        if let Some(handle) =
            self.try_allocate(client, length, options, opaque)?
        {
            self.maybe_compact_proactively(asic_hdl);
            return Ok(handle);
        }

        // There is enough free space in total, but it is too fragmented to
        // hold this request.  Compact once and try again.
        let used = self.freemap.used_entries();
        if self.defrag.below_threshold(used, self.freemap.capacity())
            && self.freemap.free_entries() >= length
        {
            info!(self.log, "fragmented table; compacting";
                "length" => length,
                "free" => self.freemap.free_entries(),
                "largest" => self.freemap.largest_free_extent());
            let report = self.compact(asic_hdl);
            debug!(self.log, "compaction finished"; "report" => ?report);
            if let Some(handle) =
                self.try_allocate(client, length, options, opaque)?
            {
                return Ok(handle);
            }
        }

        self.stats.failed_allocs += 1;
        warn!(self.log, "allocation failed";
            "client" => %client,
            "length" => length,
            "free" => self.freemap.free_entries(),
            "largest" => self.freemap.largest_free_extent());
        Err(NhdError::NoFreeResources(format!(
            "no room for {length} contiguous entries"
        )))
    }

    // Once the table is past the usage threshold, allocations that leave the
    // free space fragmented pay for a compaction up front.
    fn maybe_compact_proactively(&mut self, asic_hdl: &asic::Handle) {
        if !self.defrag.proactive || self.freemap.extent_count() <= 1 {
            return;
        }
        let used = self.freemap.used_entries();
        if self.defrag.below_threshold(used, self.freemap.capacity()) {
            return;
        }
        debug!(self.log, "usage above threshold; compacting";
            "used" => used, "extents" => self.freemap.extent_count());
        let report = self.compact(asic_hdl);
        debug!(self.log, "proactive compaction finished"; "report" => ?report);
    }

    /// Drop `client`'s binding to the block.  Returns true if that released
    /// the block's rows back to the table.
    pub(crate) fn release_block(
        &mut self,
        client: Client,
        handle: BlockHandle,
    ) -> NhdResult<bool> {
        let Some(ctl) = self.blocks.free(client, handle)? else {
            debug!(self.log, "unbound client from block";
                "handle" => %handle, "client" => %client);
            return Ok(false);
        };
        // A block parked in staging was never in the free map's range.
        if !self.in_staging(ctl.offset) {
            self.freemap.mark_free(ctl.offset, ctl.length)?;
        }
        self.stats.record_free(ctl.length);
        self.age();
        debug!(self.log, "released block";
            "handle" => %handle,
            "offset" => ctl.offset,
            "length" => ctl.length);
        Ok(true)
    }

    /// Advance the statistics aging counter, reconciling the histograms
    /// whenever it wraps.
    pub(crate) fn age(&mut self) {
        if self.stats.tick() {
            self.reconcile_stats();
        }
    }

    pub(crate) fn reconcile_stats(&mut self) {
        let fresh =
            Histogram::from_lengths(self.blocks.iter().map(|(_, b)| b.length));
        let alloc_drift = fresh != self.stats.alloc_hist;
        self.stats.alloc_hist = fresh;
        let free_drift = self.freemap.rebuild_histogram();
        self.stats.reconciles += 1;
        if alloc_drift || free_drift {
            warn!(self.log, "histograms drifted; rebuilt";
                "alloc" => alloc_drift, "free" => free_drift);
        }
    }

    // Translate an index within a block to an absolute slot, checking that
    // `client` is entitled to touch it.
    pub(crate) fn block_slot(
        &self,
        client: Client,
        handle: BlockHandle,
        index: u32,
    ) -> NhdResult<u32> {
        let ctl = self.blocks.get(handle)?;
        if !ctl.is_bound(client) {
            return Err(NhdError::NotOwner(format!(
                "client {client} is not bound to block {handle}"
            )));
        }
        if index >= ctl.length {
            return Err(NhdError::InvalidArgument(format!(
                "index {index} is outside block {handle} of length {}",
                ctl.length
            )));
        }
        Ok(ctl.offset + index)
    }

    /// Copy rows between two blocks without changing either block's
    /// registration.  Each side is a block and a row offset within it.
    pub(crate) fn copy_entries(
        &self,
        asic_hdl: &asic::Handle,
        client: Client,
        src: (BlockHandle, u32),
        dst: (BlockHandle, u32),
        count: u32,
    ) -> NhdResult<()> {
        if count == 0 {
            return Err(NhdError::InvalidArgument("nothing to copy".into()));
        }
        let mut slots = [0u32; 2];
        for (slot, (handle, off)) in slots.iter_mut().zip([src, dst]) {
            let ctl = self.blocks.get(handle)?;
            if !ctl.is_bound(client) {
                return Err(NhdError::NotOwner(format!(
                    "client {client} is not bound to block {handle}"
                )));
            }
            if off.checked_add(count).map_or(true, |end| end > ctl.length) {
                return Err(NhdError::InvalidArgument(format!(
                    "rows [{off}, +{count}) fall outside block {handle}"
                )));
            }
            *slot = ctl.offset + off;
        }
        let [from, to] = slots;
        if from < to + count && to < from + count {
            return Err(NhdError::InvalidArgument(
                "source and destination rows overlap".into(),
            ));
        }
        self.copy_rows(asic_hdl, from, to, count)
    }
}
