// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The compaction engine.
//!
//! Compaction runs in two kinds of pass.  A packing pass walks the blocks in
//! offset order and slides each movable one down as far as it can go without
//! crossing a pinned (`DoNotMove`) block.  When packing stops making progress
//! but free space is still scattered, a defrag pass fills the holes trapped
//! below pinned blocks with the largest movable blocks from above that fit.
//!
//! A block whose destination overlaps its current rows can't be moved in one
//! copy.  It is first copied into the staging region at the top of the
//! table, then copied down to its destination, with a notification for each
//! leg.
//!
//! The total number of relocations attempted by one compaction is capped by
//! `max_steps`, and each kind of pass has its own cap, so a compaction always
//! terminates even when the layout can't be fully consolidated.

use std::collections::VecDeque;

use serde::Serialize;
use slog::{debug, error, warn};

use aal::RegisterOps;

use crate::block::{BlockHandle, BlockOptions};
use crate::notify::{BlockMove, MovePhase};
use crate::table::TableState;
use crate::types::NhdResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CompactionOutcome {
    /// All free space in the table is a single extent
    Complete,
    /// Free space is still fragmented, either because pinned blocks are in
    /// the way or because the step budget ran out
    Partial,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    pub outcome: CompactionOutcome,
    /// Blocks that ended up at a new offset
    pub moves: u32,
    /// Relocations attempted, successful or not
    pub steps: u32,
    pub packing_stages: u32,
    pub defrag_stages: u32,
    pub budget_exhausted: bool,
}

impl CompactionReport {
    fn new() -> Self {
        CompactionReport {
            outcome: CompactionOutcome::Partial,
            moves: 0,
            steps: 0,
            packing_stages: 0,
            defrag_stages: 0,
            budget_exhausted: false,
        }
    }
}

// Where a packing pass wants to put a block
enum Target {
    Direct(u32),
    Staged(u32),
}

impl TableState {
    pub(crate) fn copy_rows(
        &self,
        asic_hdl: &asic::Handle,
        from: u32,
        to: u32,
        count: u32,
    ) -> NhdResult<()> {
        let mut row = vec![0u32; self.geometry.entry_words as usize];
        for i in 0..count {
            asic_hdl.read_words(self.geometry.row_addr(from + i), &mut row)?;
            asic_hdl.write_words(self.geometry.row_addr(to + i), &row)?;
        }
        Ok(())
    }

    fn budget_left(&self, report: &mut CompactionReport) -> bool {
        if report.steps >= self.defrag.max_steps {
            report.budget_exhausted = true;
            false
        } else {
            true
        }
    }

    // Tell everyone bound to the block that it now lives at `new`.
    fn announce(
        &mut self,
        asic_hdl: &asic::Handle,
        handle: BlockHandle,
        old: u32,
        new: u32,
        phase: MovePhase,
    ) {
        let Ok(ctl) = self.blocks.get(handle) else {
            return;
        };
        let mv = BlockMove {
            handle,
            old_offset: old,
            new_offset: new,
            length: ctl.length,
            opaque: ctl.opaque,
            phase,
        };
        let clients = ctl.clients().to_vec();
        self.notifier.dispatch(&mut self.ecmp, asic_hdl, &clients, &mv);
        self.stats.moves += 1;
        self.age();
    }

    // Move a block straight into free rows that don't overlap it.  Returns
    // true if the block moved.
    fn move_direct(
        &mut self,
        asic_hdl: &asic::Handle,
        handle: BlockHandle,
        dest: u32,
    ) -> NhdResult<bool> {
        let ctl = self.blocks.get(handle)?;
        let (old, length) = (ctl.offset, ctl.length);
        let parked = ctl.options.contains(BlockOptions::SWAP_INTERMEDIATE);

        self.freemap.mark_used(dest, length)?;
        if let Err(e) = self.copy_rows(asic_hdl, old, dest, length) {
            error!(self.log, "failed to copy block; leaving it in place";
                "handle" => %handle, "from" => old, "to" => dest,
                "error" => %e);
            self.freemap.mark_free(dest, length)?;
            return Ok(false);
        }
        self.blocks.set_offset(handle, dest)?;
        let phase = if parked {
            self.blocks.update_options(
                handle,
                BlockOptions::NONE,
                BlockOptions::SWAP_INTERMEDIATE,
            )?;
            MovePhase::Final
        } else {
            MovePhase::Direct
        };
        self.announce(asic_hdl, handle, old, dest, phase);
        if !parked {
            self.freemap.mark_free(old, length)?;
        }
        Ok(true)
    }

    // Move a block to a destination that overlaps its current rows, by way
    // of the staging region.  Returns true if the block moved, even if it
    // only made it as far as staging.
    fn move_staged(
        &mut self,
        asic_hdl: &asic::Handle,
        handle: BlockHandle,
        dest: u32,
    ) -> NhdResult<bool> {
        let ctl = self.blocks.get(handle)?;
        let (old, length) = (ctl.offset, ctl.length);
        let staging = self.geometry.staging_base();

        if let Err(e) = self.copy_rows(asic_hdl, old, staging, length) {
            error!(self.log, "failed to stage block; leaving it in place";
                "handle" => %handle, "error" => %e);
            return Ok(false);
        }
        self.blocks.set_offset(handle, staging)?;
        self.blocks.update_options(
            handle,
            BlockOptions::SWAP_INTERMEDIATE,
            BlockOptions::NONE,
        )?;
        self.announce(asic_hdl, handle, old, staging, MovePhase::Intermediate);

        // Only once every client has let go of the old rows can they be
        // reused for the block's new home.
        self.freemap.mark_free(old, length)?;
        self.freemap.mark_used(dest, length)?;
        if let Err(e) = self.copy_rows(asic_hdl, staging, dest, length) {
            // The block stays parked; a later pass will retry the move.
            error!(self.log, "failed to unstage block";
                "handle" => %handle, "to" => dest, "error" => %e);
            self.freemap.mark_free(dest, length)?;
            return Ok(true);
        }
        self.blocks.set_offset(handle, dest)?;
        self.blocks.update_options(
            handle,
            BlockOptions::SWAP_FINAL,
            BlockOptions::SWAP_INTERMEDIATE,
        )?;
        self.announce(asic_hdl, handle, staging, dest, MovePhase::Final);
        self.blocks.update_options(
            handle,
            BlockOptions::NONE,
            BlockOptions::SWAP_FINAL,
        )?;
        Ok(true)
    }

    fn staging_busy(&self) -> bool {
        self.blocks.iter().any(|(_, b)| self.in_staging(b.offset))
    }

    // Slide every movable block down as far as it can go.  Returns the
    // number of blocks moved.
    fn packing_pass(
        &mut self,
        asic_hdl: &asic::Handle,
        report: &mut CompactionReport,
    ) -> NhdResult<u32> {
        let staging = self.geometry.staging_base();
        let mut floor = 1;
        let mut moved = 0;

        for handle in self.blocks.by_offset() {
            let Ok(ctl) = self.blocks.get(handle) else {
                continue;
            };
            let (offset, length, options) =
                (ctl.offset, ctl.length, ctl.options);
            if options.contains(BlockOptions::DO_NOT_MOVE) {
                floor = floor.max(offset + length);
                continue;
            }

            let target = if options.contains(BlockOptions::SWAP_INTERMEDIATE)
            {
                // A parked block can go anywhere below staging
                self.freemap
                    .lowest_fit_below(staging, length, floor)
                    .map(Target::Direct)
            } else {
                let direct =
                    self.freemap.lowest_fit_below(offset, length, floor);
                let slide = self
                    .freemap
                    .extent_below(offset)
                    .map(|(low, _)| low.max(floor))
                    .filter(|low| *low < offset);
                let can_stage = length <= self.geometry.reserved
                    && !self.staging_busy();
                match (direct, slide) {
                    (Some(d), Some(s)) if s < d && can_stage => {
                        Some(Target::Staged(s))
                    }
                    (Some(d), _) => Some(Target::Direct(d)),
                    (None, Some(s)) if can_stage => Some(Target::Staged(s)),
                    _ => None,
                }
            };
            let Some(target) = target else {
                continue;
            };

            if !self.budget_left(report) {
                break;
            }
            report.steps += 1;
            let done = match target {
                Target::Direct(dest) => {
                    self.move_direct(asic_hdl, handle, dest)?
                }
                Target::Staged(dest) => {
                    self.move_staged(asic_hdl, handle, dest)?
                }
            };
            if done {
                moved += 1;
            }
        }
        Ok(moved)
    }

    // Fill holes trapped below pinned blocks.  Every free extent except the
    // topmost is a candidate; whatever is left of a hole after a block is
    // dropped into it goes back on the work list, up to max_depth times.
    fn defrag_pass(
        &mut self,
        asic_hdl: &asic::Handle,
        report: &mut CompactionReport,
    ) -> NhdResult<u32> {
        let top = self.freemap.last_extent().map(|(offset, _)| offset);
        let mut work: VecDeque<(u32, u32, u32)> = self
            .freemap
            .extents()
            .filter(|(offset, _)| Some(*offset) != top)
            .map(|(offset, len)| (offset, len, 0))
            .collect();
        let mut moved = 0;

        while let Some((hole, hole_len, depth)) = work.pop_front() {
            if !self.freemap.is_free(hole, hole_len) {
                continue;
            }
            // Largest movable block above the hole that fits in it, with
            // ties going to the highest offset
            let candidate = self
                .blocks
                .iter()
                .filter(|(_, b)| {
                    b.offset > hole
                        && b.length <= hole_len
                        && !b.options.intersects(
                            BlockOptions::DO_NOT_MOVE
                                | BlockOptions::SWAP_INTERMEDIATE,
                        )
                })
                .max_by_key(|(_, b)| (b.length, b.offset))
                .map(|(h, b)| (h, b.length));
            let Some((handle, length)) = candidate else {
                continue;
            };

            if !self.budget_left(report) {
                break;
            }
            report.steps += 1;
            if self.move_direct(asic_hdl, handle, hole)? {
                moved += 1;
                if hole_len > length && depth + 1 < self.defrag.max_depth {
                    let rest = (hole + length, hole_len - length, depth + 1);
                    work.push_back(rest);
                }
            }
        }
        Ok(moved)
    }

    fn compact_inner(
        &mut self,
        asic_hdl: &asic::Handle,
        report: &mut CompactionReport,
    ) -> NhdResult<()> {
        loop {
            while report.packing_stages < self.defrag.packing_stages
                && !report.budget_exhausted
            {
                report.packing_stages += 1;
                let moved = self.packing_pass(asic_hdl, report)?;
                report.moves += moved;
                if moved == 0 {
                    break;
                }
            }
            if self.freemap.extent_count() <= 1
                || report.defrag_stages >= self.defrag.defrag_stages
                || report.budget_exhausted
            {
                return Ok(());
            }
            report.defrag_stages += 1;
            let moved = self.defrag_pass(asic_hdl, report)?;
            report.moves += moved;
            if moved == 0 {
                return Ok(());
            }
        }
    }

    /// Compact the table.  This never fails: a relocation that can't be
    /// completed is abandoned, and a layout that can't be fully consolidated
    /// yields a partial outcome.
    pub(crate) fn compact(
        &mut self,
        asic_hdl: &asic::Handle,
    ) -> CompactionReport {
        let mut report = CompactionReport::new();
        self.stats.compactions += 1;
        debug!(self.log, "compaction starting";
            "free" => self.freemap.free_entries(),
            "extents" => self.freemap.extent_count());

        if let Err(e) = self.compact_inner(asic_hdl, &mut report) {
            // Only reachable if the bookkeeping itself is inconsistent
            error!(self.log, "compaction aborted"; "error" => %e);
        }

        report.outcome = if self.freemap.extent_count() <= 1 {
            CompactionOutcome::Complete
        } else {
            CompactionOutcome::Partial
        };
        if report.outcome == CompactionOutcome::Partial {
            warn!(self.log, "partial compaction";
                "moves" => report.moves,
                "steps" => report.steps,
                "extents" => self.freemap.extent_count(),
                "budget_exhausted" => report.budget_exhausted);
        } else {
            debug!(self.log, "compaction complete";
                "moves" => report.moves, "steps" => report.steps);
        }
        report
    }
}
