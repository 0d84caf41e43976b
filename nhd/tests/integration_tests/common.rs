// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::sync::{Arc, Mutex};

use slog::Drain;

use ::common::network::MacAddr;
use aal::RegisterOps;
use nhd::config::Config;
use nhd::{
    ArpTable, BlockHandle, BlockMove, BlockOptions, Client, GroupId,
    MoveHandler, NextHop, NextHopData,
};

pub fn test_log() -> slog::Logger {
    let decorator =
        slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    slog::Logger::root(drain, slog::o!())
}

/// A small table with proactive compaction turned off, so every move a test
/// sees is one it asked for.
pub fn small_config(size: u32, reserved: u32) -> Config {
    let mut config = Config::default();
    config.table.size = size;
    config.table.reserved = reserved;
    config.defrag.proactive = false;
    config
}

pub fn new_table(config: &Config) -> ArpTable {
    let log = test_log();
    let asic_hdl = asic::Handle::new(&log, &config.asic).unwrap();
    ArpTable::new(&log, asic_hdl, config).unwrap()
}

#[cfg(not(feature = "chaos"))]
pub fn stub(table: &ArpTable) -> &asic::stub::StubHandle {
    table.asic()
}

#[cfg(feature = "chaos")]
pub fn stub(table: &ArpTable) -> &asic::stub::StubHandle {
    table.asic().stub()
}

/// Size the emulated replication table.  Destination 0 is never handed out,
/// so `n` entries hold `n - 1` groups.
#[cfg(not(feature = "chaos"))]
pub fn set_mc_entries(config: &mut Config, n: u32) {
    config.asic.mc_entries = n;
}

#[cfg(feature = "chaos")]
pub fn set_mc_entries(config: &mut Config, n: u32) {
    config.asic.stub.mc_entries = n;
}

/// Every notification a handler received, tagged with the group it was
/// delivered for, if any.
pub type Moves = Arc<Mutex<Vec<(Option<GroupId>, BlockMove)>>>;

pub struct Recorder(Moves);

impl MoveHandler for Recorder {
    fn block_moved(&mut self, mv: &BlockMove) -> anyhow::Result<()> {
        self.0.lock().unwrap().push((None, *mv));
        Ok(())
    }

    fn group_moved(
        &mut self,
        group: GroupId,
        mv: &BlockMove,
    ) -> anyhow::Result<()> {
        self.0.lock().unwrap().push((Some(group), *mv));
        Ok(())
    }
}

pub fn record_moves(table: &ArpTable, client: Client) -> Moves {
    let moves = Moves::default();
    table
        .set_move_handler(client, Box::new(Recorder(moves.clone())))
        .unwrap();
    moves
}

/// Just the (old, new) offsets of each recorded move.
pub fn offsets(moves: &Moves) -> Vec<(u32, u32)> {
    moves
        .lock()
        .unwrap()
        .iter()
        .map(|(_, mv)| (mv.old_offset, mv.new_offset))
        .collect()
}

pub fn arp(n: u8) -> NextHopData {
    let mac = MacAddr::new(0xa8, 0x40, 0x25, 0x00, 0x00, n);
    NextHopData::arp(mac, 0, n as u16).unwrap()
}

pub fn hop(n: u8) -> NextHop {
    NextHop::Arp(arp(n))
}

pub fn hops(range: std::ops::Range<u8>) -> Vec<NextHop> {
    range.map(hop).collect()
}

pub fn alloc(table: &ArpTable, client: Client, length: u32) -> BlockHandle {
    table
        .alloc_block(client, length, BlockOptions::NONE, 0)
        .unwrap()
}

pub fn offset_of(table: &ArpTable, handle: BlockHandle) -> u32 {
    table.block_info(handle).unwrap().offset
}

/// The row currently in the hardware at `slot`.
pub fn row(table: &ArpTable, config: &Config, slot: u32) -> NextHopData {
    let mut data = NextHopData::default();
    table
        .asic()
        .read_words(config.table.row_addr(slot), &mut data.0)
        .unwrap();
    data
}
