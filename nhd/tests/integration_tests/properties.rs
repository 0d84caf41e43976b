// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

// Long randomized workloads, checking the table's invariants after every
// operation.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use nhd::stats::Histogram;
use nhd::{
    ArpTable, BlockHandle, BlockOptions, Client, GroupId, GroupType,
    NhdError,
};

use super::common::*;

struct Workload {
    rng: StdRng,
    // Every live block, with the tag written to its first row
    blocks: BTreeMap<BlockHandle, (Client, u8)>,
    groups: Vec<(GroupId, Vec<u8>)>,
    next_tag: u8,
}

impl Workload {
    fn new(seed: u64) -> Self {
        Workload {
            rng: StdRng::seed_from_u64(seed),
            blocks: BTreeMap::new(),
            groups: Vec::new(),
            next_tag: 1,
        }
    }

    fn tag(&mut self) -> u8 {
        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1).max(1);
        tag
    }

    fn alloc(&mut self, table: &ArpTable) {
        let client = *[Client::Lbg, Client::Vn, Client::Acl]
            .choose(&mut self.rng)
            .unwrap();
        let length = self.rng.gen_range(1..=12);
        let options = if self.rng.gen_bool(0.05) {
            BlockOptions::DO_NOT_MOVE
        } else {
            BlockOptions::NONE
        };
        match table.alloc_block(client, length, options, 0) {
            Ok(handle) => {
                let tag = self.tag();
                table.write_entry(client, handle, 0, &arp(tag)).unwrap();
                self.blocks.insert(handle, (client, tag));
            }
            Err(NhdError::NoFreeResources(_)) => {}
            Err(e) => panic!("unexpected allocation failure: {e}"),
        }
    }

    fn free(&mut self, table: &ArpTable) {
        let handles: Vec<_> = self.blocks.keys().copied().collect();
        if let Some(handle) = handles.choose(&mut self.rng) {
            let (client, _) = self.blocks.remove(handle).unwrap();
            table.free_block(client, *handle).unwrap();
        }
    }

    fn group_op(&mut self, table: &ArpTable) {
        if self.groups.is_empty() || self.rng.gen_bool(0.1) {
            let id = table.create_group(GroupType::NormalUnicast).unwrap();
            self.groups.push((id, Vec::new()));
            return;
        }
        let idx = self.rng.gen_range(0..self.groups.len());
        let grow = self.rng.gen_bool(0.6);
        let tag = self.tag();
        let (id, members) = &mut self.groups[idx];
        if grow {
            match table.add_next_hops(*id, &[hop(tag)]) {
                Ok(()) => members.push(tag),
                Err(NhdError::NoFreeResources(_)) => {}
                Err(e) => panic!("unexpected failure growing group: {e}"),
            }
        } else if !members.is_empty() {
            // Tags can repeat once they wrap, and a delete removes the first
            // matching next hop, so the oldest member is the one to go
            let victim = members.remove(0);
            table.delete_next_hops(*id, &[hop(victim)]).unwrap();
        } else {
            table.delete_group(*id).unwrap();
            self.groups.remove(idx);
        }
    }

    fn check(&self, table: &ArpTable) {
        table.verify().unwrap();
        for (handle, (client, tag)) in &self.blocks {
            let data = table.read_entry(*client, *handle, 0).unwrap();
            assert_eq!(data, arp(*tag), "block {handle} lost its contents");
        }
        for (id, members) in &self.groups {
            let entries = table.group_next_hops(*id).unwrap();
            let data: Vec<_> = entries.iter().map(|e| e.data).collect();
            let expected: Vec<_> = members.iter().map(|t| arp(*t)).collect();
            assert_eq!(data, expected, "group {id} lost next hops");
        }
    }
}

#[test]
fn test_random_workload() {
    let mut config = small_config(256, 16);
    config.defrag.proactive = true;
    let table = new_table(&config);

    for seed in 0..4 {
        let mut w = Workload::new(seed);
        for _ in 0..400 {
            match w.rng.gen_range(0..10) {
                0..=3 => w.alloc(&table),
                4..=6 => w.free(&table),
                7..=8 => w.group_op(&table),
                _ => {
                    let report = table.compact();
                    assert!(report.steps <= config.defrag.max_steps);
                }
            }
            w.check(&table);
        }

        // Tear everything down again; the table must end up empty
        for (handle, (client, _)) in std::mem::take(&mut w.blocks) {
            table.free_block(client, handle).unwrap();
        }
        for (id, members) in std::mem::take(&mut w.groups) {
            if !members.is_empty() {
                let hops: Vec<_> = members.iter().map(|t| hop(*t)).collect();
                table.delete_next_hops(id, &hops).unwrap();
            }
            table.delete_group(id).unwrap();
        }
        let summary = table.summary();
        assert_eq!(summary.used_entries, 0);
        assert_eq!(summary.free_extents, 1);
        table.verify().unwrap();
    }
}

// Every move a client hears about leaves it knowing where its blocks are.
#[test]
fn test_moves_track_offsets() {
    let table = new_table(&small_config(128, 8));
    let moves = record_moves(&table, Client::Lbg);
    let mut rng = StdRng::seed_from_u64(42);
    let mut known: BTreeMap<BlockHandle, u32> = BTreeMap::new();

    for _ in 0..300 {
        if known.is_empty() || rng.gen_bool(0.55) {
            let length = rng.gen_range(1..=8);
            if let Ok(handle) =
                table.alloc_block(Client::Lbg, length, BlockOptions::NONE, 0)
            {
                known.insert(handle, offset_of(&table, handle));
            }
        } else {
            let handles: Vec<_> = known.keys().copied().collect();
            let handle = *handles.choose(&mut rng).unwrap();
            table.free_block(Client::Lbg, handle).unwrap();
            known.remove(&handle);
        }
        if rng.gen_bool(0.1) {
            table.compact();
        }

        for (_, mv) in moves.lock().unwrap().drain(..) {
            if let Some(offset) = known.get_mut(&mv.handle) {
                assert_eq!(*offset, mv.old_offset);
                *offset = mv.new_offset;
            }
        }
        for (handle, offset) in &known {
            assert_eq!(offset_of(&table, *handle), *offset);
        }
    }
}

// The histograms are rebuilt from scratch whenever the aging counter wraps,
// and must agree with the incrementally maintained ones.
#[test]
fn test_histograms_after_aging() {
    let table = new_table(&small_config(512, 16));
    let mut rng = StdRng::seed_from_u64(7);
    let mut live = Vec::new();

    for _ in 0..600 {
        if live.is_empty() || rng.gen_bool(0.6) {
            let length = rng.gen_range(1..=40);
            if let Ok(h) =
                table.alloc_block(Client::Vn, length, BlockOptions::NONE, 0)
            {
                live.push(h);
            }
        } else {
            let idx = rng.gen_range(0..live.len());
            table.free_block(Client::Vn, live.swap_remove(idx)).unwrap();
        }
    }
    table.verify().unwrap();

    let summary = table.summary();
    let blocks = table.blocks(None);
    let expected =
        Histogram::from_lengths(blocks.iter().map(|b| b.length));
    let counts: Vec<u32> =
        summary.alloc_histogram.iter().map(|b| b.count).collect();
    assert_eq!(counts, expected.counts().to_vec());
    assert_eq!(expected.total() as usize, blocks.len());

    let free: u32 = summary.free_histogram.iter().map(|b| b.count).sum();
    assert_eq!(free as usize, summary.free_extents);
}
