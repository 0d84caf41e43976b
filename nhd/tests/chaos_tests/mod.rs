// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

// Run workloads against a device whose register writes fail at random.
// Operations may fail, but the table's bookkeeping must never come apart.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use asic::chaos::{AsicConfig, Chaos};
use nhd::{BlockHandle, BlockOptions, Client, GroupType, NhdError};

use crate::integration_tests::common::*;

fn tolerate(result: nhd::NhdResult<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(NhdError::Switch(_)) | Err(NhdError::NoFreeResources(_)) => false,
        Err(e) => panic!("unexpected error: {e}"),
    }
}

#[test]
fn test_compaction_under_write_failures() {
    let mut config = small_config(128, 8);
    config.asic = AsicConfig::uniform_write(0.2);
    let table = new_table(&config);
    let moves = record_moves(&table, Client::Lbg);
    let mut rng = StdRng::seed_from_u64(0xc4a05);
    let mut known: BTreeMap<BlockHandle, u32> = BTreeMap::new();

    for _ in 0..400 {
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
        if rng.gen_bool(0.2) {
            table.compact();
        }
        table.verify().unwrap();

        // A move that failed part way is never announced, so the client's
        // view stays in step with the table's
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

#[test]
fn test_groups_under_write_failures() {
    let mut config = small_config(128, 8);
    config.asic = AsicConfig::uniform_write(0.2);
    let table = new_table(&config);
    let mut rng = StdRng::seed_from_u64(0xec3b);
    let mut groups = Vec::new();
    let mut fillers = Vec::new();
    let mut tag = 0u8;

    for _ in 0..8 {
        let id = table.create_group(GroupType::NormalMulticast).unwrap();
        groups.push((id, Vec::<u8>::new()));
    }

    for _ in 0..400 {
        let (id, members) = groups.choose_mut(&mut rng).unwrap();
        match rng.gen_range(0..10) {
            0..=4 => {
                tag = tag.wrapping_add(1);
                if tolerate(table.add_next_hops(*id, &[hop(tag)])) {
                    members.push(tag);
                }
            }
            5..=6 if !members.is_empty() => {
                let victim = members[0];
                if tolerate(table.delete_next_hops(*id, &[hop(victim)])) {
                    members.remove(0);
                }
            }
            7 => {
                if let Ok(h) =
                    table.alloc_block(Client::Vn, 3, BlockOptions::NONE, 0)
                {
                    fillers.push(h);
                }
            }
            8 if !fillers.is_empty() => {
                let idx = rng.gen_range(0..fillers.len());
                let h = fillers.swap_remove(idx);
                table.free_block(Client::Vn, h).unwrap();
            }
            _ => {
                table.compact();
            }
        }
        table.verify().unwrap();

        for (id, members) in &groups {
            let info = table.group_info(*id).unwrap();
            assert_eq!(info.active_count as usize, members.len());
            assert_eq!(info.mc_dest.is_some(), !members.is_empty());
        }
    }

    // Emptying a group only clears rows, and a failed clear is just logged
    for (id, members) in groups {
        if !members.is_empty() {
            let hops: Vec<_> = members.iter().map(|t| hop(*t)).collect();
            table.delete_next_hops(id, &hops).unwrap();
        }
        table.delete_group(id).unwrap();
    }
    for h in fillers {
        table.free_block(Client::Vn, h).unwrap();
    }
    assert_eq!(table.summary().used_entries, 0);
    assert_eq!(stub(&table).mc_entry_count(), 0);
    table.verify().unwrap();
}

// A replication entry that can't be reserved fails the request outright,
// leaving nothing behind in the table.
#[test]
fn test_replication_reserve_failure() {
    let mut config = small_config(64, 4);
    config.asic = AsicConfig {
        mc_entry_reserve: Chaos::new(1.0),
        ..Default::default()
    };
    let table = new_table(&config);

    let mc = table.create_group(GroupType::NormalMulticast).unwrap();
    assert!(matches!(
        table.add_next_hops(mc, &hops(1..3)),
        Err(NhdError::Switch(_))
    ));
    let info = table.group_info(mc).unwrap();
    assert_eq!(info.block, None);
    assert_eq!(info.mc_dest, None);
    assert_eq!(info.active_count, 0);
    assert_eq!(table.summary().used_entries, 0);
    assert_eq!(stub(&table).mc_entry_count(), 0);
    table.verify().unwrap();

    // Unicast groups never touch the replication table
    let uc = table.create_group(GroupType::NormalUnicast).unwrap();
    table.add_next_hops(uc, &hops(1..3)).unwrap();
    table.add_next_hops(uc, &[hop(3)]).unwrap();
    assert_eq!(table.group_info(uc).unwrap().active_count, 3);
    table.delete_group(mc).unwrap();
    table.verify().unwrap();
}
