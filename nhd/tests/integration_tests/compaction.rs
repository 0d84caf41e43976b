// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use pretty_assertions::assert_eq;

use nhd::{BlockOptions, Client, CompactionOutcome, MovePhase};

use super::common::*;

#[test]
fn test_compact_empty() {
    let table = new_table(&small_config(32, 4));
    let report = table.compact();
    assert_eq!(report.outcome, CompactionOutcome::Complete);
    assert_eq!(report.moves, 0);
    assert_eq!(report.steps, 0);
}

// A block that can only slide down into rows it already occupies goes by
// way of the staging region.
#[test]
fn test_staged_slide() {
    let table = new_table(&small_config(32, 4));
    let moves = record_moves(&table, Client::Vn);

    let a = alloc(&table, Client::Vn, 2);
    let b = alloc(&table, Client::Vn, 4);
    for i in 0..4 {
        table.write_entry(Client::Vn, b, i, &arp(i as u8 + 10)).unwrap();
    }
    table.free_block(Client::Vn, a).unwrap();

    let report = table.compact();
    assert_eq!(report.outcome, CompactionOutcome::Complete);
    assert_eq!(report.moves, 1);

    let seen: Vec<_> = moves
        .lock()
        .unwrap()
        .iter()
        .map(|(_, mv)| (mv.old_offset, mv.new_offset, mv.phase))
        .collect();
    assert_eq!(
        seen,
        vec![(3, 28, MovePhase::Intermediate), (28, 1, MovePhase::Final)]
    );

    // The rows came along, and the block carries no leftover swap flags
    let info = table.block_info(b).unwrap();
    assert_eq!(info.offset, 1);
    assert_eq!(info.flags, BlockOptions::NONE);
    for i in 0..4 {
        assert_eq!(
            table.read_entry(Client::Vn, b, i).unwrap(),
            arp(i as u8 + 10)
        );
    }
    table.verify().unwrap();
}

// Blocks larger than the staging region can't slide over themselves, but a
// direct move into a big enough hole is still possible.
#[test]
fn test_large_block_moves_direct() {
    let table = new_table(&small_config(32, 2));
    let moves = record_moves(&table, Client::Lbg);

    let a = alloc(&table, Client::Lbg, 6);
    let b = alloc(&table, Client::Lbg, 3);
    let c = alloc(&table, Client::Lbg, 5);
    table.free_block(Client::Lbg, a).unwrap();

    let report = table.compact();
    assert_eq!(report.outcome, CompactionOutcome::Complete);
    assert_eq!(offset_of(&table, b), 1);
    // c (5 rows) can't be staged through 2 reserved rows, but after b moves
    // the hole below it is [4, 10), which doesn't overlap [10, 15)
    assert_eq!(offset_of(&table, c), 4);
    assert_eq!(offsets(&moves), vec![(7, 1), (10, 4)]);
    table.verify().unwrap();
}

#[test]
fn test_pinned_block_complete() {
    let table = new_table(&small_config(32, 4));
    let moves = record_moves(&table, Client::Lbg);

    let a = alloc(&table, Client::Lbg, 2);
    let p = table
        .alloc_block(Client::Lbg, 2, BlockOptions::DO_NOT_MOVE, 0)
        .unwrap();
    let d = alloc(&table, Client::Lbg, 2);
    table.free_block(Client::Lbg, a).unwrap();

    let report = table.compact();
    assert_eq!(report.outcome, CompactionOutcome::Complete);
    assert_eq!(offset_of(&table, p), 3);
    assert_eq!(offset_of(&table, d), 1);
    assert_eq!(offsets(&moves), vec![(5, 1)]);
    assert_eq!(report.defrag_stages, 1);
    table.verify().unwrap();
}

#[test]
fn test_pinned_block_partial() {
    let table = new_table(&small_config(32, 4));

    let a = alloc(&table, Client::Lbg, 3);
    let p = table
        .alloc_block(Client::Lbg, 2, BlockOptions::DO_NOT_MOVE, 0)
        .unwrap();
    let c = alloc(&table, Client::Lbg, 4);
    let d = alloc(&table, Client::Lbg, 2);
    table.free_block(Client::Lbg, a).unwrap();

    let report = table.compact();
    // d fills most of the hole below p; the single row left over can't be
    // filled by anything
    assert_eq!(report.outcome, CompactionOutcome::Partial);
    assert_eq!(report.moves, 1);
    assert!(!report.budget_exhausted);
    assert_eq!(offset_of(&table, p), 4);
    assert_eq!(offset_of(&table, c), 6);
    assert_eq!(offset_of(&table, d), 1);

    let extents = table.free_extents();
    assert_eq!(extents.len(), 2);
    assert_eq!((extents[0].offset, extents[0].length), (3, 1));
    assert_eq!((extents[1].offset, extents[1].length), (10, 18));
    table.verify().unwrap();
}

#[test]
fn test_step_budget() {
    let mut config = small_config(64, 4);
    config.defrag.max_steps = 3;
    let table = new_table(&config);

    // Alternate kept and freed blocks, leaving a hole below every survivor
    let mut kept = Vec::new();
    let mut gaps = Vec::new();
    for _ in 0..8 {
        gaps.push(alloc(&table, Client::Lbg, 2));
        kept.push(alloc(&table, Client::Lbg, 2));
    }
    for gap in gaps {
        table.free_block(Client::Lbg, gap).unwrap();
    }

    let report = table.compact();
    assert!(report.steps <= 3);
    assert!(report.budget_exhausted);
    assert_eq!(report.outcome, CompactionOutcome::Partial);
    table.verify().unwrap();

    // Enough further passes will always finish the job
    let mut passes = 0;
    while table.compact().outcome != CompactionOutcome::Complete {
        passes += 1;
        assert!(passes < 10);
        table.verify().unwrap();
    }
    for (idx, handle) in kept.iter().enumerate() {
        assert_eq!(offset_of(&table, *handle), 1 + 2 * idx as u32);
    }
}

// A failing handler is logged and skipped; the move goes ahead regardless.
#[test]
fn test_failed_handler() {
    struct Broken;

    impl nhd::MoveHandler for Broken {
        fn block_moved(&mut self, _: &nhd::BlockMove) -> anyhow::Result<()> {
            anyhow::bail!("refusing to move")
        }
    }

    let table = new_table(&small_config(32, 4));
    table.set_move_handler(Client::Lbg, Box::new(Broken)).unwrap();
    let a = alloc(&table, Client::Lbg, 6);
    let b = alloc(&table, Client::Lbg, 2);
    table.free_block(Client::Lbg, a).unwrap();

    let report = table.compact();
    assert_eq!(report.outcome, CompactionOutcome::Complete);
    assert_eq!(offset_of(&table, b), 1);
    let summary = table.summary();
    assert_eq!(summary.failed_notifications, 1);
    assert_eq!(summary.notifications, 0);

    table.clear_move_handler(Client::Lbg).unwrap();
    assert!(table
        .set_move_handler(Client::Ecmp, Box::new(Broken))
        .is_err());
}

// Every client bound to a moved block hears about it, in binding order.
#[test]
fn test_observers_notified() {
    let table = new_table(&small_config(32, 4));
    let lbg = record_moves(&table, Client::Lbg);
    let acl = record_moves(&table, Client::Acl);

    let a = alloc(&table, Client::Lbg, 4);
    let b = alloc(&table, Client::Lbg, 3);
    let _c = alloc(&table, Client::Lbg, 3);
    table.register_block_client(b, Client::Acl).unwrap();
    table.free_block(Client::Lbg, a).unwrap();

    table.compact();
    assert_eq!(offsets(&lbg), vec![(5, 1), (8, 4)]);
    assert_eq!(offsets(&acl), vec![(5, 1)]);
    let (_, mv) = acl.lock().unwrap()[0];
    assert_eq!(mv.handle, b);
    assert_eq!(mv.length, 3);
}
