// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::path::PathBuf;

use pretty_assertions::assert_eq;

use nhd::script::{self, Script};
use nhd::{CompactionOutcome, GroupType};

use super::common::*;

#[test]
fn test_demo_script() {
    let path: PathBuf =
        [env!("CARGO_MANIFEST_DIR"), "scripts", "demo.toml"].iter().collect();
    let script = Script::load(&path).unwrap();
    let table = new_table(&small_config(64, 8));

    let report = script::run(&test_log(), &table, &script);
    assert_eq!(report.steps, script.steps.len());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].op, "delete_group");
    assert_eq!(report.compactions.len(), 1);
    table.verify().unwrap();

    let groups = table.groups();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].group_type, GroupType::NormalUnicast);
    assert_eq!(groups[0].active, 3);
    assert_eq!(groups[1].group_type, GroupType::NormalMulticast);
    assert!(groups[1].mc_dest.is_some());
}

#[test]
fn test_replay_failures() {
    let script = Script::parse(
        r#"
        [[step]]
        op = "create_group"
        name = "a"
        group_type = "normal_unicast"

        [[step]]
        op = "create_group"
        name = "a"
        group_type = "normal_unicast"

        [[step]]
        op = "add_next_hops"
        group = "b"
        next_hops = [ { mac = "a8:40:25:00:00:01", port = 1 } ]

        [[step]]
        op = "add_next_hops"
        group = "a"
        next_hops = [ { mac = "a8:40:25:00:00:01", vlan = 1, port = 1 } ]

        [[step]]
        op = "alloc_block"
        name = "x"
        client = "vn"
        length = 3

        [[step]]
        op = "free_block"
        name = "x"

        [[step]]
        op = "free_block"
        name = "x"

        [[step]]
        op = "compact"
        "#,
    )
    .unwrap();
    let table = new_table(&small_config(64, 8));
    let report = script::run(&test_log(), &table, &script);

    let failed: Vec<_> = report
        .failures
        .iter()
        .map(|f| (f.step, f.op))
        .collect();
    assert_eq!(
        failed,
        vec![
            (1, "create_group"),
            (2, "add_next_hops"),
            (3, "add_next_hops"),
            (6, "free_block"),
        ]
    );
    assert_eq!(report.compactions[0].outcome, CompactionOutcome::Complete);
    assert_eq!(table.summary().groups, 1);
    assert_eq!(table.summary().used_entries, 0);
}
