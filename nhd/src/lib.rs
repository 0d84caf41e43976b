// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Resource management for the switch's ARP / next-hop table.
//!
//! Clients (ECMP groups, load-balancing groups, virtual-network tunnel
//! endpoints) are handed contiguous blocks of table rows, identified by a
//! stable [`block::BlockHandle`] rather than by their position.  Blocks may be
//! relocated at any time by the compaction engine in [`defrag`]; every client
//! bound to a moved block is told about it before the table lock is dropped.
//! The [`ecmp`] module builds multi-path groups on top of those blocks.

mod alloc;
pub mod block;
pub mod config;
pub mod defrag;
pub mod ecmp;
pub mod freemap;
pub mod notify;
pub mod script;
pub mod stats;
pub mod table;
pub mod types;
pub mod views;

pub use block::{BlockHandle, BlockInfo, BlockOptions, Client};
pub use config::Config;
pub use defrag::{CompactionOutcome, CompactionReport};
pub use ecmp::{GroupId, GroupType, NextHop, NextHopData, UsedTarget};
pub use notify::{BlockMove, MoveHandler, MovePhase};
pub use table::ArpTable;
pub use types::{NhdError, NhdResult};
