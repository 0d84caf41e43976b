// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Read-only snapshots of table state, for diagnostics.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::block::{BlockCtl, BlockHandle, BlockOptions, Client};
use crate::ecmp::{EcmpGroupInfo, GroupId, GroupType, PathCountType};
use crate::stats::{Histogram, HISTOGRAM_BUCKETS};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HistogramBucket {
    pub range: &'static str,
    pub count: u32,
}

impl HistogramBucket {
    pub fn from_histogram(h: &Histogram) -> Vec<HistogramBucket> {
        (0..HISTOGRAM_BUCKETS)
            .map(|bucket| HistogramBucket {
                range: Histogram::label(bucket),
                count: h.counts()[bucket],
            })
            .collect()
    }
}

/// A table-wide overview.
#[derive(Clone, Debug, Serialize)]
pub struct TableSummary {
    pub instance: u16,
    pub size: u32,
    pub reserved: u32,
    pub capacity: u32,
    pub free_entries: u32,
    pub used_entries: u32,
    pub usage_ratio: f64,
    pub first_free: Option<u32>,
    pub last_free: Option<u32>,
    pub largest_free_extent: u32,
    pub free_extents: usize,
    pub blocks: usize,
    pub groups: usize,
    pub blocks_per_client: BTreeMap<Client, usize>,
    pub alloc_histogram: Vec<HistogramBucket>,
    pub free_histogram: Vec<HistogramBucket>,
    pub allocs: u64,
    pub frees: u64,
    pub failed_allocs: u64,
    pub moves: u64,
    pub compactions: u64,
    pub notifications: u64,
    pub failed_notifications: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BlockView {
    pub handle: BlockHandle,
    pub offset: u32,
    pub length: u32,
    pub options: BlockOptions,
    pub clients: Vec<Client>,
    pub opaque: u64,
}

impl BlockView {
    pub(crate) fn new(handle: BlockHandle, ctl: &BlockCtl) -> Self {
        BlockView {
            handle,
            offset: ctl.offset,
            length: ctl.length,
            options: ctl.options,
            clients: ctl.clients().to_vec(),
            opaque: ctl.opaque,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct FreeExtentView {
    pub offset: u32,
    pub length: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GroupView {
    pub id: GroupId,
    pub group_type: GroupType,
    pub first: Option<u32>,
    pub last: Option<u32>,
    pub active: u32,
    pub path_count: Option<u32>,
    pub path_count_type: Option<PathCountType>,
    pub glort: Option<u64>,
    pub clients: Vec<Client>,
    pub mc_dest: Option<u32>,
}

impl From<EcmpGroupInfo> for GroupView {
    fn from(info: EcmpGroupInfo) -> Self {
        GroupView {
            id: info.id,
            group_type: info.group_type,
            first: info.index_range.map(|(first, _)| first),
            last: info.index_range.map(|(_, last)| last),
            active: info.active_count,
            path_count: info.path_count.map(|(count, _)| count),
            path_count_type: info.path_count.map(|(_, kind)| kind),
            glort: info.glort,
            clients: info.clients,
            mc_dest: info.mc_dest,
        }
    }
}
