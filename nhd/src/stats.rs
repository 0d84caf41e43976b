// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Usage statistics for the table: size-bucketed histograms of allocated
//! blocks and free extents, plus running operation counters.

use serde::Serialize;

pub const HISTOGRAM_BUCKETS: usize = 8;

// Upper bound (inclusive) of each bucket but the last.
const BUCKET_LIMITS: [u32; HISTOGRAM_BUCKETS - 1] = [1, 2, 4, 8, 16, 64, 256];
const BUCKET_LABELS: [&str; HISTOGRAM_BUCKETS] =
    ["1", "2", "3-4", "5-8", "9-16", "17-64", "65-256", "257+"];

/// Counts of regions, bucketed by length.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Histogram {
    counts: [u32; HISTOGRAM_BUCKETS],
}

impl Histogram {
    pub fn bucket_for(len: u32) -> usize {
        BUCKET_LIMITS
            .iter()
            .position(|limit| len <= *limit)
            .unwrap_or(HISTOGRAM_BUCKETS - 1)
    }

    pub fn label(bucket: usize) -> &'static str {
        BUCKET_LABELS[bucket]
    }

    pub fn from_lengths(lengths: impl Iterator<Item = u32>) -> Self {
        let mut h = Histogram::default();
        lengths.for_each(|len| h.add(len));
        h
    }

    pub fn add(&mut self, len: u32) {
        self.counts[Self::bucket_for(len)] += 1;
    }

    pub fn remove(&mut self, len: u32) {
        let bucket = Self::bucket_for(len);
        self.counts[bucket] = self.counts[bucket].saturating_sub(1);
    }

    pub fn counts(&self) -> &[u32; HISTOGRAM_BUCKETS] {
        &self.counts
    }

    pub fn total(&self) -> u32 {
        self.counts.iter().sum()
    }
}

/// Running counters for a single table instance.
#[derive(Clone, Debug, Default, Serialize)]
pub struct TableStats {
    pub alloc_hist: Histogram,
    pub allocs: u64,
    pub frees: u64,
    pub failed_allocs: u64,
    pub moves: u64,
    pub compactions: u64,
    pub reconciles: u64,
    #[serde(skip)]
    aging: u8,
}

impl TableStats {
    /// Advance the aging counter.  Returns true once every 256 operations,
    /// at which point the caller should recompute the histograms from
    /// scratch.
    pub fn tick(&mut self) -> bool {
        self.aging = self.aging.wrapping_add(1);
        self.aging == 0
    }

    pub fn record_alloc(&mut self, len: u32) {
        self.allocs += 1;
        self.alloc_hist.add(len);
    }

    pub fn record_free(&mut self, len: u32) {
        self.frees += 1;
        self.alloc_hist.remove(len);
    }
}
