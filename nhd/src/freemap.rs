// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The free-space tracker for a table: an exact partition of the allocatable
//! region into maximal free extents.  Adjacent free extents never coexist, as
//! every release coalesces with its neighbors, so the number of extents is a
//! direct measure of fragmentation.
use std::cmp::Ord;
use std::cmp::Ordering;
use std::collections::BTreeMap;

use slog::debug;
use slog::trace;

use crate::stats::Histogram;
use crate::types::NhdError;
use crate::types::NhdResult;

/// A Span represents a contiguous range of slots, where the range is closed
/// on the bottom and open on the top.  In other words, a Span{1,4} will include
/// 1, 2, and 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    low: u32,
    high: u32,
}

impl Span {
    fn new(low: u32, high: u32) -> Self {
        Span { low, high }
    }

    fn size(&self) -> u32 {
        self.high - self.low
    }

    // Split a span into two smaller spans.  The original span will be truncated
    // at the split point and the returned span will include the split point and
    // everything above it.
    fn split_off(&mut self, split: u32) -> Option<Span> {
        if split >= self.size() {
            None
        } else {
            let new_span = Span::new(self.low + split, self.high);
            self.high = self.low + split;
            Some(new_span)
        }
    }
}

impl PartialOrd for Span {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Spans in a FreeMap never overlap, so ordering them by position is well
// defined.  Overlapping spans compare as Equal.
impl Ord for Span {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.high <= other.low {
            Ordering::Less
        } else if self.low >= other.high {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }
}

pub struct FreeMap {
    log: slog::Logger,
    // Bounds of the managed range
    low: u32,
    high: u32,
    // Free spans, keyed by their low slot
    spans: BTreeMap<u32, Span>,
    // Total number of free slots across all spans
    free: u32,
    // Free-extent histogram, maintained incrementally
    hist: Histogram,
}

impl FreeMap {
    /// Create a map managing `[low, high)`, initially all free.
    pub fn new(
        log: &slog::Logger,
        name: impl ToString,
        low: u32,
        high: u32,
    ) -> Self {
        let unit = format!("freemap_{}", name.to_string());
        let log = log.new(slog::o!("unit" => unit));
        debug!(log, "created new freemap"; "low" => low, "high" => high);
        let mut map = FreeMap {
            log,
            low,
            high,
            spans: BTreeMap::new(),
            free: 0,
            hist: Histogram::default(),
        };
        map.reset();
        map
    }

    // Throw away all existing state and mark the whole range free.  It is the
    // caller's responsibility to forget any ranges allocated prior to a
    // reset().
    pub fn reset(&mut self) {
        debug!(self.log, "reset freemap");
        self.spans.clear();
        self.hist = Histogram::default();
        self.free = 0;
        if self.high > self.low {
            self.insert(Span::new(self.low, self.high));
        }
    }

    fn insert(&mut self, span: Span) {
        self.free += span.size();
        self.hist.add(span.size());
        self.spans.insert(span.low, span);
    }

    fn remove(&mut self, low: u32) -> Option<Span> {
        let span = self.spans.remove(&low)?;
        self.free -= span.size();
        self.hist.remove(span.size());
        Some(span)
    }

    fn check_bounds(&self, offset: u32, len: u32) -> NhdResult<()> {
        if len == 0 {
            Err(NhdError::InvalidArgument("empty range".into()))
        } else if offset < self.low
            || offset.checked_add(len).map_or(true, |end| end > self.high)
        {
            Err(NhdError::InvalidArgument(format!(
                "range [{offset}, +{len}) is outside [{}, {})",
                self.low, self.high
            )))
        } else {
            Ok(())
        }
    }

    // The free span containing `offset`, if any.
    fn containing(&self, offset: u32) -> Option<Span> {
        self.spans
            .range(..=offset)
            .next_back()
            .map(|(_, span)| *span)
            .filter(|span| span.high > offset)
    }

    pub fn capacity(&self) -> u32 {
        self.high - self.low
    }

    pub fn free_entries(&self) -> u32 {
        self.free
    }

    pub fn used_entries(&self) -> u32 {
        self.capacity() - self.free
    }

    /// Find a home for `len` slots: the smallest free extent that can hold
    /// it, with ties going to the lowest offset.  Nothing is claimed; the
    /// caller follows up with mark_used().
    pub fn find_free_extent(&self, len: u32) -> Option<u32> {
        if len == 0 {
            return None;
        }
        let mut best: Option<Span> = None;
        for span in self.spans.values() {
            if span.size() < len {
                continue;
            }
            if span.size() == len {
                return Some(span.low);
            }
            if best.map_or(true, |b| span.size() < b.size()) {
                best = Some(*span);
            }
        }
        best.map(|span| span.low)
    }

    /// Remove `[offset, offset + len)` from the free set.  The range must lie
    /// entirely within a single free extent.
    pub fn mark_used(&mut self, offset: u32, len: u32) -> NhdResult<()> {
        self.check_bounds(offset, len)?;
        let Some(span) = self.containing(offset) else {
            return Err(NhdError::InvalidArgument(format!(
                "slot {offset} is not free"
            )));
        };
        if span.high < offset + len {
            return Err(NhdError::InvalidArgument(format!(
                "range [{offset}, +{len}) is not entirely free"
            )));
        }

        let mut lower = self.remove(span.low).unwrap_or(span);
        let upper = lower.split_off(offset - lower.low);
        if lower.low < offset {
            self.insert(lower);
        }
        // offset lies within the span, so the split always yields an upper half
        if let Some(mut used) = upper {
            if let Some(rest) = used.split_off(len) {
                self.insert(rest);
            }
        }
        trace!(self.log, "marked used"; "offset" => offset, "len" => len);
        Ok(())
    }

    /// Return `[offset, offset + len)` to the free set, coalescing it with any
    /// free neighbors.  Releasing a range that is already partly free is an
    /// error and leaves the map unchanged.
    pub fn mark_free(&mut self, offset: u32, len: u32) -> NhdResult<()> {
        self.check_bounds(offset, len)?;
        let end = offset + len;
        if let Some((_, prev)) = self.spans.range(..end).next_back() {
            if prev.high > offset {
                return Err(NhdError::InvalidArgument(format!(
                    "range [{offset}, +{len}) overlaps free extent {prev:?}"
                )));
            }
        }

        let mut span = Span::new(offset, end);
        if let Some(prev) = self.extent_below(offset) {
            if let Some(prev) = self.remove(prev.0) {
                span.low = prev.low;
            }
        }
        if let Some(next) = self.remove(end) {
            span.high = next.high;
        }
        trace!(self.log, "freed"; "offset" => offset, "len" => len,
            "extent" => ?span);
        self.insert(span);
        Ok(())
    }

    pub fn is_free(&self, offset: u32, len: u32) -> bool {
        self.containing(offset)
            .map_or(false, |span| span.high >= offset.saturating_add(len))
    }

    /// The free extent, as (offset, length), ending exactly at `offset`.
    pub fn extent_below(&self, offset: u32) -> Option<(u32, u32)> {
        self.spans
            .range(..offset)
            .next_back()
            .map(|(_, span)| *span)
            .filter(|span| span.high == offset)
            .map(|span| (span.low, span.size()))
    }

    /// The free extent, as (offset, length), containing `offset`.
    pub fn extent_containing(&self, offset: u32) -> Option<(u32, u32)> {
        self.containing(offset).map(|span| (span.low, span.size()))
    }

    /// The lowest offset at or above `floor` where `len` free slots fit
    /// entirely below `limit`.
    pub fn lowest_fit_below(
        &self,
        limit: u32,
        len: u32,
        floor: u32,
    ) -> Option<u32> {
        for span in self.spans.values() {
            if span.low >= limit {
                break;
            }
            let start = span.low.max(floor);
            let end = span.high.min(limit);
            if end >= start && end - start >= len {
                return Some(start);
            }
        }
        None
    }

    pub fn largest_free_extent(&self) -> u32 {
        self.spans.values().map(Span::size).max().unwrap_or(0)
    }

    /// The highest free extent, as (offset, length).
    pub fn last_extent(&self) -> Option<(u32, u32)> {
        self.spans
            .values()
            .next_back()
            .map(|span| (span.low, span.size()))
    }

    /// All free extents, as (offset, length), in ascending order.
    pub fn extents(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.spans.values().map(|span| (span.low, span.size()))
    }

    pub fn extent_count(&self) -> usize {
        self.spans.len()
    }

    pub fn histogram(&self) -> &Histogram {
        &self.hist
    }

    /// Recompute the free histogram from scratch.  Returns true if the
    /// incrementally maintained copy had drifted.
    pub fn rebuild_histogram(&mut self) -> bool {
        let fresh =
            Histogram::from_lengths(self.spans.values().map(Span::size));
        let drifted = fresh != self.hist;
        self.hist = fresh;
        drifted
    }
}

#[cfg(test)]
fn new_freemap(low: u32, high: u32) -> FreeMap {
    let log =
        common::logging::init("test", &None, common::logging::LogFormat::Human)
            .unwrap();
    FreeMap::new(&log, "test", low, high)
}

#[cfg(test)]
fn spans(map: &FreeMap) -> Vec<(u32, u32)> {
    map.extents().collect()
}

// sanity check the Ord implementation for span
#[test]
fn test_ordering() {
    let a = Span::new(0, 5);
    assert_eq!(a.size(), 5);
    let b = Span::new(5, 10);
    let c = Span::new(10, 15);

    assert!(a < b);
    assert!(a < c);
    assert!(b < c);
    assert!(c > a);
    assert_eq!(a.cmp(&Span::new(3, 4)), Ordering::Equal);
}

// sanity check the span-splitting code
#[test]
fn test_split() {
    // Split [0,1,2,3,4] into [0, 1, 2] and [3, 4]
    let mut a = Span::new(0, 5);
    assert_eq!(a.split_off(10), None);

    let high = a.split_off(3).unwrap();
    assert_eq!(a, Span::new(0, 3));
    assert_eq!(high, Span::new(3, 5));
}

#[test]
fn test_basic() -> anyhow::Result<()> {
    let mut map = new_freemap(1, 14);
    assert_eq!(map.capacity(), 13);

    let a = map.find_free_extent(4).unwrap();
    assert_eq!(a, 1);
    map.mark_used(a, 4)?;
    assert_eq!(spans(&map), vec![(5, 9)]);
    assert_eq!(map.used_entries(), 4);
    Ok(())
}

#[test]
fn test_mark_used_middle() -> anyhow::Result<()> {
    let mut map = new_freemap(0, 100);
    map.mark_used(10, 5)?;
    assert_eq!(spans(&map), vec![(0, 10), (15, 85)]);
    map.mark_used(95, 5)?;
    assert_eq!(spans(&map), vec![(0, 10), (15, 80)]);

    // Claiming a range that is already used must fail without side effects
    map.mark_used(12, 1).unwrap_err();
    map.mark_used(8, 4).unwrap_err();
    assert_eq!(spans(&map), vec![(0, 10), (15, 80)]);
    assert_eq!(map.free_entries(), 90);
    Ok(())
}

#[test]
fn test_coalesce() -> anyhow::Result<()> {
    let mut map = new_freemap(0, 30);
    map.mark_used(0, 30)?;
    assert_eq!(map.extent_count(), 0);

    map.mark_free(10, 5)?;
    map.mark_free(20, 5)?;
    assert_eq!(spans(&map), vec![(10, 5), (20, 5)]);

    // Filling the hole between two extents leaves a single one behind
    map.mark_free(15, 5)?;
    assert_eq!(spans(&map), vec![(10, 15)]);

    // Double-free and overlapping frees are rejected
    map.mark_free(12, 2).unwrap_err();
    map.mark_free(5, 6).unwrap_err();
    assert_eq!(spans(&map), vec![(10, 15)]);
    Ok(())
}

#[test]
fn test_best_fit() -> anyhow::Result<()> {
    let mut map = new_freemap(0, 64);
    map.mark_used(0, 64)?;
    map.mark_free(0, 8)?;
    map.mark_free(10, 3)?;
    map.mark_free(20, 4)?;
    map.mark_free(30, 3)?;

    // Smallest fit wins, and the lower of two equal fits
    assert_eq!(map.find_free_extent(3), Some(10));
    assert_eq!(map.find_free_extent(4), Some(20));
    assert_eq!(map.find_free_extent(5), Some(0));
    assert_eq!(map.find_free_extent(9), None);
    assert_eq!(map.largest_free_extent(), 8);
    Ok(())
}

#[test]
fn test_lowest_fit_below() -> anyhow::Result<()> {
    let mut map = new_freemap(0, 64);
    map.mark_used(0, 64)?;
    map.mark_free(2, 2)?;
    map.mark_free(10, 6)?;

    assert_eq!(map.lowest_fit_below(64, 2, 0), Some(2));
    assert_eq!(map.lowest_fit_below(64, 3, 0), Some(10));
    assert_eq!(map.lowest_fit_below(12, 3, 0), None);
    assert_eq!(map.lowest_fit_below(64, 2, 3), Some(10));
    assert_eq!(map.lowest_fit_below(64, 2, 12), Some(12));
    assert_eq!(map.extent_below(16), Some((10, 6)));
    assert_eq!(map.extent_below(15), None);
    Ok(())
}

#[test]
fn test_exhaustion() -> anyhow::Result<()> {
    let mut map = new_freemap(1, 129);

    let mut s = Vec::new();
    for _ in 0..128 {
        let idx = map.find_free_extent(1).expect("exhausted pool prematurely");
        map.mark_used(idx, 1)?;
        s.push(idx);
    }
    assert_eq!(map.find_free_extent(1), None);

    // Free in reverse order; everything should coalesce back into one extent
    while let Some(idx) = s.pop() {
        map.mark_free(idx, 1)?;
    }
    assert_eq!(spans(&map), vec![(1, 128)]);
    Ok(())
}

#[test]
fn test_histogram_tracks() -> anyhow::Result<()> {
    let mut map = new_freemap(0, 300);
    map.mark_used(0, 300)?;
    map.mark_free(0, 1)?;
    map.mark_free(5, 3)?;
    map.mark_free(10, 257)?;
    map.mark_used(12, 1)?;
    assert_eq!(map.histogram().counts(), &[1, 1, 1, 0, 0, 0, 1, 0]);
    assert!(!map.rebuild_histogram());
    Ok(())
}
