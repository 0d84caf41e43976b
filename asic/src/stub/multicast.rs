// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::collections::BTreeMap;

use aal::{AsicError, AsicResult, McTarget};

/// A single entry in the emulated replication table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct McEntry {
    pub group: u32,
    pub target: McTarget,
}

/// An in-memory stand-in for the multicast replication table.  Destination
/// indexes are handed out lowest-first, and index 0 is never used.
pub struct McEntryData {
    size: u32,
    entries: BTreeMap<u32, McEntry>,
}

fn no_entry(dest: u32) -> AsicError {
    AsicError::Missing(format!("no such replication entry: {dest}"))
}

impl McEntryData {
    pub fn reserve(&mut self, group: u32, target: McTarget) -> AsicResult<u32> {
        // The first gap in the key sequence is the lowest free index.
        let mut dest = 1;
        for used in self.entries.keys() {
            if *used != dest {
                break;
            }
            dest += 1;
        }
        if dest >= self.size {
            return Err(AsicError::ReplicationFull);
        }
        self.entries.insert(dest, McEntry { group, target });
        Ok(dest)
    }

    pub fn free(&mut self, dest: u32) -> AsicResult<()> {
        match self.entries.remove(&dest) {
            Some(_) => Ok(()),
            None => Err(no_entry(dest)),
        }
    }

    pub fn get(&self, dest: u32) -> Option<McEntry> {
        self.entries.get(&dest).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn init(size: u32) -> McEntryData {
    McEntryData {
        size,
        entries: BTreeMap::new(),
    }
}
