// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use slog::{info, o, trace};

use aal::{AsicResult, McTarget, RegAddr, RegisterOps, ReplicationOps};

pub mod multicast;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AsicConfig {
    /// Number of entries in the emulated replication table
    pub mc_entries: u32,
}

impl Default for AsicConfig {
    fn default() -> Self {
        AsicConfig { mc_entries: 4096 }
    }
}

/// A software-only device.  Registers are a sparse word map, where anything
/// never written reads back as zero.
pub struct StubHandle {
    pub log: slog::Logger,
    regs: Mutex<BTreeMap<RegAddr, u32>>,
    mcast: Mutex<multicast::McEntryData>,
    writes: AtomicU64,
}

impl StubHandle {
    pub fn new(log: &slog::Logger, config: &AsicConfig) -> AsicResult<Self> {
        let log = log.new(o!("unit" => "asic_stub"));
        info!(log, "initialized stub asic";
            "mc_entries" => config.mc_entries);
        Ok(StubHandle {
            log,
            regs: Mutex::new(BTreeMap::new()),
            mcast: Mutex::new(multicast::init(config.mc_entries)),
            writes: AtomicU64::new(0),
        })
    }

    /// Number of register write operations issued so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Look up a replication entry by its destination index.
    pub fn mc_entry_get(&self, dest: u32) -> Option<multicast::McEntry> {
        self.mcast.lock().unwrap().get(dest)
    }

    /// Number of replication entries currently reserved.
    pub fn mc_entry_count(&self) -> usize {
        self.mcast.lock().unwrap().len()
    }
}

impl RegisterOps for StubHandle {
    fn read_word(&self, addr: RegAddr) -> AsicResult<u32> {
        Ok(*self.regs.lock().unwrap().get(&addr).unwrap_or(&0))
    }

    fn write_word(&self, addr: RegAddr, word: u32) -> AsicResult<()> {
        trace!(self.log, "write {addr:#x} <- {word:#x}");
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut regs = self.regs.lock().unwrap();
        if word == 0 {
            regs.remove(&addr);
        } else {
            regs.insert(addr, word);
        }
        Ok(())
    }

    fn read_words(&self, addr: RegAddr, words: &mut [u32]) -> AsicResult<()> {
        let regs = self.regs.lock().unwrap();
        for (i, w) in words.iter_mut().enumerate() {
            *w = *regs.get(&(addr + i as u32)).unwrap_or(&0);
        }
        Ok(())
    }

    fn write_words(&self, addr: RegAddr, words: &[u32]) -> AsicResult<()> {
        trace!(self.log, "write {addr:#x} <- {words:x?}");
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut regs = self.regs.lock().unwrap();
        for (i, w) in words.iter().enumerate() {
            let a = addr + i as u32;
            if *w == 0 {
                regs.remove(&a);
            } else {
                regs.insert(a, *w);
            }
        }
        Ok(())
    }
}

impl ReplicationOps for StubHandle {
    fn mc_entry_reserve(
        &self,
        group: u32,
        target: McTarget,
    ) -> AsicResult<u32> {
        let dest = self.mcast.lock().unwrap().reserve(group, target)?;
        trace!(self.log, "reserved mc entry {dest} for group {group}";
            "target" => ?target);
        Ok(dest)
    }

    fn mc_entry_free(&self, dest: u32) -> AsicResult<()> {
        trace!(self.log, "freeing mc entry {dest}");
        self.mcast.lock().unwrap().free(dest)
    }
}
