// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Configuration for the table manager.  Everything can be loaded from a
//! TOML file, and anything missing from the file takes its default value.

use std::path::Path;

use serde::{Deserialize, Serialize};

use aal::RegAddr;
use asic::AsicConfig;
use common::logging::LogFormat;

use crate::ecmp::NEXTHOP_WORDS;
use crate::types::{NhdError, NhdResult};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// If set, where the log should be written.  If not set, the log goes to
    /// stdout.
    pub log_file: Option<String>,

    /// Output log info in unstructured text or json?
    pub log_format: LogFormat,

    /// Shape of the table and where it lives in the device's address space.
    pub table: TableConfig,

    /// Tuning for the compaction engine.
    pub defrag: DefragConfig,

    /// Policy for ECMP group blocks.
    pub ecmp: EcmpConfig,

    /// Asic/platform-specific config settings.
    pub asic: AsicConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> NhdResult<Config> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            NhdError::Config(format!("reading {}: {e}", path.display()))
        })?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> NhdResult<()> {
        self.table.validate()?;
        self.defrag.validate()?;
        self.ecmp.validate()
    }
}

/// Table geometry.  Slot 0 is never handed out, and the top `reserved` slots
/// are held back as a staging area for compaction, so the allocatable region
/// is `[1, size - reserved)`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TableConfig {
    /// Total number of rows in the table
    pub size: u32,
    /// Rows at the top of the table set aside for staged moves
    pub reserved: u32,
    /// 32-bit words per row
    pub entry_words: u32,
    /// Register address of row 0
    pub table_base: RegAddr,
    /// Register address of the first word of the per-row used bits
    pub used_base: RegAddr,
}

impl Default for TableConfig {
    fn default() -> Self {
        TableConfig {
            size: 16384,
            reserved: 64,
            entry_words: NEXTHOP_WORDS as u32,
            table_base: 0x10_0000,
            used_base: 0x20_0000,
        }
    }
}

impl TableConfig {
    pub fn capacity(&self) -> u32 {
        self.size - self.reserved - 1
    }

    /// First slot past the allocatable region
    pub fn available_end(&self) -> u32 {
        self.size - self.reserved
    }

    pub fn staging_base(&self) -> u32 {
        self.size - self.reserved
    }

    pub fn row_addr(&self, slot: u32) -> RegAddr {
        self.table_base + slot * self.entry_words
    }

    /// The used-bit word and mask covering `slot`
    pub fn used_bit(&self, slot: u32) -> (RegAddr, u32) {
        (self.used_base + slot / 32, 1 << (slot % 32))
    }

    pub fn validate(&self) -> NhdResult<()> {
        if self.size <= self.reserved + 1 {
            return Err(NhdError::Config(format!(
                "table of {} rows leaves no room after {} reserved",
                self.size, self.reserved
            )));
        }
        if (self.entry_words as usize) < NEXTHOP_WORDS {
            return Err(NhdError::Config(format!(
                "rows must be at least {NEXTHOP_WORDS} words"
            )));
        }
        let table_words = self
            .size
            .checked_mul(self.entry_words)
            .and_then(|w| w.checked_add(self.table_base))
            .ok_or_else(|| NhdError::Config("table too large".into()))?;
        let used_end = self.used_base + self.size.div_ceil(32);
        if self.table_base < used_end && self.used_base < table_words {
            return Err(NhdError::Config(
                "table rows overlap the used-bit region".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DefragConfig {
    /// Upper bound on relocation attempts in a single compaction
    pub max_steps: u32,
    /// Upper bound on packing passes
    pub packing_stages: u32,
    /// Upper bound on hole-filling passes
    pub defrag_stages: u32,
    /// How many times a hole may be split while filling it
    pub max_depth: u32,
    /// An allocation that fails while usage is below
    /// threshold_num/threshold_den of capacity triggers a compaction and a
    /// retry.  Proactive compaction kicks in above the same level.
    pub threshold_num: u32,
    pub threshold_den: u32,
    /// Compact after any allocation that leaves usage above the threshold
    /// with fragmented free space.
    pub proactive: bool,
}

impl Default for DefragConfig {
    fn default() -> Self {
        DefragConfig {
            max_steps: 1000,
            packing_stages: 128,
            defrag_stages: 16,
            max_depth: 32,
            threshold_num: 2,
            threshold_den: 3,
            proactive: true,
        }
    }
}

impl DefragConfig {
    /// Is `used` of `capacity` strictly below the threshold?
    pub fn below_threshold(&self, used: u32, capacity: u32) -> bool {
        (used as u64) * (self.threshold_den as u64)
            < (capacity as u64) * (self.threshold_num as u64)
    }

    pub fn validate(&self) -> NhdResult<()> {
        if self.threshold_num == 0
            || self.threshold_den == 0
            || self.threshold_num > self.threshold_den
        {
            return Err(NhdError::Config(format!(
                "invalid usage threshold {}/{}",
                self.threshold_num, self.threshold_den
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EcmpConfig {
    /// Largest group that may use an arbitrary (non-power-of-two) path
    /// count.  Groups larger than this have their blocks rounded up to the
    /// next power of two.
    pub max_arbitrary_paths: u32,
}

impl Default for EcmpConfig {
    fn default() -> Self {
        EcmpConfig {
            max_arbitrary_paths: 4096,
        }
    }
}

impl EcmpConfig {
    /// The block length used to hold `count` next hops.
    pub fn block_length(&self, count: u32) -> u32 {
        if count <= self.max_arbitrary_paths || count.is_power_of_two() {
            count
        } else {
            count.next_power_of_two()
        }
    }

    pub fn validate(&self) -> NhdResult<()> {
        if self.max_arbitrary_paths == 0 {
            return Err(NhdError::Config(
                "max_arbitrary_paths must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
