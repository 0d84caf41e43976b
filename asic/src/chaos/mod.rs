// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use rand::random;
use serde::{Deserialize, Serialize};
use slog::Logger;

use aal::{
    AsicError, AsicResult, McTarget, RegAddr, RegisterOps, ReplicationOps,
};

use crate::stub;

/// Chaos that happens according to a probability.
#[derive(Default, Debug, Serialize, Deserialize, Copy, Clone)]
pub struct Chaos {
    /// A probability between 0.0 and 1.0
    pub value: f64,
}

impl Chaos {
    /// Create a new chaos value.
    pub fn new(value: f64) -> Self {
        let mut c = Self::default();
        c.set(value);
        c
    }

    /// Set the chaos value. Panics if value is outside the range [0.0, 1.0].
    pub fn set(&mut self, value: f64) {
        if !(0.0..=1.0).contains(&value) {
            panic!("probability out of range");
        }
        self.value = value;
    }

    /// Get the underlying chaos value.
    pub fn get(&self) -> f64 {
        self.value
    }

    /// Return a chaos error according to the underlying probability value.
    pub fn unfurled(&self, log: &Logger, message: &str) -> AsicResult<()> {
        if self.value >= random() {
            slog::error!(log, "chaos error: {}", message);
            return Err(AsicError::Synthetic(message.into()));
        }
        Ok(())
    }
}

/// The chaos ASIC config contains chaos values for each ASIC operation.  A
/// value of zero never fails.
#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AsicConfig {
    pub stub: stub::AsicConfig,
    pub read_word: Chaos,
    pub write_word: Chaos,
    pub read_words: Chaos,
    pub write_words: Chaos,
    pub mc_entry_reserve: Chaos,
    pub mc_entry_free: Chaos,
}

impl AsicConfig {
    /// Apply the same failure probability to every operation.
    pub fn uniform(v: f64) -> Self {
        Self {
            stub: stub::AsicConfig::default(),
            read_word: Chaos::new(v),
            write_word: Chaos::new(v),
            read_words: Chaos::new(v),
            write_words: Chaos::new(v),
            mc_entry_reserve: Chaos::new(v),
            mc_entry_free: Chaos::new(v),
        }
    }

    /// Only the write paths fail; reads always succeed.
    pub fn uniform_write(v: f64) -> Self {
        Self {
            write_word: Chaos::new(v),
            write_words: Chaos::new(v),
            ..Default::default()
        }
    }
}

/// The stub device, with each operation gated by a roll of the dice.
pub struct Handle {
    pub log: Logger,
    config: AsicConfig,
    inner: stub::StubHandle,
}

impl Handle {
    pub fn new(log: &Logger, config: &AsicConfig) -> AsicResult<Self> {
        let inner = stub::StubHandle::new(log, &config.stub)?;
        Ok(Handle {
            log: log.new(slog::o!("unit" => "asic_chaos")),
            config: config.clone(),
            inner,
        })
    }

    /// The underlying stub device, for inspection by tests.
    pub fn stub(&self) -> &stub::StubHandle {
        &self.inner
    }
}

impl RegisterOps for Handle {
    fn read_word(&self, addr: RegAddr) -> AsicResult<u32> {
        self.config.read_word.unfurled(&self.log, "read_word")?;
        self.inner.read_word(addr)
    }

    fn write_word(&self, addr: RegAddr, word: u32) -> AsicResult<()> {
        self.config.write_word.unfurled(&self.log, "write_word")?;
        self.inner.write_word(addr, word)
    }

    fn read_words(&self, addr: RegAddr, words: &mut [u32]) -> AsicResult<()> {
        self.config.read_words.unfurled(&self.log, "read_words")?;
        self.inner.read_words(addr, words)
    }

    fn write_words(&self, addr: RegAddr, words: &[u32]) -> AsicResult<()> {
        self.config.write_words.unfurled(&self.log, "write_words")?;
        self.inner.write_words(addr, words)
    }
}

impl ReplicationOps for Handle {
    fn mc_entry_reserve(
        &self,
        group: u32,
        target: McTarget,
    ) -> AsicResult<u32> {
        self.config
            .mc_entry_reserve
            .unfurled(&self.log, "mc_entry_reserve")?;
        self.inner.mc_entry_reserve(group, target)
    }

    fn mc_entry_free(&self, dest: u32) -> AsicResult<()> {
        self.config.mc_entry_free.unfurled(&self.log, "mc_entry_free")?;
        self.inner.mc_entry_free(dest)
    }
}
