// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use thiserror::Error;

/// A register address, in units of 32-bit words.
pub type RegAddr = u32;

/// A specialized Result type for ASIC operations
pub type AsicResult<T> = Result<T, AsicError>;

/// Error type conveying additional information about ASIC errors
#[derive(Error, Debug)]
pub enum AsicError {
    /// An argument passed to the ASIC layer is invalid or inappropriate.  This
    /// indicates misbehavior from the caller.
    #[error("Invalid argument: {}", .0)]
    InvalidArg(String),
    /// An Asic function was called before the ASIC layer was properly
    /// initialized.  Indicates misbehavior from the caller.
    #[error("ASIC layer uninitialized: {}", .0)]
    Uninitialized(String),
    /// This operation is unsupported by the ASIC model being used
    #[error("Operation unsupported by the ASIC")]
    OperationUnsupported,
    /// The ASIC layer detected some internal inconsistency
    #[error("Internal error: {}",.0)]
    Internal(String),
    /// The sibling replication table has no room for another entry
    #[error("Replication table full")]
    ReplicationFull,
    /// An error derived from a purposely triggered synthetic fault for testing
    /// purposes.
    #[error("Synthetic ASIC error: {}", .0)]
    Synthetic(String),
    /// A general indication that a caller is trying to modify something that
    /// is not present.
    #[error("Missing: {}", .0)]
    Missing(String),
}

/// The `RegisterOps` trait is the raw register I/O layer.  Every call is
/// atomic with respect to other register accesses, and callers are expected
/// to already hold whatever lock serializes access to the device.
pub trait RegisterOps {
    /// Read a single 32-bit word.
    fn read_word(&self, addr: RegAddr) -> AsicResult<u32>;

    /// Write a single 32-bit word.
    fn write_word(&self, addr: RegAddr, word: u32) -> AsicResult<()>;

    /// Read `words.len()` consecutive words starting at `addr`.  This is used
    /// to fetch a multi-word table row in one operation.
    fn read_words(&self, addr: RegAddr, words: &mut [u32]) -> AsicResult<()>;

    /// Write `words.len()` consecutive words starting at `addr`.
    fn write_words(&self, addr: RegAddr, words: &[u32]) -> AsicResult<()>;

    /// Read-modify-write the bits selected by `mask`.
    fn mask_word(
        &self,
        addr: RegAddr,
        mask: u32,
        value: u32,
    ) -> AsicResult<()> {
        let old = self.read_word(addr)?;
        self.write_word(addr, (old & !mask) | (value & mask))
    }
}

/// Where a replication-table entry sends traffic: a contiguous range of rows
/// in the next-hop table, or a single glort.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum McTarget {
    Index { base: u32, count: u32 },
    Glort(u64),
}

/// The narrow contract with the sibling multicast replication table.  The
/// replication table's own allocator is managed elsewhere; all we can do is
/// ask for an entry that points at our current location and give it back
/// when we are done with it.
pub trait ReplicationOps {
    /// Reserve a replication entry on behalf of `group`, aimed at `target`.
    /// Returns the destination index of the new entry.
    fn mc_entry_reserve(&self, group: u32, target: McTarget)
        -> AsicResult<u32>;

    /// Release a previously reserved replication entry.
    fn mc_entry_free(&self, dest: u32) -> AsicResult<()>;
}
