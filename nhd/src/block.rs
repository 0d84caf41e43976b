// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The block control store: the authoritative mapping from a stable block
//! handle to the block's current position in the table.
//!
//! Handles are never reused.  Each carries the instance number of the table
//! that issued it, so a handle presented to the wrong table, or one whose
//! block has already been released, is always caught.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::BitOr;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::types::{NhdError, NhdResult};

/// The most clients that may be bound to a single block.
pub const MAX_BLOCK_CLIENTS: usize = 4;

/// The subsystems that may own or observe table blocks.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Client {
    None,
    Ecmp,
    Lbg,
    Vn,
    Acl,
}

/// Stable identifier for a block, independent of its current offset.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
)]
pub struct BlockHandle {
    instance: u16,
    key: u32,
}

impl BlockHandle {
    pub fn instance(&self) -> u16 {
        self.instance
    }
}

impl fmt::Display for BlockHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.instance, self.key)
    }
}

/// Per-block option flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BlockOptions(u8);

impl BlockOptions {
    pub const NONE: BlockOptions = BlockOptions(0);
    /// The block is pinned; compaction never relocates it.
    pub const DO_NOT_MOVE: BlockOptions = BlockOptions(0x1);
    /// The block is parked in the staging region, halfway through a move.
    pub const SWAP_INTERMEDIATE: BlockOptions = BlockOptions(0x2);
    /// The block is landing at its final offset after a staged move.
    pub const SWAP_FINAL: BlockOptions = BlockOptions(0x4);

    const ALL: u8 = 0x7;
    const NAMES: [(BlockOptions, &'static str); 3] = [
        (Self::DO_NOT_MOVE, "do_not_move"),
        (Self::SWAP_INTERMEDIATE, "swap_intermediate"),
        (Self::SWAP_FINAL, "swap_final"),
    ];

    pub fn from_bits(bits: u8) -> Option<BlockOptions> {
        if bits & !Self::ALL == 0 {
            Some(BlockOptions(bits))
        } else {
            None
        }
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: BlockOptions) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: BlockOptions) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: BlockOptions) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: BlockOptions) {
        self.0 &= !other.0;
    }
}

impl BitOr for BlockOptions {
    type Output = BlockOptions;

    fn bitor(self, rhs: BlockOptions) -> BlockOptions {
        BlockOptions(self.0 | rhs.0)
    }
}

impl fmt::Display for BlockOptions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "-")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// Metadata for a single allocated block.
#[derive(Clone, Debug)]
pub struct BlockCtl {
    pub offset: u32,
    pub length: u32,
    pub options: BlockOptions,
    pub opaque: u64,
    // Binding order matters for notification fan-out.  clients[0] is the
    // primary owner.
    clients: Vec<Client>,
}

impl BlockCtl {
    pub fn clients(&self) -> &[Client] {
        &self.clients
    }

    pub fn range(&self) -> Range<u32> {
        self.offset..self.offset + self.length
    }

    pub fn is_bound(&self, client: Client) -> bool {
        self.clients.contains(&client)
    }
}

/// The externally visible summary of a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BlockInfo {
    pub offset: u32,
    pub length: u32,
    pub client_count: usize,
    pub flags: BlockOptions,
    pub opaque: u64,
}

pub struct BlockStore {
    instance: u16,
    next_key: u32,
    blocks: BTreeMap<u32, BlockCtl>,
}

impl BlockStore {
    pub fn new(instance: u16) -> Self {
        BlockStore {
            instance,
            next_key: 1,
            blocks: BTreeMap::new(),
        }
    }

    fn check_instance(&self, handle: BlockHandle) -> NhdResult<()> {
        if handle.instance != self.instance {
            Err(NhdError::InvalidArgument(format!(
                "block {handle} belongs to table instance {}, not {}",
                handle.instance, self.instance
            )))
        } else {
            Ok(())
        }
    }

    fn handle(&self, key: u32) -> BlockHandle {
        BlockHandle {
            instance: self.instance,
            key,
        }
    }

    pub fn get(&self, handle: BlockHandle) -> NhdResult<&BlockCtl> {
        self.check_instance(handle)?;
        self.blocks.get(&handle.key).ok_or_else(|| {
            NhdError::InvalidArgument(format!("no such block: {handle}"))
        })
    }

    fn get_mut(&mut self, handle: BlockHandle) -> NhdResult<&mut BlockCtl> {
        self.check_instance(handle)?;
        self.blocks.get_mut(&handle.key).ok_or_else(|| {
            NhdError::InvalidArgument(format!("no such block: {handle}"))
        })
    }

    /// Record a new block at an offset the caller has already claimed from
    /// the free-space tracker.
    pub fn insert(
        &mut self,
        client: Client,
        offset: u32,
        length: u32,
        options: BlockOptions,
        opaque: u64,
    ) -> BlockHandle {
        let key = self.next_key;
        self.next_key += 1;
        self.blocks.insert(
            key,
            BlockCtl {
                offset,
                length,
                options,
                opaque,
                clients: vec![client],
            },
        );
        self.handle(key)
    }

    /// Drop `client`'s binding to the block.  If that was the last binding,
    /// the block is removed from the store and its final metadata returned so
    /// the caller can release the range.
    pub fn free(
        &mut self,
        client: Client,
        handle: BlockHandle,
    ) -> NhdResult<Option<BlockCtl>> {
        let ctl = self.get_mut(handle)?;
        let Some(idx) = ctl.clients.iter().position(|c| *c == client) else {
            return Err(NhdError::NotOwner(format!(
                "client {client} is not bound to block {handle}"
            )));
        };
        ctl.clients.remove(idx);
        if ctl.clients.is_empty() {
            Ok(self.blocks.remove(&handle.key))
        } else {
            Ok(None)
        }
    }

    pub fn register_client(
        &mut self,
        handle: BlockHandle,
        client: Client,
    ) -> NhdResult<()> {
        if client == Client::None {
            return Err(NhdError::InvalidArgument(
                "cannot bind the null client".into(),
            ));
        }
        let ctl = self.get_mut(handle)?;
        if ctl.is_bound(client) {
            Err(NhdError::InvalidArgument(format!(
                "client {client} is already bound to block {handle}"
            )))
        } else if ctl.clients.len() >= MAX_BLOCK_CLIENTS {
            Err(NhdError::CapacityExceeded(format!(
                "block {handle} already has {MAX_BLOCK_CLIENTS} clients"
            )))
        } else {
            ctl.clients.push(client);
            Ok(())
        }
    }

    /// Remove an observer's binding.  The primary owner has to go through
    /// free() instead, as only that can release the block.
    pub fn unregister_client(
        &mut self,
        handle: BlockHandle,
        client: Client,
    ) -> NhdResult<()> {
        let ctl = self.get_mut(handle)?;
        match ctl.clients.iter().position(|c| *c == client) {
            None => Err(NhdError::NotOwner(format!(
                "client {client} is not bound to block {handle}"
            ))),
            Some(0) => Err(NhdError::InvalidArgument(format!(
                "client {client} owns block {handle} and must free it"
            ))),
            Some(idx) => {
                ctl.clients.remove(idx);
                Ok(())
            }
        }
    }

    pub fn get_info(&self, handle: BlockHandle) -> NhdResult<BlockInfo> {
        let ctl = self.get(handle)?;
        Ok(BlockInfo {
            offset: ctl.offset,
            length: ctl.length,
            client_count: ctl.clients.len(),
            flags: ctl.options,
            opaque: ctl.opaque,
        })
    }

    pub fn set_opaque(
        &mut self,
        handle: BlockHandle,
        opaque: u64,
    ) -> NhdResult<()> {
        self.get_mut(handle)?.opaque = opaque;
        Ok(())
    }

    pub(crate) fn set_offset(
        &mut self,
        handle: BlockHandle,
        offset: u32,
    ) -> NhdResult<()> {
        self.get_mut(handle)?.offset = offset;
        Ok(())
    }

    pub(crate) fn update_options(
        &mut self,
        handle: BlockHandle,
        set: BlockOptions,
        clear: BlockOptions,
    ) -> NhdResult<()> {
        let ctl = self.get_mut(handle)?;
        ctl.options.remove(clear);
        ctl.options.insert(set);
        Ok(())
    }

    /// All blocks, ordered by their current offset.
    pub fn by_offset(&self) -> Vec<BlockHandle> {
        let mut all: Vec<(u32, u32)> =
            self.blocks.iter().map(|(k, b)| (b.offset, *k)).collect();
        all.sort_unstable();
        all.into_iter().map(|(_, key)| self.handle(key)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (BlockHandle, &BlockCtl)> {
        self.blocks.iter().map(|(k, b)| (self.handle(*k), b))
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }
}
