// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::fmt;
use std::str::FromStr;

use rand::prelude::*;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// An EUI-48 MAC address, as carried in a next-hop rewrite.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct MacAddr {
    a: [u8; 6],
}

impl MacAddr {
    pub const ZERO: Self = MacAddr { a: [0; 6] };

    /// Create a new MAC address from octets in network byte order.
    pub fn new(o0: u8, o1: u8, o2: u8, o3: u8, o4: u8, o5: u8) -> MacAddr {
        MacAddr {
            a: [o0, o1, o2, o3, o4, o5],
        }
    }

    /// Return `true` if `self` is the null MAC address, all zeros.
    pub fn is_null(self) -> bool {
        self == Self::ZERO
    }

    /// Return `true` if this is a group (multicast or broadcast) address.
    pub fn is_multicast(self) -> bool {
        self.a[0] & 0x1 != 0
    }

    /// Generate a random, locally administered, unicast MAC address.
    pub fn random_local() -> MacAddr {
        let mut rng = rand::thread_rng();
        let mut a = [0u8; 6];
        rng.fill(&mut a[..]);
        a[0] = (a[0] | 0x2) & !0x1;
        MacAddr { a }
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(a: [u8; 6]) -> Self {
        Self { a }
    }
}

impl From<MacAddr> for [u8; 6] {
    fn from(mac: MacAddr) -> [u8; 6] {
        mac.a
    }
}

impl From<MacAddr> for u64 {
    fn from(mac: MacAddr) -> u64 {
        mac.a.iter().fold(0u64, |acc, octet| (acc << 8) | *octet as u64)
    }
}

impl From<u64> for MacAddr {
    fn from(x: u64) -> Self {
        let b = x.to_be_bytes();
        MacAddr {
            a: [b[2], b[3], b[4], b[5], b[6], b[7]],
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MacError {
    /// Too few octets to be a valid MAC address
    #[error("Too few octets")]
    TooShort,
    /// Too many octets to be a valid MAC address
    #[error("Too many octets")]
    TooLong,
    /// Found an octet with a non-hexadecimal character or invalid separator
    #[error("Invalid octet")]
    InvalidOctet,
}

impl FromStr for MacAddr {
    type Err = MacError;

    fn from_str(s: &str) -> Result<Self, MacError> {
        let v: Vec<&str> = s.split(':').collect();
        match v.len().cmp(&6) {
            std::cmp::Ordering::Less => Err(MacError::TooShort),
            std::cmp::Ordering::Greater => Err(MacError::TooLong),
            std::cmp::Ordering::Equal => {
                let mut a = [0u8; 6];
                for (octet, s) in a.iter_mut().zip(v) {
                    if s.is_empty() || s.len() > 2 {
                        return Err(MacError::InvalidOctet);
                    }
                    *octet = u8::from_str_radix(s, 16)
                        .map_err(|_| MacError::InvalidOctet)?;
                }
                Ok(MacAddr { a })
            }
        }
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let a = &self.a;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

// MAC addresses travel through config and script files in their familiar
// colon-separated form rather than as a byte array.
impl Serialize for MacAddr {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D>(d: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VlanError {
    /// Not a valid VLAN ID
    #[error("Invalid VLAN tag: {}", .0)]
    InvalidVlan(u16),
}

/// VLAN 0 means "untagged" and 1 is the default VLAN; neither may be used to
/// tag routed traffic.
pub fn validate_vlan(id: impl Into<u16>) -> Result<(), VlanError> {
    let id: u16 = id.into();
    if (2..=4095).contains(&id) {
        Ok(())
    } else {
        Err(VlanError::InvalidVlan(id))
    }
}
