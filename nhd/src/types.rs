// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! General types used throughout the table manager.

use std::convert;

use aal::AsicError;

pub type NhdResult<T> = Result<T, NhdError>;

#[derive(Debug, thiserror::Error)]
pub enum NhdError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("No free resources: {0}")]
    NoFreeResources(String),
    #[error("Not owner: {0}")]
    NotOwner(String),
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),
    #[error("Resource is busy: {0}")]
    Busy(String),
    #[error("Resource is missing: {0}")]
    Missing(String),
    #[error("Resource already exists: {0}")]
    Exists(String),
    #[error("ASIC error: {0:?}")]
    Switch(AsicError),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0:?}")]
    Io(std::io::Error),
    #[error("Error: {0}")]
    Other(String),
}

impl convert::From<AsicError> for NhdError {
    fn from(err: AsicError) -> Self {
        NhdError::Switch(err)
    }
}

impl convert::From<std::io::Error> for NhdError {
    fn from(err: std::io::Error) -> Self {
        NhdError::Io(err)
    }
}

impl convert::From<common::network::VlanError> for NhdError {
    fn from(err: common::network::VlanError) -> Self {
        NhdError::InvalidArgument(err.to_string())
    }
}

impl convert::From<toml::de::Error> for NhdError {
    fn from(err: toml::de::Error) -> Self {
        NhdError::Config(err.to_string())
    }
}

impl convert::From<String> for NhdError {
    fn from(err: String) -> Self {
        NhdError::Other(err)
    }
}

impl convert::From<&str> for NhdError {
    fn from(err: &str) -> Self {
        NhdError::Other(err.to_string())
    }
}
