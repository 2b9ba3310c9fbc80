// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed CID, name, URI, or request data.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// A block, head, or call that should exist does not.
    #[error("not found in store")]
    NotFound,
    /// Unknown URI scheme, read-only engine, or unsupported operation.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// The engine reported an I/O error, corruption, or an invariant
    /// violation. Long-running processes should treat this as fatal; the
    /// persistence layer is not trusted to recover partially.
    #[error("store engine failure: {0}")]
    Crash(String),
    #[error(transparent)]
    Ipld(#[from] memodb_ipld::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn invalid(detail: impl Into<String>) -> Error {
        Error::InvalidInput(detail.into())
    }

    pub fn unsupported(detail: impl Into<String>) -> Error {
        Error::Unsupported(detail.into())
    }

    pub fn crash(detail: impl std::fmt::Display) -> Error {
        Error::Crash(detail.to_string())
    }
}
