// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
use thiserror::Error;

/// Errors produced by the data-model layer. Every variant is an
/// invalid-input condition; storage failures live in the store crate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("invalid CID: {0}")]
    InvalidCid(&'static str),
    #[error("invalid UTF-8 in string value")]
    InvalidUtf8,
    #[error("Invalid CBOR: {0}")]
    MalformedCbor(&'static str),
    #[error("Invalid MemoDB JSON: {0}")]
    MalformedJson(String),
    #[error("node is not a {0}")]
    WrongKind(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
