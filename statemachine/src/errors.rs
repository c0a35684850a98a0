// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("state machine already tracked: {0}")]
    AlreadyExists(String),
    #[error("state machine not tracked: {0}")]
    NotFound(String),
    #[error("state machine group has shut down")]
    Closed,
    #[error("datastore: {0}")]
    Db(#[from] db::Error),
    #[error("encoding record: {0}")]
    Encoding(String),
    #[error("datastore schema version {actual} is newer than supported version {supported}")]
    UnsupportedSchema { actual: u64, supported: u64 },
    #[error("{0}")]
    Other(String),
}

impl From<fvm_ipld_encoding::Error> for Error {
    fn from(e: fvm_ipld_encoding::Error) -> Self {
        Error::Encoding(e.to_string())
    }
}
