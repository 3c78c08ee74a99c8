pub mod coordination_error;

use std::io;

use thiserror::Error as ThisError;

use crate::error::coordination_error::CoordinationError;

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("serde_json error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    #[error("coordination error: {0}")]
    CoordinationError(#[from] CoordinationError),
}

pub type Result<T> = core::result::Result<T, Error>;
