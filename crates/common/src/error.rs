//! Common error types

use std::collections::TryReserveError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Buffer full: needed {needed} bytes, {available} available")]
    BufferFull { needed: usize, available: usize },

    #[error("Buffer allocation failed: {0}")]
    Alloc(#[from] TryReserveError),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
