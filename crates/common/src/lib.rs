//! Common utilities for the usbmux daemon
//!
//! This crate provides the building blocks shared by the daemon's client and
//! USB sides: error handling, logging setup, the unordered handle set used
//! for registries, and the growable message buffer used for framed I/O.

pub mod buffer;
pub mod error;
pub mod logging;
pub mod pointer_set;

pub use buffer::MessageBuffer;
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use pointer_set::PointerSet;
