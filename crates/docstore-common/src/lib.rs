//! Common utilities for docstore
//!
//! This crate provides the error type shared by every docstore backend.

pub mod error;

pub use error::{Result, Step, StoreError};
