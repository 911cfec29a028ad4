//! mirrorpool Common - Shared types and utilities
//!
//! This crate provides the data model, the error taxonomy and the
//! configuration structures used across all mirrorpool components.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{CapacityScope, Error, ErrorClass, PoolExhaustion, Result};
pub use types::*;
