//! Core types for TideKV.
//!
//! This crate provides the foundation shared by every other crate:
//! - The replicated command model (`CmdArgs`, `ServiceArgs`, `RequestInfo`)
//! - The stored entry type (`KvEntry`) and evaluation reply (`EvalResult`)
//! - The unified error type with wire-stable display strings
//! - Postcard codec wrappers used for commands and snapshots
//! - Configuration structs

pub mod codec;
pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types at crate root
pub use error::{ErrCode, KvError, Result};
pub use types::*;
