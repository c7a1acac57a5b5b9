#![forbid(unsafe_code)]
//! RillFS public API facade.
//!
//! Re-exports the realtime group lifecycle and allocation API from
//! `rill-core` through one stable external interface.

pub use rill_core::*;
