#![forbid(unsafe_code)]
//! In-place delta generation public API facade.
//!
//! Re-exports the generator from `ipd-core` through a stable external
//! interface. This is the crate that downstream consumers (CLI, harness
//! tooling) depend on.

pub use ipd_core::*;
