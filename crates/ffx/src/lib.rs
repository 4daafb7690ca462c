#![forbid(unsafe_code)]
//! FrankenFX public API facade.
//!
//! Re-exports the extraction pipeline from `ffx-core` through a stable
//! external interface. This is the crate that downstream consumers (CLI,
//! harness) depend on.

pub use ffx_core::*;
