//! The module SDK injected into every module crate.
//!
//! The SDK is plain Rust source (`sdk/prelude.rs`). The compiler writes it
//! into each staged module crate, so modules need no dependency on this crate
//! and every generation is built against the SDK of the running host.

/// Source text of the SDK prelude.
pub const PRELUDE: &str = include_str!("../sdk/prelude.rs");
