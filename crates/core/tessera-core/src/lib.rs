//! Core types and synchronization primitives for the Tessera kernel.
//!
//! This crate contains host-testable building blocks shared by every
//! kernel crate: typed identifiers, per-CPU storage, the logging facade,
//! and the spin lock that guards all shared scheduler state.
//!
//! By living outside the kernel crates, these types can be tested with
//! `cargo test` and loom on the host without a kernel target.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

pub mod cpu_local;
pub mod id;
pub mod log;
pub mod sync;
