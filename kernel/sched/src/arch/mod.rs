//! Architecture-specific context layouts and switch routines.
//!
//! Board platforms build their [`Platform`](crate::platform::Platform)
//! implementation on top of these.

#[cfg(any(target_arch = "aarch64", test))]
pub mod aarch64;
