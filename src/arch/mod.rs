//! Architecture-specific implementations of the hardware seams.

#[cfg(target_arch = "aarch64")]
#[macro_use]
mod aarch64;

#[cfg(target_arch = "aarch64")]
pub use aarch64::*;
