//! Architecture-specific paging primitives.
//!
//! Selects between the Sv39 hardware implementation and the software scale
//! model. The software model is active for tests and whenever the
//! `software-emulation` feature is enabled; Sv39 is used for real riscv64
//! kernel builds.

// The Sv39 module is compiled whenever the target is riscv64 (including
// during tests, so that tooling can still see it) but only exported for real
// kernel builds.
#[cfg(target_arch = "riscv64")]
mod sv39;
#[cfg(all(target_arch = "riscv64", not(test), not(feature = "software-emulation")))]
pub use sv39::*;

#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::*;
