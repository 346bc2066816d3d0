//! Integration test driver for `tests/integration/` submodule.
//!
//! Each `mod` below exercises one subsystem end to end against the
//! in-process simulated device. No hardware required.

mod harness;

mod bootloader_tests;
mod enumeration_tests;
mod lifecycle_tests;
mod panic_tests;
mod ras_tests;
