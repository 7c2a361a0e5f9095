//! Console output for minOS.
//!
//! This module provides:
//! - The 80x25 cell console the kernel renders into
//! - The leveled logging macros backed by the serial sink

pub mod console;
pub mod macros;

pub use console::Console;
