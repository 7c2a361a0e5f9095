//! Task management and multitasking for minOS.
//!
//! This module provides:
//! - The fixed task table and its intrusive queues
//! - Priority-ordered round-robin scheduling and context switching
//! - Process and thread lifecycle (clone, exit, pthread_exit)

pub mod lifecycle;
pub mod scheduler;
pub mod table;

#[cfg(test)]
mod tests;

pub use lifecycle::{CLONE_PROCESS, CLONE_THREAD};
pub use scheduler::Cpu;
pub use table::{State, TaskKind, TaskTable, Tcb};
