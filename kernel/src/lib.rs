/*
Copyright © 2025 the minOS authors

This file is part of minOS.

minOS is free software: you can redistribute it and/or modify it under the terms of the GNU General
Public License as published by the Free Software Foundation, either version 3 of the License, or (at
your option) any later version.

minOS is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the
implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public
License for more details.

You should have received a copy of the GNU General Public License along with minOS. If not, see
<https://www.gnu.org/licenses/>.
*/

//! The minOS kernel core.
//!
//! An educational preemptive kernel for a single-CPU 32-bit protected-mode
//! machine: a fixed task table scheduled by priority-ordered round robin off
//! a periodic clock tick, per-task page tables over a bitmap frame
//! allocator, and counting semaphores for inter-task synchronization.
//!
//! All kernel state lives in one [`Kernel`] value. The interrupt and syscall
//! plumbing is outside the core; it delivers `tick`, `key_event` and
//! `syscall` through the entry shims at the bottom of this module. Kernel
//! entries run through interrupt gates, so the whole core executes
//! serialized and one lock around the global instance is enough.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod errors;
pub mod interrupts;
pub mod keyboard;
pub mod mm;
pub mod output;
pub mod serial;
pub mod sync;
pub mod syscall;
pub mod tasks;

#[cfg(test)]
pub(crate) mod testing;

use alloc::boxed::Box;
use spin::Mutex;

use keyboard::KeyMap;
use mm::frames::FrameAllocator;
use mm::layout::{FRAME_INIT_CODE, NR_TASKS, NUM_PAG_CODE, NUM_PAG_KERNEL};
use mm::paging::DirArena;
use output::Console;
use sync::SemArray;
use tasks::scheduler::Cpu;
use tasks::table::{TaskTable, Tcb};

/// The whole kernel state.
pub struct Kernel {
    pub frames: FrameAllocator,
    pub dirs: DirArena,
    pub tasks: TaskTable,
    pub sems: [SemArray; NR_TASKS],
    pub console: Console,
    pub keyboard: KeyMap,
    pub cpu: Cpu,
    /// The kernel clock, in ticks since boot. Monotone, append-only.
    pub ticks: u64,
    /// Global quantum countdown for the running task.
    pub remaining_quantum: u32,
    pub(crate) next_pid: i32,
}

impl Kernel {
    /// Boots the kernel: reserves the kernel and code frames, seeds the task
    /// table, and brings up the idle task and the initial process. On return
    /// the initial process is running.
    pub fn boot() -> Box<Kernel> {
        let mut kernel = Box::new(Kernel {
            frames: FrameAllocator::new(),
            dirs: DirArena::new(),
            tasks: TaskTable::new(),
            sems: core::array::from_fn(SemArray::new),
            console: Console::new(),
            keyboard: KeyMap::new(),
            cpu: Cpu::new(),
            ticks: 0,
            remaining_quantum: 0,
            next_pid: 1000,
        });
        kernel.frames.reserve(0, NUM_PAG_KERNEL);
        kernel.frames.reserve(FRAME_INIT_CODE, NUM_PAG_CODE);
        kernel.init_idle();
        kernel.init_task1();
        kernel
    }

    /// The running task.
    pub fn current(&self) -> &Tcb {
        self.tasks.current()
    }
}

/// Global kernel instance for the interrupt-driven embedding.
pub static KERNEL: Mutex<Option<Box<Kernel>>> = Mutex::new(None);

/// Bare-metal entry: brings the serial port up and boots the global kernel.
pub fn init() {
    serial::init();
    KERNEL.lock().replace(Kernel::boot());
}

/// Clock event shim for the timer wiring.
pub fn tick() {
    if let Some(kernel) = KERNEL.lock().as_mut() {
        kernel.tick();
    }
}

/// Keyboard event shim for the keyboard wiring.
pub fn key_event(scan: u8, pressed: bool) {
    if let Some(kernel) = KERNEL.lock().as_mut() {
        kernel.key_event(scan, pressed);
    }
}

/// Syscall shim for the trampoline.
pub fn syscall(nr: usize, a1: usize, a2: usize, a3: usize, a4: usize) -> isize {
    match KERNEL.lock().as_mut() {
        Some(kernel) => kernel.syscall(nr, a1, a2, a3, a4),
        None => errors::SysError::Again.to_ret(),
    }
}

/// Halt forever.
pub fn hcf() -> ! {
    loop {
        core::hint::spin_loop();
    }
}
