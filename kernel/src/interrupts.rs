//! Event-source entry points.
//!
//! The interrupt descriptor table, timer and keyboard wiring live outside
//! the core; they deliver `tick` and `key_event` here. Interrupt gates mask
//! further interrupts while a kernel entry runs, so everything below executes
//! serialized.

use core::fmt::Write;

use crate::{Kernel, error};

impl Kernel {
    /// Clock interrupt: advances the kernel clock, runs the pause timers,
    /// refreshes video memory from the running task's shadow screen and
    /// applies the scheduling discipline.
    pub fn tick(&mut self) {
        self.ticks += 1;
        self.remaining_quantum = self.remaining_quantum.saturating_sub(1);
        self.update_pause_timers();
        self.dump_screen();
        self.schedule();
    }

    /// Keyboard interrupt: one scancode, press or release.
    pub fn key_event(&mut self, scan: u8, pressed: bool) {
        self.keyboard.set(scan, pressed);
    }

    /// Copies the running task's shadow screen into video memory.
    fn dump_screen(&mut self) {
        let t = self.tasks.current();
        if t.is_free() {
            return;
        }
        let Some(page) = t.screen_page else {
            return;
        };
        let dir = t.dir;
        let Some(frame) = self.dirs.table(dir).frame_of(page) else {
            return;
        };
        self.console.load_cells(self.frames.frame(frame));
    }

    /// Fatal page fault: print the faulting instruction pointer and halt.
    /// There is no recovery path.
    pub fn page_fault(&mut self, eip: u32) -> ! {
        let _ = write!(
            self.console,
            "\nProcess generates a PAGE FAULT exception at EIP: 0x{eip:08X}\nHalting the system...\n",
        );
        error!("page fault at {:#010x}, halting", eip);
        crate::hcf();
    }
}
