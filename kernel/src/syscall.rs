//! Syscall interface for user programs.
//!
//! Calling convention: one integer selector plus up to four integer
//! arguments, result in a single signed register. Negative results are
//! errors; unknown selectors report NoSys and touch nothing.

use crate::errors::{SysError, ret};
use crate::keyboard::KEY_STATES;
use crate::mm::layout::{MAX_PRIORITY, NR_TASKS, SCREEN_LOG_PAGE};
use crate::mm::paging::{self, PteFlags};
use crate::tasks::lifecycle::CLONE_PROCESS;
use crate::tasks::table::{Stats, update_stats};
use crate::{Kernel, debug};

/// Bytes moved per trip through the kernel-resident buffer in sys_write.
const WRITE_CHUNK: usize = 512;

/// Syscall numbers.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Exit = 1,
    Clone = 2,
    Write = 4,
    Pause = 5,
    Gettime = 10,
    GetKeyboardState = 12,
    Yield = 13,
    StartScreen = 14,
    Getpid = 20,
    SemInit = 21,
    SemWait = 22,
    SemPost = 23,
    SemDestroy = 24,
    SetPriority = 30,
    PthreadExit = 31,
    GetStats = 35,
    Fork = 36,
}

impl Syscall {
    pub fn from_usize(n: usize) -> Option<Self> {
        match n {
            1 => Some(Syscall::Exit),
            2 => Some(Syscall::Clone),
            4 => Some(Syscall::Write),
            5 => Some(Syscall::Pause),
            10 => Some(Syscall::Gettime),
            12 => Some(Syscall::GetKeyboardState),
            13 => Some(Syscall::Yield),
            14 => Some(Syscall::StartScreen),
            20 => Some(Syscall::Getpid),
            21 => Some(Syscall::SemInit),
            22 => Some(Syscall::SemWait),
            23 => Some(Syscall::SemPost),
            24 => Some(Syscall::SemDestroy),
            30 => Some(Syscall::SetPriority),
            31 => Some(Syscall::PthreadExit),
            35 => Some(Syscall::GetStats),
            36 => Some(Syscall::Fork),
            _ => None,
        }
    }
}

/// Access mode a file descriptor is validated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FdAccess {
    Write,
}

/// The console is the only device: fd 1, write only.
fn check_fd(fd: i32, access: FdAccess) -> Result<(), SysError> {
    if fd != 1 {
        return Err(SysError::BadF);
    }
    if access != FdAccess::Write {
        return Err(SysError::Acces);
    }
    Ok(())
}

impl Kernel {
    /// Dispatches one syscall on behalf of the running task.
    pub fn syscall(&mut self, nr: usize, a1: usize, a2: usize, a3: usize, a4: usize) -> isize {
        self.user_to_system();
        let result = match Syscall::from_usize(nr) {
            None => {
                debug!("unknown syscall number {}", nr);
                Err(SysError::NoSys)
            }
            Some(call) => self.dispatch(call, a1, a2, a3, a4),
        };
        self.system_to_user();
        ret(result)
    }

    fn dispatch(
        &mut self,
        call: Syscall,
        a1: usize,
        a2: usize,
        a3: usize,
        a4: usize,
    ) -> Result<isize, SysError> {
        match call {
            Syscall::Exit => {
                self.sys_exit();
                Ok(0)
            }
            Syscall::Clone => self.sys_clone(a1, user_ptr(a2)?, user_ptr(a3)?, a4),
            Syscall::Fork => self.sys_clone(CLONE_PROCESS, 0, 0, 0),
            Syscall::Write => self.sys_write(a1 as i32, user_ptr(a2)?, a3 as isize),
            Syscall::Pause => self.sys_pause(a1 as i32),
            Syscall::Gettime => Ok(self.ticks as isize),
            Syscall::GetKeyboardState => self.sys_get_keyboard_state(user_ptr(a1)?),
            Syscall::Yield => {
                self.preempt();
                Ok(0)
            }
            Syscall::StartScreen => self.sys_start_screen(),
            Syscall::Getpid => Ok(self.tasks.current().pid as isize),
            Syscall::SemInit => self.sys_sem_init(a1 as i32),
            Syscall::SemWait => self.sys_sem_wait(a1),
            Syscall::SemPost => self.sys_sem_post(a1),
            Syscall::SemDestroy => self.sys_sem_destroy(a1),
            Syscall::SetPriority => self.sys_set_priority(a1 as i32),
            Syscall::PthreadExit => {
                self.sys_pthread_exit();
                Ok(0)
            }
            Syscall::GetStats => self.sys_get_stats(a1 as i32, user_ptr(a2)?),
        }
    }

    /// Writes to the console through a kernel-resident buffer, 512 bytes per
    /// trip.
    fn sys_write(&mut self, fd: i32, buf: u32, nbytes: isize) -> Result<isize, SysError> {
        check_fd(fd, FdAccess::Write)?;
        if nbytes < 0 {
            return Err(SysError::Inval);
        }
        let nbytes = nbytes as usize;
        if nbytes == 0 {
            return Ok(0);
        }
        let dir = self.tasks.current().dir;
        if !paging::access_ok(self.dirs.table(dir), buf, nbytes, false) {
            return Err(SysError::Fault);
        }

        let mut local = [0u8; WRITE_CHUNK];
        let mut addr = buf;
        let mut left = nbytes;
        while left > 0 {
            let chunk = left.min(WRITE_CHUNK);
            paging::copy_from_user(
                self.dirs.table(dir),
                &self.frames,
                addr,
                &mut local[..chunk],
            )?;
            self.console.write_bytes(&local[..chunk]);
            addr += chunk as u32;
            left -= chunk;
        }
        Ok(nbytes as isize)
    }

    /// Snapshot of a task's accounting, looked up by pid.
    fn sys_get_stats(&mut self, pid: i32, addr: u32) -> Result<isize, SysError> {
        let dir = self.tasks.current().dir;
        if !paging::access_ok(self.dirs.table(dir), addr, Stats::SIZE, true) {
            return Err(SysError::Fault);
        }
        if pid < 0 {
            return Err(SysError::Inval);
        }
        for slot in 0..NR_TASKS {
            if !self.tasks.tcbs[slot].is_free() && self.tasks.tcbs[slot].pid == pid {
                self.tasks.tcbs[slot].stats.remaining_ticks = self.remaining_quantum as u64;
                let bytes = self.tasks.tcbs[slot].stats.to_bytes();
                paging::copy_to_user(self.dirs.table(dir), &mut self.frames, &bytes, addr)?;
                return Ok(0);
            }
        }
        Err(SysError::Srch)
    }

    /// Copies the pressed-key map out and clears it.
    fn sys_get_keyboard_state(&mut self, addr: u32) -> Result<isize, SysError> {
        let dir = self.tasks.current().dir;
        if !paging::access_ok(self.dirs.table(dir), addr, KEY_STATES, true) {
            return Err(SysError::Fault);
        }
        let snapshot = self.keyboard.snapshot();
        paging::copy_to_user(self.dirs.table(dir), &mut self.frames, &snapshot, addr)?;
        self.keyboard.clear();
        Ok(0)
    }

    /// Maps a shadow screen page at the fixed screen address. Idempotent per
    /// task, and adopts a mapping a sibling thread already installed.
    fn sys_start_screen(&mut self) -> Result<isize, SysError> {
        let cur = self.tasks.current;
        let addr = (SCREEN_LOG_PAGE << 12) as isize;
        if self.tasks.tcbs[cur].screen_page.is_some() {
            return Ok(addr);
        }
        let dir = self.tasks.tcbs[cur].dir;
        if self.dirs.table(dir).frame_of(SCREEN_LOG_PAGE).is_none() {
            let frame = self.frames.alloc_frame()?;
            self.dirs
                .table_mut(dir)
                .map(SCREEN_LOG_PAGE, frame, PteFlags::USER | PteFlags::RW);
        }
        self.tasks.tcbs[cur].screen_page = Some(SCREEN_LOG_PAGE);
        Ok(addr)
    }

    fn sys_set_priority(&mut self, priority: i32) -> Result<isize, SysError> {
        if !(0..=MAX_PRIORITY).contains(&priority) {
            return Err(SysError::Inval);
        }
        self.tasks.current_mut().priority = priority;
        Ok(0)
    }

    /// Charges the time since the last transition to user time. Runs on
    /// every kernel entry.
    fn user_to_system(&mut self) {
        let now = self.ticks;
        let t = self.tasks.current_mut();
        update_stats(
            now,
            &mut t.stats.user_ticks,
            &mut t.stats.elapsed_total_ticks,
        );
    }

    /// Charges the time spent in the kernel to system time. Runs on every
    /// kernel exit.
    fn system_to_user(&mut self) {
        let now = self.ticks;
        let t = self.tasks.current_mut();
        update_stats(
            now,
            &mut t.stats.system_ticks,
            &mut t.stats.elapsed_total_ticks,
        );
    }
}

/// Validates that an argument fits a 32-bit user pointer.
fn user_ptr(arg: usize) -> Result<u32, SysError> {
    u32::try_from(arg).map_err(|_| SysError::Fault)
}
