//! Task scheduler for preemptive multitasking.
//!
//! Priority-ordered round robin: the ready queue is kept sorted by
//! non-increasing priority, FIFO within a priority class. A kernel-global
//! quantum counts down on every clock tick; a strictly higher-priority
//! arrival preempts immediately.

use crate::mm::layout::{
    DEFAULT_PRIORITY, DEFAULT_QUANTUM, FRAME_INIT_CODE, KERNEL_STACK_SIZE, NUM_PAG_CODE,
    NUM_PAG_DATA, NUM_PAG_KERNEL, PAG_LOG_INIT_CODE, PAG_LOG_INIT_DATA,
};
use crate::mm::paging::PteFlags;
use crate::tasks::table::{State, Stats, TaskKind, TaskTable, update_stats};
use crate::{Kernel, debug, info, trace};

/// Words of software context (callee-saved registers plus handler linkage)
/// that sit below the hardware exception frame on a suspended kernel stack.
pub const SW_CONTEXT_WORDS: usize = 18;

/// Hardware exception frame slots at the top of the kernel stack, pushed by
/// the CPU on a privilege change: ss, esp, eflags, cs, eip.
pub const KSTACK_SS: usize = KERNEL_STACK_SIZE - 1;
pub const KSTACK_ESP: usize = KERNEL_STACK_SIZE - 2;
pub const KSTACK_EFLAGS: usize = KERNEL_STACK_SIZE - 3;
pub const KSTACK_CS: usize = KERNEL_STACK_SIZE - 4;
pub const KSTACK_EIP: usize = KERNEL_STACK_SIZE - 5;

/// Kernel text anchors referenced from synthetic stack frames. On real iron
/// these are linker symbols inside the kernel image; the state model only
/// needs stable, distinguishable values.
pub const RET_FROM_FORK: u32 = 0x0001_0010;
pub const CPU_IDLE: u32 = 0x0001_0020;

/// CPU-side context the kernel keeps in step with the running task: the
/// kernel-stack top used by privilege transitions (the TSS esp0 slot), the
/// current address-space register and its flush count, and the loaded stack
/// pointer.
pub struct Cpu {
    /// Task whose kernel stack the privilege-transition hardware would use.
    pub esp0_task: usize,
    /// Page-directory arena slot loaded in the address-space register.
    pub dir: usize,
    /// Kernel stack pointer loaded by the last `switch_stack`.
    pub sp: usize,
    pub tlb_flushes: u64,
}

impl Cpu {
    pub fn new() -> Self {
        Cpu {
            esp0_task: 0,
            dir: 0,
            sp: KERNEL_STACK_SIZE,
            tlb_flushes: 0,
        }
    }

    /// Loads a new address space, flushing the TLB.
    pub fn set_cr3(&mut self, dir: usize) {
        self.dir = dir;
        self.tlb_flushes += 1;
    }

    /// Reloads the address-space register for the current task.
    pub fn flush_tlb_current(&mut self) {
        self.tlb_flushes += 1;
    }
}

/// Stack-swap primitive.
///
/// On hardware this is a short assembly routine: push the callee-saved
/// registers, store ESP through `save`, load `load` into ESP, pop and return
/// into the new stack's saved context. It never returns in the caller's
/// logical flow. The state model records the canonical suspension point
/// instead and hands back the loaded pointer; everything above this seam is
/// ordinary synchronous code.
pub fn switch_stack(save: &mut usize, load: usize) -> usize {
    *save = KERNEL_STACK_SIZE - SW_CONTEXT_WORDS;
    load
}

impl Kernel {
    /// Inserts a task into the ready queue, keeping the queue sorted by
    /// non-increasing priority; equal priorities stay FIFO. If the arrival
    /// has strictly higher priority than the running task, the running task
    /// is preempted on the spot.
    pub fn ready_insert_ordered(&mut self, id: usize) {
        // Threads always run at their master's priority.
        let master = self.tasks.master_of(id);
        if master != id {
            self.tasks.tcbs[id].priority = self.tasks.tcbs[master].priority;
        }

        let now = self.ticks;
        {
            let TaskTable { tcbs, ready, .. } = &mut self.tasks;
            let mut before = None;
            let mut cur = ready.head();
            while let Some(c) = cur {
                if tcbs[id].priority > tcbs[c].priority {
                    before = Some(c);
                    break;
                }
                cur = tcbs[c].link.next;
            }
            match before {
                Some(b) => ready.insert_before(tcbs, id, b),
                None => ready.push_back(tcbs, id),
            }
            tcbs[id].state = State::Ready;
            let t = &mut tcbs[id];
            update_stats(
                now,
                &mut t.stats.system_ticks,
                &mut t.stats.elapsed_total_ticks,
            );
        }

        let current = self.tasks.current;
        if self.tasks.tcbs[id].priority > self.tasks.tcbs[current].priority {
            trace!(
                "arrival preempts: task {} prio {} over current prio {}",
                id,
                self.tasks.tcbs[id].priority,
                self.tasks.tcbs[current].priority
            );
            self.preempt();
        }
    }

    /// Moves the running task back to the ready queue and runs the next one.
    /// Also the implementation of the yield syscall.
    pub fn preempt(&mut self) {
        let cur = self.tasks.current;
        if cur == self.tasks.idle {
            // The idle task is never enqueued; it simply stops running.
            self.tasks.tcbs[cur].state = State::Ready;
        } else {
            self.ready_insert_ordered(cur);
        }
        self.pick_next();
    }

    /// Quantum and priority checks run at the end of every clock tick.
    pub fn schedule(&mut self) {
        if self.remaining_quantum == 0 {
            if !self.tasks.ready.is_empty() {
                self.preempt();
            } else {
                // Nothing else to run; grant the current task a fresh turn.
                self.remaining_quantum = self.tasks.current().quantum_total;
            }
            return;
        }
        if let Some(head) = self.tasks.ready.head()
            && self.tasks.tcbs[head].priority > self.tasks.current().priority
        {
            self.preempt();
        }
    }

    /// Pops the ready head (or falls back to the idle task), reloads the
    /// quantum and switches context to it.
    pub fn pick_next(&mut self) {
        let prev = self.tasks.current;
        let now = self.ticks;
        {
            let t = &mut self.tasks.tcbs[prev];
            update_stats(
                now,
                &mut t.stats.system_ticks,
                &mut t.stats.elapsed_total_ticks,
            );
        }

        let idle = self.tasks.idle;
        let next = {
            let TaskTable { tcbs, ready, .. } = &mut self.tasks;
            ready.pop_front(tcbs).unwrap_or(idle)
        };

        {
            let t = &mut self.tasks.tcbs[next];
            t.state = State::Run;
            self.remaining_quantum = t.quantum_total;
            update_stats(
                now,
                &mut t.stats.ready_ticks,
                &mut t.stats.elapsed_total_ticks,
            );
            t.stats.total_trans += 1;
        }

        trace!("switching from task {} to task {}", prev, next);
        self.context_switch(prev, next);
    }

    /// Swaps the kernel stack pointer, the privilege-transition stack top and
    /// the address space. General-purpose registers are restored by the
    /// interrupt epilogue on the way back to user mode.
    fn context_switch(&mut self, prev: usize, next: usize) {
        self.cpu.esp0_task = next;
        let next_dir = self.tasks.tcbs[next].dir;
        if self.cpu.dir != next_dir {
            self.cpu.set_cr3(next_dir);
        }
        let load = self.tasks.tcbs[next].saved_sp;
        self.cpu.sp = switch_stack(&mut self.tasks.tcbs[prev].saved_sp, load);
        self.tasks.current = next;
    }

    /// Builds the idle task: pid 0, default priority, never on the ready
    /// queue. Its synthetic stack unwinds into the halt loop.
    pub(crate) fn init_idle(&mut self) {
        let slot = {
            let TaskTable { tcbs, free, .. } = &mut self.tasks;
            free.pop_front(tcbs).expect("no free slot for the idle task")
        };
        let now = self.ticks;
        let dir = self.dirs.alloc().expect("no directory for the idle task");
        let t = &mut self.tasks.tcbs[slot];
        t.pid = 0;
        t.tid = 1;
        t.priority = DEFAULT_PRIORITY;
        t.quantum_total = DEFAULT_QUANTUM;
        t.thread_count = 1;
        t.dir = dir;
        t.stats = Stats::init(now);
        t.state = State::Ready;
        t.kstack[KERNEL_STACK_SIZE - 1] = CPU_IDLE;
        t.kstack[KERNEL_STACK_SIZE - 2] = 0; // saved frame pointer
        t.saved_sp = KERNEL_STACK_SIZE - 2;
        self.tasks.idle = slot;
        debug!("idle task at slot {}", slot);
    }

    /// Builds the initial process: pid 1, running, with its address space
    /// populated and semaphore array 0 claimed.
    pub(crate) fn init_task1(&mut self) {
        let slot = {
            let TaskTable { tcbs, free, .. } = &mut self.tasks;
            free.pop_front(tcbs).expect("no free slot for task 1")
        };
        let now = self.ticks;
        let dir = self.dirs.alloc().expect("no directory for task 1");
        {
            let t = &mut self.tasks.tcbs[slot];
            t.pid = 1;
            t.tid = 1;
            t.kind = TaskKind::Process { sem_array: 0 };
            t.priority = DEFAULT_PRIORITY;
            t.quantum_total = DEFAULT_QUANTUM;
            t.thread_count = 1;
            t.next_sem_id = 0;
            t.dir = dir;
            t.stats = Stats::init(now);
            t.state = State::Run;
            t.saved_sp = KERNEL_STACK_SIZE - SW_CONTEXT_WORDS;
        }
        self.sems[0].owner_pid = 1;
        self.set_user_pages(slot);

        self.remaining_quantum = self.tasks.tcbs[slot].quantum_total;
        self.cpu.esp0_task = slot;
        self.cpu.set_cr3(dir);
        self.tasks.current = slot;
        info!(
            "task 1 running at slot {}, {} frames free",
            slot,
            self.frames.free_frames()
        );
    }

    /// Populates a fresh address space: kernel region identity mapped, code
    /// image shared read-only, data region backed by newly allocated frames.
    fn set_user_pages(&mut self, slot: usize) {
        let dir = self.tasks.tcbs[slot].dir;
        for pag in 0..NUM_PAG_KERNEL {
            self.dirs.table_mut(dir).map(pag, pag, PteFlags::RW);
        }
        for pag in 0..NUM_PAG_CODE {
            self.dirs.table_mut(dir).map(
                PAG_LOG_INIT_CODE + pag,
                FRAME_INIT_CODE + pag,
                PteFlags::USER,
            );
        }
        for pag in 0..NUM_PAG_DATA {
            let frame = self
                .frames
                .alloc_frame()
                .expect("boot: out of frames for the initial data region");
            self.dirs
                .table_mut(dir)
                .map(PAG_LOG_INIT_DATA + pag, frame, PteFlags::USER | PteFlags::RW);
        }
    }
}
