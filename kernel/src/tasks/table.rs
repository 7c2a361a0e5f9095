//! The task table.
//!
//! A fixed arena of NR_TASKS task control blocks with intrusive, index-linked
//! queues over it. A TCB is always owned by the table; the free, ready,
//! pause-blocked and per-semaphore queues are views threaded through the
//! `link` field, and every TCB is on at most one of them at a time.

use arrayvec::ArrayVec;

use crate::mm::layout::{KERNEL_STACK_SIZE, NR_TASKS};

/// Scheduling state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Run,
    Ready,
    Blocked,
}

/// What a task is: a process master owning a semaphore array, or a thread
/// pointing back at its master. This replaces the "is master self?" pointer
/// dance with a plain sum type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Process { sem_array: usize },
    Thread { master: usize },
}

/// Which queue a TCB is currently linked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Loc {
    /// On no queue: the running task, the idle task, or mid-move.
    Nowhere,
    Free,
    Ready,
    Pause,
    Sem { array: usize, sem: usize },
}

/// Intrusive queue linkage.
#[derive(Debug, Clone, Copy, Default)]
pub struct Link {
    pub next: Option<usize>,
    pub prev: Option<usize>,
}

/// Per-task accounting, in ticks.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub user_ticks: u64,
    pub system_ticks: u64,
    pub blocked_ticks: u64,
    pub ready_ticks: u64,
    pub elapsed_total_ticks: u64,
    pub total_trans: u64,
    pub remaining_ticks: u64,
}

impl Stats {
    pub const NUM_FIELDS: usize = 7;
    pub const SIZE: usize = Self::NUM_FIELDS * 8;

    pub fn init(now: u64) -> Self {
        Stats {
            elapsed_total_ticks: now,
            remaining_ticks: now,
            ..Stats::default()
        }
    }

    /// Serialized form handed to user space by get_stats.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let fields = [
            self.user_ticks,
            self.system_ticks,
            self.blocked_ticks,
            self.ready_ticks,
            self.elapsed_total_ticks,
            self.total_trans,
            self.remaining_ticks,
        ];
        let mut out = [0u8; Self::SIZE];
        for (i, f) in fields.iter().enumerate() {
            out[i * 8..(i + 1) * 8].copy_from_slice(&f.to_le_bytes());
        }
        out
    }
}

/// Accumulates the ticks spent since `elapsed` into `counter` and restarts
/// the measurement.
pub fn update_stats(now: u64, counter: &mut u64, elapsed: &mut u64) {
    *counter += now - *elapsed;
    *elapsed = now;
}

/// Task control block.
pub struct Tcb {
    /// Process id; -1 marks a free slot. Threads share their process's pid.
    pub pid: i32,
    /// Thread id within the process; the master thread has tid 1.
    pub tid: i32,
    pub state: State,
    pub kind: TaskKind,
    pub priority: i32,
    /// Ticks granted per scheduling turn.
    pub quantum_total: u32,
    /// Remaining pause, in ticks. Only meaningful while on the pause queue.
    pub pause_ticks: i64,
    /// Page-directory arena slot. Threads carry their master's slot.
    pub dir: usize,
    /// Kernel stack, one per task.
    pub kstack: [u32; KERNEL_STACK_SIZE],
    /// Word index into `kstack` at which a context switch resumes this task.
    pub saved_sp: usize,
    /// Base logical page of the private user stack, if any.
    pub user_stack_page: Option<usize>,
    pub user_stack_pages: usize,
    /// Logical page of the shadow screen, if StartScreen ran.
    pub screen_page: Option<usize>,
    /// Live threads in the process. Only meaningful on the master.
    pub thread_count: i32,
    /// Threads whose master is this task. Empty on non-masters.
    pub threads: ArrayVec<usize, NR_TASKS>,
    /// Next semaphore id to hand out. Only meaningful on the master.
    pub next_sem_id: usize,
    pub stats: Stats,
    pub link: Link,
    pub loc: Loc,
}

impl Tcb {
    pub fn unused(slot: usize) -> Self {
        Tcb {
            pid: -1,
            tid: -1,
            state: State::Ready,
            kind: TaskKind::Process { sem_array: slot },
            priority: 0,
            quantum_total: 0,
            pause_ticks: 0,
            dir: 0,
            kstack: [0; KERNEL_STACK_SIZE],
            saved_sp: KERNEL_STACK_SIZE,
            user_stack_page: None,
            user_stack_pages: 0,
            screen_page: None,
            thread_count: 0,
            threads: ArrayVec::new(),
            next_sem_id: 0,
            stats: Stats::default(),
            link: Link::default(),
            loc: Loc::Nowhere,
        }
    }

    pub fn is_free(&self) -> bool {
        self.pid == -1
    }
}

/// An intrusive FIFO over the TCB arena. The queue knows which `Loc` it is,
/// and stamps it on every task it links.
#[derive(Debug, Clone, Copy)]
pub struct Queue {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
    tag: Loc,
}

impl Queue {
    pub const fn new(tag: Loc) -> Self {
        Queue {
            head: None,
            tail: None,
            len: 0,
            tag,
        }
    }

    pub fn head(&self) -> Option<usize> {
        self.head
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn push_back(&mut self, tasks: &mut [Tcb], id: usize) {
        debug_assert_eq!(tasks[id].loc, Loc::Nowhere, "task already queued");
        tasks[id].link = Link {
            next: None,
            prev: self.tail,
        };
        match self.tail {
            Some(t) => tasks[t].link.next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;
        tasks[id].loc = self.tag;
    }

    /// Links `id` just before `before`, which must be on this queue.
    pub fn insert_before(&mut self, tasks: &mut [Tcb], id: usize, before: usize) {
        debug_assert_eq!(tasks[id].loc, Loc::Nowhere, "task already queued");
        debug_assert_eq!(tasks[before].loc, self.tag);
        let prev = tasks[before].link.prev;
        tasks[id].link = Link {
            next: Some(before),
            prev,
        };
        tasks[before].link.prev = Some(id);
        match prev {
            Some(p) => tasks[p].link.next = Some(id),
            None => self.head = Some(id),
        }
        self.len += 1;
        tasks[id].loc = self.tag;
    }

    pub fn pop_front(&mut self, tasks: &mut [Tcb]) -> Option<usize> {
        let id = self.head?;
        self.remove(tasks, id);
        Some(id)
    }

    pub fn remove(&mut self, tasks: &mut [Tcb], id: usize) {
        debug_assert_eq!(tasks[id].loc, self.tag, "task not on this queue");
        let Link { next, prev } = tasks[id].link;
        match prev {
            Some(p) => tasks[p].link.next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => tasks[n].link.prev = prev,
            None => self.tail = prev,
        }
        tasks[id].link = Link::default();
        tasks[id].loc = Loc::Nowhere;
        self.len -= 1;
    }

    /// Snapshot of the queued ids, front to back.
    pub fn ids(&self, tasks: &[Tcb]) -> ArrayVec<usize, NR_TASKS> {
        let mut out = ArrayVec::new();
        let mut cur = self.head;
        while let Some(id) = cur {
            out.push(id);
            cur = tasks[id].link.next;
        }
        out
    }
}

/// The fixed task table and its queues.
pub struct TaskTable {
    pub tcbs: [Tcb; NR_TASKS],
    pub free: Queue,
    pub ready: Queue,
    pub pause_blocked: Queue,
    /// Slot of the running task.
    pub current: usize,
    /// Slot of the idle task. Never enqueued anywhere.
    pub idle: usize,
}

impl TaskTable {
    /// Builds the boot-time table with every slot on the free queue.
    pub fn new() -> Self {
        let mut table = TaskTable {
            tcbs: core::array::from_fn(Tcb::unused),
            free: Queue::new(Loc::Free),
            ready: Queue::new(Loc::Ready),
            pause_blocked: Queue::new(Loc::Pause),
            current: 0,
            idle: 0,
        };
        for slot in 0..NR_TASKS {
            table.free.push_back(&mut table.tcbs, slot);
        }
        table
    }

    /// The running task. Its TCB is on no queue.
    pub fn current(&self) -> &Tcb {
        &self.tcbs[self.current]
    }

    pub fn current_mut(&mut self) -> &mut Tcb {
        &mut self.tcbs[self.current]
    }

    /// Slot of the master thread of the process `id` belongs to.
    pub fn master_of(&self, id: usize) -> usize {
        match self.tcbs[id].kind {
            TaskKind::Process { .. } => id,
            TaskKind::Thread { master } => master,
        }
    }

    /// Semaphore-array slot of the process `id` belongs to.
    pub fn sem_array_of(&self, id: usize) -> usize {
        let master = self.master_of(id);
        match self.tcbs[master].kind {
            TaskKind::Process { sem_array } => sem_array,
            TaskKind::Thread { .. } => unreachable!("master of a task is not a process"),
        }
    }

    /// Live user-stack ranges of the process `master` owns, as
    /// (base page, page count) pairs. Used to keep stack carving away from
    /// sibling stacks.
    pub fn stack_ranges(&self, master: usize) -> ArrayVec<(usize, usize), { NR_TASKS + 1 }> {
        let mut ranges = ArrayVec::new();
        let m = &self.tcbs[master];
        if let Some(base) = m.user_stack_page {
            ranges.push((base, m.user_stack_pages));
        }
        for &t in &m.threads {
            let t = &self.tcbs[t];
            if let Some(base) = t.user_stack_page {
                ranges.push((base, t.user_stack_pages));
            }
        }
        ranges
    }
}
