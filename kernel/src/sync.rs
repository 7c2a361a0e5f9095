//! Inter-task synchronization: counting semaphores and timed pause.
//!
//! Each process owns one array of MAX_SEMAPHORES counting semaphores,
//! pre-allocated in a fixed pool of NR_TASKS arrays. A task blocked on a
//! semaphore sits on that semaphore's intrusive queue; a paused task sits on
//! the pause queue and is driven back to ready by the clock tick.

use crate::errors::SysError;
use crate::mm::layout::{MAX_SEMAPHORES, TICKS_PER_MS_DEN, TICKS_PER_MS_NUM};
use crate::tasks::table::{Loc, Queue, State, TaskTable};
use crate::Kernel;

/// A counting semaphore. `owner_tid == -1` marks an uninitialized slot; note
/// that a live semaphore's count may legitimately be negative, one unit per
/// waiter.
pub struct Sem {
    pub count: i32,
    pub owner_tid: i32,
    pub blocked: Queue,
}

impl Sem {
    fn new(array: usize, sem: usize) -> Self {
        Sem {
            count: -1,
            owner_tid: -1,
            blocked: Queue::new(Loc::Sem { array, sem }),
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.owner_tid == -1
    }
}

/// One process's semaphores plus the owner tag used to hand arrays out.
pub struct SemArray {
    pub owner_pid: i32,
    pub sems: [Sem; MAX_SEMAPHORES],
}

impl SemArray {
    pub fn new(array: usize) -> Self {
        SemArray {
            owner_pid: -1,
            sems: core::array::from_fn(|sem| Sem::new(array, sem)),
        }
    }

    /// Returns the array to the pool. Every queue must already be drained.
    pub fn reset(&mut self) {
        self.owner_pid = -1;
        for sem in &mut self.sems {
            debug_assert!(sem.blocked.is_empty());
            sem.count = -1;
            sem.owner_tid = -1;
        }
    }
}

impl Kernel {
    /// Hands out the next semaphore id of the caller's process and arms it
    /// with `value`.
    pub fn sys_sem_init(&mut self, value: i32) -> Result<isize, SysError> {
        let cur = self.tasks.current;
        let master = self.tasks.master_of(cur);
        let array = self.tasks.sem_array_of(cur);

        let id = self.tasks.tcbs[master].next_sem_id;
        if id >= MAX_SEMAPHORES {
            return Err(SysError::NoMem);
        }
        let sem = &mut self.sems[array].sems[id];
        sem.count = value;
        sem.owner_tid = self.tasks.tcbs[cur].tid;
        self.tasks.tcbs[master].next_sem_id = id + 1;
        Ok(id as isize)
    }

    /// Takes one unit, blocking the caller on the semaphore's queue when the
    /// count goes negative.
    pub fn sys_sem_wait(&mut self, id: usize) -> Result<isize, SysError> {
        let cur = self.tasks.current;
        let array = self.tasks.sem_array_of(cur);
        if id >= MAX_SEMAPHORES || self.sems[array].sems[id].is_sentinel() {
            return Err(SysError::Inval);
        }

        self.sems[array].sems[id].count -= 1;
        if self.sems[array].sems[id].count < 0 {
            self.tasks.tcbs[cur].state = State::Blocked;
            self.sems[array].sems[id]
                .blocked
                .push_back(&mut self.tasks.tcbs, cur);
            self.pick_next();
        }
        Ok(0)
    }

    /// Returns one unit, waking the longest-waiting task when any are
    /// blocked. A non-positive count with nobody queued breaks the
    /// accounting invariant and reports Again.
    pub fn sys_sem_post(&mut self, id: usize) -> Result<isize, SysError> {
        let cur = self.tasks.current;
        let array = self.tasks.sem_array_of(cur);
        if id >= MAX_SEMAPHORES || self.sems[array].sems[id].is_sentinel() {
            return Err(SysError::Inval);
        }

        self.sems[array].sems[id].count += 1;
        if self.sems[array].sems[id].count <= 0 {
            let Some(waiter) = self.sems[array].sems[id]
                .blocked
                .pop_front(&mut self.tasks.tcbs)
            else {
                return Err(SysError::Again);
            };
            self.ready_insert_ordered(waiter);
        }
        Ok(0)
    }

    /// Tears a semaphore down, releasing every waiter back to the ready
    /// queue. Only the creating thread may destroy it.
    pub fn sys_sem_destroy(&mut self, id: usize) -> Result<isize, SysError> {
        let cur = self.tasks.current;
        let master = self.tasks.master_of(cur);
        let array = self.tasks.sem_array_of(cur);
        if id >= self.tasks.tcbs[master].next_sem_id {
            return Err(SysError::Again);
        }
        if self.sems[array].sems[id].owner_tid != self.tasks.tcbs[cur].tid {
            return Err(SysError::Again);
        }

        while let Some(waiter) = self.sems[array].sems[id]
            .blocked
            .pop_front(&mut self.tasks.tcbs)
        {
            self.ready_insert_ordered(waiter);
        }
        self.sems[array].sems[id].count = -1;
        self.sems[array].sems[id].owner_tid = -1;
        // Only the top id is reusable; retiring a lower one keeps ids unique
        // for the life of the process.
        if id + 1 == self.tasks.tcbs[master].next_sem_id {
            self.tasks.tcbs[master].next_sem_id = id;
        }
        Ok(0)
    }

    /// Blocks the caller for `ms` milliseconds' worth of clock ticks.
    pub fn sys_pause(&mut self, ms: i32) -> Result<isize, SysError> {
        if ms < 0 {
            return Err(SysError::Inval);
        }
        let cur = self.tasks.current;
        self.tasks.tcbs[cur].pause_ticks = ms as i64 * TICKS_PER_MS_NUM / TICKS_PER_MS_DEN;
        self.tasks.tcbs[cur].state = State::Blocked;
        {
            let TaskTable { tcbs, pause_blocked, .. } = &mut self.tasks;
            pause_blocked.push_back(tcbs, cur);
        }
        self.pick_next();
        Ok(0)
    }

    /// Walks the pause queue on every tick, decrementing the timers and
    /// releasing the expired tasks. The successor is snapshotted before any
    /// removal so the walk survives the queue surgery.
    pub fn update_pause_timers(&mut self) {
        let mut cur = self.tasks.pause_blocked.head();
        while let Some(id) = cur {
            let next = self.tasks.tcbs[id].link.next;
            self.tasks.tcbs[id].pause_ticks -= 1;
            if self.tasks.tcbs[id].pause_ticks <= 0 {
                {
                    let TaskTable { tcbs, pause_blocked, .. } = &mut self.tasks;
                    pause_blocked.remove(tcbs, id);
                }
                self.ready_insert_ordered(id);
            }
            cur = next;
        }
    }
}
