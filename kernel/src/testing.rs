//! Test support for minOS.
//!
//! Drives the kernel state machine directly and checks the cross-component
//! invariants that must hold between syscalls.

use std::collections::BTreeSet;

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use crate::Kernel;
use crate::mm::layout::{NR_TASKS, NUM_PAG_DATA, PAG_LOG_INIT_DATA};
use crate::mm::paging;
use crate::syscall::Syscall;
use crate::tasks::table::{Loc, State, TaskKind};

pub fn boot() -> Box<Kernel> {
    Kernel::boot()
}

/// Address `offset` bytes into the current process's data region.
pub fn data_addr(offset: usize) -> u32 {
    ((PAG_LOG_INIT_DATA << 12) + offset) as u32
}

pub fn syscall(k: &mut Kernel, call: Syscall, args: [usize; 4]) -> isize {
    k.syscall(call as usize, args[0], args[1], args[2], args[3])
}

pub fn fork(k: &mut Kernel) -> isize {
    syscall(k, Syscall::Fork, [0; 4])
}

/// Table slot of the task with this pid (first match, like get_stats).
pub fn slot_of_pid(k: &Kernel, pid: i32) -> usize {
    (0..NR_TASKS)
        .find(|&s| !k.tasks.tcbs[s].is_free() && k.tasks.tcbs[s].pid == pid)
        .expect("no task with that pid")
}

pub fn run_ticks(k: &mut Kernel, n: usize) {
    for _ in 0..n {
        k.tick();
    }
}

/// Yields until `slot` is the running task. Panics if it never gets there,
/// which catches tasks stuck on a queue they should have left.
pub fn run_until_current(k: &mut Kernel, slot: usize) {
    for _ in 0..4 * NR_TASKS {
        if k.tasks.current == slot {
            return;
        }
        syscall(k, Syscall::Yield, [0; 4]);
    }
    panic!("task {} never became current", slot);
}

/// Writes bytes into a task's address space.
pub fn poke(k: &mut Kernel, slot: usize, addr: u32, bytes: &[u8]) {
    let dir = k.tasks.tcbs[slot].dir;
    paging::copy_to_user(k.dirs.table(dir), &mut k.frames, bytes, addr).expect("poke failed");
}

/// Reads bytes out of a task's address space.
pub fn peek(k: &Kernel, slot: usize, addr: u32, len: usize) -> Vec<u8> {
    let dir = k.tasks.tcbs[slot].dir;
    let mut buf = vec![0u8; len];
    paging::copy_from_user(k.dirs.table(dir), &k.frames, addr, &mut buf).expect("peek failed");
    buf
}

/// Asserts every cross-component invariant that must hold between syscalls.
pub fn check_invariants(k: &Kernel) {
    // Exactly one task runs, it is current(), and it sits on no queue.
    let mut running = 0;
    for slot in 0..NR_TASKS {
        let t = &k.tasks.tcbs[slot];
        if !t.is_free() && t.state == State::Run {
            running += 1;
            assert_eq!(slot, k.tasks.current, "RUN task is not current");
            assert_eq!(t.loc, Loc::Nowhere, "RUN task is on a queue");
        }
    }
    assert_eq!(running, 1, "expected exactly one RUN task");

    // State and queue membership agree; free slots live on the free queue;
    // the idle task is never enqueued anywhere.
    for slot in 0..NR_TASKS {
        let t = &k.tasks.tcbs[slot];
        if t.is_free() {
            assert_eq!(t.loc, Loc::Free, "free slot off the free queue");
            continue;
        }
        if slot == k.tasks.idle {
            assert_eq!(t.loc, Loc::Nowhere, "idle task got enqueued");
            continue;
        }
        match t.state {
            State::Run => assert_eq!(t.loc, Loc::Nowhere),
            State::Ready => assert_eq!(t.loc, Loc::Ready, "READY task off the ready queue"),
            State::Blocked => assert!(
                matches!(t.loc, Loc::Pause | Loc::Sem { .. }),
                "BLOCKED task off the blocked queues"
            ),
        }
    }

    // Ready queue sorted by non-increasing priority.
    let ready = k.tasks.ready.ids(&k.tasks.tcbs);
    for pair in ready.windows(2) {
        assert!(
            k.tasks.tcbs[pair[0]].priority >= k.tasks.tcbs[pair[1]].priority,
            "ready queue out of priority order"
        );
    }

    // Allocated frames match what the live tasks own: a data region per
    // process, the private user stacks, and each distinct screen frame.
    let mut expected = 0;
    let mut screen_frames = BTreeSet::new();
    for slot in 0..NR_TASKS {
        let t = &k.tasks.tcbs[slot];
        if t.is_free() {
            continue;
        }
        if matches!(t.kind, TaskKind::Process { .. }) && t.pid != 0 {
            expected += NUM_PAG_DATA;
        }
        if t.user_stack_page.is_some() {
            expected += t.user_stack_pages;
        }
        if let Some(page) = t.screen_page
            && let Some(frame) = k.dirs.table(t.dir).frame_of(page)
        {
            screen_frames.insert(frame);
        }
    }
    expected += screen_frames.len();
    assert_eq!(
        k.frames.allocated_frames(),
        expected,
        "frame accounting is off"
    );

    // Semaphore accounting: a negative count means exactly that many
    // waiters.
    for array in &k.sems {
        for sem in &array.sems {
            if !sem.is_sentinel() && sem.count < 0 {
                assert_eq!(
                    sem.blocked.len() as i32,
                    -sem.count,
                    "semaphore queue length does not match its count"
                );
            }
        }
    }
}
