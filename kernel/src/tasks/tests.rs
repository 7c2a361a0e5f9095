use crate::errors::SysError;
use crate::mm::layout::{
    DEFAULT_PRIORITY, DEFAULT_QUANTUM, KERNEL_STACK_SIZE, NUM_PAG_DATA, PAGE_SIZE,
    PAG_LOG_INIT_CODE, PAG_LOG_INIT_DATA, USER_FREE_START,
};
use crate::syscall::Syscall;
use crate::tasks::lifecycle::{CLONE_PROCESS, CLONE_THREAD};
use crate::tasks::scheduler::{KSTACK_EIP, KSTACK_ESP, RET_FROM_FORK, SW_CONTEXT_WORDS};
use crate::tasks::table::{Loc, State, TaskKind, TaskTable};
use crate::testing::{
    boot, check_invariants, data_addr, fork, peek, poke, run_ticks, run_until_current,
    slot_of_pid, syscall,
};

/// A readable address inside the shared code region, usable as a thread
/// entry point.
fn code_addr() -> u32 {
    ((PAG_LOG_INIT_CODE << 12) + 0x20) as u32
}

fn spawn_thread(k: &mut crate::Kernel, stack_size: usize) -> usize {
    let master = k.tasks.master_of(k.tasks.current);
    let tid = syscall(
        k,
        Syscall::Clone,
        [CLONE_THREAD, code_addr() as usize, 0, stack_size],
    );
    assert!(tid > 0, "thread creation failed: {}", tid);
    *k.tasks.tcbs[master].threads.last().unwrap()
}

#[test]
fn boot_state() {
    let k = boot();
    assert_eq!(k.current().pid, 1);
    assert_eq!(k.current().tid, 1);
    assert_eq!(k.current().state, State::Run);
    assert_eq!(k.tasks.tcbs[k.tasks.idle].pid, 0);
    assert_eq!(k.remaining_quantum, DEFAULT_QUANTUM);
    assert_eq!(k.ticks, 0);
    assert_eq!(k.tasks.free.len(), 8);
    check_invariants(&k);
}

#[test]
fn fork_creates_ready_child() {
    let mut k = boot();
    let pid = fork(&mut k);
    assert_eq!(pid, 1001);
    check_invariants(&k);

    let child = slot_of_pid(&k, 1001);
    let t = &k.tasks.tcbs[child];
    assert_eq!(t.tid, 1);
    assert_eq!(t.state, State::Ready);
    assert_eq!(t.loc, Loc::Ready);
    assert_eq!(t.priority, DEFAULT_PRIORITY);
    assert!(matches!(t.kind, TaskKind::Process { .. }));
    assert_ne!(t.dir, k.current().dir);
    // The synthetic frame unwinds through the fork shim, which returns 0.
    assert_eq!(t.saved_sp, KERNEL_STACK_SIZE - SW_CONTEXT_WORDS - 2);
    assert_eq!(t.kstack[t.saved_sp + 1], RET_FROM_FORK);
}

#[test]
fn fork_claims_a_fresh_semaphore_array() {
    let mut k = boot();
    let pid = fork(&mut k);
    let child = slot_of_pid(&k, pid as i32);
    let array = k.tasks.sem_array_of(child);
    assert_ne!(array, 0);
    assert_eq!(k.sems[array].owner_pid, pid as i32);
    assert_eq!(k.tasks.tcbs[child].next_sem_id, 0);
}

#[test]
fn round_robin_within_same_priority() {
    let mut k = boot();
    let a = k.tasks.current;
    fork(&mut k);
    fork(&mut k);
    let b = slot_of_pid(&k, 1001);
    let c = slot_of_pid(&k, 1002);

    assert_eq!(k.tasks.current, a);
    run_ticks(&mut k, 10);
    assert_eq!(k.tasks.current, b);
    run_ticks(&mut k, 10);
    assert_eq!(k.tasks.current, c);
    run_ticks(&mut k, 10);
    assert_eq!(k.tasks.current, a);
    check_invariants(&k);
}

#[test]
fn higher_priority_arrival_preempts_immediately() {
    let mut k = boot();
    let t1 = k.tasks.current;
    fork(&mut k);
    let t2 = slot_of_pid(&k, 1001);

    // Re-insert the child at a higher priority, as a wakeup would.
    {
        let TaskTable { tcbs, ready, .. } = &mut k.tasks;
        ready.remove(tcbs, t2);
    }
    k.tasks.tcbs[t2].priority = 25;
    k.ready_insert_ordered(t2);

    assert_eq!(k.tasks.current, t2);
    assert_eq!(k.tasks.ready.head(), Some(t1));
    check_invariants(&k);
}

#[test]
fn equal_priority_arrival_does_not_preempt() {
    let mut k = boot();
    let t1 = k.tasks.current;
    fork(&mut k);
    assert_eq!(k.tasks.current, t1);
}

#[test]
fn lowering_own_priority_preempts_on_next_tick() {
    let mut k = boot();
    fork(&mut k);
    let child = slot_of_pid(&k, 1001);
    assert_eq!(syscall(&mut k, Syscall::SetPriority, [10, 0, 0, 0]), 0);
    run_ticks(&mut k, 1);
    assert_eq!(k.tasks.current, child);
    check_invariants(&k);
}

#[test]
fn set_priority_validates_and_is_idempotent() {
    let mut k = boot();
    assert_eq!(
        syscall(&mut k, Syscall::SetPriority, [101, 0, 0, 0]),
        SysError::Inval.to_ret()
    );
    assert_eq!(
        syscall(&mut k, Syscall::SetPriority, [usize::MAX, 0, 0, 0]),
        SysError::Inval.to_ret()
    );
    assert_eq!(syscall(&mut k, Syscall::SetPriority, [42, 0, 0, 0]), 0);
    assert_eq!(k.current().priority, 42);
    assert_eq!(syscall(&mut k, Syscall::SetPriority, [42, 0, 0, 0]), 0);
    assert_eq!(k.current().priority, 42);
}

#[test]
fn yield_rotates_equal_priority_tasks() {
    let mut k = boot();
    let t1 = k.tasks.current;
    fork(&mut k);
    let t2 = slot_of_pid(&k, 1001);

    assert_eq!(syscall(&mut k, Syscall::Yield, [0; 4]), 0);
    assert_eq!(k.tasks.current, t2);
    assert_eq!(syscall(&mut k, Syscall::Yield, [0; 4]), 0);
    assert_eq!(k.tasks.current, t1);
    check_invariants(&k);
}

#[test]
fn fork_memory_isolation() {
    let mut k = boot();
    let parent = k.tasks.current;
    poke(&mut k, parent, data_addr(0), &[0xAA]);
    fork(&mut k);
    let child = slot_of_pid(&k, 1001);

    assert_eq!(peek(&k, child, data_addr(0), 1), [0xAA]);
    poke(&mut k, child, data_addr(0), &[0x55]);
    assert_eq!(peek(&k, parent, data_addr(0), 1), [0xAA]);
    assert_eq!(peek(&k, child, data_addr(0), 1), [0x55]);
}

#[test]
fn fork_shares_code_and_kernel_frames() {
    let mut k = boot();
    let parent_dir = k.current().dir;
    fork(&mut k);
    let child = slot_of_pid(&k, 1001);
    let child_dir = k.tasks.tcbs[child].dir;

    for page in PAG_LOG_INIT_CODE..PAG_LOG_INIT_CODE + crate::mm::layout::NUM_PAG_CODE {
        assert_eq!(
            k.dirs.table(parent_dir).frame_of(page),
            k.dirs.table(child_dir).frame_of(page)
        );
    }
    for page in PAG_LOG_INIT_DATA..PAG_LOG_INIT_DATA + NUM_PAG_DATA {
        assert_ne!(
            k.dirs.table(parent_dir).frame_of(page),
            k.dirs.table(child_dir).frame_of(page)
        );
    }
}

#[test]
fn fork_exhausts_task_table_with_nomem() {
    let mut k = boot();
    for _ in 0..8 {
        assert!(fork(&mut k) > 0);
    }
    assert_eq!(fork(&mut k), SysError::NoMem.to_ret());
    check_invariants(&k);
}

#[test]
fn fork_rolls_back_on_frame_exhaustion() {
    let mut k = boot();
    // Burn frames until fewer than a data region's worth remain.
    while k.frames.free_frames() >= NUM_PAG_DATA {
        k.frames.alloc_frame().unwrap();
    }
    let allocated = k.frames.allocated_frames();
    let free_slots = k.tasks.free.len();

    assert_eq!(fork(&mut k), SysError::Again.to_ret());
    assert_eq!(k.frames.allocated_frames(), allocated);
    assert_eq!(k.tasks.free.len(), free_slots);
}

#[test]
fn clone_rejects_bad_arguments() {
    let mut k = boot();
    let entry = code_addr() as usize;
    assert_eq!(
        syscall(&mut k, Syscall::Clone, [7, entry, 0, 1024]),
        SysError::Inval.to_ret()
    );
    assert_eq!(
        syscall(&mut k, Syscall::Clone, [CLONE_THREAD, 0, 0, 1024]),
        SysError::Inval.to_ret()
    );
    // Entry pointing at a kernel page is not readable from user mode.
    assert_eq!(
        syscall(&mut k, Syscall::Clone, [CLONE_THREAD, 0x1000, 0, 1024]),
        SysError::Fault.to_ret()
    );
    assert_eq!(
        syscall(&mut k, Syscall::Clone, [CLONE_THREAD, entry, 0, 0]),
        SysError::Inval.to_ret()
    );
    assert_eq!(
        syscall(
            &mut k,
            Syscall::Clone,
            [CLONE_THREAD, entry, 0, crate::mm::layout::MAX_STACK_SIZE + 1]
        ),
        SysError::Inval.to_ret()
    );
    check_invariants(&k);
}

#[test]
fn thread_creation_builds_user_and_kernel_stacks() {
    let mut k = boot();
    let master = k.tasks.current;
    let arg = data_addr(0x40);
    let tid = syscall(
        &mut k,
        Syscall::Clone,
        [CLONE_THREAD, code_addr() as usize, arg as usize, 1024],
    );
    assert_eq!(tid, 2);
    check_invariants(&k);

    let thread = *k.tasks.tcbs[master].threads.last().unwrap();
    let t = &k.tasks.tcbs[thread];
    assert_eq!(t.pid, k.tasks.tcbs[master].pid);
    assert_eq!(t.tid, 2);
    assert!(matches!(t.kind, TaskKind::Thread { master: m } if m == master));
    assert_eq!(t.dir, k.tasks.tcbs[master].dir);
    assert_eq!(k.tasks.tcbs[master].thread_count, 2);

    // One page of stack in the first free slot above the screen page.
    assert_eq!(t.user_stack_page, Some(USER_FREE_START));
    assert_eq!(t.user_stack_pages, 1);

    // Stack top holds arg, entry, and the unused return slot.
    let top = ((USER_FREE_START + 1) << 12) as u32;
    let words = peek(&k, thread, top - 12, 12);
    assert_eq!(&words[8..12], &arg.to_le_bytes());
    assert_eq!(&words[4..8], &code_addr().to_le_bytes());
    assert_eq!(&words[0..4], &[0; 4]);

    // Kernel stack mimics an interrupted user context entering the thread.
    let t = &k.tasks.tcbs[thread];
    assert_eq!(t.kstack[KSTACK_ESP], top - 12);
    assert_eq!(t.kstack[KSTACK_EIP], code_addr());
    assert_eq!(t.saved_sp, KERNEL_STACK_SIZE - SW_CONTEXT_WORDS);
}

#[test]
fn sibling_thread_stacks_do_not_collide() {
    let mut k = boot();
    let a = spawn_thread(&mut k, 2 * PAGE_SIZE);
    let b = spawn_thread(&mut k, PAGE_SIZE);
    let (a_base, a_pages) = (
        k.tasks.tcbs[a].user_stack_page.unwrap(),
        k.tasks.tcbs[a].user_stack_pages,
    );
    let (b_base, b_pages) = (
        k.tasks.tcbs[b].user_stack_page.unwrap(),
        k.tasks.tcbs[b].user_stack_pages,
    );
    assert!(a_base + a_pages <= b_base || b_base + b_pages <= a_base);
    check_invariants(&k);
}

#[test]
fn thread_stack_independence() {
    let mut k = boot();
    let master = k.tasks.current;
    let thread = spawn_thread(&mut k, 1024);

    let thread_top = ((USER_FREE_START + 1) << 12) as u32;
    let master_top = ((PAG_LOG_INIT_DATA + NUM_PAG_DATA) << 12) as u32;
    poke(&mut k, thread, thread_top - 16, &0xBEEFu16.to_le_bytes());
    poke(&mut k, master, master_top - 16, &0xDEADu16.to_le_bytes());

    assert_eq!(peek(&k, thread, thread_top - 16, 2), 0xBEEFu16.to_le_bytes());
    assert_eq!(peek(&k, master, master_top - 16, 2), 0xDEADu16.to_le_bytes());
}

#[test]
fn fork_from_thread_relocates_its_stack() {
    let mut k = boot();
    let thread = spawn_thread(&mut k, 2 * PAGE_SIZE);
    let thread_base = k.tasks.tcbs[thread].user_stack_page.unwrap();
    poke(&mut k, thread, ((thread_base << 12) + 100) as u32, &[0x77]);

    run_until_current(&mut k, thread);
    let pid = fork(&mut k);
    assert!(pid > 0);
    let child = slot_of_pid(&k, pid as i32);

    let t = &k.tasks.tcbs[child];
    assert_eq!(t.tid, 1);
    let child_base = t.user_stack_page.unwrap();
    assert_eq!(t.user_stack_pages, 2);
    // Same offset within the relocated stack, same bytes.
    assert_eq!(peek(&k, child, ((child_base << 12) + 100) as u32, 1), [0x77]);
    // The saved user stack pointer moved by the relocation delta.
    let parent_esp = k.tasks.tcbs[thread].kstack[KSTACK_ESP];
    let child_esp = k.tasks.tcbs[child].kstack[KSTACK_ESP];
    assert_eq!(
        child_esp.wrapping_sub((child_base << 12) as u32),
        parent_esp.wrapping_sub((thread_base << 12) as u32)
    );
    check_invariants(&k);
}

#[test]
fn exit_releases_process_resources() {
    let mut k = boot();
    let baseline = k.frames.allocated_frames();
    let pid = fork(&mut k);
    let child = slot_of_pid(&k, pid as i32);
    let array = k.tasks.sem_array_of(child);

    run_until_current(&mut k, child);
    syscall(&mut k, Syscall::Exit, [0; 4]);

    assert!(k.tasks.tcbs[child].is_free());
    assert_eq!(k.tasks.tcbs[child].loc, Loc::Free);
    assert_eq!(k.frames.allocated_frames(), baseline);
    assert_eq!(k.sems[array].owner_pid, -1);
    assert_ne!(k.tasks.current, child);
    check_invariants(&k);
}

#[test]
fn exit_tears_down_threads_too() {
    let mut k = boot();
    let pid = fork(&mut k);
    let child = slot_of_pid(&k, pid as i32);
    run_until_current(&mut k, child);
    let ta = spawn_thread(&mut k, 4096);
    let tb = spawn_thread(&mut k, 4096);
    let baseline = k.frames.allocated_frames();
    assert_eq!(baseline, 2 * NUM_PAG_DATA + 2);

    syscall(&mut k, Syscall::Exit, [0; 4]);
    assert!(k.tasks.tcbs[child].is_free());
    assert!(k.tasks.tcbs[ta].is_free());
    assert!(k.tasks.tcbs[tb].is_free());
    assert_eq!(k.frames.allocated_frames(), NUM_PAG_DATA);
    check_invariants(&k);
}

#[test]
fn pthread_exit_of_sole_thread_exits_the_process() {
    let mut k = boot();
    let pid = fork(&mut k);
    let child = slot_of_pid(&k, pid as i32);
    run_until_current(&mut k, child);
    syscall(&mut k, Syscall::PthreadExit, [0; 4]);
    assert!(k.tasks.tcbs[child].is_free());
    check_invariants(&k);
}

#[test]
fn pthread_exit_frees_only_the_thread() {
    let mut k = boot();
    let master = k.tasks.current;
    let thread = spawn_thread(&mut k, 4096);
    let baseline = k.frames.allocated_frames();

    run_until_current(&mut k, thread);
    syscall(&mut k, Syscall::PthreadExit, [0; 4]);

    assert!(k.tasks.tcbs[thread].is_free());
    assert!(!k.tasks.tcbs[master].is_free());
    assert_eq!(k.tasks.tcbs[master].thread_count, 1);
    assert!(k.tasks.tcbs[master].threads.is_empty());
    assert_eq!(k.frames.allocated_frames(), baseline - 1);
    check_invariants(&k);
}

#[test]
fn master_exit_promotes_surviving_thread() {
    let mut k = boot();
    let master = k.tasks.current;
    syscall(&mut k, Syscall::SemInit, [3, 0, 0, 0]);
    let ta = spawn_thread(&mut k, 4096);
    let tb = spawn_thread(&mut k, 4096);

    // The master leaves; the first non-blocked thread takes over.
    syscall(&mut k, Syscall::PthreadExit, [0; 4]);

    assert!(k.tasks.tcbs[master].is_free());
    let t = &k.tasks.tcbs[ta];
    assert!(matches!(t.kind, TaskKind::Process { sem_array: 0 }));
    assert_eq!(t.thread_count, 2);
    assert_eq!(t.next_sem_id, 1);
    assert_eq!(t.threads.as_slice(), &[tb][..]);
    assert!(matches!(
        k.tasks.tcbs[tb].kind,
        TaskKind::Thread { master: m } if m == ta
    ));
    check_invariants(&k);
}

#[test]
fn blocked_threads_are_skipped_for_promotion() {
    let mut k = boot();
    syscall(&mut k, Syscall::SemInit, [0, 0, 0, 0]);
    let ta = spawn_thread(&mut k, 4096);
    let tb = spawn_thread(&mut k, 4096);

    // Block the first thread on the semaphore.
    run_until_current(&mut k, ta);
    syscall(&mut k, Syscall::SemWait, [0, 0, 0, 0]);
    assert_eq!(k.tasks.tcbs[ta].state, State::Blocked);

    let master = k.tasks.master_of(k.tasks.current);
    run_until_current(&mut k, master);
    syscall(&mut k, Syscall::PthreadExit, [0; 4]);

    assert!(matches!(k.tasks.tcbs[tb].kind, TaskKind::Process { .. }));
    assert!(matches!(
        k.tasks.tcbs[ta].kind,
        TaskKind::Thread { master: m } if m == tb
    ));
    check_invariants(&k);
}

#[test]
fn exit_from_all_tasks_leaves_idle_running() {
    let mut k = boot();
    let idle = k.tasks.idle;
    syscall(&mut k, Syscall::Exit, [0; 4]);
    assert_eq!(k.tasks.current, idle);
    assert_eq!(k.tasks.tcbs[idle].state, State::Run);
    assert_eq!(k.frames.allocated_frames(), 0);
    check_invariants(&k);
}

#[test]
fn fork_is_clone_process() {
    let mut k = boot();
    let pid = syscall(&mut k, Syscall::Clone, [CLONE_PROCESS, 0, 0, 0]);
    assert_eq!(pid, 1001);
    check_invariants(&k);
}
