//! Task creation and teardown.
//!
//! One `clone` entry covers both creation modes: a process gets a fresh
//! address space with its data region copied page by page through a scratch
//! mapping, a thread shares the address space and gets a private user stack
//! carved out of the free region above the data pages. Teardown returns every
//! frame and TCB, promoting a surviving thread to master when the master
//! leaves early.

use arrayvec::ArrayVec;

use crate::errors::SysError;
use crate::mm::layout::{
    KERNEL_STACK_SIZE, MAX_STACK_SIZE, NR_TASKS, NUM_PAG_DATA, PAGE_SIZE, PAG_LOG_INIT_DATA,
    USER_FREE_START,
};
use crate::mm::paging::{self, PteFlags};
use crate::tasks::scheduler::{KSTACK_ESP, KSTACK_EIP, RET_FROM_FORK, SW_CONTEXT_WORDS};
use crate::tasks::table::{State, Stats, TaskKind, TaskTable, Tcb};
use crate::{Kernel, debug};

pub const CLONE_THREAD: usize = 0;
pub const CLONE_PROCESS: usize = 1;

/// Mutable references to two distinct TCB slots.
fn two_mut(tcbs: &mut [Tcb; NR_TASKS], a: usize, b: usize) -> (&mut Tcb, &mut Tcb) {
    debug_assert_ne!(a, b);
    if a < b {
        let (lo, hi) = tcbs.split_at_mut(b);
        (&mut lo[a], &mut hi[0])
    } else {
        let (lo, hi) = tcbs.split_at_mut(a);
        (&mut hi[0], &mut lo[b])
    }
}

impl Kernel {
    /// Creates a process or a thread.
    ///
    /// Returns the new pid (processes) or tid (threads) to the creator. A
    /// forked process observes 0 instead, through the synthetic stack its
    /// first context switch unwinds.
    pub fn sys_clone(
        &mut self,
        what: usize,
        entry: u32,
        arg: u32,
        stack_size: usize,
    ) -> Result<isize, SysError> {
        if what != CLONE_PROCESS && what != CLONE_THREAD {
            return Err(SysError::Inval);
        }
        if what == CLONE_THREAD {
            if entry == 0 {
                return Err(SysError::Inval);
            }
            let pt = self.dirs.table(self.tasks.current().dir);
            if !paging::access_ok(pt, entry, 4, false) {
                return Err(SysError::Fault);
            }
            if arg != 0 && !paging::access_ok(pt, arg, 4, false) {
                return Err(SysError::Fault);
            }
            if stack_size == 0 || stack_size > MAX_STACK_SIZE {
                return Err(SysError::Inval);
            }
        }

        let child = {
            let TaskTable { tcbs, free, .. } = &mut self.tasks;
            free.pop_front(tcbs).ok_or(SysError::NoMem)?
        };

        // Start from a copy of the creator, kernel stack included: the fork
        // return path reuses the parent's saved frames.
        let parent = self.tasks.current;
        {
            let (p, c) = two_mut(&mut self.tasks.tcbs, parent, child);
            c.pid = p.pid;
            c.tid = p.tid;
            c.kind = p.kind;
            c.priority = p.priority;
            c.quantum_total = p.quantum_total;
            c.pause_ticks = 0;
            c.dir = p.dir;
            c.kstack = p.kstack;
            c.saved_sp = p.saved_sp;
            c.user_stack_page = p.user_stack_page;
            c.user_stack_pages = p.user_stack_pages;
            c.screen_page = p.screen_page;
            c.thread_count = 0;
            c.threads.clear();
            c.next_sem_id = p.next_sem_id;
        }

        let result = if what == CLONE_THREAD {
            self.clone_thread(child, entry, arg, stack_size)
        } else {
            self.clone_process(child)
        };

        match result {
            Ok(id) => {
                let now = self.ticks;
                let t = &mut self.tasks.tcbs[child];
                t.stats = Stats::init(now);
                self.ready_insert_ordered(child);
                Ok(id as isize)
            }
            Err(e) => {
                let TaskTable { tcbs, free, .. } = &mut self.tasks;
                tcbs[child].pid = -1;
                tcbs[child].tid = -1;
                free.push_back(tcbs, child);
                Err(e)
            }
        }
    }

    /// Thread half of clone: private user stack in the shared address space.
    fn clone_thread(
        &mut self,
        child: usize,
        entry: u32,
        arg: u32,
        stack_size: usize,
    ) -> Result<i32, SysError> {
        let parent = self.tasks.current;
        let master = self.tasks.master_of(parent);
        let dir = self.tasks.tcbs[master].dir;
        let pages_needed = stack_size.div_ceil(PAGE_SIZE);

        let ranges = self.tasks.stack_ranges(master);
        let base = paging::search_free_region(
            self.dirs.table(dir),
            USER_FREE_START,
            pages_needed,
            &ranges,
        )
        .ok_or(SysError::NoMem)?;

        for i in 0..pages_needed {
            match self.frames.alloc_frame() {
                Ok(frame) => {
                    self.dirs
                        .table_mut(dir)
                        .map(base + i, frame, PteFlags::USER | PteFlags::RW);
                }
                Err(_) => {
                    self.free_mapped_range(dir, base, i);
                    return Err(SysError::Again);
                }
            }
        }

        self.tasks.tcbs[master].thread_count += 1;
        let tid = self.tasks.tcbs[master].thread_count;

        // User stack, top down: arg, entry, then a zeroed return slot. A
        // thread ends by calling pthread_exit; returning off the entry
        // function is undefined.
        let top = ((base + pages_needed) << 12) as u32;
        paging::write_user_word(self.dirs.table(dir), &mut self.frames, top - 4, arg)?;
        paging::write_user_word(self.dirs.table(dir), &mut self.frames, top - 8, entry)?;
        paging::write_user_word(self.dirs.table(dir), &mut self.frames, top - 12, 0)?;

        let screen_page = self.tasks.tcbs[master].screen_page;
        {
            let t = &mut self.tasks.tcbs[child];
            t.tid = tid;
            t.kind = TaskKind::Thread { master };
            t.user_stack_page = Some(base);
            t.user_stack_pages = pages_needed;
            t.screen_page = screen_page;
            // Kernel stack mimics a just-interrupted user context so the
            // return path drops into entry(arg) in user mode.
            t.kstack[KSTACK_ESP] = top - 12;
            t.kstack[KSTACK_EIP] = entry;
            t.saved_sp = KERNEL_STACK_SIZE - SW_CONTEXT_WORDS;
        }
        self.tasks.tcbs[master].threads.push(child);

        debug!("thread tid {} of pid {} created", tid, self.tasks.tcbs[child].pid);
        Ok(tid)
    }

    /// Process half of clone: fresh directory, data region copied through a
    /// scratch window in the parent's table, code and kernel shared.
    fn clone_process(&mut self, child: usize) -> Result<i32, SysError> {
        let parent = self.tasks.current;
        let parent_dir = self.tasks.tcbs[parent].dir;
        let child_dir = self.dirs.alloc()?;
        self.tasks.tcbs[child].dir = child_dir;

        // Kernel and code regions share the parent's frames.
        for pag in 0..crate::mm::layout::NUM_PAG_KERNEL {
            let e = self.dirs.table(parent_dir).entry(pag);
            self.dirs.table_mut(child_dir).set_entry(pag, e);
        }
        for pag in 0..crate::mm::layout::NUM_PAG_CODE {
            let page = crate::mm::layout::PAG_LOG_INIT_CODE + pag;
            let e = self.dirs.table(parent_dir).entry(page);
            self.dirs.table_mut(child_dir).set_entry(page, e);
        }

        // Fresh data frames, rolled back together on exhaustion.
        for pag in 0..NUM_PAG_DATA {
            match self.frames.alloc_frame() {
                Ok(frame) => {
                    self.dirs.table_mut(child_dir).map(
                        PAG_LOG_INIT_DATA + pag,
                        frame,
                        PteFlags::USER | PteFlags::RW,
                    );
                }
                Err(_) => {
                    self.free_mapped_range(child_dir, PAG_LOG_INIT_DATA, pag);
                    self.dirs.free(child_dir);
                    return Err(SysError::Again);
                }
            }
        }

        // Scratch window in the parent's table, clear of every live stack.
        let master = self.tasks.master_of(parent);
        let ranges = self.tasks.stack_ranges(master);
        let Some(scratch) = paging::search_free_region(
            self.dirs.table(parent_dir),
            USER_FREE_START,
            NUM_PAG_DATA,
            &ranges,
        ) else {
            self.free_mapped_range(child_dir, PAG_LOG_INIT_DATA, NUM_PAG_DATA);
            self.dirs.free(child_dir);
            return Err(SysError::Again);
        };

        // Copy the data region: map the child's frame into the scratch slot,
        // copy through the parent's own address space, unmap, flush.
        for pag in 0..NUM_PAG_DATA {
            let child_frame = self
                .dirs
                .table(child_dir)
                .frame_of(PAG_LOG_INIT_DATA + pag)
                .expect("fresh data page lost");
            self.dirs.table_mut(parent_dir).map(
                scratch + pag,
                child_frame,
                PteFlags::USER | PteFlags::RW,
            );
            paging::copy_data(
                self.dirs.table(parent_dir),
                &mut self.frames,
                ((PAG_LOG_INIT_DATA + pag) << 12) as u32,
                ((scratch + pag) << 12) as u32,
                PAGE_SIZE,
            );
            self.dirs.table_mut(parent_dir).unmap(scratch + pag);
            self.cpu.flush_tlb_current();
        }

        // A forking thread carries its private stack over to the child,
        // relocated into a free region of the child's space.
        if self.tasks.tcbs[parent].tid != 1
            && let Some(parent_base) = self.tasks.tcbs[parent].user_stack_page
        {
            let pages = self.tasks.tcbs[parent].user_stack_pages;
            let Some(new_base) = paging::search_free_region(
                self.dirs.table(child_dir),
                USER_FREE_START,
                pages,
                &[(parent_base, pages)],
            ) else {
                self.free_mapped_range(child_dir, PAG_LOG_INIT_DATA, NUM_PAG_DATA);
                self.dirs.free(child_dir);
                return Err(SysError::Again);
            };
            for i in 0..pages {
                let frame = match self.frames.alloc_frame() {
                    Ok(f) => f,
                    Err(_) => {
                        self.free_mapped_range(child_dir, new_base, i);
                        self.free_mapped_range(child_dir, PAG_LOG_INIT_DATA, NUM_PAG_DATA);
                        self.dirs.free(child_dir);
                        return Err(SysError::Again);
                    }
                };
                self.dirs
                    .table_mut(child_dir)
                    .map(new_base + i, frame, PteFlags::USER | PteFlags::RW);
                self.dirs
                    .table_mut(parent_dir)
                    .map(scratch + i, frame, PteFlags::USER | PteFlags::RW);
                paging::copy_data(
                    self.dirs.table(parent_dir),
                    &mut self.frames,
                    ((parent_base + i) << 12) as u32,
                    ((scratch + i) << 12) as u32,
                    PAGE_SIZE,
                );
                self.dirs.table_mut(parent_dir).unmap(scratch + i);
                self.cpu.flush_tlb_current();
            }
            let t = &mut self.tasks.tcbs[child];
            t.user_stack_page = Some(new_base);
            // The saved user stack pointer moves by the same offset.
            let offset = t.kstack[KSTACK_ESP].wrapping_sub((parent_base << 12) as u32);
            t.kstack[KSTACK_ESP] = ((new_base << 12) as u32).wrapping_add(offset);
        } else {
            let t = &mut self.tasks.tcbs[child];
            t.user_stack_page = None;
            t.user_stack_pages = 0;
        }

        // Claim a free semaphore array for the new process.
        self.next_pid += 1;
        let pid = self.next_pid;
        let Some(sem_array) = (0..NR_TASKS).find(|&i| self.sems[i].owner_pid == -1) else {
            let stack = self.tasks.tcbs[child].user_stack_page.map(|b| (b, self.tasks.tcbs[child].user_stack_pages));
            if let Some((b, n)) = stack {
                self.free_mapped_range(child_dir, b, n);
            }
            self.free_mapped_range(child_dir, PAG_LOG_INIT_DATA, NUM_PAG_DATA);
            self.dirs.free(child_dir);
            return Err(SysError::NoMem);
        };
        self.sems[sem_array].owner_pid = pid;

        // Screen frame is shared; the logical address is inherited.
        if let Some(page) = self.tasks.tcbs[parent].screen_page {
            let e = self.dirs.table(parent_dir).entry(page);
            self.dirs.table_mut(child_dir).set_entry(page, e);
        }

        // Synthetic software context: the first switch into the child pops a
        // saved frame pointer and returns through ret_from_fork, which hands
        // 0 back to user code.
        let t = &mut self.tasks.tcbs[child];
        t.pid = pid;
        t.tid = 1;
        t.thread_count = 1;
        t.kind = TaskKind::Process { sem_array };
        t.next_sem_id = 0;
        let sp = KERNEL_STACK_SIZE - SW_CONTEXT_WORDS - 2;
        t.kstack[sp] = 0; // saved frame pointer
        t.kstack[sp + 1] = RET_FROM_FORK;
        t.saved_sp = sp;

        debug!("process pid {} forked from pid {}", pid, self.tasks.tcbs[parent].pid);
        Ok(pid)
    }

    /// Terminates the whole process of the caller: frames, semaphores and
    /// every member TCB go back to their pools. Never returns to the caller.
    pub fn sys_exit(&mut self) {
        let cur = self.tasks.current;
        let master = self.tasks.master_of(cur);
        let dir = self.tasks.tcbs[master].dir;
        let pid = self.tasks.tcbs[master].pid;

        self.free_mapped_range(dir, PAG_LOG_INIT_DATA, NUM_PAG_DATA);

        let mut members: ArrayVec<usize, NR_TASKS> = ArrayVec::new();
        members.push(master);
        members.extend(self.tasks.tcbs[master].threads.iter().copied());

        for &id in &members {
            if let Some(base) = self.tasks.tcbs[id].user_stack_page {
                let pages = self.tasks.tcbs[id].user_stack_pages;
                self.free_mapped_range(dir, base, pages);
            }
        }

        // The screen frame is shared across fork; free it only when no task
        // outside this process still maps it.
        if let Some(page) = self.tasks.tcbs[master].screen_page
            && let Some(frame) = self.dirs.table(dir).frame_of(page)
        {
            self.dirs.table_mut(dir).unmap(page);
            let shared = (0..NR_TASKS).any(|slot| {
                let t = &self.tasks.tcbs[slot];
                !t.is_free()
                    && t.pid != pid
                    && t.screen_page
                        .is_some_and(|p| self.dirs.table(t.dir).frame_of(p) == Some(frame))
            });
            if !shared {
                self.frames.free_frame(frame);
            }
        }

        for &id in &members {
            self.unlink(id);
            let TaskTable { tcbs, free, .. } = &mut self.tasks;
            let t = &mut tcbs[id];
            t.pid = -1;
            t.tid = -1;
            t.thread_count = 0;
            t.user_stack_page = None;
            t.user_stack_pages = 0;
            t.screen_page = None;
            t.threads.clear();
            free.push_back(tcbs, id);
        }

        // All waiters are gone by now, so the array resets to its sentinel
        // state with empty queues.
        let sem_array = match self.tasks.tcbs[master].kind {
            TaskKind::Process { sem_array } => sem_array,
            TaskKind::Thread { .. } => unreachable!("master is not a process"),
        };
        self.sems[sem_array].reset();

        self.dirs.free(dir);
        debug!("process pid {} exited", pid);
        self.pick_next();
    }

    /// Terminates the calling thread. The last thread of a process takes the
    /// whole process with it; an exiting master hands the process to the
    /// first surviving non-blocked thread.
    pub fn sys_pthread_exit(&mut self) {
        let cur = self.tasks.current;
        let master = self.tasks.master_of(cur);
        if self.tasks.tcbs[master].thread_count == 1 {
            return self.sys_exit();
        }

        let dir = self.tasks.tcbs[cur].dir;
        if let Some(base) = self.tasks.tcbs[cur].user_stack_page {
            let pages = self.tasks.tcbs[cur].user_stack_pages;
            self.free_mapped_range(dir, base, pages);
        }

        if cur == master {
            self.promote_new_master(master);
        } else {
            self.tasks.tcbs[master].thread_count -= 1;
            self.tasks.tcbs[master].threads.retain(|&mut t| t != cur);
        }

        {
            let TaskTable { tcbs, free, .. } = &mut self.tasks;
            let t = &mut tcbs[cur];
            t.pid = -1;
            t.tid = -1;
            t.user_stack_page = None;
            t.user_stack_pages = 0;
            t.screen_page = None;
            t.threads.clear();
            free.push_back(tcbs, cur);
        }

        self.pick_next();
    }

    /// Rewires a process around a new master after the old one exits: the
    /// first non-blocked thread takes over the thread list, the semaphore
    /// array and the live-thread count, and every sibling points at it.
    fn promote_new_master(&mut self, old_master: usize) {
        let threads = self.tasks.tcbs[old_master].threads.clone();
        let new_master = threads
            .iter()
            .copied()
            .find(|&t| self.tasks.tcbs[t].state != State::Blocked)
            .unwrap_or(threads[0]);

        let sem_array = self.tasks.sem_array_of(old_master);
        let next_sem_id = self.tasks.tcbs[old_master].next_sem_id;
        let count = self.tasks.tcbs[old_master].thread_count - 1;

        {
            let t = &mut self.tasks.tcbs[new_master];
            t.kind = TaskKind::Process { sem_array };
            t.next_sem_id = next_sem_id;
            t.thread_count = count;
            t.threads.clear();
        }
        for &sibling in threads.iter().filter(|&&t| t != new_master) {
            self.tasks.tcbs[sibling].kind = TaskKind::Thread { master: new_master };
            self.tasks.tcbs[new_master].threads.push(sibling);
        }
        debug!("master handed over to slot {}", new_master);
    }

    /// Frees the frames behind a mapped logical range and clears the PTEs.
    pub(crate) fn free_mapped_range(&mut self, dir: usize, base: usize, count: usize) {
        for page in base..base + count {
            if let Some(frame) = self.dirs.table(dir).frame_of(page) {
                self.frames.free_frame(frame);
                self.dirs.table_mut(dir).unmap(page);
            }
        }
    }

    /// Detaches a task from whatever queue it is on.
    fn unlink(&mut self, id: usize) {
        use crate::tasks::table::Loc;
        match self.tasks.tcbs[id].loc {
            Loc::Nowhere => {}
            Loc::Free => unreachable!("live task on the free queue"),
            Loc::Ready => {
                let TaskTable { tcbs, ready, .. } = &mut self.tasks;
                ready.remove(tcbs, id);
            }
            Loc::Pause => {
                let TaskTable { tcbs, pause_blocked, .. } = &mut self.tasks;
                pause_blocked.remove(tcbs, id);
            }
            Loc::Sem { array, sem } => {
                self.sems[array].sems[sem]
                    .blocked
                    .remove(&mut self.tasks.tcbs, id);
            }
        }
    }
}
