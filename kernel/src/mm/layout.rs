//! Boot memory layout constants.
//!
//! These values are part of the binary contract with the user programs and
//! must not drift: logical addresses of the code, data and screen regions are
//! baked into the images the loader places in memory.

use static_assertions::const_assert;

/// Number of slots in the task table.
pub const NR_TASKS: usize = 10;

/// Kernel stack size in machine words.
pub const KERNEL_STACK_SIZE: usize = 1024;

/// Semaphores available to one process.
pub const MAX_SEMAPHORES: usize = 20;

/// Largest user stack a thread may request, in bytes.
pub const MAX_STACK_SIZE: usize = 65536;

pub const DEFAULT_QUANTUM: u32 = 10;
pub const DEFAULT_PRIORITY: i32 = 20;
pub const MAX_PRIORITY: i32 = 100;

/// Physical frames (and logical pages) managed by the kernel.
pub const TOTAL_PAGES: usize = 1024;

pub const PAGE_SIZE: usize = 4096;

/// Kernel image + kernel data, identity mapped in every address space.
pub const NUM_PAG_KERNEL: usize = 256;
pub const NUM_PAG_CODE: usize = 8;
pub const NUM_PAG_DATA: usize = 20;

/// First logical address available to user code.
pub const L_USER_START: usize = 0x100000;

/// First logical page of the shared, read-only code region.
pub const PAG_LOG_INIT_CODE: usize = L_USER_START >> 12;

/// First logical page of the per-process data/stack region.
pub const PAG_LOG_INIT_DATA: usize = PAG_LOG_INIT_CODE + NUM_PAG_CODE;

/// First physical frame holding the user code image.
pub const FRAME_INIT_CODE: usize = L_USER_START >> 12;

/// Fixed logical page of the shadow screen, first page above the data region.
/// Every process that calls StartScreen sees the screen at the same address.
pub const SCREEN_LOG_PAGE: usize = PAG_LOG_INIT_DATA + NUM_PAG_DATA;

/// Where the search for per-thread user stacks begins.
pub const USER_FREE_START: usize = SCREEN_LOG_PAGE + 1;

/// Exact rational for the ms -> ticks conversion used by pause.
/// 1000 ms of pause comes out at 18 ticks.
pub const TICKS_PER_MS_NUM: i64 = 18;
pub const TICKS_PER_MS_DEN: i64 = 1000;

// The user regions must fit under the 4 MiB the page table covers, and the
// kernel region must not overlap the user code image.
const_assert!(USER_FREE_START < TOTAL_PAGES);
const_assert!(NUM_PAG_KERNEL <= FRAME_INIT_CODE);
const_assert!(FRAME_INIT_CODE + NUM_PAG_CODE <= TOTAL_PAGES);
const_assert!(PAGE_SIZE == 1 << 12);
