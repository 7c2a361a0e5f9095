//! Per-task page tables.
//!
//! The logical address space is 4 MiB flat, so one level of 1024 entries per
//! task covers it. Tables live in a fixed kernel arena with a guard slot on
//! each end; tasks refer to their table by arena slot, never by pointer.

use alloc::boxed::Box;
use alloc::vec::Vec;
use bitflags::bitflags;

use crate::errors::SysError;
use crate::mm::frames::FrameAllocator;
use crate::mm::layout::{NR_TASKS, PAGE_SIZE, TOTAL_PAGES};

bitflags! {
    /// Page-table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        const PRESENT = 1 << 0;
        const RW = 1 << 1;
        const USER = 1 << 2;
    }
}

/// A packed page-table entry: frame number in the upper 20 bits, flags below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pte(u32);

impl Pte {
    pub const EMPTY: Pte = Pte(0);

    pub fn new(frame: usize, flags: PteFlags) -> Self {
        Pte((frame as u32) << 12 | flags.bits())
    }

    pub fn is_unused(self) -> bool {
        self.0 == 0
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    pub fn frame(self) -> usize {
        (self.0 >> 12) as usize
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }
}

/// One task's page table.
#[derive(Clone)]
pub struct PageTable {
    entries: [Pte; TOTAL_PAGES],
}

impl PageTable {
    pub fn new() -> Self {
        PageTable {
            entries: [Pte::EMPTY; TOTAL_PAGES],
        }
    }

    /// Installs a mapping for `page`.
    pub fn map(&mut self, page: usize, frame: usize, flags: PteFlags) {
        self.entries[page] = Pte::new(frame, flags | PteFlags::PRESENT);
    }

    /// Clears the mapping for `page`.
    pub fn unmap(&mut self, page: usize) {
        self.entries[page] = Pte::EMPTY;
    }

    pub fn entry(&self, page: usize) -> Pte {
        self.entries[page]
    }

    /// Installs a raw entry, sharing whatever frame and flags it carries.
    pub fn set_entry(&mut self, page: usize, pte: Pte) {
        self.entries[page] = pte;
    }

    /// The physical frame `page` maps to, if present.
    pub fn frame_of(&self, page: usize) -> Option<usize> {
        let pte = self.entries[page];
        pte.is_present().then(|| pte.frame())
    }

    /// Resolves a logical byte address to (frame, offset).
    fn translate(&self, addr: u32) -> Option<(usize, usize)> {
        let page = addr as usize >> 12;
        if page >= TOTAL_PAGES {
            return None;
        }
        self.frame_of(page).map(|f| (f, addr as usize & 0xFFF))
    }

    pub fn clear(&mut self) {
        self.entries = [Pte::EMPTY; TOTAL_PAGES];
    }
}

/// Searches for `n_pages` consecutive unmapped pages at or above `start_page`,
/// skipping any range in `stacks` (base page, page count pairs covering the
/// live user stacks of the requesting process). Lowest address wins.
pub fn search_free_region(
    pt: &PageTable,
    start_page: usize,
    n_pages: usize,
    stacks: &[(usize, usize)],
) -> Option<usize> {
    if n_pages == 0 {
        return None;
    }
    let mut base = start_page;
    'search: while base + n_pages <= TOTAL_PAGES {
        for (stack_base, stack_pages) in stacks.iter().copied() {
            // Overlap check against an occupied stack range.
            if base < stack_base + stack_pages && stack_base < base + n_pages {
                base = stack_base + stack_pages;
                continue 'search;
            }
        }
        for page in base..base + n_pages {
            if !pt.entry(page).is_unused() {
                base = page + 1;
                continue 'search;
            }
        }
        return Some(base);
    }
    None
}

/// Arena of page tables, one slot per task plus a guard slot on each end.
pub struct DirArena {
    tables: Box<[PageTable]>,
    used: [bool; NR_TASKS + 2],
}

impl DirArena {
    pub fn new() -> Self {
        let tables: Vec<PageTable> = (0..NR_TASKS + 2).map(|_| PageTable::new()).collect();
        let mut used = [false; NR_TASKS + 2];
        // Guard slots are never handed out.
        used[0] = true;
        used[NR_TASKS + 1] = true;
        DirArena {
            tables: tables.into_boxed_slice(),
            used,
        }
    }

    /// Claims a free directory slot. Does not populate any entries.
    pub fn alloc(&mut self) -> Result<usize, SysError> {
        for slot in 1..=NR_TASKS {
            if !self.used[slot] {
                self.used[slot] = true;
                return Ok(slot);
            }
        }
        Err(SysError::NoMem)
    }

    /// Releases a directory slot, wiping its entries so a later owner starts
    /// from an empty table.
    pub fn free(&mut self, slot: usize) {
        debug_assert!(self.used[slot]);
        self.tables[slot].clear();
        self.used[slot] = false;
    }

    pub fn table(&self, slot: usize) -> &PageTable {
        &self.tables[slot]
    }

    pub fn table_mut(&mut self, slot: usize) -> &mut PageTable {
        &mut self.tables[slot]
    }
}

/// Verifies that `len` bytes at user address `addr` are mapped user pages,
/// writable ones when `write` is set.
pub fn access_ok(pt: &PageTable, addr: u32, len: usize, write: bool) -> bool {
    if len == 0 {
        return true;
    }
    let Some(end) = (addr as usize).checked_add(len - 1) else {
        return false;
    };
    if end >> 12 >= TOTAL_PAGES {
        return false;
    }
    for page in (addr as usize >> 12)..=(end >> 12) {
        let flags = pt.entry(page).flags();
        if !flags.contains(PteFlags::PRESENT | PteFlags::USER) {
            return false;
        }
        if write && !flags.contains(PteFlags::RW) {
            return false;
        }
    }
    true
}

/// Copies bytes from user memory into a kernel buffer.
pub fn copy_from_user(
    pt: &PageTable,
    frames: &FrameAllocator,
    addr: u32,
    dst: &mut [u8],
) -> Result<(), SysError> {
    let mut addr = addr as usize;
    let mut copied = 0;
    while copied < dst.len() {
        let (frame, offset) = pt.translate(addr as u32).ok_or(SysError::Fault)?;
        let chunk = (PAGE_SIZE - offset).min(dst.len() - copied);
        dst[copied..copied + chunk].copy_from_slice(&frames.frame(frame)[offset..offset + chunk]);
        addr += chunk;
        copied += chunk;
    }
    Ok(())
}

/// Copies a kernel buffer out to user memory.
pub fn copy_to_user(
    pt: &PageTable,
    frames: &mut FrameAllocator,
    src: &[u8],
    addr: u32,
) -> Result<(), SysError> {
    let mut addr = addr as usize;
    let mut copied = 0;
    while copied < src.len() {
        let (frame, offset) = pt.translate(addr as u32).ok_or(SysError::Fault)?;
        let chunk = (PAGE_SIZE - offset).min(src.len() - copied);
        frames.frame_mut(frame)[offset..offset + chunk]
            .copy_from_slice(&src[copied..copied + chunk]);
        addr += chunk;
        copied += chunk;
    }
    Ok(())
}

/// Reads one machine word from user memory.
pub fn read_user_word(
    pt: &PageTable,
    frames: &FrameAllocator,
    addr: u32,
) -> Result<u32, SysError> {
    let mut buf = [0u8; 4];
    copy_from_user(pt, frames, addr, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Writes one machine word to user memory.
pub fn write_user_word(
    pt: &PageTable,
    frames: &mut FrameAllocator,
    addr: u32,
    value: u32,
) -> Result<(), SysError> {
    copy_to_user(pt, frames, &value.to_le_bytes(), addr)
}

/// Page-granular copy between two logical regions of the same address space.
/// This is what the fork path runs with a scratch mapping installed: both
/// sides resolve through the page table, exactly as the copy would on the
/// real MMU.
pub fn copy_data(
    pt: &PageTable,
    frames: &mut FrameAllocator,
    src_addr: u32,
    dst_addr: u32,
    len: usize,
) {
    debug_assert!(src_addr as usize % PAGE_SIZE == 0 && dst_addr as usize % PAGE_SIZE == 0);
    debug_assert!(len % PAGE_SIZE == 0);
    for i in 0..len / PAGE_SIZE {
        let src_page = (src_addr as usize >> 12) + i;
        let dst_page = (dst_addr as usize >> 12) + i;
        let src_frame = pt.frame_of(src_page).expect("copy_data: unmapped source");
        let dst_frame = pt
            .frame_of(dst_page)
            .expect("copy_data: unmapped destination");
        frames.copy_frame(src_frame, dst_frame);
    }
}
