//! Virtual memory manager for i386 two-level paging.
//!
//! Virtual-address layout:
//!
//! ```text
//! 0xFFFF_FFFF +--------------------------------------+
//!             |        kernel (shared, unused)       |
//! 0xC000_0000 +--------------------------------------+ USER_LIMIT
//! 0xBFF0_0000 | - - - - USER_STACK_TOP - - - - - - - |
//!             |          user stack (N pages)        |
//!             |          guard page (unmapped)       |
//!             |                                      |
//!             |     user image, heap (sbrk grows ^)  |
//! 0x0200_0000 +--------------------------------------+ USER_BASE
//!             |   kernel identity map [0, 32 MiB)    |
//! 0x0000_0000 +--------------------------------------+
//! ```
//!
//! Directory slots outside `[USER_BASE, USER_LIMIT)` belong to the kernel.
//! A user directory copies them verbatim from the kernel directory, so the
//! kernel's page tables are shared and never owned by a user directory.
//! Everything a user directory maps itself is owned through [`Frame`]
//! handles and returned to the pool by [`PageDirectory::destroy`].

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;

use crate::arch::{page_align_down, page_align_up, Machine, PhysAddr, PhysicalMemory, PAGE_SIZE};
use crate::memory::pmm::{Frame, FrameAllocator};
use crate::sync::without_interrupts;

pub const ENTRIES_PER_TABLE: u32 = 1024;

/// End of the kernel identity window. Every frame the kernel manages lies below.
pub const KERNEL_IDENTITY_END: u32 = 0x0200_0000;

pub const USER_BASE: u32 = 0x0200_0000;
pub const USER_LIMIT: u32 = 0xC000_0000;
pub const USER_STACK_TOP: u32 = 0xBFF0_0000;

const ENTRY_FRAME_MASK: u32 = 0xFFFF_F000;
const ENTRY_FLAGS_MASK: u32 = 0x0000_0FFF;

bitflags! {
    /// Low bits of a page-directory or page-table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u32 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        const GLOBAL        = 1 << 8;
    }
}

impl PageFlags {
    /// Present, writable, user-accessible.
    pub const USER_RW: Self = Self::PRESENT.union(Self::WRITABLE).union(Self::USER);
    /// Present, read-only, user-accessible.
    pub const USER_RO: Self = Self::PRESENT.union(Self::USER);
    /// Present, writable, supervisor only.
    pub const KERNEL_RW: Self = Self::PRESENT.union(Self::WRITABLE);
}

bitflags! {
    /// Page-fault error code pushed by the CPU for vector 14.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultCode: u32 {
        /// 0 = page not present, 1 = protection violation.
        const PRESENT           = 1 << 0;
        /// 0 = read, 1 = write.
        const WRITE             = 1 << 1;
        /// 0 = supervisor, 1 = user mode.
        const USER              = 1 << 2;
        /// Reserved bit set in a paging structure.
        const RESERVED_WRITE    = 1 << 3;
        /// Fault was an instruction fetch.
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

impl fmt::Display for PageFaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}{}{}",
            if self.contains(Self::PRESENT) { "protection" } else { "not-present" },
            if self.contains(Self::WRITE) { "write" } else { "read" },
            if self.contains(Self::USER) { "user" } else { "supervisor" },
            if self.contains(Self::RESERVED_WRITE) { " reserved-bit" } else { "" },
            if self.contains(Self::INSTRUCTION_FETCH) { " ifetch" } else { "" },
        )
    }
}

/// Error returned by checked mapping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The frame pool is exhausted.
    OutOfFrames,

    /// Virtual address already has a present mapping.
    AlreadyMapped { virtual_address: u32 },

    /// Nothing is mapped at this address.
    NotMapped { virtual_address: u32 },

    /// A user directory tried to touch a kernel-owned slot.
    KernelRange { virtual_address: u32 },

    /// Address lies outside `[USER_BASE, USER_LIMIT)`.
    NotUserRange { virtual_address: u32 },

    /// Address targets a reserved stack guard page.
    GuardPage { virtual_address: u32 },
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfFrames => write!(f, "out of physical frames"),
            Self::AlreadyMapped { virtual_address } => {
                write!(f, "{:#010x} is already mapped", virtual_address)
            }
            Self::NotMapped { virtual_address } => write!(f, "{:#010x} is not mapped", virtual_address),
            Self::KernelRange { virtual_address } => {
                write!(f, "{:#010x} lies in the shared kernel range", virtual_address)
            }
            Self::NotUserRange { virtual_address } => {
                write!(f, "{:#010x} lies outside the user range", virtual_address)
            }
            Self::GuardPage { virtual_address } => {
                write!(f, "{:#010x} is a stack guard page", virtual_address)
            }
        }
    }
}

#[inline]
pub const fn directory_index(va: u32) -> u32 {
    (va >> 22) & 0x3FF
}

#[inline]
pub const fn table_index(va: u32) -> u32 {
    (va >> 12) & 0x3FF
}

#[inline]
pub const fn is_user_address(va: u32) -> bool {
    va >= USER_BASE && va < USER_LIMIT
}

/// Whether directory slot `index` covers only user addresses.
#[inline]
const fn is_user_slot(index: u32) -> bool {
    index >= directory_index(USER_BASE) && index < directory_index(USER_LIMIT)
}

#[derive(Clone, Copy)]
#[repr(transparent)]
struct PageEntry(u32);

impl PageEntry {
    #[inline]
    fn new(addr: PhysAddr, flags: PageFlags) -> Self {
        Self((addr.as_u32() & ENTRY_FRAME_MASK) | (flags.bits() & ENTRY_FLAGS_MASK))
    }

    #[inline]
    fn present(self) -> bool {
        self.flags().contains(PageFlags::PRESENT)
    }

    #[inline]
    fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & ENTRY_FLAGS_MASK)
    }

    #[inline]
    fn address(self) -> PhysAddr {
        PhysAddr(self.0 & ENTRY_FRAME_MASK)
    }
}

/// Pages of a guarded stack created by [`PageDirectory::map_guarded_stack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardedStack {
    /// The unmapped page directly below `bottom`.
    pub guard: u32,
    /// Lowest mapped stack address.
    pub bottom: u32,
    /// Exclusive upper bound; the initial stack pointer.
    pub top: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryKind {
    Kernel,
    User,
}

/// One address space: a root page plus the page tables and pages it owns.
#[derive(Debug)]
pub struct PageDirectory {
    root: Frame,
    kind: DirectoryKind,
    /// Page tables this directory allocated, keyed by directory slot.
    tables: BTreeMap<u32, Frame>,
    /// Pages this directory owns, keyed by page-aligned virtual address.
    pages: BTreeMap<u32, Frame>,
    /// Guard pages that must stay unmapped.
    guards: Vec<u32>,
}

impl PageDirectory {
    /// Builds the kernel directory with the identity window `[0, identity_end)`.
    pub fn new_kernel(
        mem: &mut (impl PhysicalMemory + ?Sized),
        pmm: &mut FrameAllocator,
        identity_end: u32,
    ) -> Result<Self, MapError> {
        let root = pmm.allocate().ok_or(MapError::OutOfFrames)?;
        mem.zero(root.start_address(), PAGE_SIZE as usize);
        let mut dir = Self {
            root,
            kind: DirectoryKind::Kernel,
            tables: BTreeMap::new(),
            pages: BTreeMap::new(),
            guards: Vec::new(),
        };

        let mut va = 0u32;
        while va < page_align_up(identity_end) {
            if let Err(err) = dir.map_physical(mem, pmm, va, PhysAddr(va), PageFlags::KERNEL_RW) {
                dir.destroy(pmm);
                return Err(err);
            }
            va += PAGE_SIZE;
        }
        log::info!(
            "kernel directory at {:#x}, identity window {:#x}",
            dir.root.start_address().as_u32(),
            identity_end
        );
        Ok(dir)
    }

    /// Creates a user directory: kernel slots shared, user range empty.
    pub fn new_user(
        kernel: &PageDirectory,
        mem: &mut (impl PhysicalMemory + ?Sized),
        pmm: &mut FrameAllocator,
    ) -> Result<Self, MapError> {
        let root = pmm.allocate().ok_or(MapError::OutOfFrames)?;
        mem.zero(root.start_address(), PAGE_SIZE as usize);
        for index in 0..ENTRIES_PER_TABLE {
            if is_user_slot(index) {
                continue;
            }
            let pde = mem.read_u32(kernel.slot_address(index));
            if pde != 0 {
                mem.write_u32(root.start_address().offset(index * 4), pde);
            }
        }
        Ok(Self {
            root,
            kind: DirectoryKind::User,
            tables: BTreeMap::new(),
            pages: BTreeMap::new(),
            guards: Vec::new(),
        })
    }

    /// Physical address loaded into CR3 for this directory.
    #[inline]
    pub fn root(&self) -> PhysAddr {
        self.root.start_address()
    }

    #[inline]
    pub fn kind(&self) -> DirectoryKind {
        self.kind
    }

    /// Number of leaf pages this directory owns.
    pub fn owned_pages(&self) -> usize {
        self.pages.len()
    }

    /// Number of page tables this directory owns.
    pub fn owned_tables(&self) -> usize {
        self.tables.len()
    }

    /// Makes this directory the active address space.
    pub fn activate(&self, machine: &mut (impl Machine + ?Sized)) {
        let root = self.root();
        without_interrupts(machine, |m| {
            if m.active_page_directory() != root {
                m.load_page_directory(root);
            }
        });
    }

    fn slot_address(&self, index: u32) -> PhysAddr {
        self.root.start_address().offset(index * 4)
    }

    fn check_range(&self, va: u32) -> Result<(), MapError> {
        match self.kind {
            DirectoryKind::User if !is_user_address(va) => {
                Err(MapError::KernelRange { virtual_address: va })
            }
            DirectoryKind::Kernel if is_user_address(va) => {
                Err(MapError::NotUserRange { virtual_address: va })
            }
            _ => Ok(()),
        }
    }

    /// Returns the page table covering `va`, allocating it when missing.
    ///
    /// The second value tells whether the table was created by this call.
    fn ensure_table(
        &mut self,
        mem: &mut (impl PhysicalMemory + ?Sized),
        pmm: &mut FrameAllocator,
        va: u32,
        flags: PageFlags,
    ) -> Result<(PhysAddr, bool), MapError> {
        let index = directory_index(va);
        let slot = self.slot_address(index);
        let pde = PageEntry(mem.read_u32(slot));
        if pde.present() {
            if flags.contains(PageFlags::USER) && !pde.flags().contains(PageFlags::USER) {
                mem.write_u32(slot, pde.0 | PageFlags::USER.bits());
            }
            return Ok((pde.address(), false));
        }

        let table = pmm.allocate().ok_or(MapError::OutOfFrames)?;
        let table_addr = table.start_address();
        mem.zero(table_addr, PAGE_SIZE as usize);
        let mut pde_flags = PageFlags::KERNEL_RW;
        if flags.contains(PageFlags::USER) {
            pde_flags |= PageFlags::USER;
        }
        mem.write_u32(slot, PageEntry::new(table_addr, pde_flags).0);
        self.tables.insert(index, table);
        Ok((table_addr, true))
    }

    /// Drops a table created during a failed multi-step operation.
    fn drop_table(
        &mut self,
        mem: &mut (impl PhysicalMemory + ?Sized),
        pmm: &mut FrameAllocator,
        index: u32,
    ) {
        if let Some(table) = self.tables.remove(&index) {
            mem.write_u32(self.slot_address(index), 0);
            pmm.release(table);
        }
    }

    fn entry_address(&self, mem: &(impl PhysicalMemory + ?Sized), va: u32) -> Option<PhysAddr> {
        let pde = PageEntry(mem.read_u32(self.slot_address(directory_index(va))));
        if !pde.present() {
            return None;
        }
        Some(pde.address().offset(table_index(va) * 4))
    }

    /// Maps `va` to a physical address this directory does not own.
    pub fn map_physical(
        &mut self,
        mem: &mut (impl PhysicalMemory + ?Sized),
        pmm: &mut FrameAllocator,
        va: u32,
        pa: PhysAddr,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        let va = page_align_down(va);
        self.check_range(va)?;
        if self.guards.contains(&va) {
            return Err(MapError::GuardPage { virtual_address: va });
        }
        let (table, _) = self.ensure_table(mem, pmm, va, flags)?;
        let entry_addr = table.offset(table_index(va) * 4);
        if PageEntry(mem.read_u32(entry_addr)).present() {
            return Err(MapError::AlreadyMapped { virtual_address: va });
        }
        mem.write_u32(entry_addr, PageEntry::new(pa, flags | PageFlags::PRESENT).0);
        Ok(())
    }

    /// Maps `va` to `frame`, taking ownership of it.
    ///
    /// On failure the frame goes straight back to `pmm`.
    pub fn map_frame(
        &mut self,
        mem: &mut (impl PhysicalMemory + ?Sized),
        pmm: &mut FrameAllocator,
        va: u32,
        frame: Frame,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        let va = page_align_down(va);
        match self.map_physical(mem, pmm, va, frame.start_address(), flags) {
            Ok(()) => {
                self.pages.insert(va, frame);
                Ok(())
            }
            Err(err) => {
                pmm.release(frame);
                Err(err)
            }
        }
    }

    /// Allocates a zeroed frame and maps it at `va`.
    pub fn map_zeroed(
        &mut self,
        mem: &mut (impl PhysicalMemory + ?Sized),
        pmm: &mut FrameAllocator,
        va: u32,
        flags: PageFlags,
    ) -> Result<PhysAddr, MapError> {
        let frame = pmm.allocate().ok_or(MapError::OutOfFrames)?;
        let addr = frame.start_address();
        mem.zero(addr, PAGE_SIZE as usize);
        self.map_frame(mem, pmm, va, frame, flags)?;
        Ok(addr)
    }

    /// Removes the mapping at `va`, releasing the frame if this directory owns it.
    pub fn unmap(
        &mut self,
        mem: &mut (impl PhysicalMemory + ?Sized),
        pmm: &mut FrameAllocator,
        va: u32,
    ) -> Result<(), MapError> {
        let va = page_align_down(va);
        self.check_range(va)?;
        let entry_addr = self
            .entry_address(mem, va)
            .ok_or(MapError::NotMapped { virtual_address: va })?;
        if !PageEntry(mem.read_u32(entry_addr)).present() {
            return Err(MapError::NotMapped { virtual_address: va });
        }
        mem.write_u32(entry_addr, 0);
        if let Some(frame) = self.pages.remove(&va) {
            pmm.release(frame);
        }
        Ok(())
    }

    /// Resolves `va` to its physical address and leaf flags.
    pub fn translate(&self, mem: &(impl PhysicalMemory + ?Sized), va: u32) -> Option<(PhysAddr, PageFlags)> {
        let pde = PageEntry(mem.read_u32(self.slot_address(directory_index(va))));
        if !pde.present() {
            return None;
        }
        let pte = PageEntry(mem.read_u32(pde.address().offset(table_index(va) * 4)));
        if !pte.present() {
            return None;
        }
        // Effective permissions are the intersection of both levels.
        let mut flags = pte.flags();
        if !pde.flags().contains(PageFlags::USER) {
            flags.remove(PageFlags::USER);
        }
        if !pde.flags().contains(PageFlags::WRITABLE) {
            flags.remove(PageFlags::WRITABLE);
        }
        Some((pte.address().offset(va & (PAGE_SIZE - 1)), flags))
    }

    /// Whether ring 3 may access the page holding `va` (for writing if `write`).
    pub fn is_user_accessible(&self, mem: &(impl PhysicalMemory + ?Sized), va: u32, write: bool) -> bool {
        if !is_user_address(va) {
            return false;
        }
        match self.translate(mem, va) {
            Some((_, flags)) => {
                flags.contains(PageFlags::USER) && (!write || flags.contains(PageFlags::WRITABLE))
            }
            None => false,
        }
    }

    /// Checks every page touched by `[va, va + len)`.
    pub fn is_user_range_accessible(
        &self,
        mem: &(impl PhysicalMemory + ?Sized),
        va: u32,
        len: u32,
        write: bool,
    ) -> bool {
        if len == 0 {
            return true;
        }
        let Some(end) = va.checked_add(len) else {
            return false;
        };
        if !is_user_address(va) || end > USER_LIMIT {
            return false;
        }
        let mut page = page_align_down(va);
        while page < end {
            if !self.is_user_accessible(mem, page, write) {
                return false;
            }
            page = match page.checked_add(PAGE_SIZE) {
                Some(next) => next,
                None => break,
            };
        }
        true
    }

    /// Reserves page tables for `[va, va + size)` without mapping any page.
    ///
    /// On failure every table created by this call is released again.
    pub fn prepare_range(
        &mut self,
        mem: &mut (impl PhysicalMemory + ?Sized),
        pmm: &mut FrameAllocator,
        va: u32,
        size: u32,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        if size == 0 {
            return Ok(());
        }
        let start = page_align_down(va);
        let end = page_align_up(va.saturating_add(size));
        self.check_range(start)?;
        self.check_range(end - 1)?;

        let mut created = Vec::new();
        let mut index = directory_index(start);
        let last = directory_index(end - 1);
        while index <= last {
            match self.ensure_table(mem, pmm, index << 22, flags) {
                Ok((_, true)) => created.push(index),
                Ok((_, false)) => {}
                Err(err) => {
                    for idx in created {
                        self.drop_table(mem, pmm, idx);
                    }
                    return Err(err);
                }
            }
            index += 1;
        }
        Ok(())
    }

    /// Maps `pages` writable user pages ending at `top`, with an unmapped guard below.
    ///
    /// Either the whole stack is mapped or nothing is: on failure, pages and
    /// tables created by this call are released.
    pub fn map_guarded_stack(
        &mut self,
        mem: &mut (impl PhysicalMemory + ?Sized),
        pmm: &mut FrameAllocator,
        top: u32,
        pages: u32,
    ) -> Result<GuardedStack, MapError> {
        let top = page_align_down(top);
        let size = pages
            .checked_mul(PAGE_SIZE)
            .ok_or(MapError::NotUserRange { virtual_address: top })?;
        let bottom = top
            .checked_sub(size)
            .ok_or(MapError::NotUserRange { virtual_address: top })?;
        let guard = bottom
            .checked_sub(PAGE_SIZE)
            .ok_or(MapError::NotUserRange { virtual_address: bottom })?;
        if self.kind != DirectoryKind::User || !is_user_address(guard) || top > USER_LIMIT {
            return Err(MapError::NotUserRange { virtual_address: guard });
        }
        if self.translate(mem, guard).is_some() {
            return Err(MapError::AlreadyMapped { virtual_address: guard });
        }

        self.map_zeroed_range(mem, pmm, bottom, top, PageFlags::USER_RW)?;
        self.guards.push(guard);
        log::debug!("stack {:#x}..{:#x} guard {:#x}", bottom, top, guard);
        Ok(GuardedStack { guard, bottom, top })
    }

    /// Maps zeroed pages over `[start, end)`, all or nothing.
    ///
    /// On failure the pages and page tables created by this call are
    /// released again, so the pool and the directory look untouched.
    pub fn map_zeroed_range(
        &mut self,
        mem: &mut (impl PhysicalMemory + ?Sized),
        pmm: &mut FrameAllocator,
        start: u32,
        end: u32,
        flags: PageFlags,
    ) -> Result<(), MapError> {
        let tables_before: Vec<u32> = self.tables.keys().copied().collect();
        let mut va = start;
        while va < end {
            if let Err(err) = self.map_zeroed(mem, pmm, va, flags) {
                let mut page = start;
                while page < va {
                    let _ = self.unmap(mem, pmm, page);
                    page += PAGE_SIZE;
                }
                let created: Vec<u32> = self
                    .tables
                    .keys()
                    .copied()
                    .filter(|idx| !tables_before.contains(idx))
                    .collect();
                for idx in created {
                    self.drop_table(mem, pmm, idx);
                }
                return Err(err);
            }
            va += PAGE_SIZE;
        }
        Ok(())
    }

    /// Whether `va` falls on a recorded guard page.
    pub fn is_guard_page(&self, va: u32) -> bool {
        self.guards.contains(&page_align_down(va))
    }

    /// Copies `data` into the pages backing `[va, va + len)` without permission checks.
    ///
    /// Used by the kernel when populating an address space that is not active.
    pub fn write_bytes(
        &self,
        mem: &mut (impl PhysicalMemory + ?Sized),
        va: u32,
        data: &[u8],
    ) -> Result<(), MapError> {
        let mut done = 0usize;
        while done < data.len() {
            let cur = va + done as u32;
            let (pa, _) = self
                .translate(mem, cur)
                .ok_or(MapError::NotMapped { virtual_address: cur })?;
            let in_page = (PAGE_SIZE - (cur & (PAGE_SIZE - 1))) as usize;
            let n = in_page.min(data.len() - done);
            mem.write(pa, &data[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// Returns every owned frame (pages, tables, root) to the pool.
    pub fn destroy(self, pmm: &mut FrameAllocator) {
        let Self { root, pages, tables, .. } = self;
        let page_count = pages.len();
        pmm.release_all(pages.into_values());
        pmm.release_all(tables.into_values());
        log::debug!("released directory {:?} with {} pages", root, page_count);
        pmm.release(root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_split_address() {
        assert_eq!(directory_index(0xBFF0_0000), 0x2FF);
        assert_eq!(table_index(0xBFF0_0000), 0x300);
        assert_eq!(directory_index(USER_BASE), 8);
    }

    #[test]
    fn user_range_bounds() {
        assert!(!is_user_address(USER_BASE - 1));
        assert!(is_user_address(USER_BASE));
        assert!(is_user_address(USER_LIMIT - 1));
        assert!(!is_user_address(USER_LIMIT));
    }

    #[test]
    fn fault_code_display() {
        let code = PageFaultCode::USER;
        assert_eq!(code.to_string(), "not-present read user");
        let code = PageFaultCode::PRESENT | PageFaultCode::WRITE | PageFaultCode::INSTRUCTION_FETCH;
        assert_eq!(code.to_string(), "protection write supervisor ifetch");
    }
}
