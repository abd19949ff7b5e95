//! Checked transfers between kernel buffers and user memory.
//!
//! Nothing here dereferences a user address. Every access translates the
//! address through the caller's page directory and touches the backing frame
//! through [`PhysicalMemory`]. Buffers are verified page by page before the
//! first byte moves, so a failed call leaves user memory untouched.

use alloc::string::String;
use alloc::vec::Vec;

use crate::arch::{PhysicalMemory, PAGE_SIZE};
use crate::memory::vmm::PageDirectory;
use crate::scheduler::TaskTable;

use super::Errno;

/// Address space of the calling task. Kernel tasks have none.
pub fn caller_directory(tasks: &TaskTable) -> Result<&PageDirectory, Errno> {
    tasks
        .current()
        .and_then(|t| t.space.as_ref())
        .map(|space| &space.dir)
        .ok_or(Errno::EFAULT)
}

fn check_range(
    dir: &PageDirectory,
    mem: &(impl PhysicalMemory + ?Sized),
    va: u32,
    len: usize,
    write: bool,
) -> Result<(), Errno> {
    let len = u32::try_from(len).map_err(|_| Errno::EFAULT)?;
    if va == 0 || !dir.is_user_range_accessible(mem, va, len, write) {
        return Err(Errno::EFAULT);
    }
    Ok(())
}

/// Walks `[va, va + len)` in page-sized pieces, yielding `(physical, offset, n)`.
fn for_each_chunk(
    dir: &PageDirectory,
    mem: &(impl PhysicalMemory + ?Sized),
    va: u32,
    len: usize,
    mut f: impl FnMut(crate::arch::PhysAddr, usize, usize),
) -> Result<(), Errno> {
    let mut done = 0usize;
    while done < len {
        let cur = va + done as u32;
        let (pa, _) = dir.translate(mem, cur).ok_or(Errno::EFAULT)?;
        let in_page = (PAGE_SIZE - (cur & (PAGE_SIZE - 1))) as usize;
        let n = in_page.min(len - done);
        f(pa, done, n);
        done += n;
    }
    Ok(())
}

/// Verifies that the caller may write `len` bytes at `va`.
pub fn check_writable(
    dir: &PageDirectory,
    mem: &(impl PhysicalMemory + ?Sized),
    va: u32,
    len: usize,
) -> Result<(), Errno> {
    if len == 0 {
        return Ok(());
    }
    check_range(dir, mem, va, len, true)
}

pub fn copy_from_user(
    dir: &PageDirectory,
    mem: &(impl PhysicalMemory + ?Sized),
    va: u32,
    buf: &mut [u8],
) -> Result<(), Errno> {
    if buf.is_empty() {
        return Ok(());
    }
    check_range(dir, mem, va, buf.len(), false)?;
    let len = buf.len();
    for_each_chunk(dir, mem, va, len, |pa, off, n| {
        mem.read(pa, &mut buf[off..off + n]);
    })
}

/// Verifies that the caller may read `len` bytes at `va`.
pub fn check_readable(
    dir: &PageDirectory,
    mem: &(impl PhysicalMemory + ?Sized),
    va: u32,
    len: usize,
) -> Result<(), Errno> {
    if len == 0 {
        return Ok(());
    }
    check_range(dir, mem, va, len, false)
}

/// Reads `len` bytes into a new buffer.
///
/// The range is validated before the buffer is allocated, so a bogus length
/// fails with EFAULT instead of exhausting the kernel heap.
pub fn read_user_bytes(
    dir: &PageDirectory,
    mem: &(impl PhysicalMemory + ?Sized),
    va: u32,
    len: usize,
) -> Result<Vec<u8>, Errno> {
    check_readable(dir, mem, va, len)?;
    let mut buf = alloc::vec![0u8; len];
    copy_from_user(dir, mem, va, &mut buf)?;
    Ok(buf)
}

pub fn copy_to_user(
    dir: &PageDirectory,
    mem: &mut (impl PhysicalMemory + ?Sized),
    va: u32,
    data: &[u8],
) -> Result<(), Errno> {
    if data.is_empty() {
        return Ok(());
    }
    check_range(dir, mem, va, data.len(), true)?;

    // Translation happens on the read-only view first; the writes follow.
    let mut pieces = Vec::new();
    for_each_chunk(dir, mem, va, data.len(), |pa, off, n| pieces.push((pa, off, n)))?;
    for (pa, off, n) in pieces {
        mem.write(pa, &data[off..off + n]);
    }
    Ok(())
}

pub fn read_user_u32(
    dir: &PageDirectory,
    mem: &(impl PhysicalMemory + ?Sized),
    va: u32,
) -> Result<u32, Errno> {
    let mut raw = [0u8; 4];
    copy_from_user(dir, mem, va, &mut raw)?;
    Ok(u32::from_le_bytes(raw))
}

/// Copies a NUL-terminated string of at most `max` bytes, NUL included.
///
/// Fails with EFAULT when a byte lies on an inaccessible page and with
/// ENAMETOOLONG when no NUL appears within `max` bytes.
pub fn copy_string_from_user(
    dir: &PageDirectory,
    mem: &(impl PhysicalMemory + ?Sized),
    va: u32,
    max: usize,
) -> Result<String, Errno> {
    if va == 0 {
        return Err(Errno::EFAULT);
    }
    let mut bytes = Vec::new();
    let mut checked_page = None;
    for i in 0..max {
        let addr = va.checked_add(i as u32).ok_or(Errno::EFAULT)?;
        let page = addr & !(PAGE_SIZE - 1);
        if checked_page != Some(page) {
            if !dir.is_user_accessible(mem, addr, false) {
                return Err(Errno::EFAULT);
            }
            checked_page = Some(page);
        }
        let (pa, _) = dir.translate(mem, addr).ok_or(Errno::EFAULT)?;
        let mut byte = [0u8; 1];
        mem.read(pa, &mut byte);
        if byte[0] == 0 {
            return String::from_utf8(bytes).map_err(|_| Errno::EINVAL);
        }
        bytes.push(byte[0]);
    }
    Err(Errno::ENAMETOOLONG)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::vmm::{PageFlags, KERNEL_IDENTITY_END, USER_BASE};
    use crate::memory::FrameAllocator;
    use crate::testing::MockMachine;
    use crate::arch::PhysAddr;

    fn setup() -> (MockMachine, FrameAllocator, PageDirectory) {
        let mut machine = MockMachine::new(8 << 20);
        let mut pmm = FrameAllocator::new(PhysAddr(8 << 20));
        pmm.add_region(PhysAddr(0x0010_0000), (8 << 20) - 0x0010_0000);
        let kernel = PageDirectory::new_kernel(&mut machine, &mut pmm, KERNEL_IDENTITY_END).unwrap();
        let mut dir = PageDirectory::new_user(&kernel, &mut machine, &mut pmm).unwrap();
        dir.map_zeroed(&mut machine, &mut pmm, USER_BASE, PageFlags::USER_RW).unwrap();
        (machine, pmm, dir)
    }

    #[test]
    fn string_stops_at_nul() {
        let (mut machine, _pmm, dir) = setup();
        dir.write_bytes(&mut machine, USER_BASE, b"/bin/ls\0junk").unwrap();
        let s = copy_string_from_user(&dir, &machine, USER_BASE, 256).unwrap();
        assert_eq!(s, "/bin/ls");
    }

    #[test]
    fn unterminated_string_is_rejected() {
        let (mut machine, _pmm, dir) = setup();
        dir.write_bytes(&mut machine, USER_BASE, b"abcdefgh").unwrap();
        assert_eq!(
            copy_string_from_user(&dir, &machine, USER_BASE, 4),
            Err(Errno::ENAMETOOLONG)
        );
    }

    #[test]
    fn null_pointer_faults() {
        let (machine, _pmm, dir) = setup();
        let mut buf = [0u8; 4];
        assert_eq!(copy_from_user(&dir, &machine, 0, &mut buf), Err(Errno::EFAULT));
    }

    #[test]
    fn kernel_addresses_are_refused() {
        let (machine, _pmm, dir) = setup();
        assert_eq!(read_user_u32(&dir, &machine, 0x0010_0000), Err(Errno::EFAULT));
    }
}
