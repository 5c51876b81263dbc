//! Process Memory
//!
//! Backing storage for the three guest region kinds:
//!
//! - Text: read-only, mmapped from a temp file seeded with the artifact's
//!   string literals.
//! - Data: read/write anonymous mapping holding initialized data, BSS and the
//!   bump heap.
//! - Stack: one anonymous mapping per thread, growing downward, with the TLS
//!   record in its topmost aligned slot.
//!
//! Guest pointer values are absolute host addresses (relocation adds the live
//! mapping base), so every access is checked against the table of mapped
//! regions. An access outside the mapped regions panics; `Cpu::run` converts
//! that panic into an instruction trap with a guest stack trace.

use std::io;

use parking_lot::RwLock;

use crate::binary::MemoryModel;

/// Round `n` up to a multiple of `m` (m a power of two).
pub(crate) fn round_up(n: usize, m: usize) -> usize {
    (n + m - 1) & !(m - 1)
}

/// Host page size.
pub(crate) fn page_size() -> usize {
    // SAFETY: sysconf is always callable; _SC_PAGESIZE cannot fail.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Stack slot widths per primitive type: the storage size rounded up to the
/// pointer alignment. These govern every push and pop in the dispatcher.
#[derive(Debug, Clone, Copy)]
pub struct StackSizes {
    pub i8: usize,
    pub i16: usize,
    pub i32: usize,
    pub i64: usize,
    pub f32: usize,
    pub f64: usize,
    pub c64: usize,
    pub c128: usize,
    pub ptr: usize,
    pub long: usize,
}

impl StackSizes {
    pub fn of(model: MemoryModel) -> Self {
        let ptr = model.ptr_size();
        let wide = 8usize.max(ptr);
        Self {
            i8: ptr,
            i16: ptr,
            i32: ptr,
            i64: wide,
            f32: ptr,
            f64: wide,
            c64: wide,
            c128: round_up(16, ptr),
            ptr,
            long: model.long_size().max(ptr),
        }
    }

    /// Stack slot size for a block of `n` raw bytes.
    pub fn block(&self, n: usize) -> usize {
        round_up(n, self.ptr)
    }
}

/// An mmapped extent of host memory.
///
/// The base pointer is stable for the life of the mapping; Drop unmaps.
pub(crate) struct Mapping {
    base: *mut u8,
    len: usize,
}

// SAFETY: the mapping is plain memory; all mutation goes through the checked
// accessors below, callers synchronize guest-visible state themselves.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Anonymous read/write mapping of `len` bytes, zero filled by the kernel.
    pub fn anonymous(len: usize) -> io::Result<Self> {
        // SAFETY: requesting a fresh private mapping; the result is checked.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { base: base as *mut u8, len })
    }

    /// Read-only mapping of the first `len` bytes of an open file.
    pub fn file_read_only(fd: libc::c_int, len: usize) -> io::Result<Self> {
        // SAFETY: fd is owned by the caller and outlives the mapping setup;
        // the result is checked.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { base: base as *mut u8, len })
    }

    pub fn base(&self) -> u64 {
        self.base as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if !self.base.is_null() {
            // SAFETY: base/len came from a successful mmap.
            unsafe { libc::munmap(self.base as *mut libc::c_void, self.len) };
        }
    }
}

/// What a mapped region is used for; stacks and guest mmaps come and go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Text,
    Data,
    Stack,
    Guest,
}

/// A registered guest-visible region.
#[derive(Debug, Clone, Copy)]
pub struct MappedRegion {
    pub base: u64,
    pub size: usize,
    pub kind: RegionKind,
    pub writable: bool,
}

impl MappedRegion {
    fn contains(&self, addr: u64, len: usize) -> bool {
        addr >= self.base && addr + len as u64 <= self.base + self.size as u64
    }
}

/// The table of live regions plus every typed accessor the dispatcher and the
/// built-ins use. Values are little-endian in guest memory, matching the host.
pub struct MemoryMap {
    regions: RwLock<Vec<MappedRegion>>,
    model: MemoryModel,
}

impl MemoryMap {
    pub fn new(model: MemoryModel) -> Self {
        Self { regions: RwLock::new(Vec::new()), model }
    }

    pub fn model(&self) -> MemoryModel {
        self.model
    }

    pub fn register(&self, region: MappedRegion) {
        self.regions.write().push(region);
    }

    pub fn unregister(&self, base: u64) {
        self.regions.write().retain(|r| r.base != base);
    }

    /// Region covering `addr`, if any.
    pub fn region_of(&self, addr: u64) -> Option<MappedRegion> {
        self.regions.read().iter().find(|r| r.contains(addr, 1)).copied()
    }

    /// True when `[addr, addr+len)` lies within one mapped region.
    pub fn is_mapped(&self, addr: u64, len: usize) -> bool {
        self.regions.read().iter().any(|r| r.contains(addr, len))
    }

    /// Run `f` on a raw pointer to `[addr, addr+len)`, holding the region
    /// table read lock so the mapping cannot disappear mid-access. The
    /// recursive read keeps guest-to-guest copies (two nested acquisitions)
    /// from deadlocking against a waiting writer.
    fn with_ptr<R>(&self, addr: u64, len: usize, write: bool, f: impl FnOnce(*mut u8) -> R) -> R {
        let regions = self.regions.read_recursive();
        let region = regions
            .iter()
            .find(|r| r.contains(addr, len))
            .unwrap_or_else(|| {
                panic!("memory trap: {:#x}+{} outside mapped regions", addr, len)
            });
        if write && !region.writable {
            panic!("memory trap: write to read-only region at {:#x}", addr);
        }
        f(addr as *mut u8)
    }

    // ------------------------------------------------------------------
    // Scalar accessors
    // ------------------------------------------------------------------

    pub fn read_u8(&self, addr: u64) -> u8 {
        // SAFETY: with_ptr proved the byte is mapped.
        self.with_ptr(addr, 1, false, |p| unsafe { *p })
    }

    pub fn write_u8(&self, addr: u64, v: u8) {
        // SAFETY: with_ptr proved the byte is mapped and writable.
        self.with_ptr(addr, 1, true, |p| unsafe { *p = v })
    }

    pub fn read_u16(&self, addr: u64) -> u16 {
        let mut b = [0u8; 2];
        self.read_bytes(addr, &mut b);
        u16::from_le_bytes(b)
    }

    pub fn write_u16(&self, addr: u64, v: u16) {
        self.write_bytes(addr, &v.to_le_bytes());
    }

    pub fn read_u32(&self, addr: u64) -> u32 {
        let mut b = [0u8; 4];
        self.read_bytes(addr, &mut b);
        u32::from_le_bytes(b)
    }

    pub fn write_u32(&self, addr: u64, v: u32) {
        self.write_bytes(addr, &v.to_le_bytes());
    }

    pub fn read_u64(&self, addr: u64) -> u64 {
        let mut b = [0u8; 8];
        self.read_bytes(addr, &mut b);
        u64::from_le_bytes(b)
    }

    pub fn write_u64(&self, addr: u64, v: u64) {
        self.write_bytes(addr, &v.to_le_bytes());
    }

    pub fn read_i8(&self, addr: u64) -> i8 {
        self.read_u8(addr) as i8
    }

    pub fn read_i16(&self, addr: u64) -> i16 {
        self.read_u16(addr) as i16
    }

    pub fn read_i32(&self, addr: u64) -> i32 {
        self.read_u32(addr) as i32
    }

    pub fn write_i32(&self, addr: u64, v: i32) {
        self.write_u32(addr, v as u32);
    }

    pub fn read_i64(&self, addr: u64) -> i64 {
        self.read_u64(addr) as i64
    }

    pub fn write_i64(&self, addr: u64, v: i64) {
        self.write_u64(addr, v as u64);
    }

    pub fn read_f32(&self, addr: u64) -> f32 {
        f32::from_bits(self.read_u32(addr))
    }

    pub fn write_f32(&self, addr: u64, v: f32) {
        self.write_u32(addr, v.to_bits());
    }

    pub fn read_f64(&self, addr: u64) -> f64 {
        f64::from_bits(self.read_u64(addr))
    }

    pub fn write_f64(&self, addr: u64, v: f64) {
        self.write_u64(addr, v.to_bits());
    }

    /// float complex: two f32 halves, real then imaginary.
    pub fn read_c64(&self, addr: u64) -> (f32, f32) {
        (self.read_f32(addr), self.read_f32(addr + 4))
    }

    pub fn write_c64(&self, addr: u64, v: (f32, f32)) {
        self.write_f32(addr, v.0);
        self.write_f32(addr + 4, v.1);
    }

    /// double complex: two f64 halves, real then imaginary.
    pub fn read_c128(&self, addr: u64) -> (f64, f64) {
        (self.read_f64(addr), self.read_f64(addr + 8))
    }

    pub fn write_c128(&self, addr: u64, v: (f64, f64)) {
        self.write_f64(addr, v.0);
        self.write_f64(addr + 8, v.1);
    }

    /// Pointer-sized read per the memory model.
    pub fn read_ptr(&self, addr: u64) -> u64 {
        match self.model {
            MemoryModel::M32 => self.read_u32(addr) as u64,
            MemoryModel::M64 => self.read_u64(addr),
        }
    }

    pub fn write_ptr(&self, addr: u64, v: u64) {
        match self.model {
            MemoryModel::M32 => self.write_u32(addr, v as u32),
            MemoryModel::M64 => self.write_u64(addr, v),
        }
    }

    pub fn read_long(&self, addr: u64) -> i64 {
        match self.model {
            MemoryModel::M32 => self.read_i32(addr) as i64,
            MemoryModel::M64 => self.read_i64(addr),
        }
    }

    pub fn write_long(&self, addr: u64, v: i64) {
        match self.model {
            MemoryModel::M32 => self.write_i32(addr, v as i32),
            MemoryModel::M64 => self.write_i64(addr, v),
        }
    }

    // ------------------------------------------------------------------
    // Bulk accessors
    // ------------------------------------------------------------------

    pub fn read_bytes(&self, addr: u64, buf: &mut [u8]) {
        if buf.is_empty() {
            return;
        }
        self.with_ptr(addr, buf.len(), false, |p| {
            // SAFETY: with_ptr proved the range is mapped; buf is host memory.
            unsafe { std::ptr::copy_nonoverlapping(p, buf.as_mut_ptr(), buf.len()) }
        })
    }

    pub fn write_bytes(&self, addr: u64, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.with_ptr(addr, data.len(), true, |p| {
            // SAFETY: with_ptr proved the range is mapped and writable.
            unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), p, data.len()) }
        })
    }

    /// Guest-to-guest copy with memmove semantics (ranges may overlap).
    pub fn copy(&self, dst: u64, src: u64, len: usize) {
        if len == 0 {
            return;
        }
        self.with_ptr(src, len, false, |s| {
            self.with_ptr(dst, len, true, |d| {
                // SAFETY: both ranges proved mapped; copy handles overlap.
                unsafe { std::ptr::copy(s, d, len) }
            })
        })
    }

    pub fn fill(&self, addr: u64, byte: u8, len: usize) {
        if len == 0 {
            return;
        }
        self.with_ptr(addr, len, true, |p| {
            // SAFETY: with_ptr proved the range is mapped and writable.
            unsafe { std::ptr::write_bytes(p, byte, len) }
        })
    }

    /// NUL-terminated guest string at `addr`, without the terminator.
    ///
    /// The scan is bounded by the end of the containing region; a string that
    /// runs off the mapping is a memory trap.
    pub fn c_string(&self, addr: u64) -> Vec<u8> {
        let regions = self.regions.read();
        let region = regions
            .iter()
            .find(|r| r.contains(addr, 1))
            .unwrap_or_else(|| panic!("memory trap: {:#x} outside mapped regions", addr));
        let max = (region.base + region.size as u64 - addr) as usize;
        // SAFETY: [addr, addr+max) is inside the region held by the read lock.
        let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, max) };
        match bytes.iter().position(|&b| b == 0) {
            Some(n) => bytes[..n].to_vec(),
            None => panic!("memory trap: unterminated string at {:#x}", addr),
        }
    }

    pub fn c_string_len(&self, addr: u64) -> usize {
        self.c_string(addr).len()
    }

    /// Hardware compare-and-swap on a 32-bit guest word. Returns the value
    /// witnessed at `addr`, which equals `current` iff the swap happened.
    pub fn cas_u32(&self, addr: u64, current: u32, new: u32) -> u32 {
        use std::sync::atomic::{AtomicU32, Ordering};
        self.with_ptr(addr, 4, true, |p| {
            // SAFETY: the word is mapped, writable and 4 bytes wide; from_ptr
            // requires alignment, which guest code guarantees for ints.
            let cell = unsafe { AtomicU32::from_ptr(p as *mut u32) };
            match cell.compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(v) | Err(v) => v,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_with_data(len: usize) -> (MemoryMap, Mapping) {
        let mapping = Mapping::anonymous(len).unwrap();
        let mem = MemoryMap::new(MemoryModel::M64);
        mem.register(MappedRegion {
            base: mapping.base(),
            size: mapping.len(),
            kind: RegionKind::Data,
            writable: true,
        });
        (mem, mapping)
    }

    #[test]
    fn test_scalar_roundtrip() {
        let (mem, m) = map_with_data(4096);
        let a = m.base();

        mem.write_u32(a + 16, 0xDEADBEEF);
        assert_eq!(mem.read_u32(a + 16), 0xDEADBEEF);

        mem.write_u64(a + 24, 0x1234_5678_9ABC_DEF0);
        assert_eq!(mem.read_u64(a + 24), 0x1234_5678_9ABC_DEF0);

        mem.write_f64(a + 32, -2.5);
        assert_eq!(mem.read_f64(a + 32), -2.5);

        mem.write_ptr(a + 40, a);
        assert_eq!(mem.read_ptr(a + 40), a);
    }

    #[test]
    fn test_copy_overlapping() {
        let (mem, m) = map_with_data(4096);
        let a = m.base();

        mem.write_bytes(a, b"abcdef");
        mem.copy(a + 2, a, 4);
        let mut buf = [0u8; 6];
        mem.read_bytes(a, &mut buf);
        assert_eq!(&buf, b"ababcd");
    }

    #[test]
    fn test_c_string() {
        let (mem, m) = map_with_data(4096);
        let a = m.base();

        mem.write_bytes(a + 8, b"hello\0world");
        assert_eq!(mem.c_string(a + 8), b"hello");
        assert_eq!(mem.c_string_len(a + 8), 5);
    }

    #[test]
    #[should_panic(expected = "memory trap")]
    fn test_unmapped_access_traps() {
        let mem = MemoryMap::new(MemoryModel::M64);
        mem.read_u8(0x1000);
    }

    #[test]
    #[should_panic(expected = "read-only")]
    fn test_readonly_write_traps() {
        let mapping = Mapping::anonymous(4096).unwrap();
        let mem = MemoryMap::new(MemoryModel::M64);
        mem.register(MappedRegion {
            base: mapping.base(),
            size: mapping.len(),
            kind: RegionKind::Text,
            writable: false,
        });
        mem.write_u8(mapping.base(), 1);
    }

    #[test]
    fn test_stack_sizes_64() {
        let sz = StackSizes::of(MemoryModel::M64);
        assert_eq!(sz.i8, 8);
        assert_eq!(sz.i32, 8);
        assert_eq!(sz.i64, 8);
        assert_eq!(sz.c128, 16);
        assert_eq!(sz.long, 8);
        assert_eq!(sz.block(3), 8);
        assert_eq!(sz.block(24), 24);
    }

    #[test]
    fn test_stack_sizes_32() {
        let sz = StackSizes::of(MemoryModel::M32);
        assert_eq!(sz.i8, 4);
        assert_eq!(sz.i64, 8);
        assert_eq!(sz.c128, 16);
        assert_eq!(sz.long, 4);
    }
}
