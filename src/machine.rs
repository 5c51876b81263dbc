//! Machine
//!
//! The process-wide half of the emulator: owns the text and data mappings,
//! applies load-time relocations, hands out heap memory from a bump
//! allocator, numbers threads, and carries the cooperative kill channel every
//! CPU polls.
//!
//! Lifecycle: built from a `Binary`, killed at most once, unmapped on drop.
//! All guest-visible resources (FILE handles, guest mutexes, guest mmaps) are
//! members of the machine so that two machines in one process cannot see each
//! other's state.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::binary::{Binary, MemoryModel, PcInfo};
use crate::builtins::pthread::MutexRegistry;
use crate::builtins::stdio::FileRegistry;
use crate::memory::{self, MappedRegion, Mapping, MemoryMap, RegionKind, StackSizes};
use crate::thread::Thread;
use crate::trace::StackTrace;

/// Error taxonomy of the execution engine.
///
/// Built-ins never produce these for host failures; they set guest `errno`
/// and return a sentinel instead. These are the fatal kinds only.
#[derive(Debug, Error)]
pub enum VmError {
    /// Cooperative cancellation; exit status -1.
    #[error("killed")]
    Killed,
    /// Unknown opcode, malformed ext slot, or a memory trap.
    #[error("instruction trap: {reason}\n{trace}")]
    InstructionTrap { reason: String, trace: StackTrace },
    /// The front end planted a `Panic` opcode on an unreachable path.
    #[error("guest panic\n{trace}")]
    GuestPanic { trace: StackTrace },
    /// The frame walker could not reconstruct a caller.
    #[error("bad frame while unwinding: {0}")]
    BadFrame(String),
    /// The artifact exports no `_start`.
    #[error("binary has no entry symbol")]
    NoEntry,
    /// Text or data segment mapping failed at construction.
    #[error("process memory mapping failed: {0}")]
    Mapping(#[source] io::Error),
    /// A thread stack mapping failed.
    #[error("thread stack mapping failed: {0}")]
    ThreadStack(#[source] io::Error),
}

/// Byte sink for guest stdout/stderr, source for stdin.
pub type OutputSink = Mutex<Box<dyn Write + Send>>;
pub type InputSource = Mutex<Box<dyn Read + Send>>;

pub(crate) struct ThreadInfo {
    pub id: u64,
    pub stack_base: u64,
    pub stack_size: usize,
}

/// One emulated process: address space, heap, threads, kill switch.
pub struct Machine {
    binary: Binary,
    pub(crate) mem: MemoryMap,
    sz: StackSizes,

    pub(crate) text_base: u64,
    pub(crate) ds_base: u64,
    bss_base: u64,
    heap_limit: u64,
    brk: Mutex<u64>,

    // Field order is teardown order: data before text before its backing file.
    data_map: Mapping,
    text_map: Option<Mapping>,
    text_file: Option<NamedTempFile>,

    stop_rx: Receiver<()>,
    stop_tx: Mutex<Option<Sender<()>>>,

    next_tid: AtomicU64,
    pub(crate) threads: Mutex<Vec<ThreadInfo>>,

    pub(crate) stdin: InputSource,
    pub(crate) stdout: OutputSink,
    pub(crate) stderr: OutputSink,
    pub(crate) trace_path: Option<PathBuf>,

    pub(crate) files: FileRegistry,
    pub(crate) mutexes: MutexRegistry,
    guest_maps: Mutex<Vec<Mapping>>,
    env_cache: Mutex<HashMap<String, u64>>,
}

impl Machine {
    /// Map the segments, apply relocations, arm the kill channel.
    pub fn new(
        binary: Binary,
        heap_size: usize,
        stdin: Box<dyn Read + Send>,
        stdout: Box<dyn Write + Send>,
        stderr: Box<dyn Write + Send>,
        trace_path: Option<PathBuf>,
    ) -> Result<Self, VmError> {
        let page = memory::page_size();
        let mem = MemoryMap::new(binary.model);
        let sz = StackSizes::of(binary.model);

        // Text segment: read-only map of a temp file seeded with the
        // literals. Programs without literals get no text mapping at all.
        let (text_file, text_map, text_base) = if binary.text.is_empty() {
            (None, None, 0)
        } else {
            let mut file = NamedTempFile::new().map_err(VmError::Mapping)?;
            let len = memory::round_up(binary.text.len(), page);
            file.write_all(&binary.text).map_err(VmError::Mapping)?;
            file.as_file()
                .set_len(len as u64)
                .map_err(VmError::Mapping)?;
            let map = Mapping::file_read_only(file.as_file().as_raw_fd(), len)
                .map_err(VmError::Mapping)?;
            let base = map.base();
            mem.register(MappedRegion {
                base,
                size: len,
                kind: RegionKind::Text,
                writable: false,
            });
            (Some(file), Some(map), base)
        };

        // Data segment: initialized data, then bss, then the heap, one
        // anonymous mapping.
        let data_len = binary.data.len() + binary.bss;
        let map_len = memory::round_up(data_len + heap_size, page);
        let data_map = Mapping::anonymous(map_len).map_err(VmError::Mapping)?;
        let ds_base = data_map.base();
        mem.register(MappedRegion {
            base: ds_base,
            size: map_len,
            kind: RegionKind::Data,
            writable: true,
        });
        mem.write_bytes(ds_base, &binary.data);

        apply_relocations(&mem, &binary.ts_relative, ds_base, data_len, text_base);
        apply_relocations(&mem, &binary.ds_relative, ds_base, data_len, ds_base);

        let (stop_tx, stop_rx) = unbounded();

        log::debug!(
            "machine: text {:#x}+{}, data {:#x}+{} (bss {}, heap {})",
            text_base,
            binary.text.len(),
            ds_base,
            data_len,
            binary.bss,
            heap_size,
        );

        Ok(Self {
            mem,
            sz,
            text_base,
            ds_base,
            bss_base: ds_base + binary.data.len() as u64,
            heap_limit: ds_base + map_len as u64,
            brk: Mutex::new(ds_base + data_len as u64),
            data_map,
            text_map,
            text_file,
            stop_rx,
            stop_tx: Mutex::new(Some(stop_tx)),
            next_tid: AtomicU64::new(0),
            threads: Mutex::new(Vec::new()),
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(stdout),
            stderr: Mutex::new(stderr),
            trace_path,
            files: FileRegistry::new(),
            mutexes: MutexRegistry::new(),
            guest_maps: Mutex::new(Vec::new()),
            env_cache: Mutex::new(HashMap::new()),
            binary,
        })
    }

    pub fn binary(&self) -> &Binary {
        &self.binary
    }

    pub fn memory(&self) -> &MemoryMap {
        &self.mem
    }

    pub fn model(&self) -> MemoryModel {
        self.binary.model
    }

    pub fn sizes(&self) -> StackSizes {
        self.sz
    }

    pub fn symbol(&self, name: &str) -> Option<usize> {
        self.binary.sym.get(name).copied()
    }

    /// Start of the zero-initialized extent, for diagnostics.
    pub fn bss_base(&self) -> u64 {
        self.bss_base
    }

    // ------------------------------------------------------------------
    // Kill switch
    // ------------------------------------------------------------------

    /// Signal every running CPU to stop. Idempotent.
    pub fn kill(&self) {
        if self.stop_tx.lock().take().is_some() {
            log::debug!("machine: killed");
        }
    }

    /// Kill and release; mappings go away when the machine is dropped.
    pub fn close(&self) {
        self.kill();
    }

    pub(crate) fn stop_channel(&self) -> Receiver<()> {
        self.stop_rx.clone()
    }

    // ------------------------------------------------------------------
    // Heap: bump allocator, free is a no-op
    // ------------------------------------------------------------------

    /// Allocate `n` heap bytes; 0 once the heap is exhausted.
    pub fn malloc(&self, n: usize) -> u64 {
        let align = 2 * self.sz.ptr;
        let mut brk = self.brk.lock();
        let p = *brk;
        let end = p + memory::round_up(n, align) as u64;
        if end > self.heap_limit {
            return 0;
        }
        *brk = end;
        p
    }

    pub fn calloc(&self, n: usize) -> u64 {
        let p = self.malloc(n);
        if p != 0 {
            self.mem.fill(p, 0, n);
        }
        p
    }

    /// Fresh allocation plus a byte copy of the old contents. The copy reads
    /// `n` bytes from `p` regardless of the original allocation size; the
    /// heap is contiguous, so the overshoot stays mapped.
    pub fn realloc(&self, p: u64, n: usize) -> u64 {
        let q = self.malloc(n);
        if q != 0 && p != 0 {
            let avail = (self.heap_limit - p) as usize;
            self.mem.copy(q, p, n.min(avail));
        }
        q
    }

    /// Allocate and write a NUL-terminated guest string; 0 on heap exhaustion.
    pub fn cstring(&self, s: &[u8]) -> u64 {
        let p = self.malloc(s.len() + 1);
        if p != 0 {
            self.mem.write_bytes(p, s);
            self.mem.write_u8(p + s.len() as u64, 0);
        }
        p
    }

    /// Host environment lookup with stable guest pointers per name.
    pub(crate) fn getenv(&self, name: &str) -> u64 {
        if let Some(&p) = self.env_cache.lock().get(name) {
            return p;
        }
        match std::env::var_os(name) {
            Some(val) => {
                let p = self.cstring(val.to_string_lossy().as_bytes());
                if p != 0 {
                    self.env_cache.lock().insert(name.to_string(), p);
                }
                p
            }
            None => 0,
        }
    }

    // ------------------------------------------------------------------
    // Guest mmap
    // ------------------------------------------------------------------

    /// Anonymous guest mapping; 0 on failure.
    pub(crate) fn guest_mmap(&self, len: usize) -> u64 {
        let len = memory::round_up(len.max(1), memory::page_size());
        match Mapping::anonymous(len) {
            Ok(map) => {
                let base = map.base();
                self.mem.register(MappedRegion {
                    base,
                    size: len,
                    kind: RegionKind::Guest,
                    writable: true,
                });
                self.guest_maps.lock().push(map);
                base
            }
            Err(e) => {
                log::warn!("guest mmap of {} bytes failed: {}", len, e);
                0
            }
        }
    }

    pub(crate) fn guest_munmap(&self, addr: u64) -> bool {
        let mut maps = self.guest_maps.lock();
        match maps.iter().position(|m| m.base() == addr) {
            Some(i) => {
                self.mem.unregister(addr);
                maps.remove(i);
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Threads
    // ------------------------------------------------------------------

    /// Map a fresh stack and register a new thread on this machine.
    pub fn new_thread(self: &Arc<Self>, stack_size: usize) -> Result<Thread, VmError> {
        Thread::new(Arc::clone(self), stack_size)
    }

    pub(crate) fn next_thread_id(&self) -> u64 {
        self.next_tid.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn forget_thread(&self, id: u64) {
        let mut threads = self.threads.lock();
        if let Some(i) = threads.iter().position(|t| t.id == id) {
            let t = threads.remove(i);
            log::debug!(
                "thread {}: released stack {:#x}+{}",
                t.id,
                t.stack_base,
                t.stack_size
            );
        }
    }

    // ------------------------------------------------------------------
    // Symbolication
    // ------------------------------------------------------------------

    /// Function metadata covering `pc`.
    pub fn function_at(&self, pc: usize) -> PcInfo {
        Binary::pc_info(&self.binary.functions, pc)
    }

    /// Line metadata covering `pc`.
    pub fn line_at(&self, pc: usize) -> PcInfo {
        Binary::pc_info(&self.binary.lines, pc)
    }

    /// Resolve a `PcInfo.name` text offset to a string.
    pub fn name_at(&self, offset: usize) -> Option<String> {
        if offset == 0 || self.text_map.is_none() {
            return None;
        }
        let bytes = self.mem.c_string(self.text_base + offset as u64);
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.kill();
        log::debug!("machine: dropped");
    }
}

/// Rebase every pointer-sized word whose bitmap bit is set. Bit `i` of the
/// bitmap marks the word at byte offset `i` of the data segment.
fn apply_relocations(mem: &MemoryMap, bitmap: &[u8], ds_base: u64, seg_len: usize, base: u64) {
    for (byte_idx, &byte) in bitmap.iter().enumerate() {
        if byte == 0 {
            continue;
        }
        for bit in 0..8 {
            if byte & (1 << bit) == 0 {
                continue;
            }
            let off = byte_idx * 8 + bit;
            if off >= seg_len {
                break;
            }
            let addr = ds_base + off as u64;
            mem.write_ptr(addr, mem.read_ptr(addr).wrapping_add(base));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::Binary;

    fn machine(binary: Binary, heap: usize) -> Arc<Machine> {
        Arc::new(
            Machine::new(
                binary,
                heap,
                Box::new(io::empty()),
                Box::new(io::sink()),
                Box::new(io::sink()),
                None,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_malloc_bump() {
        let m = machine(Binary::new(MemoryModel::M64), 4096);

        let a = m.malloc(10);
        let b = m.malloc(10);
        assert_ne!(a, 0);
        // Allocations are bumped by the size rounded to 2*ptr.
        assert_eq!(b, a + 16);

        // The region is writable through the flat address space.
        m.mem.write_u64(a, 0x55AA);
        assert_eq!(m.mem.read_u64(a), 0x55AA);
    }

    #[test]
    fn test_malloc_exhaustion() {
        let m = machine(Binary::new(MemoryModel::M64), 64);
        // The data mapping is page-rounded; eat everything, then fail.
        assert_ne!(m.malloc(4096 - 16), 0);
        assert_eq!(m.malloc(4096), 0);
    }

    #[test]
    fn test_realloc_copies() {
        let m = machine(Binary::new(MemoryModel::M64), 4096);
        let a = m.malloc(8);
        m.mem.write_u64(a, 0xFEED);
        let b = m.realloc(a, 32);
        assert_ne!(b, a);
        assert_eq!(m.mem.read_u64(b), 0xFEED);
    }

    #[test]
    fn test_cstring() {
        let m = machine(Binary::new(MemoryModel::M64), 4096);
        let p = m.cstring(b"hello");
        assert_eq!(m.mem.c_string(p), b"hello");
    }

    #[test]
    fn test_kill_is_idempotent() {
        let m = machine(Binary::new(MemoryModel::M64), 4096);
        let rx = m.stop_channel();
        assert!(!is_disconnected(&rx));
        m.kill();
        m.kill();
        assert!(is_disconnected(&rx));
    }

    fn is_disconnected(rx: &Receiver<()>) -> bool {
        matches!(rx.try_recv(), Err(crossbeam_channel::TryRecvError::Disconnected))
    }

    #[test]
    fn test_text_relocation() {
        let mut b = Binary::new(MemoryModel::M64);
        b.text = b"hi\0".to_vec();
        // One pointer-sized word at data offset 0, pointing at text offset 0.
        b.data = vec![0u8; 8];
        b.ts_relative = vec![0b0000_0001];
        let m = machine(b, 4096);

        let p = m.mem.read_ptr(m.ds_base);
        assert_eq!(p, m.text_base);
        assert_eq!(m.mem.c_string(p), b"hi");
    }

    #[test]
    fn test_data_relocation_with_bss() {
        let mut b = Binary::new(MemoryModel::M64);
        // data: [ptr to data offset 16][8 arbitrary bytes], bss: 16 bytes.
        b.data = vec![0u8; 16];
        b.data[0] = 16; // pre-relocation value: offset into the segment
        b.bss = 16;
        b.ds_relative = vec![0b0000_0001];
        let m = machine(b, 4096);

        assert_eq!(m.mem.read_ptr(m.ds_base), m.ds_base + 16);
        // BSS is zero-initialized.
        assert_eq!(m.mem.read_u64(m.ds_base + 16), 0);
    }
}
