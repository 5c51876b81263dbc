//! Thread
//!
//! Per-thread execution state: the mmapped stack segment, the register file
//! the dispatcher works with, the auxiliary LIFO stacks of the calling
//! convention, and the TLS record (errno, thread id) kept in the topmost
//! aligned slot of the stack.

use std::sync::Arc;

use crate::machine::{Machine, ThreadInfo, VmError};
use crate::memory::{self, MappedRegion, Mapping, RegionKind};

/// Register file. `ip` indexes the code stream; everything else is a guest
/// address. The stack grows downward, so `sp` is the lowest used address.
#[derive(Debug, Clone, Copy, Default)]
pub struct Registers {
    pub ip: usize,
    pub sp: u64,
    pub bp: u64,
    pub ap: u64,
    pub rp: u64,
}

/// One guest thread. Dropping it unmaps the stack and unregisters the thread
/// from its machine.
pub struct Thread {
    machine: Arc<Machine>,
    pub regs: Registers,
    /// Saved `rp` per unreturned `Arguments`.
    pub(crate) rp_stack: Vec<u64>,
    /// Call targets staged by `ArgumentsFP` for `CallFP`.
    pub(crate) fp_stack: Vec<u64>,
    id: u64,
    tls: u64,
    stack: Mapping,
}

impl Thread {
    pub(crate) fn new(machine: Arc<Machine>, stack_size: usize) -> Result<Self, VmError> {
        let size = memory::round_up(stack_size.max(memory::page_size()), memory::page_size());
        let stack = Mapping::anonymous(size).map_err(VmError::ThreadStack)?;
        let base = stack.base();
        machine.mem.register(MappedRegion {
            base,
            size,
            kind: RegionKind::Stack,
            writable: true,
        });

        let sz = machine.sizes();
        let tls_size = memory::round_up(4, sz.ptr) + sz.ptr;
        let tls = base + (size - tls_size) as u64;
        let id = machine.next_thread_id();

        // TLS record: errno then the thread id.
        machine.mem.write_i32(tls, 0);
        machine
            .mem
            .write_ptr(tls + memory::round_up(4, sz.ptr) as u64, id);

        machine.threads.lock().push(ThreadInfo {
            id,
            stack_base: base,
            stack_size: size,
        });
        log::debug!("thread {}: stack {:#x}+{}", id, base, size);

        Ok(Self {
            regs: Registers {
                ip: 0,
                sp: tls & !0xF,
                bp: 0,
                ap: 0,
                rp: 0,
            },
            rp_stack: Vec::new(),
            fp_stack: Vec::new(),
            id,
            tls,
            stack,
            machine,
        })
    }

    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn errno(&self) -> i32 {
        self.machine.mem.read_i32(self.tls)
    }

    pub fn set_errno(&self, v: i32) {
        self.machine.mem.write_i32(self.tls, v);
    }

    /// True while `addr` lies within this thread's stack segment.
    pub(crate) fn on_stack(&self, addr: u64) -> bool {
        addr >= self.stack.base() && addr < self.stack.base() + self.stack.len() as u64
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        self.machine.mem.unregister(self.stack.base());
        self.machine.forget_thread(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::{Binary, MemoryModel};
    use std::io;

    fn machine() -> Arc<Machine> {
        Arc::new(
            Machine::new(
                Binary::new(MemoryModel::M64),
                4096,
                Box::new(io::empty()),
                Box::new(io::sink()),
                Box::new(io::sink()),
                None,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_thread_ids_are_fresh() {
        let m = machine();
        let a = m.new_thread(8192).unwrap();
        let b = m.new_thread(8192).unwrap();
        assert_eq!(a.id(), 1);
        assert_eq!(b.id(), 2);
    }

    #[test]
    fn test_tls_record() {
        let m = machine();
        let t = m.new_thread(8192).unwrap();
        assert_eq!(t.errno(), 0);
        t.set_errno(libc::ENOMEM);
        assert_eq!(t.errno(), libc::ENOMEM);
        // errno is thread local.
        let u = m.new_thread(8192).unwrap();
        assert_eq!(u.errno(), 0);
    }

    #[test]
    fn test_initial_sp_alignment() {
        let m = machine();
        let t = m.new_thread(8192).unwrap();
        assert_eq!(t.regs.sp % 16, 0);
        assert!(t.on_stack(t.regs.sp));
        assert!(!t.on_stack(t.regs.sp - 1_000_000));
    }

    #[test]
    fn test_stack_unregistered_on_drop() {
        let m = machine();
        let t = m.new_thread(8192).unwrap();
        let sp = t.regs.sp;
        drop(t);
        assert!(m.memory().region_of(sp).is_none());
        assert!(m.threads.lock().is_empty());
    }
}
