//! pthread built-ins: the guest mutex registry, thread identity, and the
//! 32-bit interlocked compare-exchange.
//!
//! Guest mutexes are keyed by the guest-side address of the pthread_mutex_t
//! object. An entry is created on first touch and removed by destroy. NORMAL
//! mutexes block on the host mutex; RECURSIVE ones count re-entries by the
//! owning thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::RawMutex as _;
use parking_lot::{Mutex, RawMutex};

use super::ArgReader;
use crate::cpu::Cpu;
use crate::machine::VmError;

#[derive(Default)]
struct OwnerState {
    owner: u64,
    count: u32,
}

struct MutexEntry {
    /// PTHREAD_MUTEX_NORMAL or PTHREAD_MUTEX_RECURSIVE.
    attr: AtomicI32,
    state: Mutex<OwnerState>,
    inner: RawMutex,
}

impl MutexEntry {
    fn new(attr: i32) -> Self {
        Self {
            attr: AtomicI32::new(attr),
            state: Mutex::new(OwnerState::default()),
            inner: RawMutex::INIT,
        }
    }

    fn recursive(&self) -> bool {
        self.attr.load(Ordering::Relaxed) == libc::PTHREAD_MUTEX_RECURSIVE
    }
}

/// Guest mutex address -> host mutex record.
pub(crate) struct MutexRegistry {
    entries: Mutex<HashMap<u64, Arc<MutexEntry>>>,
}

impl MutexRegistry {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    fn entry(&self, addr: u64) -> Arc<MutexEntry> {
        self.entries
            .lock()
            .entry(addr)
            .or_insert_with(|| Arc::new(MutexEntry::new(libc::PTHREAD_MUTEX_NORMAL)))
            .clone()
    }

    fn install(&self, addr: u64, attr: i32) {
        self.entries
            .lock()
            .insert(addr, Arc::new(MutexEntry::new(attr)));
    }

    fn destroy(&self, addr: u64) -> bool {
        self.entries.lock().remove(&addr).is_some()
    }
}

// int pthread_mutex_init(pthread_mutex_t *mutex, const pthread_mutexattr_t *attr)
pub(crate) fn mutex_init(cpu: &mut Cpu) -> Result<(), VmError> {
    let (mutex, attr) = {
        let mut a = ArgReader::new(cpu);
        (a.ptr(), a.ptr())
    };
    let kind = if attr == 0 {
        libc::PTHREAD_MUTEX_NORMAL
    } else {
        cpu.machine().mem.read_i32(attr)
    };
    cpu.machine().mutexes.install(mutex, kind);
    cpu.ret_i32(0);
    Ok(())
}

// int pthread_mutex_destroy(pthread_mutex_t *mutex)
pub(crate) fn mutex_destroy(cpu: &mut Cpu) -> Result<(), VmError> {
    let mutex = ArgReader::new(cpu).ptr();
    let r = if cpu.machine().mutexes.destroy(mutex) {
        0
    } else {
        libc::EINVAL
    };
    cpu.ret_i32(r);
    Ok(())
}

// int pthread_mutex_lock(pthread_mutex_t *mutex)
pub(crate) fn mutex_lock(cpu: &mut Cpu) -> Result<(), VmError> {
    let mutex = ArgReader::new(cpu).ptr();
    let tid = cpu.t.id();
    let entry = cpu.machine().mutexes.entry(mutex);

    if entry.recursive() {
        let mut s = entry.state.lock();
        if s.owner == tid {
            s.count += 1;
            cpu.ret_i32(0);
            return Ok(());
        }
    }
    entry.inner.lock();
    let mut s = entry.state.lock();
    s.owner = tid;
    s.count = 1;
    drop(s);
    cpu.ret_i32(0);
    Ok(())
}

// int pthread_mutex_trylock(pthread_mutex_t *mutex)
pub(crate) fn mutex_trylock(cpu: &mut Cpu) -> Result<(), VmError> {
    let mutex = ArgReader::new(cpu).ptr();
    let tid = cpu.t.id();
    let entry = cpu.machine().mutexes.entry(mutex);

    if entry.inner.try_lock() {
        let mut s = entry.state.lock();
        s.owner = tid;
        s.count = 1;
        cpu.ret_i32(0);
    } else if entry.recursive() && entry.state.lock().owner == tid {
        entry.state.lock().count += 1;
        cpu.ret_i32(0);
    } else {
        cpu.ret_i32(libc::EBUSY);
    }
    Ok(())
}

// int pthread_mutex_unlock(pthread_mutex_t *mutex)
pub(crate) fn mutex_unlock(cpu: &mut Cpu) -> Result<(), VmError> {
    let mutex = ArgReader::new(cpu).ptr();
    let tid = cpu.t.id();
    let entry = cpu.machine().mutexes.entry(mutex);

    let release = {
        let mut s = entry.state.lock();
        if s.owner != tid || s.count == 0 {
            cpu.ret_i32(libc::EPERM);
            return Ok(());
        }
        s.count -= 1;
        if s.count == 0 {
            s.owner = 0;
            true
        } else {
            false
        }
    };
    if release {
        // SAFETY: this thread holds the lock; owner/count said so.
        unsafe { entry.inner.unlock() };
    }
    cpu.ret_i32(0);
    Ok(())
}

// int pthread_mutexattr_init(pthread_mutexattr_t *attr)
pub(crate) fn mutexattr_init(cpu: &mut Cpu) -> Result<(), VmError> {
    let attr = ArgReader::new(cpu).ptr();
    cpu.machine().mem.write_i32(attr, libc::PTHREAD_MUTEX_NORMAL);
    cpu.ret_i32(0);
    Ok(())
}

// int pthread_mutexattr_settype(pthread_mutexattr_t *attr, int type)
pub(crate) fn mutexattr_settype(cpu: &mut Cpu) -> Result<(), VmError> {
    let (attr, kind) = {
        let mut a = ArgReader::new(cpu);
        (a.ptr(), a.i32())
    };
    if kind != libc::PTHREAD_MUTEX_NORMAL && kind != libc::PTHREAD_MUTEX_RECURSIVE {
        cpu.ret_i32(libc::EINVAL);
        return Ok(());
    }
    cpu.machine().mem.write_i32(attr, kind);
    cpu.ret_i32(0);
    Ok(())
}

// int pthread_mutexattr_destroy(pthread_mutexattr_t *attr)
pub(crate) fn mutexattr_destroy(cpu: &mut Cpu) -> Result<(), VmError> {
    let _ = ArgReader::new(cpu).ptr();
    cpu.ret_i32(0);
    Ok(())
}

// int pthread_equal(pthread_t t1, pthread_t t2)
pub(crate) fn equal(cpu: &mut Cpu) -> Result<(), VmError> {
    let (t1, t2) = {
        let mut a = ArgReader::new(cpu);
        (a.ptr(), a.ptr())
    };
    cpu.ret_i32((t1 == t2) as i32);
    Ok(())
}

// pthread_t pthread_self(void)
pub(crate) fn self_(cpu: &mut Cpu) -> Result<(), VmError> {
    let tid = cpu.t.id();
    cpu.ret_ptr(tid);
    Ok(())
}

// int pthread_create(pthread_t *thread, const pthread_attr_t *attr,
//                    void *(*start_routine)(void *), void *arg)
pub(crate) fn create(cpu: &mut Cpu) -> Result<(), VmError> {
    let _ = {
        let mut a = ArgReader::new(cpu);
        (a.ptr(), a.ptr(), a.ptr(), a.ptr())
    };
    // In-interpreter thread spawning is not supported; the embedder creates
    // threads through Machine::new_thread instead.
    log::warn!("pthread_create rejected");
    cpu.ret_i32(libc::EAGAIN);
    Ok(())
}

// int pthread_join(pthread_t thread, void **retval)
pub(crate) fn join(cpu: &mut Cpu) -> Result<(), VmError> {
    let _ = {
        let mut a = ArgReader::new(cpu);
        (a.ptr(), a.ptr())
    };
    cpu.ret_i32(libc::ESRCH);
    Ok(())
}

// LONG InterlockedCompareExchange(LONG volatile *dest, LONG exch, LONG comparand)
pub(crate) fn interlocked_compare_exchange(cpu: &mut Cpu) -> Result<(), VmError> {
    let (dest, exch, comparand) = {
        let mut a = ArgReader::new(cpu);
        (a.ptr(), a.i32(), a.i32())
    };
    let witnessed = cpu
        .machine()
        .mem
        .cas_u32(dest, comparand as u32, exch as u32);
    cpu.ret_i32(witnessed as i32);
    Ok(())
}
