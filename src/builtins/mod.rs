//! Built-in Bridge
//!
//! Routes built-in opcodes to host implementations that share the guest
//! calling convention: when the dispatcher reaches a built-in opcode the
//! guest has already executed `Arguments` and pushed the arguments, so the
//! handler reads them downward from `rp` and writes its result at `rp`. The
//! shared epilogue here then drops the arguments and restores `rp`, exactly
//! like a bytecode `Return` would.
//!
//! The opcode-to-handler table is a process-wide static; built-ins are
//! compile-time known. Everything stateful (FILE handles, guest mutexes)
//! lives on the `Machine`.

pub(crate) mod compiler;
pub(crate) mod math;
pub(crate) mod posix;
pub(crate) mod pthread;
pub(crate) mod stdio;
pub(crate) mod stdlib;
pub(crate) mod string;

use std::collections::HashMap;

use lazy_static::lazy_static;

use crate::cpu::Cpu;
use crate::machine::VmError;
use crate::memory::{MemoryMap, StackSizes};
use crate::opcode::Opcode;

type Builtin = fn(&mut Cpu) -> Result<(), VmError>;

lazy_static! {
    static ref BUILTINS: HashMap<Opcode, Builtin> = {
        use Opcode::*;
        let mut t: HashMap<Opcode, Builtin> = HashMap::new();

        // libc string/memory
        t.insert(Memcpy, string::memcpy as Builtin);
        t.insert(Memset, string::memset);
        t.insert(Memcmp, string::memcmp);
        t.insert(Strcpy, string::strcpy);
        t.insert(Strncpy, string::strncpy);
        t.insert(Strcat, string::strcat);
        t.insert(Strcmp, string::strcmp);
        t.insert(Strncmp, string::strncmp);
        t.insert(Strlen, string::strlen);
        t.insert(Strchr, string::strchr);
        t.insert(Strrchr, string::strrchr);

        // libc math
        t.insert(Sin, math::sin);
        t.insert(Cos, math::cos);
        t.insert(Tan, math::tan);
        t.insert(Sinh, math::sinh);
        t.insert(Cosh, math::cosh);
        t.insert(Tanh, math::tanh);
        t.insert(Asin, math::asin);
        t.insert(Acos, math::acos);
        t.insert(Atan, math::atan);
        t.insert(Exp, math::exp);
        t.insert(Log, math::log);
        t.insert(Log10, math::log10);
        t.insert(Pow, math::pow);
        t.insert(Sqrt, math::sqrt);
        t.insert(Floor, math::floor);
        t.insert(Ceil, math::ceil);
        t.insert(Fabs, math::fabs);
        t.insert(Copysign, math::copysign);
        t.insert(Round, math::round);
        t.insert(Isinf, math::isinf);
        t.insert(Isinff, math::isinff);
        t.insert(Signbit, math::signbit);
        t.insert(Signbitf, math::signbitf);

        // libc stdlib
        t.insert(Abs, stdlib::abs);
        t.insert(Atoi, stdlib::atoi);
        t.insert(Malloc, stdlib::malloc);
        t.insert(Calloc, stdlib::calloc);
        t.insert(Realloc, stdlib::realloc);
        t.insert(Free, stdlib::free);
        t.insert(Getenv, stdlib::getenv);
        t.insert(Qsort, stdlib::qsort);

        // libc stdio
        t.insert(Fopen, stdio::fopen);
        t.insert(Fclose, stdio::fclose);
        t.insert(Fread, stdio::fread);
        t.insert(Fwrite, stdio::fwrite);
        t.insert(Fgetc, stdio::fgetc);
        t.insert(Fgets, stdio::fgets);
        t.insert(Fprintf, stdio::fprintf);
        t.insert(Printf, stdio::printf);
        t.insert(Sprintf, stdio::sprintf);
        t.insert(Vfprintf, stdio::vfprintf);
        t.insert(Vprintf, stdio::vprintf);
        t.insert(Ferror, stdio::ferror);
        t.insert(Rewind, stdio::rewind);
        t.insert(Fseek, stdio::fseek);
        t.insert(Ftell, stdio::ftell);
        t.insert(RegisterStdfiles, stdio::register_stdfiles);

        // compiler intrinsics
        t.insert(BuiltinClz, compiler::clz);
        t.insert(BuiltinClzl, compiler::clzl);
        t.insert(BuiltinClzll, compiler::clzll);
        t.insert(BuiltinCtz, compiler::ctz);
        t.insert(BuiltinCtzl, compiler::ctzl);
        t.insert(BuiltinCtzll, compiler::ctzll);
        t.insert(BuiltinPopcount, compiler::popcount);
        t.insert(BuiltinPopcountl, compiler::popcountl);
        t.insert(BuiltinPopcountll, compiler::popcountll);
        t.insert(BuiltinParity, compiler::parity);
        t.insert(BuiltinParityl, compiler::parityl);
        t.insert(BuiltinParityll, compiler::parityll);
        t.insert(BuiltinClrsb, compiler::clrsb);
        t.insert(BuiltinClrsbl, compiler::clrsbl);
        t.insert(BuiltinClrsbll, compiler::clrsbll);
        t.insert(BuiltinBswap64, compiler::bswap64);
        t.insert(BuiltinFrameAddress, compiler::frame_address);
        t.insert(BuiltinReturnAddress, compiler::return_address);
        t.insert(Ffs, compiler::ffs);
        t.insert(Ffsl, compiler::ffsl);
        t.insert(Ffsll, compiler::ffsll);

        // POSIX I/O
        t.insert(Open, posix::open);
        t.insert(Close, posix::close);
        t.insert(Read, posix::read);
        t.insert(Write, posix::write);
        t.insert(Lseek, posix::lseek);
        t.insert(Ftruncate, posix::ftruncate);
        t.insert(Fstat, posix::fstat);
        t.insert(Stat, posix::stat);
        t.insert(Lstat, posix::lstat);
        t.insert(Fsync, posix::fsync);
        t.insert(Access, posix::access);
        t.insert(Unlink, posix::unlink);
        t.insert(Getcwd, posix::getcwd);
        t.insert(Getpid, posix::getpid);
        t.insert(Geteuid, posix::geteuid);
        t.insert(Gettimeofday, posix::gettimeofday);
        t.insert(Usleep, posix::usleep);
        t.insert(Select, posix::select);
        t.insert(Socket, posix::socket);
        t.insert(Connect, posix::connect);
        t.insert(Recv, posix::recv);
        t.insert(Send, posix::send);
        t.insert(Writev, posix::writev);
        t.insert(Getsockname, posix::getsockname);
        t.insert(Getpeername, posix::getpeername);
        t.insert(Getsockopt, posix::getsockopt);
        t.insert(Setsockopt, posix::setsockopt);
        t.insert(Shutdown, posix::shutdown);
        t.insert(Mmap, posix::mmap);
        t.insert(Munmap, posix::munmap);
        t.insert(Sysconf, posix::sysconf);

        // pthreads
        t.insert(PthreadMutexInit, pthread::mutex_init);
        t.insert(PthreadMutexDestroy, pthread::mutex_destroy);
        t.insert(PthreadMutexLock, pthread::mutex_lock);
        t.insert(PthreadMutexUnlock, pthread::mutex_unlock);
        t.insert(PthreadMutexTrylock, pthread::mutex_trylock);
        t.insert(PthreadMutexattrInit, pthread::mutexattr_init);
        t.insert(PthreadMutexattrSettype, pthread::mutexattr_settype);
        t.insert(PthreadMutexattrDestroy, pthread::mutexattr_destroy);
        t.insert(PthreadEqual, pthread::equal);
        t.insert(PthreadSelf, pthread::self_);
        t.insert(PthreadCreate, pthread::create);
        t.insert(PthreadJoin, pthread::join);

        // atomics
        t.insert(InterlockedCompareExchange, pthread::interlocked_compare_exchange);

        t
    };
}

/// Invoke the handler for a built-in opcode, then run the shared epilogue:
/// drop the arguments (`sp = rp`) and restore the caller's `rp`.
pub(crate) fn dispatch(cpu: &mut Cpu, opcode: Opcode) -> Result<(), VmError> {
    let handler = match BUILTINS.get(&opcode) {
        Some(h) => *h,
        None => return Err(cpu.trap(format!("unknown opcode {:?}", opcode))),
    };
    handler(cpu)?;

    cpu.t.regs.sp = cpu.t.regs.rp;
    cpu.t.regs.rp = match cpu.t.rp_stack.pop() {
        Some(rp) => rp,
        None => return Err(cpu.trap(format!("built-in {:?} outside a call", opcode))),
    };
    Ok(())
}

/// Copy the host `errno` of the last failed call into the guest TLS.
pub(crate) fn errno_from_host(cpu: &Cpu) {
    let e = std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO);
    cpu.t.set_errno(e);
}

/// Downward cursor over a built-in's argument area. Arguments were pushed
/// left to right, each occupying its stack slot below `rp`.
pub(crate) struct ArgReader<'a> {
    mem: &'a MemoryMap,
    sz: StackSizes,
    cursor: u64,
}

impl<'a> ArgReader<'a> {
    pub fn new(cpu: &'a Cpu) -> Self {
        Self {
            mem: &cpu.machine().mem,
            sz: cpu.sizes(),
            cursor: cpu.t.regs.rp,
        }
    }

    pub fn i32(&mut self) -> i32 {
        self.cursor -= self.sz.i32 as u64;
        self.mem.read_i32(self.cursor)
    }

    pub fn u32(&mut self) -> u32 {
        self.i32() as u32
    }

    pub fn i64(&mut self) -> i64 {
        self.cursor -= self.sz.i64 as u64;
        self.mem.read_i64(self.cursor)
    }

    pub fn f32(&mut self) -> f32 {
        self.cursor -= self.sz.f32 as u64;
        self.mem.read_f32(self.cursor)
    }

    pub fn f64(&mut self) -> f64 {
        self.cursor -= self.sz.f64 as u64;
        self.mem.read_f64(self.cursor)
    }

    pub fn ptr(&mut self) -> u64 {
        self.cursor -= self.sz.ptr as u64;
        self.mem.read_ptr(self.cursor)
    }

    /// size_t argument.
    pub fn size(&mut self) -> usize {
        self.ptr() as usize
    }

    pub fn long(&mut self) -> i64 {
        self.cursor -= self.sz.long as u64;
        self.mem.read_long(self.cursor)
    }

    /// Remaining-argument anchor for the printf family: the address of the
    /// slot the cursor would read next.
    pub fn vararg_anchor(&self) -> u64 {
        self.cursor
    }
}
