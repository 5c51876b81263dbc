//! CPU Dispatch
//!
//! The fetch-decode-execute loop and the calling convention. One `Cpu` drives
//! one thread; several CPUs may run concurrently against the same machine.
//!
//! Per iteration the loop polls the kill channel every 1024 instructions
//! (instruction boundaries are the only safe suspension points), fetches the
//! operation at `ip`, bumps `ip`, and branches on the opcode. Multi-slot
//! opcodes fetch their `Ext` slot inside the arm, bumping `ip` again.
//!
//! Interpreter-internal faults (unmapped access, division by zero, malformed
//! code) panic; `run` catches the panic and turns it into an instruction trap
//! carrying a guest stack trace.

use std::panic::{self, AssertUnwindSafe};

use crossbeam_channel::{Receiver, TryRecvError};

use crate::builtins;
use crate::machine::{Machine, VmError};
use crate::memory::StackSizes;
use crate::opcode::{Opcode, Operation};
use crate::thread::Thread;
use crate::trace;

/// Code slots of the host-to-guest adapter preceding each function's `Func`
/// opcode: `Call <func>; FfiReturn`. Function-pointer values denote the
/// adapter; direct calls target the `Func` slot itself.
pub const FFI_PROLOG: usize = 2;

/// Sentinel return address planted under `_start`; returning through it runs
/// off the code stream and traps.
pub const RETURN_SENTINEL: u64 = 0xcafe_babe;

/// Kill channel poll interval (power of two, cheap masking).
const KILL_CHECK_MASK: u64 = 0x3FF;

/// Why the dispatch loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stop {
    /// `exit`/`abort` reached; process status attached.
    Exit(i32),
    /// `FfiReturn` reached; only meaningful inside a nested guest call.
    Ffi,
}

/// Interpreter state for one thread.
pub struct Cpu<'a> {
    m: &'a Machine,
    pub(crate) t: &'a mut Thread,
    code: &'a [Operation],
    stop: Receiver<()>,
    sz: StackSizes,
    ds: u64,
    text: u64,
    cycles: u64,
}

impl<'a> Cpu<'a> {
    pub fn new(m: &'a Machine, t: &'a mut Thread) -> Self {
        Self {
            code: &m.binary().code,
            stop: m.stop_channel(),
            sz: m.sizes(),
            ds: m.ds_base,
            text: m.text_base,
            cycles: 0,
            m,
            t,
        }
    }

    pub fn machine(&self) -> &Machine {
        self.m
    }

    pub(crate) fn sizes(&self) -> StackSizes {
        self.sz
    }

    // ------------------------------------------------------------------
    // Built-in call convention: arguments live below `rp`, the single
    // result slot at `rp`.
    // ------------------------------------------------------------------

    pub(crate) fn ret_i32(&self, v: i32) {
        self.m.mem.write_i32(self.t.regs.rp, v);
    }

    pub(crate) fn ret_i64(&self, v: i64) {
        self.m.mem.write_i64(self.t.regs.rp, v);
    }

    pub(crate) fn ret_f32(&self, v: f32) {
        self.m.mem.write_f32(self.t.regs.rp, v);
    }

    pub(crate) fn ret_f64(&self, v: f64) {
        self.m.mem.write_f64(self.t.regs.rp, v);
    }

    pub(crate) fn ret_ptr(&self, v: u64) {
        self.m.mem.write_ptr(self.t.regs.rp, v);
    }

    pub(crate) fn ret_long(&self, v: i64) {
        self.m.mem.write_long(self.t.regs.rp, v);
    }

    /// Run until the program exits or dies. Panics out of the interpreter are
    /// recovered here and reported as instruction traps with a stack trace.
    pub fn run(&mut self) -> Result<i32, VmError> {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.dispatch_loop()));
        match outcome {
            Ok(Ok(Stop::Exit(status))) => Ok(status),
            Ok(Ok(Stop::Ffi)) => Err(self.trap("ffi return outside a host call")),
            Ok(Err(e)) => Err(e),
            Err(payload) => {
                let reason = if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else if let Some(s) = payload.downcast_ref::<&str>() {
                    (*s).to_string()
                } else {
                    "interpreter fault".to_string()
                };
                Err(self.trap(reason))
            }
        }
    }

    pub(crate) fn trap(&self, reason: impl Into<String>) -> VmError {
        VmError::InstructionTrap {
            reason: reason.into(),
            trace: trace::capture(self.m, self.t),
        }
    }

    fn killed(&self) -> bool {
        matches!(self.stop.try_recv(), Err(TryRecvError::Disconnected))
    }

    // ------------------------------------------------------------------
    // Stack helpers. The stack grows downward; every push rounds its
    // operand up to the slot size of its type.
    // ------------------------------------------------------------------

    fn push_slot(&mut self, size: usize) -> u64 {
        self.t.regs.sp -= size as u64;
        self.t.regs.sp
    }

    pub(crate) fn push_i32(&mut self, v: i32) {
        let a = self.push_slot(self.sz.i32);
        self.m.mem.write_i32(a, v);
    }

    pub(crate) fn push_i64(&mut self, v: i64) {
        let a = self.push_slot(self.sz.i64);
        self.m.mem.write_i64(a, v);
    }

    pub(crate) fn push_u64(&mut self, v: u64) {
        self.push_i64(v as i64);
    }

    pub(crate) fn push_f32(&mut self, v: f32) {
        let a = self.push_slot(self.sz.f32);
        self.m.mem.write_f32(a, v);
    }

    pub(crate) fn push_f64(&mut self, v: f64) {
        let a = self.push_slot(self.sz.f64);
        self.m.mem.write_f64(a, v);
    }

    fn push_c64(&mut self, v: (f32, f32)) {
        let a = self.push_slot(self.sz.c64);
        self.m.mem.write_c64(a, v);
    }

    fn push_c128(&mut self, v: (f64, f64)) {
        let a = self.push_slot(self.sz.c128);
        self.m.mem.write_c128(a, v);
    }

    pub(crate) fn push_ptr(&mut self, v: u64) {
        let a = self.push_slot(self.sz.ptr);
        self.m.mem.write_ptr(a, v);
    }

    pub(crate) fn pop_i32(&mut self) -> i32 {
        let v = self.m.mem.read_i32(self.t.regs.sp);
        self.t.regs.sp += self.sz.i32 as u64;
        v
    }

    pub(crate) fn pop_i64(&mut self) -> i64 {
        let v = self.m.mem.read_i64(self.t.regs.sp);
        self.t.regs.sp += self.sz.i64 as u64;
        v
    }

    fn pop_f32(&mut self) -> f32 {
        let v = self.m.mem.read_f32(self.t.regs.sp);
        self.t.regs.sp += self.sz.f32 as u64;
        v
    }

    fn pop_f64(&mut self) -> f64 {
        let v = self.m.mem.read_f64(self.t.regs.sp);
        self.t.regs.sp += self.sz.f64 as u64;
        v
    }

    fn pop_c64(&mut self) -> (f32, f32) {
        let v = self.m.mem.read_c64(self.t.regs.sp);
        self.t.regs.sp += self.sz.c64 as u64;
        v
    }

    fn pop_c128(&mut self) -> (f64, f64) {
        let v = self.m.mem.read_c128(self.t.regs.sp);
        self.t.regs.sp += self.sz.c128 as u64;
        v
    }

    pub(crate) fn pop_ptr(&mut self) -> u64 {
        let v = self.m.mem.read_ptr(self.t.regs.sp);
        self.t.regs.sp += self.sz.ptr as u64;
        v
    }

    /// Base plus a signed 32-bit instruction offset.
    fn addr(base: u64, off: i32) -> u64 {
        base.wrapping_add(off as i64 as u64)
    }

    /// Fetch the `Ext` payload slot of a two-slot opcode.
    fn ext(&mut self) -> Result<i32, VmError> {
        match self.code.get(self.t.regs.ip) {
            Some(op) if op.opcode == Opcode::Ext => {
                self.t.regs.ip += 1;
                Ok(op.n)
            }
            _ => Err(self.trap("malformed ext slot")),
        }
    }

    /// Copy a block of `size` raw bytes onto the stack, slot rounded.
    fn push_block(&mut self, src: u64, size: usize) {
        let dst = self.push_slot(self.sz.block(size));
        self.m.mem.copy(dst, src, size);
    }

    // ------------------------------------------------------------------
    // Nested guest calls (FFI surface, qsort comparators)
    // ------------------------------------------------------------------

    /// Call a guest function from host code while the interpreter is live.
    ///
    /// Builds the result area and argument boundary, lets `args` push the
    /// arguments, enters the function's FFI adapter at `pc`, and runs until
    /// its `FfiReturn`. Returns the address of the result area; `ip` and `sp`
    /// are restored to their values on entry.
    pub(crate) fn guest_call<F>(
        &mut self,
        pc: usize,
        result_bytes: usize,
        args: F,
    ) -> Result<u64, VmError>
    where
        F: FnOnce(&mut Self),
    {
        let ip0 = self.t.regs.ip;
        let sp0 = self.t.regs.sp;

        let result_base = self.push_slot(result_bytes);
        self.t.rp_stack.push(self.t.regs.rp);
        self.t.regs.rp = self.t.regs.sp;
        args(self);
        self.t.regs.ip = pc;

        match self.dispatch_loop()? {
            Stop::Ffi => {}
            Stop::Exit(_) => return Err(self.trap("exit inside a nested guest call")),
        }

        self.t.regs.sp = sp0;
        self.t.regs.ip = ip0;
        Ok(result_base)
    }

    // ------------------------------------------------------------------
    // The loop
    // ------------------------------------------------------------------

    pub(crate) fn dispatch_loop(&mut self) -> Result<Stop, VmError> {
        loop {
            if self.cycles & KILL_CHECK_MASK == 0 && self.killed() {
                return Err(VmError::Killed);
            }
            self.cycles += 1;

            let pc = self.t.regs.ip;
            let op = match self.code.get(pc) {
                Some(op) => *op,
                None => return Err(self.trap(format!("pc {} out of range", pc))),
            };
            self.t.regs.ip = pc + 1;
            let n = op.n;

            match op.opcode {
                // ---------------------------------------------------------
                // Addressing and immediates
                // ---------------------------------------------------------
                Opcode::AP => {
                    let a = Self::addr(self.t.regs.ap, n);
                    self.push_ptr(a);
                }
                Opcode::BP => {
                    let a = Self::addr(self.t.regs.bp, n);
                    self.push_ptr(a);
                }
                Opcode::DS => self.push_ptr(Self::addr(self.ds, n)),
                Opcode::Text => self.push_ptr(Self::addr(self.text, n)),
                Opcode::FP => self.push_ptr(n as u32 as u64),
                Opcode::Push8 | Opcode::Push16 | Opcode::Push32 => self.push_i32(n),
                Opcode::Push64 => {
                    let hi = self.ext()? as u32 as u64;
                    self.push_u64(hi << 32 | n as u32 as u64);
                }
                Opcode::Zero8 | Opcode::Zero16 | Opcode::Zero32 => self.push_i32(0),
                Opcode::Zero64 => self.push_i64(0),
                Opcode::Dup8 | Opcode::Dup32 => {
                    let src = self.t.regs.sp;
                    let dst = self.push_slot(self.sz.i32);
                    self.m.mem.copy(dst, src, self.sz.i32);
                }
                Opcode::Dup64 => {
                    let src = self.t.regs.sp;
                    let dst = self.push_slot(self.sz.i64);
                    self.m.mem.copy(dst, src, self.sz.i64);
                }
                Opcode::AddSP => {
                    self.t.regs.sp = Self::addr(self.t.regs.sp, n);
                }
                Opcode::Nop => {}

                // ---------------------------------------------------------
                // Loads
                // ---------------------------------------------------------
                Opcode::Argument8 => {
                    let v = self.m.mem.read_i8(Self::addr(self.t.regs.ap, n));
                    self.push_i32(v as i32);
                }
                Opcode::Argument16 => {
                    let v = self.m.mem.read_i16(Self::addr(self.t.regs.ap, n));
                    self.push_i32(v as i32);
                }
                Opcode::Argument32 => {
                    let v = self.m.mem.read_i32(Self::addr(self.t.regs.ap, n));
                    self.push_i32(v);
                }
                Opcode::Argument64 => {
                    let v = self.m.mem.read_i64(Self::addr(self.t.regs.ap, n));
                    self.push_i64(v);
                }
                Opcode::Argument => {
                    let size = self.ext()? as usize;
                    self.push_block(Self::addr(self.t.regs.ap, n), size);
                }
                Opcode::Variable8 => {
                    let v = self.m.mem.read_i8(Self::addr(self.t.regs.bp, n));
                    self.push_i32(v as i32);
                }
                Opcode::Variable16 => {
                    let v = self.m.mem.read_i16(Self::addr(self.t.regs.bp, n));
                    self.push_i32(v as i32);
                }
                Opcode::Variable32 => {
                    let v = self.m.mem.read_i32(Self::addr(self.t.regs.bp, n));
                    self.push_i32(v);
                }
                Opcode::Variable64 => {
                    let v = self.m.mem.read_i64(Self::addr(self.t.regs.bp, n));
                    self.push_i64(v);
                }
                Opcode::Variable => {
                    let size = self.ext()? as usize;
                    self.push_block(Self::addr(self.t.regs.bp, n), size);
                }
                Opcode::DSI8 => {
                    let v = self.m.mem.read_i8(Self::addr(self.ds, n));
                    self.push_i32(v as i32);
                }
                Opcode::DSI16 => {
                    let v = self.m.mem.read_i16(Self::addr(self.ds, n));
                    self.push_i32(v as i32);
                }
                Opcode::DSI32 => {
                    let v = self.m.mem.read_i32(Self::addr(self.ds, n));
                    self.push_i32(v);
                }
                Opcode::DSI64 => {
                    let v = self.m.mem.read_i64(Self::addr(self.ds, n));
                    self.push_i64(v);
                }
                Opcode::DSC128 => {
                    let v = self.m.mem.read_c128(Self::addr(self.ds, n));
                    self.push_c128(v);
                }
                Opcode::DSN => {
                    let size = self.ext()? as usize;
                    self.push_block(Self::addr(self.ds, n), size);
                }
                Opcode::Load8 => {
                    let p = self.pop_ptr();
                    let v = self.m.mem.read_i8(Self::addr(p, n));
                    self.push_i32(v as i32);
                }
                Opcode::Load16 => {
                    let p = self.pop_ptr();
                    let v = self.m.mem.read_i16(Self::addr(p, n));
                    self.push_i32(v as i32);
                }
                Opcode::Load32 => {
                    let p = self.pop_ptr();
                    let v = self.m.mem.read_i32(Self::addr(p, n));
                    self.push_i32(v);
                }
                Opcode::Load64 => {
                    let p = self.pop_ptr();
                    let v = self.m.mem.read_i64(Self::addr(p, n));
                    self.push_i64(v);
                }
                Opcode::Load => {
                    let size = self.ext()? as usize;
                    let p = self.pop_ptr();
                    self.push_block(Self::addr(p, n), size);
                }

                // ---------------------------------------------------------
                // Stores
                // ---------------------------------------------------------
                Opcode::Store8 => {
                    let v = self.pop_i32();
                    let a = self.pop_ptr();
                    self.m.mem.write_u8(a, v as u8);
                    self.push_i32(v);
                }
                Opcode::Store16 => {
                    let v = self.pop_i32();
                    let a = self.pop_ptr();
                    self.m.mem.write_u16(a, v as u16);
                    self.push_i32(v);
                }
                Opcode::Store32 => {
                    let v = self.pop_i32();
                    let a = self.pop_ptr();
                    self.m.mem.write_i32(a, v);
                    self.push_i32(v);
                }
                Opcode::Store64 => {
                    let v = self.pop_i64();
                    let a = self.pop_ptr();
                    self.m.mem.write_i64(a, v);
                    self.push_i64(v);
                }
                Opcode::Store => {
                    let v = self.pop_ptr();
                    let a = self.pop_ptr();
                    self.m.mem.write_ptr(a, v);
                    self.push_ptr(v);
                }
                Opcode::StoreC128 => {
                    let v = self.pop_c128();
                    let a = self.pop_ptr();
                    self.m.mem.write_c128(a, v);
                    self.push_c128(v);
                }
                Opcode::StoreBits8 => {
                    let mask = n as u8;
                    let v = self.pop_i32();
                    let a = self.pop_ptr();
                    let w = self.m.mem.read_u8(a);
                    self.m.mem.write_u8(a, w & !mask | v as u8 & mask);
                    self.push_i32(v);
                }
                Opcode::StoreBits16 => {
                    let mask = n as u16;
                    let v = self.pop_i32();
                    let a = self.pop_ptr();
                    let w = self.m.mem.read_u16(a);
                    self.m.mem.write_u16(a, w & !mask | v as u16 & mask);
                    self.push_i32(v);
                }
                Opcode::StoreBits32 => {
                    let mask = n as u32;
                    let v = self.pop_i32();
                    let a = self.pop_ptr();
                    let w = self.m.mem.read_u32(a);
                    self.m.mem.write_u32(a, w & !mask | v as u32 & mask);
                    self.push_i32(v);
                }
                Opcode::StoreBits64 => {
                    let mask = n as i64 as u64;
                    let v = self.pop_i64();
                    let a = self.pop_ptr();
                    let w = self.m.mem.read_u64(a);
                    self.m.mem.write_u64(a, w & !mask | v as u64 & mask);
                    self.push_i64(v);
                }

                // ---------------------------------------------------------
                // Arithmetic
                // ---------------------------------------------------------
                Opcode::AddI32 => {
                    let b = self.pop_i32();
                    let a = self.pop_i32();
                    self.push_i32(a.wrapping_add(b));
                }
                Opcode::AddI64 => {
                    let b = self.pop_i64();
                    let a = self.pop_i64();
                    self.push_i64(a.wrapping_add(b));
                }
                Opcode::AddF32 => {
                    let b = self.pop_f32();
                    let a = self.pop_f32();
                    self.push_f32(a + b);
                }
                Opcode::AddF64 => {
                    let b = self.pop_f64();
                    let a = self.pop_f64();
                    self.push_f64(a + b);
                }
                Opcode::AddC64 => {
                    let b = self.pop_c64();
                    let a = self.pop_c64();
                    self.push_c64((a.0 + b.0, a.1 + b.1));
                }
                Opcode::AddC128 => {
                    let b = self.pop_c128();
                    let a = self.pop_c128();
                    self.push_c128((a.0 + b.0, a.1 + b.1));
                }
                Opcode::SubI32 => {
                    let b = self.pop_i32();
                    let a = self.pop_i32();
                    self.push_i32(a.wrapping_sub(b));
                }
                Opcode::SubI64 => {
                    let b = self.pop_i64();
                    let a = self.pop_i64();
                    self.push_i64(a.wrapping_sub(b));
                }
                Opcode::SubF32 => {
                    let b = self.pop_f32();
                    let a = self.pop_f32();
                    self.push_f32(a - b);
                }
                Opcode::SubF64 => {
                    let b = self.pop_f64();
                    let a = self.pop_f64();
                    self.push_f64(a - b);
                }
                Opcode::SubC64 => {
                    let b = self.pop_c64();
                    let a = self.pop_c64();
                    self.push_c64((a.0 - b.0, a.1 - b.1));
                }
                Opcode::SubC128 => {
                    let b = self.pop_c128();
                    let a = self.pop_c128();
                    self.push_c128((a.0 - b.0, a.1 - b.1));
                }
                Opcode::MulI32 => {
                    let b = self.pop_i32();
                    let a = self.pop_i32();
                    self.push_i32(a.wrapping_mul(b));
                }
                Opcode::MulI64 => {
                    let b = self.pop_i64();
                    let a = self.pop_i64();
                    self.push_i64(a.wrapping_mul(b));
                }
                Opcode::MulF32 => {
                    let b = self.pop_f32();
                    let a = self.pop_f32();
                    self.push_f32(a * b);
                }
                Opcode::MulF64 => {
                    let b = self.pop_f64();
                    let a = self.pop_f64();
                    self.push_f64(a * b);
                }
                Opcode::MulC64 => {
                    let b = self.pop_c64();
                    let a = self.pop_c64();
                    self.push_c64(complex_mul_f32(a, b));
                }
                Opcode::MulC128 => {
                    let b = self.pop_c128();
                    let a = self.pop_c128();
                    self.push_c128(complex_mul(a, b));
                }
                Opcode::DivI32 => {
                    let b = self.pop_i32();
                    let a = self.pop_i32();
                    self.push_i32(a.wrapping_div(b));
                }
                Opcode::DivU32 => {
                    let b = self.pop_i32() as u32;
                    let a = self.pop_i32() as u32;
                    self.push_i32((a / b) as i32);
                }
                Opcode::DivI64 => {
                    let b = self.pop_i64();
                    let a = self.pop_i64();
                    self.push_i64(a.wrapping_div(b));
                }
                Opcode::DivU64 => {
                    let b = self.pop_i64() as u64;
                    let a = self.pop_i64() as u64;
                    self.push_i64((a / b) as i64);
                }
                Opcode::DivF32 => {
                    let b = self.pop_f32();
                    let a = self.pop_f32();
                    self.push_f32(a / b);
                }
                Opcode::DivF64 => {
                    let b = self.pop_f64();
                    let a = self.pop_f64();
                    self.push_f64(a / b);
                }
                Opcode::DivC64 => {
                    let b = self.pop_c64();
                    let a = self.pop_c64();
                    self.push_c64(complex_div_f32(a, b));
                }
                Opcode::DivC128 => {
                    let b = self.pop_c128();
                    let a = self.pop_c128();
                    self.push_c128(complex_div(a, b));
                }
                Opcode::RemI32 => {
                    let b = self.pop_i32();
                    let a = self.pop_i32();
                    self.push_i32(a.wrapping_rem(b));
                }
                Opcode::RemU32 => {
                    let b = self.pop_i32() as u32;
                    let a = self.pop_i32() as u32;
                    self.push_i32((a % b) as i32);
                }
                Opcode::RemI64 => {
                    let b = self.pop_i64();
                    let a = self.pop_i64();
                    self.push_i64(a.wrapping_rem(b));
                }
                Opcode::RemU64 => {
                    let b = self.pop_i64() as u64;
                    let a = self.pop_i64() as u64;
                    self.push_i64((a % b) as i64);
                }
                Opcode::NegI8 => {
                    let v = self.pop_i32();
                    self.push_i32((v as i8).wrapping_neg() as i32);
                }
                Opcode::NegI16 => {
                    let v = self.pop_i32();
                    self.push_i32((v as i16).wrapping_neg() as i32);
                }
                Opcode::NegI32 => {
                    let v = self.pop_i32();
                    self.push_i32(v.wrapping_neg());
                }
                Opcode::NegI64 => {
                    let v = self.pop_i64();
                    self.push_i64(v.wrapping_neg());
                }
                Opcode::NegF32 => {
                    let v = self.pop_f32();
                    self.push_f32(-v);
                }
                Opcode::NegF64 => {
                    let v = self.pop_f64();
                    self.push_f64(-v);
                }
                Opcode::Cpl8 => {
                    let v = self.pop_i32();
                    self.push_i32(!(v as i8) as i32);
                }
                Opcode::Cpl16 => {
                    let v = self.pop_i32();
                    self.push_i32(!(v as i16) as i32);
                }
                Opcode::Cpl32 => {
                    let v = self.pop_i32();
                    self.push_i32(!v);
                }
                Opcode::Cpl64 => {
                    let v = self.pop_i64();
                    self.push_i64(!v);
                }

                // ---------------------------------------------------------
                // Logic and shifts
                // ---------------------------------------------------------
                Opcode::And8 | Opcode::And16 | Opcode::And32 => {
                    let b = self.pop_i32();
                    let a = self.pop_i32();
                    self.push_i32(a & b);
                }
                Opcode::And64 => {
                    let b = self.pop_i64();
                    let a = self.pop_i64();
                    self.push_i64(a & b);
                }
                Opcode::Or8 | Opcode::Or16 | Opcode::Or32 => {
                    let b = self.pop_i32();
                    let a = self.pop_i32();
                    self.push_i32(a | b);
                }
                Opcode::Or64 => {
                    let b = self.pop_i64();
                    let a = self.pop_i64();
                    self.push_i64(a | b);
                }
                Opcode::Xor8 | Opcode::Xor16 | Opcode::Xor32 => {
                    let b = self.pop_i32();
                    let a = self.pop_i32();
                    self.push_i32(a ^ b);
                }
                Opcode::Xor64 => {
                    let b = self.pop_i64();
                    let a = self.pop_i64();
                    self.push_i64(a ^ b);
                }
                Opcode::Lsh8 => {
                    let s = self.pop_i32() as u32;
                    let v = self.pop_i32();
                    self.push_i32((v.wrapping_shl(s)) as i8 as i32);
                }
                Opcode::Lsh16 => {
                    let s = self.pop_i32() as u32;
                    let v = self.pop_i32();
                    self.push_i32((v.wrapping_shl(s)) as i16 as i32);
                }
                Opcode::Lsh32 => {
                    let s = self.pop_i32() as u32;
                    let v = self.pop_i32();
                    self.push_i32(v.wrapping_shl(s));
                }
                Opcode::Lsh64 => {
                    let s = self.pop_i32() as u32;
                    let v = self.pop_i64();
                    self.push_i64(v.wrapping_shl(s));
                }
                Opcode::RshI8 => {
                    let s = self.pop_i32() as u32;
                    let v = self.pop_i32();
                    self.push_i32((v as i8).wrapping_shr(s) as i32);
                }
                Opcode::RshU8 => {
                    let s = self.pop_i32() as u32;
                    let v = self.pop_i32();
                    self.push_i32((v as u8).wrapping_shr(s) as i32);
                }
                Opcode::RshI16 => {
                    let s = self.pop_i32() as u32;
                    let v = self.pop_i32();
                    self.push_i32((v as i16).wrapping_shr(s) as i32);
                }
                Opcode::RshU16 => {
                    let s = self.pop_i32() as u32;
                    let v = self.pop_i32();
                    self.push_i32((v as u16).wrapping_shr(s) as i32);
                }
                Opcode::RshI32 => {
                    let s = self.pop_i32() as u32;
                    let v = self.pop_i32();
                    self.push_i32(v.wrapping_shr(s));
                }
                Opcode::RshU32 => {
                    let s = self.pop_i32() as u32;
                    let v = self.pop_i32();
                    self.push_i32((v as u32).wrapping_shr(s) as i32);
                }
                Opcode::RshI64 => {
                    let s = self.pop_i32() as u32;
                    let v = self.pop_i64();
                    self.push_i64(v.wrapping_shr(s));
                }
                Opcode::RshU64 => {
                    let s = self.pop_i32() as u32;
                    let v = self.pop_i64();
                    self.push_i64((v as u64).wrapping_shr(s) as i64);
                }

                // ---------------------------------------------------------
                // Comparisons
                // ---------------------------------------------------------
                Opcode::EqI32 => self.cmp_i32(|a, b| a == b),
                Opcode::NeqI32 => self.cmp_i32(|a, b| a != b),
                Opcode::LtI32 => self.cmp_i32(|a, b| a < b),
                Opcode::LeqI32 => self.cmp_i32(|a, b| a <= b),
                Opcode::GtI32 => self.cmp_i32(|a, b| a > b),
                Opcode::GeqI32 => self.cmp_i32(|a, b| a >= b),
                Opcode::LtU32 => self.cmp_u32(|a, b| a < b),
                Opcode::LeqU32 => self.cmp_u32(|a, b| a <= b),
                Opcode::GtU32 => self.cmp_u32(|a, b| a > b),
                Opcode::GeqU32 => self.cmp_u32(|a, b| a >= b),
                Opcode::EqI64 => self.cmp_i64(|a, b| a == b),
                Opcode::NeqI64 => self.cmp_i64(|a, b| a != b),
                Opcode::LtI64 => self.cmp_i64(|a, b| a < b),
                Opcode::LeqI64 => self.cmp_i64(|a, b| a <= b),
                Opcode::GtI64 => self.cmp_i64(|a, b| a > b),
                Opcode::GeqI64 => self.cmp_i64(|a, b| a >= b),
                Opcode::LtU64 => self.cmp_u64(|a, b| a < b),
                Opcode::LeqU64 => self.cmp_u64(|a, b| a <= b),
                Opcode::GtU64 => self.cmp_u64(|a, b| a > b),
                Opcode::GeqU64 => self.cmp_u64(|a, b| a >= b),
                Opcode::EqF32 => self.cmp_f32(|a, b| a == b),
                Opcode::NeqF32 => self.cmp_f32(|a, b| a != b),
                Opcode::LtF32 => self.cmp_f32(|a, b| a < b),
                Opcode::LeqF32 => self.cmp_f32(|a, b| a <= b),
                Opcode::GtF32 => self.cmp_f32(|a, b| a > b),
                Opcode::GeqF32 => self.cmp_f32(|a, b| a >= b),
                Opcode::EqF64 => self.cmp_f64(|a, b| a == b),
                Opcode::NeqF64 => self.cmp_f64(|a, b| a != b),
                Opcode::LtF64 => self.cmp_f64(|a, b| a < b),
                Opcode::LeqF64 => self.cmp_f64(|a, b| a <= b),
                Opcode::GtF64 => self.cmp_f64(|a, b| a > b),
                Opcode::GeqF64 => self.cmp_f64(|a, b| a >= b),
                Opcode::EqC64 => {
                    let b = self.pop_c64();
                    let a = self.pop_c64();
                    self.push_i32((a.0 == b.0 && a.1 == b.1) as i32);
                }
                Opcode::NeqC64 => {
                    let b = self.pop_c64();
                    let a = self.pop_c64();
                    self.push_i32((a.0 != b.0 || a.1 != b.1) as i32);
                }
                Opcode::EqC128 => {
                    let b = self.pop_c128();
                    let a = self.pop_c128();
                    self.push_i32((a.0 == b.0 && a.1 == b.1) as i32);
                }
                Opcode::NeqC128 => {
                    let b = self.pop_c128();
                    let a = self.pop_c128();
                    self.push_i32((a.0 != b.0 || a.1 != b.1) as i32);
                }

                // ---------------------------------------------------------
                // Conversions
                // ---------------------------------------------------------
                Opcode::ConvI8I16 | Opcode::ConvI8I32 => {
                    let v = self.pop_i32();
                    self.push_i32(v as i8 as i32);
                }
                Opcode::ConvI8I64 => {
                    let v = self.pop_i32();
                    self.push_i64(v as i8 as i64);
                }
                Opcode::ConvI16I32 => {
                    let v = self.pop_i32();
                    self.push_i32(v as i16 as i32);
                }
                Opcode::ConvI16I64 => {
                    let v = self.pop_i32();
                    self.push_i64(v as i16 as i64);
                }
                Opcode::ConvI32I64 => {
                    let v = self.pop_i32();
                    self.push_i64(v as i64);
                }
                Opcode::ConvU8U16 | Opcode::ConvU8U32 | Opcode::ConvU8I16 | Opcode::ConvU8I32 => {
                    let v = self.pop_i32();
                    self.push_i32(v as u8 as i32);
                }
                Opcode::ConvU8U64 | Opcode::ConvU8I64 => {
                    let v = self.pop_i32();
                    self.push_i64(v as u8 as i64);
                }
                Opcode::ConvU16U32 | Opcode::ConvU16I32 => {
                    let v = self.pop_i32();
                    self.push_i32(v as u16 as i32);
                }
                Opcode::ConvU16U64 | Opcode::ConvU16I64 => {
                    let v = self.pop_i32();
                    self.push_i64(v as u16 as i64);
                }
                Opcode::ConvU32U64 | Opcode::ConvU32I64 => {
                    let v = self.pop_i32();
                    self.push_i64(v as u32 as i64);
                }
                Opcode::ConvI8U8 | Opcode::ConvU32U8 | Opcode::ConvI32U8 | Opcode::ConvU16U8 => {
                    let v = self.pop_i32();
                    self.push_i32(v as u8 as i32);
                }
                Opcode::ConvU8I8 | Opcode::ConvI16I8 | Opcode::ConvI32I8 | Opcode::ConvU32I8 => {
                    let v = self.pop_i32();
                    self.push_i32(v as i8 as i32);
                }
                Opcode::ConvI16U16 | Opcode::ConvI32U16 | Opcode::ConvU32U16 => {
                    let v = self.pop_i32();
                    self.push_i32(v as u16 as i32);
                }
                Opcode::ConvU16I16 | Opcode::ConvI32I16 | Opcode::ConvU32I16 => {
                    let v = self.pop_i32();
                    self.push_i32(v as i16 as i32);
                }
                Opcode::ConvI32U32 | Opcode::ConvU32I32 => {}
                Opcode::ConvI64U64 | Opcode::ConvU64I64 => {}
                Opcode::ConvI64I8 => {
                    let v = self.pop_i64();
                    self.push_i32(v as i8 as i32);
                }
                Opcode::ConvI64I16 => {
                    let v = self.pop_i64();
                    self.push_i32(v as i16 as i32);
                }
                Opcode::ConvI64I32 | Opcode::ConvU64I32 | Opcode::ConvU64U32
                | Opcode::ConvI64U32 => {
                    let v = self.pop_i64();
                    self.push_i32(v as i32);
                }
                Opcode::ConvU64U8 => {
                    let v = self.pop_i64();
                    self.push_i32(v as u8 as i32);
                }
                Opcode::ConvU64U16 => {
                    let v = self.pop_i64();
                    self.push_i32(v as u16 as i32);
                }
                Opcode::ConvI32F32 => {
                    let v = self.pop_i32();
                    self.push_f32(v as f32);
                }
                Opcode::ConvI32F64 => {
                    let v = self.pop_i32();
                    self.push_f64(v as f64);
                }
                Opcode::ConvI64F32 => {
                    let v = self.pop_i64();
                    self.push_f32(v as f32);
                }
                Opcode::ConvI64F64 => {
                    let v = self.pop_i64();
                    self.push_f64(v as f64);
                }
                Opcode::ConvU32F32 => {
                    let v = self.pop_i32() as u32;
                    self.push_f32(v as f32);
                }
                Opcode::ConvU32F64 => {
                    let v = self.pop_i32() as u32;
                    self.push_f64(v as f64);
                }
                Opcode::ConvU64F32 => {
                    let v = self.pop_i64() as u64;
                    self.push_f32(v as f32);
                }
                Opcode::ConvU64F64 => {
                    let v = self.pop_i64() as u64;
                    self.push_f64(v as f64);
                }
                // Float to int truncates toward zero and saturates at the
                // destination extremes; NaN converts to 0.
                Opcode::ConvF32I32 => {
                    let v = self.pop_f32();
                    self.push_i32(v as i32);
                }
                Opcode::ConvF32I64 => {
                    let v = self.pop_f32();
                    self.push_i64(v as i64);
                }
                Opcode::ConvF32U32 => {
                    let v = self.pop_f32();
                    self.push_i32(v as u32 as i32);
                }
                Opcode::ConvF32U64 => {
                    let v = self.pop_f32();
                    self.push_i64(v as u64 as i64);
                }
                Opcode::ConvF64I8 => {
                    let v = self.pop_f64();
                    self.push_i32(v as i8 as i32);
                }
                Opcode::ConvF64I16 => {
                    let v = self.pop_f64();
                    self.push_i32(v as i16 as i32);
                }
                Opcode::ConvF64I32 => {
                    let v = self.pop_f64();
                    self.push_i32(v as i32);
                }
                Opcode::ConvF64I64 => {
                    let v = self.pop_f64();
                    self.push_i64(v as i64);
                }
                Opcode::ConvF64U16 => {
                    let v = self.pop_f64();
                    self.push_i32(v as u16 as i32);
                }
                Opcode::ConvF64U32 => {
                    let v = self.pop_f64();
                    self.push_i32(v as u32 as i32);
                }
                Opcode::ConvF64U64 => {
                    let v = self.pop_f64();
                    self.push_i64(v as u64 as i64);
                }
                Opcode::ConvF32F64 => {
                    let v = self.pop_f32();
                    self.push_f64(v as f64);
                }
                Opcode::ConvF64F32 => {
                    let v = self.pop_f64();
                    self.push_f32(v as f32);
                }
                Opcode::ConvF32C64 => {
                    let v = self.pop_f32();
                    self.push_c64((v, 0.0));
                }
                Opcode::ConvF64C128 => {
                    let v = self.pop_f64();
                    self.push_c128((v, 0.0));
                }
                Opcode::ConvC64C128 => {
                    let v = self.pop_c64();
                    self.push_c128((v.0 as f64, v.1 as f64));
                }
                Opcode::ConvC128C64 => {
                    let v = self.pop_c128();
                    self.push_c64((v.0 as f32, v.1 as f32));
                }
                Opcode::ConvI32C64 => {
                    let v = self.pop_i32();
                    self.push_c64((v as f32, 0.0));
                }
                Opcode::ConvI32C128 => {
                    let v = self.pop_i32();
                    self.push_c128((v as f64, 0.0));
                }

                // ---------------------------------------------------------
                // Booleanization
                // ---------------------------------------------------------
                Opcode::BoolI8 => {
                    let v = self.pop_i32();
                    self.push_i32((v as u8 != 0) as i32);
                }
                Opcode::BoolI16 => {
                    let v = self.pop_i32();
                    self.push_i32((v as u16 != 0) as i32);
                }
                Opcode::BoolI32 => {
                    let v = self.pop_i32();
                    self.push_i32((v != 0) as i32);
                }
                Opcode::BoolI64 => {
                    let v = self.pop_i64();
                    self.push_i32((v != 0) as i32);
                }
                Opcode::BoolF32 => {
                    let v = self.pop_f32();
                    self.push_i32((v != 0.0) as i32);
                }
                Opcode::BoolF64 => {
                    let v = self.pop_f64();
                    self.push_i32((v != 0.0) as i32);
                }
                Opcode::BoolC64 => {
                    let v = self.pop_c64();
                    self.push_i32((v.0 != 0.0 || v.1 != 0.0) as i32);
                }
                Opcode::BoolC128 => {
                    let v = self.pop_c128();
                    self.push_i32((v.0 != 0.0 || v.1 != 0.0) as i32);
                }

                // ---------------------------------------------------------
                // Bitfields: n = lshift<<8 | rshift over the stored width
                // ---------------------------------------------------------
                Opcode::BitfieldI8 => {
                    let (l, r) = bitfield_shifts(n);
                    let v = self.pop_i32();
                    self.push_i32((v.wrapping_shl(l) as i8).wrapping_shr(r) as i32);
                }
                Opcode::BitfieldU8 => {
                    let (l, r) = bitfield_shifts(n);
                    let v = self.pop_i32();
                    self.push_i32((v.wrapping_shl(l) as u8).wrapping_shr(r) as i32);
                }
                Opcode::BitfieldI16 => {
                    let (l, r) = bitfield_shifts(n);
                    let v = self.pop_i32();
                    self.push_i32((v.wrapping_shl(l) as i16).wrapping_shr(r) as i32);
                }
                Opcode::BitfieldU16 => {
                    let (l, r) = bitfield_shifts(n);
                    let v = self.pop_i32();
                    self.push_i32((v.wrapping_shl(l) as u16).wrapping_shr(r) as i32);
                }
                Opcode::BitfieldI32 => {
                    let (l, r) = bitfield_shifts(n);
                    let v = self.pop_i32();
                    self.push_i32(v.wrapping_shl(l).wrapping_shr(r));
                }
                Opcode::BitfieldU32 => {
                    let (l, r) = bitfield_shifts(n);
                    let v = self.pop_i32();
                    self.push_i32((v as u32).wrapping_shl(l).wrapping_shr(r) as i32);
                }
                Opcode::BitfieldI64 => {
                    let (l, r) = bitfield_shifts(n);
                    let v = self.pop_i64();
                    self.push_i64(v.wrapping_shl(l).wrapping_shr(r));
                }
                Opcode::BitfieldU64 => {
                    let (l, r) = bitfield_shifts(n);
                    let v = self.pop_i64();
                    self.push_i64((v as u64).wrapping_shl(l).wrapping_shr(r) as i64);
                }

                // ---------------------------------------------------------
                // Increment / decrement
                // ---------------------------------------------------------
                Opcode::PreIncI8 | Opcode::PreDecI8 => {
                    let d = inc_delta(op.opcode, n);
                    let a = self.pop_ptr();
                    let v = (self.m.mem.read_i8(a) as i32).wrapping_add(d) as i8;
                    self.m.mem.write_u8(a, v as u8);
                    self.push_i32(v as i32);
                }
                Opcode::PreIncI16 | Opcode::PreDecI16 => {
                    let d = inc_delta(op.opcode, n);
                    let a = self.pop_ptr();
                    let v = (self.m.mem.read_i16(a) as i32).wrapping_add(d) as i16;
                    self.m.mem.write_u16(a, v as u16);
                    self.push_i32(v as i32);
                }
                Opcode::PreIncI32 | Opcode::PreDecI32 => {
                    let d = inc_delta(op.opcode, n);
                    let a = self.pop_ptr();
                    let v = self.m.mem.read_i32(a).wrapping_add(d);
                    self.m.mem.write_i32(a, v);
                    self.push_i32(v);
                }
                Opcode::PreIncI64 | Opcode::PreDecI64 => {
                    let d = inc_delta(op.opcode, n) as i64;
                    let a = self.pop_ptr();
                    let v = self.m.mem.read_i64(a).wrapping_add(d);
                    self.m.mem.write_i64(a, v);
                    self.push_i64(v);
                }
                Opcode::PreIncPtr | Opcode::PreDecPtr => {
                    let d = inc_delta(op.opcode, n) as i64 as u64;
                    let a = self.pop_ptr();
                    let v = self.m.mem.read_ptr(a).wrapping_add(d);
                    self.m.mem.write_ptr(a, v);
                    self.push_ptr(v);
                }
                Opcode::PostIncI8 | Opcode::PostDecI8 => {
                    let d = inc_delta(op.opcode, n);
                    let a = self.pop_ptr();
                    let v = self.m.mem.read_i8(a);
                    self.m.mem.write_u8(a, (v as i32).wrapping_add(d) as u8);
                    self.push_i32(v as i32);
                }
                Opcode::PostIncI16 | Opcode::PostDecI16 => {
                    let d = inc_delta(op.opcode, n);
                    let a = self.pop_ptr();
                    let v = self.m.mem.read_i16(a);
                    self.m.mem.write_u16(a, (v as i32).wrapping_add(d) as u16);
                    self.push_i32(v as i32);
                }
                Opcode::PostIncI32 | Opcode::PostDecI32 => {
                    let d = inc_delta(op.opcode, n);
                    let a = self.pop_ptr();
                    let v = self.m.mem.read_i32(a);
                    self.m.mem.write_i32(a, v.wrapping_add(d));
                    self.push_i32(v);
                }
                Opcode::PostIncI64 | Opcode::PostDecI64 => {
                    let d = inc_delta(op.opcode, n) as i64;
                    let a = self.pop_ptr();
                    let v = self.m.mem.read_i64(a);
                    self.m.mem.write_i64(a, v.wrapping_add(d));
                    self.push_i64(v);
                }
                Opcode::PostIncPtr | Opcode::PostDecPtr => {
                    let d = inc_delta(op.opcode, n) as i64 as u64;
                    let a = self.pop_ptr();
                    let v = self.m.mem.read_ptr(a);
                    self.m.mem.write_ptr(a, v.wrapping_add(d));
                    self.push_ptr(v);
                }
                Opcode::PreIncBits | Opcode::PostIncBits => {
                    let desc = self.ext()? as u32;
                    let a = self.pop_ptr();
                    let v = self.incdec_bits(op.opcode, a, n, desc);
                    self.push_i32(v);
                }

                // ---------------------------------------------------------
                // Pointer arithmetic
                // ---------------------------------------------------------
                Opcode::IndexI16 => {
                    let i = self.pop_i32() as i16 as i64;
                    self.index(i, n)
                }
                Opcode::IndexU16 => {
                    let i = self.pop_i32() as u16 as i64;
                    self.index(i, n)
                }
                Opcode::IndexI32 => {
                    let i = self.pop_i32() as i64;
                    self.index(i, n)
                }
                Opcode::IndexU32 => {
                    let i = self.pop_i32() as u32 as i64;
                    self.index(i, n)
                }
                Opcode::IndexI64 => {
                    let i = self.pop_i64();
                    self.index(i, n)
                }
                Opcode::IndexU64 => {
                    let i = self.pop_i64();
                    self.index(i, n)
                }
                Opcode::NegIndexI32 => {
                    let i = self.pop_i32() as i64;
                    self.index(-i, n)
                }
                Opcode::NegIndexU32 => {
                    let i = self.pop_i32() as u32 as i64;
                    self.index(-i, n)
                }
                Opcode::NegIndexI64 => {
                    let i = self.pop_i64();
                    self.index(-i, n)
                }
                Opcode::NegIndexU64 => {
                    let i = self.pop_i64();
                    self.index(i.wrapping_neg(), n)
                }
                Opcode::PtrDiff => {
                    let q = self.pop_ptr();
                    let p = self.pop_ptr();
                    let d = (p.wrapping_sub(q) as i64) / n as i64;
                    self.push_ptr(d as u64);
                }

                // ---------------------------------------------------------
                // Control transfer
                // ---------------------------------------------------------
                Opcode::Jmp => self.t.regs.ip = n as usize,
                Opcode::Jz => {
                    let v = self.pop_i32();
                    if v == 0 {
                        self.t.regs.ip = n as usize;
                    }
                }
                Opcode::Jnz => {
                    let v = self.pop_i32();
                    if v != 0 {
                        self.t.regs.ip = n as usize;
                    }
                }
                Opcode::JmpP => {
                    let p = self.pop_ptr();
                    self.t.regs.ip = p as usize;
                }
                Opcode::Call => {
                    let ret = self.t.regs.ip as u64;
                    self.push_ptr(ret);
                    self.t.regs.ip = n as usize;
                }
                Opcode::CallFP => {
                    let target = match self.t.fp_stack.pop() {
                        Some(t) => t,
                        None => return Err(self.trap("CallFP with empty fp stack")),
                    };
                    let ret = self.t.regs.ip as u64;
                    self.push_ptr(ret);
                    self.t.regs.ip = target as usize + FFI_PROLOG;
                }
                Opcode::Func => {
                    let ap = self.t.regs.ap;
                    self.push_ptr(ap);
                    self.t.regs.ap = self.t.regs.rp;
                    let bp = self.t.regs.bp;
                    self.push_ptr(bp);
                    self.t.regs.bp = self.t.regs.sp;
                    self.t.regs.sp = Self::addr(self.t.regs.sp, n);
                    self.t.regs.sp &= !0xF;
                }
                Opcode::Return => {
                    self.t.regs.sp = self.t.regs.bp;
                    self.t.regs.bp = self.pop_ptr();
                    let saved_ap = self.pop_ptr();
                    let ret = self.pop_ptr();
                    self.t.regs.ip = ret as usize;
                    self.t.regs.rp = match self.t.rp_stack.pop() {
                        Some(rp) => rp,
                        None => return Err(self.trap("Return with empty rp stack")),
                    };
                    self.t.regs.sp = self.t.regs.ap;
                    self.t.regs.ap = saved_ap;
                }
                Opcode::Arguments => {
                    self.t.rp_stack.push(self.t.regs.rp);
                    self.t.regs.rp = self.t.regs.sp;
                }
                Opcode::ArgumentsFP => {
                    self.t.rp_stack.push(self.t.regs.rp);
                    let fp = self.pop_ptr();
                    self.t.fp_stack.push(fp);
                    self.t.regs.rp = self.t.regs.sp;
                }
                Opcode::FfiReturn => return Ok(Stop::Ffi),
                Opcode::SwitchI32 => {
                    let key = self.pop_i32() as i64;
                    self.switch_table(n, 4, key)?;
                }
                Opcode::SwitchI64 => {
                    let key = self.pop_i64();
                    self.switch_table(n, 8, key)?;
                }
                Opcode::Panic => {
                    self.t.regs.ip = pc;
                    return Err(VmError::GuestPanic {
                        trace: trace::capture(self.m, self.t),
                    });
                }
                Opcode::Ext => {
                    self.t.regs.ip = pc;
                    return Err(self.trap("ext slot reached"));
                }
                Opcode::Exit => {
                    let status = self.m.mem.read_i32(self.t.regs.sp);
                    return Ok(Stop::Exit(status));
                }
                Opcode::Abort => return Ok(Stop::Exit(1)),

                // ---------------------------------------------------------
                // Control constructs with host support
                // ---------------------------------------------------------
                Opcode::Setjmp => self.op_setjmp()?,
                Opcode::Longjmp => self.op_longjmp()?,
                Opcode::Alloca => self.op_alloca()?,

                // ---------------------------------------------------------
                // Everything else is a built-in
                // ---------------------------------------------------------
                other => builtins::dispatch(self, other)?,
            }
        }
    }

    // ------------------------------------------------------------------
    // Comparison helpers
    // ------------------------------------------------------------------

    fn cmp_i32(&mut self, f: impl Fn(i32, i32) -> bool) {
        let b = self.pop_i32();
        let a = self.pop_i32();
        self.push_i32(f(a, b) as i32);
    }

    fn cmp_u32(&mut self, f: impl Fn(u32, u32) -> bool) {
        let b = self.pop_i32() as u32;
        let a = self.pop_i32() as u32;
        self.push_i32(f(a, b) as i32);
    }

    fn cmp_i64(&mut self, f: impl Fn(i64, i64) -> bool) {
        let b = self.pop_i64();
        let a = self.pop_i64();
        self.push_i32(f(a, b) as i32);
    }

    fn cmp_u64(&mut self, f: impl Fn(u64, u64) -> bool) {
        let b = self.pop_i64() as u64;
        let a = self.pop_i64() as u64;
        self.push_i32(f(a, b) as i32);
    }

    fn cmp_f32(&mut self, f: impl Fn(f32, f32) -> bool) {
        let b = self.pop_f32();
        let a = self.pop_f32();
        self.push_i32(f(a, b) as i32);
    }

    fn cmp_f64(&mut self, f: impl Fn(f64, f64) -> bool) {
        let b = self.pop_f64();
        let a = self.pop_f64();
        self.push_i32(f(a, b) as i32);
    }

    fn index(&mut self, idx: i64, stride: i32) {
        let p = self.pop_ptr();
        self.push_ptr(p.wrapping_add(idx.wrapping_mul(stride as i64) as u64));
    }

    /// Read-modify-write of a bitfield through a popped address. The `Ext`
    /// descriptor packs bits<<16 | bitoffset<<8 | storageWidth.
    fn incdec_bits(&mut self, opcode: Opcode, a: u64, delta: i32, desc: u32) -> i32 {
        let bits = (desc >> 16 & 0xFF) as u32;
        let bitoff = (desc >> 8 & 0xFF) as u32;
        let width = (desc & 0xFF) as usize;

        let w = match width {
            1 => self.m.mem.read_u8(a) as u64,
            2 => self.m.mem.read_u16(a) as u64,
            4 => self.m.mem.read_u32(a) as u64,
            8 => self.m.mem.read_u64(a),
            _ => panic!("memory trap: bad bitfield storage width {}", width),
        };
        let field_mask = if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 };
        let mask = field_mask << bitoff;
        let field = (w & mask) >> bitoff;
        let new_field = (field as i64).wrapping_add(delta as i64) as u64 & field_mask;
        let w2 = w & !mask | new_field << bitoff;
        match width {
            1 => self.m.mem.write_u8(a, w2 as u8),
            2 => self.m.mem.write_u16(a, w2 as u16),
            4 => self.m.mem.write_u32(a, w2 as u32),
            _ => self.m.mem.write_u64(a, w2),
        }

        let result = if matches!(opcode, Opcode::PreIncBits) {
            new_field
        } else {
            field
        };
        // Sign extend from the field width, as C does for int bitfields.
        let shift = 64 - bits.clamp(1, 64);
        ((result << shift) as i64 >> shift) as i32
    }

    /// Binary search of a jump table in the data segment: a 32-bit case
    /// count, `count` sorted keys of `key_size` bytes, then `count + 1`
    /// pointer-sized labels with the default label last.
    fn switch_table(&mut self, table_off: i32, key_size: u64, key: i64) -> Result<(), VmError> {
        let tbl = Self::addr(self.ds, table_off);
        let count = self.m.mem.read_i32(tbl) as u64;
        let keys = tbl + 4;
        let labels = keys + count * key_size;
        let ptr = self.sz.ptr as u64;

        let mut lo = 0u64;
        let mut hi = count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let k = match key_size {
                4 => self.m.mem.read_i32(keys + mid * 4) as i64,
                _ => self.m.mem.read_i64(keys + mid * 8),
            };
            if k == key {
                self.t.regs.ip = self.m.mem.read_ptr(labels + mid * ptr) as usize;
                return Ok(());
            } else if k < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        self.t.regs.ip = self.m.mem.read_ptr(labels + count * ptr) as usize;
        Ok(())
    }

    // ------------------------------------------------------------------
    // setjmp / longjmp / alloca
    // ------------------------------------------------------------------

    /// Snapshot {ap, bp, ip, rp, sp, fpStackP, rpStackP} into the jmp_buf.
    /// The recorded values are those the registers will hold right after
    /// this built-in returns, so a longjmp lands exactly there.
    fn op_setjmp(&mut self) -> Result<(), VmError> {
        let env = self.m.mem.read_ptr(self.t.regs.sp);
        let ptr = self.sz.ptr as u64;
        let rp_after = match self.t.rp_stack.last() {
            Some(&rp) => rp,
            None => return Err(self.trap("setjmp outside a call")),
        };

        self.m.mem.write_ptr(env, self.t.regs.ap);
        self.m.mem.write_ptr(env + ptr, self.t.regs.bp);
        self.m.mem.write_ptr(env + 2 * ptr, self.t.regs.ip as u64);
        self.m.mem.write_ptr(env + 3 * ptr, rp_after);
        self.m.mem.write_ptr(env + 4 * ptr, self.t.regs.rp);
        self.m.mem.write_ptr(env + 5 * ptr, self.t.fp_stack.len() as u64);
        self.m.mem.write_ptr(env + 6 * ptr, (self.t.rp_stack.len() - 1) as u64);

        // First return: 0 into the result slot, then the ordinary epilogue.
        self.m.mem.write_i32(self.t.regs.rp, 0);
        self.t.regs.sp = self.t.regs.rp;
        self.t.regs.rp = rp_after;
        self.t.rp_stack.pop();
        Ok(())
    }

    /// Reload the snapshot and deliver `val` (forced to 1 when 0) as
    /// setjmp's second return. The auxiliary stacks are truncated to the
    /// recorded depths, never unwound.
    fn op_longjmp(&mut self) -> Result<(), VmError> {
        let ptr = self.sz.ptr as u64;
        let env = self.m.mem.read_ptr(self.t.regs.rp - ptr);
        let mut val = self.m.mem.read_i32(self.t.regs.rp - ptr - self.sz.i32 as u64);
        if val == 0 {
            val = 1;
        }

        self.t.regs.ap = self.m.mem.read_ptr(env);
        self.t.regs.bp = self.m.mem.read_ptr(env + ptr);
        self.t.regs.ip = self.m.mem.read_ptr(env + 2 * ptr) as usize;
        self.t.regs.rp = self.m.mem.read_ptr(env + 3 * ptr);
        self.t.regs.sp = self.m.mem.read_ptr(env + 4 * ptr);
        let fp_depth = self.m.mem.read_ptr(env + 5 * ptr) as usize;
        let rp_depth = self.m.mem.read_ptr(env + 6 * ptr) as usize;
        if fp_depth > self.t.fp_stack.len() || rp_depth > self.t.rp_stack.len() {
            return Err(self.trap("longjmp into a dead frame"));
        }
        self.t.fp_stack.truncate(fp_depth);
        self.t.rp_stack.truncate(rp_depth);

        // sp now points at setjmp's result slot.
        self.m.mem.write_i32(self.t.regs.sp, val);
        Ok(())
    }

    /// Carve `size` bytes out of the caller's frame below the live stack and
    /// re-anchor the result pointer under the block. The space is reclaimed
    /// by the caller's `Return` (sp = bp).
    fn op_alloca(&mut self) -> Result<(), VmError> {
        let size = self.m.mem.read_i32(self.t.regs.sp).max(0) as u64;
        let a = (size + 15) & !0xF;
        let block = self.t.regs.rp - a;
        let new_rp = block - self.sz.ptr as u64;
        self.m.mem.write_ptr(new_rp, block);

        self.t.regs.sp = new_rp;
        self.t.regs.rp = match self.t.rp_stack.pop() {
            Some(rp) => rp,
            None => return Err(self.trap("alloca outside a call")),
        };
        Ok(())
    }
}

fn bitfield_shifts(n: i32) -> (u32, u32) {
    ((n >> 8 & 0xFF) as u32, (n & 0xFF) as u32)
}

fn inc_delta(opcode: Opcode, n: i32) -> i32 {
    match opcode {
        Opcode::PreDecI8
        | Opcode::PreDecI16
        | Opcode::PreDecI32
        | Opcode::PreDecI64
        | Opcode::PreDecPtr
        | Opcode::PostDecI8
        | Opcode::PostDecI16
        | Opcode::PostDecI32
        | Opcode::PostDecI64
        | Opcode::PostDecPtr => n.wrapping_neg(),
        _ => n,
    }
}

fn complex_mul(a: (f64, f64), b: (f64, f64)) -> (f64, f64) {
    (a.0 * b.0 - a.1 * b.1, a.0 * b.1 + a.1 * b.0)
}

fn complex_div(a: (f64, f64), b: (f64, f64)) -> (f64, f64) {
    let d = b.0 * b.0 + b.1 * b.1;
    ((a.0 * b.0 + a.1 * b.1) / d, (a.1 * b.0 - a.0 * b.1) / d)
}

fn complex_mul_f32(a: (f32, f32), b: (f32, f32)) -> (f32, f32) {
    let r = complex_mul((a.0 as f64, a.1 as f64), (b.0 as f64, b.1 as f64));
    (r.0 as f32, r.1 as f32)
}

fn complex_div_f32(a: (f32, f32), b: (f32, f32)) -> (f32, f32) {
    let r = complex_div((a.0 as f64, a.1 as f64), (b.0 as f64, b.1 as f64));
    (r.0 as f32, r.1 as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::{Binary, MemoryModel};
    use crate::opcode::{Opcode as Op, Operation};
    use std::io;
    use std::sync::Arc;

    fn op(opcode: Op, n: i32) -> Operation {
        Operation::new(opcode, n)
    }

    fn machine_for(ops: Vec<Operation>, data: Vec<u8>) -> Arc<Machine> {
        let mut b = Binary::new(MemoryModel::M64);
        b.code = ops;
        b.data = data;
        Arc::new(
            Machine::new(
                b,
                1 << 16,
                Box::new(io::empty()),
                Box::new(io::sink()),
                Box::new(io::sink()),
                None,
            )
            .unwrap(),
        )
    }

    fn run_ops(ops: Vec<Operation>) -> Result<i32, VmError> {
        run_ops_data(ops, Vec::new())
    }

    fn run_ops_data(ops: Vec<Operation>, data: Vec<u8>) -> Result<i32, VmError> {
        let m = machine_for(ops, data);
        let mut t = m.new_thread(1 << 16).unwrap();
        Cpu::new(&m, &mut t).run()
    }

    #[test]
    fn test_exit_status() {
        let status = run_ops(vec![op(Op::Push32, 42), op(Op::Exit, 0)]).unwrap();
        assert_eq!(status, 42);
    }

    #[test]
    fn test_abort() {
        assert_eq!(run_ops(vec![op(Op::Abort, 0)]).unwrap(), 1);
    }

    #[test]
    fn test_add_i32() {
        let status = run_ops(vec![
            op(Op::Push32, 2),
            op(Op::Push32, 3),
            op(Op::AddI32, 0),
            op(Op::Exit, 0),
        ])
        .unwrap();
        assert_eq!(status, 5);
    }

    #[test]
    fn test_signed_vs_unsigned_division() {
        let status = run_ops(vec![
            op(Op::Push32, -6),
            op(Op::Push32, 2),
            op(Op::DivI32, 0),
            op(Op::Exit, 0),
        ])
        .unwrap();
        assert_eq!(status, -3);

        let status = run_ops(vec![
            op(Op::Push32, -6),
            op(Op::Push32, 1 << 30),
            op(Op::DivU32, 0),
            op(Op::Exit, 0),
        ])
        .unwrap();
        assert_eq!(status, 3);
    }

    #[test]
    fn test_divide_by_zero_traps() {
        let err = run_ops(vec![
            op(Op::Push32, 1),
            op(Op::Push32, 0),
            op(Op::DivI32, 0),
            op(Op::Exit, 0),
        ])
        .unwrap_err();
        assert!(matches!(err, VmError::InstructionTrap { .. }));
    }

    #[test]
    fn test_push64() {
        let status = run_ops(vec![
            op(Op::Push64, 7),
            op(Op::Ext, 1), // value = 1<<32 | 7
            op(Op::Push64, 7),
            op(Op::Ext, 1),
            op(Op::SubI64, 0),
            op(Op::ConvI64I32, 0),
            op(Op::Exit, 0),
        ])
        .unwrap();
        assert_eq!(status, 0);
    }

    #[test]
    fn test_conv_f32_i32_saturates() {
        let big = 2.0e10f32;
        let status = run_ops(vec![
            op(Op::Push32, big.to_bits() as i32),
            op(Op::ConvF32I32, 0),
            op(Op::Exit, 0),
        ])
        .unwrap();
        assert_eq!(status, i32::MAX);

        let status = run_ops(vec![
            op(Op::Push32, (-big).to_bits() as i32),
            op(Op::ConvF32I32, 0),
            op(Op::Exit, 0),
        ])
        .unwrap();
        assert_eq!(status, i32::MIN);
    }

    #[test]
    fn test_conv_roundtrip_widen_narrow() {
        // i32 -> i64 -> i32 is the identity.
        let status = run_ops(vec![
            op(Op::Push32, -12345),
            op(Op::ConvI32I64, 0),
            op(Op::ConvI64I32, 0),
            op(Op::Exit, 0),
        ])
        .unwrap();
        assert_eq!(status, -12345);

        // Narrowing truncates two's-complement: 0x1_0000_002A -> 0x2A.
        let status = run_ops(vec![
            op(Op::Push64, 42),
            op(Op::Ext, 1),
            op(Op::ConvI64I32, 0),
            op(Op::Exit, 0),
        ])
        .unwrap();
        assert_eq!(status, 42);
    }

    #[test]
    fn test_call_return() {
        let i32ssz = StackSizes::of(MemoryModel::M64).i32 as i32;
        let status = run_ops(vec![
            op(Op::AddSP, -i32ssz), // result slot
            op(Op::Arguments, 0),
            op(Op::Call, 5),
            op(Op::Exit, 0), // result on top after return
            op(Op::Nop, 0),
            op(Op::Func, 0), // 5
            op(Op::AP, 0),
            op(Op::Push32, 7),
            op(Op::Store32, 0),
            op(Op::Return, 0),
        ])
        .unwrap();
        assert_eq!(status, 7);
    }

    #[test]
    fn test_frame_registers_balance() {
        // Two nested calls; the leaf result propagates out untouched.
        let i32ssz = StackSizes::of(MemoryModel::M64).i32 as i32;
        let status = run_ops(vec![
            op(Op::AddSP, -i32ssz),
            op(Op::Arguments, 0),
            op(Op::Call, 5), // outer
            op(Op::Exit, 0),
            op(Op::Nop, 0),
            op(Op::Func, 0), // 5: outer()
            op(Op::AP, 0),
            op(Op::AddSP, -i32ssz),
            op(Op::Arguments, 0),
            op(Op::Call, 13), // leaf; its result lands on top of the stack
            op(Op::Store32, 0), // store it through the address AP pushed
            op(Op::Return, 0),
            op(Op::Nop, 0),
            op(Op::Func, 0), // 13: leaf()
            op(Op::AP, 0),
            op(Op::Push32, 31),
            op(Op::Store32, 0),
            op(Op::Return, 0),
        ])
        .unwrap();
        assert_eq!(status, 31);
    }

    #[test]
    fn test_jz_jnz_loop() {
        // Count 3 down to 0 in the data segment, then exit with the cell.
        let status = run_ops_data(
            vec![
                op(Op::DS, 0),
                op(Op::PostDecI32, 1),
                op(Op::Jnz, 0), // pops the old value
                op(Op::DSI32, 0),
                op(Op::Exit, 0),
            ],
            vec![3, 0, 0, 0],
        )
        .unwrap();
        // 3, 2, 1 pop as nonzero; the pop of 0... PostDec keeps running
        // until the old value is 1 -> stored 0, Jnz(1) loops, old 0 falls
        // through with the cell at -1.
        assert_eq!(status, -1);
    }

    #[test]
    fn test_switch_i32() {
        // Table at ds+0: count=2, keys [10, 20], labels [L10, L20, Ldefault].
        let mut data = Vec::new();
        data.extend_from_slice(&2i32.to_le_bytes());
        data.extend_from_slice(&10i32.to_le_bytes());
        data.extend_from_slice(&20i32.to_le_bytes());
        data.extend_from_slice(&4u64.to_le_bytes()); // key 10 -> ip 4
        data.extend_from_slice(&6u64.to_le_bytes()); // key 20 -> ip 6
        data.extend_from_slice(&8u64.to_le_bytes()); // default -> ip 8

        let code = |key: i32| {
            vec![
                op(Op::Push32, key),
                op(Op::SwitchI32, 0),
                op(Op::Push32, -9),
                op(Op::Exit, 0),
                op(Op::Push32, 1), // 4
                op(Op::Exit, 0),
                op(Op::Push32, 2), // 6
                op(Op::Exit, 0),
                op(Op::Push32, 3), // 8
                op(Op::Exit, 0),
            ]
        };

        assert_eq!(run_ops_data(code(10), data.clone()).unwrap(), 1);
        assert_eq!(run_ops_data(code(20), data.clone()).unwrap(), 2);
        assert_eq!(run_ops_data(code(15), data).unwrap(), 3);
    }

    #[test]
    fn test_pre_and_post_inc() {
        let status = run_ops_data(
            vec![op(Op::DS, 0), op(Op::PreIncI32, 5), op(Op::Exit, 0)],
            vec![0; 8],
        )
        .unwrap();
        assert_eq!(status, 5);

        let status = run_ops_data(
            vec![op(Op::DS, 0), op(Op::PostIncI32, 5), op(Op::Exit, 0)],
            vec![0; 8],
        )
        .unwrap();
        assert_eq!(status, 0);
    }

    #[test]
    fn test_index_and_ptrdiff() {
        // &ds[3 * 4] - &ds[0] over stride 4 == 3.
        let status = run_ops_data(
            vec![
                op(Op::DS, 0),
                op(Op::Push32, 3),
                op(Op::IndexI32, 4),
                op(Op::DS, 0),
                op(Op::PtrDiff, -4), // (12) / (-4)
                op(Op::ConvI64I32, 0),
                op(Op::Exit, 0),
            ],
            vec![0; 16],
        )
        .unwrap();
        assert_eq!(status, -3);
    }

    #[test]
    fn test_setjmp_longjmp() {
        let i32ssz = StackSizes::of(MemoryModel::M64).i32 as i32;
        let status = run_ops_data(
            vec![
                op(Op::AddSP, -i32ssz), // setjmp result
                op(Op::Arguments, 0),
                op(Op::DS, 0), // jmp_buf in the data segment
                op(Op::Setjmp, 0),
                op(Op::Jnz, 10), // second return jumps out with the value
                op(Op::Arguments, 0),
                op(Op::DS, 0),
                op(Op::Push32, 42),
                op(Op::Longjmp, 0),
                op(Op::Nop, 0), // unreachable
                op(Op::Push32, 7), // 10
                op(Op::Exit, 0),
            ],
            vec![0; 7 * 8],
        )
        .unwrap();
        assert_eq!(status, 7);
    }

    #[test]
    fn test_longjmp_forces_nonzero_return() {
        let i32ssz = StackSizes::of(MemoryModel::M64).i32 as i32;
        let status = run_ops_data(
            vec![
                op(Op::AddSP, -i32ssz),
                op(Op::Arguments, 0),
                op(Op::DS, 0),
                op(Op::Setjmp, 0),
                op(Op::Jnz, 9), // jumps with max(val, 1)
                op(Op::Arguments, 0),
                op(Op::DS, 0),
                op(Op::Push32, 0), // longjmp(env, 0) must deliver 1
                op(Op::Longjmp, 0),
                op(Op::Push32, 5), // 9
                op(Op::Exit, 0),
            ],
            vec![0; 7 * 8],
        )
        .unwrap();
        assert_eq!(status, 5);
    }

    #[test]
    fn test_alloca() {
        let ptrsz = StackSizes::of(MemoryModel::M64).ptr as i32;
        let status = run_ops(vec![
            op(Op::AddSP, -ptrsz), // result slot
            op(Op::Arguments, 0),
            op(Op::Push32, 32),
            op(Op::Alloca, 0),
            // Pointer to the block is on top; store through it.
            op(Op::Push32, 99),
            op(Op::Store32, 0),
            op(Op::Exit, 0),
        ])
        .unwrap();
        assert_eq!(status, 99);
    }

    #[test]
    fn test_ext_slot_traps() {
        let err = run_ops(vec![op(Op::Ext, 0)]).unwrap_err();
        assert!(matches!(err, VmError::InstructionTrap { .. }));
    }

    #[test]
    fn test_panic_opcode() {
        let err = run_ops(vec![op(Op::Panic, 0)]).unwrap_err();
        match err {
            VmError::GuestPanic { trace } => assert!(!trace.frames.is_empty()),
            other => panic!("expected GuestPanic, got {:?}", other),
        }
    }

    #[test]
    fn test_return_without_frame_traps() {
        // Return with no frame reads the zero page and traps instead of
        // corrupting anything.
        let err = run_ops(vec![op(Op::Return, 0)]).unwrap_err();
        assert!(matches!(err, VmError::InstructionTrap { .. }));
    }

    #[test]
    fn test_kill_stops_infinite_loop() {
        let m = machine_for(vec![op(Op::Jmp, 0)], Vec::new());
        let m2 = Arc::clone(&m);
        let handle = std::thread::spawn(move || {
            let mut t = m2.new_thread(1 << 16).unwrap();
            Cpu::new(&m2, &mut t).run()
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        m.kill();
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(VmError::Killed)));
    }

    #[test]
    fn test_kill_before_run_is_immediate() {
        let m = machine_for(vec![op(Op::Jmp, 0)], Vec::new());
        m.kill();
        let mut t = m.new_thread(1 << 16).unwrap();
        let result = Cpu::new(&m, &mut t).run();
        assert!(matches!(result, Err(VmError::Killed)));
    }

    #[test]
    fn test_bitfield_extract() {
        // Field of 4 bits at offset 8 of 0xABCD: (v<<20)>>28 unsigned.
        let status = run_ops(vec![
            op(Op::Push32, 0xABCD),
            op(Op::BitfieldU32, 20 << 8 | 28),
            op(Op::Exit, 0),
        ])
        .unwrap();
        assert_eq!(status, 0xB);
    }

    #[test]
    fn test_store_bits() {
        // Merge the low nibble into a byte in the data segment.
        let status = run_ops_data(
            vec![
                op(Op::DS, 0),
                op(Op::Push32, 0x5A),
                op(Op::StoreBits8, 0x0F),
                op(Op::AddSP, 8),
                op(Op::DSI8, 0),
                op(Op::Exit, 0),
            ],
            vec![0xF0, 0, 0, 0],
        )
        .unwrap();
        assert_eq!(status, 0xF0u8 as i8 as i32 | 0x0A);
    }

    #[test]
    fn test_sp_stays_aligned() {
        let m = machine_for(
            vec![op(Op::Push32, 1), op(Op::Push8, 2), op(Op::Exit, 0)],
            Vec::new(),
        );
        let mut t = m.new_thread(1 << 16).unwrap();
        let sp0 = t.regs.sp;
        Cpu::new(&m, &mut t).run().unwrap();
        // Two pushes of sub-pointer values each consume one full slot.
        assert_eq!(t.regs.sp % 8, 0);
        assert_eq!(sp0 - t.regs.sp, 16);
    }
}
