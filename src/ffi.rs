//! Host-to-Guest Calls
//!
//! Typed helpers for embedders that want to call exported guest functions
//! directly: arguments and results are described as `FfiValue`s, marshalled
//! through the guest calling convention, and the call enters the function's
//! FFI adapter so the interpreter returns to the host at its `FfiReturn`.

use crate::cpu::Cpu;
use crate::machine::VmError;
use crate::memory::StackSizes;
use crate::thread::Thread;

/// One typed argument or result slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FfiValue {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Ptr(u64),
}

impl FfiValue {
    fn slot(&self, sz: StackSizes) -> usize {
        match self {
            FfiValue::I8(_) | FfiValue::U8(_) => sz.i8,
            FfiValue::I16(_) | FfiValue::U16(_) => sz.i16,
            FfiValue::I32(_) | FfiValue::U32(_) => sz.i32,
            FfiValue::I64(_) | FfiValue::U64(_) => sz.i64,
            FfiValue::F32(_) => sz.f32,
            FfiValue::F64(_) => sz.f64,
            FfiValue::Ptr(_) => sz.ptr,
        }
    }

    fn push(&self, cpu: &mut Cpu) {
        match *self {
            FfiValue::I8(v) => cpu.push_i32(v as i32),
            FfiValue::I16(v) => cpu.push_i32(v as i32),
            FfiValue::I32(v) => cpu.push_i32(v),
            FfiValue::U8(v) => cpu.push_i32(v as i32),
            FfiValue::U16(v) => cpu.push_i32(v as i32),
            FfiValue::U32(v) => cpu.push_i32(v as i32),
            FfiValue::I64(v) => cpu.push_i64(v),
            FfiValue::U64(v) => cpu.push_u64(v),
            FfiValue::F32(v) => cpu.push_f32(v),
            FfiValue::F64(v) => cpu.push_f64(v),
            FfiValue::Ptr(v) => cpu.push_ptr(v),
        }
    }

    fn read(&mut self, cpu: &Cpu, addr: u64) {
        let mem = &cpu.machine().mem;
        match self {
            FfiValue::I8(v) => *v = mem.read_i8(addr),
            FfiValue::I16(v) => *v = mem.read_i16(addr),
            FfiValue::I32(v) => *v = mem.read_i32(addr),
            FfiValue::I64(v) => *v = mem.read_i64(addr),
            FfiValue::U8(v) => *v = mem.read_u8(addr),
            FfiValue::U16(v) => *v = mem.read_u16(addr),
            FfiValue::U32(v) => *v = mem.read_u32(addr),
            FfiValue::U64(v) => *v = mem.read_u64(addr),
            FfiValue::F32(v) => *v = mem.read_f32(addr),
            FfiValue::F64(v) => *v = mem.read_f64(addr),
            FfiValue::Ptr(v) => *v = mem.read_ptr(addr),
        }
    }
}

/// Call the guest function whose FFI adapter starts at `pc`. `results` is a
/// prototype slice; each element is overwritten with the value the guest
/// left in the corresponding result slot.
pub fn call(
    t: &mut Thread,
    pc: usize,
    results: &mut [FfiValue],
    args: &[FfiValue],
) -> Result<(), VmError> {
    let m = t.machine().clone();
    let sz = m.sizes();
    let mut cpu = Cpu::new(&m, t);

    let result_bytes: usize = results.iter().map(|r| r.slot(sz)).sum();
    let base = cpu.guest_call(pc, result_bytes, |c| {
        for a in args {
            a.push(c);
        }
    })?;

    // result[0] sits at the top of the result area (highest address).
    let mut offset = result_bytes;
    for r in results.iter_mut() {
        offset -= r.slot(sz);
        r.read(&cpu, base + offset as u64);
    }
    Ok(())
}

/// Call a guest function that returns nothing.
pub fn call0(t: &mut Thread, pc: usize, args: &[FfiValue]) -> Result<(), VmError> {
    call(t, pc, &mut [], args)
}

/// Call a guest function with a single result; `proto` picks its type.
pub fn call1(t: &mut Thread, pc: usize, proto: FfiValue, args: &[FfiValue]) -> Result<FfiValue, VmError> {
    let mut results = [proto];
    call(t, pc, &mut results, args)?;
    Ok(results[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::{Binary, MemoryModel};
    use crate::machine::Machine;
    use crate::opcode::{Opcode as Op, Operation};
    use std::io;
    use std::sync::Arc;

    fn op(opcode: Op, n: i32) -> Operation {
        Operation::new(opcode, n)
    }

    /// int add(int a, int b) { return a + b; }, with its FFI adapter.
    fn add_binary() -> Binary {
        let mut b = Binary::new(MemoryModel::M64);
        b.code = vec![
            op(Op::Call, 2),     // 0: adapter
            op(Op::FfiReturn, 0), // 1
            op(Op::Func, 0),     // 2
            op(Op::AP, 0),
            op(Op::Argument32, -8),
            op(Op::Argument32, -16),
            op(Op::AddI32, 0),
            op(Op::Store32, 0),
            op(Op::Return, 0),
        ];
        b.sym.insert("add".into(), 0);
        b
    }

    fn machine(b: Binary) -> Arc<Machine> {
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

    #[test]
    fn test_call1_int_result() {
        let m = machine(add_binary());
        let pc = m.symbol("add").unwrap();
        let mut t = m.new_thread(1 << 16).unwrap();

        let r = call1(
            &mut t,
            pc,
            FfiValue::I32(0),
            &[FfiValue::I32(30), FfiValue::I32(12)],
        )
        .unwrap();
        assert_eq!(r, FfiValue::I32(42));
    }

    #[test]
    fn test_call_restores_thread_state() {
        let m = machine(add_binary());
        let pc = m.symbol("add").unwrap();
        let mut t = m.new_thread(1 << 16).unwrap();
        let sp0 = t.regs.sp;
        let rp0 = t.regs.rp;

        call1(&mut t, pc, FfiValue::I32(0), &[FfiValue::I32(1), FfiValue::I32(2)]).unwrap();

        assert_eq!(t.regs.sp, sp0);
        assert_eq!(t.regs.rp, rp0);
        assert!(t.rp_stack.is_empty());
        assert!(t.fp_stack.is_empty());
    }

    #[test]
    fn test_call0_no_results() {
        // void nop(void) {}
        let mut b = Binary::new(MemoryModel::M64);
        b.code = vec![
            op(Op::Call, 2),
            op(Op::FfiReturn, 0),
            op(Op::Func, 0),
            op(Op::Return, 0),
        ];
        b.sym.insert("do_nothing".into(), 0);
        let m = machine(b);
        let pc = m.symbol("do_nothing").unwrap();
        let mut t = m.new_thread(1 << 16).unwrap();
        call0(&mut t, pc, &[]).unwrap();
    }
}
