//! Instruction Set
//!
//! One `Operation` is an opcode plus a 32-bit payload `n`. Some opcodes span
//! two consecutive code slots; the second slot is always `Ext` and carries an
//! auxiliary payload (block sizes, 64-bit immediate halves, bitfield
//! descriptors). `Ext` is never a valid instruction on its own.
//!
//! Built-in functions of the emulated C runtime are opcodes too: the compiler
//! front end emits them directly at call sites, and the dispatcher routes them
//! to host implementations that share the guest calling convention.

use serde::{Deserialize, Serialize};

/// A single code slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub opcode: Opcode,
    pub n: i32,
}

impl Operation {
    pub fn new(opcode: Opcode, n: i32) -> Self {
        Self { opcode, n }
    }
}

impl From<Opcode> for Operation {
    fn from(opcode: Opcode) -> Self {
        Self { opcode, n: 0 }
    }
}

/// Every opcode the dispatcher understands.
///
/// Names encode operand width and signedness where it matters: `DivU32` is an
/// unsigned 32-bit divide, `RshI64` an arithmetic shift right. The width in
/// the name also fixes the stack delta of the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    // ------------------------------------------------------------------
    // Addressing and immediates
    // ------------------------------------------------------------------
    /// Push `ap + n` (argument/result base relative address).
    AP,
    /// Push `bp + n` (frame local address).
    BP,
    /// Push `dataBase + n`.
    DS,
    /// Push `textBase + n`.
    Text,
    /// Push the function pointer value for code index `n`.
    FP,
    Push8,
    Push16,
    Push32,
    /// 64-bit immediate; low half in `n`, high half in the `Ext` slot.
    Push64,
    Zero8,
    Zero16,
    Zero32,
    Zero64,
    Dup8,
    Dup32,
    Dup64,
    /// `sp += n` (n may be negative to reserve space).
    AddSP,
    Nop,

    // ------------------------------------------------------------------
    // Loads
    // ------------------------------------------------------------------
    Argument8,
    Argument16,
    Argument32,
    Argument64,
    /// Block argument: `n` is the offset, `Ext` carries the byte size.
    Argument,
    Variable8,
    Variable16,
    Variable32,
    Variable64,
    /// Block local: `n` is the offset, `Ext` carries the byte size.
    Variable,
    DSI8,
    DSI16,
    DSI32,
    DSI64,
    DSC128,
    /// Block from the data segment: `n` offset, `Ext` size.
    DSN,
    Load8,
    Load16,
    Load32,
    Load64,
    /// Block indirect load: pop pointer, copy `Ext` bytes from `ptr + n`.
    Load,

    // ------------------------------------------------------------------
    // Stores (value stays on the stack: assignment yields a value)
    // ------------------------------------------------------------------
    Store8,
    Store16,
    Store32,
    Store64,
    /// Pointer-sized store.
    Store,
    StoreC128,
    StoreBits8,
    StoreBits16,
    StoreBits32,
    StoreBits64,

    // ------------------------------------------------------------------
    // Arithmetic
    // ------------------------------------------------------------------
    AddI32,
    AddI64,
    AddF32,
    AddF64,
    AddC64,
    AddC128,
    SubI32,
    SubI64,
    SubF32,
    SubF64,
    SubC64,
    SubC128,
    MulI32,
    MulI64,
    MulF32,
    MulF64,
    MulC64,
    MulC128,
    DivI32,
    DivU32,
    DivI64,
    DivU64,
    DivF32,
    DivF64,
    DivC64,
    DivC128,
    RemI32,
    RemU32,
    RemI64,
    RemU64,
    NegI8,
    NegI16,
    NegI32,
    NegI64,
    NegF32,
    NegF64,
    Cpl8,
    Cpl16,
    Cpl32,
    Cpl64,

    // ------------------------------------------------------------------
    // Logic and shifts
    // ------------------------------------------------------------------
    And8,
    And16,
    And32,
    And64,
    Or8,
    Or16,
    Or32,
    Or64,
    Xor8,
    Xor16,
    Xor32,
    Xor64,
    Lsh8,
    Lsh16,
    Lsh32,
    Lsh64,
    RshI8,
    RshU8,
    RshI16,
    RshU16,
    RshI32,
    RshU32,
    RshI64,
    RshU64,

    // ------------------------------------------------------------------
    // Comparisons (push 0/1 as int32; NaN compares false)
    // ------------------------------------------------------------------
    EqI32,
    EqI64,
    EqF32,
    EqF64,
    EqC64,
    EqC128,
    NeqI32,
    NeqI64,
    NeqF32,
    NeqF64,
    NeqC64,
    NeqC128,
    LtI32,
    LtU32,
    LtI64,
    LtU64,
    LtF32,
    LtF64,
    LeqI32,
    LeqU32,
    LeqI64,
    LeqU64,
    LeqF32,
    LeqF64,
    GtI32,
    GtU32,
    GtI64,
    GtU64,
    GtF32,
    GtF64,
    GeqI32,
    GeqU32,
    GeqI64,
    GeqU64,
    GeqF32,
    GeqF64,

    // ------------------------------------------------------------------
    // Conversions. Widening sign/zero extends, narrowing truncates,
    // float->int truncates toward zero and saturates on overflow.
    // ------------------------------------------------------------------
    ConvI8I16,
    ConvI8I32,
    ConvI8I64,
    ConvI16I32,
    ConvI16I64,
    ConvI32I64,
    ConvU8U16,
    ConvU8U32,
    ConvU8U64,
    ConvU16U32,
    ConvU16U64,
    ConvU32U64,
    ConvU8I16,
    ConvU8I32,
    ConvU8I64,
    ConvU16I32,
    ConvU16I64,
    ConvU32I64,
    ConvI8U8,
    ConvU8I8,
    ConvI16U16,
    ConvU16I16,
    ConvI32U32,
    ConvU32I32,
    ConvI64U64,
    ConvU64I64,
    ConvI16I8,
    ConvI32I8,
    ConvI32I16,
    ConvI64I8,
    ConvI64I16,
    ConvI64I32,
    ConvU16U8,
    ConvU32U8,
    ConvU32U16,
    ConvU64U8,
    ConvU64U16,
    ConvU64U32,
    ConvI32U8,
    ConvI32U16,
    ConvI64U32,
    ConvU32I8,
    ConvU32I16,
    ConvU64I32,
    ConvI32F32,
    ConvI32F64,
    ConvI64F32,
    ConvI64F64,
    ConvU32F32,
    ConvU32F64,
    ConvU64F32,
    ConvU64F64,
    ConvF32I32,
    ConvF32I64,
    ConvF32U32,
    ConvF32U64,
    ConvF64I8,
    ConvF64I16,
    ConvF64I32,
    ConvF64I64,
    ConvF64U16,
    ConvF64U32,
    ConvF64U64,
    ConvF32F64,
    ConvF64F32,
    ConvF32C64,
    ConvF64C128,
    ConvC64C128,
    ConvC128C64,
    ConvI32C64,
    ConvI32C128,

    // ------------------------------------------------------------------
    // Booleanization: push (value != 0) as int32
    // ------------------------------------------------------------------
    BoolI8,
    BoolI16,
    BoolI32,
    BoolI64,
    BoolF32,
    BoolF64,
    BoolC64,
    BoolC128,

    // ------------------------------------------------------------------
    // Bitfields: n = lshift<<8 | rshift over the stored width
    // ------------------------------------------------------------------
    BitfieldI8,
    BitfieldU8,
    BitfieldI16,
    BitfieldU16,
    BitfieldI32,
    BitfieldU32,
    BitfieldI64,
    BitfieldU64,

    // ------------------------------------------------------------------
    // Increment/decrement through a popped address; n is the delta
    // (stride for the Ptr variants). Pre pushes the new value, Post the
    // old one. The Bits variants describe the field in the Ext slot as
    // bits<<16 | bitoffset<<8 | storageWidth.
    // ------------------------------------------------------------------
    PreIncI8,
    PreIncI16,
    PreIncI32,
    PreIncI64,
    PreIncPtr,
    PreDecI8,
    PreDecI16,
    PreDecI32,
    PreDecI64,
    PreDecPtr,
    PostIncI8,
    PostIncI16,
    PostIncI32,
    PostIncI64,
    PostIncPtr,
    PostDecI8,
    PostDecI16,
    PostDecI32,
    PostDecI64,
    PostDecPtr,
    PreIncBits,
    PostIncBits,

    // ------------------------------------------------------------------
    // Pointer arithmetic: pop index, scale by n, adjust the pointer below
    // ------------------------------------------------------------------
    IndexI16,
    IndexU16,
    IndexI32,
    IndexU32,
    IndexI64,
    IndexU64,
    NegIndexI32,
    NegIndexU32,
    NegIndexI64,
    NegIndexU64,
    /// Pop q, pop p, push `(p - q) / n`.
    PtrDiff,

    // ------------------------------------------------------------------
    // Control transfer
    // ------------------------------------------------------------------
    Jmp,
    Jz,
    Jnz,
    JmpP,
    Call,
    CallFP,
    /// Function prologue; n is the negated byte size of locals.
    Func,
    Return,
    Arguments,
    ArgumentsFP,
    /// Terminates the innermost interpreter loop; the tail of every FFI
    /// adapter, never reached by plain guest control flow.
    FfiReturn,
    SwitchI32,
    SwitchI64,
    /// Front-end inserted trap for unreachable code; yields a stack trace.
    Panic,
    /// Parameter slot of a multi-slot opcode; executing it is a trap.
    Ext,
    Exit,
    Abort,

    // ------------------------------------------------------------------
    // Control constructs with host support
    // ------------------------------------------------------------------
    Setjmp,
    Longjmp,
    Alloca,

    // ------------------------------------------------------------------
    // Built-ins: libc string/memory
    // ------------------------------------------------------------------
    Memcpy,
    Memset,
    Memcmp,
    Strcpy,
    Strncpy,
    Strcat,
    Strcmp,
    Strncmp,
    Strlen,
    Strchr,
    Strrchr,

    // ------------------------------------------------------------------
    // Built-ins: libc math
    // ------------------------------------------------------------------
    Sin,
    Cos,
    Tan,
    Sinh,
    Cosh,
    Tanh,
    Asin,
    Acos,
    Atan,
    Exp,
    Log,
    Log10,
    Pow,
    Sqrt,
    Floor,
    Ceil,
    Fabs,
    Copysign,
    Round,
    Isinf,
    Isinff,
    Signbit,
    Signbitf,

    // ------------------------------------------------------------------
    // Built-ins: libc stdlib
    // ------------------------------------------------------------------
    Abs,
    Atoi,
    Malloc,
    Calloc,
    Realloc,
    Free,
    Getenv,
    Qsort,

    // ------------------------------------------------------------------
    // Built-ins: libc stdio
    // ------------------------------------------------------------------
    Fopen,
    Fclose,
    Fread,
    Fwrite,
    Fgetc,
    Fgets,
    Fprintf,
    Printf,
    Sprintf,
    Vfprintf,
    Vprintf,
    Ferror,
    Rewind,
    Fseek,
    Ftell,
    RegisterStdfiles,

    // ------------------------------------------------------------------
    // Built-ins: compiler intrinsics
    // ------------------------------------------------------------------
    BuiltinClz,
    BuiltinClzl,
    BuiltinClzll,
    BuiltinCtz,
    BuiltinCtzl,
    BuiltinCtzll,
    BuiltinPopcount,
    BuiltinPopcountl,
    BuiltinPopcountll,
    BuiltinParity,
    BuiltinParityl,
    BuiltinParityll,
    BuiltinClrsb,
    BuiltinClrsbl,
    BuiltinClrsbll,
    BuiltinBswap64,
    BuiltinFrameAddress,
    BuiltinReturnAddress,
    Ffs,
    Ffsl,
    Ffsll,

    // ------------------------------------------------------------------
    // Built-ins: POSIX I/O
    // ------------------------------------------------------------------
    Open,
    Close,
    Read,
    Write,
    Lseek,
    Ftruncate,
    Fstat,
    Stat,
    Lstat,
    Fsync,
    Access,
    Unlink,
    Getcwd,
    Getpid,
    Geteuid,
    Gettimeofday,
    Usleep,
    Select,
    Socket,
    Connect,
    Recv,
    Send,
    Writev,
    Getsockname,
    Getpeername,
    Getsockopt,
    Setsockopt,
    Shutdown,
    Mmap,
    Munmap,
    Sysconf,

    // ------------------------------------------------------------------
    // Built-ins: pthreads
    // ------------------------------------------------------------------
    PthreadMutexInit,
    PthreadMutexDestroy,
    PthreadMutexLock,
    PthreadMutexUnlock,
    PthreadMutexTrylock,
    PthreadMutexattrInit,
    PthreadMutexattrSettype,
    PthreadMutexattrDestroy,
    PthreadEqual,
    PthreadSelf,
    PthreadCreate,
    PthreadJoin,

    // ------------------------------------------------------------------
    // Built-ins: atomics
    // ------------------------------------------------------------------
    InterlockedCompareExchange,
}

impl Opcode {
    /// True for opcodes whose second code slot is an `Ext` payload.
    pub fn has_ext(self) -> bool {
        matches!(
            self,
            Opcode::Push64
                | Opcode::Argument
                | Opcode::Variable
                | Opcode::DSN
                | Opcode::Load
                | Opcode::PreIncBits
                | Opcode::PostIncBits
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ext_slots() {
        assert!(Opcode::Push64.has_ext());
        assert!(Opcode::Load.has_ext());
        assert!(!Opcode::Load32.has_ext());
        assert!(!Opcode::Ext.has_ext());
    }

    #[test]
    fn test_operation_roundtrip() {
        let op = Operation::new(Opcode::Push32, 42);
        let json = serde_json::to_string(&op).unwrap();
        let back: Operation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, op);
    }
}
