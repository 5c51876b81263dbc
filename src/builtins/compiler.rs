//! GCC-style compiler intrinsics.
//!
//! The bit-counting family follows the C contract; the "undefined for 0"
//! cases surface as the full word width, which is what the host count
//! instructions produce. The `l` flavours track the memory model's long
//! width. The frame/return-address intrinsics walk the saved-frame chain.

use super::ArgReader;
use crate::cpu::Cpu;
use crate::machine::VmError;
use crate::trace::{self, FrameCursor};

fn long_arg(cpu: &mut Cpu) -> u64 {
    let mut a = ArgReader::new(cpu);
    let v = a.long();
    if cpu.sizes().long == 4 {
        v as u32 as u64
    } else {
        v as u64
    }
}

// int __builtin_clz(unsigned x)
pub(crate) fn clz(cpu: &mut Cpu) -> Result<(), VmError> {
    let x = ArgReader::new(cpu).u32();
    cpu.ret_i32(x.leading_zeros() as i32);
    Ok(())
}

// int __builtin_clzl(unsigned long x)
pub(crate) fn clzl(cpu: &mut Cpu) -> Result<(), VmError> {
    let x = long_arg(cpu);
    let r = if cpu.sizes().long == 4 {
        (x as u32).leading_zeros()
    } else {
        x.leading_zeros()
    };
    cpu.ret_i32(r as i32);
    Ok(())
}

// int __builtin_clzll(unsigned long long x)
pub(crate) fn clzll(cpu: &mut Cpu) -> Result<(), VmError> {
    let x = ArgReader::new(cpu).i64() as u64;
    cpu.ret_i32(x.leading_zeros() as i32);
    Ok(())
}

// int __builtin_ctz(unsigned x)
pub(crate) fn ctz(cpu: &mut Cpu) -> Result<(), VmError> {
    let x = ArgReader::new(cpu).u32();
    cpu.ret_i32(x.trailing_zeros() as i32);
    Ok(())
}

// int __builtin_ctzl(unsigned long x)
pub(crate) fn ctzl(cpu: &mut Cpu) -> Result<(), VmError> {
    let x = long_arg(cpu);
    let r = if cpu.sizes().long == 4 {
        (x as u32).trailing_zeros()
    } else {
        x.trailing_zeros()
    };
    cpu.ret_i32(r as i32);
    Ok(())
}

// int __builtin_ctzll(unsigned long long x)
pub(crate) fn ctzll(cpu: &mut Cpu) -> Result<(), VmError> {
    let x = ArgReader::new(cpu).i64() as u64;
    cpu.ret_i32(x.trailing_zeros() as i32);
    Ok(())
}

// int __builtin_popcount(unsigned x)
pub(crate) fn popcount(cpu: &mut Cpu) -> Result<(), VmError> {
    let x = ArgReader::new(cpu).u32();
    cpu.ret_i32(x.count_ones() as i32);
    Ok(())
}

// int __builtin_popcountl(unsigned long x)
pub(crate) fn popcountl(cpu: &mut Cpu) -> Result<(), VmError> {
    let x = long_arg(cpu);
    cpu.ret_i32(x.count_ones() as i32);
    Ok(())
}

// int __builtin_popcountll(unsigned long long x)
pub(crate) fn popcountll(cpu: &mut Cpu) -> Result<(), VmError> {
    let x = ArgReader::new(cpu).i64() as u64;
    cpu.ret_i32(x.count_ones() as i32);
    Ok(())
}

// int __builtin_parity(unsigned x)
pub(crate) fn parity(cpu: &mut Cpu) -> Result<(), VmError> {
    let x = ArgReader::new(cpu).u32();
    cpu.ret_i32((x.count_ones() & 1) as i32);
    Ok(())
}

// int __builtin_parityl(unsigned long x)
pub(crate) fn parityl(cpu: &mut Cpu) -> Result<(), VmError> {
    let x = long_arg(cpu);
    cpu.ret_i32((x.count_ones() & 1) as i32);
    Ok(())
}

// int __builtin_parityll(unsigned long long x)
pub(crate) fn parityll(cpu: &mut Cpu) -> Result<(), VmError> {
    let x = ArgReader::new(cpu).i64() as u64;
    cpu.ret_i32((x.count_ones() & 1) as i32);
    Ok(())
}

// int __builtin_clrsb(int x)
pub(crate) fn clrsb(cpu: &mut Cpu) -> Result<(), VmError> {
    let x = ArgReader::new(cpu).i32();
    cpu.ret_i32(clrsb32(x));
    Ok(())
}

// int __builtin_clrsbl(long x)
pub(crate) fn clrsbl(cpu: &mut Cpu) -> Result<(), VmError> {
    let (v, long4) = {
        let mut a = ArgReader::new(cpu);
        (a.long(), cpu.sizes().long == 4)
    };
    let r = if long4 {
        clrsb32(v as i32)
    } else {
        clrsb64(v)
    };
    cpu.ret_i32(r);
    Ok(())
}

// int __builtin_clrsbll(long long x)
pub(crate) fn clrsbll(cpu: &mut Cpu) -> Result<(), VmError> {
    let x = ArgReader::new(cpu).i64();
    cpu.ret_i32(clrsb64(x));
    Ok(())
}

fn clrsb32(x: i32) -> i32 {
    ((x ^ x >> 31) as u32).leading_zeros() as i32 - 1
}

fn clrsb64(x: i64) -> i32 {
    ((x ^ x >> 63) as u64).leading_zeros() as i32 - 1
}

// uint64_t __builtin_bswap64(uint64_t x)
pub(crate) fn bswap64(cpu: &mut Cpu) -> Result<(), VmError> {
    let x = ArgReader::new(cpu).i64() as u64;
    cpu.ret_i64(x.swap_bytes() as i64);
    Ok(())
}

// void *__builtin_frame_address(unsigned level)
pub(crate) fn frame_address(cpu: &mut Cpu) -> Result<(), VmError> {
    let level = ArgReader::new(cpu).u32();
    let mut cur = FrameCursor::of(cpu.t);
    for _ in 0..level {
        match trace::unwind_one(cpu.machine(), cpu.t, &cur) {
            Ok(next) => cur = next,
            Err(_) => {
                cpu.ret_ptr(0);
                return Ok(());
            }
        }
    }
    cpu.ret_ptr(cur.bp);
    Ok(())
}

// void *__builtin_return_address(unsigned level)
pub(crate) fn return_address(cpu: &mut Cpu) -> Result<(), VmError> {
    let level = ArgReader::new(cpu).u32();
    let mut cur = FrameCursor::of(cpu.t);
    for _ in 0..=level {
        match trace::unwind_one(cpu.machine(), cpu.t, &cur) {
            Ok(next) => cur = next,
            Err(_) => {
                cpu.ret_ptr(0);
                return Ok(());
            }
        }
    }
    cpu.ret_ptr(cur.ip as u64);
    Ok(())
}

// int ffs(int x) -- POSIX: 1 + index of the lowest set bit, 0 for 0
pub(crate) fn ffs(cpu: &mut Cpu) -> Result<(), VmError> {
    let x = ArgReader::new(cpu).i32();
    cpu.ret_i32(ffs64(x as u32 as u64));
    Ok(())
}

// int ffsl(long x)
pub(crate) fn ffsl(cpu: &mut Cpu) -> Result<(), VmError> {
    let x = long_arg(cpu);
    cpu.ret_i32(ffs64(x));
    Ok(())
}

// int ffsll(long long x)
pub(crate) fn ffsll(cpu: &mut Cpu) -> Result<(), VmError> {
    let x = ArgReader::new(cpu).i64() as u64;
    cpu.ret_i32(ffs64(x));
    Ok(())
}

fn ffs64(x: u64) -> i32 {
    if x == 0 {
        0
    } else {
        1 + x.trailing_zeros() as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ffs_posix_semantics() {
        assert_eq!(ffs64(0), 0);
        assert_eq!(ffs64(1), 1);
        assert_eq!(ffs64(0b1000), 4);
        assert_eq!(ffs64(1 << 63), 64);
    }

    #[test]
    fn test_clrsb() {
        assert_eq!(clrsb32(0), 31);
        assert_eq!(clrsb32(-1), 31);
        assert_eq!(clrsb32(1), 30);
        assert_eq!(clrsb64(-2), 62);
    }
}
