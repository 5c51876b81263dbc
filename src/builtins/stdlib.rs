//! libc stdlib built-ins: allocation, conversions, qsort.
//!
//! qsort is the one built-in that re-enters the interpreter: the comparator
//! is guest code, so `less` builds a call frame and runs the comparator on
//! the same CPU, while `swap` moves element bytes with the sized guest
//! accessors. The sort itself is an index sort over `less`/`swap`, in place.

use super::ArgReader;
use crate::cpu::Cpu;
use crate::machine::VmError;

// int abs(int j)
pub(crate) fn abs(cpu: &mut Cpu) -> Result<(), VmError> {
    let j = ArgReader::new(cpu).i32();
    cpu.ret_i32(j.wrapping_abs());
    Ok(())
}

// int atoi(const char *nptr)
pub(crate) fn atoi(cpu: &mut Cpu) -> Result<(), VmError> {
    let nptr = ArgReader::new(cpu).ptr();
    let s = cpu.machine().mem.c_string(nptr);
    cpu.ret_i32(parse_int(&s));
    Ok(())
}

fn parse_int(s: &[u8]) -> i32 {
    let mut i = 0;
    while i < s.len() && (s[i] == b' ' || s[i] == b'\t' || s[i] == b'\n') {
        i += 1;
    }
    let mut neg = false;
    if i < s.len() && (s[i] == b'-' || s[i] == b'+') {
        neg = s[i] == b'-';
        i += 1;
    }
    let mut v: i64 = 0;
    while i < s.len() && s[i].is_ascii_digit() {
        v = v * 10 + (s[i] - b'0') as i64;
        if v > i64::from(u32::MAX) {
            break;
        }
        i += 1;
    }
    if neg {
        -v as i32
    } else {
        v as i32
    }
}

// void *malloc(size_t size)
pub(crate) fn malloc(cpu: &mut Cpu) -> Result<(), VmError> {
    let size = ArgReader::new(cpu).size();
    let p = cpu.machine().malloc(size);
    if p == 0 {
        cpu.t.set_errno(libc::ENOMEM);
    }
    cpu.ret_ptr(p);
    Ok(())
}

// void *calloc(size_t nmemb, size_t size)
pub(crate) fn calloc(cpu: &mut Cpu) -> Result<(), VmError> {
    let (nmemb, size) = {
        let mut a = ArgReader::new(cpu);
        (a.size(), a.size())
    };
    let p = match nmemb.checked_mul(size) {
        Some(total) => cpu.machine().calloc(total),
        None => 0,
    };
    if p == 0 {
        cpu.t.set_errno(libc::ENOMEM);
    }
    cpu.ret_ptr(p);
    Ok(())
}

// void *realloc(void *ptr, size_t size)
pub(crate) fn realloc(cpu: &mut Cpu) -> Result<(), VmError> {
    let (ptr, size) = {
        let mut a = ArgReader::new(cpu);
        (a.ptr(), a.size())
    };
    let p = cpu.machine().realloc(ptr, size);
    if p == 0 {
        cpu.t.set_errno(libc::ENOMEM);
    }
    cpu.ret_ptr(p);
    Ok(())
}

// void free(void *ptr) -- the heap is bump-only, free releases nothing
pub(crate) fn free(_cpu: &mut Cpu) -> Result<(), VmError> {
    Ok(())
}

// char *getenv(const char *name)
pub(crate) fn getenv(cpu: &mut Cpu) -> Result<(), VmError> {
    let name = ArgReader::new(cpu).ptr();
    let name = cpu.machine().mem.c_string(name);
    let p = match std::str::from_utf8(&name) {
        Ok(name) => cpu.machine().getenv(name),
        Err(_) => 0,
    };
    cpu.ret_ptr(p);
    Ok(())
}

// void qsort(void *base, size_t nmemb, size_t size,
//            int (*compar)(const void *, const void *))
pub(crate) fn qsort(cpu: &mut Cpu) -> Result<(), VmError> {
    let (base, nmemb, size, compar) = {
        let mut a = ArgReader::new(cpu);
        (a.ptr(), a.size(), a.size(), a.ptr())
    };
    if nmemb > 1 && size > 0 {
        let mut sorter = GuestSort { cpu, base, size, compar: compar as usize };
        sorter.quicksort(0, nmemb - 1)?;
    }
    Ok(())
}

struct GuestSort<'c, 'a> {
    cpu: &'c mut Cpu<'a>,
    base: u64,
    size: usize,
    compar: usize,
}

impl GuestSort<'_, '_> {
    fn elem(&self, i: usize) -> u64 {
        self.base + (i * self.size) as u64
    }

    /// Run the guest comparator over elements i and j.
    fn less(&mut self, i: usize, j: usize) -> Result<bool, VmError> {
        let (p, q) = (self.elem(i), self.elem(j));
        let result_bytes = self.cpu.sizes().i32;
        let result = self.cpu.guest_call(self.compar, result_bytes, |c| {
            c.push_ptr(p);
            c.push_ptr(q);
        })?;
        Ok(self.cpu.machine().mem.read_i32(result) < 0)
    }

    fn swap(&mut self, i: usize, j: usize) {
        if i == j {
            return;
        }
        let mem = &self.cpu.machine().mem;
        let (p, q) = (self.elem(i), self.elem(j));
        match self.size {
            1 => {
                let a = mem.read_u8(p);
                mem.write_u8(p, mem.read_u8(q));
                mem.write_u8(q, a);
            }
            2 => {
                let a = mem.read_u16(p);
                mem.write_u16(p, mem.read_u16(q));
                mem.write_u16(q, a);
            }
            4 => {
                let a = mem.read_u32(p);
                mem.write_u32(p, mem.read_u32(q));
                mem.write_u32(q, a);
            }
            8 => {
                let a = mem.read_u64(p);
                mem.write_u64(p, mem.read_u64(q));
                mem.write_u64(q, a);
            }
            n => {
                let mut a = vec![0u8; n];
                let mut b = vec![0u8; n];
                mem.read_bytes(p, &mut a);
                mem.read_bytes(q, &mut b);
                mem.write_bytes(p, &b);
                mem.write_bytes(q, &a);
            }
        }
    }

    /// Iterative quicksort, Lomuto partition with the pivot parked at `hi`
    /// so its index is stable across swaps; insertion sort below 8 elements.
    fn quicksort(&mut self, lo0: usize, hi0: usize) -> Result<(), VmError> {
        let mut ranges = vec![(lo0, hi0)];
        while let Some((lo, hi)) = ranges.pop() {
            if hi - lo < 8 {
                self.insertion(lo, hi)?;
                continue;
            }

            // Median of three into the pivot slot.
            let mid = lo + (hi - lo) / 2;
            if self.less(mid, lo)? {
                self.swap(mid, lo);
            }
            if self.less(hi, mid)? {
                self.swap(hi, mid);
            }
            if self.less(mid, lo)? {
                self.swap(mid, lo);
            }
            self.swap(mid, hi);

            let mut store = lo;
            for k in lo..hi {
                if self.less(k, hi)? {
                    self.swap(k, store);
                    store += 1;
                }
            }
            self.swap(store, hi);

            if store > lo + 1 {
                ranges.push((lo, store - 1));
            }
            if store + 1 < hi {
                ranges.push((store + 1, hi));
            }
        }
        Ok(())
    }

    fn insertion(&mut self, lo: usize, hi: usize) -> Result<(), VmError> {
        for i in lo + 1..=hi {
            let mut j = i;
            while j > lo && self.less(j, j - 1)? {
                self.swap(j, j - 1);
                j -= 1;
            }
        }
        Ok(())
    }
}
