//! libc stdio built-ins and the FILE registry.
//!
//! A guest `FILE*` is a heap handle mapped to a host stream here; the guest
//! never sees host file state. The standard streams are special: they route
//! to the sinks handed to `exec`, reads from stdout/stderr hit EOF, writes to
//! stdin are discarded.

use std::collections::HashMap;
use std::ffi::CString;
use std::io::{self, Read, Write};

use parking_lot::Mutex;

use super::{ArgReader, errno_from_host};
use crate::cpu::Cpu;
use crate::format::{self, FormatTarget, MemoryTarget, VarArgs};
use crate::machine::{Machine, VmError};

/// What a guest FILE* stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
    Host(i32),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct FileEntry {
    pub kind: StreamKind,
    pub error: bool,
}

/// Guest FILE* -> host stream table, with reverse lookup by host fd.
pub(crate) struct FileRegistry {
    entries: Mutex<HashMap<u64, FileEntry>>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    pub fn insert(&self, handle: u64, kind: StreamKind) {
        self.entries.lock().insert(handle, FileEntry { kind, error: false });
    }

    pub fn get(&self, handle: u64) -> Option<FileEntry> {
        self.entries.lock().get(&handle).copied()
    }

    pub fn remove(&self, handle: u64) -> Option<FileEntry> {
        self.entries.lock().remove(&handle)
    }

    pub fn set_error(&self, handle: u64) {
        if let Some(e) = self.entries.lock().get_mut(&handle) {
            e.error = true;
        }
    }

    pub fn clear_error(&self, handle: u64) {
        if let Some(e) = self.entries.lock().get_mut(&handle) {
            e.error = false;
        }
    }

    /// Drop any FILE entries backed by a host fd that was closed directly.
    pub fn remove_fd(&self, fd: i32) {
        self.entries
            .lock()
            .retain(|_, e| e.kind != StreamKind::Host(fd));
    }
}

// ------------------------------------------------------------------
// Host I/O plumbing
// ------------------------------------------------------------------

fn host_read(fd: i32, buf: &mut [u8]) -> isize {
    // SAFETY: buf is a live host slice.
    unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) as isize }
}

fn host_write(fd: i32, buf: &[u8]) -> isize {
    // SAFETY: buf is a live host slice.
    unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) as isize }
}

/// Read up to `buf.len()` bytes from a guest-visible stream.
pub(crate) fn stream_read(m: &Machine, kind: StreamKind, buf: &mut [u8]) -> io::Result<usize> {
    match kind {
        StreamKind::Stdin => m.stdin.lock().read(buf),
        // Reading the output streams yields EOF.
        StreamKind::Stdout | StreamKind::Stderr => Ok(0),
        StreamKind::Host(fd) => {
            let n = host_read(fd, buf);
            if n < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(n as usize)
            }
        }
    }
}

/// Write a whole buffer to a guest-visible stream.
pub(crate) fn stream_write(m: &Machine, kind: StreamKind, buf: &[u8]) -> io::Result<()> {
    match kind {
        // Writes to stdin are discarded.
        StreamKind::Stdin => Ok(()),
        StreamKind::Stdout => m.stdout.lock().write_all(buf),
        StreamKind::Stderr => m.stderr.lock().write_all(buf),
        StreamKind::Host(fd) => {
            let mut rest = buf;
            while !rest.is_empty() {
                let n = host_write(fd, rest);
                if n <= 0 {
                    return Err(io::Error::last_os_error());
                }
                rest = &rest[n as usize..];
            }
            Ok(())
        }
    }
}

/// Format target over a guest stream.
struct StreamTarget<'a> {
    m: &'a Machine,
    kind: StreamKind,
}

impl FormatTarget for StreamTarget<'_> {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        stream_write(self.m, self.kind, buf)
    }
}

// ------------------------------------------------------------------
// Built-ins
// ------------------------------------------------------------------

// void __register_stdfiles(void *stdin, void *stdout, void *stderr)
pub(crate) fn register_stdfiles(cpu: &mut Cpu) -> Result<(), VmError> {
    let (fin, fout, ferr) = {
        let mut a = ArgReader::new(cpu);
        (a.ptr(), a.ptr(), a.ptr())
    };
    let files = &cpu.machine().files;
    files.insert(fin, StreamKind::Stdin);
    files.insert(fout, StreamKind::Stdout);
    files.insert(ferr, StreamKind::Stderr);
    Ok(())
}

// FILE *fopen(const char *path, const char *mode)
pub(crate) fn fopen(cpu: &mut Cpu) -> Result<(), VmError> {
    let (path, mode) = {
        let mut a = ArgReader::new(cpu);
        (a.ptr(), a.ptr())
    };
    let m = cpu.machine();
    let path = m.mem.c_string(path);
    let mode = m.mem.c_string(mode);

    let flags = match open_flags_for_mode(&mode) {
        Some(f) => f,
        None => {
            cpu.t.set_errno(libc::EINVAL);
            cpu.ret_ptr(0);
            return Ok(());
        }
    };
    let cpath = match CString::new(path) {
        Ok(p) => p,
        Err(_) => {
            cpu.t.set_errno(libc::EINVAL);
            cpu.ret_ptr(0);
            return Ok(());
        }
    };

    // SAFETY: cpath is NUL terminated host memory.
    let fd = unsafe { libc::open(cpath.as_ptr(), flags, 0o666 as libc::c_uint) };
    if fd < 0 {
        errno_from_host(cpu);
        cpu.ret_ptr(0);
        return Ok(());
    }

    let handle = m.malloc(m.sizes().ptr);
    if handle == 0 {
        // SAFETY: fd was just opened by us.
        unsafe { libc::close(fd) };
        cpu.t.set_errno(libc::ENOMEM);
        cpu.ret_ptr(0);
        return Ok(());
    }
    m.mem.write_i32(handle, fd);
    m.files.insert(handle, StreamKind::Host(fd));
    cpu.ret_ptr(handle);
    Ok(())
}

fn open_flags_for_mode(mode: &[u8]) -> Option<i32> {
    let update = mode.contains(&b'+');
    match mode.first()? {
        b'r' if update => Some(libc::O_RDWR),
        b'r' => Some(libc::O_RDONLY),
        b'w' if update => Some(libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC),
        b'w' => Some(libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC),
        b'a' if update => Some(libc::O_RDWR | libc::O_CREAT | libc::O_APPEND),
        b'a' => Some(libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND),
        _ => None,
    }
}

// int fclose(FILE *stream)
pub(crate) fn fclose(cpu: &mut Cpu) -> Result<(), VmError> {
    let handle = ArgReader::new(cpu).ptr();
    match cpu.machine().files.remove(handle) {
        Some(FileEntry { kind: StreamKind::Host(fd), .. }) => {
            // SAFETY: fd came from our own fopen.
            let r = unsafe { libc::close(fd) };
            if r < 0 {
                errno_from_host(cpu);
                cpu.ret_i32(-1);
                return Ok(());
            }
            cpu.ret_i32(0);
        }
        Some(_) => cpu.ret_i32(0),
        None => {
            cpu.t.set_errno(libc::EBADF);
            cpu.ret_i32(-1);
        }
    }
    Ok(())
}

// size_t fread(void *ptr, size_t size, size_t nmemb, FILE *stream)
pub(crate) fn fread(cpu: &mut Cpu) -> Result<(), VmError> {
    let (ptr, size, nmemb, handle) = {
        let mut a = ArgReader::new(cpu);
        (a.ptr(), a.size(), a.size(), a.ptr())
    };
    let m = cpu.machine();
    let entry = match m.files.get(handle) {
        Some(e) => e,
        None => {
            cpu.t.set_errno(libc::EBADF);
            cpu.ret_ptr(0);
            return Ok(());
        }
    };

    let total = size.saturating_mul(nmemb);
    let mut buf = vec![0u8; total];
    let mut got = 0usize;
    while got < total {
        match stream_read(m, entry.kind, &mut buf[got..]) {
            Ok(0) => break,
            Ok(n) => got += n,
            Err(_) => {
                errno_from_host(cpu);
                m.files.set_error(handle);
                break;
            }
        }
    }
    m.mem.write_bytes(ptr, &buf[..got]);
    cpu.ret_ptr(if size == 0 { 0 } else { (got / size) as u64 });
    Ok(())
}

// size_t fwrite(const void *ptr, size_t size, size_t nmemb, FILE *stream)
pub(crate) fn fwrite(cpu: &mut Cpu) -> Result<(), VmError> {
    let (ptr, size, nmemb, handle) = {
        let mut a = ArgReader::new(cpu);
        (a.ptr(), a.size(), a.size(), a.ptr())
    };
    let m = cpu.machine();
    let entry = match m.files.get(handle) {
        Some(e) => e,
        None => {
            cpu.t.set_errno(libc::EBADF);
            cpu.ret_ptr(0);
            return Ok(());
        }
    };

    let total = size.saturating_mul(nmemb);
    let mut buf = vec![0u8; total];
    m.mem.read_bytes(ptr, &mut buf);
    match stream_write(m, entry.kind, &buf) {
        Ok(()) => cpu.ret_ptr(nmemb as u64),
        Err(_) => {
            errno_from_host(cpu);
            m.files.set_error(handle);
            cpu.ret_ptr(0);
        }
    }
    Ok(())
}

// int fgetc(FILE *stream)
pub(crate) fn fgetc(cpu: &mut Cpu) -> Result<(), VmError> {
    let handle = ArgReader::new(cpu).ptr();
    let m = cpu.machine();
    let entry = match m.files.get(handle) {
        Some(e) => e,
        None => {
            cpu.t.set_errno(libc::EBADF);
            cpu.ret_i32(-1);
            return Ok(());
        }
    };
    let mut b = [0u8; 1];
    match stream_read(m, entry.kind, &mut b) {
        Ok(1) => cpu.ret_i32(b[0] as i32),
        Ok(_) => cpu.ret_i32(-1),
        Err(_) => {
            errno_from_host(cpu);
            m.files.set_error(handle);
            cpu.ret_i32(-1);
        }
    }
    Ok(())
}

// char *fgets(char *s, int n, FILE *stream)
pub(crate) fn fgets(cpu: &mut Cpu) -> Result<(), VmError> {
    let (s, n, handle) = {
        let mut a = ArgReader::new(cpu);
        (a.ptr(), a.i32(), a.ptr())
    };
    let m = cpu.machine();
    let entry = match m.files.get(handle) {
        Some(e) => e,
        None => {
            cpu.t.set_errno(libc::EBADF);
            cpu.ret_ptr(0);
            return Ok(());
        }
    };
    if n <= 0 {
        cpu.ret_ptr(0);
        return Ok(());
    }

    let mut count = 0u64;
    while (count as i64) < n as i64 - 1 {
        let mut b = [0u8; 1];
        match stream_read(m, entry.kind, &mut b) {
            Ok(1) => {
                m.mem.write_u8(s + count, b[0]);
                count += 1;
                if b[0] == b'\n' {
                    break;
                }
            }
            Ok(_) => break,
            Err(_) => {
                errno_from_host(cpu);
                m.files.set_error(handle);
                cpu.ret_ptr(0);
                return Ok(());
            }
        }
    }
    if count == 0 {
        cpu.ret_ptr(0);
    } else {
        m.mem.write_u8(s + count, 0);
        cpu.ret_ptr(s);
    }
    Ok(())
}

// int printf(const char *format, ...)
pub(crate) fn printf(cpu: &mut Cpu) -> Result<(), VmError> {
    let (fmt, anchor) = {
        let mut a = ArgReader::new(cpu);
        let fmt = a.ptr();
        (fmt, a.vararg_anchor())
    };
    let m = cpu.machine();
    let mut args = VarArgs::new(&m.mem, m.sizes(), anchor);
    let mut target = StreamTarget { m, kind: StreamKind::Stdout };
    let n = format::format(&m.mem, fmt, &mut args, &mut target);
    cpu.ret_i32(n);
    Ok(())
}

// int fprintf(FILE *stream, const char *format, ...)
pub(crate) fn fprintf(cpu: &mut Cpu) -> Result<(), VmError> {
    let (handle, fmt, anchor) = {
        let mut a = ArgReader::new(cpu);
        let handle = a.ptr();
        let fmt = a.ptr();
        (handle, fmt, a.vararg_anchor())
    };
    fprintf_common(cpu, handle, fmt, anchor)
}

// int vprintf(const char *format, va_list ap)
pub(crate) fn vprintf(cpu: &mut Cpu) -> Result<(), VmError> {
    let (fmt, ap) = {
        let mut a = ArgReader::new(cpu);
        (a.ptr(), a.ptr())
    };
    let m = cpu.machine();
    let mut args = VarArgs::new(&m.mem, m.sizes(), ap);
    let mut target = StreamTarget { m, kind: StreamKind::Stdout };
    let n = format::format(&m.mem, fmt, &mut args, &mut target);
    cpu.ret_i32(n);
    Ok(())
}

// int vfprintf(FILE *stream, const char *format, va_list ap)
pub(crate) fn vfprintf(cpu: &mut Cpu) -> Result<(), VmError> {
    let (handle, fmt, ap) = {
        let mut a = ArgReader::new(cpu);
        (a.ptr(), a.ptr(), a.ptr())
    };
    fprintf_common(cpu, handle, fmt, ap)
}

fn fprintf_common(cpu: &mut Cpu, handle: u64, fmt: u64, anchor: u64) -> Result<(), VmError> {
    let m = cpu.machine();
    let entry = match m.files.get(handle) {
        Some(e) => e,
        None => {
            cpu.t.set_errno(libc::EBADF);
            cpu.ret_i32(-1);
            return Ok(());
        }
    };
    let mut args = VarArgs::new(&m.mem, m.sizes(), anchor);
    let mut target = StreamTarget { m, kind: entry.kind };
    let n = format::format(&m.mem, fmt, &mut args, &mut target);
    if n < 0 {
        m.files.set_error(handle);
    }
    cpu.ret_i32(n);
    Ok(())
}

// int sprintf(char *str, const char *format, ...)
pub(crate) fn sprintf(cpu: &mut Cpu) -> Result<(), VmError> {
    let (dst, fmt, anchor) = {
        let mut a = ArgReader::new(cpu);
        let dst = a.ptr();
        let fmt = a.ptr();
        (dst, fmt, a.vararg_anchor())
    };
    let m = cpu.machine();
    let mut args = VarArgs::new(&m.mem, m.sizes(), anchor);
    let mut target = MemoryTarget::new(&m.mem, dst);
    let n = format::format(&m.mem, fmt, &mut args, &mut target);
    target.finish();
    cpu.ret_i32(n);
    Ok(())
}

// int ferror(FILE *stream)
pub(crate) fn ferror(cpu: &mut Cpu) -> Result<(), VmError> {
    let handle = ArgReader::new(cpu).ptr();
    let flag = cpu
        .machine()
        .files
        .get(handle)
        .map(|e| e.error)
        .unwrap_or(false);
    cpu.ret_i32(flag as i32);
    Ok(())
}

// void rewind(FILE *stream)
pub(crate) fn rewind(cpu: &mut Cpu) -> Result<(), VmError> {
    let handle = ArgReader::new(cpu).ptr();
    let m = cpu.machine();
    if let Some(FileEntry { kind: StreamKind::Host(fd), .. }) = m.files.get(handle) {
        // SAFETY: fd came from our own fopen.
        unsafe { libc::lseek(fd, 0, libc::SEEK_SET) };
    }
    m.files.clear_error(handle);
    Ok(())
}

// int fseek(FILE *stream, long offset, int whence)
pub(crate) fn fseek(cpu: &mut Cpu) -> Result<(), VmError> {
    let (handle, offset, whence) = {
        let mut a = ArgReader::new(cpu);
        (a.ptr(), a.long(), a.i32())
    };
    match cpu.machine().files.get(handle).map(|e| e.kind) {
        Some(StreamKind::Host(fd)) => {
            // SAFETY: fd came from our own fopen.
            let r = unsafe { libc::lseek(fd, offset as libc::off_t, whence) };
            if r < 0 {
                errno_from_host(cpu);
                cpu.ret_i32(-1);
            } else {
                cpu.ret_i32(0);
            }
        }
        Some(_) => {
            cpu.t.set_errno(libc::ESPIPE);
            cpu.ret_i32(-1);
        }
        None => {
            cpu.t.set_errno(libc::EBADF);
            cpu.ret_i32(-1);
        }
    }
    Ok(())
}

// long ftell(FILE *stream)
pub(crate) fn ftell(cpu: &mut Cpu) -> Result<(), VmError> {
    let handle = ArgReader::new(cpu).ptr();
    match cpu.machine().files.get(handle).map(|e| e.kind) {
        Some(StreamKind::Host(fd)) => {
            // SAFETY: fd came from our own fopen.
            let r = unsafe { libc::lseek(fd, 0, libc::SEEK_CUR) };
            if r < 0 {
                errno_from_host(cpu);
                cpu.ret_long(-1);
            } else {
                cpu.ret_long(r as i64);
            }
        }
        _ => {
            cpu.t.set_errno(libc::ESPIPE);
            cpu.ret_long(-1);
        }
    }
    Ok(())
}
