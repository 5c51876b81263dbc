//! POSIX I/O built-ins.
//!
//! Thin delegation to the host OS: every host failure becomes guest `errno`
//! plus the POSIX sentinel return, never an interpreter fault. Descriptors 0,
//! 1 and 2 route through the sinks the embedder supplied; everything else is
//! a real host fd the guest owns.

use std::ffi::CString;
use std::io::{Read, Write};

use bitflags::bitflags;

use super::{errno_from_host, ArgReader};
use crate::cpu::Cpu;
use crate::machine::VmError;

bitflags! {
    /// Guest open(2) flag word; same bit layout as the host ABI.
    #[derive(Clone, Copy)]
    struct OpenFlags: i32 {
        const RDONLY = libc::O_RDONLY;
        const WRONLY = libc::O_WRONLY;
        const RDWR = libc::O_RDWR;
        const CREAT = libc::O_CREAT;
        const EXCL = libc::O_EXCL;
        const TRUNC = libc::O_TRUNC;
        const APPEND = libc::O_APPEND;
        const NONBLOCK = libc::O_NONBLOCK;
        const CLOEXEC = libc::O_CLOEXEC;
    }
}

fn guest_cstring(cpu: &Cpu, addr: u64) -> Option<CString> {
    CString::new(cpu.machine().mem.c_string(addr)).ok()
}

/// Map a host return value: negative means errno + sentinel -1.
fn ret_host_i32(cpu: &Cpu, r: i64) {
    if r < 0 {
        errno_from_host(cpu);
        cpu.ret_i32(-1);
    } else {
        cpu.ret_i32(r as i32);
    }
}

fn ret_host_long(cpu: &Cpu, r: i64) {
    if r < 0 {
        errno_from_host(cpu);
        cpu.ret_long(-1);
    } else {
        cpu.ret_long(r);
    }
}

// int open(const char *pathname, int flags, mode_t mode)
pub(crate) fn open(cpu: &mut Cpu) -> Result<(), VmError> {
    let (path, flags, mode) = {
        let mut a = ArgReader::new(cpu);
        (a.ptr(), a.i32(), a.i32())
    };
    let path = match guest_cstring(cpu, path) {
        Some(p) => p,
        None => {
            cpu.t.set_errno(libc::EINVAL);
            cpu.ret_i32(-1);
            return Ok(());
        }
    };
    let flags = OpenFlags::from_bits_truncate(flags).bits();
    // SAFETY: path is NUL terminated host memory.
    let fd = unsafe { libc::open(path.as_ptr(), flags, mode as libc::c_uint) };
    ret_host_i32(cpu, fd as i64);
    Ok(())
}

// int close(int fd)
pub(crate) fn close(cpu: &mut Cpu) -> Result<(), VmError> {
    let fd = ArgReader::new(cpu).i32();
    if fd <= 2 {
        cpu.ret_i32(0);
        return Ok(());
    }
    cpu.machine().files.remove_fd(fd);
    // SAFETY: plain close of a guest-owned fd.
    let r = unsafe { libc::close(fd) };
    ret_host_i32(cpu, r as i64);
    Ok(())
}

// ssize_t read(int fd, void *buf, size_t count)
pub(crate) fn read(cpu: &mut Cpu) -> Result<(), VmError> {
    let (fd, buf, count) = {
        let mut a = ArgReader::new(cpu);
        (a.i32(), a.ptr(), a.size())
    };
    let m = cpu.machine();
    match fd {
        0 => {
            let mut host = vec![0u8; count];
            match m.stdin.lock().read(&mut host) {
                Ok(n) => {
                    m.mem.write_bytes(buf, &host[..n]);
                    cpu.ret_ptr(n as u64);
                }
                Err(_) => {
                    errno_from_host(cpu);
                    cpu.ret_ptr(-1i64 as u64);
                }
            }
        }
        // Reading the output descriptors yields EOF.
        1 | 2 => cpu.ret_ptr(0),
        _ => {
            let mut host = vec![0u8; count];
            // SAFETY: host buffer is live for the call.
            let r = unsafe { libc::read(fd, host.as_mut_ptr() as *mut libc::c_void, count) };
            if r < 0 {
                errno_from_host(cpu);
                cpu.ret_ptr(-1i64 as u64);
            } else {
                m.mem.write_bytes(buf, &host[..r as usize]);
                cpu.ret_ptr(r as u64);
            }
        }
    }
    Ok(())
}

// ssize_t write(int fd, const void *buf, size_t count)
pub(crate) fn write(cpu: &mut Cpu) -> Result<(), VmError> {
    let (fd, buf, count) = {
        let mut a = ArgReader::new(cpu);
        (a.i32(), a.ptr(), a.size())
    };
    let m = cpu.machine();
    let mut host = vec![0u8; count];
    m.mem.read_bytes(buf, &mut host);
    match fd {
        // Writes to stdin are discarded but "succeed".
        0 => cpu.ret_ptr(count as u64),
        1 => match m.stdout.lock().write_all(&host) {
            Ok(()) => cpu.ret_ptr(count as u64),
            Err(_) => {
                errno_from_host(cpu);
                cpu.ret_ptr(-1i64 as u64);
            }
        },
        2 => match m.stderr.lock().write_all(&host) {
            Ok(()) => cpu.ret_ptr(count as u64),
            Err(_) => {
                errno_from_host(cpu);
                cpu.ret_ptr(-1i64 as u64);
            }
        },
        _ => {
            // SAFETY: host buffer is live for the call.
            let r = unsafe { libc::write(fd, host.as_ptr() as *const libc::c_void, count) };
            if r < 0 {
                errno_from_host(cpu);
                cpu.ret_ptr(-1i64 as u64);
            } else {
                cpu.ret_ptr(r as u64);
            }
        }
    }
    Ok(())
}

// off_t lseek(int fd, off_t offset, int whence)
pub(crate) fn lseek(cpu: &mut Cpu) -> Result<(), VmError> {
    let (fd, offset, whence) = {
        let mut a = ArgReader::new(cpu);
        (a.i32(), a.long(), a.i32())
    };
    // SAFETY: plain syscall.
    let r = unsafe { libc::lseek(fd, offset as libc::off_t, whence) };
    ret_host_long(cpu, r as i64);
    Ok(())
}

// int ftruncate(int fd, off_t length)
pub(crate) fn ftruncate(cpu: &mut Cpu) -> Result<(), VmError> {
    let (fd, length) = {
        let mut a = ArgReader::new(cpu);
        (a.i32(), a.long())
    };
    // SAFETY: plain syscall.
    let r = unsafe { libc::ftruncate(fd, length as libc::off_t) };
    ret_host_i32(cpu, r as i64);
    Ok(())
}

// int fsync(int fd)
pub(crate) fn fsync(cpu: &mut Cpu) -> Result<(), VmError> {
    let fd = ArgReader::new(cpu).i32();
    // SAFETY: plain syscall.
    let r = unsafe { libc::fsync(fd) };
    ret_host_i32(cpu, r as i64);
    Ok(())
}

/// Copy a host struct into guest memory byte for byte; the guest was
/// compiled against the host ABI.
fn write_struct<T>(cpu: &Cpu, addr: u64, value: &T) {
    let bytes = unsafe {
        // SAFETY: plain-old-data host struct viewed as bytes.
        std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>())
    };
    cpu.machine().mem.write_bytes(addr, bytes);
}

// int fstat(int fd, struct stat *statbuf)
pub(crate) fn fstat(cpu: &mut Cpu) -> Result<(), VmError> {
    let (fd, statbuf) = {
        let mut a = ArgReader::new(cpu);
        (a.i32(), a.ptr())
    };
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: st is a live out-param.
    let r = unsafe { libc::fstat(fd, &mut st) };
    if r == 0 {
        write_struct(cpu, statbuf, &st);
    }
    ret_host_i32(cpu, r as i64);
    Ok(())
}

// int stat(const char *pathname, struct stat *statbuf)
pub(crate) fn stat(cpu: &mut Cpu) -> Result<(), VmError> {
    stat_common(cpu, false)
}

// int lstat(const char *pathname, struct stat *statbuf)
pub(crate) fn lstat(cpu: &mut Cpu) -> Result<(), VmError> {
    stat_common(cpu, true)
}

fn stat_common(cpu: &mut Cpu, no_follow: bool) -> Result<(), VmError> {
    let (path, statbuf) = {
        let mut a = ArgReader::new(cpu);
        (a.ptr(), a.ptr())
    };
    let path = match guest_cstring(cpu, path) {
        Some(p) => p,
        None => {
            cpu.t.set_errno(libc::EINVAL);
            cpu.ret_i32(-1);
            return Ok(());
        }
    };
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: path and st are live host memory.
    let r = unsafe {
        if no_follow {
            libc::lstat(path.as_ptr(), &mut st)
        } else {
            libc::stat(path.as_ptr(), &mut st)
        }
    };
    if r == 0 {
        write_struct(cpu, statbuf, &st);
    }
    ret_host_i32(cpu, r as i64);
    Ok(())
}

// int access(const char *pathname, int mode)
pub(crate) fn access(cpu: &mut Cpu) -> Result<(), VmError> {
    let (path, mode) = {
        let mut a = ArgReader::new(cpu);
        (a.ptr(), a.i32())
    };
    let path = match guest_cstring(cpu, path) {
        Some(p) => p,
        None => {
            cpu.t.set_errno(libc::EINVAL);
            cpu.ret_i32(-1);
            return Ok(());
        }
    };
    // SAFETY: path is NUL terminated host memory.
    let r = unsafe { libc::access(path.as_ptr(), mode) };
    ret_host_i32(cpu, r as i64);
    Ok(())
}

// int unlink(const char *pathname)
pub(crate) fn unlink(cpu: &mut Cpu) -> Result<(), VmError> {
    let path = ArgReader::new(cpu).ptr();
    let path = match guest_cstring(cpu, path) {
        Some(p) => p,
        None => {
            cpu.t.set_errno(libc::EINVAL);
            cpu.ret_i32(-1);
            return Ok(());
        }
    };
    // SAFETY: path is NUL terminated host memory.
    let r = unsafe { libc::unlink(path.as_ptr()) };
    ret_host_i32(cpu, r as i64);
    Ok(())
}

// char *getcwd(char *buf, size_t size)
pub(crate) fn getcwd(cpu: &mut Cpu) -> Result<(), VmError> {
    let (buf, size) = {
        let mut a = ArgReader::new(cpu);
        (a.ptr(), a.size())
    };
    let mut host = vec![0u8; size.max(1)];
    // SAFETY: host buffer is live for the call.
    let r = unsafe { libc::getcwd(host.as_mut_ptr() as *mut libc::c_char, size) };
    if r.is_null() {
        errno_from_host(cpu);
        cpu.ret_ptr(0);
    } else {
        let len = host.iter().position(|&b| b == 0).unwrap_or(0);
        cpu.machine().mem.write_bytes(buf, &host[..=len]);
        cpu.ret_ptr(buf);
    }
    Ok(())
}

// pid_t getpid(void)
pub(crate) fn getpid(cpu: &mut Cpu) -> Result<(), VmError> {
    // SAFETY: always succeeds.
    cpu.ret_i32(unsafe { libc::getpid() });
    Ok(())
}

// uid_t geteuid(void)
pub(crate) fn geteuid(cpu: &mut Cpu) -> Result<(), VmError> {
    // SAFETY: always succeeds.
    cpu.ret_i32(unsafe { libc::geteuid() } as i32);
    Ok(())
}

// int gettimeofday(struct timeval *tv, struct timezone *tz)
pub(crate) fn gettimeofday(cpu: &mut Cpu) -> Result<(), VmError> {
    let (tv, _tz) = {
        let mut a = ArgReader::new(cpu);
        (a.ptr(), a.ptr())
    };
    let mut host: libc::timeval = unsafe { std::mem::zeroed() };
    // SAFETY: host is a live out-param.
    let r = unsafe { libc::gettimeofday(&mut host, std::ptr::null_mut()) };
    if r == 0 && tv != 0 {
        write_struct(cpu, tv, &host);
    }
    ret_host_i32(cpu, r as i64);
    Ok(())
}

// int usleep(useconds_t usec)
pub(crate) fn usleep(cpu: &mut Cpu) -> Result<(), VmError> {
    let usec = ArgReader::new(cpu).u32();
    std::thread::sleep(std::time::Duration::from_micros(usec as u64));
    cpu.ret_i32(0);
    Ok(())
}

// int select(int nfds, fd_set *readfds, fd_set *writefds,
//            fd_set *exceptfds, struct timeval *timeout)
pub(crate) fn select(cpu: &mut Cpu) -> Result<(), VmError> {
    let (nfds, readfds, writefds, exceptfds, timeout) = {
        let mut a = ArgReader::new(cpu);
        (a.i32(), a.ptr(), a.ptr(), a.ptr(), a.ptr())
    };
    let m = cpu.machine();

    let mut sets: [libc::fd_set; 3] = unsafe { std::mem::zeroed() };
    let addrs = [readfds, writefds, exceptfds];
    let set_len = std::mem::size_of::<libc::fd_set>();
    for (set, &addr) in sets.iter_mut().zip(addrs.iter()) {
        if addr != 0 {
            let bytes = unsafe {
                // SAFETY: plain-old-data host struct viewed as bytes.
                std::slice::from_raw_parts_mut(set as *mut libc::fd_set as *mut u8, set_len)
            };
            m.mem.read_bytes(addr, bytes);
        }
    }
    let mut tv: libc::timeval = unsafe { std::mem::zeroed() };
    if timeout != 0 {
        let bytes = unsafe {
            // SAFETY: plain-old-data host struct viewed as bytes.
            std::slice::from_raw_parts_mut(
                &mut tv as *mut libc::timeval as *mut u8,
                std::mem::size_of::<libc::timeval>(),
            )
        };
        m.mem.read_bytes(timeout, bytes);
    }

    // SAFETY: the sets and tv are live host memory.
    let r = unsafe {
        libc::select(
            nfds,
            if readfds != 0 { &mut sets[0] } else { std::ptr::null_mut() },
            if writefds != 0 { &mut sets[1] } else { std::ptr::null_mut() },
            if exceptfds != 0 { &mut sets[2] } else { std::ptr::null_mut() },
            if timeout != 0 { &mut tv } else { std::ptr::null_mut() },
        )
    };
    if r >= 0 {
        for (set, &addr) in sets.iter().zip(addrs.iter()) {
            if addr != 0 {
                write_struct(cpu, addr, set);
            }
        }
        if timeout != 0 {
            write_struct(cpu, timeout, &tv);
        }
    }
    ret_host_i32(cpu, r as i64);
    Ok(())
}

// int socket(int domain, int type, int protocol)
pub(crate) fn socket(cpu: &mut Cpu) -> Result<(), VmError> {
    let (domain, ty, protocol) = {
        let mut a = ArgReader::new(cpu);
        (a.i32(), a.i32(), a.i32())
    };
    // SAFETY: plain syscall.
    let r = unsafe { libc::socket(domain, ty, protocol) };
    ret_host_i32(cpu, r as i64);
    Ok(())
}

// int connect(int sockfd, const struct sockaddr *addr, socklen_t addrlen)
pub(crate) fn connect(cpu: &mut Cpu) -> Result<(), VmError> {
    let (fd, addr, len) = {
        let mut a = ArgReader::new(cpu);
        (a.i32(), a.ptr(), a.u32())
    };
    let mut host = vec![0u8; len as usize];
    cpu.machine().mem.read_bytes(addr, &mut host);
    // SAFETY: host holds a copied sockaddr of the stated length.
    let r = unsafe { libc::connect(fd, host.as_ptr() as *const libc::sockaddr, len) };
    ret_host_i32(cpu, r as i64);
    Ok(())
}

// ssize_t recv(int sockfd, void *buf, size_t len, int flags)
pub(crate) fn recv(cpu: &mut Cpu) -> Result<(), VmError> {
    let (fd, buf, len, flags) = {
        let mut a = ArgReader::new(cpu);
        (a.i32(), a.ptr(), a.size(), a.i32())
    };
    let mut host = vec![0u8; len];
    // SAFETY: host buffer is live for the call.
    let r = unsafe { libc::recv(fd, host.as_mut_ptr() as *mut libc::c_void, len, flags) };
    if r < 0 {
        errno_from_host(cpu);
        cpu.ret_ptr(-1i64 as u64);
    } else {
        cpu.machine().mem.write_bytes(buf, &host[..r as usize]);
        cpu.ret_ptr(r as u64);
    }
    Ok(())
}

// ssize_t send(int sockfd, const void *buf, size_t len, int flags)
pub(crate) fn send(cpu: &mut Cpu) -> Result<(), VmError> {
    let (fd, buf, len, flags) = {
        let mut a = ArgReader::new(cpu);
        (a.i32(), a.ptr(), a.size(), a.i32())
    };
    let mut host = vec![0u8; len];
    cpu.machine().mem.read_bytes(buf, &mut host);
    // SAFETY: host buffer is live for the call.
    let r = unsafe { libc::send(fd, host.as_ptr() as *const libc::c_void, len, flags) };
    if r < 0 {
        errno_from_host(cpu);
        cpu.ret_ptr(-1i64 as u64);
    } else {
        cpu.ret_ptr(r as u64);
    }
    Ok(())
}

// ssize_t writev(int fd, const struct iovec *iov, int iovcnt)
pub(crate) fn writev(cpu: &mut Cpu) -> Result<(), VmError> {
    let (fd, iov, iovcnt) = {
        let mut a = ArgReader::new(cpu);
        (a.i32(), a.ptr(), a.i32())
    };
    let m = cpu.machine();
    let ptr = m.sizes().ptr as u64;

    // Gather the guest iovecs into one host buffer.
    let mut gathered = Vec::new();
    for i in 0..iovcnt.max(0) as u64 {
        let base = m.mem.read_ptr(iov + i * 2 * ptr);
        let len = m.mem.read_ptr(iov + i * 2 * ptr + ptr) as usize;
        let start = gathered.len();
        gathered.resize(start + len, 0);
        m.mem.read_bytes(base, &mut gathered[start..]);
    }

    match fd {
        0 => cpu.ret_ptr(gathered.len() as u64),
        1 => match m.stdout.lock().write_all(&gathered) {
            Ok(()) => cpu.ret_ptr(gathered.len() as u64),
            Err(_) => {
                errno_from_host(cpu);
                cpu.ret_ptr(-1i64 as u64);
            }
        },
        2 => match m.stderr.lock().write_all(&gathered) {
            Ok(()) => cpu.ret_ptr(gathered.len() as u64),
            Err(_) => {
                errno_from_host(cpu);
                cpu.ret_ptr(-1i64 as u64);
            }
        },
        _ => {
            // SAFETY: gathered is live for the call.
            let r = unsafe {
                libc::write(fd, gathered.as_ptr() as *const libc::c_void, gathered.len())
            };
            if r < 0 {
                errno_from_host(cpu);
                cpu.ret_ptr(-1i64 as u64);
            } else {
                cpu.ret_ptr(r as u64);
            }
        }
    }
    Ok(())
}

// int getsockname(int sockfd, struct sockaddr *addr, socklen_t *addrlen)
pub(crate) fn getsockname(cpu: &mut Cpu) -> Result<(), VmError> {
    sockname_common(cpu, false)
}

// int getpeername(int sockfd, struct sockaddr *addr, socklen_t *addrlen)
pub(crate) fn getpeername(cpu: &mut Cpu) -> Result<(), VmError> {
    sockname_common(cpu, true)
}

fn sockname_common(cpu: &mut Cpu, peer: bool) -> Result<(), VmError> {
    let (fd, addr, addrlen) = {
        let mut a = ArgReader::new(cpu);
        (a.i32(), a.ptr(), a.ptr())
    };
    let m = cpu.machine();
    let mut len = m.mem.read_u32(addrlen) as libc::socklen_t;
    let mut host = vec![0u8; len.max(16) as usize];
    // SAFETY: host and len are live out-params.
    let r = unsafe {
        if peer {
            libc::getpeername(fd, host.as_mut_ptr() as *mut libc::sockaddr, &mut len)
        } else {
            libc::getsockname(fd, host.as_mut_ptr() as *mut libc::sockaddr, &mut len)
        }
    };
    if r == 0 {
        let n = (len as usize).min(host.len());
        m.mem.write_bytes(addr, &host[..n]);
        m.mem.write_u32(addrlen, len as u32);
    }
    ret_host_i32(cpu, r as i64);
    Ok(())
}

// int getsockopt(int sockfd, int level, int optname, void *optval, socklen_t *optlen)
pub(crate) fn getsockopt(cpu: &mut Cpu) -> Result<(), VmError> {
    let (fd, level, optname, optval, optlen) = {
        let mut a = ArgReader::new(cpu);
        (a.i32(), a.i32(), a.i32(), a.ptr(), a.ptr())
    };
    let m = cpu.machine();
    let mut len = m.mem.read_u32(optlen) as libc::socklen_t;
    let mut host = vec![0u8; len as usize];
    // SAFETY: host and len are live out-params.
    let r = unsafe {
        libc::getsockopt(
            fd,
            level,
            optname,
            host.as_mut_ptr() as *mut libc::c_void,
            &mut len,
        )
    };
    if r == 0 {
        let n = (len as usize).min(host.len());
        m.mem.write_bytes(optval, &host[..n]);
        m.mem.write_u32(optlen, len as u32);
    }
    ret_host_i32(cpu, r as i64);
    Ok(())
}

// int setsockopt(int sockfd, int level, int optname, const void *optval, socklen_t optlen)
pub(crate) fn setsockopt(cpu: &mut Cpu) -> Result<(), VmError> {
    let (fd, level, optname, optval, optlen) = {
        let mut a = ArgReader::new(cpu);
        (a.i32(), a.i32(), a.i32(), a.ptr(), a.u32())
    };
    let mut host = vec![0u8; optlen as usize];
    cpu.machine().mem.read_bytes(optval, &mut host);
    // SAFETY: host is a copied option buffer of the stated length.
    let r = unsafe {
        libc::setsockopt(
            fd,
            level,
            optname,
            host.as_ptr() as *const libc::c_void,
            optlen,
        )
    };
    ret_host_i32(cpu, r as i64);
    Ok(())
}

// int shutdown(int sockfd, int how)
pub(crate) fn shutdown(cpu: &mut Cpu) -> Result<(), VmError> {
    let (fd, how) = {
        let mut a = ArgReader::new(cpu);
        (a.i32(), a.i32())
    };
    // SAFETY: plain syscall.
    let r = unsafe { libc::shutdown(fd, how) };
    ret_host_i32(cpu, r as i64);
    Ok(())
}

// void *mmap(void *addr, size_t length, int prot, int flags, int fd, off_t offset)
pub(crate) fn mmap(cpu: &mut Cpu) -> Result<(), VmError> {
    let (_addr, length, _prot, _flags, fd, _offset) = {
        let mut a = ArgReader::new(cpu);
        (a.ptr(), a.size(), a.i32(), a.i32(), a.i32(), a.long())
    };
    // Only anonymous mappings are supported; file mappings would leak host
    // state into the guest address space.
    if fd != -1 {
        cpu.t.set_errno(libc::ENODEV);
        cpu.ret_ptr(0);
        return Ok(());
    }
    let p = cpu.machine().guest_mmap(length);
    if p == 0 {
        cpu.t.set_errno(libc::ENOMEM);
    }
    cpu.ret_ptr(p);
    Ok(())
}

// int munmap(void *addr, size_t length)
pub(crate) fn munmap(cpu: &mut Cpu) -> Result<(), VmError> {
    let (addr, _length) = {
        let mut a = ArgReader::new(cpu);
        (a.ptr(), a.size())
    };
    if cpu.machine().guest_munmap(addr) {
        cpu.ret_i32(0);
    } else {
        cpu.t.set_errno(libc::EINVAL);
        cpu.ret_i32(-1);
    }
    Ok(())
}

// long sysconf(int name)
pub(crate) fn sysconf(cpu: &mut Cpu) -> Result<(), VmError> {
    let name = ArgReader::new(cpu).i32();
    // SAFETY: plain syscall.
    let r = unsafe { libc::sysconf(name) };
    ret_host_long(cpu, r as i64);
    Ok(())
}
