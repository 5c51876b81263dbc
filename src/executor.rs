//! Process Execution
//!
//! `exec` is the top-level entry: build a machine from a binary, marshal
//! argv into the guest heap, stage the entry frame on a fresh thread stack,
//! and run the CPU to completion. The integer returned is the guest's exit
//! status; fatal errors surface as `VmError` and imply status -1.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use crate::binary::Binary;
use crate::cpu::{Cpu, FFI_PROLOG, RETURN_SENTINEL};
use crate::machine::{Machine, VmError};

pub const DEFAULT_HEAP_SIZE: usize = 1 << 20;
pub const DEFAULT_STACK_SIZE: usize = 1 << 20;

/// Run `binary` as a process until it exits, aborts, traps or is killed.
///
/// Guest writes to descriptors 1 and 2 appear on `stdout`/`stderr`;
/// descriptor 0 reads from `stdin`. `trace_path` is the directory used to
/// echo source lines into stack traces.
#[allow(clippy::too_many_arguments)]
pub fn exec(
    binary: Binary,
    args: &[String],
    stdin: Box<dyn Read + Send>,
    stdout: Box<dyn Write + Send>,
    stderr: Box<dyn Write + Send>,
    heap_size: usize,
    stack_size: usize,
    trace_path: Option<PathBuf>,
) -> Result<i32, VmError> {
    let machine = Arc::new(Machine::new(
        binary, heap_size, stdin, stdout, stderr, trace_path,
    )?);
    let result = exec_on(&machine, args, stack_size);
    machine.close();
    result
}

/// Spawn the main thread on an existing machine and run it. Split out so
/// embedders can hold the machine (for `kill`) while the program runs.
pub fn exec_on(machine: &Arc<Machine>, args: &[String], stack_size: usize) -> Result<i32, VmError> {
    let entry = machine.binary().entry().ok_or(VmError::NoEntry)?;

    let mut thread = machine.new_thread(stack_size)?;

    // argv: one guest CString per argument plus a NULL terminator.
    let ptr = machine.sizes().ptr;
    let argv = machine.malloc((args.len() + 1) * ptr);
    if argv == 0 {
        return Err(VmError::Mapping(std::io::Error::new(
            std::io::ErrorKind::OutOfMemory,
            "heap too small for argv",
        )));
    }
    for (i, arg) in args.iter().enumerate() {
        let s = machine.cstring(arg.as_bytes());
        machine.mem.write_ptr(argv + (i * ptr) as u64, s);
    }
    machine
        .mem
        .write_ptr(argv + (args.len() * ptr) as u64, 0);

    let mut cpu = Cpu::new(machine, &mut thread);
    let sp_before = cpu.t.regs.sp;
    cpu.push_i32(args.len() as i32);
    cpu.push_ptr(argv);
    cpu.push_ptr(RETURN_SENTINEL);
    cpu.t.regs.rp = sp_before;
    cpu.t.regs.ip = entry + FFI_PROLOG;

    log::debug!(
        "exec: entry pc {} (+{} prolog), {} args",
        entry,
        FFI_PROLOG,
        args.len()
    );
    cpu.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::MemoryModel;
    use crate::opcode::{Opcode as Op, Operation};
    use parking_lot::Mutex;
    use std::io;

    fn op(opcode: Op, n: i32) -> Operation {
        Operation::new(opcode, n)
    }

    /// Wrap a `_start` body with the FFI adapter every callable carries.
    fn start_binary(body: Vec<Operation>) -> Binary {
        let mut b = Binary::new(MemoryModel::M64);
        b.code = vec![op(Op::Call, 2), op(Op::FfiReturn, 0)];
        b.code.extend(body);
        b.sym.insert("_start".into(), 0);
        b
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn string(&self) -> String {
            String::from_utf8(self.0.lock().clone()).unwrap()
        }
    }

    fn run(binary: Binary, args: &[&str]) -> (Result<i32, VmError>, String) {
        let out = SharedBuf::default();
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let r = exec(
            binary,
            &args,
            Box::new(io::empty()),
            Box::new(out.clone()),
            Box::new(io::sink()),
            DEFAULT_HEAP_SIZE,
            DEFAULT_STACK_SIZE,
            None,
        );
        (r, out.string())
    }

    #[test]
    fn test_exit_code_pass_through() {
        let b = start_binary(vec![op(Op::Push32, 42), op(Op::Exit, 0)]);
        assert_eq!(run(b, &[]).0.unwrap(), 42);
    }

    #[test]
    fn test_abort() {
        let b = start_binary(vec![op(Op::Abort, 0)]);
        assert_eq!(run(b, &[]).0.unwrap(), 1);
    }

    #[test]
    fn test_call_and_return() {
        // main calls a leaf that returns 7; main exits with it.
        let b = start_binary(vec![
            op(Op::AddSP, -8),     // 2
            op(Op::Arguments, 0),  // 3
            op(Op::Call, 7),       // 4
            op(Op::Exit, 0),       // 5
            op(Op::Nop, 0),        // 6
            op(Op::Func, 0),       // 7
            op(Op::AP, 0),
            op(Op::Push32, 7),
            op(Op::Store32, 0),
            op(Op::Return, 0),
        ]);
        assert_eq!(run(b, &[]).0.unwrap(), 7);
    }

    #[test]
    fn test_argc() {
        let b = start_binary(vec![op(Op::Argument32, -8), op(Op::Exit, 0)]);
        assert_eq!(run(b, &["prog", "a", "b"]).0.unwrap(), 3);
    }

    #[test]
    fn test_argv_strings() {
        // exit(argv[0][0]) == 'p'
        let b = start_binary(vec![
            op(Op::Argument64, -16), // argv
            op(Op::Load64, 0),       // argv[0]
            op(Op::Load8, 0),        // argv[0][0]
            op(Op::Exit, 0),
        ]);
        assert_eq!(run(b, &["prog"]).0.unwrap(), 'p' as i32);
    }

    #[test]
    fn test_top_level_return_traps() {
        // A bare return from _start goes through the sentinel and traps.
        let b = start_binary(vec![op(Op::Func, 0), op(Op::Return, 0)]);
        let (r, _) = run(b, &[]);
        assert!(matches!(r, Err(VmError::InstructionTrap { .. })));
    }

    #[test]
    fn test_printf_end_to_end() {
        let mut b = start_binary(vec![
            op(Op::AddSP, -8),    // printf result slot
            op(Op::Arguments, 0),
            op(Op::Text, 0),      // "n=%d, s=%s\n"
            op(Op::Push32, 42),
            op(Op::Text, 12),     // "hi"
            op(Op::Printf, 0),
            op(Op::Push32, 0),
            op(Op::Exit, 0),
        ]);
        b.text = b"n=%d, s=%s\n\0hi\0".to_vec();
        let (r, out) = run(b, &[]);
        assert_eq!(r.unwrap(), 0);
        assert_eq!(out, "n=42, s=hi\n");
    }

    #[test]
    fn test_printf_return_value() {
        let mut b = start_binary(vec![
            op(Op::AddSP, -8),
            op(Op::Arguments, 0),
            op(Op::Text, 0),
            op(Op::Printf, 0),
            op(Op::Exit, 0), // printf returned byte count
        ]);
        b.text = b"abcd\n\0".to_vec();
        let (r, out) = run(b, &[]);
        assert_eq!(r.unwrap(), 5);
        assert_eq!(out, "abcd\n");
    }

    #[test]
    fn test_heap_exhaustion_returns_null() {
        // malloc(1 MiB) with the default heap succeeds; exit(!p) == 0.
        let huge = start_binary(vec![
            op(Op::AddSP, -8),
            op(Op::Arguments, 0),
            op(Op::Push64, 1 << 20),
            op(Op::Ext, 0),
            op(Op::Malloc, 0),
            op(Op::BoolI64, 0),
            op(Op::Exit, 0),
        ]);
        assert_eq!(run(huge, &[]).0.unwrap(), 1);

        // Ask for more than the whole heap: null pointer comes back.
        let too_big = start_binary(vec![
            op(Op::AddSP, -8),
            op(Op::Arguments, 0),
            op(Op::Push64, 1 << 30),
            op(Op::Ext, 0),
            op(Op::Malloc, 0),
            op(Op::BoolI64, 0),
            op(Op::Exit, 0),
        ]);
        assert_eq!(run(too_big, &[]).0.unwrap(), 0);
    }

    #[test]
    fn test_strlen_builtin() {
        let mut b = start_binary(vec![
            op(Op::AddSP, -8),
            op(Op::Arguments, 0),
            op(Op::Text, 0),
            op(Op::Strlen, 0),
            op(Op::ConvI64I32, 0),
            op(Op::Exit, 0),
        ]);
        b.text = b"hello\0".to_vec();
        assert_eq!(run(b, &[]).0.unwrap(), 5);
    }

    #[test]
    fn test_qsort_with_guest_comparator() {
        // Sort 6 ints in the data segment with a guest "ascending" compar,
        // then exit with the first element.
        let mut b = Binary::new(MemoryModel::M64);
        b.code = vec![
            op(Op::Call, 2),      // 0: _start adapter
            op(Op::FfiReturn, 0), // 1
            // _start:
            op(Op::Arguments, 0), // 2 (qsort returns void: no result slot)
            op(Op::DS, 0),        // base
            op(Op::Push64, 6),    // nmemb
            op(Op::Ext, 0),
            op(Op::Push64, 4),    // size
            op(Op::Ext, 0),
            op(Op::FP, 12),       // comparator function pointer (adapter pc)
            op(Op::Qsort, 0),
            op(Op::DSI32, 0),     // 10: first element after the sort
            op(Op::Exit, 0),      // 11
            // int cmp(const void *a, const void *b) { return *a - *b; }
            op(Op::Call, 14),     // 12: comparator adapter
            op(Op::FfiReturn, 0), // 13
            op(Op::Func, 0),      // 14
            op(Op::AP, 0),
            op(Op::Argument64, -8),  // a
            op(Op::Load32, 0),
            op(Op::Argument64, -16), // b
            op(Op::Load32, 0),
            op(Op::SubI32, 0),
            op(Op::Store32, 0),
            op(Op::Return, 0),
        ];
        let mut data = Vec::new();
        for v in [5i32, 3, 9, 1, 7, 2] {
            data.extend_from_slice(&v.to_le_bytes());
        }
        b.data = data;
        b.sym.insert("_start".into(), 0);
        let (r, _) = run(b, &[]);
        assert_eq!(r.unwrap(), 1);
    }

    #[test]
    fn test_kill_from_another_thread() {
        let b = start_binary(vec![op(Op::Jmp, 2)]);
        let machine = Arc::new(
            Machine::new(
                b,
                DEFAULT_HEAP_SIZE,
                Box::new(io::empty()),
                Box::new(io::sink()),
                Box::new(io::sink()),
                None,
            )
            .unwrap(),
        );
        let m2 = Arc::clone(&machine);
        let handle = std::thread::spawn(move || exec_on(&m2, &[], DEFAULT_STACK_SIZE));
        std::thread::sleep(std::time::Duration::from_millis(50));
        machine.kill();
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(VmError::Killed)));
    }

    #[test]
    fn test_missing_entry() {
        let b = Binary::new(MemoryModel::M64);
        let (r, _) = run(b, &[]);
        assert!(matches!(r, Err(VmError::NoEntry)));
    }

    #[test]
    fn test_memcpy_then_strcmp() {
        // memcpy "abc" into the data segment, then strcmp against the text
        // copy; equal strings exit 0.
        let mut b = start_binary(vec![
            op(Op::AddSP, -8), // memcpy result (void*)
            op(Op::Arguments, 0),
            op(Op::DS, 0),
            op(Op::Text, 0),
            op(Op::Push64, 4),
            op(Op::Ext, 0),
            op(Op::Memcpy, 0),
            op(Op::AddSP, 8),
            op(Op::AddSP, -8), // strcmp result (int)
            op(Op::Arguments, 0),
            op(Op::DS, 0),
            op(Op::Text, 0),
            op(Op::Strcmp, 0),
            op(Op::Exit, 0),
        ]);
        b.text = b"abc\0".to_vec();
        b.data = vec![0xFF; 8];
        assert_eq!(run(b, &[]).0.unwrap(), 0);
    }

    #[test]
    fn test_sprintf_into_guest_memory() {
        // sprintf(ds, "v=%d", 9); exit(ds[2]) == '9'
        let mut b = start_binary(vec![
            op(Op::AddSP, -8),
            op(Op::Arguments, 0),
            op(Op::DS, 0),
            op(Op::Text, 0),
            op(Op::Push32, 9),
            op(Op::Sprintf, 0),
            op(Op::AddSP, 8),
            op(Op::DSI8, 2),
            op(Op::Exit, 0),
        ]);
        b.text = b"v=%d\0".to_vec();
        b.data = vec![0; 16];
        assert_eq!(run(b, &[]).0.unwrap(), '9' as i32);
    }

    #[test]
    fn test_recursive_mutex_lifecycle() {
        // attr at ds+0, mutex object at ds+8. A RECURSIVE mutex survives a
        // re-entrant lock; the final trylock on the released mutex returns 0.
        let recursive = libc::PTHREAD_MUTEX_RECURSIVE;
        let call1 = |builtin: Op, arg: i32| {
            vec![
                op(Op::AddSP, -8),
                op(Op::Arguments, 0),
                op(Op::DS, arg),
                op(builtin, 0),
                op(Op::AddSP, 8),
            ]
        };
        let mut body = Vec::new();
        body.extend(call1(Op::PthreadMutexattrInit, 0));
        body.extend(vec![
            op(Op::AddSP, -8),
            op(Op::Arguments, 0),
            op(Op::DS, 0),
            op(Op::Push32, recursive),
            op(Op::PthreadMutexattrSettype, 0),
            op(Op::AddSP, 8),
        ]);
        body.extend(vec![
            op(Op::AddSP, -8),
            op(Op::Arguments, 0),
            op(Op::DS, 8), // mutex
            op(Op::DS, 0), // attr
            op(Op::PthreadMutexInit, 0),
            op(Op::AddSP, 8),
        ]);
        body.extend(call1(Op::PthreadMutexLock, 8));
        body.extend(call1(Op::PthreadMutexLock, 8)); // re-entrant
        body.extend(call1(Op::PthreadMutexUnlock, 8));
        body.extend(call1(Op::PthreadMutexUnlock, 8));
        // Released now; trylock must succeed.
        body.extend(vec![
            op(Op::AddSP, -8),
            op(Op::Arguments, 0),
            op(Op::DS, 8),
            op(Op::PthreadMutexTrylock, 0),
            op(Op::Exit, 0),
        ]);
        let mut b = start_binary(body);
        b.data = vec![0; 16];
        assert_eq!(run(b, &[]).0.unwrap(), 0);
    }

    #[test]
    fn test_interlocked_compare_exchange() {
        // *ds == 0, so the CAS stores 5 and witnesses 0; exit with *ds.
        let mut b = start_binary(vec![
            op(Op::AddSP, -8),
            op(Op::Arguments, 0),
            op(Op::DS, 0),     // dest
            op(Op::Push32, 5), // exchange
            op(Op::Push32, 0), // comparand
            op(Op::InterlockedCompareExchange, 0),
            op(Op::AddSP, 8),
            op(Op::DSI32, 0),
            op(Op::Exit, 0),
        ]);
        b.data = vec![0; 8];
        assert_eq!(run(b, &[]).0.unwrap(), 5);
    }

    #[test]
    fn test_file_write_then_read_back() {
        // fopen(path, "w") + fwrite + fclose, reopen with "r", fgetc.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let path_bytes = path.to_str().unwrap().as_bytes();

        let mut text = Vec::new();
        let p_off = 0i32;
        text.extend_from_slice(path_bytes);
        text.push(0);
        let mw_off = text.len() as i32;
        text.extend_from_slice(b"w\0");
        let mr_off = text.len() as i32;
        text.extend_from_slice(b"r\0");
        let c_off = text.len() as i32;
        text.extend_from_slice(b"hi\0");

        let mut b = start_binary(vec![
            op(Op::Func, -16), // locals: f at bp-8, g at bp-16
            // f = fopen(path, "w")
            op(Op::BP, -8),
            op(Op::AddSP, -8),
            op(Op::Arguments, 0),
            op(Op::Text, p_off),
            op(Op::Text, mw_off),
            op(Op::Fopen, 0),
            op(Op::Store, 0),
            op(Op::AddSP, 8),
            // fwrite("hi", 1, 2, f)
            op(Op::AddSP, -8),
            op(Op::Arguments, 0),
            op(Op::Text, c_off),
            op(Op::Push64, 1),
            op(Op::Ext, 0),
            op(Op::Push64, 2),
            op(Op::Ext, 0),
            op(Op::Variable64, -8),
            op(Op::Fwrite, 0),
            op(Op::AddSP, 8),
            // fclose(f)
            op(Op::AddSP, -8),
            op(Op::Arguments, 0),
            op(Op::Variable64, -8),
            op(Op::Fclose, 0),
            op(Op::AddSP, 8),
            // g = fopen(path, "r")
            op(Op::BP, -16),
            op(Op::AddSP, -8),
            op(Op::Arguments, 0),
            op(Op::Text, p_off),
            op(Op::Text, mr_off),
            op(Op::Fopen, 0),
            op(Op::Store, 0),
            op(Op::AddSP, 8),
            // exit(fgetc(g))
            op(Op::AddSP, -8),
            op(Op::Arguments, 0),
            op(Op::Variable64, -16),
            op(Op::Fgetc, 0),
            op(Op::Exit, 0),
        ]);
        b.text = text;
        assert_eq!(run(b, &[]).0.unwrap(), 'h' as i32);
        assert_eq!(std::fs::read(&path).unwrap(), b"hi");
    }
}
