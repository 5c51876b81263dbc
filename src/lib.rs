//! CVM - C Bytecode Virtual Machine
//!
//! CVM executes programs compiled from a C-like source language into a
//! compact, stack-oriented instruction set. It emulates the core of a
//! POSIX-style process: argv/argc setup, mmap-backed text/data/stack
//! segments, a heap, thread-local errno, and a library of built-ins that
//! satisfy the C runtime the compiled program expects.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          exec / FFI                              │
//! │   argv marshalling · entry frame · exit status · typed calls     │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                             CPU                                  │
//! │   fetch-decode loop · ~250 opcodes · frames · setjmp/longjmp     │
//! │   kill poll every 1024 instructions                              │
//! ├───────────────────────────┬──────────────────────────────────────┤
//! │        Built-ins          │            Machine                   │
//! │  string · math · stdlib   │  text (ro mmap) · data+bss+heap      │
//! │  stdio · POSIX · pthread  │  relocation · kill channel           │
//! │  printf engine · qsort    │  threads (stack mmap + TLS)          │
//! └───────────────────────────┴──────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use cvm::{exec, Binary};
//!
//! let binary: Binary = serde_json::from_slice(&std::fs::read("prog.json")?)?;
//! let status = exec(
//!     binary,
//!     &["prog".to_string()],
//!     Box::new(std::io::stdin()),
//!     Box::new(std::io::stdout()),
//!     Box::new(std::io::stderr()),
//!     cvm::DEFAULT_HEAP_SIZE,
//!     cvm::DEFAULT_STACK_SIZE,
//!     None,
//! )?;
//! ```

pub mod binary;
mod builtins;
pub mod cpu;
pub mod executor;
pub mod ffi;
mod format;
pub mod machine;
pub mod memory;
pub mod opcode;
pub mod thread;
pub mod trace;

pub use binary::{Binary, MemoryModel, PcInfo, ENTRY_SYMBOL};
pub use cpu::{Cpu, FFI_PROLOG, RETURN_SENTINEL};
pub use executor::{exec, exec_on, DEFAULT_HEAP_SIZE, DEFAULT_STACK_SIZE};
pub use ffi::{call, call0, call1, FfiValue};
pub use machine::{Machine, VmError};
pub use opcode::{Opcode, Operation};
pub use thread::Thread;
pub use trace::StackTrace;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
