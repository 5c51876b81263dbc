//! Stack Traces
//!
//! Frame unwinding and symbolication for panics, traps and the
//! `__builtin_frame_address` / `__builtin_return_address` intrinsics.
//!
//! A function prologue saves three pointer-sized slots at `bp`:
//! the caller's `bp`, the caller's `ap`, and the return address. Walking a
//! frame therefore reads `bp + {0, ptr, 2*ptr}` and resumes one call up with
//! `sp = bp + 3*ptr`. The walk stops at a zero saved pointer or as soon as
//! the unwound `sp` leaves the thread's stack segment.

use std::fmt;
use std::fs;
use std::path::Path;

use crate::machine::{Machine, VmError};
use crate::thread::Thread;

/// Upper bound on rendered frames; deeper traces are marked truncated.
const MAX_FRAMES: usize = 64;

/// One resolved frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub pc: usize,
    pub function: Option<String>,
    pub file: Option<String>,
    pub line: u32,
    pub column: u32,
    /// Source text of the line, when the trace path makes it readable.
    pub source: Option<String>,
}

/// A rendered guest stack, attached to fatal errors.
#[derive(Debug, Clone, Default)]
pub struct StackTrace {
    pub frames: Vec<Frame>,
    pub truncated: bool,
}

impl fmt::Display for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, frame) in self.frames.iter().enumerate() {
            let name = frame.function.as_deref().unwrap_or("?");
            write!(f, "#{} {} (pc {})", i, name, frame.pc)?;
            if let Some(file) = &frame.file {
                write!(f, " at {}:{}:{}", file, frame.line, frame.column)?;
            }
            writeln!(f)?;
            if let Some(src) = &frame.source {
                writeln!(f, "\t{}", src.trim_end())?;
            }
        }
        if self.truncated {
            writeln!(f, "... trace truncated")?;
        }
        Ok(())
    }
}

/// The register subset the walker advances frame by frame.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameCursor {
    pub ip: usize,
    pub sp: u64,
    pub bp: u64,
    pub ap: u64,
}

impl FrameCursor {
    pub fn of(t: &Thread) -> Self {
        Self {
            ip: t.regs.ip,
            sp: t.regs.sp,
            bp: t.regs.bp,
            ap: t.regs.ap,
        }
    }
}

/// Restore the caller's cursor from the three slots saved at `bp`.
pub(crate) fn unwind_one(m: &Machine, t: &Thread, cur: &FrameCursor) -> Result<FrameCursor, VmError> {
    let ptr = m.sizes().ptr as u64;
    if cur.bp == 0 {
        return Err(VmError::BadFrame("zero frame pointer".into()));
    }
    if !t.on_stack(cur.bp) || !m.memory().is_mapped(cur.bp, 3 * ptr as usize) {
        return Err(VmError::BadFrame(format!(
            "frame pointer {:#x} outside the thread stack",
            cur.bp
        )));
    }
    let saved_bp = m.memory().read_ptr(cur.bp);
    let saved_ap = m.memory().read_ptr(cur.bp + ptr);
    let ret = m.memory().read_ptr(cur.bp + 2 * ptr);
    Ok(FrameCursor {
        ip: ret as usize,
        sp: cur.bp + 3 * ptr,
        bp: saved_bp,
        ap: saved_ap,
    })
}

/// Resolve `pc` against the function and line tables.
fn resolve(m: &Machine, pc: usize) -> Frame {
    let func = m.function_at(pc);
    let line = m.line_at(pc);
    let file = m.name_at(line.name);
    let source = match (&m.trace_path, &file) {
        (Some(root), Some(file)) if line.line > 0 => source_line(root, file, line.line),
        _ => None,
    };
    Frame {
        pc,
        function: m.name_at(func.name),
        file,
        line: line.line,
        column: line.column,
        source,
    }
}

fn source_line(root: &Path, file: &str, line: u32) -> Option<String> {
    let path = if Path::new(file).is_absolute() {
        file.into()
    } else {
        root.join(file)
    };
    let text = fs::read_to_string(path).ok()?;
    text.lines().nth(line as usize - 1).map(str::to_owned)
}

/// Walk and symbolicate the whole stack of `t`. Never fails; a walk error
/// just ends the trace.
pub(crate) fn capture(m: &Machine, t: &Thread) -> StackTrace {
    let mut frames = Vec::new();
    let mut cur = FrameCursor::of(t);
    let mut truncated = false;

    loop {
        if frames.len() == MAX_FRAMES {
            truncated = true;
            break;
        }
        frames.push(resolve(m, cur.ip));
        match unwind_one(m, t, &cur) {
            Ok(next) => {
                if !t.on_stack(next.sp) || next.bp == 0 {
                    break;
                }
                cur = next;
            }
            Err(_) => break,
        }
    }

    StackTrace { frames, truncated }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_empty() {
        let t = StackTrace::default();
        assert_eq!(t.to_string(), "");
    }

    #[test]
    fn test_display_frame() {
        let t = StackTrace {
            frames: vec![Frame {
                pc: 18,
                function: Some("main".into()),
                file: Some("prog.c".into()),
                line: 10,
                column: 3,
                source: Some("  return x;".into()),
            }],
            truncated: false,
        };
        let s = t.to_string();
        assert!(s.contains("#0 main (pc 18) at prog.c:10:3"));
        assert!(s.contains("return x;"));
    }
}
