//! Binary Artifact Model
//!
//! The immutable input of the machine: a code stream, a read-only text
//! segment holding the NUL-padded string literals, the initial bytes of the
//! data segment with its BSS extent and relocation bitmaps, symbol and line
//! tables, and the memory-model tag selecting 32- or 64-bit pointer widths.
//!
//! Artifacts are produced by an external compiler front end; this module only
//! defines the shape and the lookups the runtime needs. The on-disk
//! interchange format is serde (the CLI runner reads JSON artifacts).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::opcode::Operation;

/// Entry symbol every runnable artifact must export.
pub const ENTRY_SYMBOL: &str = "_start";

/// Address and C `long` widths of the compiled program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryModel {
    #[serde(rename = "32")]
    M32,
    #[serde(rename = "64")]
    M64,
}

impl MemoryModel {
    /// Pointer size in bytes; also the stack slot alignment.
    pub fn ptr_size(self) -> usize {
        match self {
            MemoryModel::M32 => 4,
            MemoryModel::M64 => 8,
        }
    }

    /// C `long` width for this model.
    pub fn long_size(self) -> usize {
        match self {
            MemoryModel::M32 => 4,
            MemoryModel::M64 => 8,
        }
    }
}

/// One row of the `functions` or `lines` table.
///
/// `name` is the text-segment byte offset of a NUL-terminated string: the
/// function name in the `functions` table, the source file path in `lines`.
/// Zero means unknown. Tables are sorted by `pc`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcInfo {
    pub pc: usize,
    pub line: u32,
    pub column: u32,
    pub name: usize,
}

/// A loaded program image, immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binary {
    /// Memory model the front end compiled for.
    pub model: MemoryModel,
    /// Instruction stream.
    pub code: Vec<Operation>,
    /// Initial bytes of the data segment.
    pub data: Vec<u8>,
    /// Trailing zero-initialized extent of the data segment.
    pub bss: usize,
    /// Concatenated string literals, NUL padded.
    pub text: Vec<u8>,
    /// Bitmap over data+bss: bit i set means the pointer-sized word at byte
    /// offset i must be rebased onto the runtime data segment.
    pub ds_relative: Vec<u8>,
    /// Bitmap marking words rebased onto the runtime text segment.
    pub ts_relative: Vec<u8>,
    /// Function entry metadata, sorted by pc.
    pub functions: Vec<PcInfo>,
    /// Line number metadata, sorted by pc.
    pub lines: Vec<PcInfo>,
    /// Exported symbol name -> entry pc.
    pub sym: HashMap<String, usize>,
}

impl Binary {
    /// Empty artifact for the given model.
    pub fn new(model: MemoryModel) -> Self {
        Self {
            model,
            code: Vec::new(),
            data: Vec::new(),
            bss: 0,
            text: Vec::new(),
            ds_relative: Vec::new(),
            ts_relative: Vec::new(),
            functions: Vec::new(),
            lines: Vec::new(),
            sym: HashMap::new(),
        }
    }

    /// Entry pc of the program, if the artifact is runnable.
    pub fn entry(&self) -> Option<usize> {
        self.sym.get(ENTRY_SYMBOL).copied()
    }

    /// Greatest table entry with `entry.pc <= pc`, or the zero record.
    ///
    /// Works on any pc-sorted table (`functions` or `lines`).
    pub fn pc_info(table: &[PcInfo], pc: usize) -> PcInfo {
        match table.binary_search_by(|e| e.pc.cmp(&pc)) {
            Ok(i) => table[i],
            Err(0) => PcInfo::default(),
            Err(i) => table[i - 1],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::{Opcode, Operation};

    #[test]
    fn test_model_widths() {
        assert_eq!(MemoryModel::M32.ptr_size(), 4);
        assert_eq!(MemoryModel::M64.ptr_size(), 8);
        assert_eq!(MemoryModel::M32.long_size(), 4);
        assert_eq!(MemoryModel::M64.long_size(), 8);
    }

    #[test]
    fn test_pc_info_lookup() {
        let table = vec![
            PcInfo { pc: 4, line: 1, column: 1, name: 0 },
            PcInfo { pc: 10, line: 5, column: 1, name: 0 },
            PcInfo { pc: 20, line: 9, column: 1, name: 0 },
        ];

        // Before the first entry: zero record.
        assert_eq!(Binary::pc_info(&table, 0), PcInfo::default());
        // Exact hits and in-between pcs resolve to the covering entry.
        assert_eq!(Binary::pc_info(&table, 4).line, 1);
        assert_eq!(Binary::pc_info(&table, 9).line, 1);
        assert_eq!(Binary::pc_info(&table, 10).line, 5);
        assert_eq!(Binary::pc_info(&table, 1000).line, 9);
    }

    #[test]
    fn test_pc_info_monotone() {
        let table = vec![
            PcInfo { pc: 2, line: 1, column: 1, name: 0 },
            PcInfo { pc: 8, line: 2, column: 1, name: 0 },
            PcInfo { pc: 32, line: 3, column: 1, name: 0 },
        ];
        let mut last = 0;
        for pc in 0..64 {
            let line = Binary::pc_info(&table, pc).line;
            assert!(line >= last, "pc_info not monotone at pc {}", pc);
            last = line;
        }
    }

    #[test]
    fn test_artifact_roundtrip() {
        let mut b = Binary::new(MemoryModel::M64);
        b.code.push(Operation::new(Opcode::Push32, 42));
        b.code.push(Operation::from(Opcode::Exit));
        b.sym.insert(ENTRY_SYMBOL.to_string(), 0);

        let json = serde_json::to_string(&b).unwrap();
        let back: Binary = serde_json::from_str(&json).unwrap();
        assert_eq!(back.model, MemoryModel::M64);
        assert_eq!(back.code.len(), 2);
        assert_eq!(back.entry(), Some(0));
    }
}
