// Copyright (C) 2024 Ethan Uppal and Utku Melemetci. All rights reserved.

//! Reading and writing x2017 binaries.
//!
//! A binary is a bit string consumed from its last bit towards its first.
//! Every field is a big-endian group of bits. Reading from the tail, a
//! function is its instruction count, its instructions from last to first,
//! and finally its label. An instruction is its opcode followed by each
//! operand's kind and value. Functions repeat until only the zero padding
//! that rounds the file up to whole bytes is left.
//!
//! Stack symbols are renumbered to frame offsets in order of first
//! appearance, so a function's frame size is its number of distinct symbols.

use std::{
    fs,
    path::{Path, PathBuf},
};

use bitvec::prelude::*;
use log::debug;

use crate::{
    arch::{
        Label, LocalOffset, IMMEDIATE_BITS, INSTRUCTION_COUNT_BITS,
        LABEL_BITS, MAX_STACK_SYMBOLS, REGISTER_BITS, SYMBOL_BITS,
    },
    op::{Arg, Op, RawArgKind, RawOpCode, ARG_KIND_BITS, OPCODE_BITS},
    program::{empty_function_table, FunctionRecord, FunctionTable},
};

/// Smallest function: a count, a lone `RET` and a label.
const MIN_FUNCTION_BITS: usize =
    INSTRUCTION_COUNT_BITS + OPCODE_BITS + LABEL_BITS;

/// Anything shorter than this at the head of the file is padding.
const PADDING_BITS: usize = 8;
static_assertions::const_assert!(MIN_FUNCTION_BITS >= PADDING_BITS);

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Binary ends in the middle of a function")]
    Truncated,
    #[error("Function {0} is defined more than once")]
    DuplicateLabel(Label),
    #[error("Unknown opcode {0}")]
    UnknownOpcode(RawOpCode),
    #[error("Unknown operand kind {0}")]
    UnknownArgKind(RawArgKind),
    #[error("Function {0} has too many instructions to encode")]
    TooManyInstructions(Label),
    #[error("{field} {value} does not fit in {bits} bits")]
    FieldOverflow {
        field: &'static str,
        value: u8,
        bits: usize,
    },
}

pub type LoadResult<T> = Result<T, LoadError>;

/// Reads the x2017 binary at `path`.
pub fn load_file(path: &Path) -> LoadResult<FunctionTable> {
    let bytes = fs::read(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("read {} bytes from {}", bytes.len(), path.display());
    parse(&bytes)
}

/// Consumes fields from the end of a bit string.
struct TailReader<'a> {
    bits: &'a BitSlice<u8, Msb0>,
    end: usize,
}

impl<'a> TailReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        let bits = bytes.view_bits::<Msb0>();
        Self {
            bits,
            end: bits.len(),
        }
    }

    fn remaining(&self) -> usize {
        self.end
    }

    fn take(&mut self, width: usize) -> LoadResult<u8> {
        let start = self.end.checked_sub(width).ok_or(LoadError::Truncated)?;
        let value = self.bits[start..self.end].load_be::<u8>();
        self.end = start;
        Ok(value)
    }

    /// Reads an operand, leaving stack symbols unnumbered.
    fn take_arg(&mut self) -> LoadResult<Arg> {
        Ok(match self.take(ARG_KIND_BITS)? {
            Arg::IMMEDIATE_TAG => Arg::Immediate(self.take(IMMEDIATE_BITS)?),
            Arg::REGISTER_TAG => Arg::Register(self.take(REGISTER_BITS)?),
            Arg::LOCAL_TAG => Arg::Local(self.take(SYMBOL_BITS)?),
            Arg::INDIRECT_TAG => Arg::Indirect(self.take(SYMBOL_BITS)?),
            other => return Err(LoadError::UnknownArgKind(other)),
        })
    }
}

/// Builds an [`Op`] for a raw opcode, pulling as many operands as it takes.
macro_rules! decode_op {
    ($opcode:expr, $take_arg:ident; $($variant:ident / $arity:tt),* $(,)?) => {
        paste::paste! {
            match $opcode {
                $(Op::[<$variant:upper _TAG>] => {
                    decode_op!(@build $variant $arity $take_arg)
                })*
                other => return Err(LoadError::UnknownOpcode(other)),
            }
        }
    };
    (@build $variant:ident 0 $take_arg:ident) => {
        Op::$variant
    };
    (@build $variant:ident 1 $take_arg:ident) => {
        Op::$variant($take_arg()?)
    };
    (@build $variant:ident 2 $take_arg:ident) => {{
        let a = $take_arg()?;
        let b = $take_arg()?;
        Op::$variant(a, b)
    }};
}

fn take_op(reader: &mut TailReader) -> LoadResult<Op> {
    let opcode = reader.take(OPCODE_BITS)?;
    let mut take_arg = || reader.take_arg();
    Ok(decode_op!(opcode, take_arg;
        Mov / 2,
        Cal / 1,
        Ret / 0,
        Ref / 2,
        Add / 2,
        Print / 1,
        Not / 1,
        Equ / 1,
    ))
}

/// Renumbers stack symbols to frame offsets in order of first appearance
/// and returns the resulting frame size.
fn number_symbols(instructions: &mut [Op]) -> u8 {
    let mut offsets: [Option<LocalOffset>; MAX_STACK_SYMBOLS] =
        [None; MAX_STACK_SYMBOLS];
    let mut frame_size: u8 = 0;

    let mut offset_of = |symbol: u8| {
        *offsets[symbol as usize].get_or_insert_with(|| {
            frame_size += 1;
            frame_size - 1
        })
    };

    for op in instructions.iter_mut() {
        *op = op.map_args(|arg| match arg {
            Arg::Local(symbol) => Arg::Local(offset_of(symbol)),
            Arg::Indirect(symbol) => Arg::Indirect(offset_of(symbol)),
            other => other,
        });
    }

    frame_size
}

fn take_function(reader: &mut TailReader) -> LoadResult<FunctionRecord> {
    let count = reader.take(INSTRUCTION_COUNT_BITS)? as usize;
    let mut instructions = (0..count)
        .map(|_| take_op(reader))
        .collect::<LoadResult<Vec<Op>>>()?;
    let label = reader.take(LABEL_BITS)?;

    instructions.reverse();
    let frame_size = number_symbols(&mut instructions);

    Ok(FunctionRecord {
        label,
        instructions,
        frame_size,
    })
}

/// Parses an x2017 binary into a label-indexed function table.
pub fn parse(bytes: &[u8]) -> LoadResult<FunctionTable> {
    let mut reader = TailReader::new(bytes);
    let mut functions = empty_function_table();

    while reader.remaining() >= PADDING_BITS {
        let function = take_function(&mut reader)?;
        let slot = &mut functions[function.label as usize];
        if slot.is_some() {
            return Err(LoadError::DuplicateLabel(function.label));
        }
        debug!(
            "parsed function {} ({} instructions, {} local bytes)",
            function.label,
            function.instructions.len(),
            function.frame_size
        );
        *slot = Some(function);
    }

    Ok(functions)
}

/// Collects fields in the order a [`TailReader`] consumes them.
#[derive(Default)]
struct TailWriter {
    fields: Vec<(u8, usize)>,
}

impl TailWriter {
    fn put(
        &mut self,
        field: &'static str,
        value: u8,
        bits: usize,
    ) -> LoadResult<()> {
        if bits < u8::BITS as usize && value >> bits != 0 {
            return Err(LoadError::FieldOverflow { field, value, bits });
        }
        self.fields.push((value, bits));
        Ok(())
    }

    fn put_arg(&mut self, arg: Arg) -> LoadResult<()> {
        self.put("operand kind", arg.tag(), ARG_KIND_BITS)?;
        match arg {
            Arg::Immediate(value) => self.put("value", value, IMMEDIATE_BITS),
            Arg::Register(index) => self.put("register", index, REGISTER_BITS),
            Arg::Local(offset) | Arg::Indirect(offset) => {
                self.put("stack symbol", offset, SYMBOL_BITS)
            }
        }
    }

    fn finish(self) -> Vec<u8> {
        let total: usize = self.fields.iter().map(|&(_, bits)| bits).sum();
        let padding = (8 - total % 8) % 8;
        let mut bits = bitvec![u8, Msb0; 0; padding + total];

        let mut end = bits.len();
        for (value, width) in self.fields {
            bits[end - width..end].store_be(value);
            end -= width;
        }

        bits.into_vec()
    }
}

/// Writes `functions` in the format [`parse`] reads. Frame offsets are
/// written as stack symbols.
pub fn encode_program(functions: &FunctionTable) -> LoadResult<Vec<u8>> {
    let mut writer = TailWriter::default();

    for function in functions.iter().flatten() {
        let count = u8::try_from(function.instructions.len())
            .ok()
            .filter(|&count| count >> INSTRUCTION_COUNT_BITS == 0)
            .ok_or(LoadError::TooManyInstructions(function.label))?;
        writer.put("instruction count", count, INSTRUCTION_COUNT_BITS)?;

        for op in function.instructions.iter().rev() {
            writer.put("opcode", op.opcode(), OPCODE_BITS)?;
            for arg in op.args() {
                writer.put_arg(arg)?;
            }
        }

        writer.put("label", function.label, LABEL_BITS)?;
    }

    Ok(writer.finish())
}
