// Copyright (C) 2024 Ethan Uppal and Utku Melemetci. All rights reserved.

use std::fmt;

use log::debug;

use crate::{
    arch::{
        InstructionAddress, Label, ENTRY_FUNCTION, FRAME_HEADER_SIZE,
        MAX_FUNCTIONS, MAX_INSTRUCTIONS_TOTAL, STACK_MAX, STACK_START,
    },
    op::Op,
    vm::VMError,
};

/// A function as handed over by the loader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunctionRecord {
    pub label: Label,
    pub instructions: Vec<Op>,
    /// Bytes of local storage, excluding the frame header.
    pub frame_size: u8,
}

/// Label-indexed functions. `None` marks a label the program never declared.
pub type FunctionTable = [Option<FunctionRecord>; MAX_FUNCTIONS];

pub fn empty_function_table() -> FunctionTable {
    Default::default()
}

impl fmt::Display for FunctionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "FUNC LABEL {}", self.label)?;
        for op in &self.instructions {
            writeln!(f, "    {}", op)?;
        }
        Ok(())
    }
}

/// Where each function's code starts in the flattened stream.
#[derive(Debug, Default)]
pub struct AddressTable {
    entries: [Option<InstructionAddress>; MAX_FUNCTIONS],
}

impl AddressTable {
    pub fn get(&self, label: Label) -> Result<InstructionAddress, VMError> {
        self.entries
            .get(label as usize)
            .copied()
            .flatten()
            .ok_or(VMError::UndefinedFunction(label))
    }

    fn set(&mut self, label: Label, address: InstructionAddress) {
        self.entries[label as usize] = Some(address);
    }
}

/// Bytes of local storage each function's frame needs.
#[derive(Debug, Default)]
pub struct FrameSizeTable {
    entries: [u8; MAX_FUNCTIONS],
}

impl FrameSizeTable {
    pub fn get(&self, label: Label) -> Result<u8, VMError> {
        self.entries
            .get(label as usize)
            .copied()
            .ok_or(VMError::UndefinedFunction(label))
    }

    fn set(&mut self, label: Label, frame_size: u8) {
        self.entries[label as usize] = frame_size;
    }
}

/// A linked program: every present function's code in one stream, plus the
/// tables resolving labels into it.
#[derive(Debug)]
pub struct Program {
    code: Vec<Op>,
    addresses: AddressTable,
    frame_sizes: FrameSizeTable,
}

impl Program {
    /// Flattens `functions` into a single instruction stream and builds the
    /// address and frame size tables.
    pub fn link(functions: &FunctionTable) -> Result<Program, VMError> {
        let mut program = Program {
            code: vec![],
            addresses: AddressTable::default(),
            frame_sizes: FrameSizeTable::default(),
        };

        for (slot, record) in functions.iter().enumerate().rev() {
            let Some(record) = record else {
                continue;
            };

            if record.label as usize != slot {
                return Err(VMError::LabelMismatch {
                    slot,
                    label: record.label,
                });
            }
            if record.instructions.last() != Some(&Op::Ret) {
                return Err(VMError::MissingReturn(record.label));
            }
            if program.code.len() + record.instructions.len()
                > MAX_INSTRUCTIONS_TOTAL
            {
                return Err(VMError::ProgramTooLarge);
            }

            let start = program.code.len() as InstructionAddress;
            debug!(
                "linking function {} at {} ({} instructions, {} local bytes)",
                record.label,
                start,
                record.instructions.len(),
                record.frame_size
            );

            program.addresses.set(record.label, start);
            program.frame_sizes.set(record.label, record.frame_size);
            program.code.extend_from_slice(&record.instructions);
        }

        program
            .addresses
            .get(ENTRY_FUNCTION)
            .map_err(|_| VMError::NoEntryFunction)?;

        // the entry frame still needs room for its header above the locals
        let entry_top = STACK_START as usize
            + program.frame_sizes.get(ENTRY_FUNCTION)? as usize
            + FRAME_HEADER_SIZE;
        if entry_top > STACK_MAX as usize {
            return Err(VMError::StackOverflow(ENTRY_FUNCTION));
        }

        Ok(program)
    }

    pub fn fetch(&self, address: usize) -> Result<Op, VMError> {
        self.code
            .get(address)
            .copied()
            .ok_or(VMError::InvalidInstructionAddress(address))
    }

    pub fn entry_address(
        &self,
        label: Label,
    ) -> Result<InstructionAddress, VMError> {
        self.addresses.get(label)
    }

    pub fn frame_size(&self, label: Label) -> Result<u8, VMError> {
        // absent functions have no frame; report them as undefined
        self.addresses.get(label)?;
        self.frame_sizes.get(label)
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use test_log::test;

    use crate::{
        op::{Arg, Op},
        program::{empty_function_table, FunctionRecord, Program},
        vm::VMError,
    };

    fn record(
        label: u8,
        instructions: Vec<Op>,
        frame_size: u8,
    ) -> Option<FunctionRecord> {
        Some(FunctionRecord {
            label,
            instructions,
            frame_size,
        })
    }

    #[test]
    fn every_label_resolves_to_its_code() {
        let mut functions = empty_function_table();
        functions[0] = record(0, vec![Op::Cal(Arg::Immediate(3)), Op::Ret], 1);
        functions[3] = record(
            3,
            vec![
                Op::Print(Arg::Immediate(9)),
                Op::Print(Arg::Immediate(8)),
                Op::Ret,
            ],
            4,
        );

        let program = Program::link(&functions).expect("program should link");

        assert_eq!(5, program.len());
        for (label, function) in functions.iter().enumerate() {
            let Some(function) = function else {
                continue;
            };
            let start = program.entry_address(label as u8).unwrap() as usize;
            for (i, op) in function.instructions.iter().enumerate() {
                assert_eq!(*op, program.fetch(start + i).unwrap());
            }
            assert_eq!(
                function.frame_size,
                program.frame_size(label as u8).unwrap()
            );
        }
    }

    #[test]
    fn absent_labels_are_undefined() {
        let mut functions = empty_function_table();
        functions[0] = record(0, vec![Op::Ret], 0);

        let program = Program::link(&functions).unwrap();

        assert!(matches!(
            program.entry_address(5),
            Err(VMError::UndefinedFunction(5))
        ));
        assert!(matches!(
            program.frame_size(200),
            Err(VMError::UndefinedFunction(200))
        ));
    }

    #[test]
    fn rejects_function_without_trailing_ret() {
        let mut functions = empty_function_table();
        functions[0] = record(0, vec![Op::Ret], 0);
        functions[2] =
            record(2, vec![Op::Ret, Op::Print(Arg::Immediate(1))], 0);

        assert!(matches!(
            Program::link(&functions),
            Err(VMError::MissingReturn(2))
        ));
    }

    #[test]
    fn rejects_present_but_empty_function() {
        let mut functions = empty_function_table();
        functions[0] = record(0, vec![], 0);

        assert!(matches!(
            Program::link(&functions),
            Err(VMError::MissingReturn(0))
        ));
    }

    #[test]
    fn requires_entry_function() {
        let mut functions = empty_function_table();
        functions[1] = record(1, vec![Op::Ret], 0);

        assert!(matches!(
            Program::link(&functions),
            Err(VMError::NoEntryFunction)
        ));
        assert!(matches!(
            Program::link(&empty_function_table()),
            Err(VMError::NoEntryFunction)
        ));
    }

    #[test]
    fn rejects_misplaced_record() {
        let mut functions = empty_function_table();
        functions[0] = record(4, vec![Op::Ret], 0);

        assert!(matches!(
            Program::link(&functions),
            Err(VMError::LabelMismatch { slot: 0, label: 4 })
        ));
    }

    #[test]
    fn rejects_entry_frame_larger_than_stack() {
        let mut functions = empty_function_table();
        functions[0] = record(0, vec![Op::Ret], 250);

        assert!(matches!(
            Program::link(&functions),
            Err(VMError::StackOverflow(0))
        ));
    }

    #[test]
    fn lists_function_like_objdump() {
        let function = FunctionRecord {
            label: 1,
            instructions: vec![
                Op::Mov(Arg::Local(0), Arg::Immediate(7)),
                Op::Print(Arg::Local(0)),
                Op::Ret,
            ],
            frame_size: 1,
        };

        assert_eq!(
            "FUNC LABEL 1\n    MOV STK A VAL 7\n    PRINT STK A\n    RET\n",
            function.to_string()
        );
    }
}
