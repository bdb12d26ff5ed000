// Copyright (C) 2024 Ethan Uppal and Utku Melemetci. All rights reserved.

use static_assertions::const_assert;

/// A function label, doubling as its index into the function tables.
pub type Label = u8;

/// Index into the flattened instruction stream.
pub type InstructionAddress = u8;

/// Absolute byte address in the machine's memory space.
pub type Address = u8;

/// Frame-relative offset of a local variable.
pub type LocalOffset = u8;

pub const MEMORY_SIZE: usize = 1 << 8;
const_assert!(MEMORY_SIZE <= Address::MAX as usize + 1);

pub const LABEL_BITS: usize = 3;
pub const MAX_FUNCTIONS: usize = 1 << LABEL_BITS;
const_assert!(MAX_FUNCTIONS <= Label::MAX as usize + 1);

pub const INSTRUCTION_COUNT_BITS: usize = 5;
pub const MAX_INSTRUCTIONS: usize = 1 << INSTRUCTION_COUNT_BITS;

pub const MAX_INSTRUCTIONS_TOTAL: usize = MAX_FUNCTIONS * MAX_INSTRUCTIONS;
const_assert!(MAX_INSTRUCTIONS_TOTAL <= InstructionAddress::MAX as usize + 1);

/// Registers a program may name. A register operand's field can encode
/// more, but those indices are rejected.
pub const REGISTER_COUNT: usize = 4;
pub const REGISTER_BITS: usize = 3;
const_assert!(REGISTER_COUNT <= 1 << REGISTER_BITS);

pub const SYMBOL_BITS: usize = 5;
pub const MAX_STACK_SYMBOLS: usize = 1 << SYMBOL_BITS;

pub const IMMEDIATE_BITS: usize = 8;

pub const ENTRY_FUNCTION: Label = 0;
const_assert!((ENTRY_FUNCTION as usize) < MAX_FUNCTIONS);

/// Saved frame pointer and saved program counter.
pub const FRAME_HEADER_SIZE: usize = 2;

/// Frame pointer of an empty frame at the very bottom of the stack. The
/// function address and frame size tables sit below it.
pub const STACK_START: Address = (2 * MAX_FUNCTIONS - 1) as Address;

/// Highest usable stack address.
pub const STACK_MAX: Address = (MEMORY_SIZE - 1) as Address;
const_assert!(STACK_START < STACK_MAX);

/// Saved frame pointer marking the entry frame, which has no caller.
pub const NO_CALLER: Address = 0;
const_assert!(NO_CALLER < STACK_START);
