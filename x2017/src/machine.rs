// Copyright (C) 2024 Ethan Uppal and Utku Melemetci. All rights reserved.

use crate::{
    arch::{
        Address, LocalOffset, MEMORY_SIZE, REGISTER_COUNT, STACK_START,
    },
    op::Arg,
    vm::VMError,
};

/// Lowest address a frame can occupy.
pub const STACK_BASE: usize = STACK_START as usize + 1;

pub const STACK_SIZE: usize = MEMORY_SIZE - STACK_BASE;

/// The registers a program may name.
#[derive(Debug, Default)]
pub struct Registers {
    values: [u8; REGISTER_COUNT],
}

impl Registers {
    pub fn get(&self, index: u8) -> Result<u8, VMError> {
        self.values
            .get(index as usize)
            .copied()
            .ok_or(VMError::InvalidRegister(index))
    }

    pub fn set(&mut self, index: u8, value: u8) -> Result<(), VMError> {
        let slot = self
            .values
            .get_mut(index as usize)
            .ok_or(VMError::InvalidRegister(index))?;
        *slot = value;
        Ok(())
    }
}

/// Backing store for activation frames, addressed by absolute address.
#[derive(Debug)]
pub struct Stack {
    bytes: [u8; STACK_SIZE],
}

impl Default for Stack {
    fn default() -> Self {
        Self {
            bytes: [0; STACK_SIZE],
        }
    }
}

impl Stack {
    fn index(address: usize) -> Result<usize, VMError> {
        address
            .checked_sub(STACK_BASE)
            .filter(|&index| index < STACK_SIZE)
            .ok_or(VMError::AddressOutOfBounds(address))
    }

    pub fn read(&self, address: usize) -> Result<u8, VMError> {
        Ok(self.bytes[Self::index(address)?])
    }

    pub fn write(&mut self, address: usize, value: u8) -> Result<(), VMError> {
        self.bytes[Self::index(address)?] = value;
        Ok(())
    }
}

/// All mutable state of a running program.
#[derive(Debug)]
pub struct Machine {
    pub registers: Registers,
    pub stack: Stack,
    /// Index of the next instruction to fetch.
    pub pc: usize,
    /// Frame pointer of the active frame. Locals sit at and below it, the
    /// saved frame pointer and return address directly above it.
    pub sp: Address,
    /// Local byte counts of the live frames, innermost last.
    frame_sizes: Vec<u8>,
}

impl Machine {
    pub fn new(pc: usize, sp: Address, frame_size: u8) -> Self {
        Self {
            registers: Registers::default(),
            stack: Stack::default(),
            pc,
            sp,
            frame_sizes: vec![frame_size],
        }
    }

    /// Local byte count of the active frame.
    pub fn frame_size(&self) -> u8 {
        self.frame_sizes.last().copied().unwrap_or(0)
    }

    pub fn enter_frame(&mut self, frame_size: u8) {
        self.frame_sizes.push(frame_size);
    }

    pub fn leave_frame(&mut self) {
        self.frame_sizes.pop();
    }

    /// Absolute address of the local at `offset` in the active frame.
    pub fn local_address(
        &self,
        offset: LocalOffset,
    ) -> Result<usize, VMError> {
        if offset >= self.frame_size() {
            return Err(VMError::LocalOutOfFrame(offset));
        }
        (self.sp as usize)
            .checked_sub(offset as usize)
            .filter(|&address| address >= STACK_BASE)
            .ok_or(VMError::LocalOutOfFrame(offset))
    }

    /// Follows the pointer stored in the local at `offset`.
    fn pointee_address(&self, offset: LocalOffset) -> Result<usize, VMError> {
        let pointer = self.stack.read(self.local_address(offset)?)?;
        Ok(pointer as usize)
    }

    /// The memory address `arg` denotes, if it denotes one.
    pub fn address_of(&self, arg: Arg) -> Result<Option<usize>, VMError> {
        match arg {
            Arg::Immediate(_) | Arg::Register(_) => Ok(None),
            Arg::Local(offset) => self.local_address(offset).map(Some),
            Arg::Indirect(offset) => self.pointee_address(offset).map(Some),
        }
    }

    /// Reads the value `arg` denotes.
    pub fn read(&self, arg: Arg) -> Result<u8, VMError> {
        match arg {
            Arg::Immediate(value) => Ok(value),
            Arg::Register(index) => self.registers.get(index),
            Arg::Local(offset) => self.stack.read(self.local_address(offset)?),
            Arg::Indirect(offset) => {
                self.stack.read(self.pointee_address(offset)?)
            }
        }
    }

    /// Writes `value` to the storage `arg` denotes.
    pub fn write(&mut self, arg: Arg, value: u8) -> Result<(), VMError> {
        match arg {
            Arg::Immediate(_) => Err(VMError::NotWritable(arg)),
            Arg::Register(index) => self.registers.set(index, value),
            Arg::Local(offset) => {
                let address = self.local_address(offset)?;
                self.stack.write(address, value)
            }
            Arg::Indirect(offset) => {
                let address = self.pointee_address(offset)?;
                self.stack.write(address, value)
            }
        }
    }
}
