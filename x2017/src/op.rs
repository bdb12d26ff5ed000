// Copyright (C) 2024 Ethan Uppal and Utku Melemetci. All rights reserved.

use std::fmt;

use enum_tags::enum_tags;
use static_assertions::const_assert;

use crate::arch::LocalOffset;

/// Smallest sized integer type that can fit an op code.
pub type RawOpCode = u8;

/// Smallest sized integer type that can fit an operand kind.
pub type RawArgKind = u8;

/// Bits for opcode.
pub const OPCODE_BITS: usize = 3;
const_assert!(OPCODE_BITS <= RawOpCode::BITS as usize);

/// Bits for operand kind.
pub const ARG_KIND_BITS: usize = 2;
const_assert!(ARG_KIND_BITS <= RawArgKind::BITS as usize);

/// An instruction operand. Every payload is a single byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[enum_tags(public, repr(RawArgKind))]
pub enum Arg {
    /// A literal value.
    Immediate(u8),
    /// One of the addressable registers.
    Register(u8),
    /// A byte in the current frame, by frame-relative offset.
    Local(LocalOffset),
    /// A local holding the absolute address of the byte to access.
    Indirect(LocalOffset),
}

const_assert!(Arg::VARIANT_COUNT <= 1 << ARG_KIND_BITS);

impl Arg {
    /// Mnemonic used for this operand kind in listings.
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Immediate(_) => "VAL",
            Self::Register(_) => "REG",
            Self::Local(_) => "STK",
            Self::Indirect(_) => "PTR",
        }
    }
}

/// Stack symbols are lettered by frame offset: `A`..`Z`, then `a`..`f`.
pub fn symbol_name(offset: LocalOffset) -> char {
    match offset {
        0..=25 => (b'A' + offset) as char,
        26..=31 => (b'a' + (offset - 26)) as char,
        _ => '?',
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Immediate(value) | Self::Register(value) => {
                write!(f, "{} {}", self.kind_name(), value)
            }
            Self::Local(offset) | Self::Indirect(offset) => {
                write!(f, "{} {}", self.kind_name(), symbol_name(offset))
            }
        }
    }
}

/// An x2017 instruction. Operand kinds are checked when the instruction is
/// executed, not when it is constructed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[enum_tags(public, repr(RawOpCode))]
pub enum Op {
    /// `Self::Mov(a, b)` stores the value of `b` into `a`.
    Mov(Arg, Arg),
    /// `Self::Cal(a)` calls the function whose label is the immediate `a`.
    Cal(Arg),
    /// `Self::Ret` returns to the caller, or halts from the entry function.
    Ret,
    /// `Self::Ref(a, b)` stores the address of the local `b` into `a`.
    Ref(Arg, Arg),
    /// `Self::Add(a, b)` adds register `b` into register `a`, wrapping.
    Add(Arg, Arg),
    /// `Self::Print(a)` writes the value of `a` as a decimal line.
    Print(Arg),
    /// `Self::Not(a)` complements register `a` bitwise.
    Not(Arg),
    /// `Self::Equ(a)` sets register `a` to 1 if it was 0, else to 0.
    Equ(Arg),
}

const_assert!(Op::VARIANT_COUNT <= 1 << OPCODE_BITS);

impl Op {
    pub const fn opcode(&self) -> RawOpCode {
        self.tag()
    }

    pub const fn mnemonic(&self) -> &'static str {
        self.tag_name()
    }

    /// Rebuilds this instruction with `f` applied to every operand, in order.
    pub fn map_args(self, mut f: impl FnMut(Arg) -> Arg) -> Op {
        match self {
            Self::Mov(a, b) => {
                let a = f(a);
                Self::Mov(a, f(b))
            }
            Self::Cal(a) => Self::Cal(f(a)),
            Self::Ret => Self::Ret,
            Self::Ref(a, b) => {
                let a = f(a);
                Self::Ref(a, f(b))
            }
            Self::Add(a, b) => {
                let a = f(a);
                Self::Add(a, f(b))
            }
            Self::Print(a) => Self::Print(f(a)),
            Self::Not(a) => Self::Not(f(a)),
            Self::Equ(a) => Self::Equ(f(a)),
        }
    }

    pub fn args(&self) -> Vec<Arg> {
        match *self {
            Self::Ret => vec![],
            Self::Cal(a) | Self::Print(a) | Self::Not(a) | Self::Equ(a) => {
                vec![a]
            }
            Self::Mov(a, b) | Self::Ref(a, b) | Self::Add(a, b) => vec![a, b],
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())?;
        for arg in self.args() {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}
