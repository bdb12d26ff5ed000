// Copyright (C) 2024 Ethan Uppal and Utku Melemetci. All rights reserved.

use std::io::{self, Write};

use log::{debug, trace};

use crate::{
    arch::{
        Address, Label, LocalOffset, ENTRY_FUNCTION, FRAME_HEADER_SIZE,
        NO_CALLER, STACK_MAX, STACK_START,
    },
    machine::Machine,
    op::{Arg, Op},
    program::{FunctionTable, Program},
};

pub struct VM {
    program: Program,
    machine: Machine,
}

#[derive(Debug, thiserror::Error)]
pub enum VMError {
    #[error("No return instruction found at end of function {0}")]
    MissingReturn(Label),
    #[error("Function {label} was supplied in slot {slot}")]
    LabelMismatch { slot: usize, label: Label },
    #[error("No entry function found")]
    NoEntryFunction,
    #[error("Program has more instructions than the machine can address")]
    ProgramTooLarge,
    #[error("{position} argument to {op} must {requirement}")]
    InvalidOperand {
        op: &'static str,
        position: &'static str,
        requirement: &'static str,
    },
    #[error("Operand {0} does not denote writable storage")]
    NotWritable(Arg),
    #[error("Register {0} is not addressable")]
    InvalidRegister(u8),
    #[error("No function with label {0}")]
    UndefinedFunction(Label),
    #[error("Stack overflow detected when trying to call function {0}")]
    StackOverflow(Label),
    #[error("Stack symbol {0} lies outside the active frame")]
    LocalOutOfFrame(LocalOffset),
    #[error("Memory address {0} is outside the stack")]
    AddressOutOfBounds(usize),
    #[error("Instruction address {0} is outside the program")]
    InvalidInstructionAddress(usize),
    #[error("Failed to write output: {0}")]
    Output(#[from] io::Error),
}

pub type VMResult<T = ()> = Result<T, VMError>;

/// What the dispatcher does after an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The entry function returned.
    Halt,
}

impl VM {
    /// Links `functions` and prepares the entry frame.
    pub fn new(functions: &FunctionTable) -> VMResult<VM> {
        let program = Program::link(functions)?;

        let entry = program.entry_address(ENTRY_FUNCTION)?;
        let frame_size = program.frame_size(ENTRY_FUNCTION)?;
        let sp = STACK_START + frame_size;
        let mut machine = Machine::new(entry as usize, sp, frame_size);
        machine.stack.write(sp as usize + 1, NO_CALLER)?;

        debug!(
            "linked {} instructions, entry at {}, frame pointer {}",
            program.len(),
            entry,
            sp
        );

        Ok(VM { program, machine })
    }

    /// Runs the [`VM`] until the entry function returns.
    pub fn run(&mut self, out: &mut impl Write) -> VMResult {
        while self.step(out)? == Flow::Continue {}
        Ok(())
    }

    /// Executes the instruction at the program counter.
    pub fn step(&mut self, out: &mut impl Write) -> VMResult<Flow> {
        let op = self.program.fetch(self.machine.pc)?;
        trace!("{:>3}: {}", self.machine.pc, op);
        self.machine.pc += 1;

        let machine = &mut self.machine;
        match op {
            Op::Mov(a, b) => mov(machine, a, b),
            Op::Cal(a) => {
                let label = immediate("CAL", "first", a)?;
                call(machine, &self.program, label)
            }
            Op::Ret => return ret(machine),
            Op::Ref(a, b) => reference(machine, a, b),
            Op::Add(a, b) => add(machine, a, b),
            Op::Print(a) => print(machine, a, out),
            Op::Not(a) => not(machine, a),
            Op::Equ(a) => equ(machine, a),
        }?;

        Ok(Flow::Continue)
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }
}

fn mov(machine: &mut Machine, a: Arg, b: Arg) -> VMResult {
    writable("MOV", a)?;
    let value = machine.read(b)?;
    machine.write(a, value)
}

fn reference(machine: &mut Machine, a: Arg, b: Arg) -> VMResult {
    writable("REF", a)?;
    let address = match b {
        Arg::Local(_) | Arg::Indirect(_) => machine.address_of(b)?,
        _ => None,
    }
    .ok_or(VMError::InvalidOperand {
        op: "REF",
        position: "second",
        requirement: "be stack or pointer typed",
    })?;
    machine.write(a, address as u8)
}

fn add(machine: &mut Machine, a: Arg, b: Arg) -> VMResult {
    let (a, b) = match (a, b) {
        (Arg::Register(a), Arg::Register(b)) => (a, b),
        _ => {
            return Err(VMError::InvalidOperand {
                op: "ADD",
                position: "each",
                requirement: "be register typed",
            })
        }
    };
    let sum = machine.registers.get(a)?.wrapping_add(machine.registers.get(b)?);
    machine.registers.set(a, sum)
}

fn print(machine: &mut Machine, a: Arg, out: &mut impl Write) -> VMResult {
    let value = machine.read(a)?;
    writeln!(out, "{}", value)?;
    Ok(())
}

fn not(machine: &mut Machine, a: Arg) -> VMResult {
    let index = register("NOT", a)?;
    let value = machine.registers.get(index)?;
    machine.registers.set(index, !value)
}

fn equ(machine: &mut Machine, a: Arg) -> VMResult {
    let index = register("EQU", a)?;
    let value = machine.registers.get(index)?;
    machine.registers.set(index, (value == 0) as u8)
}

/// Pushes a frame for `label` and jumps to its first instruction.
fn call(machine: &mut Machine, program: &Program, label: Label) -> VMResult {
    let entry = program.entry_address(label)?;
    let frame_size = program.frame_size(label)? as usize;

    // room for this frame's header, the callee's locals, and the callee's
    // own header
    let limit = (STACK_MAX as usize)
        .checked_sub(frame_size + 2 * FRAME_HEADER_SIZE);
    let sp = machine.sp as usize;
    if limit.map_or(true, |limit| sp > limit) {
        return Err(VMError::StackOverflow(label));
    }

    let new_sp = sp + FRAME_HEADER_SIZE + frame_size;
    let return_address = u8::try_from(machine.pc)
        .map_err(|_| VMError::InvalidInstructionAddress(machine.pc))?;
    machine.stack.write(new_sp + 1, machine.sp)?;
    machine.stack.write(new_sp + 2, return_address)?;

    debug!(
        "call {} from {}: frame pointer {} -> {}",
        label, return_address, sp, new_sp
    );

    machine.sp = new_sp as Address;
    machine.pc = entry as usize;
    machine.enter_frame(frame_size as u8);
    Ok(())
}

/// Pops the active frame, or halts if it is the entry frame.
fn ret(machine: &mut Machine) -> VMResult<Flow> {
    let sp = machine.sp as usize;
    let saved_sp = machine.stack.read(sp + 1)?;
    if saved_sp == NO_CALLER {
        debug!("entry function returned");
        return Ok(Flow::Halt);
    }

    let return_address = machine.stack.read(sp + 2)?;
    debug!(
        "return to {}: frame pointer {} -> {}",
        return_address, sp, saved_sp
    );

    machine.sp = saved_sp;
    machine.pc = return_address as usize;
    machine.leave_frame();
    Ok(Flow::Continue)
}

fn writable(op: &'static str, arg: Arg) -> VMResult {
    match arg {
        Arg::Immediate(_) => Err(VMError::InvalidOperand {
            op,
            position: "first",
            requirement: "not be value typed",
        }),
        _ => Ok(()),
    }
}

fn register(op: &'static str, arg: Arg) -> VMResult<u8> {
    match arg {
        Arg::Register(index) => Ok(index),
        _ => Err(VMError::InvalidOperand {
            op,
            position: "first",
            requirement: "be register typed",
        }),
    }
}

fn immediate(
    op: &'static str,
    position: &'static str,
    arg: Arg,
) -> VMResult<u8> {
    match arg {
        Arg::Immediate(value) => Ok(value),
        _ => Err(VMError::InvalidOperand {
            op,
            position,
            requirement: "be value typed",
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use pretty_assertions::assert_eq;
    use test_log::test;

    use crate::{
        arch::STACK_START,
        machine::Machine,
        op::{Arg, Op},
        program::{empty_function_table, FunctionRecord, FunctionTable},
        vm::{equ, not, Flow, VMError, VMResult, VM},
    };

    use Arg::{Immediate as Val, Indirect as Ptr, Local as Stk, Register as Reg};

    fn with_function(
        mut functions: FunctionTable,
        label: u8,
        frame_size: u8,
        instructions: Vec<Op>,
    ) -> FunctionTable {
        functions[label as usize] = Some(FunctionRecord {
            label,
            instructions,
            frame_size,
        });
        functions
    }

    fn main_only(frame_size: u8, instructions: Vec<Op>) -> FunctionTable {
        with_function(empty_function_table(), 0, frame_size, instructions)
    }

    fn run(functions: &FunctionTable) -> (VMResult, String) {
        let mut out = vec![];
        let result = VM::new(functions).and_then(|mut vm| vm.run(&mut out));
        (result, String::from_utf8(out).expect("output should be utf-8"))
    }

    #[test]
    fn prints_immediate_and_halts() {
        let (result, out) =
            run(&main_only(0, vec![Op::Print(Val(5)), Op::Ret]));
        result.expect("program should run without errors");
        assert_eq!("5\n", out);
    }

    #[test]
    fn step_reports_halt_only_from_entry_frame() {
        let functions = with_function(
            main_only(0, vec![Op::Cal(Val(1)), Op::Ret]),
            1,
            0,
            vec![Op::Ret],
        );
        let mut vm = VM::new(&functions).unwrap();
        let mut out = io::sink();

        assert_eq!(Flow::Continue, vm.step(&mut out).unwrap()); // CAL
        assert_eq!(Flow::Continue, vm.step(&mut out).unwrap()); // callee RET
        assert_eq!(STACK_START, vm.machine().sp);
        assert_eq!(Flow::Halt, vm.step(&mut out).unwrap());
    }

    #[test]
    fn returns_to_instruction_after_each_call() {
        let functions = main_only(
            0,
            vec![
                Op::Print(Val(0)),
                Op::Cal(Val(1)),
                Op::Print(Val(4)),
                Op::Ret,
            ],
        );
        let functions = with_function(
            functions,
            1,
            1,
            vec![
                Op::Print(Val(1)),
                Op::Cal(Val(2)),
                Op::Print(Val(3)),
                Op::Ret,
            ],
        );
        let functions =
            with_function(functions, 2, 3, vec![Op::Print(Val(2)), Op::Ret]);

        let (result, out) = run(&functions);
        result.unwrap();
        assert_eq!("0\n1\n2\n3\n4\n", out);
    }

    #[test]
    fn locals_belong_to_their_frame() {
        let functions = main_only(
            1,
            vec![
                Op::Mov(Stk(0), Val(3)),
                Op::Cal(Val(1)),
                Op::Ref(Reg(0), Stk(0)),
                Op::Print(Stk(0)),
                Op::Ret,
            ],
        );
        let functions = with_function(
            functions,
            1,
            1,
            vec![Op::Mov(Stk(0), Val(9)), Op::Print(Stk(0)), Op::Ret],
        );

        let (result, out) = run(&functions);
        result.unwrap();
        assert_eq!("9\n3\n", out);
    }

    #[test]
    fn callee_cannot_reach_past_its_frame() {
        // the caller's local A sits three bytes above the callee's, past
        // the callee's own local and its frame header
        let functions = main_only(
            1,
            vec![
                Op::Mov(Stk(0), Val(3)),
                Op::Cal(Val(1)),
                Op::Print(Val(77)),
                Op::Print(Stk(0)),
                Op::Ret,
            ],
        );
        let functions = with_function(
            functions,
            1,
            1,
            vec![Op::Print(Stk(3)), Op::Mov(Stk(1), Val(0)), Op::Ret],
        );

        let (result, out) = run(&functions);
        assert!(matches!(result, Err(VMError::LocalOutOfFrame(3))));
        assert_eq!("", out);

        let functions = with_function(
            main_only(0, vec![Op::Cal(Val(1)), Op::Ret]),
            1,
            1,
            vec![Op::Mov(Stk(1), Val(0)), Op::Ret],
        );
        let (result, _) = run(&functions);
        assert!(matches!(result, Err(VMError::LocalOutOfFrame(1))));
    }

    #[test]
    fn callee_writes_caller_local_through_shared_address() {
        let functions = main_only(
            1,
            vec![
                Op::Mov(Stk(0), Val(3)),
                Op::Ref(Reg(0), Stk(0)),
                Op::Cal(Val(1)),
                Op::Print(Stk(0)),
                Op::Ret,
            ],
        );
        let functions = with_function(
            functions,
            1,
            1,
            vec![Op::Mov(Stk(0), Reg(0)), Op::Mov(Ptr(0), Val(42)), Op::Ret],
        );

        let (result, out) = run(&functions);
        result.unwrap();
        assert_eq!("42\n", out);
    }

    #[test]
    fn indirect_accesses_the_address_ref_computed() {
        let functions = main_only(
            2,
            vec![
                Op::Ref(Stk(1), Stk(0)),
                Op::Mov(Ptr(1), Val(11)),
                Op::Print(Stk(0)),
                Op::Print(Ptr(1)),
                Op::Ref(Reg(1), Ptr(1)),
                Op::Print(Reg(1)),
                Op::Print(Stk(1)),
                Op::Ret,
            ],
        );

        let (result, out) = run(&functions);
        result.unwrap();
        // frame pointer is 15 + 2, local A lives at 17
        assert_eq!("11\n11\n17\n17\n", out);
    }

    #[test]
    fn add_wraps() {
        let (result, out) = run(&main_only(
            0,
            vec![
                Op::Mov(Reg(0), Val(200)),
                Op::Mov(Reg(1), Val(100)),
                Op::Add(Reg(0), Reg(1)),
                Op::Print(Reg(0)),
                Op::Add(Reg(1), Reg(0)),
                Op::Print(Reg(1)),
                Op::Ret,
            ],
        ));
        result.unwrap();
        assert_eq!("44\n144\n", out);
    }

    #[test]
    fn not_is_self_inverse() {
        let mut machine = Machine::new(0, STACK_START, 0);
        for value in 0..=u8::MAX {
            machine.registers.set(2, value).unwrap();
            not(&mut machine, Reg(2)).unwrap();
            assert_eq!(!value, machine.registers.get(2).unwrap());
            not(&mut machine, Reg(2)).unwrap();
            assert_eq!(value, machine.registers.get(2).unwrap());
        }
    }

    #[test]
    fn equ_tests_for_zero() {
        let mut machine = Machine::new(0, STACK_START, 0);
        for value in 0..=u8::MAX {
            machine.registers.set(0, value).unwrap();
            equ(&mut machine, Reg(0)).unwrap();
            let expected = if value == 0 { 1 } else { 0 };
            assert_eq!(expected, machine.registers.get(0).unwrap());
        }
    }

    #[test]
    fn call_into_oversized_frame_overflows() {
        let functions = main_only(
            0,
            vec![
                Op::Print(Val(1)),
                Op::Cal(Val(1)),
                Op::Print(Val(2)),
                Op::Ret,
            ],
        );
        let functions =
            with_function(functions, 1, 250, vec![Op::Print(Val(3)), Op::Ret]);

        let (result, out) = run(&functions);
        assert!(matches!(result, Err(VMError::StackOverflow(1))));
        assert_eq!("1\n", out);
    }

    #[test]
    fn unbounded_recursion_overflows() {
        let functions = main_only(
            0,
            vec![Op::Print(Val(1)), Op::Cal(Val(1)), Op::Ret],
        );
        let functions = with_function(
            functions,
            1,
            3,
            vec![Op::Mov(Stk(2), Val(7)), Op::Cal(Val(1)), Op::Ret],
        );

        let (result, out) = run(&functions);
        assert!(matches!(result, Err(VMError::StackOverflow(1))));
        assert_eq!("1\n", out);
    }

    #[test]
    fn frame_filling_the_stack_exactly_fits() {
        // entry frame pointer 15, callee frame pointer 15 + 2 + 236 = 253,
        // callee header at 254 and 255
        let functions = main_only(0, vec![Op::Cal(Val(1)), Op::Ret]);
        let functions = with_function(
            functions,
            1,
            236,
            vec![Op::Mov(Stk(235), Val(1)), Op::Print(Stk(235)), Op::Ret],
        );

        let (result, out) = run(&functions);
        result.unwrap();
        assert_eq!("1\n", out);

        let functions = main_only(0, vec![Op::Cal(Val(1)), Op::Ret]);
        let functions = with_function(functions, 1, 237, vec![Op::Ret]);
        assert!(matches!(run(&functions).0, Err(VMError::StackOverflow(1))));
    }

    #[test]
    fn rejects_forbidden_operand_kinds() {
        let cases = [
            Op::Mov(Val(1), Val(2)),
            Op::Cal(Reg(1)),
            Op::Ref(Val(0), Stk(0)),
            Op::Ref(Reg(0), Reg(1)),
            Op::Ref(Reg(0), Val(1)),
            Op::Add(Reg(0), Val(1)),
            Op::Add(Stk(0), Reg(1)),
            Op::Not(Val(1)),
            Op::Equ(Stk(0)),
        ];

        for op in cases {
            let (result, out) =
                run(&main_only(1, vec![op, Op::Print(Val(1)), Op::Ret]));
            assert!(
                matches!(result, Err(VMError::InvalidOperand { .. })),
                "{} should be rejected, got {:?}",
                op,
                result
            );
            assert_eq!("", out);
        }
    }

    #[test]
    fn reports_operand_in_diagnostic() {
        let (result, _) =
            run(&main_only(0, vec![Op::Mov(Val(1), Val(2)), Op::Ret]));
        assert_eq!(
            "first argument to MOV must not be value typed",
            result.unwrap_err().to_string()
        );
    }

    #[test]
    fn rejects_scratch_registers() {
        let (result, _) =
            run(&main_only(0, vec![Op::Mov(Reg(4), Val(1)), Op::Ret]));
        assert!(matches!(result, Err(VMError::InvalidRegister(4))));

        let (result, _) = run(&main_only(0, vec![Op::Print(Reg(7)), Op::Ret]));
        assert!(matches!(result, Err(VMError::InvalidRegister(7))));
    }

    #[test]
    fn calling_absent_function_fails() {
        let (result, _) = run(&main_only(0, vec![Op::Cal(Val(3)), Op::Ret]));
        assert!(matches!(result, Err(VMError::UndefinedFunction(3))));
    }

    #[test]
    fn output_failure_is_fatal() {
        struct Broken;

        impl io::Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut vm = VM::new(&main_only(0, vec![Op::Print(Val(5)), Op::Ret]))
            .unwrap();
        assert!(matches!(vm.run(&mut Broken), Err(VMError::Output(_))));
    }
}

#[cfg(test)]
mod properties {
    use proptest::prelude::*;

    use crate::{arch::STACK_START, machine::Machine, op::Arg, vm::add};

    proptest! {
        #[test]
        fn add_is_sum_mod_256(a: u8, b: u8) {
            let mut machine = Machine::new(0, STACK_START, 0);
            machine.registers.set(0, a).unwrap();
            machine.registers.set(1, b).unwrap();
            add(&mut machine, Arg::Register(0), Arg::Register(1)).unwrap();
            prop_assert_eq!(
                ((a as u16 + b as u16) % 256) as u8,
                machine.registers.get(0).unwrap()
            );
            prop_assert_eq!(b, machine.registers.get(1).unwrap());
        }
    }
}
