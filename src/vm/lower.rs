use tracing::{debug, warn};

use crate::assembler::{CompiledProgram, OP_ADD_INT, OP_ASSIGN};
use crate::ast::{Instruction, LoweredOp, Operand};
use crate::value::Value;

use super::{Vm, VmError, VmResult};

// ── Lowering ─────────────────────────────────────────────────────────
//
// Only `=` and `+i` over constants and frame slots have a lowered form.
// Inputs are pushed right to left, outputs popped left to right.

fn lowerable(instr: &Instruction) -> bool {
    let arity = match instr.opcode {
        OP_ASSIGN => 2,
        OP_ADD_INT => 3,
        _ => return false,
    };
    instr.arity() == arity
        && matches!(instr.operands[0], Operand::Local(_))
        && instr.operands[1..]
            .iter()
            .all(|op| matches!(op, Operand::Constant(_) | Operand::Local(_)))
}

impl CompiledProgram {
    /// Build the opcode tier. Addresses that have no lowered form are
    /// recorded in `skipped`; running such a program lowered is refused.
    /// Calling this again is a no-op.
    pub fn lower(&mut self) -> &[LoweredOp] {
        if self.lowered.is_none() {
            let instructions = std::mem::take(&mut self.instructions);
            let mut ops = Vec::with_capacity(instructions.len() * 3);
            let mut skipped = Vec::new();

            for (addr, instr) in instructions.iter().enumerate() {
                if !lowerable(instr) {
                    skipped.push(addr);
                    continue;
                }
                for op in instr.operands[1..].iter().rev() {
                    match op {
                        Operand::Constant(v) => {
                            let idx = self.add_const(v.clone());
                            ops.push(LoweredOp::PushConst(idx));
                        }
                        Operand::Local(slot) => ops.push(LoweredOp::PushLocal(*slot)),
                        _ => {}
                    }
                }
                if instr.opcode == OP_ADD_INT {
                    ops.push(LoweredOp::AddInt);
                }
                if let Operand::Local(slot) = instr.operands[0] {
                    ops.push(LoweredOp::StoreLocal(slot));
                }
            }

            if !skipped.is_empty() {
                warn!(skipped = skipped.len(), first = skipped[0], "program only partially lowered");
            }
            debug!(ops = ops.len(), constants = self.constants.len(), "lowered program");

            self.instructions = instructions;
            self.skipped = skipped;
            self.lowered = Some(ops);
        }
        self.lowered.as_deref().unwrap_or_default()
    }
}

impl Vm<'_> {
    /// Execute the lowered form of the program in the root frame.
    pub fn run_lowered(&mut self) -> VmResult<()> {
        let program = self.program;
        let Some(ops) = program.lowered.as_deref() else {
            return Err(VmError::InvalidInstruction("program has not been lowered".into()));
        };
        if let Some(&first) = program.skipped.first() {
            return Err(VmError::PartialLowering { count: program.skipped.len(), first });
        }

        for op in ops {
            self.stats.instructions += 1;
            match *op {
                LoweredOp::PushConst(idx) => {
                    let v = program.constants.get(idx).cloned().ok_or_else(|| {
                        VmError::InvalidReference(format!("constant {} out of range", idx))
                    })?;
                    self.stack.push(v);
                }
                LoweredOp::PushLocal(slot) => {
                    let v = self.read(&Operand::Local(slot))?;
                    self.stack.push(v);
                }
                LoweredOp::StoreLocal(slot) => {
                    let v = self.stack.pop().unwrap_or_default();
                    self.write(&Operand::Local(slot), v)?;
                }
                LoweredOp::AddInt => {
                    let a = self.stack.pop().unwrap_or_default();
                    let b = self.stack.pop().unwrap_or_default();
                    match (a, b) {
                        (Value::Int(x), Value::Int(y)) => self.stack.push(Value::Int(x.wrapping_add(y))),
                        (a, b) => {
                            return Err(VmError::TypeMismatch(format!(
                                "add_int expects int operands, got {} and {}",
                                a.type_name(),
                                b.type_name()
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::assemble;
    use crate::host::BufferHost;
    use crate::vm::RunOptions;

    #[test]
    fn lower_assign_and_add() {
        let mut prog = assemble("= $1 #i10\n= $2 #i20\n+i $3 $1 $2").unwrap();
        let ops = prog.lower().to_vec();
        assert_eq!(
            ops,
            vec![
                LoweredOp::PushConst(0),
                LoweredOp::StoreLocal(1),
                LoweredOp::PushConst(1),
                LoweredOp::StoreLocal(2),
                LoweredOp::PushLocal(2),
                LoweredOp::PushLocal(1),
                LoweredOp::AddInt,
                LoweredOp::StoreLocal(3),
            ]
        );
        assert_eq!(prog.constants, vec![Value::Int(10), Value::Int(20)]);
        assert!(prog.skipped.is_empty());

        let mut vm = Vm::new(&prog, BufferHost::new(), RunOptions::new());
        vm.run_lowered().unwrap();
        assert_eq!(vm.local(3), Some(&Value::Int(30)));
        assert!(vm.stack().is_empty());
    }

    #[test]
    fn lowered_and_dispatch_agree() {
        let src = "= $1 #i-4\n+i $2 $1 #i9\n+i $3 $2 $2";
        let mut prog = assemble(src).unwrap();
        prog.lower();
        let mut lowered = Vm::new(&prog, BufferHost::new(), RunOptions::new());
        lowered.run_lowered().unwrap();

        let direct = assemble(&format!("{}\nexit $3", src)).unwrap();
        let mut vm = Vm::new(&direct, BufferHost::new(), RunOptions::new());
        let output = vm.run().unwrap();

        assert_eq!(lowered.local(3), Some(&Value::Int(10)));
        assert_eq!(output, Value::Int(10));
    }

    #[test]
    fn lowering_is_idempotent() {
        let mut prog = assemble("= $1 #i1").unwrap();
        prog.lower();
        prog.lower();
        assert_eq!(prog.constants.len(), 1);
    }

    #[test]
    fn partial_lowering_is_refused() {
        let mut prog = assemble("= $1 #i1\npln $1\n= $tmp #i2").unwrap();
        prog.lower();
        assert_eq!(prog.skipped, vec![1, 2]);
        let mut vm = Vm::new(&prog, BufferHost::new(), RunOptions::new());
        assert_eq!(vm.run_lowered(), Err(VmError::PartialLowering { count: 2, first: 1 }));
    }

    #[test]
    fn unlowered_program_is_refused() {
        let prog = assemble("= $1 #i1").unwrap();
        let mut vm = Vm::new(&prog, BufferHost::new(), RunOptions::new());
        assert!(matches!(vm.run_lowered(), Err(VmError::InvalidInstruction(_))));
    }

    #[test]
    fn lowered_type_mismatch_is_an_error() {
        let mut prog = assemble("+i $1 #s'x' #i1").unwrap();
        prog.lower();
        let mut vm = Vm::new(&prog, BufferHost::new(), RunOptions::new());
        assert!(matches!(vm.run_lowered(), Err(VmError::TypeMismatch(_))));
    }
}
