use std::time::Duration;

use tracing::debug;

use crate::assembler::*;
use crate::ast::{Instruction, Operand};
use crate::value::Value;

use super::{
    element, mnemonic, CallFrame, CallRecord, Flow, Vm, VmError, VmResult, REG_ENV, REG_INPUT,
    REG_OUTPUT, SLOT_ARGS, SLOT_RETURN,
};

/// Where an omitted output operand writes.
static TEMP: Operand = Operand::Temp;

/// Opcodes whose effect is a change of control; these cannot be deferred.
const CONTROL_FLOW: &[u64] = &[OP_GOTO, OP_IF, OP_CALL, OP_RET, OP_EXIT, OP_DEFER, OP_ON_ERROR];

fn need(instr: &Instruction, expected: usize) -> VmResult<()> {
    if instr.arity() < expected {
        return Err(VmError::MissingArguments {
            mnemonic: mnemonic(instr.opcode),
            expected,
            got: instr.arity(),
        });
    }
    Ok(())
}

fn out(instr: &Instruction, idx: usize) -> &Operand {
    instr.operands.get(idx).unwrap_or(&TEMP)
}

impl Vm<'_> {
    pub(crate) fn dispatch(&mut self, instr: &Instruction) -> VmResult<Flow> {
        let ops = &instr.operands;

        match instr.opcode {
            OP_INVALID => {
                let detail: Vec<String> = ops
                    .iter()
                    .map(|op| self.read(op).map(|v| v.to_text()))
                    .collect::<VmResult<_>>()?;
                return Err(VmError::InvalidInstruction(detail.join(" ")));
            }

            OP_VERSION => {
                let version = self.host.version();
                self.write(out(instr, 0), Value::Str(version))?;
            }

            OP_PASS => {}

            OP_TEST_BY_TEXT => {
                need(instr, 2)?;
                let left = self.read(&ops[0])?.to_text();
                let right = self.read(&ops[1])?.to_text();
                let name = match ops.get(2) {
                    Some(op) => self.read(op)?.to_text(),
                    None => {
                        self.test_seq += 1;
                        self.test_seq.to_string()
                    }
                };
                let name = match ops.get(3) {
                    Some(op) => format!("{}({})", name, self.read(op)?.to_text()),
                    None => name,
                };
                if left != right {
                    return Err(VmError::TestFailed { name, left, right });
                }
                self.host.print_line(&format!("test {} passed", name));
            }

            OP_GOTO => {
                need(instr, 1)?;
                return Ok(Flow::Jump(self.resolve_label(&ops[0])?));
            }

            OP_ON_ERROR => {
                self.error_handler = match ops.first() {
                    Some(op) => {
                        let addr = self.resolve_label(op)?;
                        if addr > self.program.len() {
                            return Err(VmError::InvalidReference(format!(
                                "error handler {} outside program",
                                addr
                            )));
                        }
                        Some(addr)
                    }
                    None => None,
                };
                debug!(handler = ?self.error_handler, "error handler set");
            }

            OP_DEFER => {
                need(instr, 1)?;
                let target = self.read(&ops[0])?.to_text();
                let opcode = opcode_for(&target)
                    .ok_or_else(|| VmError::InvalidInstruction(format!("cannot defer unknown instruction '{}'", target)))?;
                if CONTROL_FLOW.contains(&opcode) {
                    return Err(VmError::InvalidInstruction(format!("'{}' cannot be deferred", target)));
                }
                let deferred = Instruction::new(opcode, ops[1..].to_vec());
                self.frame_mut()?.deferred.push(deferred);
            }

            OP_EXIT => {
                if let Some(op) = ops.first() {
                    let v = self.read(op)?;
                    self.regs[REG_OUTPUT] = v;
                }
                return Ok(Flow::Terminate);
            }

            OP_PUSH => {
                need(instr, 1)?;
                let v = self.read(&ops[0])?;
                self.stack.push(v);
            }

            OP_PEEK => {
                let v = self.stack.last().cloned().unwrap_or_default();
                self.write(out(instr, 0), v)?;
            }

            OP_POP => {
                let v = self.stack.pop().unwrap_or_default();
                self.write(out(instr, 0), v)?;
            }

            OP_ASSIGN => {
                need(instr, 2)?;
                let v = self.read(&ops[1])?;
                self.write(&ops[0], v)?;
            }

            OP_IF => {
                need(instr, 2)?;
                let taken = match self.read(&ops[0])? {
                    Value::Bool(b) => b,
                    other => return Err(VmError::InvalidCondition { found: other.type_name() }),
                };
                if taken {
                    return Ok(Flow::Jump(self.resolve_label(&ops[1])?));
                }
                if let Some(otherwise) = ops.get(2) {
                    return Ok(Flow::Jump(self.resolve_label(otherwise)?));
                }
            }

            OP_LT => {
                need(instr, 3)?;
                let a = self.read(&ops[1])?;
                let b = self.read(&ops[2])?;
                self.write(&ops[0], Value::Bool(a.less_than(&b)?))?;
            }

            OP_CALL => {
                need(instr, 2)?;
                let target = self.resolve_label(&ops[1])?;
                let args = ops[2..].iter().map(|op| self.read(op)).collect::<VmResult<Vec<_>>>()?;

                self.records.push(CallRecord { return_address: self.pc, destination: ops[0].clone() });
                let mut frame = CallFrame::new();
                if !args.is_empty() {
                    frame.slots[SLOT_ARGS] = Value::List(args);
                }
                self.push_frame(frame);
                return Ok(Flow::Jump(target));
            }

            OP_RET => {
                if self.records.is_empty() {
                    return Err(VmError::EmptyCallStack);
                }
                if let Some(op) = ops.first() {
                    let v = self.read(op)?;
                    self.frame_mut()?.slots[SLOT_RETURN] = v;
                }
                self.drain_deferred()?;

                let frame = self.pop_frame().ok_or(VmError::EmptyCallStack)?;
                let record = self.records.pop().ok_or(VmError::EmptyCallStack)?;
                let result = frame.slots.into_iter().nth(SLOT_RETURN).unwrap_or_default();
                self.write(&record.destination, result)?;
                return Ok(Flow::Jump(record.return_address + 1));
            }

            OP_GET_ITEM => {
                need(instr, 3)?;
                let base = self.read(&ops[1])?;
                let index = self.read(&ops[2])?;
                let v = match (element(&base, &index), ops.get(3)) {
                    (Err(e), Some(default)) if e.is_recoverable_miss() => self.read(default)?,
                    (result, _) => result?,
                };
                self.write(&ops[0], v)?;
            }

            OP_NOW => {
                let now = self.host.now();
                self.write(out(instr, 0), Value::Time(now))?;
            }

            OP_PLN => {
                let parts = ops.iter().map(|op| self.read(op).map(|v| v.to_text())).collect::<VmResult<Vec<_>>>()?;
                self.host.print_line(&parts.join(" "));
            }

            OP_PLO => {
                let parts = ops
                    .iter()
                    .map(|op| self.read(op).map(|v| format!("({}){}", v.type_name(), v)))
                    .collect::<VmResult<Vec<_>>>()?;
                self.host.print_line(&parts.join(", "));
            }

            OP_SLEEP => {
                need(instr, 1)?;
                let secs = self.read(&ops[0])?.to_float()?;
                if secs.is_finite() && secs > 0.0 {
                    self.host.sleep(Duration::from_secs_f64(secs));
                }
            }

            OP_GET_CLIP => {
                let text = self.host.clipboard_text();
                self.write(out(instr, 0), Value::Str(text))?;
            }

            OP_SET_CLIP => {
                need(instr, 1)?;
                let text = self.read(&ops[0])?.to_text();
                self.host.set_clipboard_text(&text);
            }

            OP_GET_ENV => {
                need(instr, 2)?;
                let key = self.read(&ops[1])?.to_text();
                let v = self.host.env_var(&key).unwrap_or_default();
                self.write(&ops[0], Value::Str(v))?;
            }

            OP_SET_ENV => {
                need(instr, 2)?;
                let key = self.read(&ops[0])?.to_text();
                let value = self.read(&ops[1])?.to_text();
                self.host.set_env_var(&key, &value);
            }

            OP_REMOVE_ENV => {
                need(instr, 1)?;
                let key = self.read(&ops[0])?.to_text();
                self.host.remove_env_var(&key);
            }

            OP_GET_ARGS => {
                let args = match &self.regs[REG_ENV] {
                    Value::Map(env) => env.get("argsG").cloned().unwrap_or_default(),
                    _ => Value::Undefined,
                };
                self.write(out(instr, 0), args)?;
            }

            OP_GET_INPUT => {
                let input = self.regs[REG_INPUT].clone();
                self.write(out(instr, 0), input)?;
            }

            OP_SYSTEM_CMD => {
                need(instr, 2)?;
                let cmd = self.read(&ops[1])?.to_text();
                let args = ops[2..].iter().map(|op| self.read(op).map(|v| v.to_text())).collect::<VmResult<Vec<_>>>()?;
                let result = self.host.system_cmd(&cmd, &args);
                self.write(&ops[0], result)?;
            }

            OP_INC_INT | OP_DEC_INT => {
                need(instr, 1)?;
                let n = self.read(&ops[0])?.to_int()?;
                let n = if instr.opcode == OP_INC_INT { n.wrapping_add(1) } else { n.wrapping_sub(1) };
                self.write(&ops[0], Value::Int(n))?;
            }

            OP_ADD_INT => {
                need(instr, 3)?;
                let a = self.read(&ops[1])?;
                let b = self.read(&ops[2])?;
                let sum = match (&a, &b) {
                    (Value::Int(x), Value::Int(y)) => x.wrapping_add(*y),
                    _ => {
                        return Err(VmError::TypeMismatch(format!(
                            "+i expects int operands, got {} and {}",
                            a.type_name(),
                            b.type_name()
                        )));
                    }
                };
                self.write(&ops[0], Value::Int(sum))?;
            }

            OP_SUB_TIME => {
                need(instr, 3)?;
                let a = self.read(&ops[1])?;
                let b = self.read(&ops[2])?;
                let (Value::Time(t1), Value::Time(t2)) = (&a, &b) else {
                    return Err(VmError::TypeMismatch(format!(
                        "-t expects time operands, got {} and {}",
                        a.type_name(),
                        b.type_name()
                    )));
                };
                let delta = *t1 - *t2;
                let secs = delta
                    .num_nanoseconds()
                    .map(|ns| ns as f64 / 1e9)
                    .unwrap_or_else(|| delta.num_seconds() as f64);
                self.write(&ops[0], Value::Float(secs))?;
            }

            other => {
                return Err(VmError::InvalidInstruction(format!("unknown opcode {}", other)));
            }
        }

        Ok(Flow::Advance)
    }
}
