use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{debug, trace};

use crate::assembler::{CompiledProgram, mnemonic_for};
use crate::ast::{Instruction, Opcode, Operand};
use crate::host::Host;
use crate::value::{Value, ValueError};

mod exec;
mod lower;

// ── Layout constants ────────────────────────────────────────────────

pub const REG_ENV: usize = 0;
pub const REG_INPUT: usize = 1;
pub const REG_OUTPUT: usize = 2;
const REGISTER_COUNT: usize = 3;

pub const FRAME_SLOTS: usize = 10;
/// Incoming call arguments, as a list.
pub const SLOT_ARGS: usize = 1;
/// Outgoing return value.
pub const SLOT_RETURN: usize = 2;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VmError {
    #[error("invalid reference: {0}")]
    InvalidReference(String),
    #[error("index out of range: {index}/{len}")]
    IndexOutOfRange { index: i64, len: usize },
    #[error("invalid condition: expected bool, got {found}")]
    InvalidCondition { found: &'static str },
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("unresolved label: {0}")]
    UnresolvedLabel(String),
    #[error("return without a matching call")]
    EmptyCallStack,
    #[error("{mnemonic}: expected at least {expected} operand(s), got {got}")]
    MissingArguments { mnemonic: &'static str, expected: usize, got: usize },
    #[error("invalid instruction: {0}")]
    InvalidInstruction(String),
    #[error("test {name} failed: {left:?} <-> {right:?}")]
    TestFailed { name: String, left: String, right: String },
    #[error("program is only partially lowered: {count} instruction(s) skipped, first at {first}")]
    PartialLowering { count: usize, first: usize },
}

impl From<ValueError> for VmError {
    fn from(e: ValueError) -> Self {
        VmError::TypeMismatch(e.to_string())
    }
}

impl VmError {
    pub fn code(&self) -> &'static str {
        match self {
            VmError::InvalidReference(_) => "QX-R001",
            VmError::IndexOutOfRange { .. } => "QX-R002",
            VmError::InvalidCondition { .. } => "QX-R003",
            VmError::TypeMismatch(_) => "QX-R004",
            VmError::UnresolvedLabel(_) => "QX-R005",
            VmError::EmptyCallStack => "QX-R006",
            VmError::MissingArguments { .. } => "QX-R007",
            VmError::InvalidInstruction(_) => "QX-R008",
            VmError::TestFailed { .. } => "QX-R009",
            VmError::PartialLowering { .. } => "QX-R010",
        }
    }

    /// Errors a default operand may stand in for.
    fn is_recoverable_miss(&self) -> bool {
        matches!(self, VmError::IndexOutOfRange { .. } | VmError::InvalidReference(_))
    }
}

type VmResult<T> = Result<T, VmError>;

/// What a run reports to its host when it does not produce an output.
#[derive(Debug, Clone)]
pub struct RunError {
    pub error: VmError,
    /// Instruction that raised the error; `None` when it came from the
    /// final unwind.
    pub address: Option<usize>,
    pub timestamp: DateTime<Local>,
}

impl RunError {
    fn new(error: VmError, address: Option<usize>) -> Self {
        RunError { error, address, timestamp: Local::now() }
    }
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}](qxlang) runtime error: {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.error
        )
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

// ── Run configuration ───────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// First instruction to execute.
    pub start: usize,
    /// Register 1.
    pub input: Value,
    /// Exposed to scripts as `argsG`.
    pub args: Vec<String>,
}

impl RunOptions {
    pub fn new() -> Self {
        RunOptions::default()
    }

    pub fn with_start(mut self, start: usize) -> Self {
        self.start = start;
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

// ── Frames ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CallFrame {
    pub slots: Vec<Value>,
    pub temp: Value,
    /// Run LIFO when the frame exits.
    pub deferred: Vec<Instruction>,
}

impl CallFrame {
    fn new() -> Self {
        CallFrame { slots: vec![Value::Undefined; FRAME_SLOTS], temp: Value::Undefined, deferred: Vec::new() }
    }
}

#[derive(Debug, Clone, Serialize)]
struct CallRecord {
    return_address: usize,
    destination: Operand,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub instructions: usize,
    pub frames_pushed: usize,
    pub frames_popped: usize,
    pub deferred_run: usize,
}

/// Result of one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Advance,
    Jump(usize),
    Terminate,
}

// ── VM ──────────────────────────────────────────────────────────────

pub struct Vm<'a> {
    program: &'a CompiledProgram,
    host: Box<dyn Host + 'a>,
    regs: Vec<Value>,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    records: Vec<CallRecord>,
    seq: i64,
    test_seq: i64,
    pc: usize,
    start: usize,
    error_handler: Option<usize>,
    stats: RunStats,
}

impl<'a> Vm<'a> {
    pub fn new(program: &'a CompiledProgram, host: impl Host + 'a, options: RunOptions) -> Self {
        let mut env = BTreeMap::new();
        env.insert("undefined".to_string(), Value::Undefined);
        env.insert(
            "argsG".to_string(),
            Value::List(options.args.into_iter().map(Value::Str).collect()),
        );

        let mut regs = vec![Value::Undefined; REGISTER_COUNT];
        regs[REG_ENV] = Value::Map(env);
        regs[REG_INPUT] = options.input;

        let mut vm = Vm {
            program,
            host: Box::new(host),
            regs,
            stack: Vec::with_capacity(64),
            frames: Vec::with_capacity(16),
            records: Vec::with_capacity(16),
            seq: 0,
            test_seq: 0,
            pc: options.start,
            start: options.start,
            error_handler: None,
            stats: RunStats::default(),
        };
        vm.push_frame(CallFrame::new());
        vm
    }

    pub fn stats(&self) -> RunStats {
        self.stats
    }

    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    pub fn output(&self) -> &Value {
        &self.regs[REG_OUTPUT]
    }

    /// Slot of the innermost frame, if any frame is open.
    pub fn local(&self, slot: usize) -> Option<&Value> {
        self.frames.last().and_then(|f| f.slots.get(slot))
    }

    /// Execute the instruction list until `exit`, the end of the program or
    /// an unrecovered error.
    pub fn run(&mut self) -> Result<Value, RunError> {
        self.pc = self.start;
        let end = self.program.len();
        if self.start > end {
            let error = VmError::InvalidReference(format!(
                "start address {} outside program of {} instruction(s)",
                self.start, end
            ));
            let error = self.unwind_all().err().unwrap_or(error);
            return Err(RunError::new(error, None));
        }

        while self.pc < end {
            let addr = self.pc;
            let outcome = self.step(addr).and_then(|flow| match flow {
                Flow::Jump(target) if target > end => Err(VmError::InvalidReference(format!(
                    "jump target {} outside program of {} instruction(s)",
                    target, end
                ))),
                other => Ok(other),
            });

            match outcome {
                Ok(Flow::Advance) => self.pc += 1,
                Ok(Flow::Jump(target)) => self.pc = target,
                Ok(Flow::Terminate) => break,
                Err(error) => {
                    if let Some(handler) = self.error_handler {
                        debug!(address = addr, handler, %error, "redirecting to error handler");
                        self.pc = handler;
                        continue;
                    }
                    debug!(address = addr, %error, "run failed");
                    let error = self.unwind_all().err().unwrap_or(error);
                    return Err(RunError::new(error, Some(addr)));
                }
            }
        }

        self.unwind_all().map_err(|e| RunError::new(e, None))?;
        debug!(stats = ?self.stats, "run finished");
        Ok(self.regs[REG_OUTPUT].clone())
    }

    /// The single dispatch boundary: every handler invocation goes through
    /// here, and a panic inside one becomes a `TypeMismatch`.
    fn step(&mut self, addr: usize) -> VmResult<Flow> {
        let program = self.program;
        let instr = &program.instructions[addr];
        self.stats.instructions += 1;
        trace!(address = addr, opcode = instr.opcode, "dispatch");
        self.dispatch_guarded(instr, addr)
    }

    fn dispatch_guarded(&mut self, instr: &Instruction, addr: usize) -> VmResult<Flow> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(instr))) {
            Ok(result) => result,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown fault".to_string());
                Err(VmError::TypeMismatch(format!(
                    "runtime fault in '{}' at instruction {}: {}",
                    mnemonic(instr.opcode),
                    addr,
                    message
                )))
            }
        }
    }

    // ── Frames ──────────────────────────────────────────────────────

    fn push_frame(&mut self, frame: CallFrame) {
        self.frames.push(frame);
        self.stats.frames_pushed += 1;
    }

    fn pop_frame(&mut self) -> Option<CallFrame> {
        let frame = self.frames.pop()?;
        self.stats.frames_popped += 1;
        Some(frame)
    }

    fn frame(&self) -> VmResult<&CallFrame> {
        self.frames.last().ok_or(VmError::EmptyCallStack)
    }

    fn frame_mut(&mut self) -> VmResult<&mut CallFrame> {
        self.frames.last_mut().ok_or(VmError::EmptyCallStack)
    }

    /// Run the innermost frame's deferred instructions, most recently
    /// registered first. Stops at the first failure; the failing entry has
    /// already been removed.
    fn drain_deferred(&mut self) -> VmResult<()> {
        while let Some(instr) = self.frames.last_mut().and_then(|f| f.deferred.pop()) {
            self.stats.deferred_run += 1;
            trace!(opcode = instr.opcode, "deferred");
            self.dispatch_guarded(&instr, self.pc)?;
        }
        Ok(())
    }

    /// Close every open frame, innermost first. The first deferred failure
    /// is reported after all frames are closed.
    fn unwind_all(&mut self) -> VmResult<()> {
        let mut failure = None;
        while !self.frames.is_empty() {
            while let Err(e) = self.drain_deferred() {
                failure.get_or_insert(e);
            }
            self.pop_frame();
        }
        self.records.clear();
        failure.map_or(Ok(()), Err)
    }

    // ── Operand access ──────────────────────────────────────────────

    pub(crate) fn read(&mut self, op: &Operand) -> VmResult<Value> {
        match op {
            Operand::Constant(v) => Ok(v.clone()),
            Operand::Local(slot) => self
                .frame()?
                .slots
                .get(*slot)
                .cloned()
                .ok_or_else(|| slot_out_of_range(*slot)),
            Operand::Temp => Ok(self.frame()?.temp.clone()),
            Operand::StackPush | Operand::Discard | Operand::Print => Ok(Value::Undefined),
            Operand::StackPop => Ok(self.stack.pop().unwrap_or_default()),
            Operand::StackPeek => Ok(self.stack.last().cloned().unwrap_or_default()),
            Operand::Debug => Ok(Value::Str(self.debug_snapshot())),
            Operand::Sequence => {
                self.seq = self
                    .seq
                    .checked_add(1)
                    .ok_or_else(|| VmError::InvalidReference("sequence counter exhausted".into()))?;
                Ok(Value::Int(self.seq))
            }
            Operand::Clipboard => Ok(Value::Str(self.host.clipboard_text())),
            Operand::Label(_) | Operand::Address(_) | Operand::Relative(_) => {
                self.resolve_label(op).map(|addr| Value::Int(addr as i64))
            }
            Operand::Element { base, index, default } => {
                let base = self.read(base)?;
                let index = self.read(index)?;
                match (element(&base, &index), default) {
                    (Err(e), Some(d)) if e.is_recoverable_miss() => self.read(d),
                    (result, _) => result,
                }
            }
            Operand::Slice { base, start, end } => {
                let base = self.read(base)?;
                let start = self.read(start)?.to_int()?;
                let end = self.read(end)?.to_int()?;
                slice(&base, start, end)
            }
            Operand::MapEntry { base, key } => {
                let base = self.read(base)?;
                let key = self.read(key)?;
                map_entry(&base, &key)
            }
            Operand::Deferred { text, .. } => Err(VmError::InvalidReference(format!(
                "deferred expressions are not supported: @{}",
                text
            ))),
        }
    }

    pub(crate) fn write(&mut self, op: &Operand, value: Value) -> VmResult<()> {
        match op {
            Operand::Discard => {}
            Operand::Print => self.host.print_line(&value.to_text()),
            Operand::Debug => debug!(value = %value, "$debug"),
            Operand::Temp => self.frame_mut()?.temp = value,
            Operand::StackPush => self.stack.push(value),
            Operand::Sequence => self.seq = value.to_int()?,
            Operand::Clipboard => self.host.set_clipboard_text(&value.to_text()),
            Operand::Local(slot) => {
                let cell = self
                    .frame_mut()?
                    .slots
                    .get_mut(*slot)
                    .ok_or_else(|| slot_out_of_range(*slot))?;
                *cell = value;
            }
            other => {
                return Err(VmError::InvalidReference(format!("operand is not writable: {:?}", other)));
            }
        }
        Ok(())
    }

    /// Resolve a label operand to an instruction address. Relative labels
    /// are taken from the current instruction pointer; any other operand is
    /// read and its value interpreted as an address or label name.
    pub(crate) fn resolve_label(&mut self, op: &Operand) -> VmResult<usize> {
        match op {
            Operand::Address(addr) => Ok(*addr),
            Operand::Label(name) => self.label_address(name),
            Operand::Relative(offset) => self.relative(*offset),
            other => match self.read(other)? {
                Value::Int(n) if n >= 0 => Ok(n as usize),
                Value::Str(s) => {
                    let name = s.strip_prefix(':').unwrap_or(&s);
                    match name.parse::<i64>() {
                        Ok(offset) if name.starts_with(['+', '-']) => self.relative(offset),
                        _ => self.label_address(name),
                    }
                }
                v => Err(VmError::InvalidReference(format!("not a label: {}", v))),
            },
        }
    }

    fn label_address(&self, name: &str) -> VmResult<usize> {
        self.program.label(name).ok_or_else(|| VmError::UnresolvedLabel(name.to_string()))
    }

    fn relative(&self, offset: i64) -> VmResult<usize> {
        (self.pc as i64)
            .checked_add(offset)
            .and_then(|target| usize::try_from(target).ok())
            .ok_or_else(|| VmError::InvalidReference(format!("relative jump {:+} from {}", offset, self.pc)))
    }

    fn debug_snapshot(&self) -> String {
        let snapshot = serde_json::json!({
            "pc": self.pc,
            "registers": self.regs,
            "stack": self.stack,
            "frames": self.frames,
            "calls": self.records,
            "seq": self.seq,
            "errorHandler": self.error_handler,
            "stats": self.stats,
        });
        serde_json::to_string_pretty(&snapshot).unwrap_or_default()
    }
}

pub(crate) fn mnemonic(opcode: Opcode) -> &'static str {
    mnemonic_for(opcode).unwrap_or("?")
}

fn slot_out_of_range(slot: usize) -> VmError {
    VmError::InvalidReference(format!("local slot ${} out of range (frames hold {})", slot, FRAME_SLOTS))
}

fn checked_index(index: i64, len: usize) -> VmResult<usize> {
    if index < 0 || index as usize >= len {
        Err(VmError::IndexOutOfRange { index, len })
    } else {
        Ok(index as usize)
    }
}

/// Bounds- or key-checked single element access.
pub(crate) fn element(base: &Value, index: &Value) -> VmResult<Value> {
    match base {
        Value::Undefined => Err(VmError::InvalidReference("cannot index an undefined value".into())),
        Value::List(items) => Ok(items[checked_index(index.to_int()?, items.len())?].clone()),
        Value::Bytes(bytes) => Ok(Value::Byte(bytes[checked_index(index.to_int()?, bytes.len())?])),
        Value::Str(s) => {
            let i = index.to_int()?;
            let len = s.chars().count();
            let i = checked_index(i, len)?;
            s.chars().nth(i).map(Value::Rune).ok_or(VmError::IndexOutOfRange { index: i as i64, len })
        }
        Value::Map(_) => map_entry(base, index),
        other => Err(VmError::TypeMismatch(format!("cannot index a {}", other.type_name()))),
    }
}

fn slice_bounds(start: i64, end: i64, len: usize) -> VmResult<(usize, usize)> {
    if start < 0 || start as usize > len {
        return Err(VmError::IndexOutOfRange { index: start, len });
    }
    if end < start || end as usize > len {
        return Err(VmError::IndexOutOfRange { index: end, len });
    }
    Ok((start as usize, end as usize))
}

fn slice(base: &Value, start: i64, end: i64) -> VmResult<Value> {
    match base {
        Value::List(items) => {
            let (s, e) = slice_bounds(start, end, items.len())?;
            Ok(Value::List(items[s..e].to_vec()))
        }
        Value::Bytes(bytes) => {
            let (s, e) = slice_bounds(start, end, bytes.len())?;
            Ok(Value::Bytes(bytes[s..e].to_vec()))
        }
        Value::Str(text) => {
            let chars: Vec<char> = text.chars().collect();
            let (s, e) = slice_bounds(start, end, chars.len())?;
            Ok(Value::Str(chars[s..e].iter().collect()))
        }
        Value::Undefined => Err(VmError::InvalidReference("cannot slice an undefined value".into())),
        other => Err(VmError::TypeMismatch(format!("cannot slice a {}", other.type_name()))),
    }
}

fn map_entry(base: &Value, key: &Value) -> VmResult<Value> {
    match base {
        Value::Map(fields) => {
            let key = key.to_text();
            fields
                .get(&key)
                .cloned()
                .ok_or_else(|| VmError::InvalidReference(format!("missing key '{}'", key)))
        }
        Value::Undefined => Err(VmError::InvalidReference("cannot look up a key in an undefined value".into())),
        other => Err(VmError::TypeMismatch(format!("cannot look up a key in a {}", other.type_name()))),
    }
}

// ── Tests ────────────────────────────────────────────────────────────
