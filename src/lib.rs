pub mod assembler;
pub mod ast;
pub mod diagnostic;
pub mod host;
pub mod lexer;
pub mod parser;
pub mod value;
pub mod vm;

pub use assembler::{CompileError, CompiledProgram, assemble};
pub use host::{BufferHost, Host, SystemHost};
pub use value::Value;
pub use vm::{RunError, RunOptions, Vm, VmError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Run(#[from] RunError),
}

/// Assemble and run `source` to completion, returning the output register.
pub fn run_source(source: &str, host: impl Host, options: RunOptions) -> Result<Value, Error> {
    let program = assemble(source)?;
    let mut vm = Vm::new(&program, host, options);
    Ok(vm.run()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_source_returns_output() {
        let out = run_source("+i $1 #i2 #i3\nexit $1", BufferHost::new(), RunOptions::new()).unwrap();
        assert_eq!(out, Value::Int(5));
    }

    #[test]
    fn run_source_separates_error_kinds() {
        let err = run_source("nope", BufferHost::new(), RunOptions::new()).unwrap_err();
        assert!(matches!(err, Error::Compile(CompileError::UnknownInstruction { .. })));

        let err = run_source("ret", BufferHost::new(), RunOptions::new()).unwrap_err();
        assert!(matches!(err, Error::Run(RunError { error: VmError::EmptyCallStack, .. })));
    }
}
