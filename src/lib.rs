//! Lepus: a small register-based scripting VM.
//!
//! The pipeline is `parse` -> `semantic::analyze` -> `codegen::compile_chunk`,
//! wrapped by [`compile`]. The result executes in a [`vm::Context`], or
//! serializes through [`binary::encode`] for ahead-of-time delivery.

pub mod ast;
pub mod binary;
pub mod bridge;
pub mod builtin;
pub mod bytecode;
pub mod codegen;
pub mod lexer;
pub mod parser;
pub mod semantic;
pub mod value;
pub mod vm;

pub use bytecode::CompileOptions;
pub use codegen::CompiledScript;
pub use value::Value;
pub use vm::{CallArgs, Context, RuntimeError};

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error(transparent)]
    Parse(#[from] parser::ParseError),
    #[error(transparent)]
    Semantic(#[from] semantic::SemanticError),
    #[error(transparent)]
    Codegen(#[from] codegen::CodegenError),
}

/// Compile one source unit end to end.
pub fn compile(source: &str, options: &CompileOptions) -> Result<CompiledScript, CompileError> {
    let mut chunk = parser::parse(source, &options.source_name)?;
    semantic::analyze(&mut chunk, options.closure_fix, options.strict)?;
    Ok(codegen::compile_chunk(&chunk, source, options)?)
}

/// Compile and run in a fresh context.
pub fn eval(source: &str) -> Result<Value, EvalError> {
    let script = compile(source, &CompileOptions::default())?;
    Ok(Context::new().execute(&script)?)
}

#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_runs_a_chunk() {
        assert_eq!(eval("var x = 4; x * x;").unwrap(), Value::Int64(16));
    }

    #[test]
    fn compile_surfaces_stage_errors() {
        assert!(matches!(
            eval("let a = 1; let a = 2;"),
            Err(EvalError::Compile(CompileError::Semantic(_)))
        ));
        assert!(matches!(
            eval("var = ;"),
            Err(EvalError::Compile(CompileError::Parse(_)))
        ));
    }
}
