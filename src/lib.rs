//! A whole-program compiler for Compiscript, a small statically typed,
//! class-based imperative language.
//!
//! The crate takes the AST produced by an external parser and runs it
//! through four phases, strictly in order:
//!
//! 1. [`check`]: a two-pass semantic analyzer building a symbol
//!    environment and accumulating `[line:col]`-prefixed diagnostics.
//! 2. [`build_ir`]: lowering to a linear three-address IR with
//!    explicit labels, a content-addressed string pool and a synthetic
//!    `__toplevel` entry for free-standing statements.
//! 3. [`ir_opt`]: a deterministic, semantics-preserving pipeline of
//!    local simplification passes plus global string pooling and temp
//!    renumbering.
//! 4. [`codegen`]: naive but correct assembly emission for 32-bit
//!    cdecl x86 (NASM) and MIPS32 (SPIM/MARS).
//!
//! Phases communicate only through their output values; any non-empty
//! error list stops the pipeline at that phase boundary. Given the
//! same input, every phase emits byte-identical output, label names
//! and temp numbers included.

#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![allow(clippy::too_many_lines)]

use std::fmt;

pub mod build_ir;
pub mod check;
pub mod codegen;
pub mod ir_opt;
pub mod types;

pub use build_ir::{BuildError, lower_program};
pub use check::{Analysis, check_program};
pub use ir_opt::optimize;

use types::ast::Program;
use types::ir::IrProgram;

/// The assembly flavors the back end can produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
  /// 32-bit cdecl x86, NASM/Intel syntax.
  X86,
  /// MIPS32 for the SPIM/MARS simulators.
  Mips,
}

/// Why a [`compile`] run stopped before producing assembly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompileError {
  /// Semantic analysis reported errors; the pipeline stopped there.
  Check(Vec<String>),
  /// Lowering hit a violated precondition, which means a compiler bug
  /// (or the checker was skipped).
  Build(BuildError),
}

impl fmt::Display for CompileError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      CompileError::Check(errors) => {
        for (i, e) in errors.iter().enumerate() {
          if i > 0 { writeln!(f)? }
          write!(f, "{e}")?
        }
        Ok(())
      }
      CompileError::Build(e) => write!(f, "internal error: {e}"),
    }
  }
}

/// Check, lower and optimize a program, returning the final IR.
pub fn compile_ir(prog: &Program) -> Result<IrProgram, CompileError> {
  let analysis = check_program(prog);
  if !analysis.is_ok() {
    return Err(CompileError::Check(analysis.errors))
  }
  let mut ir = lower_program(prog).map_err(CompileError::Build)?;
  ir_opt::optimize(&mut ir);
  Ok(ir)
}

/// Run the whole pipeline down to assembly text for `target`.
pub fn compile(prog: &Program, target: Target) -> Result<String, CompileError> {
  let ir = compile_ir(prog)?;
  Ok(match target {
    Target::X86 => codegen::x86::emit_program(&ir),
    Target::Mips => codegen::mips::emit_program(&ir),
  })
}
