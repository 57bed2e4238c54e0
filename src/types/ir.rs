//! The linear three-address IR produced by the builder, rewritten by
//! the optimizer and consumed by the backends.
//!
//! Operand names are opaque keys to the backends: every `Temp` observed
//! in a function body gets its own stack slot regardless of any reuse
//! the builder's temp pool performed. String-pool labels are indices
//! into [`IrProgram::strings`] and print as `str{n}`; payloads carry
//! their trailing NUL byte.

use std::fmt;
use std::rc::Rc;

use smallvec::{SmallVec, smallvec};

use crate::mk_id;

mk_id! {
  /// A jump label, program-unique, printed `L{n}`.
  LabelId,
  /// A string-pool entry, printed `str{n}`.
  StrId,
}

impl fmt::Display for LabelId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "L{}", self.0) }
}

impl fmt::Display for StrId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "str{}", self.0) }
}

/// An instruction operand.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operand {
  /// An integer constant.
  Int(i32),
  /// A pointer to a NUL-terminated string-pool entry.
  Str(StrId),
  /// A virtual temporary, function-scoped.
  Temp(u32),
  /// A named local variable.
  Local(Rc<str>),
  /// A named formal parameter.
  Param(Rc<str>),
}

impl Operand {
  /// Whether this operand names a storage slot (as opposed to a
  /// constant): a temp, local or parameter.
  #[must_use] pub fn is_slot(&self) -> bool {
    matches!(self, Operand::Temp(_) | Operand::Local(_) | Operand::Param(_))
  }
}

impl fmt::Display for Operand {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Operand::Int(v) => write!(f, "{v}"),
      Operand::Str(s) => write!(f, "&{s}"),
      Operand::Temp(t) => write!(f, "%t{t}"),
      Operand::Local(name) => write!(f, "${name}"),
      Operand::Param(name) => write!(f, "@{name}"),
    }
  }
}

/// Arithmetic opcodes of [`Instr::Bin`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArithOp {
  /// `+`
  Add,
  /// `-`
  Sub,
  /// `*`
  Mul,
  /// `/`
  Div,
  /// `%`
  Rem,
}

impl ArithOp {
  /// Whether operand order is irrelevant (used to normalize CSE keys).
  #[must_use] pub fn commutes(self) -> bool { matches!(self, ArithOp::Add | ArithOp::Mul) }

  /// Constant-fold the operation with i32 wrapping semantics, matching
  /// the 32-bit targets. Division and remainder by zero do not fold.
  #[must_use] pub fn apply(self, a: i32, b: i32) -> Option<i32> {
    match self {
      ArithOp::Add => Some(a.wrapping_add(b)),
      ArithOp::Sub => Some(a.wrapping_sub(b)),
      ArithOp::Mul => Some(a.wrapping_mul(b)),
      ArithOp::Div => (b != 0).then(|| a.wrapping_div(b)),
      ArithOp::Rem => (b != 0).then(|| a.wrapping_rem(b)),
    }
  }
}

impl fmt::Display for ArithOp {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      ArithOp::Add => "+", ArithOp::Sub => "-", ArithOp::Mul => "*",
      ArithOp::Div => "/", ArithOp::Rem => "%",
    })
  }
}

/// Comparison opcodes of [`Instr::Cmp`] and [`Instr::CJump`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CmpOp {
  /// `==`
  Eq,
  /// `!=`
  Ne,
  /// `<`
  Lt,
  /// `<=`
  Le,
  /// `>`
  Gt,
  /// `>=`
  Ge,
}

impl CmpOp {
  /// Evaluate the comparison on constants.
  #[must_use] pub fn apply(self, a: i32, b: i32) -> bool {
    match self {
      CmpOp::Eq => a == b,
      CmpOp::Ne => a != b,
      CmpOp::Lt => a < b,
      CmpOp::Le => a <= b,
      CmpOp::Gt => a > b,
      CmpOp::Ge => a >= b,
    }
  }

  /// The result when both operands are the same value (`x op x`).
  #[must_use] pub fn on_equal_operands(self) -> bool {
    matches!(self, CmpOp::Eq | CmpOp::Le | CmpOp::Ge)
  }

  /// Whether operand order is irrelevant.
  #[must_use] pub fn commutes(self) -> bool { matches!(self, CmpOp::Eq | CmpOp::Ne) }
}

impl fmt::Display for CmpOp {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      CmpOp::Eq => "==", CmpOp::Ne => "!=",
      CmpOp::Lt => "<", CmpOp::Le => "<=", CmpOp::Gt => ">", CmpOp::Ge => ">=",
    })
  }
}

/// Unary opcodes of [`Instr::Un`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOp {
  /// Arithmetic negation.
  Neg,
  /// Logical not: nonzero becomes 0, zero becomes 1.
  Not,
}

impl UnOp {
  /// Constant-fold the operation.
  #[must_use] pub fn apply(self, a: i32) -> i32 {
    match self {
      UnOp::Neg => a.wrapping_neg(),
      UnOp::Not => i32::from(a == 0),
    }
  }
}

/// A three-address instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Instr {
  /// A jump target.
  Label(LabelId),
  /// An unconditional jump.
  Jump(LabelId),
  /// A two-way conditional jump.
  CJump {
    /// The comparison.
    op: CmpOp,
    /// Left operand.
    a: Operand,
    /// Right operand.
    b: Operand,
    /// Target when the comparison holds.
    if_true: LabelId,
    /// Target when it does not.
    if_false: LabelId,
  },
  /// `dst = src`.
  Move {
    /// Destination slot.
    dst: Operand,
    /// Source operand.
    src: Operand,
  },
  /// `dst = a op b` arithmetic.
  Bin {
    /// The opcode.
    op: ArithOp,
    /// Destination slot.
    dst: Operand,
    /// Left operand.
    a: Operand,
    /// Right operand.
    b: Operand,
  },
  /// `dst = op(a)` unary.
  Un {
    /// The opcode.
    op: UnOp,
    /// Destination slot.
    dst: Operand,
    /// The operand.
    a: Operand,
  },
  /// `dst = (a op b) ? 1 : 0`, materializing the boolean.
  Cmp {
    /// The comparison.
    op: CmpOp,
    /// Destination slot.
    dst: Operand,
    /// Left operand.
    a: Operand,
    /// Right operand.
    b: Operand,
  },
  /// A call; `dst` is absent when the result is discarded.
  Call {
    /// Destination slot for the return value, if kept.
    dst: Option<Operand>,
    /// Callee name (user function, `Class__method`, or a runtime
    /// helper such as `print`, `malloc`, `__concat`).
    func: Rc<str>,
    /// Actual arguments.
    args: Vec<Operand>,
  },
  /// Return from the current function.
  Ret(Option<Operand>),
  /// `dst = *(base + offset)`, a field read.
  Load {
    /// Destination slot.
    dst: Operand,
    /// Object pointer.
    base: Operand,
    /// Byte offset.
    offset: i32,
  },
  /// `*(base + offset) = src`, a field write.
  Store {
    /// Object pointer.
    base: Operand,
    /// Byte offset.
    offset: i32,
    /// The stored value.
    src: Operand,
  },
  /// `dst = *(base + 4 + index*4)`, an array element read (one word at
  /// offset 0 holds the length).
  LoadI {
    /// Destination slot.
    dst: Operand,
    /// Array pointer.
    base: Operand,
    /// Element index.
    index: Operand,
  },
  /// `*(base + 4 + index*4) = src`, an array element write.
  StoreI {
    /// Array pointer.
    base: Operand,
    /// Element index.
    index: Operand,
    /// The stored value.
    src: Operand,
  },
}

impl Instr {
  /// The operands this instruction reads.
  #[must_use] pub fn uses(&self) -> SmallVec<[&Operand; 3]> {
    match self {
      Instr::Move { src, .. } => smallvec![src],
      Instr::Bin { a, b, .. } | Instr::Cmp { a, b, .. } | Instr::CJump { a, b, .. } =>
        smallvec![a, b],
      Instr::Un { a, .. } => smallvec![a],
      Instr::Call { args, .. } => args.iter().collect(),
      Instr::Ret(Some(v)) => smallvec![v],
      Instr::Load { base, .. } => smallvec![base],
      Instr::Store { base, src, .. } => smallvec![base, src],
      Instr::LoadI { base, index, .. } => smallvec![base, index],
      Instr::StoreI { base, index, src } => smallvec![base, index, src],
      Instr::Label(_) | Instr::Jump(_) | Instr::Ret(None) => SmallVec::new(),
    }
  }

  /// The destination slot this instruction writes, if any.
  #[must_use] pub fn def(&self) -> Option<&Operand> {
    match self {
      Instr::Move { dst, .. } | Instr::Bin { dst, .. } | Instr::Un { dst, .. }
      | Instr::Cmp { dst, .. } | Instr::Load { dst, .. } | Instr::LoadI { dst, .. } =>
        Some(dst),
      Instr::Call { dst, .. } => dst.as_ref(),
      _ => None,
    }
  }

  /// Whether the instruction writes memory, transfers control, or
  /// otherwise must survive dead-code elimination.
  #[must_use] pub fn has_side_effect(&self) -> bool {
    matches!(self,
      Instr::Store { .. } | Instr::StoreI { .. } | Instr::Ret(_)
      | Instr::Jump(_) | Instr::CJump { .. } | Instr::Label(_) | Instr::Call { .. })
  }

  /// Visit every operand, destinations included.
  pub fn for_each_operand(&self, f: &mut impl FnMut(&Operand)) {
    match self {
      Instr::Label(_) | Instr::Jump(_) => {}
      Instr::CJump { a, b, .. } => { f(a); f(b) }
      Instr::Move { dst, src } => { f(dst); f(src) }
      Instr::Bin { dst, a, b, .. } | Instr::Cmp { dst, a, b, .. } => { f(dst); f(a); f(b) }
      Instr::Un { dst, a, .. } => { f(dst); f(a) }
      Instr::Call { dst, args, .. } => {
        if let Some(dst) = dst { f(dst) }
        for a in args { f(a) }
      }
      Instr::Ret(v) => if let Some(v) = v { f(v) },
      Instr::Load { dst, base, .. } => { f(dst); f(base) }
      Instr::Store { base, src, .. } => { f(base); f(src) }
      Instr::LoadI { dst, base, index } => { f(dst); f(base); f(index) }
      Instr::StoreI { base, index, src } => { f(base); f(index); f(src) }
    }
  }

  /// Rewrite every operand in place, destinations included.
  pub fn for_each_operand_mut(&mut self, f: &mut impl FnMut(&mut Operand)) {
    match self {
      Instr::Label(_) | Instr::Jump(_) => {}
      Instr::CJump { a, b, .. } => { f(a); f(b) }
      Instr::Move { dst, src } => { f(dst); f(src) }
      Instr::Bin { dst, a, b, .. } | Instr::Cmp { dst, a, b, .. } => { f(dst); f(a); f(b) }
      Instr::Un { dst, a, .. } => { f(dst); f(a) }
      Instr::Call { dst, args, .. } => {
        if let Some(dst) = dst { f(dst) }
        for a in args { f(a) }
      }
      Instr::Ret(v) => if let Some(v) = v { f(v) },
      Instr::Load { dst, base, .. } => { f(dst); f(base) }
      Instr::Store { base, src, .. } => { f(base); f(src) }
      Instr::LoadI { dst, base, index } => { f(dst); f(base); f(index) }
      Instr::StoreI { base, index, src } => { f(base); f(index); f(src) }
    }
  }
}

impl fmt::Display for Instr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Instr::Label(l) => write!(f, "{l}:"),
      Instr::Jump(l) => write!(f, "  goto {l}"),
      Instr::CJump { op, a, b, if_true, if_false } =>
        write!(f, "  if {a} {op} {b} goto {if_true} else {if_false}"),
      Instr::Move { dst, src } => write!(f, "  {dst} = {src}"),
      Instr::Bin { op, dst, a, b } => write!(f, "  {dst} = {a} {op} {b}"),
      Instr::Un { op: UnOp::Neg, dst, a } => write!(f, "  {dst} = neg({a})"),
      Instr::Un { op: UnOp::Not, dst, a } => write!(f, "  {dst} = not({a})"),
      Instr::Cmp { op, dst, a, b } => write!(f, "  {dst} = ({a} {op} {b})"),
      Instr::Call { dst, func, args } => {
        match dst {
          None => write!(f, "  call {func}(")?,
          Some(dst) => write!(f, "  {dst} = call {func}(")?,
        }
        for (i, a) in args.iter().enumerate() {
          if i > 0 { write!(f, ", ")? }
          write!(f, "{a}")?
        }
        write!(f, ")")
      }
      Instr::Ret(None) => write!(f, "  return"),
      Instr::Ret(Some(v)) => write!(f, "  return {v}"),
      Instr::Load { dst, base, offset } => write!(f, "  {dst} = *({base} + {offset})"),
      Instr::Store { base, offset, src } => write!(f, "  *({base} + {offset}) = {src}"),
      Instr::LoadI { dst, base, index } => write!(f, "  {dst} = *({base} + 4 + {index}*4)"),
      Instr::StoreI { base, index, src } => write!(f, "  *({base} + 4 + {index}*4) = {src}"),
    }
  }
}

/// One compiled function body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IrFunction {
  /// IR-level name; methods are `Class__method`.
  pub name: String,
  /// Formal parameter names, `this` first for methods.
  pub params: Vec<Rc<str>>,
  /// The instruction list.
  pub body: Vec<Instr>,
  /// Named locals declared in the body, in first-declaration order.
  pub locals: Vec<Rc<str>>,
}

impl IrFunction {
  /// An empty function shell.
  #[must_use] pub fn new(name: impl Into<String>, params: Vec<Rc<str>>) -> Self {
    IrFunction { name: name.into(), params, body: vec![], locals: vec![] }
  }
}

/// A whole lowered program.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IrProgram {
  /// Functions in lowering order (`__toplevel` first when present).
  pub functions: Vec<IrFunction>,
  /// String pool payloads, each NUL-terminated; [`StrId`] indexes here.
  pub strings: Vec<Box<[u8]>>,
  /// Entry function name: `main` if declared, else `__toplevel`.
  pub entry: Option<String>,
}

impl IrProgram {
  /// Find a function by IR name.
  #[must_use] pub fn function(&self, name: &str) -> Option<&IrFunction> {
    self.functions.iter().find(|f| f.name == name)
  }
}

impl fmt::Display for IrProgram {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if !self.strings.is_empty() {
      writeln!(f, "; .strings")?;
      for (i, bytes) in self.strings.iter().enumerate() {
        let body = &bytes[..bytes.len().saturating_sub(1)];
        let text = String::from_utf8_lossy(body).replace('\n', "\\n").replace('\r', "\\r");
        writeln!(f, ";   str{i}: {text}")?
      }
      writeln!(f)?
    }
    for func in &self.functions {
      writeln!(f, "func {}({})", func.name, func.params.join(", "))?;
      if !func.locals.is_empty() {
        writeln!(f, "  ; locals: {}", func.locals.join(", "))?
      }
      for ins in &func.body { writeln!(f, "{ins}")? }
      writeln!(f, "endfunc")?;
      writeln!(f)?
    }
    if let Some(entry) = &self.entry { writeln!(f, "; entry: {entry}")? }
    Ok(())
  }
}
