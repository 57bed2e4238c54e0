//! The abstract syntax tree handed to the compiler by the parser.
//!
//! Every node is [`Spanned`] with the position of the construct. Type
//! annotations stay as the raw text the parser saw (`"integer"`,
//! `"Dog[]"`); [`crate::types::ty::Type::parse_ann`] interprets them.

use super::{Loc, Spanned};

/// A statement with its source location.
pub type Stmt = Spanned<StmtKind>;
/// An expression with its source location.
pub type Expr = Spanned<ExprKind>;

/// A whole source file: the top-level statement list.
#[derive(Clone, Debug, PartialEq)]
pub struct Program {
  /// Top-level statements, in source order.
  pub stmts: Vec<Stmt>,
}

/// A braced statement list with its own scope.
#[derive(Clone, Debug, PartialEq)]
pub struct Block {
  /// Location of the opening brace.
  pub loc: Loc,
  /// The statements inside.
  pub stmts: Vec<Stmt>,
}

/// A formal parameter, annotation optional.
#[derive(Clone, Debug, PartialEq)]
pub struct Param {
  /// Location of the parameter name.
  pub loc: Loc,
  /// Parameter name.
  pub name: String,
  /// Raw type annotation text, if any.
  pub ann: Option<String>,
}

/// A function declaration, also used for methods and constructors.
#[derive(Clone, Debug, PartialEq)]
pub struct FuncDecl {
  /// Function name (`constructor` for constructors).
  pub name: String,
  /// Formal parameters.
  pub params: Vec<Param>,
  /// Raw return annotation text; `None` means `void`.
  pub ret_ann: Option<String>,
  /// Function body.
  pub body: Block,
}

/// A class declaration with optional single-inheritance base.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassDecl {
  /// Class name.
  pub name: String,
  /// Base class name after `:`, if any.
  pub base_name: Option<String>,
  /// Field and method members in declaration order.
  pub members: Vec<Stmt>,
}

/// One `case` arm of a `switch`.
#[derive(Clone, Debug, PartialEq)]
pub struct SwitchCase {
  /// Location of the `case` keyword.
  pub loc: Loc,
  /// The case guard expression.
  pub expr: Expr,
  /// Statements of the arm (falls through unless it breaks).
  pub block: Block,
}

/// Statement variants.
#[derive(Clone, Debug, PartialEq)]
pub enum StmtKind {
  /// A nested block.
  Block(Block),
  /// `let name[: ann][= init];`
  Var {
    /// Variable name.
    name: String,
    /// Raw annotation text, if any.
    ann: Option<String>,
    /// Initializer, if any.
    init: Option<Expr>,
  },
  /// `const name[: ann] = init;` (the checker rejects a missing init).
  Const {
    /// Constant name.
    name: String,
    /// Raw annotation text, if any.
    ann: Option<String>,
    /// Initializer; optional here so the parser can recover.
    init: Option<Expr>,
  },
  /// `target = value;`
  Assign {
    /// Assignment target (identifier, member or index access).
    target: Expr,
    /// Assigned value.
    value: Expr,
  },
  /// `if (cond) then [else els]`
  If {
    /// Condition, must be boolean.
    cond: Expr,
    /// Then branch.
    then_blk: Block,
    /// Else branch, if any.
    else_blk: Option<Block>,
  },
  /// `while (cond) body`
  While {
    /// Condition, must be boolean.
    cond: Expr,
    /// Loop body.
    body: Block,
  },
  /// `do body while (cond);`
  DoWhile {
    /// Loop body, executed at least once.
    body: Block,
    /// Condition, must be boolean.
    cond: Expr,
  },
  /// `for (init; cond; update) body`
  For {
    /// Init statement, if any.
    init: Option<Box<Stmt>>,
    /// Condition; absent means always true.
    cond: Option<Expr>,
    /// Update statement, if any.
    update: Option<Box<Stmt>>,
    /// Loop body.
    body: Block,
  },
  /// `foreach (var in iterable) body`
  Foreach {
    /// Iteration variable, bound per element.
    var: String,
    /// The array expression iterated over.
    iterable: Expr,
    /// Loop body.
    body: Block,
  },
  /// `switch (expr) { cases... [default] }`
  Switch {
    /// Discriminant expression.
    expr: Expr,
    /// Case arms in source order.
    cases: Vec<SwitchCase>,
    /// Default arm, if any.
    default: Option<Block>,
  },
  /// `try { ... } catch (err) { ... }`
  TryCatch {
    /// The guarded block.
    try_blk: Block,
    /// Name bound to the error value in the catch scope.
    err_name: String,
    /// The handler block.
    catch_blk: Block,
  },
  /// `return [value];`
  Return(Option<Expr>),
  /// `break;`
  Break,
  /// `continue;`
  Continue,
  /// An expression evaluated for effect.
  Expr(Expr),
  /// A function declaration (top-level or nested).
  Func(FuncDecl),
  /// A class declaration.
  Class(ClassDecl),
}

/// Expression variants.
#[derive(Clone, Debug, PartialEq)]
pub enum ExprKind {
  /// A name reference.
  Ident(String),
  /// A literal value.
  Lit(Literal),
  /// `!e` or `-e`.
  Unary {
    /// The operator.
    op: Unop,
    /// The operand.
    expr: Box<Expr>,
  },
  /// A binary operation.
  Binary {
    /// The operator.
    op: Binop,
    /// Left operand.
    lhs: Box<Expr>,
    /// Right operand.
    rhs: Box<Expr>,
  },
  /// `cond ? then : els`.
  Ternary {
    /// Condition, must be boolean.
    cond: Box<Expr>,
    /// Value when true.
    then: Box<Expr>,
    /// Value when false.
    els: Box<Expr>,
  },
  /// A call; the callee decides between plain call, constructor
  /// (`new C(...)` parses to a call of the class name) and method call.
  Call {
    /// The called expression.
    callee: Box<Expr>,
    /// Actual arguments.
    args: Vec<Expr>,
  },
  /// `obj.name`.
  Member {
    /// The receiver.
    obj: Box<Expr>,
    /// Member name.
    name: String,
  },
  /// `obj[index]`.
  Index {
    /// The array expression.
    obj: Box<Expr>,
    /// The index expression.
    index: Box<Expr>,
  },
  /// `[e0, e1, ...]`.
  Array(Vec<Expr>),
  /// `this` inside a method.
  This,
}

/// Literal values with their lexical kind.
#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
  /// Integer literal.
  Int(i32),
  /// Boolean literal.
  Bool(bool),
  /// String literal, unescaped.
  Str(String),
  /// The `null` literal.
  Null,
}

/// Unary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Unop {
  /// Arithmetic negation `-`.
  Neg,
  /// Logical not `!`.
  Not,
}

/// Binary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Binop {
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
  /// `&&`
  And,
  /// `||`
  Or,
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

impl Binop {
  /// Whether this is one of the six relational operators.
  #[must_use] pub fn is_relational(self) -> bool {
    matches!(self, Binop::Eq | Binop::Ne | Binop::Lt | Binop::Le | Binop::Gt | Binop::Ge)
  }

  /// Whether this is `+ - * / %`.
  #[must_use] pub fn is_arith(self) -> bool {
    matches!(self, Binop::Add | Binop::Sub | Binop::Mul | Binop::Div | Binop::Rem)
  }

  /// The source spelling, used in diagnostics.
  #[must_use] pub fn as_str(self) -> &'static str {
    match self {
      Binop::Add => "+", Binop::Sub => "-", Binop::Mul => "*",
      Binop::Div => "/", Binop::Rem => "%",
      Binop::And => "&&", Binop::Or => "||",
      Binop::Eq => "==", Binop::Ne => "!=",
      Binop::Lt => "<", Binop::Le => "<=", Binop::Gt => ">", Binop::Ge => ">=",
    }
  }
}
