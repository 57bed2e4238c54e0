//! Lowering from the checked AST to the linear three-address IR.
//!
//! Top-level statements that are not function or class declarations are
//! folded into a synthetic `__toplevel` function in program order; the
//! entry point is `main` when declared and `__toplevel` otherwise.
//! Methods become free functions named `Class__method` with `this` as
//! their first parameter, dispatched statically through the receiver's
//! recorded class. The builder owns the only mutable counters of the
//! pipeline: the per-function temp pool and the program-wide label
//! counter.
//!
//! The builder assumes a semantically valid input; violated
//! preconditions surface as [`BuildError`] values naming the offending
//! construct rather than panics, so the driver can report an internal
//! error cleanly.

use std::fmt;
use std::rc::Rc;

use hashbrown::{HashMap, HashSet};
use if_chain::if_chain;

use crate::types::ast::{
  Binop, Block, ClassDecl, Expr, ExprKind, FuncDecl, Literal, Program, Stmt, StmtKind, Unop,
};
use crate::types::ir::{
  ArithOp, CmpOp, Instr, IrFunction, IrProgram, LabelId, Operand, StrId, UnOp,
};

/// A precondition of the lowering was violated. These are internal
/// errors: a program that passed the checker does not produce them
/// except through the known closure limitation (see
/// [`BuildError::UnresolvedName`]).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildError {
  /// A name had no binding in the builder's scopes. Also raised when a
  /// nested function reads a captured variable, which the IR level
  /// does not materialize.
  UnresolvedName(String),
  /// A member access receiver whose static class is not known.
  NoStaticClass(String),
  /// A class was used before any layout was registered for it.
  UnknownClass(String),
  /// A field missing from the receiver class's layout.
  UnknownField {
    /// The receiver class.
    class: String,
    /// The missing field.
    field: String,
  },
  /// A method missing from the receiver class and all its bases.
  UnknownMethod {
    /// The receiver class.
    class: String,
    /// The missing method.
    method: String,
  },
  /// `this` used while no method was being lowered.
  ThisOutsideMethod,
  /// An assignment target that is not a variable, member or index.
  UnsupportedAssignTarget,
  /// A member access receiver that is neither `this` nor a variable.
  UnsupportedMemberBase,
  /// A callee shape that is neither an identifier nor a member access.
  UnsupportedCallee,
}

impl fmt::Display for BuildError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      BuildError::UnresolvedName(n) => write!(f, "unresolved name '{n}' during lowering"),
      BuildError::NoStaticClass(n) =>
        write!(f, "no known class for '{n}' in member access"),
      BuildError::UnknownClass(c) => write!(f, "class '{c}' has no registered layout"),
      BuildError::UnknownField { class, field } =>
        write!(f, "field '{field}' not found in layout of class '{class}'"),
      BuildError::UnknownMethod { class, method } =>
        write!(f, "method '{method}' does not exist in class '{class}' or its bases"),
      BuildError::ThisOutsideMethod => write!(f, "use of 'this' outside a method body"),
      BuildError::UnsupportedAssignTarget =>
        write!(f, "assignment target must be a variable, member or index"),
      BuildError::UnsupportedMemberBase =>
        write!(f, "member access receiver must be 'this' or a typed variable"),
      BuildError::UnsupportedCallee => write!(f, "unsupported callee shape"),
    }
  }
}

/// Lower a checked program to IR.
pub fn lower_program(prog: &Program) -> Result<IrProgram, BuildError> {
  let mut ctx = LowerCtx::default();
  // register every top-level class first so instance construction works
  // regardless of textual order
  for s in &prog.stmts {
    if let StmtKind::Class(c) = &s.k { ctx.register_class(c) }
  }
  for s in &prog.stmts {
    match &s.k {
      StmtKind::Func(d) => ctx.lower_func_decl(d)?,
      StmtKind::Class(c) => ctx.lower_class_decl(c)?,
      _ => {
        ctx.ensure_toplevel();
        ctx.lower_stmt(s)?;
      }
    }
  }
  ctx.finish()
}

/// Monotonic temp allocator with a free list. Reuse keeps naive frames
/// small, but nothing downstream depends on it: a released name is
/// only handed out again after its last read.
#[derive(Default)]
struct TempPool {
  next: u32,
  free: Vec<u32>,
}

impl TempPool {
  fn fresh(&mut self) -> Operand {
    let n = self.free.pop().unwrap_or_else(|| {
      let n = self.next;
      self.next += 1;
      n
    });
    Operand::Temp(n)
  }

  fn release(&mut self, op: &Operand) {
    if let Operand::Temp(t) = op { self.free.push(*t) }
  }
}

/// Field offsets of one class, inherited fields first.
struct ClassLayout {
  fields: Vec<Rc<str>>,
  offsets: HashMap<String, i32>,
}

impl ClassLayout {
  fn size(&self) -> i32 { 4 * i32::try_from(self.fields.len()).expect("class too large") }
}

/// Per-function lowering state, swapped out while a nested declaration
/// compiles.
struct FnCtx {
  f: IrFunction,
  slot: usize,
  tpool: TempPool,
  scopes: Vec<HashMap<String, Operand>>,
  // static class of local values, for member dispatch
  class_of: Vec<HashMap<String, Option<String>>>,
  cur_class: Option<String>,
  brk: Vec<LabelId>,
  cont: Vec<Option<LabelId>>,
  is_toplevel: bool,
}

impl FnCtx {
  fn new(slot: usize, name: &str, params: Vec<Rc<str>>,
      cur_class: Option<String>, is_toplevel: bool) -> Self {
    let mut ctx = FnCtx {
      f: IrFunction::new(name, params),
      slot,
      tpool: TempPool::default(),
      scopes: vec![],
      class_of: vec![],
      cur_class,
      brk: vec![],
      cont: vec![],
      is_toplevel,
    };
    ctx.push_scope();
    ctx
  }

  fn push_scope(&mut self) {
    self.scopes.push(HashMap::new());
    self.class_of.push(HashMap::new());
  }

  fn pop_scope(&mut self) {
    self.scopes.pop();
    self.class_of.pop();
  }

  fn bind(&mut self, name: &str, op: Operand) {
    self.scopes.last_mut().expect("no active scope").insert(name.to_owned(), op);
  }

  fn bind_class(&mut self, name: &str, cls: Option<String>) {
    self.class_of.last_mut().expect("no active scope").insert(name.to_owned(), cls);
  }

  fn lookup(&self, name: &str) -> Option<Operand> {
    for scope in self.scopes.iter().rev() {
      if let Some(op) = scope.get(name) { return Some(op.clone()) }
    }
    self.f.params.iter().find(|p| ***p == *name).map(|p| Operand::Param(p.clone()))
  }

  fn lookup_class(&self, name: &str) -> Option<String> {
    for scope in self.class_of.iter().rev() {
      if let Some(cls) = scope.get(name) { return cls.clone() }
    }
    None
  }

  /// Reserve a named local slot, once.
  fn ensure_local(&mut self, name: &str) -> Rc<str> {
    if let Some(existing) = self.f.locals.iter().find(|l| ***l == *name) {
      return existing.clone()
    }
    let local: Rc<str> = Rc::from(name);
    self.f.locals.push(local.clone());
    local
  }

  fn loop_push(&mut self, cont: Option<LabelId>, brk: LabelId) {
    self.cont.push(cont);
    self.brk.push(brk);
  }

  fn loop_pop(&mut self) {
    self.cont.pop();
    self.brk.pop();
  }
}

/// A condition in jump position, possibly negated. The negated form
/// lets `&&` lower through the same helper without materializing the
/// boolean.
enum Cond<'a> {
  Plain(&'a Expr),
  Not(&'a Expr),
}

#[derive(Default)]
struct LowerCtx {
  // finished functions by reservation order; a slot is reserved when
  // lowering of its function starts so output order matches source
  funcs: Vec<Option<IrFunction>>,
  strings: Vec<Box<[u8]>>,
  string_ids: HashMap<String, StrId>,
  entry: Option<String>,
  next_label: u32,
  layouts: HashMap<String, ClassLayout>,
  methods: HashMap<(String, String), Rc<str>>,
  bases: HashMap<String, Option<String>>,
  cur: Option<FnCtx>,
  made_toplevel: bool,
}

impl LowerCtx {
  fn fx(&mut self) -> &mut FnCtx { self.cur.as_mut().expect("no active function") }

  fn emit(&mut self, i: Instr) { self.fx().f.body.push(i) }

  fn fresh_temp(&mut self) -> Operand { self.fx().tpool.fresh() }

  fn release_temp(&mut self, op: &Operand) { self.fx().tpool.release(op) }

  fn new_label(&mut self) -> LabelId {
    let l = LabelId(self.next_label);
    self.next_label += 1;
    l
  }

  /// Intern a string literal, deduplicating by content. The payload
  /// gets its trailing NUL here.
  fn intern_string(&mut self, text: &str) -> StrId {
    if let Some(&id) = self.string_ids.get(text) { return id }
    let id = StrId(u32::try_from(self.strings.len()).expect("string pool overflow"));
    let mut bytes = text.as_bytes().to_vec();
    bytes.push(0);
    self.strings.push(bytes.into_boxed_slice());
    self.string_ids.insert(text.to_owned(), id);
    id
  }

  fn ensure_toplevel(&mut self) {
    if self.cur.as_ref().is_some_and(|c| c.is_toplevel) { return }
    let slot = self.funcs.len();
    self.funcs.push(None);
    self.cur = Some(FnCtx::new(slot, "__toplevel", vec![], None, true));
    self.made_toplevel = true;
  }

  fn finish(self) -> Result<IrProgram, BuildError> {
    let LowerCtx { mut funcs, strings, entry, cur, made_toplevel, .. } = self;
    if let Some(fctx) = cur {
      funcs[fctx.slot] = Some(fctx.f);
    }
    let functions: Vec<IrFunction> =
      funcs.into_iter().map(|f| f.expect("unfinished function")).collect();
    let entry = entry.or_else(|| {
      if functions.iter().any(|f| f.name == "main") {
        Some("main".to_owned())
      } else if made_toplevel {
        Some("__toplevel".to_owned())
      } else {
        None
      }
    });
    Ok(IrProgram { functions, strings, entry })
  }

  // ---------------- declarations ----------------

  /// Record the field layout, base link and method IR names of a
  /// class, without compiling anything.
  fn register_class(&mut self, c: &ClassDecl) {
    self.bases.insert(c.name.clone(), c.base_name.clone());
    let mut fields: Vec<Rc<str>> = c.base_name.as_deref()
      .and_then(|b| self.layouts.get(b))
      .map(|l| l.fields.clone())
      .unwrap_or_default();
    for m in &c.members {
      if let StmtKind::Var { name, .. } | StmtKind::Const { name, .. } = &m.k {
        fields.push(Rc::from(name.as_str()));
      }
    }
    let offsets = fields.iter().enumerate()
      .map(|(i, f)| (f.to_string(), 4 * i32::try_from(i).expect("class too large")))
      .collect();
    self.layouts.insert(c.name.clone(), ClassLayout { fields, offsets });
    for m in &c.members {
      if let StmtKind::Func(f) = &m.k {
        self.methods.insert(
          (c.name.clone(), f.name.clone()),
          Rc::from(format!("{}__{}", c.name, f.name)),
        );
      }
    }
  }

  fn lower_func_decl(&mut self, d: &FuncDecl) -> Result<(), BuildError> {
    if d.name == "main" { self.entry = Some("main".to_owned()) }
    let params: Vec<Rc<str>> =
      d.params.iter().map(|p| Rc::from(p.name.as_str())).collect();
    let slot = self.funcs.len();
    self.funcs.push(None);
    let saved = self.cur.take();
    let mut fctx = FnCtx::new(slot, &d.name, params.clone(), None, false);
    for p in &params {
      fctx.bind(p, Operand::Param(p.clone()));
      fctx.bind_class(p, None);
    }
    self.cur = Some(fctx);
    self.lower_block(&d.body)?;
    let fctx = self.cur.take().expect("function context vanished");
    self.funcs[fctx.slot] = Some(fctx.f);
    self.cur = saved;
    Ok(())
  }

  fn lower_class_decl(&mut self, c: &ClassDecl) -> Result<(), BuildError> {
    // nested classes were not seen by the program-level pre-pass
    if !self.layouts.contains_key(&c.name) { self.register_class(c) }
    for m in &c.members {
      if let StmtKind::Func(f) = &m.k {
        let ir_name = self.methods[&(c.name.clone(), f.name.clone())].clone();
        self.lower_method(&c.name, &ir_name, f)?;
      }
    }
    Ok(())
  }

  fn lower_method(&mut self, cname: &str, ir_name: &Rc<str>, d: &FuncDecl)
      -> Result<(), BuildError> {
    let mut params: Vec<Rc<str>> = vec![Rc::from("this")];
    params.extend(d.params.iter().map(|p| Rc::<str>::from(p.name.as_str())));
    let slot = self.funcs.len();
    self.funcs.push(None);
    let saved = self.cur.take();
    let mut fctx = FnCtx::new(slot, ir_name, params.clone(), Some(cname.to_owned()), false);
    fctx.bind("this", Operand::Param(params[0].clone()));
    fctx.bind_class("this", Some(cname.to_owned()));
    for p in &params[1..] {
      fctx.bind(p, Operand::Param(p.clone()));
      fctx.bind_class(p, None);
    }
    self.cur = Some(fctx);
    self.lower_block(&d.body)?;
    let fctx = self.cur.take().expect("method context vanished");
    self.funcs[fctx.slot] = Some(fctx.f);
    self.cur = saved;
    Ok(())
  }

  // ---------------- statements ----------------

  fn lower_block(&mut self, b: &Block) -> Result<(), BuildError> {
    self.fx().push_scope();
    for s in &b.stmts { self.lower_stmt(s)? }
    self.fx().pop_scope();
    Ok(())
  }

  fn lower_stmt(&mut self, s: &Stmt) -> Result<(), BuildError> {
    match &s.k {
      StmtKind::Block(b) => self.lower_block(b),
      // const lowers like a local; the checker already rejected writes
      StmtKind::Var { name, init, .. } | StmtKind::Const { name, init, .. } =>
        self.lower_var_decl(name, init.as_ref()),
      StmtKind::Assign { target, value } => self.lower_assign(target, value),
      StmtKind::If { cond, then_blk, else_blk } =>
        self.lower_if(cond, then_blk, else_blk.as_ref()),
      StmtKind::While { cond, body } => self.lower_while(cond, body),
      StmtKind::DoWhile { body, cond } => self.lower_do_while(body, cond),
      StmtKind::For { init, cond, update, body } =>
        self.lower_for(init.as_deref(), cond.as_ref(), update.as_deref(), body),
      StmtKind::Foreach { var, iterable, body } => self.lower_foreach(var, iterable, body),
      StmtKind::Switch { expr, cases, default } =>
        self.lower_switch(expr, cases, default.as_ref()),
      StmtKind::TryCatch { try_blk, err_name, .. } => {
        // no exception runtime: only the try block compiles, and the
        // catch variable exists for scope conformity with the checker
        self.fx().push_scope();
        let local = self.fx().ensure_local(err_name);
        self.fx().bind(err_name, Operand::Local(local));
        self.fx().bind_class(err_name, None);
        self.lower_block(try_blk)?;
        self.fx().pop_scope();
        Ok(())
      }
      StmtKind::Return(value) => {
        let v = match value {
          Some(v) => Some(self.lower_expr(v)?),
          None => None,
        };
        self.emit(Instr::Ret(v));
        Ok(())
      }
      StmtKind::Break => {
        // outside any loop the checker already reported it
        if let Some(&l) = self.fx().brk.last() { self.emit(Instr::Jump(l)) }
        Ok(())
      }
      StmtKind::Continue => {
        if let Some(&Some(l)) = self.fx().cont.last() { self.emit(Instr::Jump(l)) }
        Ok(())
      }
      StmtKind::Expr(e) => {
        self.lower_expr(e)?;
        Ok(())
      }
      StmtKind::Func(d) => self.lower_func_decl(d),
      StmtKind::Class(c) => self.lower_class_decl(c),
    }
  }

  fn lower_var_decl(&mut self, name: &str, init: Option<&Expr>) -> Result<(), BuildError> {
    let local = self.fx().ensure_local(name);
    let dst = Operand::Local(local);
    self.fx().bind(name, dst.clone());
    self.fx().bind_class(name, None);
    if let Some(init) = init {
      let ctor_class = self.ctor_class_of(init);
      let val = self.lower_expr(init)?;
      self.emit(Instr::Move { dst, src: val });
      if ctor_class.is_some() { self.fx().bind_class(name, ctor_class) }
    }
    Ok(())
  }

  /// The class constructed by `init`, when it is a constructor call.
  fn ctor_class_of(&self, init: &Expr) -> Option<String> {
    if_chain! {
      if let ExprKind::Call { callee, .. } = &init.k;
      if let ExprKind::Ident(cname) = &callee.k;
      if self.layouts.contains_key(cname);
      then { Some(cname.clone()) } else { None }
    }
  }

  fn lower_assign(&mut self, target: &Expr, value: &Expr) -> Result<(), BuildError> {
    match &target.k {
      ExprKind::Ident(name) => {
        let dst = self.fx().lookup(name)
          .ok_or_else(|| BuildError::UnresolvedName(name.clone()))?;
        let ctor_class = self.ctor_class_of(value);
        let val = self.lower_expr(value)?;
        self.emit(Instr::Move { dst, src: val });
        if ctor_class.is_some() { self.fx().bind_class(name, ctor_class) }
        Ok(())
      }
      ExprKind::Member { obj, name } => {
        let (base, offset) = self.member_slot(obj, name)?;
        let src = self.lower_expr(value)?;
        self.emit(Instr::Store { base, offset, src });
        Ok(())
      }
      ExprKind::Index { obj, index } => {
        let base = self.lower_expr(obj)?;
        let idx = self.lower_expr(index)?;
        let src = self.lower_expr(value)?;
        self.emit(Instr::StoreI { base: base.clone(), index: idx.clone(), src: src.clone() });
        self.release_temp(&base);
        self.release_temp(&idx);
        self.release_temp(&src);
        Ok(())
      }
      _ => Err(BuildError::UnsupportedAssignTarget),
    }
  }

  fn lower_if(&mut self, cond: &Expr, then_blk: &Block, else_blk: Option<&Block>)
      -> Result<(), BuildError> {
    let l_then = self.new_label();
    let l_end = self.new_label();
    match else_blk {
      None => {
        self.emit_cond_jump(Cond::Plain(cond), l_then, l_end)?;
        self.emit(Instr::Label(l_then));
        self.lower_block(then_blk)?;
        self.emit(Instr::Label(l_end));
      }
      Some(els) => {
        let l_else = self.new_label();
        self.emit_cond_jump(Cond::Plain(cond), l_then, l_else)?;
        self.emit(Instr::Label(l_then));
        self.lower_block(then_blk)?;
        self.emit(Instr::Jump(l_end));
        self.emit(Instr::Label(l_else));
        self.lower_block(els)?;
        self.emit(Instr::Label(l_end));
      }
    }
    Ok(())
  }

  fn lower_while(&mut self, cond: &Expr, body: &Block) -> Result<(), BuildError> {
    let l_cond = self.new_label();
    let l_body = self.new_label();
    let l_end = self.new_label();
    self.emit(Instr::Label(l_cond));
    self.emit_cond_jump(Cond::Plain(cond), l_body, l_end)?;
    self.fx().loop_push(Some(l_cond), l_end);
    self.emit(Instr::Label(l_body));
    self.lower_block(body)?;
    self.emit(Instr::Jump(l_cond));
    self.fx().loop_pop();
    self.emit(Instr::Label(l_end));
    Ok(())
  }

  fn lower_do_while(&mut self, body: &Block, cond: &Expr) -> Result<(), BuildError> {
    let l_cond = self.new_label();
    let l_body = self.new_label();
    let l_end = self.new_label();
    self.emit(Instr::Label(l_body));
    self.fx().loop_push(Some(l_cond), l_end);
    self.lower_block(body)?;
    self.fx().loop_pop();
    self.emit(Instr::Label(l_cond));
    self.emit_cond_jump(Cond::Plain(cond), l_body, l_end)?;
    self.emit(Instr::Label(l_end));
    Ok(())
  }

  fn lower_for(&mut self, init: Option<&Stmt>, cond: Option<&Expr>,
      update: Option<&Stmt>, body: &Block) -> Result<(), BuildError> {
    self.fx().push_scope();
    if let Some(init) = init { self.lower_stmt(init)? }
    let l_cond = self.new_label();
    let l_body = self.new_label();
    let l_update = self.new_label();
    let l_end = self.new_label();
    self.emit(Instr::Label(l_cond));
    match cond {
      Some(cond) => self.emit_cond_jump(Cond::Plain(cond), l_body, l_end)?,
      // for(;;) never exits through the header
      None => self.emit(Instr::Jump(l_body)),
    }
    self.fx().loop_push(Some(l_update), l_end);
    self.emit(Instr::Label(l_body));
    self.lower_block(body)?;
    self.emit(Instr::Label(l_update));
    if let Some(update) = update { self.lower_stmt(update)? }
    self.emit(Instr::Jump(l_cond));
    self.fx().loop_pop();
    self.emit(Instr::Label(l_end));
    self.fx().pop_scope();
    Ok(())
  }

  fn lower_foreach(&mut self, var: &str, iterable: &Expr, body: &Block)
      -> Result<(), BuildError> {
    self.fx().push_scope();
    let local = self.fx().ensure_local(var);
    let loc_var = Operand::Local(local);
    self.fx().bind(var, loc_var.clone());
    self.fx().bind_class(var, None);

    let arr = self.lower_expr(iterable)?;
    let length = self.fresh_temp();
    self.emit(Instr::Load { dst: length.clone(), base: arr.clone(), offset: 0 });
    let idx = self.fresh_temp();
    self.emit(Instr::Move { dst: idx.clone(), src: Operand::Int(0) });

    let l_cond = self.new_label();
    let l_body = self.new_label();
    let l_end = self.new_label();
    self.emit(Instr::Label(l_cond));
    self.emit(Instr::CJump {
      op: CmpOp::Lt,
      a: idx.clone(),
      b: length.clone(),
      if_true: l_body,
      if_false: l_end,
    });

    self.fx().loop_push(Some(l_cond), l_end);
    self.emit(Instr::Label(l_body));
    let cur = self.fresh_temp();
    self.emit(Instr::LoadI { dst: cur.clone(), base: arr.clone(), index: idx.clone() });
    self.emit(Instr::Move { dst: loc_var, src: cur.clone() });
    self.release_temp(&cur);
    self.lower_block(body)?;
    let next = self.fresh_temp();
    self.emit(Instr::Bin {
      op: ArithOp::Add,
      dst: next.clone(),
      a: idx.clone(),
      b: Operand::Int(1),
    });
    self.emit(Instr::Move { dst: idx.clone(), src: next.clone() });
    self.release_temp(&next);
    self.emit(Instr::Jump(l_cond));
    self.fx().loop_pop();

    self.emit(Instr::Label(l_end));
    self.release_temp(&arr);
    self.release_temp(&length);
    self.release_temp(&idx);
    self.fx().pop_scope();
    Ok(())
  }

  fn lower_switch(&mut self, expr: &Expr, cases: &[crate::types::ast::SwitchCase],
      default: Option<&Block>) -> Result<(), BuildError> {
    let disc = self.lower_expr(expr)?;
    let l_end = self.new_label();
    let case_labels: Vec<LabelId> = cases.iter().map(|_| self.new_label()).collect();
    let l_default = if default.is_some() { self.new_label() } else { l_end };

    // comparison chain; a failed test falls to the next one, the last
    // falls to the default (or straight past everything)
    for (i, c) in cases.iter().enumerate() {
      let cv = self.lower_expr(&c.expr)?;
      let l_next = if i + 1 < cases.len() { self.new_label() } else { l_default };
      self.emit(Instr::CJump {
        op: CmpOp::Eq,
        a: disc.clone(),
        b: cv.clone(),
        if_true: case_labels[i],
        if_false: l_next,
      });
      self.release_temp(&cv);
      if i + 1 < cases.len() { self.emit(Instr::Label(l_next)) }
    }

    // case bodies fall through into each other unless they break
    self.fx().loop_push(None, l_end);
    for (i, c) in cases.iter().enumerate() {
      self.emit(Instr::Label(case_labels[i]));
      self.lower_block(&c.block)?;
    }
    if let Some(d) = default {
      self.emit(Instr::Label(l_default));
      self.lower_block(d)?;
    }
    self.fx().loop_pop();

    self.emit(Instr::Label(l_end));
    self.release_temp(&disc);
    Ok(())
  }

  // ---------------- expressions ----------------

  fn lower_expr(&mut self, e: &Expr) -> Result<Operand, BuildError> {
    match &e.k {
      ExprKind::Ident(name) => self.fx().lookup(name)
        .ok_or_else(|| BuildError::UnresolvedName(name.clone())),
      ExprKind::Lit(lit) => Ok(match lit {
        Literal::Int(v) => Operand::Int(*v),
        Literal::Bool(b) => Operand::Int(i32::from(*b)),
        Literal::Null => Operand::Int(0),
        Literal::Str(text) => {
          let id = self.intern_string(text);
          Operand::Str(id)
        }
      }),
      ExprKind::This => Ok(Operand::Param(Rc::from("this"))),
      ExprKind::Unary { op, expr } => {
        let v = self.lower_expr(expr)?;
        let dst = self.fresh_temp();
        match op {
          Unop::Neg => self.emit(Instr::Un { op: UnOp::Neg, dst: dst.clone(), a: v }),
          Unop::Not => self.emit(Instr::Cmp {
            op: CmpOp::Eq,
            dst: dst.clone(),
            a: v,
            b: Operand::Int(0),
          }),
        }
        Ok(dst)
      }
      ExprKind::Binary { op, lhs, rhs } => self.lower_binary(*op, lhs, rhs),
      ExprKind::Ternary { cond, then, els } => {
        let l_then = self.new_label();
        let l_else = self.new_label();
        let l_end = self.new_label();
        let dst = self.fresh_temp();
        self.emit_cond_jump(Cond::Plain(cond), l_then, l_else)?;
        self.emit(Instr::Label(l_then));
        let tv = self.lower_expr(then)?;
        self.emit(Instr::Move { dst: dst.clone(), src: tv.clone() });
        self.release_temp(&tv);
        self.emit(Instr::Jump(l_end));
        self.emit(Instr::Label(l_else));
        let ev = self.lower_expr(els)?;
        self.emit(Instr::Move { dst: dst.clone(), src: ev.clone() });
        self.release_temp(&ev);
        self.emit(Instr::Label(l_end));
        Ok(dst)
      }
      ExprKind::Member { obj, name } => {
        let (base, offset) = self.member_slot(obj, name)?;
        let dst = self.fresh_temp();
        self.emit(Instr::Load { dst: dst.clone(), base, offset });
        Ok(dst)
      }
      ExprKind::Index { obj, index } => {
        let base = self.lower_expr(obj)?;
        let idx = self.lower_expr(index)?;
        let dst = self.fresh_temp();
        self.emit(Instr::LoadI { dst: dst.clone(), base: base.clone(), index: idx.clone() });
        self.release_temp(&base);
        self.release_temp(&idx);
        Ok(dst)
      }
      ExprKind::Array(elems) => {
        let n = i32::try_from(elems.len()).expect("array literal too large");
        let arr = self.fresh_temp();
        self.emit(Instr::Call {
          dst: Some(arr.clone()),
          func: Rc::from("malloc"),
          args: vec![Operand::Int(4 + 4 * n)],
        });
        self.emit(Instr::Store { base: arr.clone(), offset: 0, src: Operand::Int(n) });
        for (i, el) in elems.iter().enumerate() {
          let val = self.lower_expr(el)?;
          let offset = 4 + 4 * i32::try_from(i).expect("array literal too large");
          self.emit(Instr::Store { base: arr.clone(), offset, src: val.clone() });
          self.release_temp(&val);
        }
        Ok(arr)
      }
      ExprKind::Call { callee, args } => self.lower_call(callee, args),
    }
  }

  fn lower_binary(&mut self, op: Binop, lhs: &Expr, rhs: &Expr)
      -> Result<Operand, BuildError> {
    // `+` with a string literal on either side concatenates at run time
    if op == Binop::Add && (is_string_literal(lhs) || is_string_literal(rhs)) {
      let a = self.lower_expr(lhs)?;
      let b = self.lower_expr(rhs)?;
      let dst = self.fresh_temp();
      self.emit(Instr::Call {
        dst: Some(dst.clone()),
        func: Rc::from("__concat"),
        args: vec![a.clone(), b.clone()],
      });
      self.release_temp(&a);
      self.release_temp(&b);
      return Ok(dst)
    }

    if let Some(arith) = arith_of(op) {
      let a = self.lower_expr(lhs)?;
      let b = self.lower_expr(rhs)?;
      let dst = self.fresh_temp();
      self.emit(Instr::Bin { op: arith, dst: dst.clone(), a: a.clone(), b: b.clone() });
      self.release_temp(&a);
      self.release_temp(&b);
      return Ok(dst)
    }

    if let Some(cmp) = cmp_of(op) {
      let a = self.lower_expr(lhs)?;
      let b = self.lower_expr(rhs)?;
      let dst = self.fresh_temp();
      self.emit(Instr::Cmp { op: cmp, dst: dst.clone(), a: a.clone(), b: b.clone() });
      self.release_temp(&a);
      self.release_temp(&b);
      return Ok(dst)
    }

    // short-circuit forms: destination starts at 0 and is set to 1 on
    // the success path only
    let dst = self.fresh_temp();
    self.emit(Instr::Move { dst: dst.clone(), src: Operand::Int(0) });
    match op {
      Binop::And => {
        let l_true = self.new_label();
        let l_false = self.new_label();
        let l_end = self.new_label();
        self.emit_cond_jump(Cond::Not(lhs), l_false, l_true)?;
        self.emit(Instr::Label(l_true));
        let l_true2 = self.new_label();
        self.emit_cond_jump(Cond::Not(rhs), l_false, l_true2)?;
        self.emit(Instr::Label(l_true2));
        self.emit(Instr::Move { dst: dst.clone(), src: Operand::Int(1) });
        self.emit(Instr::Jump(l_end));
        self.emit(Instr::Label(l_false));
        self.emit(Instr::Label(l_end));
      }
      Binop::Or => {
        let l_true = self.new_label();
        let l_rhs = self.new_label();
        let l_false = self.new_label();
        let l_end = self.new_label();
        self.emit_cond_jump(Cond::Plain(lhs), l_true, l_rhs)?;
        self.emit(Instr::Label(l_rhs));
        self.emit_cond_jump(Cond::Plain(rhs), l_true, l_false)?;
        self.emit(Instr::Label(l_true));
        self.emit(Instr::Move { dst: dst.clone(), src: Operand::Int(1) });
        self.emit(Instr::Jump(l_end));
        self.emit(Instr::Label(l_false));
        self.emit(Instr::Label(l_end));
      }
      _ => unreachable!("binary operator not covered: {op:?}"),
    }
    Ok(dst)
  }

  fn lower_call(&mut self, callee: &Expr, args: &[Expr]) -> Result<Operand, BuildError> {
    let mut arg_ops = Vec::with_capacity(args.len());
    for a in args { arg_ops.push(self.lower_expr(a)?) }

    match &callee.k {
      // method call through the receiver's static class
      ExprKind::Member { obj, name } => {
        let (base, cls) = match &obj.k {
          ExprKind::This => {
            let cls = self.fx().cur_class.clone().ok_or(BuildError::ThisOutsideMethod)?;
            (Operand::Param(Rc::from("this")), cls)
          }
          ExprKind::Ident(oname) => {
            let base = self.fx().lookup(oname)
              .ok_or_else(|| BuildError::UnresolvedName(oname.clone()))?;
            let cls = self.fx().lookup_class(oname)
              .ok_or_else(|| BuildError::NoStaticClass(oname.clone()))?;
            (base, cls)
          }
          _ => return Err(BuildError::UnsupportedCallee),
        };
        let ir_name = self.resolve_method_ir(&cls, name)?;
        let dst = self.fresh_temp();
        let mut call_args = vec![base];
        call_args.extend(arg_ops);
        self.emit(Instr::Call { dst: Some(dst.clone()), func: ir_name, args: call_args });
        Ok(dst)
      }
      // constructor call: allocate the record, then run the
      // constructor (if any) against the fresh instance
      ExprKind::Ident(cname) if self.layouts.contains_key(cname) => {
        let size = self.layouts[cname].size();
        let this_tmp = self.fresh_temp();
        self.emit(Instr::Call {
          dst: Some(this_tmp.clone()),
          func: Rc::from("malloc"),
          args: vec![Operand::Int(size)],
        });
        if let Some(ctor) = self.methods.get(&(cname.clone(), "constructor".to_owned())) {
          let ctor = ctor.clone();
          let mut call_args = vec![this_tmp.clone()];
          call_args.extend(arg_ops);
          self.emit(Instr::Call { dst: None, func: ctor, args: call_args });
        }
        Ok(this_tmp)
      }
      ExprKind::Ident(fname) => {
        let dst = self.fresh_temp();
        self.emit(Instr::Call {
          dst: Some(dst.clone()),
          func: Rc::from(fname.as_str()),
          args: arg_ops,
        });
        Ok(dst)
      }
      _ => Err(BuildError::UnsupportedCallee),
    }
  }

  /// The receiver operand and byte offset of `obj.field`.
  fn member_slot(&mut self, obj: &Expr, field: &str)
      -> Result<(Operand, i32), BuildError> {
    let (base, cls) = match &obj.k {
      ExprKind::This => {
        let cls = self.fx().cur_class.clone().ok_or(BuildError::ThisOutsideMethod)?;
        (Operand::Param(Rc::from("this")), cls)
      }
      ExprKind::Ident(name) => {
        let base = self.fx().lookup(name)
          .ok_or_else(|| BuildError::UnresolvedName(name.clone()))?;
        let cls = self.fx().lookup_class(name)
          .ok_or_else(|| BuildError::NoStaticClass(name.clone()))?;
        (base, cls)
      }
      _ => return Err(BuildError::UnsupportedMemberBase),
    };
    let layout = self.layouts.get(&cls)
      .ok_or_else(|| BuildError::UnknownClass(cls.clone()))?;
    let offset = layout.offsets.get(field).copied()
      .ok_or_else(|| BuildError::UnknownField { class: cls, field: field.to_owned() })?;
    Ok((base, offset))
  }

  fn resolve_method_ir(&self, cls: &str, method: &str) -> Result<Rc<str>, BuildError> {
    let mut cur = Some(cls.to_owned());
    let mut visited = HashSet::new();
    while let Some(name) = cur {
      if !visited.insert(name.clone()) { break }
      if let Some(ir) = self.methods.get(&(name.clone(), method.to_owned())) {
        return Ok(ir.clone())
      }
      cur = self.bases.get(&name).cloned().flatten();
    }
    Err(BuildError::UnknownMethod { class: cls.to_owned(), method: method.to_owned() })
  }

  /// Lower a condition directly into a two-way jump. Relational
  /// binaries become a single `CJump`; everything else evaluates to a
  /// value compared against zero.
  fn emit_cond_jump(&mut self, cond: Cond<'_>, if_true: LabelId, if_false: LabelId)
      -> Result<(), BuildError> {
    match cond {
      Cond::Not(e) => {
        let v = self.lower_expr(e)?;
        self.emit(Instr::CJump {
          op: CmpOp::Eq,
          a: v.clone(),
          b: Operand::Int(0),
          if_true,
          if_false,
        });
        self.release_temp(&v);
      }
      Cond::Plain(e) => {
        if_chain! {
          if let ExprKind::Binary { op, lhs, rhs } = &e.k;
          if let Some(cmp) = cmp_of(*op);
          then {
            let a = self.lower_expr(lhs)?;
            let b = self.lower_expr(rhs)?;
            self.emit(Instr::CJump { op: cmp, a: a.clone(), b: b.clone(), if_true, if_false });
            self.release_temp(&a);
            self.release_temp(&b);
          } else {
            let v = self.lower_expr(e)?;
            self.emit(Instr::CJump {
              op: CmpOp::Ne,
              a: v.clone(),
              b: Operand::Int(0),
              if_true,
              if_false,
            });
            self.release_temp(&v);
          }
        }
      }
    }
    Ok(())
  }
}

fn is_string_literal(e: &Expr) -> bool {
  matches!(&e.k, ExprKind::Lit(Literal::Str(_)))
}

fn arith_of(op: Binop) -> Option<ArithOp> {
  match op {
    Binop::Add => Some(ArithOp::Add),
    Binop::Sub => Some(ArithOp::Sub),
    Binop::Mul => Some(ArithOp::Mul),
    Binop::Div => Some(ArithOp::Div),
    Binop::Rem => Some(ArithOp::Rem),
    _ => None,
  }
}

fn cmp_of(op: Binop) -> Option<CmpOp> {
  match op {
    Binop::Eq => Some(CmpOp::Eq),
    Binop::Ne => Some(CmpOp::Ne),
    Binop::Lt => Some(CmpOp::Lt),
    Binop::Le => Some(CmpOp::Le),
    Binop::Gt => Some(CmpOp::Gt),
    Binop::Ge => Some(CmpOp::Ge),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::ast::{Param, SwitchCase};
  use crate::types::{Loc, Spanned};

  fn loc() -> Loc { Loc::new(1, 1) }
  fn stmt(k: StmtKind) -> Stmt { Spanned::new(loc(), k) }
  fn ex(k: ExprKind) -> Expr { Spanned::new(loc(), k) }
  fn ident(n: &str) -> Expr { ex(ExprKind::Ident(n.into())) }
  fn int(v: i32) -> Expr { ex(ExprKind::Lit(Literal::Int(v))) }
  fn string(s: &str) -> Expr { ex(ExprKind::Lit(Literal::Str(s.into()))) }
  fn block(stmts: Vec<Stmt>) -> Block { Block { loc: loc(), stmts } }
  fn call(callee: Expr, args: Vec<Expr>) -> Expr {
    ex(ExprKind::Call { callee: Box::new(callee), args })
  }
  fn var(name: &str, init: Option<Expr>) -> Stmt {
    stmt(StmtKind::Var { name: name.into(), ann: None, init })
  }
  fn prog(stmts: Vec<Stmt>) -> Program { Program { stmts } }

  #[test]
  fn toplevel_statements_form_a_synthetic_function() {
    let ir = lower_program(&prog(vec![var("a", Some(int(1)))])).unwrap();
    assert_eq!(ir.functions.len(), 1);
    assert_eq!(ir.functions[0].name, "__toplevel");
    assert_eq!(ir.entry.as_deref(), Some("__toplevel"));
    assert_eq!(ir.functions[0].locals, vec![Rc::<str>::from("a")]);
  }

  #[test]
  fn declared_main_becomes_the_entry() {
    let ir = lower_program(&prog(vec![
      stmt(StmtKind::Func(FuncDecl {
        name: "main".into(),
        params: vec![],
        ret_ann: Some("integer".into()),
        body: block(vec![stmt(StmtKind::Return(Some(int(0))))]),
      })),
      var("a", Some(int(1))),
    ])).unwrap();
    assert_eq!(ir.entry.as_deref(), Some("main"));
    // toplevel still compiles, after main in reservation order
    assert!(ir.function("__toplevel").is_some());
  }

  #[test]
  fn ternary_lowers_to_a_two_way_branch_over_one_temp() {
    let ir = lower_program(&prog(vec![var("x", Some(ex(ExprKind::Ternary {
      cond: Box::new(ex(ExprKind::Lit(Literal::Bool(true)))),
      then: Box::new(int(1)),
      els: Box::new(int(2)),
    })))])).unwrap();
    let body = &ir.functions[0].body;
    assert!(body.iter().any(|i| matches!(i, Instr::CJump { .. })));
    let move_dsts: Vec<_> = body.iter()
      .filter_map(|i| match i {
        Instr::Move { dst: dst @ Operand::Temp(_), .. } => Some(dst.clone()),
        _ => None,
      })
      .collect();
    assert_eq!(move_dsts.len(), 2);
    assert_eq!(move_dsts[0], move_dsts[1]);
  }

  #[test]
  fn break_and_continue_target_the_loop_frame() {
    let ir = lower_program(&prog(vec![stmt(StmtKind::While {
      cond: ex(ExprKind::Lit(Literal::Bool(true))),
      body: block(vec![stmt(StmtKind::Break), stmt(StmtKind::Continue)]),
    })])).unwrap();
    let body = &ir.functions[0].body;
    let jumps: Vec<_> = body.iter()
      .filter_map(|i| match i { Instr::Jump(l) => Some(*l), _ => None })
      .collect();
    // break to the exit, continue to the header, loop backedge to the header
    assert_eq!(jumps.len(), 3);
    assert_eq!(jumps[1], jumps[2]);
    assert_ne!(jumps[0], jumps[1]);
  }

  #[test]
  fn try_catch_compiles_only_the_try_block() {
    let ir = lower_program(&prog(vec![stmt(StmtKind::TryCatch {
      try_blk: block(vec![stmt(StmtKind::Expr(call(ident("print"), vec![int(1)])))]),
      err_name: "err".into(),
      catch_blk: block(vec![stmt(StmtKind::Expr(call(ident("print"), vec![int(2)])))]),
    })])).unwrap();
    let top = &ir.functions[0];
    let calls: Vec<_> = top.body.iter()
      .filter_map(|i| match i {
        Instr::Call { args, .. } => Some(args.clone()),
        _ => None,
      })
      .collect();
    assert_eq!(calls, vec![vec![Operand::Int(1)]]);
    // the catch variable still owns a slot for scope conformity
    assert!(top.locals.iter().any(|l| &**l == "err"));
  }

  #[test]
  fn switch_cases_fall_through_without_breaks() {
    let case = |e: Expr, body: Vec<Stmt>| SwitchCase { loc: loc(), expr: e, block: block(body) };
    let ir = lower_program(&prog(vec![
      var("x", Some(int(2))),
      stmt(StmtKind::Switch {
        expr: ident("x"),
        cases: vec![
          case(int(1), vec![stmt(StmtKind::Expr(call(ident("print"), vec![int(1)])))]),
          case(int(2), vec![stmt(StmtKind::Expr(call(ident("print"), vec![int(2)])))]),
        ],
        default: None,
      }),
    ])).unwrap();
    let body = &ir.functions[0].body;
    // two equality tests against the discriminant, no jump between the
    // case bodies
    let tests = body.iter()
      .filter(|i| matches!(i, Instr::CJump { op: CmpOp::Eq, .. }))
      .count();
    assert_eq!(tests, 2);
    assert!(!body.iter().any(|i| matches!(i, Instr::Jump(_))));
  }

  #[test]
  fn string_plus_lowers_through_the_concat_runtime() {
    let ir = lower_program(&prog(vec![
      var("a", Some(int(5))),
      var("s", Some(ex(ExprKind::Binary {
        op: Binop::Add,
        lhs: Box::new(string("x=")),
        rhs: Box::new(ident("a")),
      }))),
    ])).unwrap();
    let body = &ir.functions[0].body;
    assert!(body.iter().any(|i| matches!(i,
      Instr::Call { func, .. } if &**func == "__concat")));
    assert_eq!(ir.strings, vec![b"x=\0".to_vec().into_boxed_slice()]);
  }

  #[test]
  fn derived_fields_sit_after_base_fields() {
    let class = |name: &str, base: Option<&str>, members: Vec<Stmt>| {
      stmt(StmtKind::Class(ClassDecl {
        name: name.into(),
        base_name: base.map(Into::into),
        members,
      }))
    };
    let method = |name: &str, body: Vec<Stmt>| {
      stmt(StmtKind::Func(FuncDecl {
        name: name.into(),
        params: vec![],
        ret_ann: None,
        body: block(body),
      }))
    };
    let this_field = |f: &str| ex(ExprKind::Member {
      obj: Box::new(ex(ExprKind::This)),
      name: f.into(),
    });
    let ir = lower_program(&prog(vec![
      class("A", None, vec![var("a", None)]),
      class("B", Some("A"), vec![
        var("b", None),
        method("init", vec![
          stmt(StmtKind::Assign { target: this_field("a"), value: int(1) }),
          stmt(StmtKind::Assign { target: this_field("b"), value: int(2) }),
        ]),
      ]),
    ])).unwrap();
    let init = ir.function("B__init").unwrap();
    assert!(init.body.contains(&Instr::Store {
      base: Operand::Param("this".into()),
      offset: 0,
      src: Operand::Int(1),
    }));
    assert!(init.body.contains(&Instr::Store {
      base: Operand::Param("this".into()),
      offset: 4,
      src: Operand::Int(2),
    }));
  }

  #[test]
  fn captured_variables_are_not_materialized() {
    // the checker records the capture, but the IR level rejects the
    // read: nested functions compile as plain globals
    let err = lower_program(&prog(vec![stmt(StmtKind::Func(FuncDecl {
      name: "outer".into(),
      params: vec![Param { loc: loc(), name: "x".into(), ann: Some("integer".into()) }],
      ret_ann: None,
      body: block(vec![stmt(StmtKind::Func(FuncDecl {
        name: "inner".into(),
        params: vec![],
        ret_ann: Some("integer".into()),
        body: block(vec![stmt(StmtKind::Return(Some(ident("x"))))]),
      }))]),
    }))])).unwrap_err();
    assert_eq!(err, BuildError::UnresolvedName("x".into()));
  }

  #[test]
  fn parameters_resolve_without_a_binding() {
    let ir = lower_program(&prog(vec![stmt(StmtKind::Func(FuncDecl {
      name: "id".into(),
      params: vec![Param { loc: loc(), name: "v".into(), ann: None }],
      ret_ann: Some("integer".into()),
      body: block(vec![stmt(StmtKind::Return(Some(ident("v"))))]),
    }))])).unwrap();
    assert_eq!(ir.function("id").unwrap().body,
      vec![Instr::Ret(Some(Operand::Param("v".into())))]);
  }
}
