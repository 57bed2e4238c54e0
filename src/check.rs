//! The semantic analyzer: two passes over the AST that populate the
//! symbol environment and accumulate diagnostics.
//!
//! Pass 1 (collection) declares every function and class, with member
//! and constructor signatures, without checking statement bodies;
//! bodies are entered only to discover nested declarations. Pass 2
//! enforces typing, scoping, control-flow rules, definite returns and
//! dead code. The analyzer never fails: it always returns the full
//! error list together with the environment it built, and later phases
//! run only when the list is empty.

use std::fmt;

use crate::types::Loc;
use crate::types::ast::{
  Binop, Block, ClassDecl, Expr, ExprKind, FuncDecl, Literal, Program, Stmt, StmtKind, Unop,
};
use crate::types::entity::{Env, SymFlags, SymId, SymKind};
use crate::types::ty::{
  Type, array_literal_element_type, assignable, binary_result, call_compatible,
  index_result, ternary_unify, unary_result,
};

/// The analyzer's result: diagnostics plus the populated environment.
#[derive(Debug)]
pub struct Analysis {
  /// Semantic errors as `"[line:col] message"` strings, in source order.
  pub errors: Vec<String>,
  /// The symbol environment, usable even when errors were reported.
  pub env: Env,
}

impl Analysis {
  /// Whether the program passed all checks.
  #[must_use] pub fn is_ok(&self) -> bool { self.errors.is_empty() }
}

/// Run both analyzer passes over a program.
#[must_use] pub fn check_program(prog: &Program) -> Analysis {
  let mut ck = Checker::new();
  ck.declare_builtins();
  for s in &prog.stmts { ck.collect_stmt(s) }
  ck.dead.push(false);
  for s in &prog.stmts {
    if ck.dead_here() {
      ck.err(s.loc, "unreachable code");
    } else {
      ck.check_stmt(s);
    }
  }
  ck.dead.pop();
  Analysis { errors: ck.errors, env: ck.env }
}

struct Checker {
  errors: Vec<String>,
  env: Env,
  loop_depth: u32,
  // one flag per open block or function body; set once control cannot
  // continue past the current statement
  dead: Vec<bool>,
}

impl Checker {
  fn new() -> Self {
    Checker { errors: vec![], env: Env::new(), loop_depth: 0, dead: vec![] }
  }

  fn err(&mut self, loc: Loc, msg: impl fmt::Display) {
    self.errors.push(format!("[{loc}] {msg}"));
  }

  fn declare_builtins(&mut self) {
    if let Ok(f) = self.env.declare_func("print", Type::Void) {
      let sym = self.env.sym_mut(f);
      sym.ty = Some(Type::func(vec![Type::Unknown], Type::Void));
      sym.flags |= SymFlags::IS_BUILTIN;
    }
  }

  fn dead_here(&self) -> bool { self.dead.last().copied().unwrap_or(false) }

  fn dead_mark(&mut self) {
    if let Some(flag) = self.dead.last_mut() { *flag = true }
  }

  // ---------------- pass 1: declaration collection ----------------

  fn collect_stmt(&mut self, s: &Stmt) {
    match &s.k {
      StmtKind::Func(d) => self.collect_func(d, s.loc),
      StmtKind::Class(d) => self.collect_class(d, s.loc),
      StmtKind::Block(b) => self.collect_block(b),
      _ => {}
    }
  }

  fn collect_block(&mut self, b: &Block) {
    self.env.push_block();
    for s in &b.stmts { self.collect_stmt(s) }
    self.env.pop();
  }

  fn param_types(params: &[crate::types::ast::Param]) -> Vec<Type> {
    params.iter()
      .map(|p| p.ann.as_deref().map_or(Type::Unknown, Type::parse_ann))
      .collect()
  }

  fn collect_func(&mut self, d: &FuncDecl, loc: Loc) {
    let ret = d.ret_ann.as_deref().map_or(Type::Void, Type::parse_ann);
    let f = match self.env.declare_func(&d.name, ret.clone()) {
      Ok(f) => f,
      Err(e) => return self.err(loc, e),
    };
    self.env.sym_mut(f).ty = Some(Type::func(Self::param_types(&d.params), ret));
    // enter the body only to pick up nested declarations
    self.env.push_function(f);
    self.collect_block(&d.body);
    self.env.pop();
  }

  fn collect_class(&mut self, d: &ClassDecl, loc: Loc) {
    let class = match self.env.declare_class(&d.name) {
      Ok(c) => c,
      Err(e) => return self.err(loc, e),
    };
    self.env.push_class(class);
    for m in &d.members {
      match &m.k {
        StmtKind::Var { name, ann, .. } | StmtKind::Const { name, ann, .. } => {
          let fty = ann.as_deref().map(Type::parse_ann);
          if let Err(e) = self.env.class_add_field(class, name, fty) {
            self.err(m.loc, e);
          }
        }
        StmtKind::Func(f) if f.name == "constructor" => {
          let ctor = match self.env.class_set_ctor(class) {
            Ok(c) => c,
            Err(e) => { self.err(m.loc, e); continue }
          };
          self.env.sym_mut(ctor).ty =
            Some(Type::func(Self::param_types(&f.params), Type::Void));
          self.env.push_function(ctor);
          self.collect_block(&f.body);
          self.env.pop();
        }
        StmtKind::Func(f) => {
          let ret = f.ret_ann.as_deref().map_or(Type::Void, Type::parse_ann);
          let meth = match self.env.class_add_method(class, &f.name, ret.clone()) {
            Ok(m) => m,
            Err(e) => { self.err(m.loc, e); continue }
          };
          self.env.sym_mut(meth).ty = Some(Type::func(Self::param_types(&f.params), ret));
          self.env.push_function(meth);
          self.collect_block(&f.body);
          self.env.pop();
        }
        _ => {}
      }
    }
    self.env.pop();
    if d.base_name.is_some() {
      self.env.sym_mut(class).base_name = d.base_name.clone();
    }
  }

  // ---------------- pass 2: checking ----------------

  fn check_block(&mut self, b: &Block) {
    self.env.push_block();
    self.dead.push(false);
    for s in &b.stmts {
      if self.dead_here() {
        self.err(s.loc, "unreachable code");
      } else {
        self.check_stmt(s);
      }
    }
    self.dead.pop();
    self.env.pop();
  }

  fn check_stmt(&mut self, s: &Stmt) {
    match &s.k {
      StmtKind::Block(b) => self.check_block(b),
      StmtKind::Var { name, ann, init } => self.check_var(s.loc, name, ann.as_deref(), init),
      StmtKind::Const { name, ann, init } =>
        self.check_const(s.loc, name, ann.as_deref(), init),
      StmtKind::Assign { target, value } => self.check_assign(s.loc, target, value),
      StmtKind::If { cond, then_blk, else_blk } => {
        if !matches!(self.check_expr(cond), Type::Bool) {
          self.err(s.loc, "if condition must be boolean");
        }
        self.check_block(then_blk);
        if let Some(e) = else_blk { self.check_block(e) }
      }
      StmtKind::While { cond, body } => {
        if !matches!(self.check_expr(cond), Type::Bool) {
          self.err(s.loc, "while condition must be boolean");
        }
        self.loop_depth += 1;
        self.check_block(body);
        self.loop_depth -= 1;
      }
      StmtKind::DoWhile { body, cond } => {
        self.loop_depth += 1;
        self.check_block(body);
        self.loop_depth -= 1;
        if !matches!(self.check_expr(cond), Type::Bool) {
          self.err(s.loc, "do-while condition must be boolean");
        }
      }
      StmtKind::For { init, cond, update, body } => {
        self.env.push_block();
        if let Some(init) = init { self.check_stmt(init) }
        if let Some(cond) = cond {
          let t = self.check_expr(cond);
          if !matches!(t, Type::Bool) {
            self.err(s.loc, format_args!("for condition must be boolean, not {t}"));
          }
        }
        self.loop_depth += 1;
        self.check_block(body);
        self.loop_depth -= 1;
        if let Some(update) = update { self.check_stmt(update) }
        self.env.pop();
      }
      StmtKind::Foreach { var, iterable, body } => {
        let arr_t = self.check_expr(iterable);
        let elem_t = match &arr_t {
          Type::Array(elem) => (**elem).clone(),
          _ => {
            self.err(s.loc, format_args!("foreach expects an array, not {arr_t}"));
            Type::Unknown
          }
        };
        self.env.push_block();
        match self.env.declare_var(var, Some(elem_t)) {
          Ok(v) => self.env.sym_mut(v).flags |= SymFlags::INITED,
          Err(e) => self.err(s.loc, e),
        }
        self.loop_depth += 1;
        self.check_block(body);
        self.loop_depth -= 1;
        self.env.pop();
      }
      StmtKind::Switch { expr, cases, default } => {
        let disc_t = self.check_expr(expr);
        self.env.push_block();
        for c in cases {
          let ct = self.check_expr(&c.expr);
          if !(assignable(&ct, &disc_t) && assignable(&disc_t, &ct)) {
            self.err(c.loc,
              format_args!("case type {ct} is not compatible with switch type {disc_t}"));
          }
          self.check_block(&c.block);
        }
        if let Some(d) = default { self.check_block(d) }
        self.env.pop();
      }
      StmtKind::TryCatch { try_blk, err_name, catch_blk } => {
        self.env.push_block();
        self.check_block(try_blk);
        self.env.pop();
        self.env.push_block();
        // the runtime error value is opaque
        match self.env.declare_var(err_name, Some(Type::Unknown)) {
          Ok(v) => self.env.sym_mut(v).flags |= SymFlags::INITED,
          Err(e) => self.err(s.loc, e),
        }
        self.check_block(catch_blk);
        self.env.pop();
      }
      StmtKind::Return(value) => {
        let Some(fun) = self.env.current_function() else {
          self.err(s.loc, "return outside a function");
          self.dead_mark();
          return
        };
        let rt = match value {
          Some(v) => self.check_expr(v),
          None => Type::Void,
        };
        let expected = self.env.sym(fun).ret.clone().unwrap_or(Type::Void);
        if !assignable(&rt, &expected) {
          self.err(s.loc, format_args!("incompatible return type: {rt} -> {expected}"));
        }
        self.dead_mark();
      }
      StmtKind::Break => {
        if self.loop_depth == 0 { self.err(s.loc, "break is only allowed inside loops") }
        self.dead_mark();
      }
      StmtKind::Continue => {
        if self.loop_depth == 0 { self.err(s.loc, "continue is only allowed inside loops") }
        self.dead_mark();
      }
      StmtKind::Expr(e) => { self.check_expr(e); }
      StmtKind::Func(d) => self.check_func(d, s.loc),
      StmtKind::Class(d) => self.check_class(d, s.loc),
    }
  }

  fn check_var(&mut self, loc: Loc, name: &str, ann: Option<&str>, init: &Option<Expr>) {
    let declared = ann.map(Type::parse_ann);
    let sym = match self.env.declare_var(name, declared) {
      Ok(s) => Some(s),
      Err(e) => { self.err(loc, e); None }
    };
    let Some(init) = init else { return };
    let rhs = self.check_expr(init);
    let Some(sym) = sym else { return };
    match &self.env.sym(sym).ty {
      None | Some(Type::Unknown) => {
        let s = self.env.sym_mut(sym);
        s.ty = Some(rhs);
        s.flags |= SymFlags::INITED;
      }
      Some(ty) => {
        if assignable(&rhs, ty) {
          self.env.sym_mut(sym).flags |= SymFlags::INITED;
        } else {
          let ty = ty.clone();
          self.err(loc,
            format_args!("incompatible assignment in declaration of '{name}': {rhs} -> {ty}"));
        }
      }
    }
  }

  fn check_const(&mut self, loc: Loc, name: &str, ann: Option<&str>, init: &Option<Expr>) {
    if init.is_none() {
      self.err(loc, format_args!("const '{name}' requires an initializer"));
    }
    let declared = ann.map(Type::parse_ann);
    let sym = match self.env.declare_const(name, declared) {
      Ok(s) => Some(s),
      Err(e) => { self.err(loc, e); None }
    };
    let rhs = match init {
      Some(init) => self.check_expr(init),
      None => Type::Unknown,
    };
    let Some(sym) = sym else { return };
    match &self.env.sym(sym).ty {
      None | Some(Type::Unknown) => self.env.sym_mut(sym).ty = Some(rhs),
      Some(ty) => {
        if !assignable(&rhs, ty) {
          let ty = ty.clone();
          self.err(loc, format_args!("const '{name}': incompatible type {rhs} -> {ty}"));
        }
      }
    }
    self.env.sym_mut(sym).flags |= SymFlags::INITED;
  }

  fn check_assign(&mut self, loc: Loc, target: &Expr, value: &Expr) {
    let mut lhs_sym: Option<SymId> = None;
    let lhs_t = match &target.k {
      ExprKind::Ident(name) => match self.env.resolve(name) {
        None => {
          self.err(loc, format_args!("use of undeclared variable: '{name}'"));
          Type::Unknown
        }
        Some((id, _)) => {
          if self.env.sym(id).kind == SymKind::Const {
            self.err(loc, format_args!("cannot assign to const '{name}'"));
          }
          lhs_sym = Some(id);
          self.env.sym(id).ty.clone().unwrap_or(Type::Unknown)
        }
      },
      ExprKind::Member { obj, name } => {
        let obj_t = self.check_expr(obj);
        let Type::Class(cname) = &obj_t else {
          self.err(loc, format_args!("member assignment on a non-class value: {obj_t}"));
          return self.finish_assign(loc, None, Type::Unknown, value)
        };
        match self.env.resolve_class(cname) {
          None => {
            self.err(loc, format_args!("class not declared: {cname}"));
            Type::Unknown
          }
          Some(class) => match self.env.class_lookup_member(class, name) {
            None => {
              self.err(loc,
                format_args!("member '{name}' does not exist in class {cname}"));
              Type::Unknown
            }
            Some(mem) => self.env.sym(mem).ty.clone().unwrap_or(Type::Unknown),
          },
        }
      }
      ExprKind::Index { .. } => self.check_expr(target),
      _ => {
        self.err(loc, "invalid assignment target");
        Type::Unknown
      }
    };
    self.finish_assign(loc, lhs_sym, lhs_t, value)
  }

  fn finish_assign(&mut self, loc: Loc, lhs_sym: Option<SymId>, lhs_t: Type, value: &Expr) {
    let rhs_t = self.check_expr(value);
    if let Some(sym) = lhs_sym {
      match &self.env.sym(sym).ty {
        None | Some(Type::Unknown) => {
          let s = self.env.sym_mut(sym);
          s.ty = Some(rhs_t);
          s.flags |= SymFlags::INITED;
        }
        Some(ty) => {
          if assignable(&rhs_t, ty) {
            self.env.sym_mut(sym).flags |= SymFlags::INITED;
          } else {
            let ty = ty.clone();
            self.err(loc, format_args!("incompatible assignment: {rhs_t} -> {ty}"));
          }
        }
      }
    } else if !lhs_t.is_unknown() && !rhs_t.is_unknown() && !assignable(&rhs_t, &lhs_t) {
      self.err(loc, format_args!("incompatible assignment: {rhs_t} -> {lhs_t}"));
    }
  }

  fn check_func(&mut self, d: &FuncDecl, loc: Loc) {
    let fun = match self.env.resolve(&d.name) {
      Some((id, _)) if self.env.sym(id).kind == SymKind::Func => id,
      // nested functions are discovered here rather than in pass 1
      _ => {
        let ret = d.ret_ann.as_deref().map_or(Type::Void, Type::parse_ann);
        match self.env.declare_func(&d.name, ret.clone()) {
          Ok(f) => {
            self.env.sym_mut(f).ty = Some(Type::func(vec![], ret));
            f
          }
          Err(e) => return self.err(loc, e),
        }
      }
    };
    self.env.push_function(fun);
    self.check_signature_and_body(fun, d);
    let rt = self.env.sym(fun).ret.clone().unwrap_or(Type::Void);
    if rt != Type::Void && !block_returns(&d.body) {
      self.err(loc, format_args!(
        "function '{}' must return a value of type {rt} on all paths", d.name));
    }
    self.env.pop();
  }

  /// Declare the parameters of `fun` in the current (function) scope,
  /// refresh its signature type and check its body.
  fn check_signature_and_body(&mut self, fun: SymId, d: &FuncDecl) {
    self.env.sym_mut(fun).params.clear();
    let mut pids = vec![];
    for p in &d.params {
      let pt = p.ann.as_deref().map_or(Type::Unknown, Type::parse_ann);
      match self.env.declare_param(&p.name, pt) {
        Ok(id) => pids.push(id),
        Err(e) => self.err(p.loc, e),
      }
    }
    let pts = pids.iter()
      .map(|&id| self.env.sym(id).ty.clone().unwrap_or(Type::Unknown))
      .collect::<Vec<_>>();
    let rt = self.env.sym(fun).ret.clone().unwrap_or(Type::Void);
    let sym = self.env.sym_mut(fun);
    sym.params = pids;
    sym.ty = Some(Type::func(pts, rt));
    self.dead.push(false);
    self.check_block(&d.body);
    self.dead.pop();
  }

  fn check_class(&mut self, d: &ClassDecl, loc: Loc) {
    let class = match self.env.resolve(&d.name) {
      Some((id, _)) if self.env.sym(id).kind == SymKind::Class => id,
      _ => match self.env.declare_class(&d.name) {
        Ok(c) => c,
        Err(e) => return self.err(loc, e),
      },
    };
    self.env.push_class(class);
    for m in &d.members {
      match &m.k {
        StmtKind::Var { name, init, .. } => {
          if let Some(init) = init {
            let rhs = self.check_expr(init);
            self.check_field_init(m.loc, class, name, &rhs, "field");
          }
        }
        StmtKind::Const { name, init, .. } => match init {
          None => self.err(m.loc,
            format_args!("class const '{name}' requires an initializer")),
          Some(init) => {
            let rhs = self.check_expr(init);
            self.check_field_init(m.loc, class, name, &rhs, "class const");
          }
        },
        StmtKind::Func(f) if f.name == "constructor" => {
          let ctor = match self.env.sym(class).ctor {
            Some(c) => c,
            None => self.env.class_set_ctor(class).expect("no constructor registered"),
          };
          self.env.push_function(ctor);
          self.check_signature_and_body(ctor, f);
          self.env.pop();
        }
        StmtKind::Func(f) => {
          let meth = match self.env.class_lookup_member(class, &f.name) {
            Some(m) if self.env.sym(m).kind == SymKind::Func => m,
            _ => match self.env.class_add_method(class, &f.name, Type::Void) {
              Ok(m) => m,
              Err(e) => { self.err(m.loc, e); continue }
            },
          };
          let rt = f.ret_ann.as_deref().map_or(Type::Void, Type::parse_ann);
          self.env.sym_mut(meth).ret = Some(rt.clone());
          self.env.push_function(meth);
          self.check_signature_and_body(meth, f);
          self.env.pop();
          if rt != Type::Void && !block_returns(&f.body) {
            self.err(m.loc, format_args!(
              "method '{}' must return a value of type {rt} on all paths", f.name));
          }
        }
        _ => {}
      }
    }
    self.env.pop();
    if let Some(base) = self.env.sym(class).base_name.clone() {
      if self.env.resolve_class(&base).is_none() {
        self.err(loc, format_args!("base class not declared: {base}"));
      }
    }
  }

  fn check_field_init(&mut self, loc: Loc, class: SymId, name: &str, rhs: &Type, what: &str) {
    if let Some(fld) = self.env.class_lookup_member(class, name) {
      if let Some(ft) = &self.env.sym(fld).ty {
        if !assignable(rhs, ft) {
          let ft = ft.clone();
          self.err(loc, format_args!("{what} '{name}': incompatible type {rhs} -> {ft}"));
        }
      }
    }
  }

  // ---------------- expressions ----------------

  fn check_expr(&mut self, e: &Expr) -> Type {
    match &e.k {
      ExprKind::Ident(name) => match self.env.resolve(name) {
        None => {
          self.err(e.loc, format_args!("use of undeclared variable: '{name}'"));
          Type::Unknown
        }
        Some((id, def_scope)) => {
          self.env.note_capture_if_needed(def_scope, id);
          self.env.sym(id).ty.clone().unwrap_or(Type::Unknown)
        }
      },
      ExprKind::Lit(lit) => match lit {
        Literal::Int(_) => Type::Int,
        Literal::Bool(_) => Type::Bool,
        Literal::Str(_) => Type::Str,
        Literal::Null => Type::Null,
      },
      ExprKind::Unary { op, expr } => {
        let t = self.check_expr(expr);
        match unary_result(*op, &t) {
          Some(r) => r,
          None => {
            self.err(e.loc, match op {
              Unop::Not => "operator '!' requires boolean",
              Unop::Neg => "operator '-' requires a numeric operand",
            });
            Type::Unknown
          }
        }
      }
      ExprKind::Binary { op, lhs, rhs } => {
        let lt = self.check_expr(lhs);
        let rt = self.check_expr(rhs);
        match binary_result(*op, &lt, &rt) {
          Some(r) => r,
          None => {
            match op {
              Binop::And | Binop::Or =>
                self.err(e.loc, "operators '&&' and '||' require boolean operands"),
              Binop::Add => self.err(e.loc,
                "arithmetic operation requires numeric operands (or string + any for '+')"),
              Binop::Rem => self.err(e.loc, "operator '%' requires integer operands"),
              Binop::Sub | Binop::Mul | Binop::Div =>
                self.err(e.loc, "arithmetic operation requires numeric operands"),
              _ => self.err(e.loc, format_args!(
                "incompatible comparison: {lt} {} {rt}", op.as_str())),
            }
            Type::Unknown
          }
        }
      }
      ExprKind::Ternary { cond, then, els } => {
        if !matches!(self.check_expr(cond), Type::Bool) {
          self.err(e.loc, "ternary condition must be boolean");
        }
        let tt = self.check_expr(then);
        let et = self.check_expr(els);
        match ternary_unify(&tt, &et) {
          Some(u) => u,
          None => {
            self.err(e.loc, format_args!("incompatible ternary branches: {tt} vs {et}"));
            Type::Unknown
          }
        }
      }
      ExprKind::Index { obj, index } => {
        let arr_t = self.check_expr(obj);
        let idx_t = self.check_expr(index);
        match index_result(&arr_t, &idx_t) {
          Some(r) => r,
          None => {
            if !matches!(arr_t, Type::Array(_)) {
              self.err(e.loc, format_args!("indexing a non-array value: {arr_t}"));
            } else {
              self.err(e.loc, "array index must be integer");
            }
            Type::Unknown
          }
        }
      }
      ExprKind::Array(elems) => {
        let ts = elems.iter().map(|el| self.check_expr(el)).collect::<Vec<_>>();
        let elem_t = array_literal_element_type(&ts);
        if elem_t.is_unknown() && ts.len() > 1 {
          self.err(e.loc, "array literal with incompatible element types");
        }
        Type::Array(Box::new(elem_t))
      }
      ExprKind::Member { obj, name } => {
        let obj_t = self.check_expr(obj);
        let Type::Class(cname) = &obj_t else {
          self.err(e.loc, format_args!("member access on a non-class value: {obj_t}"));
          return Type::Unknown
        };
        let Some(class) = self.env.resolve_class(cname) else {
          self.err(e.loc, format_args!("class not declared: {cname}"));
          return Type::Unknown
        };
        let Some(mem) = self.env.class_lookup_member(class, name) else {
          self.err(e.loc, format_args!("member '{name}' does not exist in class {cname}"));
          return Type::Unknown
        };
        let mem = self.env.sym(mem);
        if mem.kind == SymKind::Func {
          mem.ty.clone().unwrap_or_else(|| Type::func(vec![], Type::Void))
        } else {
          mem.ty.clone().unwrap_or(Type::Unknown)
        }
      }
      ExprKind::Call { callee, args } => self.check_call(e.loc, callee, args),
      ExprKind::This => {
        let cls = self.env.current_class();
        let fun = self.env.current_function();
        match (cls, fun) {
          (Some(cls), Some(fun)) if self.env.sym(fun).is_method() =>
            Type::Class(self.env.sym(cls).name.clone()),
          _ => {
            self.err(e.loc, "use of 'this' outside a class method");
            Type::Unknown
          }
        }
      }
    }
  }

  fn check_call(&mut self, loc: Loc, callee: &Expr, args: &[Expr]) -> Type {
    let arg_ts = args.iter().map(|a| self.check_expr(a)).collect::<Vec<_>>();
    match &callee.k {
      ExprKind::Ident(name) => {
        let Some((id, _)) = self.env.resolve(name) else {
          self.err(loc, format_args!("call to undeclared identifier: '{name}'"));
          return Type::Unknown
        };
        match self.env.sym(id).kind {
          SymKind::Func => {
            let ok = self.env.sym(id).ty.as_ref()
              .is_some_and(|t| call_compatible(t, &arg_ts));
            if !ok {
              self.err(loc, format_args!("call to '{name}' with incompatible arguments"));
            }
            self.env.sym(id).ret.clone().unwrap_or(Type::Void)
          }
          SymKind::Class => {
            match self.env.sym(id).ctor {
              None => {
                if !arg_ts.is_empty() {
                  self.err(loc, format_args!(
                    "constructor of '{name}' not declared; expected 0 arguments"));
                }
              }
              Some(ctor) => {
                let ok = self.env.sym(ctor).ty.as_ref()
                  .is_some_and(|t| call_compatible(t, &arg_ts));
                if !ok {
                  self.err(loc, format_args!(
                    "call to constructor of '{name}' with incompatible arguments"));
                }
              }
            }
            Type::Class(name.clone())
          }
          _ => {
            self.err(loc, format_args!("identifier is not callable: '{name}'"));
            Type::Unknown
          }
        }
      }
      ExprKind::Member { obj, name } => {
        let obj_t = self.check_expr(obj);
        let Type::Class(cname) = &obj_t else {
          self.err(loc, format_args!("method call on a non-class value: {obj_t}"));
          return Type::Unknown
        };
        let Some(class) = self.env.resolve_class(cname) else {
          self.err(loc, format_args!("class not declared: {cname}"));
          return Type::Unknown
        };
        let mem = self.env.class_lookup_member(class, name)
          .filter(|&m| self.env.sym(m).kind == SymKind::Func);
        let Some(mem) = mem else {
          self.err(loc, format_args!("method '{name}' does not exist in class {cname}"));
          return Type::Unknown
        };
        let ok = self.env.sym(mem).ty.as_ref().is_some_and(|t| call_compatible(t, &arg_ts));
        if !ok {
          self.err(loc, format_args!("call to method '{name}' with incompatible arguments"));
        }
        self.env.sym(mem).ret.clone().unwrap_or(Type::Void)
      }
      _ => {
        self.err(loc, "attempt to call a non-callable value");
        Type::Unknown
      }
    }
  }
}

/// Conservative definite-return predicate for a block: some statement
/// in it guarantees a return (everything after it is dead anyway).
#[must_use] pub fn block_returns(b: &Block) -> bool {
  b.stmts.iter().any(stmt_returns)
}

/// Whether a statement guarantees a `return` on every path through it.
/// Loops never do; `if` needs both arms; `try`/`catch` needs both
/// blocks; `switch` needs a default and every arm returning.
#[must_use] pub fn stmt_returns(s: &Stmt) -> bool {
  match &s.k {
    StmtKind::Return(_) => true,
    StmtKind::Block(b) => block_returns(b),
    StmtKind::If { then_blk, else_blk: Some(els), .. } =>
      block_returns(then_blk) && block_returns(els),
    StmtKind::TryCatch { try_blk, catch_blk, .. } =>
      block_returns(try_blk) && block_returns(catch_blk),
    StmtKind::Switch { cases, default: Some(default), .. } =>
      cases.iter().all(|c| block_returns(&c.block)) && block_returns(default),
    _ => false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::Spanned;
  use crate::types::ast::Param;

  fn loc() -> Loc { Loc::new(1, 1) }
  fn stmt(k: StmtKind) -> Stmt { Spanned::new(loc(), k) }
  fn ex(k: ExprKind) -> Expr { Spanned::new(loc(), k) }
  fn ident(n: &str) -> Expr { ex(ExprKind::Ident(n.into())) }
  fn int(v: i32) -> Expr { ex(ExprKind::Lit(Literal::Int(v))) }
  fn string(s: &str) -> Expr { ex(ExprKind::Lit(Literal::Str(s.into()))) }
  fn block(stmts: Vec<Stmt>) -> Block { Block { loc: loc(), stmts } }
  fn param(n: &str, ann: &str) -> Param {
    Param { loc: loc(), name: n.into(), ann: Some(ann.into()) }
  }
  fn binary(op: Binop, lhs: Expr, rhs: Expr) -> Expr {
    ex(ExprKind::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) })
  }
  fn call(callee: Expr, args: Vec<Expr>) -> Expr {
    ex(ExprKind::Call { callee: Box::new(callee), args })
  }
  fn var(name: &str, ann: Option<&str>, init: Option<Expr>) -> Stmt {
    stmt(StmtKind::Var { name: name.into(), ann: ann.map(Into::into), init })
  }
  fn func(name: &str, params: Vec<Param>, ret: Option<&str>, body: Vec<Stmt>) -> Stmt {
    stmt(StmtKind::Func(FuncDecl {
      name: name.into(),
      params,
      ret_ann: ret.map(Into::into),
      body: block(body),
    }))
  }
  fn ret(v: Option<Expr>) -> Stmt { stmt(StmtKind::Return(v)) }
  fn prog(stmts: Vec<Stmt>) -> Program { Program { stmts } }

  fn find_func<'a>(env: &'a Env, name: &str) -> &'a crate::types::entity::Symbol {
    env.syms.enum_iter()
      .map(|(_, s)| s)
      .find(|s| s.kind == SymKind::Func && s.name == name)
      .expect("function symbol not found")
  }

  #[test]
  fn closure_captures_outer_param_and_local() {
    // function outer(x: integer): integer {
    //   let k: integer = 10;
    //   function inner(y: integer): integer { return x + y + k; }
    //   return inner(5);
    // }
    let p = prog(vec![func("outer", vec![param("x", "integer")], Some("integer"), vec![
      var("k", Some("integer"), Some(int(10))),
      func("inner", vec![param("y", "integer")], Some("integer"), vec![
        ret(Some(binary(Binop::Add,
          binary(Binop::Add, ident("x"), ident("y")),
          ident("k")))),
      ]),
      ret(Some(call(ident("inner"), vec![int(5)]))),
    ])]);
    let analysis = check_program(&p);
    assert_eq!(analysis.errors, Vec::<String>::new());
    let inner = find_func(&analysis.env, "inner");
    let captured = inner.captures.iter()
      .map(|&c| analysis.env.sym(c).name.as_str())
      .collect::<Vec<_>>();
    assert_eq!(captured, ["x", "k"]);
  }

  #[test]
  fn missing_definite_return_is_reported() {
    // function g(b: boolean): integer { if (b) { return 1; } }
    let p = prog(vec![func("g", vec![param("b", "boolean")], Some("integer"), vec![
      stmt(StmtKind::If {
        cond: ident("b"),
        then_blk: block(vec![ret(Some(int(1)))]),
        else_blk: None,
      }),
    ])]);
    let analysis = check_program(&p);
    assert_eq!(analysis.errors.len(), 1);
    assert!(analysis.errors[0].contains("must return"), "{}", analysis.errors[0]);
  }

  #[test]
  fn undeclared_variable_is_reported() {
    let p = prog(vec![var("a", Some("integer"), Some(ident("nope")))]);
    let analysis = check_program(&p);
    assert!(analysis.errors.iter().any(|e| e.contains("undeclared variable: 'nope'")));
  }

  #[test]
  fn const_reassignment_is_reported() {
    let p = prog(vec![
      stmt(StmtKind::Const { name: "a".into(), ann: Some("integer".into()), init: Some(int(1)) }),
      stmt(StmtKind::Assign { target: ident("a"), value: int(2) }),
    ]);
    let analysis = check_program(&p);
    assert!(analysis.errors.iter().any(|e| e.contains("cannot assign to const 'a'")));
  }

  #[test]
  fn break_outside_loop_is_reported() {
    let p = prog(vec![stmt(StmtKind::Break)]);
    let analysis = check_program(&p);
    assert!(analysis.errors.iter().any(|e| e.contains("break is only allowed inside loops")));
  }

  #[test]
  fn code_after_return_is_unreachable() {
    let p = prog(vec![func("f", vec![], Some("integer"), vec![
      ret(Some(int(1))),
      var("x", None, Some(int(2))),
    ])]);
    let analysis = check_program(&p);
    assert!(analysis.errors.iter().any(|e| e.contains("unreachable code")));
  }

  #[test]
  fn string_plus_any_is_accepted() {
    let p = prog(vec![
      var("a", Some("integer"), Some(int(5))),
      var("b", Some("string"), Some(binary(Binop::Add, string("x="), ident("a")))),
      var("c", None, Some(binary(Binop::Add, string("hi "),
        ex(ExprKind::Lit(Literal::Bool(true)))))),
    ]);
    let analysis = check_program(&p);
    assert_eq!(analysis.errors, Vec::<String>::new());
  }

  #[test]
  fn undeclared_base_class_is_reported() {
    let p = prog(vec![stmt(StmtKind::Class(ClassDecl {
      name: "Hijo".into(),
      base_name: Some("Padre".into()),
      members: vec![var("x", Some("integer"), None)],
    }))]);
    let analysis = check_program(&p);
    assert!(analysis.errors.iter().any(|e| e.contains("base class not declared: Padre")));
  }

  #[test]
  fn inherited_fields_and_methods_check() {
    // class A { let n: integer; constructor(n) { this.n = n; } get(): integer { return this.n; } }
    // class B : A { constructor(n) { this.n = n; } get2(): integer { return this.get(); } }
    // let b: B = B(7); let k: integer = b.get2();
    let this_n = || ex(ExprKind::Member { obj: Box::new(ex(ExprKind::This)), name: "n".into() });
    let class_a = stmt(StmtKind::Class(ClassDecl {
      name: "A".into(),
      base_name: None,
      members: vec![
        var("n", Some("integer"), None),
        func("constructor", vec![param("n", "integer")], None, vec![
          stmt(StmtKind::Assign { target: this_n(), value: ident("n") }),
        ]),
        func("get", vec![], Some("integer"), vec![ret(Some(this_n()))]),
      ],
    }));
    let class_b = stmt(StmtKind::Class(ClassDecl {
      name: "B".into(),
      base_name: Some("A".into()),
      members: vec![
        func("constructor", vec![param("n", "integer")], None, vec![
          stmt(StmtKind::Assign { target: this_n(), value: ident("n") }),
        ]),
        func("get2", vec![], Some("integer"), vec![
          ret(Some(call(ex(ExprKind::Member {
            obj: Box::new(ex(ExprKind::This)),
            name: "get".into(),
          }), vec![]))),
        ]),
      ],
    }));
    let p = prog(vec![
      class_a,
      class_b,
      var("b", Some("B"), Some(call(ident("B"), vec![int(7)]))),
      var("k", Some("integer"), Some(call(ex(ExprKind::Member {
        obj: Box::new(ident("b")),
        name: "get2".into(),
      }), vec![]))),
    ]);
    let analysis = check_program(&p);
    assert_eq!(analysis.errors, Vec::<String>::new());
  }

  #[test]
  fn switch_case_types_must_match_discriminant() {
    let case = |e: Expr, body: Vec<Stmt>| crate::types::ast::SwitchCase {
      loc: loc(),
      expr: e,
      block: block(body),
    };
    let p = prog(vec![
      var("x", Some("integer"), Some(int(2))),
      stmt(StmtKind::Switch {
        expr: ident("x"),
        cases: vec![case(int(1), vec![]), case(string("two"), vec![])],
        default: None,
      }),
    ]);
    let analysis = check_program(&p);
    assert!(analysis.errors.iter().any(|e| e.contains("case type")));
  }
}
