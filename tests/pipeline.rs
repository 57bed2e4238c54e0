//! End-to-end pipeline scenarios over hand-built ASTs: lowering
//! shapes, optimizer laws, and the structural invariants the IR must
//! keep all the way to the backends.

use std::collections::HashSet;

use pretty_assertions::assert_eq;

use compiscript::types::ast::{
  Binop, Block, ClassDecl, Expr, ExprKind, FuncDecl, Literal, Param, Program, Stmt, StmtKind,
  SwitchCase,
};
use compiscript::types::ir::{CmpOp, Instr, IrFunction, Operand};
use compiscript::types::{Loc, Spanned};
use compiscript::{CompileError, Target, check_program, compile, compile_ir, lower_program};

// ---------------- AST construction helpers ----------------

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
fn member(obj: Expr, name: &str) -> Expr {
  ex(ExprKind::Member { obj: Box::new(obj), name: name.into() })
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
fn assign(target: Expr, value: Expr) -> Stmt { stmt(StmtKind::Assign { target, value }) }
fn expr_stmt(e: Expr) -> Stmt { stmt(StmtKind::Expr(e)) }
fn prog(stmts: Vec<Stmt>) -> Program { Program { stmts } }

// ---------------- structural validators ----------------

/// Every jump targets a label of the same function and no label is
/// defined twice.
fn assert_cfg_integrity(f: &IrFunction) {
  let mut labels = HashSet::new();
  for ins in &f.body {
    if let Instr::Label(l) = ins {
      assert!(labels.insert(*l), "duplicate label {l} in {}", f.name);
    }
  }
  for ins in &f.body {
    match ins {
      Instr::Jump(l) => assert!(labels.contains(l), "jump to missing {l} in {}", f.name),
      Instr::CJump { if_true, if_false, .. } => {
        assert!(labels.contains(if_true), "cjump to missing {if_true} in {}", f.name);
        assert!(labels.contains(if_false), "cjump to missing {if_false} in {}", f.name);
      }
      _ => {}
    }
  }
}

/// Nothing but labels survives between a `Jump`/`Ret` and the next
/// label.
fn assert_pruned(f: &IrFunction) {
  let mut dead = false;
  for ins in &f.body {
    match ins {
      Instr::Label(_) => dead = false,
      i if dead => panic!("unreachable instruction survived in {}: {i}", f.name),
      Instr::Jump(_) | Instr::Ret(_) => dead = true,
      _ => {}
    }
  }
}

/// Every `Param` operand is a declared parameter and every `Local` a
/// declared local of its function.
fn assert_scope_discipline(f: &IrFunction) {
  for ins in &f.body {
    ins.for_each_operand(&mut |op| match op {
      Operand::Param(name) => assert!(
        f.params.iter().any(|p| p == name),
        "unknown parameter {name} in {}", f.name),
      Operand::Local(name) => assert!(
        f.locals.iter().any(|l| l == name),
        "unknown local {name} in {}", f.name),
      _ => {}
    });
  }
}

// ---------------- scenarios ----------------

#[test]
fn s1_arithmetic_folds_to_a_single_move() {
  // let x: integer = 2 + 3 * 4;
  let p = prog(vec![var("x", Some("integer"),
    Some(binary(Binop::Add, int(2), binary(Binop::Mul, int(3), int(4)))))]);
  let ir = compile_ir(&p).unwrap();
  assert_eq!(ir.entry.as_deref(), Some("__toplevel"));
  let top = ir.function("__toplevel").unwrap();
  assert_eq!(top.body, vec![Instr::Move {
    dst: Operand::Local("x".into()),
    src: Operand::Int(14),
  }]);
}

#[test]
fn s2_short_circuit_or_produces_a_cjump_chain() {
  // function f(a: integer): integer {
  //   if (a < 0 || a > 100) { return -1; }
  //   return a;
  // }
  let p = prog(vec![func("f", vec![param("a", "integer")], Some("integer"), vec![
    stmt(StmtKind::If {
      cond: binary(Binop::Or,
        binary(Binop::Lt, ident("a"), int(0)),
        binary(Binop::Gt, ident("a"), int(100))),
      then_blk: block(vec![ret(Some(int(-1)))]),
      else_blk: None,
    }),
    ret(Some(ident("a"))),
  ])]);
  let ir = lower_program(&p).unwrap();
  let f = ir.function("f").unwrap();
  let cjumps: Vec<_> = f.body.iter()
    .filter_map(|i| match i {
      Instr::CJump { op, if_true, .. } => Some((*op, *if_true)),
      _ => None,
    })
    .collect();
  // both operand tests jump to the same success label on first hit
  assert_eq!(cjumps[0].0, CmpOp::Lt);
  assert_eq!(cjumps[1].0, CmpOp::Gt);
  assert_eq!(cjumps[0].1, cjumps[1].1);
  assert_eq!(f.body.iter().filter(|i| matches!(i, Instr::Ret(_))).count(), 2);
  assert_cfg_integrity(f);
}

#[test]
fn s3_closures_capture_enclosing_symbols() {
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
  let env = &analysis.env;
  let inner = env.syms.enum_iter()
    .map(|(_, s)| s)
    .find(|s| s.name == "inner")
    .unwrap();
  let captured: Vec<_> = inner.captures.iter().map(|&c| env.sym(c).name.as_str()).collect();
  assert_eq!(captured, ["x", "k"]);
}

fn inheritance_program() -> Program {
  let this_n = || member(ex(ExprKind::This), "n");
  prog(vec![
    stmt(StmtKind::Class(ClassDecl {
      name: "A".into(),
      base_name: None,
      members: vec![
        var("n", Some("integer"), None),
        func("constructor", vec![param("n", "integer")], None, vec![
          assign(this_n(), ident("n")),
        ]),
        func("get", vec![], Some("integer"), vec![ret(Some(this_n()))]),
      ],
    })),
    stmt(StmtKind::Class(ClassDecl {
      name: "B".into(),
      base_name: Some("A".into()),
      members: vec![
        func("constructor", vec![param("n", "integer")], None, vec![
          assign(this_n(), ident("n")),
        ]),
        func("get2", vec![], Some("integer"), vec![
          ret(Some(call(member(ex(ExprKind::This), "get"), vec![]))),
        ]),
      ],
    })),
    var("b", Some("B"), Some(call(ident("B"), vec![int(7)]))),
    var("k", Some("integer"), Some(call(member(ident("b"), "get2"), vec![]))),
  ])
}

#[test]
fn s4_method_dispatch_walks_the_inheritance_chain() {
  let ir = compile_ir(&inheritance_program()).unwrap();

  // B has no `get`, so B__get2 calls A__get on its own receiver
  let get2 = ir.function("B__get2").unwrap();
  assert!(get2.body.iter().any(|i| matches!(i,
    Instr::Call { func, args, .. }
      if &**func == "A__get" && args[..] == [Operand::Param("this".into())])),
    "{get2:?}");

  let top = ir.function("__toplevel").unwrap();
  assert!(top.body.iter().any(|i| matches!(i,
    Instr::Call { func, .. } if &**func == "B__constructor")));
  assert!(top.body.iter().any(|i| matches!(i,
    Instr::Call { func, .. } if &**func == "B__get2")));
  assert!(top.body.iter().any(|i| matches!(i,
    Instr::Move { dst: Operand::Local(l), src: Operand::Temp(_) } if &**l == "k")));
}

#[test]
fn s5_foreach_lowers_to_an_indexed_loop() {
  // foreach (x in [10, 20, 30]) { print(x); }
  let p = prog(vec![stmt(StmtKind::Foreach {
    var: "x".into(),
    iterable: ex(ExprKind::Array(vec![int(10), int(20), int(30)])),
    body: block(vec![expr_stmt(call(ident("print"), vec![ident("x")]))]),
  })]);
  let ir = compile_ir(&p).unwrap();
  let top = ir.function("__toplevel").unwrap();

  // 4 bytes of length plus three elements
  assert!(top.body.iter().any(|i| matches!(i,
    Instr::Call { func, args, .. }
      if &**func == "malloc" && args[..] == [Operand::Int(16)])));
  for (offset, value) in [(0, 3), (4, 10), (8, 20), (12, 30)] {
    assert!(top.body.iter().any(|i| matches!(i,
      Instr::Store { offset: o, src: Operand::Int(v), .. } if *o == offset && *v == value)),
      "missing store at {offset}");
  }
  assert!(top.body.iter().any(|i| matches!(i, Instr::Load { offset: 0, .. })));
  assert!(top.body.iter().any(|i| matches!(i, Instr::LoadI { .. })));
  assert!(top.body.iter().any(|i| matches!(i, Instr::CJump { op: CmpOp::Lt, .. })));
  assert_cfg_integrity(top);
}

#[test]
fn s6_missing_return_stops_the_pipeline() {
  let p = prog(vec![func("g", vec![param("b", "boolean")], Some("integer"), vec![
    stmt(StmtKind::If {
      cond: ident("b"),
      then_blk: block(vec![ret(Some(int(1)))]),
      else_blk: None,
    }),
  ])]);
  match compile(&p, Target::X86) {
    Err(CompileError::Check(errors)) => {
      assert_eq!(errors.len(), 1);
      assert!(errors[0].contains("must return"), "{}", errors[0]);
    }
    other => panic!("expected a check failure, got {other:?}"),
  }
}

// ---------------- pipeline laws ----------------

fn control_flow_program() -> Program {
  let case = |e: Expr, body: Vec<Stmt>| SwitchCase { loc: loc(), expr: e, block: block(body) };
  prog(vec![func("main", vec![], Some("integer"), vec![
    var("i", Some("integer"), Some(int(0))),
    stmt(StmtKind::While {
      cond: binary(Binop::Lt, ident("i"), int(10)),
      body: block(vec![
        stmt(StmtKind::If {
          cond: binary(Binop::Eq, binary(Binop::Rem, ident("i"), int(2)), int(0)),
          then_blk: block(vec![expr_stmt(call(ident("print"), vec![ident("i")]))]),
          else_blk: Some(block(vec![expr_stmt(call(ident("print"), vec![int(0)]))])),
        }),
        assign(ident("i"), binary(Binop::Add, ident("i"), int(1))),
      ]),
    }),
    stmt(StmtKind::Switch {
      expr: ident("i"),
      cases: vec![
        case(int(1), vec![expr_stmt(call(ident("print"), vec![string("one")]))]),
        case(int(2), vec![expr_stmt(call(ident("print"), vec![string("two")]))]),
      ],
      default: Some(block(vec![expr_stmt(call(ident("print"), vec![string("other")]))])),
    }),
    ret(Some(int(0))),
  ])])
}

#[test]
fn optimized_ir_keeps_cfg_and_scope_integrity() {
  let ir = compile_ir(&control_flow_program()).unwrap();
  assert_eq!(ir.entry.as_deref(), Some("main"));
  for f in &ir.functions {
    assert_cfg_integrity(f);
    assert_pruned(f);
    assert_scope_discipline(f);
  }
}

#[test]
fn optimizer_is_idempotent_end_to_end() {
  let mut ir = compile_ir(&control_flow_program()).unwrap();
  let once = ir.to_string();
  compiscript::optimize(&mut ir);
  assert_eq!(ir.to_string(), once);

  let mut ir = compile_ir(&inheritance_program()).unwrap();
  let once = ir.to_string();
  compiscript::optimize(&mut ir);
  assert_eq!(ir.to_string(), once);
}

#[test]
fn string_pool_is_canonical_after_optimization() {
  let p = prog(vec![
    expr_stmt(call(ident("print"), vec![string("hola")])),
    expr_stmt(call(ident("print"), vec![string("hola")])),
    var("s", Some("string"), Some(binary(Binop::Add, string("hola"), string("x")))),
  ]);
  let ir = compile_ir(&p).unwrap();
  // no two pool entries share content
  let mut seen = HashSet::new();
  for bytes in &ir.strings {
    assert!(seen.insert(bytes.clone()), "duplicate pool entry");
  }
  // every reference is in bounds
  for f in &ir.functions {
    for ins in &f.body {
      ins.for_each_operand(&mut |op| {
        if let Operand::Str(s) = op {
          assert!((s.0 as usize) < ir.strings.len());
        }
      });
    }
  }
  assert!(ir.strings.contains(&b"hola\0".to_vec().into_boxed_slice()));
}

#[test]
fn both_backends_emit_for_the_same_ir() {
  let p = control_flow_program();
  let x86 = compile(&p, Target::X86).unwrap();
  assert!(x86.contains("global main"));
  assert!(x86.contains("extern printf"));
  assert!(x86.contains("main:"));

  let mips = compile(&p, Target::Mips).unwrap();
  assert!(mips.contains(".globl main"));
  assert!(mips.contains("__concat:"));
  assert!(mips.contains("main:"));
  // a user main means no synthesized wrapper
  assert!(!mips.contains("  jal main"));
}

#[test]
fn ir_pretty_form_uses_the_documented_sigils() {
  let p = prog(vec![
    var("x", Some("integer"), Some(int(1))),
    expr_stmt(call(ident("print"), vec![string("hi")])),
  ]);
  let ir = compile_ir(&p).unwrap();
  let text = ir.to_string();
  assert!(text.contains("; .strings"), "{text}");
  assert!(text.contains(";   str0: hi"), "{text}");
  assert!(text.contains("func __toplevel()"), "{text}");
  assert!(text.contains("  ; locals: x"), "{text}");
  assert!(text.contains("  $x = 1"), "{text}");
  assert!(text.contains("call print(&str0)"), "{text}");
  assert!(text.contains("; entry: __toplevel"), "{text}");
}
