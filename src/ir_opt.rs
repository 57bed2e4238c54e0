//! The IR optimizer: a fixed number of rounds of local, per-function
//! passes bracketed by global string pooling, finished by a stable
//! temp renumbering.
//!
//! Every pass is semantics-preserving and deterministic. The blockwise
//! pass never moves an instruction across a barrier (`Label`, `Store`,
//! `StoreI`, `Call`, `Ret`, `Jump`, `CJump`) and never hoists loads
//! across stores; loads themselves are not barriers since they do not
//! write memory. Running the full pipeline twice yields byte-identical
//! IR the second time.

use hashbrown::{HashMap, HashSet};

use crate::types::ir::{ArithOp, Instr, IrFunction, IrProgram, Operand, StrId};

/// Run the default pipeline: pooling, two rounds of local passes,
/// pooling again, temp renumbering.
pub fn optimize(prog: &mut IrProgram) { optimize_with(prog, 2) }

/// Run the pipeline with an explicit round count.
pub fn optimize_with(prog: &mut IrProgram, rounds: u32) {
  pool_strings(prog);
  for _ in 0..rounds {
    for f in &mut prog.functions {
      simplify_blockwise(f);
      dce_temps(f);
      prune_unreachable(f);
      clean_jumps_and_labels(f);
    }
  }
  // passes above may have dropped the last use of a string
  pool_strings(prog);
  renumber_temps(prog);
}

type ExprKey = (ArithOp, Operand, Operand);

fn subst(op: Operand, copies: &HashMap<Operand, Operand>) -> Operand {
  if op.is_slot() {
    if let Some(v) = copies.get(&op) { return v.clone() }
  }
  op
}

/// Writing `v` invalidates every entry of either map that mentions it,
/// as key or as value.
fn kill(v: &Operand, copies: &mut HashMap<Operand, Operand>,
    exprs: &mut HashMap<ExprKey, Operand>) {
  if !v.is_slot() { return }
  copies.retain(|key, val| key != v && val != v);
  exprs.retain(|(_, a, b), val| a != v && b != v && val != v);
}

/// One forward walk per call: copy propagation, constant folding,
/// algebraic identities, local CSE over `Bin` expressions, and
/// constant-condition jump folding, with both value maps flushed at
/// every block leader and barrier.
fn simplify_blockwise(f: &mut IrFunction) {
  let mut out = Vec::with_capacity(f.body.len());
  let mut copies: HashMap<Operand, Operand> = HashMap::new();
  let mut exprs: HashMap<ExprKey, Operand> = HashMap::new();

  for ins in f.body.drain(..) {
    match ins {
      Instr::Label(_) => {
        copies.clear();
        exprs.clear();
        out.push(ins);
      }

      Instr::Move { dst, src } => {
        let src = subst(src, &copies);
        if dst == src { continue }
        kill(&dst, &mut copies, &mut exprs);
        if dst.is_slot() { copies.insert(dst.clone(), src.clone()); }
        out.push(Instr::Move { dst, src });
      }

      Instr::Un { op, dst, a } => {
        let a = subst(a, &copies);
        kill(&dst, &mut copies, &mut exprs);
        match a {
          Operand::Int(v) => out.push(Instr::Move { dst, src: Operand::Int(op.apply(v)) }),
          a => out.push(Instr::Un { op, dst, a }),
        }
      }

      Instr::Cmp { op, dst, a, b } => {
        let a = subst(a, &copies);
        let b = subst(b, &copies);
        kill(&dst, &mut copies, &mut exprs);
        if a == b {
          let v = i32::from(op.on_equal_operands());
          out.push(Instr::Move { dst, src: Operand::Int(v) });
        } else if let (&Operand::Int(av), &Operand::Int(bv)) = (&a, &b) {
          out.push(Instr::Move { dst, src: Operand::Int(i32::from(op.apply(av, bv))) });
        } else {
          out.push(Instr::Cmp { op, dst, a, b });
        }
      }

      Instr::Bin { op, dst, a, b } => {
        let a = subst(a, &copies);
        let b = subst(b, &copies);
        if let Some(simplified) = algebraic(op, &a, &b) {
          kill(&dst, &mut copies, &mut exprs);
          if dst == simplified { continue }
          if dst.is_slot() { copies.insert(dst.clone(), simplified.clone()); }
          out.push(Instr::Move { dst, src: simplified });
          continue
        }
        if let (&Operand::Int(av), &Operand::Int(bv)) = (&a, &b) {
          // division by a constant zero stays put, deferred to run time
          if let Some(v) = op.apply(av, bv) {
            kill(&dst, &mut copies, &mut exprs);
            if dst.is_slot() { copies.insert(dst.clone(), Operand::Int(v)); }
            out.push(Instr::Move { dst, src: Operand::Int(v) });
            continue
          }
        }
        let key = expr_key(op, a.clone(), b.clone());
        if let Some(prior) = exprs.get(&key).cloned() {
          if prior == dst { continue }
          kill(&dst, &mut copies, &mut exprs);
          out.push(Instr::Move { dst, src: prior });
          continue
        }
        kill(&dst, &mut copies, &mut exprs);
        if dst.is_slot() && a != dst && b != dst {
          exprs.insert(key, dst.clone());
        }
        out.push(Instr::Bin { op, dst, a, b });
      }

      Instr::Load { dst, base, offset } => {
        let base = subst(base, &copies);
        kill(&dst, &mut copies, &mut exprs);
        out.push(Instr::Load { dst, base, offset });
      }

      Instr::LoadI { dst, base, index } => {
        let base = subst(base, &copies);
        let index = subst(index, &copies);
        kill(&dst, &mut copies, &mut exprs);
        out.push(Instr::LoadI { dst, base, index });
      }

      Instr::Store { base, offset, src } => {
        let base = subst(base, &copies);
        let src = subst(src, &copies);
        out.push(Instr::Store { base, offset, src });
        copies.clear();
        exprs.clear();
      }

      Instr::StoreI { base, index, src } => {
        let base = subst(base, &copies);
        let index = subst(index, &copies);
        let src = subst(src, &copies);
        out.push(Instr::StoreI { base, index, src });
        copies.clear();
        exprs.clear();
      }

      Instr::CJump { op, a, b, if_true, if_false } => {
        let a = subst(a, &copies);
        let b = subst(b, &copies);
        if a == b {
          out.push(Instr::Jump(if op.on_equal_operands() { if_true } else { if_false }));
        } else if let (&Operand::Int(av), &Operand::Int(bv)) = (&a, &b) {
          out.push(Instr::Jump(if op.apply(av, bv) { if_true } else { if_false }));
        } else {
          out.push(Instr::CJump { op, a, b, if_true, if_false });
        }
        copies.clear();
        exprs.clear();
      }

      Instr::Call { dst, func, args } => {
        let args = args.into_iter().map(|a| subst(a, &copies)).collect();
        if let Some(d) = &dst { kill(d, &mut copies, &mut exprs) }
        out.push(Instr::Call { dst, func, args });
        copies.clear();
        exprs.clear();
      }

      Instr::Ret(v) => {
        out.push(Instr::Ret(v.map(|v| subst(v, &copies))));
        copies.clear();
        exprs.clear();
      }

      Instr::Jump(_) => {
        out.push(ins);
        copies.clear();
        exprs.clear();
      }
    }
  }
  f.body = out;
}

/// Commutative operations get a sorted operand key so `a+b` and `b+a`
/// share a CSE slot.
fn expr_key(op: ArithOp, a: Operand, b: Operand) -> ExprKey {
  if op.commutes() && b < a { (op, b, a) } else { (op, a, b) }
}

/// The algebraic identities: `x+0`, `0+x`, `x-0`, `x-x`, `x*1`, `1*x`,
/// `x*0`, `0*x`, `x/1`, `x%1`. Returns the operand the whole operation
/// collapses to, or `None`.
fn algebraic(op: ArithOp, a: &Operand, b: &Operand) -> Option<Operand> {
  let zero = &Operand::Int(0);
  let one = &Operand::Int(1);
  match op {
    ArithOp::Add if a == zero => Some(b.clone()),
    ArithOp::Add if b == zero => Some(a.clone()),
    ArithOp::Sub if a == b => Some(Operand::Int(0)),
    ArithOp::Sub if b == zero => Some(a.clone()),
    ArithOp::Mul if a == one => Some(b.clone()),
    ArithOp::Mul if b == one => Some(a.clone()),
    ArithOp::Mul if a == zero || b == zero => Some(Operand::Int(0)),
    ArithOp::Div if b == one => Some(a.clone()),
    ArithOp::Rem if b == one => Some(Operand::Int(0)),
    _ => None,
  }
}

/// Drop definitions of temps with no remaining uses, to a fixed point.
/// Side-effecting instructions are never dropped.
fn dce_temps(f: &mut IrFunction) {
  loop {
    let mut uses: HashMap<u32, u32> = HashMap::new();
    for ins in &f.body {
      for op in ins.uses() {
        if let Operand::Temp(t) = op { *uses.entry(*t).or_insert(0) += 1 }
      }
    }
    let before = f.body.len();
    f.body.retain(|ins| {
      if ins.has_side_effect() { return true }
      match ins.def() {
        Some(Operand::Temp(t)) => uses.get(t).copied().unwrap_or(0) > 0,
        _ => true,
      }
    });
    if f.body.len() == before { break }
  }
}

/// Drop instructions between a `Jump`/`Ret` and the next `Label`.
fn prune_unreachable(f: &mut IrFunction) {
  let mut reachable = true;
  f.body.retain(|ins| {
    if matches!(ins, Instr::Label(_)) {
      reachable = true;
      return true
    }
    if !reachable { return false }
    if matches!(ins, Instr::Jump(_) | Instr::Ret(_)) { reachable = false }
    true
  });
}

/// Remove `Jump(L)` immediately followed by `Label(L)`, then remove
/// labels nothing references.
fn clean_jumps_and_labels(f: &mut IrFunction) {
  let mut out = Vec::with_capacity(f.body.len());
  for (i, ins) in f.body.iter().enumerate() {
    if let Instr::Jump(target) = ins {
      if matches!(f.body.get(i + 1), Some(Instr::Label(l)) if l == target) { continue }
    }
    out.push(ins.clone());
  }

  let mut targets = HashSet::new();
  for ins in &out {
    match ins {
      Instr::Jump(l) => { targets.insert(*l); }
      Instr::CJump { if_true, if_false, .. } => {
        targets.insert(*if_true);
        targets.insert(*if_false);
      }
      _ => {}
    }
  }
  out.retain(|ins| !matches!(ins, Instr::Label(l) if !targets.contains(l)));
  f.body = out;
}

/// Canonicalize the string pool by content: the first label per
/// payload wins, every `Str` operand is rewritten to it, and entries
/// nothing references are dropped. Idempotent.
fn pool_strings(prog: &mut IrProgram) {
  let mut canon: HashMap<&[u8], StrId> = HashMap::new();
  let mut alias: Vec<StrId> = Vec::with_capacity(prog.strings.len());
  for (i, bytes) in prog.strings.iter().enumerate() {
    let id = StrId(u32::try_from(i).expect("string pool overflow"));
    alias.push(*canon.entry(bytes.as_ref()).or_insert(id));
  }
  drop(canon);

  let mut used: HashSet<StrId> = HashSet::new();
  for f in &prog.functions {
    for ins in &f.body {
      ins.for_each_operand(&mut |op| {
        if let Operand::Str(s) = op { used.insert(alias[s.0 as usize]); }
      });
    }
  }

  let mut remap: Vec<Option<StrId>> = vec![None; prog.strings.len()];
  let mut new_strings = Vec::new();
  for (i, bytes) in prog.strings.iter().enumerate() {
    let id = StrId(u32::try_from(i).expect("string pool overflow"));
    if alias[i] == id && used.contains(&id) {
      remap[i] = Some(StrId(u32::try_from(new_strings.len()).expect("string pool overflow")));
      new_strings.push(bytes.clone());
    }
  }

  for f in &mut prog.functions {
    for ins in &mut f.body {
      ins.for_each_operand_mut(&mut |op| {
        if let Operand::Str(s) = op {
          *s = remap[alias[s.0 as usize].0 as usize].expect("referenced string dropped");
        }
      });
    }
  }
  prog.strings = new_strings;
}

/// Renumber temps per function by first occurrence: `t0, t1, ...`.
/// Idempotent once applied.
fn renumber_temps(prog: &mut IrProgram) {
  for f in &mut prog.functions {
    let mut map: HashMap<u32, u32> = HashMap::new();
    let mut next = 0u32;
    for ins in &mut f.body {
      ins.for_each_operand_mut(&mut |op| {
        if let Operand::Temp(t) = op {
          let n = *map.entry(*t).or_insert_with(|| {
            let n = next;
            next += 1;
            n
          });
          *t = n;
        }
      });
    }
  }
}
