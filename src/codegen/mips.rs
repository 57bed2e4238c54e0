//! The MIPS32 backend, targeting the SPIM/MARS simulators.
//!
//! Calling convention is a simplified o32: every argument goes on the
//! stack right to left, results return in `$v0`, the callee saves
//! `$ra`/`$fp` and addresses its frame through `$fp`. Every branch and
//! jump is followed by an explicit `nop` delay slot. `print` and
//! `malloc` map to simulator syscalls, and the `__concat` string
//! runtime is emitted inline at the end of every program.

use itertools::Itertools;

use crate::codegen::{Frame, last_real_instr};
use crate::types::ir::{ArithOp, CmpOp, Instr, IrFunction, IrProgram, Operand, UnOp};

/// Emit the whole program as SPIM/MARS assembly text.
#[must_use] pub fn emit_program(prog: &IrProgram) -> String {
  let mut e = Emitter { lines: vec![], aux_labels: 0 };
  e.header(prog);
  for f in &prog.functions {
    e.function(f, prog.entry.as_deref() == Some(&f.name));
  }
  e.runtime_concat();
  if prog.function("main").is_none() {
    let entry = prog.entry.as_deref().unwrap_or("__toplevel");
    e.main_wrapper(entry);
  }
  e.lines.join("\n")
}

struct Emitter {
  lines: Vec<String>,
  aux_labels: u32,
}

impl Emitter {
  fn w(&mut self, s: impl Into<String>) { self.lines.push(s.into()) }
  fn lbl(&mut self, s: impl std::fmt::Display) { self.lines.push(format!("{s}:")) }

  fn header(&mut self, prog: &IrProgram) {
    self.w("# Compiscript MIPS (o32)");
    self.w(".data");
    for (i, bytes) in prog.strings.iter().enumerate() {
      self.w(format!("str{i}: .byte {}", bytes.iter().join(", ")));
    }
    self.w("");
    self.w(".text");
    if let Some(entry) = &prog.entry {
      self.w(format!(".globl {entry}"));
    }
  }

  /// `offset($fp)` form of a slot operand. The shared frame stores
  /// cdecl displacements, and this prologue leaves `$fp` at the entry
  /// stack pointer, so parameter `k` sits at `disp - 8`.
  fn addr(frame: &mut Frame, op: &Operand) -> String {
    match op {
      Operand::Local(_) | Operand::Temp(_) => format!("-{}($fp)", frame.ensure_slot(op)),
      Operand::Param(name) => {
        let disp = frame.param_disp(name)
          .unwrap_or_else(|| panic!("parameter without displacement: {name}"));
        format!("{}($fp)", disp - 8)
      }
      _ => panic!("operand is not addressable: {op}"),
    }
  }

  fn load(&mut self, frame: &mut Frame, reg: &str, op: &Operand) {
    match op {
      Operand::Int(v) => self.w(format!("  li {reg}, {v}")),
      Operand::Str(s) => self.w(format!("  la {reg}, {s}")),
      _ => {
        let addr = Self::addr(frame, op);
        self.w(format!("  lw {reg}, {addr}"))
      }
    }
  }

  fn store(&mut self, frame: &mut Frame, dst: &Operand, reg: &str) {
    let addr = Self::addr(frame, dst);
    self.w(format!("  sw {reg}, {addr}"));
  }

  fn function(&mut self, f: &IrFunction, is_entry: bool) {
    let mut frame = Frame::new(&f.params);
    frame.reserve_all(f);

    if is_entry {
      self.w(format!(".globl {}", f.name));
    }
    self.lbl(&f.name);

    let lsize = frame.local_size();
    self.w(format!("  addiu $sp, $sp, -{}", lsize + 8));
    self.w(format!("  sw $ra, {}($sp)", lsize + 4));
    self.w(format!("  sw $fp, {lsize}($sp)"));
    // $fp ends up at the entry stack pointer, the top of the arguments
    self.w(format!("  addiu $fp, $sp, {}", lsize + 8));

    for ins in &f.body {
      self.instr(&mut frame, ins, lsize);
    }

    if !matches!(last_real_instr(f), Some(Instr::Ret(_))) {
      self.epilogue(lsize);
    }
  }

  fn epilogue(&mut self, lsize: i32) {
    self.w(format!("  lw $fp, {lsize}($sp)"));
    self.w(format!("  lw $ra, {}($sp)", lsize + 4));
    self.w(format!("  addiu $sp, $sp, {}", lsize + 8));
    self.w("  jr $ra");
    self.w("  nop");
  }

  /// Branch on `$t0 op $t1` to `target`. Orderings go through `slt`
  /// into `$t2`.
  fn branch_cond(&mut self, op: CmpOp, target: impl std::fmt::Display) {
    match op {
      CmpOp::Eq => self.w(format!("  beq $t0, $t1, {target}")),
      CmpOp::Ne => self.w(format!("  bne $t0, $t1, {target}")),
      CmpOp::Lt => {
        self.w("  slt $t2, $t0, $t1");
        self.w(format!("  bne $t2, $zero, {target}"));
      }
      CmpOp::Le => {
        self.w("  slt $t2, $t1, $t0");
        self.w(format!("  beq $t2, $zero, {target}"));
      }
      CmpOp::Gt => {
        self.w("  slt $t2, $t1, $t0");
        self.w(format!("  bne $t2, $zero, {target}"));
      }
      CmpOp::Ge => {
        self.w("  slt $t2, $t0, $t1");
        self.w(format!("  beq $t2, $zero, {target}"));
      }
    }
  }

  fn instr(&mut self, frame: &mut Frame, ins: &Instr, lsize: i32) {
    match ins {
      Instr::Label(l) => self.lbl(l),

      Instr::Jump(l) => {
        self.w(format!("  j {l}"));
        self.w("  nop");
      }

      Instr::CJump { op, a, b, if_true, if_false } => {
        self.load(frame, "$t0", a);
        self.load(frame, "$t1", b);
        self.branch_cond(*op, if_true);
        self.w(format!("  j {if_false}"));
        self.w("  nop");
      }

      Instr::Move { dst, src } => {
        self.load(frame, "$t0", src);
        self.store(frame, dst, "$t0");
      }

      Instr::Bin { op, dst, a, b } => {
        self.load(frame, "$t0", a);
        self.load(frame, "$t1", b);
        match op {
          ArithOp::Add => self.w("  addu $t0, $t0, $t1"),
          ArithOp::Sub => self.w("  subu $t0, $t0, $t1"),
          ArithOp::Mul => self.w("  mul  $t0, $t0, $t1"),
          ArithOp::Div | ArithOp::Rem => {
            self.w("  div  $t0, $t1");
            if *op == ArithOp::Div {
              self.w("  mflo $t0");
            } else {
              self.w("  mfhi $t0");
            }
          }
        }
        self.store(frame, dst, "$t0");
      }

      Instr::Un { op, dst, a } => {
        self.load(frame, "$t0", a);
        match op {
          UnOp::Neg => self.w("  subu $t0, $zero, $t0"),
          UnOp::Not => {
            let n = self.aux_labels;
            self.aux_labels += 1;
            self.w(format!("  beq $t0, $zero, u_not_true_{n}"));
            self.w("  li $t0, 0");
            self.w(format!("  j u_not_end_{n}"));
            self.w("  nop");
            self.lbl(format_args!("u_not_true_{n}"));
            self.w("  li $t0, 1");
            self.lbl(format_args!("u_not_end_{n}"));
          }
        }
        self.store(frame, dst, "$t0");
      }

      Instr::Cmp { op, dst, a, b } => {
        self.load(frame, "$t0", a);
        self.load(frame, "$t1", b);
        let n = self.aux_labels;
        self.aux_labels += 1;
        self.branch_cond(*op, format_args!("cmp_true_{n}"));
        self.w("  li $t0, 0");
        self.w(format!("  j cmp_end_{n}"));
        self.w("  nop");
        self.lbl(format_args!("cmp_true_{n}"));
        self.w("  li $t0, 1");
        self.lbl(format_args!("cmp_end_{n}"));
        self.store(frame, dst, "$t0");
      }

      Instr::Load { dst, base, offset } => {
        self.load(frame, "$t0", base);
        self.w(format!("  lw $t1, {offset}($t0)"));
        self.store(frame, dst, "$t1");
      }

      Instr::Store { base, offset, src } => {
        self.load(frame, "$t0", base);
        self.load(frame, "$t1", src);
        self.w(format!("  sw $t1, {offset}($t0)"));
      }

      Instr::LoadI { dst, base, index } => {
        self.load(frame, "$t0", base);
        match index {
          Operand::Int(i) => {
            let byte_off = 4 + i * 4;
            self.w(format!("  lw $t1, {byte_off}($t0)"));
            self.store(frame, dst, "$t1");
          }
          _ => {
            self.load(frame, "$t1", index);
            self.w("  sll $t1, $t1, 2");
            self.w("  addu $t1, $t1, $t0");
            self.w("  lw $t2, 4($t1)");
            self.store(frame, dst, "$t2");
          }
        }
      }

      Instr::StoreI { base, index, src } => {
        self.load(frame, "$t0", base);
        match index {
          Operand::Int(i) => {
            let byte_off = 4 + i * 4;
            self.load(frame, "$t1", src);
            self.w(format!("  sw $t1, {byte_off}($t0)"));
          }
          _ => {
            self.load(frame, "$t1", index);
            self.w("  sll $t1, $t1, 2");
            self.w("  addu $t1, $t1, $t0");
            self.load(frame, "$t2", src);
            self.w("  sw $t2, 4($t1)");
          }
        }
      }

      Instr::Call { dst, func, args } => {
        if &**func == "print" {
          match &args[..] {
            [arg @ Operand::Str(_)] => {
              self.load(frame, "$a0", arg);
              self.w("  li $v0, 4");
              self.w("  syscall");
            }
            [arg] => {
              self.load(frame, "$a0", arg);
              self.w("  li $v0, 1");
              self.w("  syscall");
            }
            _ => {
              self.w("  move $a0, $zero");
              self.w("  li $v0, 1");
              self.w("  syscall");
            }
          }
          // newline
          self.w("  li $a0, 10");
          self.w("  li $v0, 11");
          self.w("  syscall");
          if let Some(dst) = dst {
            self.w("  move $v0, $zero");
            self.store(frame, dst, "$v0");
          }
          return
        }

        if &**func == "malloc" && args.len() == 1 {
          self.load(frame, "$a0", &args[0]);
          self.w("  li $v0, 9");
          self.w("  syscall");
          if let Some(dst) = dst {
            self.store(frame, dst, "$v0");
          }
          return
        }

        self.generic_call(frame, dst.as_ref(), func, args);
      }

      Instr::Ret(value) => {
        if let Some(v) = value {
          self.load(frame, "$v0", v);
        }
        self.epilogue(lsize);
      }
    }
  }

  fn generic_call(&mut self, frame: &mut Frame, dst: Option<&Operand>,
      func: &str, args: &[Operand]) {
    for a in args.iter().rev() {
      self.load(frame, "$t0", a);
      self.w("  addiu $sp, $sp, -4");
      self.w("  sw $t0, 0($sp)");
    }
    self.w(format!("  jal {func}"));
    if !args.is_empty() {
      self.w(format!("  addiu $sp, $sp, {}", args.len() * 4));
    }
    if let Some(dst) = dst {
      self.store(frame, dst, "$v0");
    }
  }

  /// The string concatenation runtime: NUL-scan both lengths, sbrk the
  /// sum plus a terminator, copy byte by byte, return the new pointer.
  fn runtime_concat(&mut self) {
    self.w(".globl __concat");
    self.lbl("__concat");
    self.w("  addiu $sp, $sp, -8");
    self.w("  sw $ra, 4($sp)");
    self.w("  sw $fp, 0($sp)");
    self.w("  addiu $fp, $sp, 8");
    self.w("  lw $t0, 0($fp)     # a");
    self.w("  lw $t1, 4($fp)     # b");
    // len(a) -> $t2
    self.w("  move $t2, $zero");
    self.lbl("L_len_a");
    self.w("  addu $t5, $t0, $t2");
    self.w("  lbu  $t6, 0($t5)");
    self.w("  beq  $t6, $zero, L_len_a_done");
    self.w("  addiu $t2, $t2, 1");
    self.w("  j L_len_a");
    self.w("  nop");
    self.lbl("L_len_a_done");
    // len(b) -> $t3
    self.w("  move $t3, $zero");
    self.lbl("L_len_b");
    self.w("  addu $t5, $t1, $t3");
    self.w("  lbu  $t6, 0($t5)");
    self.w("  beq  $t6, $zero, L_len_b_done");
    self.w("  addiu $t3, $t3, 1");
    self.w("  j L_len_b");
    self.w("  nop");
    self.lbl("L_len_b_done");
    // allocate len(a) + len(b) + 1
    self.w("  addu $t6, $t2, $t3");
    self.w("  addiu $a0, $t6, 1");
    self.w("  li $v0, 9");
    self.w("  syscall");
    self.w("  move $t4, $v0");
    // copy a
    self.w("  move $t6, $zero");
    self.lbl("L_cp_a");
    self.w("  beq $t6, $t2, L_cp_a_done");
    self.w("  addu $t5, $t0, $t6");
    self.w("  lbu $t7, 0($t5)");
    self.w("  addu $t5, $t4, $t6");
    self.w("  sb  $t7, 0($t5)");
    self.w("  addiu $t6, $t6, 1");
    self.w("  j L_cp_a");
    self.w("  nop");
    self.lbl("L_cp_a_done");
    // copy b after a
    self.w("  move $t6, $zero");
    self.lbl("L_cp_b");
    self.w("  beq $t6, $t3, L_cp_b_done");
    self.w("  addu $t5, $t1, $t6");
    self.w("  lbu $t7, 0($t5)");
    self.w("  addu $t5, $t4, $t2");
    self.w("  addu $t5, $t5, $t6");
    self.w("  sb  $t7, 0($t5)");
    self.w("  addiu $t6, $t6, 1");
    self.w("  j L_cp_b");
    self.w("  nop");
    self.lbl("L_cp_b_done");
    // terminating NUL
    self.w("  addu $t5, $t4, $t2");
    self.w("  addu $t5, $t5, $t3");
    self.w("  sb  $zero, 0($t5)");
    self.w("  move $v0, $t4");
    self.w("  lw $fp, 0($sp)");
    self.w("  lw $ra, 4($sp)");
    self.w("  addiu $sp, $sp, 8");
    self.w("  jr $ra");
    self.w("  nop");
  }

  /// Simulators want a `main`; when the program has none, synthesize
  /// one that runs the entry and exits cleanly.
  fn main_wrapper(&mut self, entry: &str) {
    self.w(".globl main");
    self.lbl("main");
    self.w(format!("  jal {entry}"));
    self.w("  li $v0, 10   # exit");
    self.w("  syscall");
  }
}
