//! The 32-bit x86 backend: NASM-compatible Intel syntax, cdecl calls.
//!
//! Arguments are pushed right to left and the caller cleans the stack;
//! results return in `eax`. `print` lowers to `printf` with one of two
//! format strings, `malloc` and `__concat` are external symbols the
//! driver links against.

use itertools::Itertools;

use crate::codegen::{Frame, last_real_instr};
use crate::types::ir::{ArithOp, CmpOp, Instr, IrFunction, IrProgram, Operand, UnOp};

/// Emit the whole program as NASM text.
#[must_use] pub fn emit_program(prog: &IrProgram) -> String {
  let mut e = Emitter { lines: vec![], aux_labels: 0 };
  e.header(prog);
  for f in &prog.functions {
    e.function(f);
  }
  e.lines.join("\n")
}

fn jcc(op: CmpOp) -> &'static str {
  match op {
    CmpOp::Eq => "je",
    CmpOp::Ne => "jne",
    CmpOp::Lt => "jl",
    CmpOp::Le => "jle",
    CmpOp::Gt => "jg",
    CmpOp::Ge => "jge",
  }
}

struct Emitter {
  lines: Vec<String>,
  // counter behind the cmp_true/cmp_end skeleton labels
  aux_labels: u32,
}

impl Emitter {
  fn w(&mut self, s: impl Into<String>) { self.lines.push(s.into()) }
  fn lbl(&mut self, s: impl std::fmt::Display) { self.lines.push(format!("{s}:")) }

  fn header(&mut self, prog: &IrProgram) {
    self.w("; Compiscript x86 (NASM, Intel syntax)");
    self.w("extern printf");
    self.w("extern malloc");
    self.w("extern __concat");
    self.w("section .data");
    self.w("fmt_int db \"%d\", 10, 0");
    self.w("fmt_str db \"%s\", 10, 0");
    for (i, bytes) in prog.strings.iter().enumerate() {
      self.w(format!("str{i} db {}", bytes.iter().join(", ")));
    }
    self.w("section .text");
    if let Some(entry) = &prog.entry {
      self.w(format!("global {entry}"));
    }
  }

  /// Address expression of a slot operand.
  fn mem(frame: &mut Frame, op: &Operand) -> String {
    match op {
      Operand::Local(_) | Operand::Temp(_) => format!("[ebp-{}]", frame.ensure_slot(op)),
      Operand::Param(name) => {
        let disp = frame.param_disp(name)
          .unwrap_or_else(|| panic!("parameter without displacement: {name}"));
        format!("[ebp+{disp}]")
      }
      _ => panic!("operand is not addressable: {op}"),
    }
  }

  fn load(&mut self, frame: &mut Frame, reg: &str, op: &Operand) {
    match op {
      Operand::Int(v) => self.w(format!("    mov {reg}, {v}")),
      Operand::Str(s) => self.w(format!("    mov {reg}, {s}")),
      _ => {
        let mem = Self::mem(frame, op);
        self.w(format!("    mov {reg}, dword {mem}"))
      }
    }
  }

  fn store_eax(&mut self, frame: &mut Frame, dst: &Operand) {
    let mem = Self::mem(frame, dst);
    self.w(format!("    mov dword {mem}, eax"));
  }

  /// The immediate or memory form of `op` as a `cmp`/`push` source.
  fn value_or_mem(frame: &mut Frame, op: &Operand) -> String {
    match op {
      Operand::Int(v) => v.to_string(),
      Operand::Str(s) => s.to_string(),
      _ => format!("dword {}", Self::mem(frame, op)),
    }
  }

  fn function(&mut self, f: &IrFunction) {
    let mut frame = Frame::new(&f.params);
    // assign every slot up front so the prologue reserves enough
    frame.reserve_all(f);

    self.lbl(&f.name);
    self.w("    push ebp");
    self.w("    mov ebp, esp");
    let lsize = frame.local_size();
    if lsize > 0 {
      self.w(format!("    sub esp, {lsize}"));
    }

    for ins in &f.body {
      self.instr(&mut frame, ins);
    }

    // a trailing Ret already emitted the epilogue
    if !matches!(last_real_instr(f), Some(Instr::Ret(_))) {
      self.epilogue();
    }
  }

  fn epilogue(&mut self) {
    self.w("    mov esp, ebp");
    self.w("    pop ebp");
    self.w("    ret");
  }

  fn instr(&mut self, frame: &mut Frame, ins: &Instr) {
    match ins {
      Instr::Label(l) => self.lbl(l),

      Instr::Jump(l) => self.w(format!("    jmp {l}")),

      Instr::CJump { op, a, b, if_true, if_false } => {
        self.load(frame, "eax", a);
        let rhs = Self::value_or_mem(frame, b);
        self.w(format!("    cmp eax, {rhs}"));
        self.w(format!("    {} {if_true}", jcc(*op)));
        self.w(format!("    jmp {if_false}"));
      }

      Instr::Move { dst, src } => {
        self.load(frame, "eax", src);
        self.store_eax(frame, dst);
      }

      Instr::Bin { op, dst, a, b } => {
        self.load(frame, "eax", a);
        self.load(frame, "ebx", b);
        match op {
          ArithOp::Add => self.w("    add eax, ebx"),
          ArithOp::Sub => self.w("    sub eax, ebx"),
          ArithOp::Mul => self.w("    imul eax, ebx"),
          ArithOp::Div | ArithOp::Rem => {
            self.w("    cdq");
            self.w("    idiv ebx");
            if *op == ArithOp::Rem {
              self.w("    mov eax, edx");
            }
          }
        }
        self.store_eax(frame, dst);
      }

      Instr::Un { op, dst, a } => {
        self.load(frame, "eax", a);
        match op {
          UnOp::Neg => self.w("    neg eax"),
          UnOp::Not => {
            self.w("    cmp eax, 0");
            self.w("    sete al");
            self.w("    movzx eax, al");
          }
        }
        self.store_eax(frame, dst);
      }

      Instr::Cmp { op, dst, a, b } => {
        self.load(frame, "eax", a);
        let rhs = Self::value_or_mem(frame, b);
        self.w(format!("    cmp eax, {rhs}"));
        let n = self.aux_labels;
        self.aux_labels += 1;
        self.w(format!("    {} cmp_true_{n}", jcc(*op)));
        self.w("    mov eax, 0");
        self.w(format!("    jmp cmp_end_{n}"));
        self.lbl(format_args!("cmp_true_{n}"));
        self.w("    mov eax, 1");
        self.lbl(format_args!("cmp_end_{n}"));
        self.store_eax(frame, dst);
      }

      Instr::Load { dst, base, offset } => {
        self.load(frame, "eax", base);
        self.w(format!("    mov ebx, dword [eax+{offset}]"));
        let mem = Self::mem(frame, dst);
        self.w(format!("    mov dword {mem}, ebx"));
      }

      Instr::Store { base, offset, src } => {
        self.load(frame, "eax", base);
        match src {
          Operand::Int(v) => self.w(format!("    mov dword [eax+{offset}], {v}")),
          Operand::Str(s) => self.w(format!("    mov dword [eax+{offset}], {s}")),
          _ => {
            self.load(frame, "ebx", src);
            self.w(format!("    mov dword [eax+{offset}], ebx"));
          }
        }
      }

      Instr::LoadI { dst, base, index } => {
        self.load(frame, "eax", base);
        match index {
          Operand::Int(i) => {
            let byte_off = 4 + i * 4;
            self.w(format!("    mov ebx, dword [eax+{byte_off}]"));
          }
          _ => {
            self.load(frame, "ebx", index);
            self.w("    mov ecx, dword [eax + ebx*4 + 4]");
            self.w("    mov ebx, ecx");
          }
        }
        let mem = Self::mem(frame, dst);
        self.w(format!("    mov dword {mem}, ebx"));
      }

      Instr::StoreI { base, index, src } => {
        self.load(frame, "eax", base);
        match index {
          Operand::Int(i) => {
            let byte_off = 4 + i * 4;
            match src {
              Operand::Int(v) => self.w(format!("    mov dword [eax+{byte_off}], {v}")),
              Operand::Str(s) => self.w(format!("    mov dword [eax+{byte_off}], {s}")),
              _ => {
                self.load(frame, "ebx", src);
                self.w(format!("    mov dword [eax+{byte_off}], ebx"));
              }
            }
          }
          _ => {
            self.load(frame, "ebx", index);
            // src goes through ecx so the index in ebx stays live
            self.load(frame, "ecx", src);
            self.w("    mov dword [eax + ebx*4 + 4], ecx");
          }
        }
      }

      Instr::Call { dst, func, args } => {
        if &**func == "print" {
          if let [arg] = &args[..] {
            if let Operand::Str(s) = arg {
              self.w(format!("    push {s}"));
              self.w("    push fmt_str");
            } else {
              self.load(frame, "eax", arg);
              self.w("    push eax");
              self.w("    push fmt_int");
            }
            self.w("    call printf");
            self.w("    add esp, 8");
          }
          // print returns nothing; a kept destination reads zero
          if let Some(dst) = dst {
            self.w("    mov eax, 0");
            self.store_eax(frame, dst);
          }
          return
        }

        for a in args.iter().rev() {
          match a {
            Operand::Int(v) => self.w(format!("    push {v}")),
            Operand::Str(s) => self.w(format!("    push {s}")),
            _ => {
              self.load(frame, "eax", a);
              self.w("    push eax");
            }
          }
        }
        self.w(format!("    call {func}"));
        if !args.is_empty() {
          self.w(format!("    add esp, {}", 4 * args.len()));
        }
        if let Some(dst) = dst {
          self.store_eax(frame, dst);
        }
      }

      Instr::Ret(value) => {
        if let Some(v) = value {
          self.load(frame, "eax", v);
        }
        self.epilogue();
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::ir::StrId;

  fn one_fn(body: Vec<Instr>, params: Vec<&str>) -> IrProgram {
    IrProgram {
      functions: vec![IrFunction {
        name: "main".into(),
        params: params.into_iter().map(Into::into).collect(),
        body,
        locals: vec![],
      }],
      strings: vec![],
      entry: Some("main".into()),
    }
  }

  #[test]
  fn prologue_epilogue_and_frame_size() {
    let p = one_fn(vec![
      Instr::Move { dst: Operand::Local("x".into()), src: Operand::Int(1) },
      Instr::Move { dst: Operand::Temp(0), src: Operand::Int(2) },
    ], vec![]);
    let asm = emit_program(&p);
    assert!(asm.contains("main:"));
    assert!(asm.contains("    push ebp"));
    assert!(asm.contains("    sub esp, 8"));
    assert!(asm.contains("    mov esp, ebp"));
    assert!(asm.contains("global main"));
  }

  #[test]
  fn trailing_return_elides_second_epilogue() {
    let p = one_fn(vec![Instr::Ret(Some(Operand::Int(3)))], vec![]);
    let asm = emit_program(&p);
    assert_eq!(asm.matches("    pop ebp").count(), 1);
  }

  #[test]
  fn params_read_above_ebp() {
    let p = one_fn(vec![
      Instr::Move { dst: Operand::Temp(0), src: Operand::Param("a".into()) },
      Instr::Ret(Some(Operand::Temp(0))),
    ], vec!["a"]);
    let asm = emit_program(&p);
    assert!(asm.contains("[ebp+8]"), "{asm}");
  }

  #[test]
  fn division_uses_cdq_idiv() {
    let p = one_fn(vec![Instr::Bin {
      op: ArithOp::Rem,
      dst: Operand::Temp(0),
      a: Operand::Int(7),
      b: Operand::Int(2),
    }], vec![]);
    let asm = emit_program(&p);
    assert!(asm.contains("    cdq"));
    assert!(asm.contains("    idiv ebx"));
    assert!(asm.contains("    mov eax, edx"));
  }

  #[test]
  fn print_string_uses_fmt_str() {
    let p = IrProgram {
      functions: vec![IrFunction {
        name: "main".into(),
        params: vec![],
        body: vec![Instr::Call {
          dst: Some(Operand::Temp(0)),
          func: "print".into(),
          args: vec![Operand::Str(StrId(0))],
        }],
        locals: vec![],
      }],
      strings: vec![b"hi\0".to_vec().into_boxed_slice()],
      entry: Some("main".into()),
    };
    let asm = emit_program(&p);
    assert!(asm.contains("str0 db 104, 105, 0"));
    assert!(asm.contains("    push str0"));
    assert!(asm.contains("    push fmt_str"));
    assert!(asm.contains("    call printf"));
  }

  #[test]
  fn caller_cleans_the_stack() {
    let p = one_fn(vec![Instr::Call {
      dst: Some(Operand::Temp(0)),
      func: "f".into(),
      args: vec![Operand::Int(1), Operand::Int(2)],
    }], vec![]);
    let asm = emit_program(&p);
    // pushed right to left
    let push2 = asm.find("    push 2").unwrap();
    let push1 = asm.find("    push 1").unwrap();
    assert!(push2 < push1);
    assert!(asm.contains("    add esp, 8"));
  }

  #[test]
  fn indexed_store_keeps_index_live() {
    let p = one_fn(vec![Instr::StoreI {
      base: Operand::Local("xs".into()),
      index: Operand::Local("i".into()),
      src: Operand::Local("v".into()),
    }], vec![]);
    let asm = emit_program(&p);
    assert!(asm.contains("    mov dword [eax + ebx*4 + 4], ecx"));
  }
}
