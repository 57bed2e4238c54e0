//! Native code generation: a shared frame/ABI helper and two naive
//! text backends ([`x86`] and [`mips`]).
//!
//! Neither backend allocates registers: every operand lives in a
//! 4-byte stack slot and each IR instruction loads what it needs into
//! scratch registers, operates, and stores the result back. Correct,
//! slow, and easy to audit against a simulator.

use std::rc::Rc;

use hashbrown::HashMap;

use crate::types::ir::{Instr, IrFunction, Operand};

pub mod mips;
pub mod x86;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Slot {
  Local(Rc<str>),
  Temp(u32),
}

/// Per-function activation record. Locals and temps get 4-byte slots
/// below the frame base as they are first seen; parameter
/// displacements follow the 32-bit cdecl layout (`8 + 4k` bytes above
/// the saved base pointer), which the MIPS backend rebases by 8 to fit
/// its own prologue.
#[derive(Debug)]
pub struct Frame {
  param_disp: HashMap<Rc<str>, i32>,
  slots: HashMap<Slot, i32>,
  size: i32,
}

impl Frame {
  /// A frame for a function with the given parameters.
  #[must_use] pub fn new(params: &[Rc<str>]) -> Self {
    let mut param_disp = HashMap::new();
    let mut disp = 8;
    for p in params {
      param_disp.insert(p.clone(), disp);
      disp += 4;
    }
    Frame { param_disp, slots: HashMap::new(), size: 0 }
  }

  /// The displacement of a parameter above the frame base, or `None`
  /// for an unknown name.
  #[must_use] pub fn param_disp(&self, name: &str) -> Option<i32> {
    self.param_disp.get(name).copied()
  }

  /// The slot offset of a local or temp below the frame base,
  /// allocating one on first use.
  ///
  /// # Panics
  /// Panics on constants and parameters, which have no slot.
  pub fn ensure_slot(&mut self, op: &Operand) -> i32 {
    let key = match op {
      Operand::Local(name) => Slot::Local(name.clone()),
      Operand::Temp(t) => Slot::Temp(*t),
      _ => panic!("operand has no frame slot: {op}"),
    };
    *self.slots.entry(key).or_insert_with(|| {
      self.size += 4;
      self.size
    })
  }

  /// Walk a body and assign slots for every local and temp, so the
  /// frame size is final before the prologue is emitted.
  pub fn reserve_all(&mut self, f: &IrFunction) {
    for ins in &f.body {
      ins.for_each_operand(&mut |op| {
        if matches!(op, Operand::Local(_) | Operand::Temp(_)) {
          self.ensure_slot(op);
        }
      });
    }
  }

  /// Total bytes of locals and temps, always word-aligned.
  #[must_use] pub fn local_size(&self) -> i32 { self.size }
}

/// The last instruction that is not a label, used by both backends to
/// skip a redundant trailing epilogue after a `Ret`.
pub(crate) fn last_real_instr(f: &IrFunction) -> Option<&Instr> {
  f.body.iter().rev().find(|i| !matches!(i, Instr::Label(_)))
}
