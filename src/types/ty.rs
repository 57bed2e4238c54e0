//! The Compiscript type system: a closed set of type tags and the
//! assignability, promotion and operator-result rules the checker
//! enforces.
//!
//! `float` exists in the rules (`int` widens to it) but the rest of the
//! pipeline treats only `int` numerically; no float value is ever
//! materialized in IR or assembly.

use std::fmt;

use crate::types::ast::{Binop, Unop};

/// A source-level type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Type {
  /// 32-bit signed integer.
  Int,
  /// Reserved for a future extension; admitted by widening only.
  Float,
  /// Boolean, represented as 0/1 at run time.
  Bool,
  /// NUL-terminated byte string.
  Str,
  /// No value; function returns only.
  Void,
  /// The type of the `null` literal.
  Null,
  /// Homogeneous array, invariant in its element type.
  Array(Box<Type>),
  /// A class instance, named; resolved through the environment.
  Class(String),
  /// A function signature.
  Func(Box<FuncTy>),
  /// Wildcard for unannotated parameters and failed inference.
  Unknown,
}

/// Parameter and return types of a function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FuncTy {
  /// Parameter types in order; `Unknown` accepts any argument.
  pub params: Vec<Type>,
  /// Return type.
  pub ret: Type,
}

impl Type {
  /// Build a `func` type.
  #[must_use] pub fn func(params: Vec<Type>, ret: Type) -> Self {
    Type::Func(Box::new(FuncTy { params, ret }))
  }

  /// `int` or `float`.
  #[must_use] pub fn is_numeric(&self) -> bool { matches!(self, Type::Int | Type::Float) }

  /// Whether this is the wildcard type.
  #[must_use] pub fn is_unknown(&self) -> bool { matches!(self, Type::Unknown) }

  /// `class`, `array` or `string`: the types `null` converts to.
  #[must_use] pub fn is_reference_like(&self) -> bool {
    matches!(self, Type::Class(_) | Type::Array(_) | Type::Str)
  }

  /// Parse a type annotation: a base name (`integer`/`int`, `float`,
  /// `boolean`/`bool`, `string`, `void`, or a class name) followed by
  /// zero or more `[]` suffixes.
  #[must_use] pub fn parse_ann(txt: &str) -> Type {
    let base_end = txt.find('[').unwrap_or(txt.len());
    let base = &txt[..base_end];
    let mut cur = match base {
      "integer" | "int" => Type::Int,
      "float" => Type::Float,
      "boolean" | "bool" => Type::Bool,
      "string" => Type::Str,
      "void" => Type::Void,
      name => Type::Class(name.to_owned()),
    };
    let mut rest = txt[base_end..].as_bytes();
    while let [b'[', b']', tail @ ..] = rest {
      cur = Type::Array(Box::new(cur));
      rest = tail;
    }
    cur
  }
}

impl fmt::Display for Type {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Type::Int => write!(f, "int"),
      Type::Float => write!(f, "float"),
      Type::Bool => write!(f, "bool"),
      Type::Str => write!(f, "string"),
      Type::Void => write!(f, "void"),
      Type::Null => write!(f, "null"),
      Type::Unknown => write!(f, "unknown"),
      Type::Array(t) => write!(f, "array({t})"),
      Type::Class(name) => write!(f, "class({name})"),
      Type::Func(sig) => {
        write!(f, "func(")?;
        for (i, p) in sig.params.iter().enumerate() {
          if i > 0 { write!(f, ",")? }
          write!(f, "{p}")?
        }
        write!(f, ")->{}", sig.ret)
      }
    }
  }
}

/// Implicit widening: `int -> float` only.
#[must_use] pub fn can_widen(src: &Type, dst: &Type) -> bool {
  matches!((src, dst), (Type::Int, Type::Float))
}

/// Can a value of type `src` be stored in a slot of type `dst`?
/// Identical types, widening, and `null` into reference-like types.
/// Arrays are invariant in their element type, so only the identity
/// case admits them.
#[must_use] pub fn assignable(src: &Type, dst: &Type) -> bool {
  src == dst || can_widen(src, dst) || (matches!(src, Type::Null) && dst.is_reference_like())
}

/// Numeric promotion: `float` wins when either side is `float`.
#[must_use] pub fn unify_numeric(a: &Type, b: &Type) -> Option<Type> {
  if !(a.is_numeric() && b.is_numeric()) { return None }
  if matches!(a, Type::Float) || matches!(b, Type::Float) { return Some(Type::Float) }
  Some(Type::Int)
}

/// Can `a op b` compare? Orderings need numerics; equality admits
/// identical types, numerics, or a reference-like against `null`.
#[must_use] pub fn compare_compatible(a: &Type, b: &Type, op: Binop) -> bool {
  if matches!(op, Binop::Lt | Binop::Le | Binop::Gt | Binop::Ge) {
    return a.is_numeric() && b.is_numeric()
  }
  a == b
    || (a.is_numeric() && b.is_numeric())
    || (a.is_reference_like() && matches!(b, Type::Null))
    || (b.is_reference_like() && matches!(a, Type::Null))
}

/// Result type of a unary operator, or `None` when ill-typed.
#[must_use] pub fn unary_result(op: Unop, t: &Type) -> Option<Type> {
  match op {
    Unop::Not => matches!(t, Type::Bool).then_some(Type::Bool),
    Unop::Neg => t.is_numeric().then(|| t.clone()),
  }
}

/// Result type of a binary operator, or `None` when ill-typed.
/// `+` also concatenates: either operand being a string makes the
/// result a string.
#[must_use] pub fn binary_result(op: Binop, lt: &Type, rt: &Type) -> Option<Type> {
  match op {
    Binop::And | Binop::Or =>
      (matches!(lt, Type::Bool) && matches!(rt, Type::Bool)).then_some(Type::Bool),
    Binop::Add if matches!(lt, Type::Str) || matches!(rt, Type::Str) => Some(Type::Str),
    Binop::Add | Binop::Sub | Binop::Mul | Binop::Div | Binop::Rem =>
      unify_numeric(lt, rt),
    Binop::Eq | Binop::Ne | Binop::Lt | Binop::Le | Binop::Gt | Binop::Ge =>
      compare_compatible(lt, rt, op).then_some(Type::Bool),
  }
}

/// Unify the branches of `cond ? a : b`: identical, numeric promotion,
/// or `null` against a reference-like type.
#[must_use] pub fn ternary_unify(a: &Type, b: &Type) -> Option<Type> {
  if a == b { return Some(a.clone()) }
  if let Some(u) = unify_numeric(a, b) { return Some(u) }
  if matches!(a, Type::Null) && b.is_reference_like() { return Some(b.clone()) }
  if matches!(b, Type::Null) && a.is_reference_like() { return Some(a.clone()) }
  None
}

/// The element type of `arr[idx]`, or `None` when `arr` is not an array
/// or `idx` is not an integer.
#[must_use] pub fn index_result(arr: &Type, idx: &Type) -> Option<Type> {
  match (arr, idx) {
    (Type::Array(elem), Type::Int) => Some((**elem).clone()),
    _ => None,
  }
}

/// Unify the element types of an array literal. Empty literals get
/// `unknown`; heterogeneous non-promotable elements collapse to
/// `unknown` too, which the checker reports.
#[must_use] pub fn array_literal_element_type(elems: &[Type]) -> Type {
  let Some(first) = elems.first() else { return Type::Unknown };
  let mut cur = first.clone();
  for t in &elems[1..] {
    if cur == *t { continue }
    match unify_numeric(&cur, t) {
      Some(u) => cur = u,
      None => return Type::Unknown,
    }
  }
  cur
}

/// Whether the argument list matches the function signature. An
/// `unknown` parameter is a wildcard accepting anything.
#[must_use] pub fn call_compatible(fun: &Type, args: &[Type]) -> bool {
  let Type::Func(sig) = fun else { return false };
  sig.params.len() == args.len()
    && sig.params.iter().zip(args).all(|(p, a)| p.is_unknown() || assignable(a, p))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn annotation_parsing() {
    assert_eq!(Type::parse_ann("integer"), Type::Int);
    assert_eq!(Type::parse_ann("int"), Type::Int);
    assert_eq!(Type::parse_ann("boolean"), Type::Bool);
    assert_eq!(Type::parse_ann("string"), Type::Str);
    assert_eq!(Type::parse_ann("Dog"), Type::Class("Dog".into()));
    assert_eq!(Type::parse_ann("integer[]"), Type::Array(Box::new(Type::Int)));
    assert_eq!(
      Type::parse_ann("Dog[][]"),
      Type::Array(Box::new(Type::Array(Box::new(Type::Class("Dog".into())))))
    );
  }

  #[test]
  fn null_assigns_to_references_only() {
    assert!(assignable(&Type::Null, &Type::Str));
    assert!(assignable(&Type::Null, &Type::Class("A".into())));
    assert!(assignable(&Type::Null, &Type::Array(Box::new(Type::Int))));
    assert!(!assignable(&Type::Null, &Type::Int));
    assert!(!assignable(&Type::Null, &Type::Bool));
  }

  #[test]
  fn arrays_are_invariant() {
    let ints = Type::Array(Box::new(Type::Int));
    let floats = Type::Array(Box::new(Type::Float));
    assert!(assignable(&ints, &ints));
    assert!(!assignable(&ints, &floats));
  }

  #[test]
  fn widening_int_to_float() {
    assert!(assignable(&Type::Int, &Type::Float));
    assert!(!assignable(&Type::Float, &Type::Int));
  }

  #[test]
  fn plus_concatenates_strings() {
    assert_eq!(binary_result(Binop::Add, &Type::Str, &Type::Str), Some(Type::Str));
    assert_eq!(binary_result(Binop::Add, &Type::Str, &Type::Int), Some(Type::Str));
    assert_eq!(binary_result(Binop::Add, &Type::Bool, &Type::Str), Some(Type::Str));
    assert_eq!(binary_result(Binop::Mul, &Type::Str, &Type::Int), None);
  }

  #[test]
  fn comparisons_produce_bool() {
    assert_eq!(binary_result(Binop::Lt, &Type::Int, &Type::Int), Some(Type::Bool));
    assert_eq!(binary_result(Binop::Lt, &Type::Str, &Type::Int), None);
    assert_eq!(binary_result(Binop::Eq, &Type::Str, &Type::Null), Some(Type::Bool));
    assert_eq!(binary_result(Binop::Eq, &Type::Bool, &Type::Int), None);
  }

  #[test]
  fn array_literal_unification() {
    assert_eq!(array_literal_element_type(&[]), Type::Unknown);
    assert_eq!(array_literal_element_type(&[Type::Int, Type::Int]), Type::Int);
    assert_eq!(array_literal_element_type(&[Type::Int, Type::Float]), Type::Float);
    assert_eq!(array_literal_element_type(&[Type::Int, Type::Str]), Type::Unknown);
  }

  #[test]
  fn unknown_params_accept_anything() {
    let print_ty = Type::func(vec![Type::Unknown], Type::Void);
    assert!(call_compatible(&print_ty, &[Type::Int]));
    assert!(call_compatible(&print_ty, &[Type::Str]));
    assert!(!call_compatible(&print_ty, &[Type::Int, Type::Int]));
    let f = Type::func(vec![Type::Int], Type::Int);
    assert!(call_compatible(&f, &[Type::Int]));
    assert!(!call_compatible(&f, &[Type::Str]));
  }

  #[test]
  fn ternary_branch_unification() {
    assert_eq!(ternary_unify(&Type::Int, &Type::Int), Some(Type::Int));
    assert_eq!(ternary_unify(&Type::Null, &Type::Str), Some(Type::Str));
    assert_eq!(ternary_unify(&Type::Int, &Type::Str), None);
  }
}
