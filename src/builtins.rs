// ABOUTME: Built-in function catalog shared by the analyzer, compiler, VM, and interpreter

use crate::error::RuntimeError;
use crate::semant::Type;
use crate::value::Value;

/// Arity of a built-in. Every entry in the catalog is fixed except `concat`,
/// which is variadic (arity >= 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    pub fn accepts(&self, n: usize) -> bool {
        match self {
            Arity::Exact(k) => n == *k,
            Arity::AtLeast(k) => n >= *k,
        }
    }
}

/// One catalog entry: the metadata the analyzer needs to arity- and
/// type-check a call, paired with the executor the VM and interpreter share.
pub struct Builtin {
    pub name: &'static str,
    pub arity: Arity,
    /// `Type::Auto` for `abs`/`sqr`, which return whatever numeric type they
    /// were given rather than a single fixed type.
    pub return_type: Type,
    pub call: fn(&[Value]) -> Result<Value, RuntimeError>,
}

/// The fixed built-in catalog, grouped by category.
pub static BUILTINS: &[Builtin] = &[
    Builtin { name: "abs", arity: Arity::Exact(1), return_type: Type::Auto, call: builtin_abs },
    Builtin { name: "sqr", arity: Arity::Exact(1), return_type: Type::Auto, call: builtin_sqr },
    Builtin { name: "sqrt", arity: Arity::Exact(1), return_type: Type::Real, call: builtin_sqrt },
    Builtin { name: "sin", arity: Arity::Exact(1), return_type: Type::Real, call: builtin_sin },
    Builtin { name: "cos", arity: Arity::Exact(1), return_type: Type::Real, call: builtin_cos },
    Builtin { name: "arctan", arity: Arity::Exact(1), return_type: Type::Real, call: builtin_arctan },
    Builtin { name: "ln", arity: Arity::Exact(1), return_type: Type::Real, call: builtin_ln },
    Builtin { name: "exp", arity: Arity::Exact(1), return_type: Type::Real, call: builtin_exp },
    Builtin { name: "trunc", arity: Arity::Exact(1), return_type: Type::Integer, call: builtin_trunc },
    Builtin { name: "round", arity: Arity::Exact(1), return_type: Type::Integer, call: builtin_round },
    Builtin { name: "odd", arity: Arity::Exact(1), return_type: Type::Boolean, call: builtin_odd },
    Builtin { name: "length", arity: Arity::Exact(1), return_type: Type::Integer, call: builtin_length },
    Builtin { name: "copy", arity: Arity::Exact(3), return_type: Type::Str, call: builtin_copy },
    Builtin { name: "concat", arity: Arity::AtLeast(2), return_type: Type::Str, call: builtin_concat },
    Builtin { name: "pos", arity: Arity::Exact(2), return_type: Type::Integer, call: builtin_pos },
    Builtin { name: "upcase", arity: Arity::Exact(1), return_type: Type::Str, call: builtin_upcase },
    Builtin { name: "lowercase", arity: Arity::Exact(1), return_type: Type::Str, call: builtin_lowercase },
    Builtin { name: "chr", arity: Arity::Exact(1), return_type: Type::Str, call: builtin_chr },
    Builtin { name: "ord", arity: Arity::Exact(1), return_type: Type::Integer, call: builtin_ord },
    // `eof` on a file variable is dispatched by the compiler as `Expr::FileEof`
    // rather than a generic call, but it is still a catalog entry so the
    // analyzer can report it in error messages and arity tables uniformly.
    Builtin { name: "eof", arity: Arity::Exact(1), return_type: Type::Boolean, call: builtin_eof_stub },
];

/// Looks up a built-in by name, case-insensitively, matching the
/// case-folding rule applied to every identifier lookup.
pub fn lookup(name: &str) -> Option<&'static Builtin> {
    BUILTINS.iter().find(|b| b.name.eq_ignore_ascii_case(name))
}

fn numeric_type_error(fname: &str, v: &Value) -> RuntimeError {
    RuntimeError::Other(format!("{fname}: expected a number, got {}", v.type_name()))
}

fn builtin_abs(args: &[Value]) -> Result<Value, RuntimeError> {
    match &args[0] {
        Value::Int(n) => Ok(Value::Int(n.abs())),
        Value::Real(n) => Ok(Value::Real(n.abs())),
        other => Err(numeric_type_error("abs", other)),
    }
}

fn builtin_sqr(args: &[Value]) -> Result<Value, RuntimeError> {
    match &args[0] {
        Value::Int(n) => Ok(Value::Int(n * n)),
        Value::Real(n) => Ok(Value::Real(n * n)),
        other => Err(numeric_type_error("sqr", other)),
    }
}

fn builtin_sqrt(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Real(args[0].as_real()?.sqrt()))
}

fn builtin_sin(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Real(args[0].as_real()?.sin()))
}

fn builtin_cos(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Real(args[0].as_real()?.cos()))
}

fn builtin_arctan(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Real(args[0].as_real()?.atan()))
}

fn builtin_ln(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Real(args[0].as_real()?.ln()))
}

fn builtin_exp(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Real(args[0].as_real()?.exp()))
}

/// Truncates toward zero, matching the `idiv`/`modulo` truncation rule rather
/// than `f64::trunc`'s rounding-mode-independent but equivalent behavior.
fn builtin_trunc(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Int(args[0].as_real()?.trunc() as i64))
}

fn builtin_round(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Int(args[0].as_real()?.round() as i64))
}

fn builtin_odd(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Bool(args[0].as_int()? % 2 != 0))
}

fn builtin_length(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Int(args[0].as_str()?.chars().count() as i64))
}

/// 1-based, out-of-range `start`/`count` clamped rather than erroring.
fn builtin_copy(args: &[Value]) -> Result<Value, RuntimeError> {
    let s: Vec<char> = args[0].as_str()?.chars().collect();
    let start = args[1].as_int()?;
    let count = args[2].as_int()?;
    let start_idx = (start.max(1) as usize).saturating_sub(1).min(s.len());
    let end_idx = if count < 0 {
        start_idx
    } else {
        (start_idx + count as usize).min(s.len())
    };
    Ok(Value::Str(s[start_idx..end_idx].iter().collect()))
}

fn builtin_concat(args: &[Value]) -> Result<Value, RuntimeError> {
    let mut out = String::new();
    for a in args {
        out.push_str(a.as_str()?);
    }
    Ok(Value::Str(out))
}

/// 1-based index of `needle` within `haystack`, `0` if absent.
fn builtin_pos(args: &[Value]) -> Result<Value, RuntimeError> {
    let needle = args[0].as_str()?;
    let haystack = args[1].as_str()?;
    let haystack_chars: Vec<char> = haystack.chars().collect();
    let needle_chars: Vec<char> = needle.chars().collect();
    if needle_chars.is_empty() {
        return Ok(Value::Int(0));
    }
    for start in 0..=haystack_chars.len().saturating_sub(needle_chars.len()) {
        if haystack_chars[start..].starts_with(needle_chars.as_slice()) {
            return Ok(Value::Int(start as i64 + 1));
        }
    }
    Ok(Value::Int(0))
}

fn builtin_upcase(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Str(args[0].as_str()?.to_uppercase()))
}

fn builtin_lowercase(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::Str(args[0].as_str()?.to_lowercase()))
}

fn builtin_chr(args: &[Value]) -> Result<Value, RuntimeError> {
    let n = args[0].as_int()?;
    let c = char::from_u32(n as u32)
        .ok_or_else(|| RuntimeError::Other(format!("chr: {n} is not a valid character ordinal")))?;
    Ok(Value::Str(c.to_string()))
}

/// Ordinal of the *first* character of a string value.
fn builtin_ord(args: &[Value]) -> Result<Value, RuntimeError> {
    match &args[0] {
        Value::Int(n) => Ok(Value::Int(*n)),
        Value::Str(s) => {
            let c = s
                .chars()
                .next()
                .ok_or_else(|| RuntimeError::Other("ord: empty string".to_string()))?;
            Ok(Value::Int(c as i64))
        }
        other => Err(RuntimeError::Other(format!(
            "ord: expected a string or ordinal, got {}",
            other.type_name()
        ))),
    }
}

/// Never dispatched directly: the compiler lowers `eof(f)` to a dedicated
/// file-query opcode, and the interpreter resolves it via `Expr::FileEof`.
/// Present here only so the catalog's arity table is complete.
fn builtin_eof_stub(_args: &[Value]) -> Result<Value, RuntimeError> {
    Err(RuntimeError::Other(
        "eof must be compiled to a file-query opcode, not called as a builtin".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abs_and_sqr_preserve_operand_type() {
        assert!(matches!(builtin_abs(&[Value::Int(-3)]).unwrap(), Value::Int(3)));
        assert!(matches!(builtin_abs(&[Value::Real(-3.5)]).unwrap(), Value::Real(r) if r == 3.5));
        assert!(matches!(builtin_sqr(&[Value::Int(4)]).unwrap(), Value::Int(16)));
    }

    #[test]
    fn trunc_and_round_go_to_integer() {
        assert!(matches!(builtin_trunc(&[Value::Real(3.9)]).unwrap(), Value::Int(3)));
        assert!(matches!(builtin_trunc(&[Value::Real(-3.9)]).unwrap(), Value::Int(-3)));
        assert!(matches!(builtin_round(&[Value::Real(3.5)]).unwrap(), Value::Int(4)));
    }

    #[test]
    fn odd_checks_low_bit() {
        assert!(matches!(builtin_odd(&[Value::Int(3)]).unwrap(), Value::Bool(true)));
        assert!(matches!(builtin_odd(&[Value::Int(4)]).unwrap(), Value::Bool(false)));
    }

    #[test]
    fn length_counts_characters() {
        assert!(matches!(
            builtin_length(&[Value::Str("hello".into())]).unwrap(),
            Value::Int(5)
        ));
    }

    #[test]
    fn copy_is_one_based_with_clamping() {
        let v = builtin_copy(&[Value::Str("hello world".into()), Value::Int(7), Value::Int(100)]).unwrap();
        assert!(matches!(v, Value::Str(s) if s == "world"));

        let v = builtin_copy(&[Value::Str("abc".into()), Value::Int(0), Value::Int(2)]).unwrap();
        assert!(matches!(v, Value::Str(s) if s == "ab"));
    }

    #[test]
    fn concat_requires_at_least_two_but_catalog_does_not_enforce_it_here() {
        let v = builtin_concat(&[Value::Str("a".into()), Value::Str("b".into()), Value::Str("c".into())])
            .unwrap();
        assert!(matches!(v, Value::Str(s) if s == "abc"));
    }

    #[test]
    fn pos_is_one_based_zero_when_absent() {
        assert!(matches!(
            builtin_pos(&[Value::Str("lo".into()), Value::Str("hello".into())]).unwrap(),
            Value::Int(4)
        ));
        assert!(matches!(
            builtin_pos(&[Value::Str("xyz".into()), Value::Str("hello".into())]).unwrap(),
            Value::Int(0)
        ));
    }

    #[test]
    fn chr_and_ord_are_inverses() {
        let ch = builtin_chr(&[Value::Int(65)]).unwrap();
        assert!(matches!(&ch, Value::Str(s) if s == "A"));
        assert!(matches!(builtin_ord(&[ch]).unwrap(), Value::Int(65)));
    }

    #[test]
    fn arity_accepts_matches_exact_and_at_least() {
        assert!(Arity::Exact(1).accepts(1));
        assert!(!Arity::Exact(1).accepts(2));
        assert!(Arity::AtLeast(2).accepts(2));
        assert!(Arity::AtLeast(2).accepts(5));
        assert!(!Arity::AtLeast(2).accepts(1));
    }

    #[test]
    fn lookup_is_case_insensitive() {
        assert!(lookup("SQRT").is_some());
        assert!(lookup("Length").is_some());
        assert!(lookup("not-a-builtin").is_none());
    }
}
