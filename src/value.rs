// ABOUTME: Tagged-union runtime value shared by the virtual machine and the interpreter

use crate::error::RuntimeError;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

/// A single ordinal value usable as a set element (integers, enum ordinals,
/// and character codes all collapse to `i64` at runtime).
pub type Ordinal = i64;

#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    Real(f64),
    Str(String),
    Bool(bool),
    Nil,
    Set(BTreeSet<Ordinal>),
    /// Address of a heap cell allocated by `new`; `0` is never a valid
    /// address, so it doubles as the representation for an uninitialized
    /// pointer variable alongside `Nil`.
    HeapAddr(u64),
    /// Opaque handle into the owning VM's/interpreter's array store.
    ArrayRef(usize),
    /// Opaque handle into the owning VM's/interpreter's record store.
    RecordRef(usize),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "integer",
            Value::Real(_) => "real",
            Value::Str(_) => "string",
            Value::Bool(_) => "boolean",
            Value::Nil => "nil",
            Value::Set(_) => "set",
            Value::HeapAddr(_) => "pointer",
            Value::ArrayRef(_) => "array",
            Value::RecordRef(_) => "record",
        }
    }

    pub fn as_int(&self) -> Result<i64, RuntimeError> {
        match self {
            Value::Int(n) => Ok(*n),
            Value::Real(n) => Ok(*n as i64),
            other => Err(RuntimeError::Other(format!(
                "expected an integer, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn as_real(&self) -> Result<f64, RuntimeError> {
        match self {
            Value::Int(n) => Ok(*n as f64),
            Value::Real(n) => Ok(*n),
            other => Err(RuntimeError::Other(format!(
                "expected a number, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn as_bool(&self) -> Result<bool, RuntimeError> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(RuntimeError::Other(format!(
                "expected a boolean, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn as_str(&self) -> Result<&str, RuntimeError> {
        match self {
            Value::Str(s) => Ok(s),
            other => Err(RuntimeError::Other(format!(
                "expected a string, got {}",
                other.type_name()
            ))),
        }
    }

    fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Real(_))
    }

    /// `+`. Numeric operands coerce to `real` if either side is `real`;
    /// two strings concatenate, matching the opcode's documented double duty.
    pub fn add(&self, other: &Value) -> Result<Value, RuntimeError> {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{a}{b}"))),
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a + b)),
            (a, b) if a.is_numeric() && b.is_numeric() => Ok(Value::Real(a.as_real()? + b.as_real()?)),
            (a, b) => Err(RuntimeError::Other(format!(
                "cannot add {} and {}",
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    pub fn sub(&self, other: &Value) -> Result<Value, RuntimeError> {
        self.numeric_binop(other, "subtract", |a, b| a - b, |a, b| a - b)
    }

    pub fn mul(&self, other: &Value) -> Result<Value, RuntimeError> {
        self.numeric_binop(other, "multiply", |a, b| a * b, |a, b| a * b)
    }

    /// `/`. Always produces `real`, per ISO Pascal's real division operator.
    pub fn div(&self, other: &Value) -> Result<Value, RuntimeError> {
        let a = self.as_real()?;
        let b = other.as_real()?;
        Ok(Value::Real(a / b))
    }

    /// `div`. Integer division truncated toward zero, via the double
    /// quotient — a zero divisor is not trapped, it follows IEEE semantics
    /// of the host and saturates to `i64::MAX`/`i64::MIN`.
    pub fn idiv(&self, other: &Value) -> Result<Value, RuntimeError> {
        let a = self.as_int()?;
        let b = other.as_int()?;
        Ok(Value::Int(((a as f64) / (b as f64)) as i64))
    }

    /// `mod`. Derived from the same double quotient as `idiv` so a zero
    /// divisor is not trapped either: `a - idiv(a, b) * b`.
    pub fn modulo(&self, other: &Value) -> Result<Value, RuntimeError> {
        let a = self.as_int()?;
        let b = other.as_int()?;
        let q = ((a as f64) / (b as f64)) as i64;
        Ok(Value::Int(a.wrapping_sub(q.wrapping_mul(b))))
    }

    fn numeric_binop(
        &self,
        other: &Value,
        verb: &str,
        int_op: fn(i64, i64) -> i64,
        real_op: fn(f64, f64) -> f64,
    ) -> Result<Value, RuntimeError> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(int_op(*a, *b))),
            (a, b) if a.is_numeric() && b.is_numeric() => {
                Ok(Value::Real(real_op(a.as_real()?, b.as_real()?)))
            }
            (a, b) => Err(RuntimeError::Other(format!(
                "cannot {verb} {} and {}",
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    pub fn neg(&self) -> Result<Value, RuntimeError> {
        match self {
            Value::Int(n) => Ok(Value::Int(-n)),
            Value::Real(n) => Ok(Value::Real(-n)),
            other => Err(RuntimeError::Other(format!(
                "cannot negate {}",
                other.type_name()
            ))),
        }
    }

    pub fn not(&self) -> Result<Value, RuntimeError> {
        Ok(Value::Bool(!self.as_bool()?))
    }

    /// Orders numerics and strings; used by the relational opcodes.
    pub fn compare(&self, other: &Value) -> Result<Ordering, RuntimeError> {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Ok(a.cmp(b)),
            (a, b) if a.is_numeric() && b.is_numeric() => a
                .as_real()?
                .partial_cmp(&b.as_real()?)
                .ok_or_else(|| RuntimeError::Other("NaN comparison".to_string())),
            (a, b) => Err(RuntimeError::Other(format!(
                "cannot compare {} and {}",
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    pub fn values_equal(&self, other: &Value) -> Result<bool, RuntimeError> {
        match (self, other) {
            (Value::Nil, Value::Nil) => Ok(true),
            (Value::Nil, Value::HeapAddr(0)) | (Value::HeapAddr(0), Value::Nil) => Ok(true),
            (Value::HeapAddr(a), Value::HeapAddr(b)) => Ok(a == b),
            (Value::Set(a), Value::Set(b)) => Ok(a == b),
            _ => Ok(self.compare(other)? == Ordering::Equal),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{n}"),
            Value::Real(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Bool(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            Value::Nil => write!(f, "nil"),
            Value::Set(items) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Value::HeapAddr(addr) => write!(f, "@{addr}"),
            Value::ArrayRef(id) => write!(f, "<array #{id}>"),
            Value::RecordRef(id) => write!(f, "<record #{id}>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_promotes_mixed_int_real_to_real() {
        let v = Value::Int(1).add(&Value::Real(2.5)).unwrap();
        assert!(matches!(v, Value::Real(r) if (r - 3.5).abs() < f64::EPSILON));
    }

    #[test]
    fn add_concatenates_strings() {
        let v = Value::Str("foo".into()).add(&Value::Str("bar".into())).unwrap();
        assert!(matches!(v, Value::Str(s) if s == "foobar"));
    }

    #[test]
    fn idiv_truncates_toward_zero() {
        let v = Value::Int(-7).idiv(&Value::Int(2)).unwrap();
        assert!(matches!(v, Value::Int(-3)));
    }

    #[test]
    fn idiv_by_zero_is_not_trapped() {
        let v = Value::Int(1).idiv(&Value::Int(0)).unwrap();
        assert!(matches!(v, Value::Int(i64::MAX)));
        let v = Value::Int(-1).idiv(&Value::Int(0)).unwrap();
        assert!(matches!(v, Value::Int(i64::MIN)));
    }

    #[test]
    fn modulo_by_zero_is_not_trapped() {
        assert!(Value::Int(5).modulo(&Value::Int(0)).is_ok());
    }

    #[test]
    fn div_always_produces_real() {
        let v = Value::Int(4).div(&Value::Int(2)).unwrap();
        assert!(matches!(v, Value::Real(r) if (r - 2.0).abs() < f64::EPSILON));
    }

    #[test]
    fn nil_equals_zero_heap_address() {
        assert!(Value::Nil.values_equal(&Value::HeapAddr(0)).unwrap());
    }
}
