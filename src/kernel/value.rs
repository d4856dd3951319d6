//! Core value representation for the rewriting kernel
//!
//! A `Value` is either an inline scalar (machine integer, machine double) or a
//! cheaply clonable handle to a reference-counted heap payload: expression,
//! string, symbol, opaque big number, blob, packed array, or custom host
//! object. Cloning a `Value` bumps the refcount, dropping it releases; the
//! payload is destroyed exactly when the last handle drops.
//!
//! Two notions of equality exist and must not be confused:
//! - [`Value::same`] is identity (same inline bits or same heap object),
//! - `PartialEq` is structural equality.
//!
//! [`Value::canonical_cmp`] is the total order used to sort the arguments of
//! orderless heads into canonical form.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::kernel::expr::Expr;
use crate::kernel::symbol::Symbol;

/// A symbolic value.
///
/// `Null` is the empty sentinel: the placeholder left in an expression hole by
/// [`Value::extract_item`](crate::kernel::expr) and the result of out-of-range
/// item access.
#[derive(Clone)]
pub enum Value {
    /// Empty sentinel
    Null,
    /// Machine integer
    Int(i64),
    /// Machine double
    Real(f64),
    /// Immutable string
    Str(Arc<str>),
    /// Interned (or temporary) symbol
    Symbol(Arc<Symbol>),
    /// Compound expression: head plus items
    Expr(Arc<Expr>),
    /// Opaque arbitrary-precision number payload
    Number(Arc<BigNumber>),
    /// Raw binary payload
    Blob(Arc<[u8]>),
    /// Rectangular machine-scalar array
    Packed(Arc<PackedArray>),
    /// Opaque host object with identity semantics
    Custom(Arc<dyn CustomObject>),
}

/// Kind tag for opaque numeric payloads.
///
/// The kernel never interprets the payload bytes; arbitrary-precision
/// arithmetic lives in external numeric backends. The kernel only needs the
/// payloads to compare and hash consistently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NumberKind {
    BigInt,
    Rational,
    BigFloat,
    Interval,
}

/// Opaque arbitrary-precision number: a kind tag plus backend-defined bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BigNumber {
    pub kind: NumberKind,
    pub bytes: Box<[u8]>,
}

impl BigNumber {
    pub fn new(kind: NumberKind, bytes: impl Into<Box<[u8]>>) -> Self {
        BigNumber {
            kind,
            bytes: bytes.into(),
        }
    }
}

/// Packed array payload: machine ints or machine reals with explicit
/// dimensions. Participates in the object model as a single heap value.
#[derive(Debug, Clone, PartialEq)]
pub struct PackedArray {
    pub dims: Vec<usize>,
    pub data: PackedData,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PackedData {
    Ints(Vec<i64>),
    Reals(Vec<f64>),
}

/// Opaque host object embedded in the object model.
///
/// Equality and hashing are by identity; the destructor of the concrete type
/// runs when the last handle drops.
pub trait CustomObject: Send + Sync + fmt::Debug {
    /// Short tag used when the value is displayed.
    fn type_name(&self) -> &'static str;
}

impl Value {
    /// Identity comparison: inline scalars compare by bits, heap values by
    /// pointer. Structurally equal values built independently are *not* the
    /// same.
    pub fn same(a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Null, Value::Null) => true,
            (Value::Int(x), Value::Int(y)) => x == y,
            (Value::Real(x), Value::Real(y)) => x.to_bits() == y.to_bits(),
            (Value::Str(x), Value::Str(y)) => Arc::ptr_eq(x, y),
            (Value::Symbol(x), Value::Symbol(y)) => Arc::ptr_eq(x, y),
            (Value::Expr(x), Value::Expr(y)) => Arc::ptr_eq(x, y),
            (Value::Number(x), Value::Number(y)) => Arc::ptr_eq(x, y),
            (Value::Blob(x), Value::Blob(y)) => Arc::ptr_eq(x, y),
            (Value::Packed(x), Value::Packed(y)) => Arc::ptr_eq(x, y),
            (Value::Custom(x), Value::Custom(y)) => {
                std::ptr::addr_eq(Arc::as_ptr(x), Arc::as_ptr(y))
            }
            _ => false,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_expr(&self) -> bool {
        matches!(self, Value::Expr(_))
    }

    pub fn is_symbol(&self) -> bool {
        matches!(self, Value::Symbol(_))
    }

    pub fn as_expr(&self) -> Option<&Arc<Expr>> {
        match self {
            Value::Expr(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<&Arc<Symbol>> {
        match self {
            Value::Symbol(s) => Some(s),
            _ => None,
        }
    }

    /// The symbol reached by following heads: a symbol is its own topmost
    /// symbol, a compound expression defers to its head. Used to decide which
    /// symbol's rule store governs an expression.
    pub fn topmost_symbol(&self) -> Option<Arc<Symbol>> {
        match self {
            Value::Symbol(s) => Some(s.clone()),
            Value::Expr(e) => e.head().topmost_symbol(),
            _ => None,
        }
    }

    /// True when `self` is an expression whose head is a symbol with the
    /// given name and whose length matches.
    pub fn is_expr_named(&self, name: &str, len: usize) -> bool {
        match self {
            Value::Expr(e) => {
                e.len() == len
                    && matches!(e.head(), Value::Symbol(s) if s.name() == name)
            }
            _ => false,
        }
    }

    /// Total order used for canonical (orderless) sorting.
    ///
    /// Numbers sort before strings, strings before symbols, symbols before
    /// expressions; machine numerics compare numerically across int/double,
    /// opaque numbers after machine numbers by kind then bytes; expressions
    /// compare by length, then head, then items.
    pub fn canonical_cmp(a: &Value, b: &Value) -> Ordering {
        fn class(v: &Value) -> u8 {
            match v {
                Value::Int(_) | Value::Real(_) | Value::Number(_) => 0,
                Value::Str(_) => 1,
                Value::Symbol(_) => 2,
                Value::Expr(_) => 3,
                Value::Blob(_) => 4,
                Value::Packed(_) => 5,
                Value::Custom(_) => 6,
                Value::Null => 7,
            }
        }

        let (ca, cb) = (class(a), class(b));
        if ca != cb {
            return ca.cmp(&cb);
        }

        match (a, b) {
            (Value::Int(x), Value::Int(y)) => x.cmp(y),
            (Value::Int(x), Value::Real(y)) => (*x as f64).total_cmp(y),
            (Value::Real(x), Value::Int(y)) => x.total_cmp(&(*y as f64)),
            (Value::Real(x), Value::Real(y)) => x.total_cmp(y),
            // machine numbers before opaque ones
            (Value::Int(_) | Value::Real(_), Value::Number(_)) => Ordering::Less,
            (Value::Number(_), Value::Int(_) | Value::Real(_)) => Ordering::Greater,
            (Value::Number(x), Value::Number(y)) => {
                x.kind.cmp(&y.kind).then_with(|| x.bytes.cmp(&y.bytes))
            }
            (Value::Str(x), Value::Str(y)) => x.as_ref().cmp(y.as_ref()),
            (Value::Symbol(x), Value::Symbol(y)) => x.name().cmp(y.name()),
            (Value::Expr(x), Value::Expr(y)) => x
                .len()
                .cmp(&y.len())
                .then_with(|| Value::canonical_cmp(x.head(), y.head()))
                .then_with(|| {
                    for (ix, iy) in x.items().iter().zip(y.items().iter()) {
                        let ord = Value::canonical_cmp(ix, iy);
                        if ord != Ordering::Equal {
                            return ord;
                        }
                    }
                    Ordering::Equal
                }),
            (Value::Blob(x), Value::Blob(y)) => x.as_ref().cmp(y.as_ref()),
            (Value::Packed(x), Value::Packed(y)) => {
                let ptr_x = Arc::as_ptr(x) as usize;
                let ptr_y = Arc::as_ptr(y) as usize;
                ptr_x.cmp(&ptr_y)
            }
            (Value::Custom(x), Value::Custom(y)) => {
                let ptr_x = Arc::as_ptr(x) as *const () as usize;
                let ptr_y = Arc::as_ptr(y) as *const () as usize;
                ptr_x.cmp(&ptr_y)
            }
            _ => Ordering::Equal,
        }
    }
}

impl PartialEq for Value {
    /// Structural equality. Symbols and custom objects compare by identity
    /// (interning makes same-name symbols identical within one kernel);
    /// reals treat every NaN as equal to keep `Eq`/`Hash` consistent.
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Int(x), Value::Int(y)) => x == y,
            (Value::Real(x), Value::Real(y)) => x == y || (x.is_nan() && y.is_nan()),
            (Value::Str(x), Value::Str(y)) => x == y,
            (Value::Symbol(x), Value::Symbol(y)) => Arc::ptr_eq(x, y),
            (Value::Expr(x), Value::Expr(y)) => {
                Arc::ptr_eq(x, y) || (x.head() == y.head() && x.items() == y.items())
            }
            (Value::Number(x), Value::Number(y)) => x == y,
            (Value::Blob(x), Value::Blob(y)) => x == y,
            (Value::Packed(x), Value::Packed(y)) => x == y,
            (Value::Custom(x), Value::Custom(y)) => {
                std::ptr::addr_eq(Arc::as_ptr(x), Arc::as_ptr(y))
            }
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Int(x) => x.hash(state),
            Value::Real(x) => {
                // normalize -0.0 and NaN payloads so Hash agrees with Eq
                let x = if *x == 0.0 {
                    0.0f64
                } else if x.is_nan() {
                    f64::NAN
                } else {
                    *x
                };
                x.to_bits().hash(state);
            }
            Value::Str(x) => x.hash(state),
            Value::Symbol(x) => (Arc::as_ptr(x) as usize).hash(state),
            Value::Expr(x) => {
                x.head().hash(state);
                x.items().hash(state);
            }
            Value::Number(x) => x.hash(state),
            Value::Blob(x) => x.hash(state),
            Value::Packed(x) => {
                x.dims.hash(state);
                match &x.data {
                    PackedData::Ints(v) => v.hash(state),
                    PackedData::Reals(v) => {
                        for r in v {
                            r.to_bits().hash(state);
                        }
                    }
                }
            }
            Value::Custom(x) => (Arc::as_ptr(x) as *const () as usize).hash(state),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Int(x) => write!(f, "{}", x),
            Value::Real(x) => write!(f, "{:?}", x),
            Value::Str(x) => write!(f, "{:?}", x),
            Value::Symbol(x) => write!(f, "{}", x.name()),
            Value::Expr(x) => {
                write!(f, "{}(", x.head())?;
                for (i, item) in x.items().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            Value::Number(x) => write!(f, "<{:?}:{} bytes>", x.kind, x.bytes.len()),
            Value::Blob(x) => write!(f, "<blob:{} bytes>", x.len()),
            Value::Packed(x) => write!(f, "<packed:{:?}>", x.dims),
            Value::Custom(x) => write!(f, "<{}>", x.type_name()),
        }
    }
}

impl From<i64> for Value {
    fn from(x: i64) -> Value {
        Value::Int(x)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Value {
        Value::Real(x)
    }
}

impl From<&str> for Value {
    fn from(x: &str) -> Value {
        Value::Str(Arc::from(x))
    }
}

impl From<Arc<Symbol>> for Value {
    fn from(s: Arc<Symbol>) -> Value {
        Value::Symbol(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::context::Kernel;

    #[test]
    fn test_clone_drop_round_trip() {
        let kernel = Kernel::new();
        let sym = kernel.symbol("x");
        let v = Value::Symbol(sym);
        let before = v.clone();
        {
            let extra = v.clone();
            assert!(Value::same(&extra, &v));
        }
        // after the extra handle drops, the value is unchanged
        assert!(Value::same(&before, &v));
        assert_eq!(before, v);
    }

    #[test]
    fn test_same_vs_structural_equality() {
        let a = Value::from("hello");
        let b = Value::from("hello");
        assert_eq!(a, b);
        assert!(!Value::same(&a, &b));
        assert!(Value::same(&a, &a.clone()));
    }

    #[test]
    fn test_canonical_order_classes() {
        let kernel = Kernel::new();
        let num = Value::Int(3);
        let s = Value::from("a");
        let sym = Value::Symbol(kernel.symbol("a"));
        assert_eq!(Value::canonical_cmp(&num, &s), Ordering::Less);
        assert_eq!(Value::canonical_cmp(&s, &sym), Ordering::Less);
        assert_eq!(Value::canonical_cmp(&sym, &num), Ordering::Greater);
    }

    #[test]
    fn test_canonical_order_mixed_numerics() {
        assert_eq!(
            Value::canonical_cmp(&Value::Int(1), &Value::Real(1.5)),
            Ordering::Less
        );
        assert_eq!(
            Value::canonical_cmp(&Value::Real(2.5), &Value::Int(2)),
            Ordering::Greater
        );
    }

    #[test]
    fn test_opaque_number_equality() {
        let a = Value::Number(Arc::new(BigNumber::new(NumberKind::BigInt, vec![1, 2, 3])));
        let b = Value::Number(Arc::new(BigNumber::new(NumberKind::BigInt, vec![1, 2, 3])));
        let c = Value::Number(Arc::new(BigNumber::new(NumberKind::Rational, vec![1, 2, 3])));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_hash_agrees_with_eq() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert(Value::Real(0.0), 1);
        assert_eq!(map.get(&Value::Real(-0.0)), Some(&1));
    }

    #[test]
    fn test_packed_array_structural_equality() {
        let a = Value::Packed(Arc::new(PackedArray {
            dims: vec![2, 2],
            data: PackedData::Ints(vec![1, 2, 3, 4]),
        }));
        let b = Value::Packed(Arc::new(PackedArray {
            dims: vec![2, 2],
            data: PackedData::Ints(vec![1, 2, 3, 4]),
        }));
        let c = Value::Packed(Arc::new(PackedArray {
            dims: vec![4],
            data: PackedData::Ints(vec![1, 2, 3, 4]),
        }));
        assert_eq!(a, b);
        assert!(!Value::same(&a, &b));
        assert_ne!(a, c);
    }

    #[test]
    fn test_custom_objects_compare_by_identity() {
        #[derive(Debug)]
        struct Handle;
        impl CustomObject for Handle {
            fn type_name(&self) -> &'static str {
                "handle"
            }
        }
        let a = Value::Custom(Arc::new(Handle));
        let b = Value::Custom(Arc::new(Handle));
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert!(Value::same(&a, &a.clone()));
    }
}
