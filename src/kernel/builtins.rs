//! Native builtin dispatch
//!
//! When rule lookup fails, the evaluator dispatches to native code attached
//! to the relevant symbol, in the same three contexts as the rule caches:
//! up (an argument's symbol), down (a symbol head) and sub (a compound head).
//!
//! A builtin receives the whole expression and returns `Ok(Some(result))`
//! when it rewrote it, `Ok(None)` when it does not apply (the expression is
//! left for the next dispatch stage). Builtins may recurse into `evaluate`,
//! may emit diagnostics, and must not hold any rule-cache lock while running.
//!
//! Only a small arithmetic/structural set ships with the kernel — enough to
//! exercise dispatch; a full function library lives with the embedding
//! application.

use dashmap::DashMap;
use std::sync::Arc;

use crate::kernel::context::Kernel;
use crate::kernel::symbol::{Attributes, Symbol};
use crate::kernel::thread::EvalResult;
use crate::kernel::value::Value;

/// Native implementation attached to a symbol. `None` means "did not apply".
pub type BuiltinFn = fn(&Kernel, Value) -> EvalResult<Option<Value>>;

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum BuiltinUsage {
    Up,
    Down,
    Sub,
}

/// Symbol-keyed registries, one per dispatch context.
pub(crate) struct BuiltinRegistry {
    up: DashMap<usize, (Arc<Symbol>, BuiltinFn)>,
    down: DashMap<usize, (Arc<Symbol>, BuiltinFn)>,
    sub: DashMap<usize, (Arc<Symbol>, BuiltinFn)>,
}

fn key(sym: &Arc<Symbol>) -> usize {
    Arc::as_ptr(sym) as usize
}

impl BuiltinRegistry {
    pub(crate) fn new() -> BuiltinRegistry {
        BuiltinRegistry {
            up: DashMap::new(),
            down: DashMap::new(),
            sub: DashMap::new(),
        }
    }

    pub(crate) fn register(&self, usage: BuiltinUsage, sym: &Arc<Symbol>, f: BuiltinFn) {
        let table = match usage {
            BuiltinUsage::Up => &self.up,
            BuiltinUsage::Down => &self.down,
            BuiltinUsage::Sub => &self.sub,
        };
        table.insert(key(sym), (sym.clone(), f));
    }

    pub(crate) fn get(&self, usage: BuiltinUsage, sym: &Arc<Symbol>) -> Option<BuiltinFn> {
        let table = match usage {
            BuiltinUsage::Up => &self.up,
            BuiltinUsage::Down => &self.down,
            BuiltinUsage::Sub => &self.sub,
        };
        table.get(&key(sym)).map(|entry| entry.1)
    }
}

// ============================================================================
// Core builtins
// ============================================================================

/// `Evaluate(x)` forces evaluation of an argument that a hold attribute would
/// otherwise suppress; by the time the down call runs the argument is already
/// evaluated, so the call just unwraps.
fn evaluate_builtin(_kernel: &Kernel, expr: Value) -> EvalResult<Option<Value>> {
    if expr.expr_len() == 1 {
        Ok(Some(expr.get_item(1)))
    } else {
        Ok(None)
    }
}

enum Folded {
    Int(i64),
    Real(f64),
}

impl Folded {
    fn to_value(&self) -> Value {
        match self {
            Folded::Int(x) => Value::Int(*x),
            Folded::Real(x) => Value::Real(*x),
        }
    }
}

/// Fold the machine-numeric items of a flat/orderless expression with `int_op`
/// / `real_op`, keeping symbolic items untouched.
fn fold_numeric(
    expr: &Value,
    unit: i64,
    int_op: fn(i64, i64) -> i64,
    real_op: fn(f64, f64) -> f64,
) -> Option<Value> {
    let e = expr.as_expr()?;
    if e.is_empty() {
        return Some(Value::Int(unit));
    }
    if e.len() == 1 {
        return Some(e.items()[0].clone());
    }

    let mut acc = Folded::Int(unit);
    let mut numeric = 0usize;
    let mut rest: Vec<Value> = Vec::new();
    for item in e.items() {
        match item {
            Value::Int(x) => {
                numeric += 1;
                acc = match acc {
                    Folded::Int(a) => Folded::Int(int_op(a, *x)),
                    Folded::Real(a) => Folded::Real(real_op(a, *x as f64)),
                };
            }
            Value::Real(x) => {
                numeric += 1;
                acc = match acc {
                    Folded::Int(a) => Folded::Real(real_op(a as f64, *x)),
                    Folded::Real(a) => Folded::Real(real_op(a, *x)),
                };
            }
            other => rest.push(other.clone()),
        }
    }
    if numeric < 2 {
        return None;
    }
    if rest.is_empty() {
        return Some(acc.to_value());
    }
    let mut items = Vec::with_capacity(rest.len() + 1);
    items.push(acc.to_value());
    items.extend(rest);
    Some(crate::kernel::expr::Expr::from_items(e.head().clone(), items))
}

fn plus_builtin(_kernel: &Kernel, expr: Value) -> EvalResult<Option<Value>> {
    Ok(fold_numeric(&expr, 0, i64::wrapping_add, |a, b| a + b))
}

fn times_builtin(_kernel: &Kernel, expr: Value) -> EvalResult<Option<Value>> {
    Ok(fold_numeric(&expr, 1, i64::wrapping_mul, |a, b| a * b))
}

fn compare_builtin(
    kernel: &Kernel,
    expr: &Value,
    cmp: fn(f64, f64) -> bool,
) -> Option<Value> {
    let e = expr.as_expr()?;
    if e.len() != 2 {
        return None;
    }
    let num = |v: &Value| match v {
        Value::Int(x) => Some(*x as f64),
        Value::Real(x) => Some(*x),
        _ => None,
    };
    let a = num(&e.items()[0])?;
    let b = num(&e.items()[1])?;
    Some(kernel.boolean(cmp(a, b)))
}

fn less_builtin(kernel: &Kernel, expr: Value) -> EvalResult<Option<Value>> {
    Ok(compare_builtin(kernel, &expr, |a, b| a < b))
}

fn greater_builtin(kernel: &Kernel, expr: Value) -> EvalResult<Option<Value>> {
    Ok(compare_builtin(kernel, &expr, |a, b| a > b))
}

/// Install the core symbols' attributes and native code into a fresh kernel.
pub(crate) fn install_defaults(kernel: &Kernel) {
    let protect = |name: &str| {
        let sym = kernel.symbol(name);
        sym.add_attributes(Attributes::PROTECTED);
        sym
    };

    for name in [
        "List",
        "Blank",
        "Pattern",
        "General",
        "Aborted",
        "Default",
        "Approximate",
        "True",
        "False",
    ] {
        protect(name);
    }

    let hold = protect("Hold");
    hold.add_attributes(Attributes::HOLD_ALL);

    let evaluate = protect("Evaluate");
    kernel.register_builtin_down(&evaluate, evaluate_builtin);

    let plus = protect("Plus");
    plus.add_attributes(
        Attributes::FLAT | Attributes::ORDERLESS | Attributes::NUMERIC_FUNCTION,
    );
    kernel.register_builtin_down(&plus, plus_builtin);

    let times = protect("Times");
    times.add_attributes(
        Attributes::FLAT | Attributes::ORDERLESS | Attributes::NUMERIC_FUNCTION,
    );
    kernel.register_builtin_down(&times, times_builtin);

    let less = protect("Less");
    kernel.register_builtin_down(&less, less_builtin);
    let greater = protect("Greater");
    kernel.register_builtin_down(&greater, greater_builtin);
}
