//! Structural pattern matching for rule application
//!
//! Patterns are ordinary expressions using two well-known heads:
//!
//! - `Blank()` matches any value; `Blank(h)` matches an expression whose head
//!   is `h`.
//! - `Pattern(x, p)` matches whatever `p` matches and binds the symbol `x` to
//!   it. A variable bound twice must bind structurally equal values.
//!
//! Everything else matches itself structurally. A pattern containing no
//! `Blank`/`Pattern` anywhere is *ground* and eligible for the exact-lookup
//! fast path in the rule caches.

use smallvec::SmallVec;
use std::sync::Arc;

use crate::kernel::expr::Expr;
use crate::kernel::symbol::Symbol;
use crate::kernel::value::Value;

pub const BLANK: &str = "Blank";
pub const PATTERN: &str = "Pattern";

/// Variable bindings collected during a match. Rule patterns rarely carry
/// more than a handful of variables, so the first few live on the stack.
pub type Bindings = SmallVec<[(Arc<Symbol>, Value); 4]>;

fn head_name(v: &Value) -> Option<&str> {
    match v {
        Value::Expr(e) => match e.head() {
            Value::Symbol(s) => Some(s.name()),
            _ => None,
        },
        _ => None,
    }
}

/// Match `pattern` against `subject`, returning the bindings on success.
pub fn matches(pattern: &Value, subject: &Value) -> Option<Bindings> {
    let mut bindings = Bindings::new();
    if matches_into(pattern, subject, &mut bindings) {
        Some(bindings)
    } else {
        None
    }
}

fn matches_into(pattern: &Value, subject: &Value, bindings: &mut Bindings) -> bool {
    match head_name(pattern) {
        Some(BLANK) => {
            let p = pattern.as_expr().unwrap();
            match p.len() {
                0 => true,
                1 => match subject {
                    Value::Expr(s) => s.head() == &p.items()[0],
                    _ => false,
                },
                _ => false,
            }
        }
        Some(PATTERN) => {
            let p = pattern.as_expr().unwrap();
            if p.len() != 2 {
                return false;
            }
            let var = match &p.items()[0] {
                Value::Symbol(s) => s.clone(),
                _ => return false,
            };
            if let Some((_, bound)) = bindings.iter().find(|(s, _)| Arc::ptr_eq(s, &var)) {
                return bound == subject;
            }
            if !matches_into(&p.items()[1], subject, bindings) {
                return false;
            }
            bindings.push((var, subject.clone()));
            true
        }
        _ => match (pattern, subject) {
            (Value::Expr(p), Value::Expr(s)) => {
                if p.len() != s.len() {
                    return false;
                }
                if !matches_into(p.head(), s.head(), bindings) {
                    return false;
                }
                itertools::zip_eq(p.items(), s.items())
                    .all(|(pi, si)| matches_into(pi, si, bindings))
            }
            _ => pattern == subject,
        },
    }
}

/// True when the pattern contains no `Blank`/`Pattern` anywhere, i.e. it can
/// only match one exact subject.
pub fn is_ground(pattern: &Value) -> bool {
    match head_name(pattern) {
        Some(BLANK) | Some(PATTERN) => false,
        _ => match pattern {
            Value::Expr(e) => is_ground(e.head()) && e.items().iter().all(is_ground),
            _ => true,
        },
    }
}

/// Instantiate a replacement: every symbol bound in `bindings` is substituted
/// by its binding, everything else is rebuilt structurally.
pub fn substitute(template: &Value, bindings: &Bindings) -> Value {
    if bindings.is_empty() {
        return template.clone();
    }
    match template {
        Value::Symbol(s) => bindings
            .iter()
            .find(|(var, _)| Arc::ptr_eq(var, s))
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| template.clone()),
        Value::Expr(e) => {
            let head = substitute(e.head(), bindings);
            let items = e.items().iter().map(|it| substitute(it, bindings)).collect();
            Expr::from_items(head, items)
        }
        _ => template.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::context::Kernel;

    fn call(kernel: &Kernel, name: &str, items: Vec<Value>) -> Value {
        Expr::from_items(Value::Symbol(kernel.symbol(name)), items)
    }

    #[test]
    fn test_blank_matches_anything() {
        let kernel = Kernel::new();
        let blank = kernel.blank();
        assert!(matches(&blank, &Value::Int(1)).is_some());
        assert!(matches(&blank, &call(&kernel, "f", vec![])).is_some());
    }

    #[test]
    fn test_blank_with_head_restriction() {
        let kernel = Kernel::new();
        let f = kernel.symbol("f");
        let blank_f = call(&kernel, BLANK, vec![Value::Symbol(f.clone())]);
        assert!(matches(&blank_f, &call(&kernel, "f", vec![Value::Int(1)])).is_some());
        assert!(matches(&blank_f, &call(&kernel, "g", vec![Value::Int(1)])).is_none());
        assert!(matches(&blank_f, &Value::Int(1)).is_none());
    }

    #[test]
    fn test_named_pattern_binds() {
        let kernel = Kernel::new();
        let x = kernel.symbol("x");
        let pat = kernel.pattern_var(&x);
        let b = matches(&pat, &Value::Int(42)).unwrap();
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].1, Value::Int(42));
    }

    #[test]
    fn test_repeated_variable_must_agree() {
        let kernel = Kernel::new();
        let x = kernel.symbol("x");
        let px = kernel.pattern_var(&x);
        let pat = call(&kernel, "f", vec![px.clone(), px]);
        let same = call(&kernel, "f", vec![Value::Int(1), Value::Int(1)]);
        let differ = call(&kernel, "f", vec![Value::Int(1), Value::Int(2)]);
        assert!(matches(&pat, &same).is_some());
        assert!(matches(&pat, &differ).is_none());
    }

    #[test]
    fn test_structural_match_requires_equal_arity() {
        let kernel = Kernel::new();
        let pat = call(&kernel, "f", vec![kernel.blank()]);
        let subject = call(&kernel, "f", vec![Value::Int(1), Value::Int(2)]);
        assert!(matches(&pat, &subject).is_none());
    }

    #[test]
    fn test_groundness() {
        let kernel = Kernel::new();
        let x = kernel.symbol("x");
        assert!(is_ground(&call(&kernel, "f", vec![Value::Int(1)])));
        assert!(!is_ground(&call(&kernel, "f", vec![kernel.blank()])));
        assert!(!is_ground(&call(
            &kernel,
            "f",
            vec![call(&kernel, "g", vec![kernel.pattern_var(&x)])]
        )));
    }

    #[test]
    fn test_substitute_rebuilds_nested() {
        let kernel = Kernel::new();
        let x = kernel.symbol("x");
        let template = call(
            &kernel,
            "g",
            vec![Value::Symbol(x.clone()), call(&kernel, "h", vec![Value::Symbol(x.clone())])],
        );
        let mut b = Bindings::new();
        b.push((x, Value::Int(5)));
        let out = substitute(&template, &b);
        assert_eq!(out.get_item(1), Value::Int(5));
        assert_eq!(out.get_item(2).get_item(1), Value::Int(5));
    }
}
