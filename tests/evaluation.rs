//! Rewriting-contract tests exercised through the public API.

use std::sync::Arc;

use syma::{AssignError, Attributes, Kernel, Value};

#[test]
fn test_clone_round_trip_preserves_value() {
    let kernel = Kernel::new();
    let f = kernel.symbol("f");
    let v = kernel.call(&f, vec![Value::Int(1), Value::from("s")]);
    let snapshot = v.clone();
    {
        let borrowed = v.clone();
        drop(borrowed);
    }
    assert!(Value::same(&snapshot, &v));
    assert_eq!(snapshot, v);
}

#[test]
fn test_extract_set_matches_clone_based_update() {
    let kernel = Kernel::new();
    let f = kernel.symbol("f");

    // shared expression: the clone-based reference result
    let shared = kernel.call(&f, vec![Value::Int(1), Value::Int(2)]);
    let reference = shared.clone().set_item(1, Value::Int(9));

    // uniquely owned expression: the in-place path
    let mut unique = kernel.call(&f, vec![Value::Int(1), Value::Int(2)]);
    let taken = unique.extract_item(1);
    assert_eq!(taken, Value::Int(1));
    let updated = unique.set_item(1, Value::Int(9));

    assert_eq!(updated, reference);
}

#[test]
fn test_evaluation_idempotent_at_fixpoint() {
    let kernel = Kernel::new();
    let g = kernel.symbol("g");
    let first = kernel
        .evaluate(kernel.call(&g, vec![Value::Int(1), Value::Int(2)]))
        .unwrap();
    let second = kernel.evaluate(first.clone()).unwrap();
    assert!(
        Value::same(&first, &second),
        "re-evaluating a fixpoint must return the same value"
    );
}

#[test]
fn test_rule_lookup_order_first_insertion_wins() {
    let kernel = Kernel::new();
    let f = kernel.symbol("f");
    let x = kernel.symbol("x");
    kernel
        .assign_down(
            &f,
            kernel.call(&f, vec![kernel.pattern_var(&x)]),
            Some(Value::from("R1")),
        )
        .unwrap();
    kernel
        .assign_down(
            &f,
            kernel.call(&f, vec![kernel.blank()]),
            Some(Value::from("R2")),
        )
        .unwrap();
    // both rules match; the earlier one is applied
    let out = kernel
        .evaluate(kernel.call(&f, vec![Value::Int(5)]))
        .unwrap();
    assert_eq!(out, Value::from("R1"));
}

#[test]
fn test_orderless_head_is_argument_order_independent() {
    let kernel = Kernel::new();
    let f = kernel.symbol("comm");
    kernel.set_attributes(&f, Attributes::ORDERLESS);
    let a = Value::Symbol(kernel.symbol("a"));
    let b = Value::Symbol(kernel.symbol("b"));

    let ab = kernel
        .evaluate(kernel.call(&f, vec![a.clone(), b.clone()]))
        .unwrap();
    let ba = kernel.evaluate(kernel.call(&f, vec![b, a])).unwrap();
    assert_eq!(ab, ba);
}

#[test]
fn test_orderless_makes_rule_matching_order_independent() {
    let kernel = Kernel::new();
    let f = kernel.symbol("comm2");
    kernel.set_attributes(&f, Attributes::ORDERLESS);
    let a = Value::Symbol(kernel.symbol("a"));
    let b = Value::Symbol(kernel.symbol("b"));
    // the rule is written in canonical order
    kernel
        .assign_down(
            &f,
            kernel.call(&f, vec![a.clone(), b.clone()]),
            Some(Value::Int(1)),
        )
        .unwrap();
    // ...and still matches the reversed call
    let out = kernel.evaluate(kernel.call(&f, vec![b, a])).unwrap();
    assert_eq!(out, Value::Int(1));
}

#[test]
fn test_flat_head_flattens_before_matching() {
    let kernel = Kernel::new();
    let f = kernel.symbol("assoc");
    kernel.set_attributes(&f, Attributes::FLAT);
    let a = Value::Symbol(kernel.symbol("a"));
    let b = Value::Symbol(kernel.symbol("b"));
    let c = Value::Symbol(kernel.symbol("c"));
    kernel
        .assign_down(
            &f,
            kernel.call(&f, vec![a.clone(), b.clone(), c.clone()]),
            Some(Value::Int(3)),
        )
        .unwrap();
    let nested = kernel.call(&f, vec![a, kernel.call(&f, vec![b, c])]);
    assert_eq!(kernel.evaluate(nested).unwrap(), Value::Int(3));
}

#[test]
fn test_hold_attributes_gate_argument_evaluation() {
    let kernel = Kernel::new();
    let y = kernel.symbol("y");
    kernel.assign_value(&y, Some(Value::Int(7))).unwrap();

    let hold = kernel.symbol("Hold");
    let held = kernel
        .evaluate(kernel.call(&hold, vec![Value::Symbol(y.clone())]))
        .unwrap();
    assert_eq!(held.get_item(1), Value::Symbol(y.clone()));

    let plain = kernel.symbol("plain");
    let open = kernel
        .evaluate(kernel.call(&plain, vec![Value::Symbol(y)]))
        .unwrap();
    assert_eq!(open.get_item(1), Value::Int(7));
}

#[test]
fn test_rewriting_chains_to_fixpoint() {
    let kernel = Kernel::new();
    let fib = kernel.symbol("fib");
    let n = kernel.symbol("n");
    let plus = kernel.symbol("Plus");

    // fib(0) -> 0, fib(1) -> 1, fib(n_) -> Plus(fib(Plus(n, -1)), fib(Plus(n, -2)))
    kernel
        .assign_down(&fib, kernel.call(&fib, vec![Value::Int(0)]), Some(Value::Int(0)))
        .unwrap();
    kernel
        .assign_down(&fib, kernel.call(&fib, vec![Value::Int(1)]), Some(Value::Int(1)))
        .unwrap();
    let n_minus = |k: i64| {
        kernel.call(
            &plus,
            vec![Value::Symbol(n.clone()), Value::Int(-k)],
        )
    };
    kernel
        .assign_down(
            &fib,
            kernel.call(&fib, vec![kernel.pattern_var(&n)]),
            Some(kernel.call(
                &plus,
                vec![
                    kernel.call(&fib, vec![n_minus(1)]),
                    kernel.call(&fib, vec![n_minus(2)]),
                ],
            )),
        )
        .unwrap();

    let out = kernel
        .evaluate(kernel.call(&fib, vec![Value::Int(12)]))
        .unwrap();
    assert_eq!(out, Value::Int(144));
}

#[test]
fn test_protected_rejection_is_a_failed_write_not_a_crash() {
    let kernel = Kernel::new();
    let plus = kernel.symbol("Plus");
    let x = kernel.symbol("x");
    let result = kernel.assign_down(
        &plus,
        kernel.call(&plus, vec![kernel.pattern_var(&x)]),
        Some(Value::Int(0)),
    );
    assert_eq!(result, Err(AssignError::Protected));
    assert!(kernel.has_diagnostic("protected"));
    // Plus still works
    let out = kernel
        .evaluate(kernel.call(&plus, vec![Value::Int(2), Value::Int(3)]))
        .unwrap();
    assert_eq!(out, Value::Int(5));
}

#[test]
fn test_diagnostics_accumulate_without_halting() {
    let kernel = Kernel::new();
    let plus = kernel.symbol("Plus");
    let x = kernel.symbol("x");
    // two rejected writes, then a successful evaluation
    let _ = kernel.assign_value(&plus, Some(Value::Int(1)));
    let _ = kernel.assign_down(&plus, kernel.pattern_var(&x), Some(Value::Int(0)));
    let out = kernel
        .evaluate(kernel.call(&plus, vec![Value::Int(1), Value::Int(1)]))
        .unwrap();
    assert_eq!(out, Value::Int(2));
    let protected: Vec<_> = kernel
        .drain_diagnostics()
        .into_iter()
        .filter(|d| d.tag == "protected")
        .collect();
    assert_eq!(protected.len(), 2);
}

#[test]
fn test_concurrent_reader_sees_old_or_new_rule_never_garbage() {
    let kernel = Kernel::new();
    let f = kernel.symbol("hotswap");
    let x = kernel.symbol("x");
    kernel
        .assign_down(
            &f,
            kernel.call(&f, vec![kernel.pattern_var(&x)]),
            Some(Value::Int(1)),
        )
        .unwrap();

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let kernel = kernel.clone();
            kernel.clone().spawn(move || {
                let f = kernel.symbol("hotswap");
                let mut seen = Vec::new();
                for _ in 0..300 {
                    let out = kernel
                        .evaluate(kernel.call(&f, vec![Value::Int(2)]))
                        .unwrap();
                    seen.push(out);
                }
                seen
            })
        })
        .collect();

    // replace the general rule and add a ground one mid-flight; each entry
    // swap is atomic, the pair is deliberately not
    kernel
        .assign_down_all(
            &f,
            vec![
                (kernel.call(&f, vec![Value::Int(2)]), Value::Int(10)),
                (kernel.call(&f, vec![kernel.pattern_var(&x)]), Value::Int(20)),
            ],
        )
        .unwrap();

    for reader in readers {
        for out in reader.join().unwrap() {
            assert!(
                out == Value::Int(1) || out == Value::Int(10) || out == Value::Int(20),
                "reader observed a state outside any rule prefix: {}",
                out
            );
        }
    }
}

#[test]
fn test_temporary_symbols_are_independent() {
    let kernel = Kernel::new();
    let t1 = kernel.temporary_symbol("scratch");
    let t2 = kernel.temporary_symbol("scratch");
    kernel.assign_value(&t1, Some(Value::Int(1))).unwrap();
    assert!(t2.own_value().is_none());
    assert_eq!(
        kernel.evaluate(Value::Symbol(t1)).unwrap(),
        Value::Int(1)
    );
    assert_eq!(
        kernel.evaluate(Value::Symbol(t2.clone())).unwrap(),
        Value::Symbol(t2)
    );
}

#[test]
fn test_opaque_number_passes_through_rewriting() {
    let kernel = Kernel::new();
    let big = Value::Number(Arc::new(syma::BigNumber::new(
        syma::NumberKind::BigInt,
        vec![0xde, 0xad, 0xbe, 0xef],
    )));
    let f = kernel.symbol("wrap");
    let x = kernel.symbol("x");
    kernel
        .assign_down(
            &f,
            kernel.call(&f, vec![kernel.pattern_var(&x)]),
            Some(kernel.call(&kernel.symbol("g"), vec![Value::Symbol(x.clone())])),
        )
        .unwrap();
    // the opaque payload is forwarded bit-identically through match + substitute
    let out = kernel.evaluate(kernel.call(&f, vec![big.clone()])).unwrap();
    assert!(Value::same(&out.get_item(1), &big));
}
