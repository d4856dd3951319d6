//! Syma - Symbolic Rewriting Kernel
//!
//! This library provides a symbolic term-rewriting kernel: a reference-counted
//! object model, per-symbol rule stores, an attribute-driven fixpoint
//! evaluator, and the cross-thread messaging/locking substrate the evaluator
//! cooperatively consults while it runs.
//!
//! # Architecture
//!
//! 1. **Object Model & Expressions** (`kernel::value`, `kernel::expr`)
//!    - Inline machine scalars plus refcounted heap payloads
//!    - Copy-on-write expression mutation when uniquely owned
//!    - Identity vs structural equality, canonical total order
//!
//! 2. **Symbols & Rules** (`kernel::symbol`, `kernel::rules`, `kernel::pattern`)
//!    - Per-kernel interned symbols with attribute bitsets
//!    - Six insertion-ordered rule caches per symbol (up/down/sub/approx/
//!      default/format) with a ground-pattern fast path
//!    - Structural pattern matching with `Blank`/`Pattern` heads
//!
//! 3. **Evaluator** (`kernel::eval`, `kernel::builtins`)
//!    - Fixpoint rewriting with hold semantics, flattening and canonical
//!      ordering driven by the head symbol's attributes
//!    - Definition-epoch memoization of reached fixpoints
//!    - A safe point per iteration: message servicing + cooperative abort
//!
//! 4. **Concurrency** (`kernel::thread`, `kernel::messages`, `kernel::threadlock`)
//!    - One message queue per evaluation thread; synchronous, asynchronous
//!      and delayed sends; sleep/wakeup with tick-based timeouts
//!    - Interrupt notifiers invoked on the sender's thread
//!    - Hierarchical locks with waiting-for cycle detection that aborts
//!      instead of deadlocking
//!
//! # Example
//!
//! ```rust
//! use syma::{Kernel, Value};
//!
//! let kernel = Kernel::new();
//! let f = kernel.symbol("f");
//! let x = kernel.symbol("x");
//! let times = kernel.symbol("Times");
//!
//! // f(x_) -> Times(x, 2)
//! kernel
//!     .assign_down(
//!         &f,
//!         kernel.call(&f, vec![kernel.pattern_var(&x)]),
//!         Some(kernel.call(&times, vec![Value::Symbol(x.clone()), Value::Int(2)])),
//!     )
//!     .unwrap();
//!
//! let result = kernel.evaluate(kernel.call(&f, vec![Value::Int(21)])).unwrap();
//! assert_eq!(result, Value::Int(42));
//! ```
//!
//! # Evaluation model
//!
//! - **Fixpoint rewriting**: rules apply in insertion order until nothing
//!   changes; reached fixpoints are stamped and skipped until a definition
//!   changes anywhere in the kernel
//! - **Attributes gate evaluation**: `HOLD_*` suppress argument evaluation,
//!   `FLAT` splices nested same-headed arguments, `ORDERLESS` sorts
//!   arguments canonically before matching
//! - **Cooperative cancellation**: aborts, timeouts and deadlock detection
//!   surface as `Err(Aborted)` at well-defined safe points, never as a
//!   forcibly killed thread

pub mod kernel;

pub use kernel::{
    Aborted, AssignError, AttachGuard, Attributes, BigNumber, Bindings, BuiltinFn, CustomObject,
    Diagnostic, EvalResult, Expr, Kernel, LockSlot, MessageQueue, NumberKind, PackedArray,
    PackedData, Rule, RuleCache, RuleSet, SecurityLevel, Symbol, ThreadContext, Value,
};
