//! The rewriting kernel
//!
//! Module map, leaves first:
//! - [`value`] / [`expr`]: the reference-counted object model and the
//!   expression container
//! - [`symbol`] / [`rules`] / [`pattern`]: symbols with attribute bitsets,
//!   the six per-symbol rule caches, and the structural pattern matcher
//! - [`eval`] / [`builtins`]: the fixpoint evaluator and native dispatch
//! - [`thread`] / [`messages`] / [`threadlock`]: per-thread contexts, the
//!   cross-thread message queues and the hierarchical deadlock-detecting lock
//! - [`diagnostics`]: the user-visible message side channel
//! - [`context`]: the `Kernel` handle owning all of the above

pub mod builtins;
pub mod context;
pub mod diagnostics;
pub mod eval;
pub mod expr;
pub mod messages;
pub mod pattern;
pub mod rules;
pub mod symbol;
pub mod thread;
pub mod threadlock;
pub mod value;

pub use builtins::BuiltinFn;
pub use context::Kernel;
pub use diagnostics::Diagnostic;
pub use expr::{Expr, FLATTEN_MAX_DEPTH};
pub use messages::MessageQueue;
pub use pattern::{is_ground, matches, substitute, Bindings};
pub use rules::{Rule, RuleCache, RuleSet};
pub use symbol::{AssignError, Attributes, Symbol};
pub use thread::{Aborted, AttachGuard, EvalResult, SecurityLevel, ThreadContext};
pub use threadlock::LockSlot;
pub use value::{BigNumber, CustomObject, NumberKind, PackedArray, PackedData, Value};
