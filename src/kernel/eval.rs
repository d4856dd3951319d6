//! The rewrite evaluator
//!
//! `evaluate` drives a value to a fixpoint: evaluate the head, evaluate the
//! arguments subject to the head's hold attributes, normalize (flatten flat
//! heads, canonically sort orderless heads), apply the first matching rule
//! from the appropriate cache and start over, until nothing applies.
//!
//! Expressions that reach a fixpoint are stamped with the kernel's definition
//! epoch; as long as no definition changes anywhere, re-evaluating them is a
//! single atomic load. Any rule, value or attribute mutation bumps the epoch
//! and invalidates every stamp at once.
//!
//! Termination is not statically guaranteed — rules can loop. The backstop is
//! the safe point at the top of every fixpoint iteration: one pending
//! cross-thread message is serviced and the abort condition re-checked, so a
//! runaway evaluation can always be cancelled cooperatively.

use std::sync::Arc;

use crate::kernel::builtins::BuiltinUsage;
use crate::kernel::context::Kernel;
use crate::kernel::expr::{Expr, FLATTEN_MAX_DEPTH};
use crate::kernel::symbol::Attributes;
use crate::kernel::thread::{Aborted, EvalResult, ThreadContext};
use crate::kernel::value::Value;

/// Decrements the evaluation depth on every exit path.
struct DepthGuard<'a>(&'a ThreadContext);

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0
            .evaldepth
            .fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
    }
}

impl Kernel {
    /// Evaluate a value to a fixpoint.
    ///
    /// Returns `Err(Aborted)` when the evaluation is cancelled by an abort
    /// request, a timeout raised against it, or a detected deadlock.
    pub fn evaluate(&self, value: Value) -> EvalResult<Value> {
        let ctx = self.ensure_attached();
        self.eval_in(&ctx, value)
    }

    pub(crate) fn eval_in(&self, ctx: &Arc<ThreadContext>, mut value: Value) -> EvalResult<Value> {
        loop {
            self.checkpoint(ctx)?;
            match &value {
                Value::Expr(e) => {
                    if e.is_current(self.definition_epoch()) {
                        return Ok(value);
                    }
                    value = self.rewrite_once(ctx, value)?;
                }
                Value::Symbol(sym) => match sym.own_value() {
                    Some(bound) => {
                        if Value::same(&bound, &value) {
                            return Ok(value);
                        }
                        value = bound;
                    }
                    None => return Ok(value),
                },
                // scalars, strings, numbers, blobs: fixed points
                _ => return Ok(value),
            }
        }
    }

    /// Safe point: service at most one pending cross-thread message, then
    /// re-check the abort condition. Called at least once per fixpoint
    /// iteration and before every blocking wait.
    pub(crate) fn checkpoint(&self, ctx: &Arc<ThreadContext>) -> EvalResult<()> {
        if self.pending_reasons() > 0 {
            self.service_one_message(ctx);
        }
        if self.is_aborting(ctx) {
            return Err(Aborted);
        }
        Ok(())
    }

    /// One rewrite pass over a compound expression. Returns an unstamped
    /// value when a rule or builtin applied (the caller loops), or the
    /// expression stamped as a fixpoint.
    fn rewrite_once(&self, ctx: &Arc<ThreadContext>, value: Value) -> EvalResult<Value> {
        use std::sync::atomic::Ordering;

        let depth = ctx.evaldepth.fetch_add(1, Ordering::AcqRel);
        let _depth_guard = DepthGuard(ctx);

        let epoch = self.definition_epoch();

        if depth >= self.max_recursion() {
            let limit = self.max_recursion();
            tracing::debug!(target: "syma::eval", limit, "recursion limit reached");
            self.message(
                &self.general_symbol(),
                "reclim",
                vec![Value::Int(limit as i64)],
            );
            let held = Expr::from_items(Value::Symbol(self.wk().hold.clone()), vec![value]);
            if let Value::Expr(e) = &held {
                e.stamp(epoch);
            }
            return Ok(held);
        }

        let mut expr = value;

        // head first; a head that is already a symbol stays untouched
        let head = expr.get_item(0);
        let head = if head.is_symbol() {
            head
        } else {
            self.eval_in(ctx, head)?
        };
        let head_is_symbol = head.is_symbol();
        let head_sym = head.topmost_symbol();
        expr = expr.set_item(0, head.clone());

        let attr = match (&head_sym, head_is_symbol) {
            (Some(sym), true) => sym.attributes(),
            _ => Attributes::NONE,
        };
        let hold_complete = attr.contains(Attributes::HOLD_ALL_COMPLETE);
        let hold_first = attr.contains(Attributes::HOLD_FIRST);
        let hold_rest = attr.contains(Attributes::HOLD_REST);

        if !hold_complete {
            // arguments, subject to the hold attributes; a held argument
            // wrapped in Evaluate(...) is evaluated anyway
            let len = expr.expr_len();
            for i in 1..=len {
                let held = if i == 1 { hold_first } else { hold_rest };
                let item = expr.extract_item(i);
                let item = if !held || item.is_expr_named("Evaluate", 1) {
                    self.eval_in(ctx, item)?
                } else {
                    item
                };
                expr = expr.set_item(i, item);
            }

            if attr.contains(Attributes::FLAT) {
                expr = expr.flatten(&head, FLATTEN_MAX_DEPTH);
            }
            if attr.contains(Attributes::ORDERLESS) {
                expr = expr.sort_items();
            }
        }

        // rule dispatch; a replacement identical to the input means the
        // expression is already at its fixpoint
        'rules: {
            if !hold_complete {
                let len = expr.expr_len();
                for i in 1..=len {
                    if let Some(sym) = expr.get_item(i).topmost_symbol() {
                        if let Some(next) = sym.rules().up.find(&expr) {
                            if next == expr {
                                break 'rules;
                            }
                            tracing::trace!(target: "syma::eval", symbol = sym.name(), "up rule applied");
                            return Ok(next);
                        }
                    }
                }
            }

            if let Some(hs) = &head_sym {
                let cache = if head_is_symbol {
                    &hs.rules().down
                } else {
                    &hs.rules().sub
                };
                if let Some(next) = cache.find(&expr) {
                    if next == expr {
                        break 'rules;
                    }
                    tracing::trace!(target: "syma::eval", symbol = hs.name(), "rule applied");
                    return Ok(next);
                }
            }

            // native code, in the same up -> down/sub order
            if !hold_complete {
                let len = expr.expr_len();
                for i in 1..=len {
                    if let Some(sym) = expr.get_item(i).topmost_symbol() {
                        if let Some(next) = self.run_builtin(BuiltinUsage::Up, &sym, &expr)? {
                            if next == expr {
                                break 'rules;
                            }
                            return Ok(next);
                        }
                    }
                }
            }
            if let Some(hs) = &head_sym {
                let usage = if head_is_symbol {
                    BuiltinUsage::Down
                } else {
                    BuiltinUsage::Sub
                };
                if let Some(next) = self.run_builtin(usage, hs, &expr)? {
                    if next == expr {
                        break 'rules;
                    }
                    return Ok(next);
                }
            }
        }

        // fixed point
        if let Value::Expr(e) = &expr {
            e.stamp(epoch);
        }
        Ok(expr)
    }

    fn run_builtin(
        &self,
        usage: BuiltinUsage,
        sym: &Arc<crate::kernel::symbol::Symbol>,
        expr: &Value,
    ) -> EvalResult<Option<Value>> {
        match self.builtins().get(usage, sym) {
            Some(f) => f(self, expr.clone()),
            None => Ok(None),
        }
    }
}
