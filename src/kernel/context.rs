//! Kernel lifecycle and the cross-thread operation surface
//!
//! A `Kernel` is a cheap-clone handle to one isolated instance of the whole
//! machine: symbol registry, builtin registry, diagnostics accumulator,
//! thread registry, lock arena, definition epoch, abort state and the
//! delayed-delivery timer. Tests build as many independent kernels as they
//! like; nothing is process-global except thread ids.
//!
//! The messaging operations (`send`, `send_wait`, `send_delayed`, `sleep`,
//! `wakeup` via [`MessageQueue`]) and the abort machinery live here because
//! they need the kernel's registries; the queue data structures themselves
//! are in [`crate::kernel::messages`].

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::kernel::builtins::{self, BuiltinFn, BuiltinRegistry, BuiltinUsage};
use crate::kernel::diagnostics::{Diagnostic, DiagnosticSink};
use crate::kernel::expr::Expr;
use crate::kernel::messages::{Message, MessageQueue, Payload, ReplySlot, ReplyState, Timer};
use crate::kernel::pattern::{BLANK, PATTERN};
use crate::kernel::symbol::{AssignError, Attributes, Symbol};
use crate::kernel::thread::{self, SecurityLevel, ThreadContext};
use crate::kernel::threadlock::LockArena;
use crate::kernel::value::Value;

static KERNEL_IDS: AtomicU64 = AtomicU64::new(1);

const DEFAULT_MAX_RECURSION: usize = 256;

/// Frequently used interned symbols, resolved once at kernel construction.
pub(crate) struct WellKnown {
    pub(crate) hold: Arc<Symbol>,
    pub(crate) blank: Arc<Symbol>,
    pub(crate) pattern: Arc<Symbol>,
    pub(crate) general: Arc<Symbol>,
    pub(crate) aborted: Arc<Symbol>,
    pub(crate) default: Arc<Symbol>,
    pub(crate) approximate: Arc<Symbol>,
    pub(crate) true_: Arc<Symbol>,
    pub(crate) false_: Arc<Symbol>,
}

pub(crate) struct KernelInner {
    pub(crate) id: u64,
    symbols: DashMap<String, Arc<Symbol>>,
    temp_counter: AtomicU64,
    wk: OnceLock<WellKnown>,
    builtins: BuiltinRegistry,
    diagnostics: DiagnosticSink,
    pub(crate) threads: DashMap<u64, Arc<ThreadContext>>,
    next_thread_id: AtomicU64,
    pub(crate) locks: LockArena,
    pub(crate) deadlock_scan: Mutex<()>,
    epoch: AtomicU64,
    abort: std::sync::atomic::AtomicBool,
    abort_reasons: Arc<AtomicUsize>,
    max_recursion: AtomicUsize,
    timer: Timer,
}

/// Handle to one isolated rewriting-kernel instance.
#[derive(Clone)]
pub struct Kernel {
    inner: Arc<KernelInner>,
}

impl Default for Kernel {
    fn default() -> Kernel {
        Kernel::new()
    }
}

impl Kernel {
    pub fn new() -> Kernel {
        let inner = Arc::new(KernelInner {
            id: KERNEL_IDS.fetch_add(1, Ordering::AcqRel),
            symbols: DashMap::new(),
            temp_counter: AtomicU64::new(0),
            wk: OnceLock::new(),
            builtins: BuiltinRegistry::new(),
            diagnostics: DiagnosticSink::new(),
            threads: DashMap::new(),
            next_thread_id: AtomicU64::new(1),
            locks: LockArena::new(),
            deadlock_scan: Mutex::new(()),
            epoch: AtomicU64::new(0),
            abort: std::sync::atomic::AtomicBool::new(false),
            abort_reasons: Arc::new(AtomicUsize::new(0)),
            max_recursion: AtomicUsize::new(DEFAULT_MAX_RECURSION),
            timer: Timer::start(),
        });
        let kernel = Kernel { inner };
        let wk = WellKnown {
            hold: kernel.symbol("Hold"),
            blank: kernel.symbol(BLANK),
            pattern: kernel.symbol(PATTERN),
            general: kernel.symbol("General"),
            aborted: kernel.symbol("Aborted"),
            default: kernel.symbol("Default"),
            approximate: kernel.symbol("Approximate"),
            true_: kernel.symbol("True"),
            false_: kernel.symbol("False"),
        };
        let _ = kernel.inner.wk.set(wk);
        builtins::install_defaults(&kernel);
        kernel
    }

    pub(crate) fn inner(&self) -> &KernelInner {
        &self.inner
    }

    pub(crate) fn wk(&self) -> &WellKnown {
        self.inner.wk.get().expect("well-known symbols initialized")
    }

    pub(crate) fn builtins(&self) -> &BuiltinRegistry {
        &self.inner.builtins
    }

    // ========================================================================
    // Symbols
    // ========================================================================

    /// Look up a symbol by name, creating it if absent.
    pub fn symbol(&self, name: &str) -> Arc<Symbol> {
        if let Some(sym) = self.inner.symbols.get(name) {
            return sym.value().clone();
        }
        self.inner
            .symbols
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Symbol::new(name.to_string(), Attributes::NONE)))
            .value()
            .clone()
    }

    /// Look up a symbol by name without creating it.
    pub fn lookup_symbol(&self, name: &str) -> Option<Arc<Symbol>> {
        self.inner.symbols.get(name).map(|s| s.value().clone())
    }

    /// Create a process-unique temporary symbol. Temporary symbols are not
    /// interned: two calls with the same prefix give distinct symbols, and
    /// the symbol vanishes when the last handle drops.
    pub fn temporary_symbol(&self, prefix: &str) -> Arc<Symbol> {
        let n = self.inner.temp_counter.fetch_add(1, Ordering::AcqRel);
        Arc::new(Symbol::new(
            format!("{}${}", prefix, n),
            Attributes::TEMPORARY,
        ))
    }

    /// Remove a symbol: definitions cleared, marked temporary, uninterned.
    pub fn remove_symbol(&self, sym: &Arc<Symbol>) -> Result<(), AssignError> {
        self.check_writable(sym)?;
        sym.rules().clear();
        sym.write_value(None);
        sym.add_attributes(Attributes::TEMPORARY);
        self.inner
            .symbols
            .remove_if(sym.name(), |_, existing| Arc::ptr_eq(existing, sym));
        self.touch_definitions();
        Ok(())
    }

    pub(crate) fn general_symbol(&self) -> Arc<Symbol> {
        self.wk().general.clone()
    }

    /// The `True`/`False` symbol for a machine boolean.
    pub fn boolean(&self, b: bool) -> Value {
        if b {
            Value::Symbol(self.wk().true_.clone())
        } else {
            Value::Symbol(self.wk().false_.clone())
        }
    }

    // ========================================================================
    // Value construction helpers
    // ========================================================================

    /// `sym(items...)`
    pub fn call(&self, sym: &Arc<Symbol>, items: Vec<Value>) -> Value {
        Expr::from_items(Value::Symbol(sym.clone()), items)
    }

    /// `Blank()`: matches any value.
    pub fn blank(&self) -> Value {
        Expr::from_items(Value::Symbol(self.wk().blank.clone()), vec![])
    }

    /// `Pattern(var, Blank())`: matches anything and binds `var`.
    pub fn pattern_var(&self, var: &Arc<Symbol>) -> Value {
        Expr::from_items(
            Value::Symbol(self.wk().pattern.clone()),
            vec![Value::Symbol(var.clone()), self.blank()],
        )
    }

    // ========================================================================
    // Definitions
    // ========================================================================

    fn check_writable(&self, sym: &Arc<Symbol>) -> Result<(), AssignError> {
        if sym.is_protected() {
            self.message(sym, "protected", vec![Value::Symbol(sym.clone())]);
            return Err(AssignError::Protected);
        }
        Ok(())
    }

    /// Bind or clear the symbol's own value.
    pub fn assign_value(
        &self,
        sym: &Arc<Symbol>,
        value: Option<Value>,
    ) -> Result<(), AssignError> {
        self.check_writable(sym)?;
        sym.write_value(value);
        self.touch_definitions();
        Ok(())
    }

    /// Install (`Some`) or remove (`None`) a down rule.
    pub fn assign_down(
        &self,
        sym: &Arc<Symbol>,
        pattern: Value,
        rhs: Option<Value>,
    ) -> Result<(), AssignError> {
        self.check_writable(sym)?;
        sym.rules().down.change(pattern, rhs);
        self.touch_definitions();
        Ok(())
    }

    pub fn assign_up(
        &self,
        sym: &Arc<Symbol>,
        pattern: Value,
        rhs: Option<Value>,
    ) -> Result<(), AssignError> {
        self.check_writable(sym)?;
        sym.rules().up.change(pattern, rhs);
        self.touch_definitions();
        Ok(())
    }

    pub fn assign_sub(
        &self,
        sym: &Arc<Symbol>,
        pattern: Value,
        rhs: Option<Value>,
    ) -> Result<(), AssignError> {
        self.check_writable(sym)?;
        sym.rules().sub.change(pattern, rhs);
        self.touch_definitions();
        Ok(())
    }

    pub fn assign_default(
        &self,
        sym: &Arc<Symbol>,
        pattern: Value,
        rhs: Option<Value>,
    ) -> Result<(), AssignError> {
        self.check_writable(sym)?;
        sym.rules().default.change(pattern, rhs);
        self.touch_definitions();
        Ok(())
    }

    pub fn assign_format(
        &self,
        sym: &Arc<Symbol>,
        pattern: Value,
        rhs: Option<Value>,
    ) -> Result<(), AssignError> {
        self.check_writable(sym)?;
        sym.rules().format.change(pattern, rhs);
        self.touch_definitions();
        Ok(())
    }

    pub fn assign_approx(
        &self,
        sym: &Arc<Symbol>,
        pattern: Value,
        rhs: Option<Value>,
    ) -> Result<(), AssignError> {
        self.check_writable(sym)?;
        sym.rules().approx.change(pattern, rhs);
        self.touch_definitions();
        Ok(())
    }

    /// Install a whole list of down rules. Deliberately *not* transactional:
    /// each rule becomes visible as it is installed, and a concurrent reader
    /// may observe the first k rules new and the rest old.
    pub fn assign_down_all(
        &self,
        sym: &Arc<Symbol>,
        rules: Vec<(Value, Value)>,
    ) -> Result<(), AssignError> {
        self.check_writable(sym)?;
        for (pattern, rhs) in rules {
            sym.rules().down.change(pattern, Some(rhs));
            self.touch_definitions();
        }
        Ok(())
    }

    /// Clear every definition of the symbol (value and all six caches).
    pub fn clear_definitions(&self, sym: &Arc<Symbol>) -> Result<(), AssignError> {
        self.check_writable(sym)?;
        sym.rules().clear();
        sym.write_value(None);
        self.touch_definitions();
        Ok(())
    }

    /// Replace the symbol's attribute set. Attribute changes are not gated by
    /// `PROTECTED`; protection guards definitions.
    pub fn set_attributes(&self, sym: &Arc<Symbol>, attributes: Attributes) {
        sym.set_attributes(attributes);
        self.touch_definitions();
    }

    pub fn add_attributes(&self, sym: &Arc<Symbol>, attributes: Attributes) {
        sym.add_attributes(attributes);
        self.touch_definitions();
    }

    /// Attach native down-call code to a symbol, consulted when rule lookup
    /// for `sym(...)` finds no match.
    pub fn register_builtin_down(&self, sym: &Arc<Symbol>, f: BuiltinFn) {
        self.inner.builtins.register(BuiltinUsage::Down, sym, f);
        self.touch_definitions();
    }

    /// Attach native up-call code, consulted when `sym` appears as an
    /// argument of an expression no rule matched.
    pub fn register_builtin_up(&self, sym: &Arc<Symbol>, f: BuiltinFn) {
        self.inner.builtins.register(BuiltinUsage::Up, sym, f);
        self.touch_definitions();
    }

    /// Attach native sub-call code, consulted for `sym(...)(...)`-style
    /// compound heads.
    pub fn register_builtin_sub(&self, sym: &Arc<Symbol>, f: BuiltinFn) {
        self.inner.builtins.register(BuiltinUsage::Sub, sym, f);
        self.touch_definitions();
    }

    pub(crate) fn definition_epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::Acquire)
    }

    pub(crate) fn touch_definitions(&self) {
        self.inner.epoch.fetch_add(1, Ordering::AcqRel);
    }

    pub fn max_recursion(&self) -> usize {
        self.inner.max_recursion.load(Ordering::Acquire)
    }

    pub fn set_max_recursion(&self, limit: usize) {
        self.inner.max_recursion.store(limit, Ordering::Release);
    }

    // ========================================================================
    // Derived lookups: defaults, formatting, approximation
    // ========================================================================

    /// Default value for a missing optional argument of `sym`: first
    /// `Default(sym, index)`, then `Default(sym)`.
    pub fn default_value(&self, sym: &Arc<Symbol>, index: Option<usize>) -> Option<Value> {
        let default_head = Value::Symbol(self.wk().default.clone());
        if let Some(i) = index {
            let subject = Expr::from_items(
                default_head.clone(),
                vec![Value::Symbol(sym.clone()), Value::Int(i as i64)],
            );
            if let Some(v) = sym.rules().default.find(&subject) {
                return Some(v);
            }
        }
        let subject = Expr::from_items(default_head, vec![Value::Symbol(sym.clone())]);
        sym.rules().default.find(&subject)
    }

    /// Formatting lookup: the first matching format rule of the value's
    /// topmost symbol. Never rewrites values.
    pub fn format_value(&self, value: &Value) -> Option<Value> {
        let sym = value.topmost_symbol()?;
        sym.rules().format.find(value)
    }

    /// Numeric approximation: machine conversion for integers, approx rules
    /// first for expressions, then recursion through numeric functions.
    pub fn approximate(&self, value: &Value) -> crate::kernel::thread::EvalResult<Value> {
        match value {
            Value::Int(i) => Ok(Value::Real(*i as f64)),
            Value::Symbol(sym) => {
                let subject = Expr::from_items(
                    Value::Symbol(self.wk().approximate.clone()),
                    vec![value.clone()],
                );
                match sym.rules().approx.find(&subject) {
                    Some(hit) => self.evaluate(hit),
                    None => Ok(value.clone()),
                }
            }
            Value::Expr(e) => {
                if let Some(sym) = e.head().topmost_symbol() {
                    let subject = Expr::from_items(
                        Value::Symbol(self.wk().approximate.clone()),
                        vec![value.clone()],
                    );
                    if let Some(hit) = sym.rules().approx.find(&subject) {
                        return self.evaluate(hit);
                    }
                    if sym.attributes().contains(Attributes::NUMERIC_FUNCTION) {
                        let mut out = value.clone();
                        for i in 1..=e.len() {
                            let item = out.get_item(i);
                            out = out.set_item(i, self.approximate(&item)?);
                        }
                        return self.evaluate(out);
                    }
                }
                Ok(value.clone())
            }
            _ => Ok(value.clone()),
        }
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// Emit a diagnostic. Side channel only: control flow is unaffected.
    pub fn message(&self, sym: &Arc<Symbol>, tag: &'static str, args: Vec<Value>) {
        self.inner.diagnostics.emit(Diagnostic {
            symbol: sym.clone(),
            tag,
            args,
        });
    }

    /// Return and clear the accumulated diagnostics.
    pub fn drain_diagnostics(&self) -> Vec<Diagnostic> {
        self.inner.diagnostics.drain()
    }

    pub fn has_diagnostic(&self, tag: &str) -> bool {
        self.inner.diagnostics.contains_tag(tag)
    }

    // ========================================================================
    // Threads
    // ========================================================================

    /// The calling thread's context, if it is attached to this kernel.
    pub fn current_context(&self) -> Option<Arc<ThreadContext>> {
        thread::current_for(self.inner.id)
    }

    /// Attach the calling thread (idempotent) and return its context. Host
    /// threads attached this way stay attached until the thread exits.
    pub fn attach_current_ctx(&self) -> Arc<ThreadContext> {
        self.ensure_attached()
    }

    pub(crate) fn ensure_attached(&self) -> Arc<ThreadContext> {
        if let Some(ctx) = thread::current_for(self.inner.id) {
            return ctx;
        }
        let ctx = self.new_context(None, SecurityLevel::Trusted);
        thread::attach_persistent(ctx.clone(), Arc::downgrade(&self.inner));
        ctx
    }

    fn new_context(
        &self,
        parent: Option<Arc<ThreadContext>>,
        security: SecurityLevel,
    ) -> Arc<ThreadContext> {
        let id = self.inner.next_thread_id.fetch_add(1, Ordering::AcqRel);
        let queue = MessageQueue::new(self.inner.abort_reasons.clone());
        let ctx = ThreadContext::new(id, self.inner.id, queue, parent, security);
        self.inner.threads.insert(id, ctx.clone());
        ctx
    }

    /// Spawn an evaluation worker thread, parented to the spawning thread's
    /// context (if attached) and inheriting its security level. The worker
    /// detaches on exit: its queue dies and pending senders are abandoned.
    pub fn spawn<F, R>(&self, f: F) -> std::thread::JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let parent = self.current_context();
        let security = parent
            .as_ref()
            .map_or(SecurityLevel::Trusted, |p| p.security());
        let kernel = self.clone();
        let id = self.inner.next_thread_id.load(Ordering::Acquire);
        std::thread::Builder::new()
            .name(format!("eval-worker-{}", id))
            .spawn(move || {
                let ctx = kernel.new_context(parent, security);
                let _attachment = thread::attach_scoped(ctx, Arc::downgrade(&kernel.inner));
                f()
            })
            .expect("failed to spawn eval worker thread")
    }

    // ========================================================================
    // Abort
    // ========================================================================

    /// Raise the kernel-wide cooperative abort: every evaluation unwinds at
    /// its next safe point, every blocking wait returns. Sleeping threads are
    /// woken.
    pub fn abort_all(&self) {
        if !self.inner.abort.swap(true, Ordering::AcqRel) {
            self.inner.abort_reasons.fetch_add(1, Ordering::AcqRel);
        }
        for entry in self.inner.threads.iter() {
            entry.value().queue.wakeup();
        }
    }

    /// Clear the kernel-wide abort and the calling thread's own abort flag.
    pub fn clear_abort(&self) {
        if self.inner.abort.swap(false, Ordering::AcqRel) {
            self.inner.abort_reasons.fetch_sub(1, Ordering::AcqRel);
        }
        if let Some(ctx) = self.current_context() {
            ctx.clear_abort();
        }
    }

    /// True when the calling thread should unwind.
    pub fn aborting(&self) -> bool {
        if self.inner.abort.load(Ordering::Acquire) {
            return true;
        }
        self.current_context()
            .is_some_and(|ctx| ctx.abort.load(Ordering::Acquire))
    }

    pub(crate) fn is_aborting(&self, ctx: &ThreadContext) -> bool {
        self.inner.abort.load(Ordering::Acquire) || ctx.abort.load(Ordering::Acquire)
    }

    pub(crate) fn pending_reasons(&self) -> usize {
        self.inner.abort_reasons.load(Ordering::Acquire)
    }

    // ========================================================================
    // Messaging
    // ========================================================================

    /// The calling thread's message queue.
    pub fn this_queue(&self) -> MessageQueue {
        self.ensure_attached().queue()
    }

    /// Fire-and-forget send: the receiver evaluates `msg` when it next
    /// services its queue. No ordering guarantee across senders.
    pub fn send(&self, queue: &MessageQueue, msg: Value) {
        queue.push(Message::eval(msg));
    }

    /// Schedule `msg` for delivery after `delay`. Delayed sends are ordered
    /// by their target tick, not by send order.
    pub fn send_delayed(&self, queue: &MessageQueue, msg: Value, delay: Duration) {
        self.inner
            .timer
            .schedule(Instant::now() + delay, queue.clone(), msg);
    }

    /// Send `msg` and block until the receiver evaluated it, the message is
    /// discarded (receiver dead), the timeout elapses, or the caller itself
    /// aborts. On timeout/abort the receiver-side evaluation is asked to
    /// abort, and `None` is returned.
    ///
    /// While waiting, `idle` (when given) is polled: returning `true` means
    /// "I did useful work, poll again" and suppresses sleeping for that turn.
    pub fn send_wait(
        &self,
        queue: &MessageQueue,
        msg: Value,
        timeout: Duration,
        mut idle: Option<&mut dyn FnMut() -> bool>,
    ) -> Option<Value> {
        let ctx = self.ensure_attached();
        if self.is_aborting(&ctx) {
            return None;
        }

        let slot = ReplySlot::new();
        queue.push(Message {
            payload: Payload::Eval(msg),
            reply: Some(slot.clone()),
            sender: Some(ctx.queue()),
        });
        let deadline = Instant::now() + timeout;

        loop {
            if self.is_aborting(&ctx) {
                break;
            }
            match slot.read() {
                ReplyState::Done(v) => return Some(v),
                ReplyState::Abandoned => return None,
                ReplyState::Pending => {}
            }
            if Instant::now() >= deadline {
                tracing::debug!(target: "syma::messages", ?timeout, "send_wait timed out");
                break;
            }
            let busy = idle.as_mut().is_some_and(|f| f());
            if busy {
                std::thread::yield_now();
            } else {
                ctx.queue.sleep_until(Some(deadline));
            }
        }

        // timeout or abort: unwind the receiver-side evaluation of this
        // message
        queue.push(Message {
            payload: Payload::AbortRequest(slot),
            reply: None,
            sender: None,
        });
        None
    }

    /// Suspend until a message arrives or the queue is woken, then service
    /// one pending message. Spurious wakeups are allowed: callers loop and
    /// re-check their wait condition.
    pub fn sleep(&self) {
        let ctx = self.ensure_attached();
        ctx.queue.sleep_until(None);
        self.service_one_message(&ctx);
    }

    /// Like [`Kernel::sleep`], giving up after `timeout`.
    pub fn sleep_timeout(&self, timeout: Duration) {
        let ctx = self.ensure_attached();
        ctx.queue.sleep_until(Some(Instant::now() + timeout));
        self.service_one_message(&ctx);
    }

    /// Run `callback`; while it runs, any thread delivering a message to this
    /// thread's queue first invokes `notify` *on the sender's thread*, before
    /// the delivery. `notify` must not send messages itself — the delivering
    /// thread would deadlock against itself.
    pub fn run_with_interrupt_notifier<R>(
        &self,
        callback: impl FnOnce() -> R,
        notify: impl Fn() + Send + Sync + 'static,
    ) -> R {
        let ctx = self.ensure_attached();
        let token = ctx.queue.register_notifier(Arc::new(notify));
        let out = callback();
        ctx.queue.unregister_notifier(token);
        out
    }

    /// Service at most one pending message for this thread (walking up the
    /// parent chain when the own queue is empty). Re-entrant calls while a
    /// message is already being serviced are no-ops.
    pub(crate) fn service_one_message(&self, ctx: &Arc<ThreadContext>) {
        if ctx.servicing.swap(true, Ordering::AcqRel) {
            // nested safe point inside a message evaluation: only abort
            // requests get through, they never evaluate anything
            if let Some(msg) = ctx.queue.take_abort_request() {
                if let Payload::AbortRequest(slot) = msg.payload {
                    self.deliver_abort_request(ctx, slot);
                }
            }
            return;
        }
        let msg = {
            let mut cur = Some(ctx.clone());
            let mut found = None;
            while let Some(c) = cur {
                if let Some(m) = c.queue.pop() {
                    found = Some(m);
                    break;
                }
                cur = c.parent.clone();
            }
            found
        };
        if let Some(msg) = msg {
            self.handle_message(ctx, msg);
        }
        ctx.servicing.store(false, Ordering::Release);
    }

    fn handle_message(&self, ctx: &Arc<ThreadContext>, msg: Message) {
        match msg.payload {
            Payload::AbortRequest(slot) => self.deliver_abort_request(ctx, slot),
            Payload::Eval(subject) => {
                if let Some(slot) = msg.reply {
                    tracing::trace!(target: "syma::messages", "start abortable message");
                    ctx.abortables.lock().push(slot.clone());
                    let outcome = self.eval_in(ctx, subject);
                    ctx.abortables.lock().pop();

                    let value = match outcome {
                        Ok(v) if !self.is_aborting(ctx) => v,
                        _ => Value::Symbol(self.wk().aborted.clone()),
                    };

                    // an abort raised for exactly this message ends here
                    {
                        let mut cause = ctx.abort_cause.lock();
                        if cause.as_ref().is_some_and(|c| Arc::ptr_eq(c, &slot)) {
                            *cause = None;
                            ctx.abort.store(false, Ordering::Release);
                        }
                    }
                    slot.fulfill(value);
                    tracing::trace!(target: "syma::messages", "ended abortable message");

                    if let Some(pending) = slot.take_pending_abort() {
                        self.deliver_abort_request(ctx, pending);
                    }
                } else {
                    // plain sends evaluate for effect; kernel-wide aborts are
                    // re-observed by the caller's own safe points
                    let _ = self.eval_in(ctx, subject);
                }
                if let Some(sender) = msg.sender {
                    sender.wakeup();
                }
            }
        }
    }

    /// Route an abort request at the abortable-message stack: aborting the
    /// innermost message raises the thread's abort flag; a request against a
    /// message buried under newer ones is parked and re-delivered when the
    /// newer message finishes.
    fn deliver_abort_request(&self, ctx: &Arc<ThreadContext>, slot: Arc<ReplySlot>) {
        let stack = ctx.abortables.lock();
        match stack.iter().position(|s| Arc::ptr_eq(s, &slot)) {
            Some(pos) if pos + 1 == stack.len() => {
                drop(stack);
                tracing::debug!(target: "syma::messages", "aborting current abortable message");
                ctx.raise_abort(Some(slot));
            }
            Some(pos) => {
                let top = stack.last().expect("non-empty stack").clone();
                drop(stack);
                top.park_abort(pos, slot);
            }
            None => {
                // already finished: stale request
            }
        }
    }
}
