//! Per-thread evaluation state
//!
//! Every thread that evaluates expressions owns a `ThreadContext`: its id,
//! its message queue, a link to the parent context that spawned it, a
//! security level, the evaluation depth, the lock it is currently blocked on
//! (read by other threads walking the deadlock chain) and the stack of
//! abortable messages it is servicing.
//!
//! Contexts are registered in the kernel's thread registry for the lifetime
//! of the attachment. Worker threads spawned through
//! [`Kernel::spawn`](crate::kernel::context::Kernel::spawn) attach on entry
//! and detach on exit; host threads attach implicitly on first use and stay
//! attached until the thread exits.

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::kernel::context::KernelInner;
use crate::kernel::messages::{MessageQueue, ReplySlot};

/// Evaluation was cancelled: an abort request, a timeout or a detected
/// deadlock unwound the current computation. Propagated like an exception
/// with `?`; never swallowed by intermediate layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aborted;

impl fmt::Display for Aborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "evaluation aborted")
    }
}

impl std::error::Error for Aborted {}

/// Result of every operation that participates in cooperative cancellation.
pub type EvalResult<T> = Result<T, Aborted>;

/// Privilege level of an evaluation thread, inherited by spawned children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecurityLevel {
    Untrusted,
    Restricted,
    Trusted,
}

/// Per-thread descriptor.
pub struct ThreadContext {
    pub(crate) id: u64,
    pub(crate) kernel_id: u64,
    pub(crate) queue: MessageQueue,
    pub(crate) parent: Option<Arc<ThreadContext>>,
    security: SecurityLevel,
    pub(crate) evaldepth: AtomicUsize,
    /// Arena handle + 1 of the lock this thread is blocked on, 0 when not
    /// blocked. Written only by the owning thread, read by deadlock walkers.
    pub(crate) waiting_lock: AtomicUsize,
    /// Identifier front-ends use to associate symbol reads with a dynamic
    /// object; 0 when no dynamic scope is active.
    dynamic_id: AtomicU64,
    /// Cooperative per-thread abort flag.
    pub(crate) abort: AtomicBool,
    /// The abortable message whose abort request raised the flag, if any.
    pub(crate) abort_cause: Mutex<Option<Arc<ReplySlot>>>,
    /// Innermost-last stack of abortable messages being serviced.
    pub(crate) abortables: Mutex<Vec<Arc<ReplySlot>>>,
    /// Guards against re-entrant message servicing at nested safe points.
    pub(crate) servicing: AtomicBool,
}

impl ThreadContext {
    pub(crate) fn new(
        id: u64,
        kernel_id: u64,
        queue: MessageQueue,
        parent: Option<Arc<ThreadContext>>,
        security: SecurityLevel,
    ) -> Arc<ThreadContext> {
        Arc::new(ThreadContext {
            id,
            kernel_id,
            queue,
            parent,
            security,
            evaldepth: AtomicUsize::new(0),
            waiting_lock: AtomicUsize::new(0),
            dynamic_id: AtomicU64::new(0),
            abort: AtomicBool::new(false),
            abort_cause: Mutex::new(None),
            abortables: Mutex::new(Vec::new()),
            servicing: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn queue(&self) -> MessageQueue {
        self.queue.clone()
    }

    pub fn security(&self) -> SecurityLevel {
        self.security
    }

    pub fn parent(&self) -> Option<&Arc<ThreadContext>> {
        self.parent.as_ref()
    }

    pub fn dynamic_id(&self) -> u64 {
        self.dynamic_id.load(Ordering::Acquire)
    }

    pub fn set_dynamic_id(&self, id: u64) {
        self.dynamic_id.store(id, Ordering::Release);
    }

    /// True when `ancestor_id` names this thread or any thread on its parent
    /// chain. Used by the hierarchical lock's re-entry fast path.
    pub(crate) fn is_self_or_descendant_of(&self, ancestor_id: u64) -> bool {
        let mut cur = Some(self);
        while let Some(ctx) = cur {
            if ctx.id == ancestor_id {
                return true;
            }
            cur = ctx.parent.as_deref();
        }
        false
    }

    pub(crate) fn raise_abort(&self, cause: Option<Arc<ReplySlot>>) {
        *self.abort_cause.lock() = cause;
        self.abort.store(true, Ordering::Release);
    }

    pub(crate) fn clear_abort(&self) {
        self.abort.store(false, Ordering::Release);
        *self.abort_cause.lock() = None;
    }
}

impl fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadContext(id={})", self.id)
    }
}

/// One entry in a thread's attachment stack.
struct Attachment {
    ctx: Arc<ThreadContext>,
    kernel: Weak<KernelInner>,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.ctx.queue.mark_dead();
        if let Some(kernel) = self.kernel.upgrade() {
            kernel.threads.remove(&self.ctx.id);
        }
    }
}

thread_local! {
    static ATTACHED: RefCell<Vec<Attachment>> = const { RefCell::new(Vec::new()) };
}

/// Innermost attachment of this thread to the given kernel, if any.
pub(crate) fn current_for(kernel_id: u64) -> Option<Arc<ThreadContext>> {
    ATTACHED.with(|stack| {
        stack
            .borrow()
            .iter()
            .rev()
            .find(|a| a.ctx.kernel_id == kernel_id)
            .map(|a| a.ctx.clone())
    })
}

/// Push an attachment that lives until the thread exits (implicit attach).
pub(crate) fn attach_persistent(ctx: Arc<ThreadContext>, kernel: Weak<KernelInner>) {
    ATTACHED.with(|stack| stack.borrow_mut().push(Attachment { ctx, kernel }));
}

/// Push an attachment scoped to the returned guard (explicit attach).
pub(crate) fn attach_scoped(ctx: Arc<ThreadContext>, kernel: Weak<KernelInner>) -> AttachGuard {
    let id = ctx.id;
    ATTACHED.with(|stack| stack.borrow_mut().push(Attachment { ctx, kernel }));
    AttachGuard { ctx_id: id }
}

/// Detaches the thread context it guards when dropped: the context's queue is
/// marked dead (pending senders get their replies abandoned) and the context
/// leaves the kernel's thread registry.
pub struct AttachGuard {
    ctx_id: u64,
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        ATTACHED.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(pos) = stack.iter().rposition(|a| a.ctx.id == self.ctx_id) {
                stack.remove(pos);
            }
        });
    }
}
