//! Cross-thread message queues
//!
//! Every evaluation thread owns exactly one `MessageQueue`. The queue is a
//! refcounted handle, so senders can keep it after the owning thread exits;
//! a queue whose thread died discards further messages and abandons the reply
//! slots of waiting senders.
//!
//! # Design
//!
//! ```text
//!  sender A ──┐                       ┌─ notifiers (run on the *sender*)
//!  sender B ──┼─ push ──> mailbox ────┤
//!  timer   ──┘            (Mutex +    └─ condvar signal ──> sleeping owner
//!                          VecDeque)
//! ```
//!
//! Delivery order across independent senders is not guaranteed. Messages are
//! *expressions*: the receiving thread evaluates them itself when it services
//! its queue at an evaluator safe point — from the evaluator's perspective an
//! asynchronous signal, in reality synchronous cooperative polling.
//!
//! A message sent with a reply slot ("abortable message") supports the
//! wait/timeout/abort protocol of `send_wait`: the sender parks on its own
//! queue until the slot resolves, and on timeout or abort it delivers an
//! abort request that unwinds the receiver-side evaluation of exactly that
//! message, even when the receiver is nested inside newer abortable messages.

use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};

use crate::kernel::value::Value;

/// State of a reply slot for an abortable message.
#[derive(Debug, Clone)]
pub(crate) enum ReplyState {
    /// Receiver has not finished evaluating the message.
    Pending,
    /// Receiver stored its result.
    Done(Value),
    /// The message was discarded (receiver dead) before completion.
    Abandoned,
}

/// Shared slot a waiting sender polls for the receiver's answer.
pub(crate) struct ReplySlot {
    state: Mutex<ReplyState>,
    /// Abort request parked while a newer abortable message is in flight:
    /// (position in the receiver's abortable stack, slot to abort next).
    pending_abort: Mutex<Option<(usize, Arc<ReplySlot>)>>,
}

impl ReplySlot {
    pub(crate) fn new() -> Arc<ReplySlot> {
        Arc::new(ReplySlot {
            state: Mutex::new(ReplyState::Pending),
            pending_abort: Mutex::new(None),
        })
    }

    pub(crate) fn read(&self) -> ReplyState {
        self.state.lock().clone()
    }

    pub(crate) fn fulfill(&self, value: Value) {
        let mut state = self.state.lock();
        if matches!(*state, ReplyState::Pending) {
            *state = ReplyState::Done(value);
        }
    }

    pub(crate) fn abandon(&self) {
        let mut state = self.state.lock();
        if matches!(*state, ReplyState::Pending) {
            *state = ReplyState::Abandoned;
        }
    }

    /// Park an abort request behind the innermost in-flight message. When two
    /// requests collide the outermost target wins: aborting it unwinds the
    /// inner one as well.
    pub(crate) fn park_abort(&self, position: usize, slot: Arc<ReplySlot>) {
        let mut pending = self.pending_abort.lock();
        match &*pending {
            Some((existing, _)) if *existing <= position => {}
            _ => *pending = Some((position, slot)),
        }
    }

    pub(crate) fn take_pending_abort(&self) -> Option<Arc<ReplySlot>> {
        self.pending_abort.lock().take().map(|(_, slot)| slot)
    }
}

impl std::fmt::Debug for ReplySlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ReplySlot({:?})", *self.state.lock())
    }
}

/// What a queued message asks the receiver to do.
pub(crate) enum Payload {
    /// Evaluate the expression.
    Eval(Value),
    /// Unwind the evaluation of the abortable message owning this slot.
    AbortRequest(Arc<ReplySlot>),
}

pub(crate) struct Message {
    pub(crate) payload: Payload,
    pub(crate) reply: Option<Arc<ReplySlot>>,
    pub(crate) sender: Option<MessageQueue>,
}

impl Message {
    pub(crate) fn eval(subject: Value) -> Message {
        Message {
            payload: Payload::Eval(subject),
            reply: None,
            sender: None,
        }
    }
}

struct Notifier {
    token: u64,
    func: Arc<dyn Fn() + Send + Sync>,
}

struct Mailbox {
    queue: VecDeque<Message>,
    dead: bool,
}

struct QueueInner {
    mailbox: Mutex<Mailbox>,
    wake: Condvar,
    notifiers: Mutex<Vec<Notifier>>,
    notifier_tokens: AtomicU64,
    /// Queue of a synchronous child thread; while set, deliveries are
    /// redirected to it (the child services messages on the parent's behalf).
    child: Mutex<Option<MessageQueue>>,
    /// Kernel-wide pending-reason counter making the safe-point check cheap.
    abort_reasons: Arc<AtomicUsize>,
}

/// Refcounted handle to a thread's mailbox.
#[derive(Clone)]
pub struct MessageQueue {
    inner: Arc<QueueInner>,
}

impl PartialEq for MessageQueue {
    fn eq(&self, other: &MessageQueue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for MessageQueue {}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageQueue({:p})", Arc::as_ptr(&self.inner))
    }
}

impl MessageQueue {
    pub(crate) fn new(abort_reasons: Arc<AtomicUsize>) -> MessageQueue {
        MessageQueue {
            inner: Arc::new(QueueInner {
                mailbox: Mutex::new(Mailbox {
                    queue: VecDeque::new(),
                    dead: false,
                }),
                wake: Condvar::new(),
                notifiers: Mutex::new(Vec::new()),
                notifier_tokens: AtomicU64::new(0),
                child: Mutex::new(None),
                abort_reasons,
            }),
        }
    }

    /// Follow the child chain to the queue that currently services
    /// deliveries.
    fn resolve_target(&self) -> MessageQueue {
        let mut cur = self.clone();
        loop {
            let child = cur.inner.child.lock().clone();
            match child {
                Some(c) => cur = c,
                None => return cur,
            }
        }
    }

    /// Enqueue and wake the receiver. A dead queue discards the message,
    /// abandoning its reply slot and waking the sender.
    pub(crate) fn push(&self, msg: Message) {
        let target = self.resolve_target();
        let rejected = {
            let mut mb = target.inner.mailbox.lock();
            if mb.dead {
                Some(msg)
            } else {
                mb.queue.push_back(msg);
                target.inner.abort_reasons.fetch_add(1, Ordering::AcqRel);
                None
            }
        };
        match rejected {
            None => target.wakeup(),
            Some(msg) => discard(msg),
        }
    }

    pub(crate) fn pop(&self) -> Option<Message> {
        let msg = self.inner.mailbox.lock().queue.pop_front();
        if msg.is_some() {
            self.inner.abort_reasons.fetch_sub(1, Ordering::AcqRel);
        }
        msg
    }

    /// Take a pending abort request out of turn. Abort requests carry no
    /// ordering obligations and must reach the receiver even while it is
    /// inside the evaluation of an earlier message.
    pub(crate) fn take_abort_request(&self) -> Option<Message> {
        let msg = {
            let mut mb = self.inner.mailbox.lock();
            let pos = mb
                .queue
                .iter()
                .position(|m| matches!(m.payload, Payload::AbortRequest(_)));
            pos.and_then(|p| mb.queue.remove(p))
        };
        if msg.is_some() {
            self.inner.abort_reasons.fetch_sub(1, Ordering::AcqRel);
        }
        msg
    }

    /// Idempotent: runs the interrupt notifiers *on the calling thread*,
    /// signals the owner's condvar, then propagates down the child chain.
    pub fn wakeup(&self) {
        let notifiers: Vec<Arc<dyn Fn() + Send + Sync>> = self
            .inner
            .notifiers
            .lock()
            .iter()
            .map(|n| n.func.clone())
            .collect();
        for notify in notifiers {
            notify();
        }
        {
            let _mb = self.inner.mailbox.lock();
            self.inner.wake.notify_all();
        }
        let child = self.inner.child.lock().clone();
        if let Some(c) = child {
            c.wakeup();
        }
    }

    /// Block until a message arrives, the queue is woken, or the deadline
    /// passes. Spurious wakeups are allowed; callers must re-check their wait
    /// condition.
    pub(crate) fn sleep_until(&self, deadline: Option<Instant>) {
        let mut mb = self.inner.mailbox.lock();
        if !mb.queue.is_empty() {
            return;
        }
        match deadline {
            Some(d) => {
                self.inner.wake.wait_until(&mut mb, d);
            }
            None => self.inner.wake.wait(&mut mb),
        }
    }

    /// Mark the owning thread dead and discard everything pending.
    pub(crate) fn mark_dead(&self) {
        let drained: Vec<Message> = {
            let mut mb = self.inner.mailbox.lock();
            mb.dead = true;
            let n = mb.queue.len();
            if n > 0 {
                self.inner.abort_reasons.fetch_sub(n, Ordering::AcqRel);
            }
            mb.queue.drain(..).collect()
        };
        for msg in drained {
            if let Payload::Eval(subject) = &msg.payload {
                tracing::debug!(target: "syma::messages", "unhandled message {}", subject);
            }
            discard(msg);
        }
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.inner.mailbox.lock().dead
    }

    /// Redirect deliveries to a synchronous child thread's queue (or clear
    /// the redirection).
    pub fn set_child(&self, child: Option<&MessageQueue>) {
        *self.inner.child.lock() = child.cloned();
    }

    /// True when `self` transitively redirects its deliveries to `waitee`,
    /// i.e. `waitee` runs on `self`'s behalf. Front-ends use this to route
    /// interrupts at the thread actually doing the work.
    pub fn is_blocked_by(&self, waitee: &MessageQueue) -> bool {
        let mut cur = self.clone();
        loop {
            if cur == *waitee {
                return true;
            }
            let child = cur.inner.child.lock().clone();
            match child {
                Some(c) => cur = c,
                None => return false,
            }
        }
    }

    pub(crate) fn register_notifier(&self, func: Arc<dyn Fn() + Send + Sync>) -> u64 {
        let token = self.inner.notifier_tokens.fetch_add(1, Ordering::AcqRel);
        self.inner.notifiers.lock().push(Notifier { token, func });
        token
    }

    pub(crate) fn unregister_notifier(&self, token: u64) {
        self.inner.notifiers.lock().retain(|n| n.token != token);
    }
}

fn discard(msg: Message) {
    if let Some(slot) = &msg.reply {
        slot.abandon();
    }
    if let Payload::AbortRequest(slot) = &msg.payload {
        // an abort request that never arrives must not leave its sender
        // waiting on the parked state
        slot.abandon();
    }
    if let Some(sender) = &msg.sender {
        sender.wakeup();
    }
}

// ============================================================================
// Delayed delivery
// ============================================================================

pub(crate) struct Timed {
    pub(crate) due: Instant,
    pub(crate) seq: u64,
    pub(crate) queue: MessageQueue,
    pub(crate) subject: Value,
}

impl PartialEq for Timed {
    fn eq(&self, other: &Timed) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Timed {}

impl PartialOrd for Timed {
    fn partial_cmp(&self, other: &Timed) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timed {
    fn cmp(&self, other: &Timed) -> std::cmp::Ordering {
        // delivery tick first; sequence number only breaks ties
        self.due
            .cmp(&other.due)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

enum TimerCmd {
    Schedule(Timed),
    Shutdown,
}

/// Kernel-owned thread delivering `send_delayed` messages at their target
/// tick. Pending deliveries ordered by tick, not send order.
pub(crate) struct Timer {
    tx: Sender<TimerCmd>,
    seq: AtomicU64,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Timer {
    pub(crate) fn start() -> Timer {
        let (tx, rx) = unbounded();
        let handle = std::thread::Builder::new()
            .name("syma-timer".to_string())
            .spawn(move || timer_loop(rx))
            .expect("failed to spawn timer thread");
        Timer {
            tx,
            seq: AtomicU64::new(0),
            handle: Mutex::new(Some(handle)),
        }
    }

    pub(crate) fn schedule(&self, due: Instant, queue: MessageQueue, subject: Value) {
        let timed = Timed {
            due,
            seq: self.seq.fetch_add(1, Ordering::AcqRel),
            queue,
            subject,
        };
        // a shut-down timer drops the message, matching dead-queue semantics
        let _ = self.tx.send(TimerCmd::Schedule(timed));
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let _ = self.tx.send(TimerCmd::Shutdown);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn timer_loop(rx: Receiver<TimerCmd>) {
    use std::cmp::Reverse;

    let mut heap: BinaryHeap<Reverse<Timed>> = BinaryHeap::new();
    loop {
        let now = Instant::now();
        while heap.peek().is_some_and(|Reverse(t)| t.due <= now) {
            let Reverse(t) = heap.pop().unwrap();
            t.queue.push(Message::eval(t.subject));
        }

        let cmd = match heap.peek() {
            Some(Reverse(next)) => match rx.recv_deadline(next.due) {
                Ok(cmd) => Some(cmd),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match rx.recv() {
                Ok(cmd) => Some(cmd),
                Err(_) => break,
            },
        };

        match cmd {
            Some(TimerCmd::Schedule(t)) => heap.push(Reverse(t)),
            Some(TimerCmd::Shutdown) | None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn queue() -> MessageQueue {
        MessageQueue::new(Arc::new(AtomicUsize::new(0)))
    }

    #[test]
    fn test_push_pop_fifo_within_one_sender() {
        let q = queue();
        q.push(Message::eval(Value::Int(1)));
        q.push(Message::eval(Value::Int(2)));
        let first = q.pop().unwrap();
        assert!(matches!(first.payload, Payload::Eval(Value::Int(1))));
        let second = q.pop().unwrap();
        assert!(matches!(second.payload, Payload::Eval(Value::Int(2))));
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_dead_queue_abandons_reply() {
        let q = queue();
        q.mark_dead();
        let slot = ReplySlot::new();
        q.push(Message {
            payload: Payload::Eval(Value::Int(1)),
            reply: Some(slot.clone()),
            sender: None,
        });
        assert!(matches!(slot.read(), ReplyState::Abandoned));
    }

    #[test]
    fn test_mark_dead_drains_pending() {
        let q = queue();
        let slot = ReplySlot::new();
        q.push(Message {
            payload: Payload::Eval(Value::Int(1)),
            reply: Some(slot.clone()),
            sender: None,
        });
        q.mark_dead();
        assert!(q.is_dead());
        assert!(matches!(slot.read(), ReplyState::Abandoned));
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_child_redirection_and_blocked_by() {
        let parent = queue();
        let child = queue();
        parent.set_child(Some(&child));
        parent.push(Message::eval(Value::Int(7)));
        // delivered to the child, not the parent
        assert!(parent.inner.mailbox.lock().queue.is_empty());
        assert!(child.pop().is_some());
        assert!(parent.is_blocked_by(&child));
        assert!(!child.is_blocked_by(&parent));
        parent.set_child(None);
        assert!(!parent.is_blocked_by(&child));
    }

    #[test]
    fn test_wakeup_runs_notifier_on_calling_thread() {
        let q = queue();
        let hit = Arc::new(AtomicUsize::new(0));
        let hit2 = hit.clone();
        let token = q.register_notifier(Arc::new(move || {
            hit2.fetch_add(1, Ordering::SeqCst);
        }));
        q.wakeup();
        assert_eq!(hit.load(Ordering::SeqCst), 1);
        q.unregister_notifier(token);
        q.wakeup();
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sleep_returns_when_message_arrives() {
        let q = queue();
        let q2 = q.clone();
        let sender = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            q2.push(Message::eval(Value::Int(1)));
        });
        let start = Instant::now();
        // loop around spurious wakeups until the message is visible
        while q.inner.mailbox.lock().queue.is_empty() {
            q.sleep_until(Some(Instant::now() + Duration::from_millis(200)));
            if start.elapsed() > Duration::from_secs(5) {
                panic!("sleep never observed the message");
            }
        }
        sender.join().unwrap();
        assert!(q.pop().is_some());
    }

    #[test]
    fn test_timer_orders_by_tick_not_send_order() {
        let timer = Timer::start();
        let q = queue();
        let now = Instant::now();
        timer.schedule(now + Duration::from_millis(80), q.clone(), Value::Int(2));
        timer.schedule(now + Duration::from_millis(20), q.clone(), Value::Int(1));
        std::thread::sleep(Duration::from_millis(200));
        let first = q.pop().expect("first delayed message");
        let second = q.pop().expect("second delayed message");
        assert!(matches!(first.payload, Payload::Eval(Value::Int(1))));
        assert!(matches!(second.payload, Payload::Eval(Value::Int(2))));
    }
}
