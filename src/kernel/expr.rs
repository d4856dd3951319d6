//! Expression container: a head plus an ordered sequence of items
//!
//! Index 0 always denotes the head; `len()` counts the items excluding it.
//! All mutating operations are copy-on-write: when the handle is the only
//! owner the underlying buffer is edited in place, otherwise the expression
//! is cloned first. [`Value::extract_item`] exposes the in-place variant used
//! by the evaluator's process-then-replace loops: on a uniquely owned
//! expression it takes the item out and leaves a [`Value::Null`] hole that the
//! caller must fill again with [`Value::set_item`].
//!
//! Each expression carries an evaluation memo stamp: once the evaluator has
//! driven it to a fixpoint it is stamped with the kernel's current definition
//! epoch, and re-evaluation short-circuits until a definition changes
//! anywhere. The stamp is invisible to equality, hashing and cloning.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::kernel::value::Value;

/// Flatten through any number of nesting levels.
pub const FLATTEN_MAX_DEPTH: usize = usize::MAX;

/// Heap payload of a compound expression.
pub struct Expr {
    head: Value,
    items: Vec<Value>,
    /// Evaluation memo: `epoch + 1` of the definition epoch this expression
    /// was last found to be a fixpoint under, 0 when never evaluated.
    memo: AtomicU64,
}

impl Expr {
    /// New expression with `length` items, all initialized to `Null`.
    pub fn new(head: Value, length: usize) -> Value {
        Value::Expr(Arc::new(Expr {
            head,
            items: vec![Value::Null; length],
            memo: AtomicU64::new(0),
        }))
    }

    /// New expression from a head and its items.
    pub fn from_items(head: Value, items: Vec<Value>) -> Value {
        Value::Expr(Arc::new(Expr {
            head,
            items,
            memo: AtomicU64::new(0),
        }))
    }

    pub fn head(&self) -> &Value {
        &self.head
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    /// Number of items, excluding the head.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn stamp(&self, epoch: u64) {
        self.memo.store(epoch + 1, Ordering::Release);
    }

    pub(crate) fn is_current(&self, epoch: u64) -> bool {
        self.memo.load(Ordering::Acquire) == epoch + 1
    }
}

impl Clone for Expr {
    fn clone(&self) -> Self {
        // a fresh copy has not been evaluated
        Expr {
            head: self.head.clone(),
            items: self.items.clone(),
            memo: AtomicU64::new(0),
        }
    }
}

impl PartialEq for Expr {
    fn eq(&self, other: &Expr) -> bool {
        self.head == other.head && self.items == other.items
    }
}

impl Eq for Expr {}

impl Hash for Expr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.head.hash(state);
        self.items.hash(state);
    }
}

impl std::fmt::Debug for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Expr({:?}, {:?})", self.head, self.items)
    }
}

/// Clears the memo stamp of a uniquely owned expression before mutation.
fn make_mut(arc: &mut Arc<Expr>) -> &mut Expr {
    let e = Arc::make_mut(arc);
    *e.memo.get_mut() = 0;
    e
}

impl Value {
    /// Item access: `0` is the head, `1..=len` the items. Out of range yields
    /// `Null`, as does item access on a non-expression.
    pub fn get_item(&self, i: usize) -> Value {
        match self {
            Value::Expr(e) => {
                if i == 0 {
                    e.head().clone()
                } else {
                    e.items().get(i - 1).cloned().unwrap_or(Value::Null)
                }
            }
            _ => Value::Null,
        }
    }

    /// Number of items when this is an expression, 0 otherwise.
    pub fn expr_len(&self) -> usize {
        match self {
            Value::Expr(e) => e.len(),
            _ => 0,
        }
    }

    /// Like [`Value::get_item`], but on a uniquely owned expression the item
    /// is moved out and a `Null` hole left behind, avoiding a clone. The
    /// caller must re-store something at the index afterwards; other readers
    /// never observe the hole precisely because the expression was uniquely
    /// owned.
    pub fn extract_item(&mut self, i: usize) -> Value {
        match self {
            Value::Expr(arc) => {
                if i == 0 || i > arc.len() {
                    return self.get_item(i);
                }
                match Arc::get_mut(arc) {
                    Some(e) => {
                        *e.memo.get_mut() = 0;
                        std::mem::replace(&mut e.items[i - 1], Value::Null)
                    }
                    None => arc.items()[i - 1].clone(),
                }
            }
            _ => Value::Null,
        }
    }

    /// Replace item `i` (0 replaces the head), consuming both the expression
    /// and the new item. Replacing past the end silently drops `v` and
    /// returns the expression unchanged.
    pub fn set_item(mut self, i: usize, v: Value) -> Value {
        if let Value::Expr(ref mut arc) = self {
            if i > arc.len() {
                return self;
            }
            let e = make_mut(arc);
            if i == 0 {
                e.head = v;
            } else {
                e.items[i - 1] = v;
            }
        }
        self
    }

    /// Copy-or-truncate to `new_len` items; grown slots are `Null`.
    pub fn resize(mut self, new_len: usize) -> Value {
        if let Value::Expr(ref mut arc) = self {
            if arc.len() != new_len {
                let e = make_mut(arc);
                e.items.resize(new_len, Value::Null);
            }
        }
        self
    }

    /// Append an item at the end.
    pub fn append(mut self, v: Value) -> Value {
        if let Value::Expr(ref mut arc) = self {
            let e = make_mut(arc);
            e.items.push(v);
        }
        self
    }

    /// New expression with the same head and the items in
    /// `start..start + count` (1-based, clamped to the available range).
    pub fn get_item_range(&self, start: usize, count: usize) -> Value {
        match self {
            Value::Expr(e) => {
                let start = start.max(1);
                let lo = (start - 1).min(e.len());
                let hi = (lo + count).min(e.len());
                Expr::from_items(e.head().clone(), e.items()[lo..hi].to_vec())
            }
            _ => Value::Null,
        }
    }

    /// Remove every item structurally equal to `unwanted`.
    pub fn remove_all(mut self, unwanted: &Value) -> Value {
        if let Value::Expr(ref mut arc) = self {
            if arc.items().iter().any(|it| it == unwanted) {
                let e = make_mut(arc);
                e.items.retain(|it| it != unwanted);
            }
        }
        self
    }

    /// Splice the items of nested sub-expressions sharing `head` into this
    /// expression, up to `depth` levels. This is the normalization step for
    /// flat (associative) heads.
    pub fn flatten(self, head: &Value, depth: usize) -> Value {
        let arc = match &self {
            Value::Expr(e) => e,
            _ => return self,
        };
        if depth == 0 {
            return self;
        }
        let needs_work = arc
            .items()
            .iter()
            .any(|it| matches!(it, Value::Expr(sub) if sub.head() == head));
        if !needs_work {
            return self;
        }

        fn splice(out: &mut Vec<Value>, item: Value, head: &Value, depth: usize) {
            match item {
                Value::Expr(sub) if depth > 0 && sub.head() == head => {
                    for inner in sub.items() {
                        splice(out, inner.clone(), head, depth - 1);
                    }
                }
                other => out.push(other),
            }
        }

        let mut items = Vec::with_capacity(arc.len());
        for item in arc.items() {
            splice(&mut items, item.clone(), head, depth);
        }
        Expr::from_items(arc.head().clone(), items)
    }

    /// Stable sort of the items by the canonical total order. This is the
    /// normalization step for orderless (commutative) heads.
    pub fn sort_items(mut self) -> Value {
        if let Value::Expr(ref mut arc) = self {
            let sorted = arc
                .items()
                .windows(2)
                .all(|w| Value::canonical_cmp(&w[0], &w[1]) != std::cmp::Ordering::Greater);
            if !sorted {
                let e = make_mut(arc);
                e.items.sort_by(Value::canonical_cmp);
            }
        }
        self
    }
}
