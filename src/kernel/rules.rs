//! Per-symbol rule caches
//!
//! Each symbol carries six independently lockable caches, one per dispatch
//! context: up, down, sub, approx, default and format rules. A cache is an
//! insertion-ordered list of (pattern, replacement) pairs plus two lookup
//! accelerators:
//!
//! - a hash index over *ground* patterns (no pattern variables), which may
//!   short-circuit the ordered scan for exact subjects, and
//! - an LRU memo of recent scan results, invalidated on every cache mutation.
//!
//! Locking discipline is read-many/write-one per cache. Readers copy the
//! entry list out and release before matching; holding a cache lock across
//! `evaluate` is forbidden because evaluation re-enters the caches. Each
//! entry is swapped atomically (an `Arc` replace), so a reader never observes
//! a half-written rule — but a multi-rule assignment is deliberately *not*
//! transactional across entries: a concurrent reader may see the first k
//! rules new and the rest old. Callers depend on this relaxed behavior; do
//! not strengthen it.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};

use crate::kernel::pattern;
use crate::kernel::value::Value;

/// Recent-lookup memo size per cache.
const MEMO_CAPACITY: usize = 128;

/// A single rewrite rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub pattern: Value,
    pub rhs: Value,
}

/// One insertion-ordered rule cache.
pub struct RuleCache {
    entries: RwLock<Vec<Arc<Rule>>>,
    ground: RwLock<HashMap<Value, Arc<Rule>>>,
    memo: Mutex<LruCache<Value, Option<Arc<Rule>>>>,
}

impl RuleCache {
    pub(crate) fn new() -> RuleCache {
        RuleCache {
            entries: RwLock::new(Vec::new()),
            ground: RwLock::new(HashMap::new()),
            memo: Mutex::new(LruCache::new(NonZeroUsize::new(MEMO_CAPACITY).unwrap())),
        }
    }

    /// Install or update a rule. An existing entry with a structurally equal
    /// pattern is replaced in place (keeping its position); otherwise the
    /// rule is appended. `None` removes every rule with that pattern.
    pub fn change(&self, pattern: Value, rhs: Option<Value>) {
        {
            let mut entries = self.entries.write();
            match rhs {
                Some(rhs) => {
                    let rule = Arc::new(Rule {
                        pattern: pattern.clone(),
                        rhs,
                    });
                    match entries.iter_mut().find(|r| r.pattern == pattern) {
                        Some(slot) => *slot = rule.clone(),
                        None => entries.push(rule.clone()),
                    }
                    if pattern::is_ground(&pattern) {
                        self.ground.write().insert(pattern, rule);
                    }
                }
                None => {
                    entries.retain(|r| r.pattern != pattern);
                    self.ground.write().remove(&pattern);
                }
            }
        }
        self.memo.lock().clear();
    }

    /// Drop every rule.
    pub fn clear(&self) {
        self.entries.write().clear();
        self.ground.write().clear();
        self.memo.lock().clear();
    }

    /// Find the first matching rule for `subject` and return its instantiated
    /// replacement. Ground subjects may hit the exact-lookup index without a
    /// scan; everything else is tried in insertion order.
    pub fn find(&self, subject: &Value) -> Option<Value> {
        {
            let ground = self.ground.read();
            if !ground.is_empty() {
                if let Some(rule) = ground.get(subject) {
                    return Some(rule.rhs.clone());
                }
            }
        }

        if let Some(memoized) = self.memo.lock().get(subject).cloned() {
            return memoized.and_then(|rule| {
                pattern::matches(&rule.pattern, subject)
                    .map(|b| pattern::substitute(&rule.rhs, &b))
            });
        }

        // copy the entry list out and release before matching
        let entries: Vec<Arc<Rule>> = self.entries.read().clone();
        for rule in &entries {
            if let Some(bindings) = pattern::matches(&rule.pattern, subject) {
                self.memo.lock().put(subject.clone(), Some(rule.clone()));
                return Some(pattern::substitute(&rule.rhs, &bindings));
            }
        }
        self.memo.lock().put(subject.clone(), None);
        None
    }

    /// Number of installed rules.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Snapshot of the installed rules in insertion order.
    pub fn snapshot(&self) -> Vec<Arc<Rule>> {
        self.entries.read().clone()
    }
}

/// The six dispatch caches of one symbol.
pub struct RuleSet {
    /// Consulted for `f(...)` when an *argument*'s topmost symbol is this one.
    pub up: RuleCache,
    /// Consulted for `f(...)` when `f` is this symbol.
    pub down: RuleCache,
    /// Consulted for `f(...)(...)`-style expressions whose innermost head
    /// symbol is this one.
    pub sub: RuleCache,
    /// Consulted on numeric approximation requests.
    pub approx: RuleCache,
    /// Consulted when resolving missing optional-argument defaults.
    pub default: RuleCache,
    /// Consulted for output formatting only, never for value rewriting.
    pub format: RuleCache,
}

impl RuleSet {
    pub(crate) fn new() -> RuleSet {
        RuleSet {
            up: RuleCache::new(),
            down: RuleCache::new(),
            sub: RuleCache::new(),
            approx: RuleCache::new(),
            default: RuleCache::new(),
            format: RuleCache::new(),
        }
    }

    pub(crate) fn clear(&self) {
        self.up.clear();
        self.down.clear();
        self.sub.clear();
        self.approx.clear();
        self.default.clear();
        self.format.clear();
    }
}
