//! User-visible diagnostics ("messages")
//!
//! A diagnostic is a side-channel report tagged `Symbol::tag` with argument
//! values, accumulated per kernel for the embedding front-end to collect. It
//! never interrupts control flow by itself; aborts are a separate condition.
//! Every emission is also logged through `tracing`.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use crate::kernel::symbol::Symbol;
use crate::kernel::value::Value;

/// One emitted diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// The symbol the diagnostic is attached to.
    pub symbol: Arc<Symbol>,
    /// Short tag, e.g. `"deadlock"` or `"reclim"`.
    pub tag: &'static str,
    /// Argument values giving the specifics.
    pub args: Vec<Value>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.symbol.name(), self.tag)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Per-kernel diagnostic accumulator.
pub(crate) struct DiagnosticSink {
    entries: Mutex<Vec<Diagnostic>>,
}

impl DiagnosticSink {
    pub(crate) fn new() -> DiagnosticSink {
        DiagnosticSink {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn emit(&self, diagnostic: Diagnostic) {
        tracing::warn!(target: "syma::diagnostics", "{}", diagnostic);
        self.entries.lock().push(diagnostic);
    }

    /// Return and clear the accumulated diagnostics.
    pub(crate) fn drain(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.entries.lock())
    }

    pub(crate) fn contains_tag(&self, tag: &str) -> bool {
        self.entries.lock().iter().any(|d| d.tag == tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::symbol::Attributes;

    #[test]
    fn test_emit_and_drain() {
        let sink = DiagnosticSink::new();
        let sym = Arc::new(Symbol::new("General".to_string(), Attributes::NONE));
        sink.emit(Diagnostic {
            symbol: sym.clone(),
            tag: "deadlock",
            args: vec![Value::Int(1)],
        });
        assert!(sink.contains_tag("deadlock"));
        let drained = sink.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].tag, "deadlock");
        assert!(sink.drain().is_empty());
    }

    #[test]
    fn test_display_format() {
        let sym = Arc::new(Symbol::new("General".to_string(), Attributes::NONE));
        let d = Diagnostic {
            symbol: sym,
            tag: "reclim",
            args: vec![Value::Int(256)],
        };
        assert_eq!(format!("{}", d), "General::reclim 256");
    }
}
