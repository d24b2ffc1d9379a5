//! Buffered non-fatal diagnostics.
//!
//! Scanning and applying keep going after a bad relocation so that a single
//! link surfaces as many problems as possible. Errors land in a lock-free
//! queue that any worker thread can push to; the embedding driver drains it
//! once a phase has finished and decides whether to abort the link.

use crossbeam_queue::SegQueue;

#[derive(Default)]
pub struct Diagnostics {
    errors: SegQueue<String>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(&self, message: String) {
        tracing::error!("{message}");
        self.errors.push(message);
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn undefined_symbol(&self, file: &str, section: &str, symbol: &str) {
        self.error(format!("{file}:({section}): undefined symbol: {symbol}"));
    }

    pub fn unknown_relocation(&self, file: &str, section: &str, rel_name: &str) {
        self.error(format!("{file}:({section}): unknown relocation: {rel_name}"));
    }

    /// Drains all buffered errors. Ordering between threads is arbitrary.
    pub fn take_errors(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.errors.len());
        while let Some(error) = self.errors.pop() {
            out.push(error);
        }
        out
    }
}
