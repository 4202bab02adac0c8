//! Undo list for host resources staged before a hypervisor change.
//!
//! Steps run in reverse order when the guard drops without
//! [`Rollback::commit`]. A failing step is logged and the rest still run.

use crate::error::Result;

type Step = Box<dyn FnOnce() -> Result<()> + Send>;

/// Reverse-order cleanup guard.
#[must_use = "dropping the guard immediately runs every step"]
pub struct Rollback {
    operation: String,
    steps: Vec<(String, Step)>,
}

impl Rollback {
    /// Start an empty undo list for `operation`.
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            steps: Vec::new(),
        }
    }

    /// Register a step that undoes something just staged.
    pub fn push<F>(&mut self, label: impl Into<String>, step: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.steps.push((label.into(), Box::new(step)));
    }

    /// Number of registered steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether no steps are registered.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Keep every staged resource.
    pub fn commit(mut self) {
        self.steps.clear();
    }

    fn unwind(&mut self) {
        while let Some((label, step)) = self.steps.pop() {
            match step() {
                Ok(()) => tracing::debug!(operation = %self.operation, step = %label, "rolled back"),
                Err(e) => tracing::warn!(
                    operation = %self.operation,
                    step = %label,
                    error = %e,
                    "rollback step failed"
                ),
            }
        }
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        self.unwind();
    }
}

impl std::fmt::Debug for Rollback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rollback")
            .field("operation", &self.operation)
            .field(
                "steps",
                &self.steps.iter().map(|(l, _)| l.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
