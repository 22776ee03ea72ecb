//! Stack of linked cancellation scopes shared by the pipeline thread and its
//! callers.
//!
//! Every request and every interactive read runs inside a scope. Scopes form a
//! LIFO stack whose tokens are linked: cancelling a scope also cancels every
//! scope entered after it. Idle scopes mark work that yields to foreground
//! submissions.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

const CANCELLATION_TARGET: &str = "psedit_runspace::cancellation";

/// Identifier of an entered [`CancellationScope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(u64);

struct ScopeEntry {
    id: ScopeId,
    token: CancellationToken,
    is_idle: bool,
}

#[derive(Default)]
struct ScopeStack {
    entries: Vec<ScopeEntry>,
    next_id: u64,
}

/// Thread-safe stack of cancellation scopes.
#[derive(Clone, Default)]
pub struct CancellationContext {
    stack: Arc<Mutex<ScopeStack>>,
}

impl CancellationContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a scope linked to the innermost scope's token.
    pub fn enter_scope(&self, is_idle: bool) -> CancellationScope {
        let mut stack = self.lock();
        let id = ScopeId(stack.next_id);
        stack.next_id += 1;
        let token = stack
            .entries
            .last()
            .map_or_else(CancellationToken::new, |parent| parent.token.child_token());
        stack.entries.push(ScopeEntry {
            id,
            token: token.clone(),
            is_idle,
        });
        tracing::trace!(
            target: CANCELLATION_TARGET,
            scope = id.0,
            is_idle,
            depth = stack.entries.len(),
            "entered cancellation scope"
        );
        CancellationScope {
            id,
            token,
            is_idle,
            stack: Arc::clone(&self.stack),
        }
    }

    /// Pushes a foreground scope for a nested frame.
    ///
    /// The scope links to the innermost foreground scope, skipping idle ones,
    /// so work in the frame survives preemption of the idle request beneath
    /// it. [`Self::cancel_idle_parent_task`] stops at the boundary.
    pub fn enter_frame_scope(&self) -> CancellationScope {
        let mut stack = self.lock();
        let id = ScopeId(stack.next_id);
        stack.next_id += 1;
        let token = stack
            .entries
            .iter()
            .rev()
            .find(|entry| !entry.is_idle)
            .map_or_else(CancellationToken::new, |parent| parent.token.child_token());
        stack.entries.push(ScopeEntry {
            id,
            token: token.clone(),
            is_idle: false,
        });
        tracing::trace!(
            target: CANCELLATION_TARGET,
            scope = id.0,
            depth = stack.entries.len(),
            "entered frame boundary scope"
        );
        CancellationScope {
            id,
            token,
            is_idle: false,
            stack: Arc::clone(&self.stack),
        }
    }

    /// Cancels the innermost scope only.
    pub fn cancel_current_task(&self) {
        let stack = self.lock();
        if let Some(entry) = stack.entries.last() {
            tracing::debug!(
                target: CANCELLATION_TARGET,
                scope = entry.id.0,
                "cancelling current task"
            );
            entry.token.cancel();
        }
    }

    /// Cancels every scope on the stack.
    pub fn cancel_current_task_stack(&self) {
        let stack = self.lock();
        tracing::debug!(
            target: CANCELLATION_TARGET,
            depth = stack.entries.len(),
            "cancelling task stack"
        );
        for entry in &stack.entries {
            entry.token.cancel();
        }
    }

    /// Cancels contiguous idle scopes from the top, stopping at the first
    /// foreground scope without cancelling it.
    pub fn cancel_idle_parent_task(&self) {
        let stack = self.lock();
        for entry in stack.entries.iter().rev() {
            if !entry.is_idle {
                break;
            }
            tracing::debug!(
                target: CANCELLATION_TARGET,
                scope = entry.id.0,
                "cancelling idle task"
            );
            entry.token.cancel();
        }
    }

    /// Cancels one scope, and through token links every scope above it.
    ///
    /// Returns `false` when the scope has already been exited.
    pub fn cancel_scope(&self, id: ScopeId) -> bool {
        let stack = self.lock();
        match stack.entries.iter().find(|entry| entry.id == id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of scopes currently entered.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.lock().entries.len()
    }

    fn lock(&self) -> MutexGuard<'_, ScopeStack> {
        self.stack.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Entered scope; dropping it removes it from the stack and cancels its token.
pub struct CancellationScope {
    id: ScopeId,
    token: CancellationToken,
    is_idle: bool,
    stack: Arc<Mutex<ScopeStack>>,
}

impl CancellationScope {
    /// Identifier used by [`CancellationContext::cancel_scope`].
    #[must_use]
    pub fn id(&self) -> ScopeId {
        self.id
    }

    /// Token observed by the work running in this scope.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether the scope yields to foreground submissions.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.is_idle
    }
}

impl Drop for CancellationScope {
    fn drop(&mut self) {
        let mut stack = self.stack.lock().unwrap_or_else(PoisonError::into_inner);
        let position = stack.entries.iter().rposition(|entry| entry.id == self.id);
        match position {
            Some(index) => {
                if index + 1 != stack.entries.len() {
                    tracing::debug!(
                        target: CANCELLATION_TARGET,
                        scope = self.id.0,
                        depth = stack.entries.len(),
                        "cancellation scope exited out of order"
                    );
                }
                stack.entries.remove(index);
            }
            None => {
                tracing::debug!(
                    target: CANCELLATION_TARGET,
                    scope = self.id.0,
                    "cancellation scope already removed"
                );
            }
        }
        self.token.cancel();
    }
}

impl std::fmt::Debug for CancellationScope {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("CancellationScope")
            .field("id", &self.id)
            .field("is_idle", &self.is_idle)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

impl std::fmt::Debug for CancellationContext {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("CancellationContext")
            .field("depth", &self.depth())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::CancellationContext;

    #[rstest]
    fn nested_scopes_inherit_parent_cancellation() {
        let context = CancellationContext::new();
        let outer = context.enter_scope(false);
        let inner = context.enter_scope(false);

        assert!(context.cancel_scope(outer.id()));
        assert!(outer.token().is_cancelled());
        assert!(inner.token().is_cancelled());
    }

    #[rstest]
    fn current_task_cancellation_spares_parents() {
        let context = CancellationContext::new();
        let outer = context.enter_scope(false);
        let inner = context.enter_scope(false);

        context.cancel_current_task();

        assert!(inner.token().is_cancelled());
        assert!(!outer.token().is_cancelled());
    }

    #[rstest]
    fn idle_cancellation_stops_at_foreground_scope() {
        let context = CancellationContext::new();
        let foreground = context.enter_scope(false);
        let idle = context.enter_scope(true);
        let idle_child = context.enter_scope(true);

        context.cancel_idle_parent_task();

        assert!(idle.token().is_cancelled());
        assert!(idle_child.token().is_cancelled());
        assert!(!foreground.token().is_cancelled());
    }

    #[rstest]
    fn frame_boundary_shields_nested_work_from_idle_preemption() {
        let context = CancellationContext::new();
        let foreground = context.enter_scope(false);
        let idle = context.enter_scope(true);
        let boundary = context.enter_frame_scope();
        let read = context.enter_scope(true);

        context.cancel_idle_parent_task();

        assert!(read.token().is_cancelled());
        assert!(!boundary.token().is_cancelled());
        assert!(!idle.token().is_cancelled());

        context.cancel_scope(foreground.id());
        assert!(boundary.token().is_cancelled());
    }

    #[rstest]
    fn stack_cancellation_reaches_every_scope() {
        let context = CancellationContext::new();
        let first = context.enter_scope(true);
        let second = context.enter_scope(false);

        context.cancel_current_task_stack();

        assert!(first.token().is_cancelled());
        assert!(second.token().is_cancelled());
    }

    #[rstest]
    fn dropping_a_scope_pops_it() {
        let context = CancellationContext::new();
        let outer = context.enter_scope(false);
        let token = {
            let inner = context.enter_scope(false);
            assert_eq!(context.depth(), 2);
            inner.token().clone()
        };

        assert_eq!(context.depth(), 1);
        assert!(token.is_cancelled());
        assert!(!outer.token().is_cancelled());
        assert!(!context.cancel_scope(super::ScopeId(99)));
    }
}
