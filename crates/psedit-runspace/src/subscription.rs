//! Scoped registration of the session's runspace event handler.

use std::sync::Arc;

use crate::engine::{Runspace, RunspaceEventHandler, SubscriptionId};

/// Handler registration released when dropped.
pub(crate) struct RunspaceSubscription {
    runspace: Arc<dyn Runspace>,
    id: SubscriptionId,
}

impl RunspaceSubscription {
    pub(crate) fn acquire(
        runspace: Arc<dyn Runspace>,
        handler: Arc<dyn RunspaceEventHandler>,
    ) -> Self {
        let id = runspace.subscribe(handler);
        tracing::trace!(
            target: "psedit_runspace::context",
            runspace = %runspace.id(),
            subscription = id.0,
            "subscribed to runspace events"
        );
        Self { runspace, id }
    }
}

impl Drop for RunspaceSubscription {
    fn drop(&mut self) {
        self.runspace.unsubscribe(self.id);
        tracing::trace!(
            target: "psedit_runspace::context",
            runspace = %self.runspace.id(),
            subscription = self.id.0,
            "unsubscribed from runspace events"
        );
    }
}
