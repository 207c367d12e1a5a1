//! Per-request cancellation bus
//!
//! Every in-flight acquisition task registers a [`CancellationToken`] under
//! its request id. The cancel boundary fires the token after persisting the
//! `cancelled` status; sleeping tasks wake on the token and re-read status
//! before exiting.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Handle returned by [`TaskRegistry::register`]. The generation ties the
/// handle to one specific registration so a finished task cannot evict its
/// replacement's token.
pub struct TaskHandle {
    request_id: i64,
    generation: u64,
    token: CancellationToken,
}

impl TaskHandle {
    /// The cancellation token for this task.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Registry of cancellation tokens for in-flight acquisition tasks.
///
/// At most one acquisition task runs per request; registering again for the
/// same id replaces (and fires) the previous token so a stale task winds
/// down instead of racing the new one.
#[derive(Default)]
pub struct TaskRegistry {
    tokens: Mutex<HashMap<i64, (u64, CancellationToken)>>,
    next_generation: Mutex<u64>,
}

impl TaskRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token for a request's acquisition task.
    pub fn register(&self, request_id: i64) -> TaskHandle {
        let generation = {
            let mut next = self.next_generation.lock().unwrap();
            *next += 1;
            *next
        };
        let token = CancellationToken::new();
        let mut tokens = self.tokens.lock().unwrap();
        if let Some((_, previous)) = tokens.insert(request_id, (generation, token.clone())) {
            debug!(
                "Replacing in-flight task token for request {}; cancelling the old task",
                request_id
            );
            previous.cancel();
        }
        TaskHandle {
            request_id,
            generation,
            token,
        }
    }

    /// Fire the token for a request, if one is registered.
    pub fn cancel(&self, request_id: i64) {
        if let Some((_, token)) = self.tokens.lock().unwrap().get(&request_id) {
            token.cancel();
        }
    }

    /// Drop a task's entry once it exits. A handle from a superseded
    /// registration leaves the current entry alone.
    pub fn deregister(&self, handle: &TaskHandle) {
        let mut tokens = self.tokens.lock().unwrap();
        if let Some((generation, _)) = tokens.get(&handle.request_id) {
            if *generation == handle.generation {
                tokens.remove(&handle.request_id);
            }
        }
    }

    /// Number of registered in-flight tasks.
    pub fn len(&self) -> usize {
        self.tokens.lock().unwrap().len()
    }

    /// Whether no tasks are in flight.
    pub fn is_empty(&self) -> bool {
        self.tokens.lock().unwrap().is_empty()
    }

    /// Fire every registered token (process shutdown).
    pub fn cancel_all(&self) {
        for (_, token) in self.tokens.lock().unwrap().values() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_fires_registered_token() {
        let registry = TaskRegistry::new();
        let handle = registry.register(1);
        assert!(!handle.token().is_cancelled());

        registry.cancel(1);
        assert!(handle.token().is_cancelled());
    }

    #[test]
    fn cancel_unknown_request_is_a_noop() {
        let registry = TaskRegistry::new();
        registry.cancel(42);
        assert!(registry.is_empty());
    }

    #[test]
    fn re_register_cancels_previous_task() {
        let registry = TaskRegistry::new();
        let first = registry.register(1);
        let second = registry.register(1);

        assert!(first.token().is_cancelled());
        assert!(!second.token().is_cancelled());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn stale_handle_cannot_evict_replacement() {
        let registry = TaskRegistry::new();
        let first = registry.register(1);
        let second = registry.register(1);

        // The superseded task exits and deregisters; the live token stays.
        registry.deregister(&first);
        assert_eq!(registry.len(), 1);

        registry.cancel(1);
        assert!(second.token().is_cancelled());

        registry.deregister(&second);
        assert!(registry.is_empty());
    }

    #[test]
    fn cancel_all_fires_everything() {
        let registry = TaskRegistry::new();
        let a = registry.register(1);
        let b = registry.register(2);

        registry.cancel_all();
        assert!(a.token().is_cancelled());
        assert!(b.token().is_cancelled());
    }
}
