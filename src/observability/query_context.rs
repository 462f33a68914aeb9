//! Query correlation ids.
//!
//! Engine queries run under a [`QueryContext`] so that spans emitted deep in
//! search, planning, and scoring can be tied back to one caller request.

use std::cell::RefCell;
use std::future::Future;
use uuid::Uuid;

/// Per-query context carrying a correlation id.
#[derive(Clone, Debug)]
pub struct QueryContext {
    query_id: String,
}

impl QueryContext {
    /// Creates a context with a generated id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            query_id: Uuid::new_v4().to_string(),
        }
    }

    /// Creates a context with a caller-supplied id.
    #[must_use]
    pub fn from_id(query_id: impl Into<String>) -> Self {
        Self {
            query_id: query_id.into(),
        }
    }

    /// Returns the query id.
    #[must_use]
    pub fn query_id(&self) -> &str {
        &self.query_id
    }
}

impl Default for QueryContext {
    fn default() -> Self {
        Self::new()
    }
}

tokio::task_local! {
    static TASK_CONTEXT: QueryContext;
}

thread_local! {
    static THREAD_CONTEXT: RefCell<Option<QueryContext>> = const { RefCell::new(None) };
}

/// Guard that restores the previous thread-local context on drop.
pub struct QueryContextGuard {
    previous: Option<QueryContext>,
}

impl Drop for QueryContextGuard {
    fn drop(&mut self) {
        THREAD_CONTEXT.with(|slot| {
            *slot.borrow_mut() = self.previous.take();
        });
    }
}

/// Enters a query context for synchronous flows.
#[must_use]
pub fn enter_query_context(context: QueryContext) -> QueryContextGuard {
    let previous = THREAD_CONTEXT.with(|slot| slot.borrow_mut().replace(context));
    QueryContextGuard { previous }
}

/// Enters a fresh context unless one is already active.
///
/// Nested engine calls keep the outer query id.
#[must_use]
pub fn ensure_query_context() -> Option<QueryContextGuard> {
    current_query_id()
        .is_none()
        .then(|| enter_query_context(QueryContext::new()))
}

/// Scopes a query context across an async future.
pub async fn scope_query_context<F, T>(context: QueryContext, fut: F) -> T
where
    F: Future<Output = T>,
{
    TASK_CONTEXT
        .scope(context.clone(), async move {
            let _guard = enter_query_context(context);
            fut.await
        })
        .await
}

/// Returns the current query id, if set.
#[must_use]
pub fn current_query_id() -> Option<String> {
    if let Ok(id) = TASK_CONTEXT.try_with(|ctx| ctx.query_id.clone()) {
        return Some(id);
    }

    THREAD_CONTEXT.with(|slot| slot.borrow().as_ref().map(|ctx| ctx.query_id.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_context_guard_propagates_query_id() {
        let context = QueryContext::from_id("thread-test");
        let guard = enter_query_context(context);
        assert_eq!(current_query_id().as_deref(), Some("thread-test"));
        drop(guard);
        assert_eq!(current_query_id(), None);
    }

    #[test]
    fn test_ensure_keeps_outer_context() {
        let _outer = enter_query_context(QueryContext::from_id("outer"));
        let inner = ensure_query_context();
        assert!(inner.is_none());
        assert_eq!(current_query_id().as_deref(), Some("outer"));
    }

    #[tokio::test]
    async fn test_scope_query_context_propagates_across_await() {
        let context = QueryContext::from_id("async-test");
        let observed = scope_query_context(context, async {
            tokio::task::yield_now().await;
            current_query_id()
        })
        .await;
        assert_eq!(observed.as_deref(), Some("async-test"));
    }
}
