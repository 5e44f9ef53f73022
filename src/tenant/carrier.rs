//! Binds a `TenantContext` to the current logical unit of work.
//!
//! The binding is a tokio task-local: it survives every `.await` inside the scope and
//! is invisible to any other task, including tasks spawned with plain `tokio::spawn`.

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;

use super::context::TenantContext;
use super::error::TenantError;

tokio::task_local! {
    static CURRENT_TENANT: Arc<TenantContext>;
}

/// Run `fut` with `ctx` bound. Nested calls shadow the outer binding until they return.
pub async fn run_with_context<F>(ctx: impl Into<Arc<TenantContext>>, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_TENANT.scope(ctx.into(), fut).await
}

/// Synchronous variant for closures that never suspend
pub fn sync_with_context<R>(ctx: impl Into<Arc<TenantContext>>, f: impl FnOnce() -> R) -> R {
    CURRENT_TENANT.sync_scope(ctx.into(), f)
}

pub fn current_context() -> Result<Arc<TenantContext>, TenantError> {
    current_context_or_none().ok_or(TenantError::ContextMissing)
}

pub fn current_context_or_none() -> Option<Arc<TenantContext>> {
    CURRENT_TENANT.try_with(Arc::clone).ok()
}

/// Spawn `fut` on the runtime carrying the caller's binding, if any
pub fn spawn_with_context<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match current_context_or_none() {
        Some(ctx) => tokio::spawn(CURRENT_TENANT.scope(ctx, fut)),
        None => tokio::spawn(fut),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::context::Role;

    fn ctx(org: &str) -> TenantContext {
        TenantContext::new(org, org, "u1", Role::User, format!("req-{}", org))
    }

    #[tokio::test]
    async fn missing_outside_scope() {
        assert!(matches!(current_context(), Err(TenantError::ContextMissing)));
        assert!(current_context_or_none().is_none());
    }

    #[tokio::test]
    async fn visible_across_awaits() {
        run_with_context(ctx("acme"), async {
            tokio::task::yield_now().await;
            assert_eq!(current_context().unwrap().organization_id(), "acme");
        })
        .await;
        assert!(current_context_or_none().is_none());
    }

    #[tokio::test]
    async fn nested_scope_shadows_and_restores() {
        run_with_context(ctx("acme"), async {
            run_with_context(ctx("globex"), async {
                assert_eq!(current_context().unwrap().organization_id(), "globex");
            })
            .await;
            assert_eq!(current_context().unwrap().organization_id(), "acme");
        })
        .await;
    }

    #[tokio::test]
    async fn plain_spawn_does_not_inherit() {
        let seen = run_with_context(ctx("acme"), async {
            tokio::spawn(async { current_context_or_none().is_some() }).await.unwrap()
        })
        .await;
        assert!(!seen);
    }

    #[tokio::test]
    async fn spawn_with_context_carries_binding() {
        let org = run_with_context(ctx("acme"), async {
            spawn_with_context(async { current_context().map(|c| c.organization_id().to_string()) })
                .await
                .unwrap()
        })
        .await
        .unwrap();
        assert_eq!(org, "acme");
    }

    #[test]
    fn sync_scope() {
        let org = sync_with_context(ctx("acme"), || current_context().unwrap().organization_id().to_string());
        assert_eq!(org, "acme");
    }
}
