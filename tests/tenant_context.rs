use std::time::Duration;
use tenantguard::prelude::*;

fn ctx(tenant: &str, branch: &str) -> TenantContext {
    TenantContext::parse(tenant, branch).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_see_only_their_own_tenant() {
    let handles: Vec<_> = (0..64)
        .map(|i| {
            let tenant = format!("clinic-{i}");
            tokio::spawn(tenant::scope(ctx(&tenant, "main"), async move {
                for _ in 0..10 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    assert_eq!(tenant::require_tenant_id().unwrap().as_str(), tenant);
                }
                tenant
            }))
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let tenant = handle.await.unwrap().unwrap();
        assert_eq!(tenant, format!("clinic-{i}"));
    }
}

#[tokio::test]
async fn strict_accessors_fail_without_context() {
    assert_eq!(tenant::current(), None);
    assert_eq!(tenant::require_tenant_id(), Err(ContextError::NotInitialized));
    assert_eq!(tenant::require_branch_id(), Err(ContextError::NotInitialized));
    assert!(tenant::actor().is_none());
}

#[tokio::test]
async fn context_ends_with_its_scope() {
    tenant::scope(ctx("clinic-1", "east"), async {
        assert_eq!(tenant::branch_id().unwrap().as_str(), "east");
    })
    .await
    .unwrap();
    assert!(tenant::current().is_none());
}

#[tokio::test]
async fn nested_scope_is_rejected() {
    let err = tenant::scope(ctx("clinic-1", "east"), async {
        tenant::scope(ctx("clinic-2", "west"), async {}).await.unwrap_err()
    })
    .await
    .unwrap();
    assert!(matches!(err, ContextError::AlreadyInitialized { .. }));
}

#[tokio::test]
async fn spawned_tasks_inherit_only_when_propagated() {
    tenant::scope(ctx("clinic-1", "east"), async {
        let plain = tokio::spawn(async { tenant::current() }).await.unwrap();
        assert!(plain.is_none());

        let carried = tenant::spawn_scoped(async { tenant::require_tenant_id() }).await.unwrap();
        assert_eq!(carried.unwrap().as_str(), "clinic-1");

        let wrapped = tokio::spawn(tenant::propagate(async { tenant::tenant_id() })).await.unwrap();
        assert_eq!(wrapped.unwrap().as_str(), "clinic-1");
    })
    .await
    .unwrap();
}

#[test]
fn threads_hold_independent_contexts() {
    let handles: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|name| {
            std::thread::spawn(move || {
                tenant::sync_scope(ctx(name, "main"), || {
                    std::thread::sleep(Duration::from_millis(5));
                    tenant::require_tenant_id().unwrap().as_str().to_owned()
                })
                .unwrap()
            })
        })
        .collect();
    let seen: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(seen, ["a", "b", "c"]);
}

#[test]
fn sync_scope_ends_with_its_closure() {
    tenant::sync_scope(ctx("clinic-1", "east"), || {
        assert!(tenant::sync_scope(ctx("clinic-2", "west"), || ()).is_err());
        assert_eq!(tenant::tenant_id().unwrap().as_str(), "clinic-1");
    })
    .unwrap();
    assert!(tenant::current().is_none());
    tenant::sync_scope(ctx("clinic-2", "west"), || ()).unwrap();
}

#[tokio::test(flavor = "current_thread")]
async fn scope_held_across_await_does_not_leak_into_other_tasks() {
    tenant::scope(ctx("clinic-a", "main"), async {
        // Yield so the spawned task runs on this same thread while the scope
        // is still suspended.
        let other = tokio::spawn(async { tenant::current() });
        tokio::task::yield_now().await;
        assert!(other.await.unwrap().is_none());
        assert_eq!(tenant::require_tenant_id().unwrap().as_str(), "clinic-a");
    })
    .await
    .unwrap();

    let local = tokio::task::LocalSet::new();
    local
        .run_until(tenant::scope(ctx("clinic-a", "main"), async {
            let seen = tokio::task::spawn_local(async { tenant::current() }).await.unwrap();
            assert!(seen.is_none());
        }))
        .await
        .unwrap();
}

#[tokio::test(flavor = "current_thread")]
async fn clear_in_one_request_leaves_others_intact() {
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

    let first = tokio::spawn(tenant::scope(ctx("clinic-1", "east"), async move {
        tenant::clear();
        let _ = release_rx.await;
        tenant::current()
    }));
    let second = tokio::spawn(tenant::scope(ctx("clinic-2", "west"), async move {
        tokio::task::yield_now().await;
        let _ = release_tx.send(());
        tokio::task::yield_now().await;
        tenant::require_tenant_id()
    }));

    assert!(first.await.unwrap().unwrap().is_none());
    assert_eq!(second.await.unwrap().unwrap().unwrap().as_str(), "clinic-2");
}

#[tokio::test]
async fn clear_is_scoped_to_the_calling_request() {
    let tenant = tenant::scope(ctx("clinic-1", "east"), async {
        tenant::clear();
        assert!(tenant::current().is_none());
        assert_eq!(tenant::require_branch_id(), Err(ContextError::NotInitialized));
        // A cleared request may install a fresh context.
        tenant::scope(ctx("clinic-2", "west"), async { tenant::require_tenant_id() }).await
    })
    .await
    .unwrap()
    .unwrap()
    .unwrap();
    assert_eq!(tenant.as_str(), "clinic-2");
    tenant::clear();
    assert!(tenant::current().is_none());
}

#[test]
fn blank_identifiers_are_rejected() {
    assert!(matches!(TenantContext::parse("  ", "main"), Err(ContextError::InvalidIdentifier { .. })));
    assert!(matches!(TenantContext::parse("clinic", ""), Err(ContextError::InvalidIdentifier { .. })));
}
