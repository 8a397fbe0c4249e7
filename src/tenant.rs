//! Request-scoped tenant identity.
//!
//! A [`TenantContext`] carries the authenticated tenant, branch and (optionally)
//! actor for one logical request. It is an ordinary value, so code can take it
//! as a parameter, but it can also be installed for the duration of a request:
//!
//! - **Async**: [`scope`] binds the context to a future via a task-local. The
//!   binding ends when the future completes or is dropped.
//! - **Sync**: [`sync_scope`] binds it for the duration of a closure, including
//!   during unwinding.
//!
//! Both bindings belong to the scoped code alone. Other tasks polled on the
//! same worker thread never observe them.
//!
//! Contexts are never inherited implicitly. Work handed to another task must
//! be wrapped with [`propagate`] or started with [`spawn_scoped`].
//!
//! ```rust
//! use tenantguard::tenant::{self, TenantContext};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), tenantguard::ContextError> {
//! let ctx = TenantContext::parse("clinic-7", "downtown")?;
//! let branch = tenant::scope(ctx, async { tenant::require_branch_id() }).await??;
//! assert_eq!(branch.as_str(), "downtown");
//! assert!(tenant::current().is_none());
//! # Ok(())
//! # }
//! ```

pub mod identity;
pub mod layer;
pub mod scope;

pub use identity::{ActorId, BranchId, TenantContext, TenantId};
pub use layer::{IdentityExtractor, TenantContextLayer, TenantContextService};
pub use scope::{
    actor, branch_id, clear, current, propagate, require_branch_id, require_current,
    require_tenant_id, scope, spawn_scoped, sync_scope, tenant_id,
};
pub(crate) use scope::bind;
