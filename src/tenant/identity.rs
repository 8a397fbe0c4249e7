use crate::error::ContextError;
use std::fmt;
use std::sync::Arc;

macro_rules! identifier {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(Arc<str>);

        impl $name {
            /// Validate and wrap an identifier. Empty or all-whitespace input is rejected.
            pub fn new(value: impl AsRef<str>) -> Result<Self, ContextError> {
                let value = value.as_ref().trim();
                if value.is_empty() {
                    return Err(ContextError::InvalidIdentifier { kind: $kind });
                }
                Ok(Self(Arc::from(value)))
            }

            /// Borrow the identifier text.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:?})", stringify!($name), &*self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::str::FromStr for $name {
            type Err = ContextError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }
    };
}

identifier!(
    /// A clinic organization; the top-level data isolation boundary.
    TenantId,
    "tenant"
);
identifier!(
    /// A physical clinic location under a tenant.
    BranchId,
    "branch"
);
identifier!(
    /// The authenticated principal acting within a request.
    ActorId,
    "actor"
);

/// Authenticated identity for one logical request.
///
/// Build this only from verified credentials (token claims, session), never
/// from request body content.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TenantContext {
    tenant_id: TenantId,
    branch_id: BranchId,
    actor: Option<ActorId>,
}

impl TenantContext {
    pub fn new(tenant_id: TenantId, branch_id: BranchId) -> Self {
        Self { tenant_id, branch_id, actor: None }
    }

    /// Validate raw identifiers and build a context.
    pub fn parse(tenant_id: &str, branch_id: &str) -> Result<Self, ContextError> {
        Ok(Self::new(TenantId::new(tenant_id)?, BranchId::new(branch_id)?))
    }

    /// Attach the acting principal.
    pub fn with_actor(mut self, actor: ActorId) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn branch_id(&self) -> &BranchId {
        &self.branch_id
    }

    pub fn actor(&self) -> Option<&ActorId> {
        self.actor.as_ref()
    }
}

impl fmt::Display for TenantContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.branch_id)?;
        if let Some(actor) = &self.actor {
            write!(f, " as {}", actor)?;
        }
        Ok(())
    }
}
