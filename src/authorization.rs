use std::sync::Arc;

use crate::auth::Principal;
use crate::error::ApiError;
use crate::models::Document;
use crate::registry::ResourceDefinition;

/// AuthorizationPolicy
///
/// Optional per-resource strategy deciding whether a principal may act on an
/// instance. When a resource supplies one it replaces the ownership check.
pub trait AuthorizationPolicy: Send + Sync {
    fn is_authorized(&self, principal: &Principal, instance: &Document) -> bool;
}

impl<F> AuthorizationPolicy for F
where
    F: Fn(&Principal, &Document) -> bool + Send + Sync,
{
    fn is_authorized(&self, principal: &Principal, instance: &Document) -> bool {
        self(principal, instance)
    }
}

pub type PolicyHandle = Arc<dyn AuthorizationPolicy>;

/// is_authorized
///
/// The binary gate decision, in order of precedence:
/// 1. a resource-level policy, which fully decides;
/// 2. the user resource: principals may act on themselves only;
/// 3. the owner field must hold the principal's id;
/// 4. resources without an owner field admit any authenticated principal.
pub fn is_authorized(resource: &ResourceDefinition, principal: &Principal, instance: &Document) -> bool {
    if let Some(policy) = resource.policy() {
        return policy.is_authorized(principal, instance);
    }
    if resource.is_user_resource() {
        return instance.id == principal.id;
    }
    match resource.owner_field() {
        Some(path) => instance.reference(path) == Some(principal.id),
        None => true,
    }
}

/// is_visible
///
/// Gate for instances reached indirectly, e.g. through expansion. A principal
/// must pass [`is_authorized`]. Anonymous readers only see instances of
/// resources without ownership: no policy, no owner field, not the user
/// resource.
pub fn is_visible(resource: &ResourceDefinition, principal: Option<&Principal>, instance: &Document) -> bool {
    match principal {
        Some(principal) => is_authorized(resource, principal, instance),
        None => {
            resource.policy().is_none() && !resource.is_user_resource() && resource.owner_field().is_none()
        }
    }
}

/// Short-circuits with `Unauthorized` when the gate denies access.
pub fn authorize(
    resource: &ResourceDefinition,
    principal: &Principal,
    instance: &Document,
) -> Result<(), ApiError> {
    if is_authorized(resource, principal, instance) {
        Ok(())
    } else {
        tracing::debug!(
            resource = resource.name(),
            instance = %instance.id,
            principal = %principal.id,
            "authorization denied"
        );
        Err(ApiError::unauthorized())
    }
}
