use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    AppState,
    auth::Principal,
    error::ApiError,
    expand::Expander,
    handlers::{ReadQuery, wrap},
    registry::ResourceHandle,
};

/// ActionContext
///
/// Everything a custom action receives when `?action=<name>` is dispatched
/// on a readMany route.
#[derive(Clone)]
pub struct ActionContext {
    pub state: AppState,
    /// The resource the route was generated for.
    pub resource: ResourceHandle,
    /// The resolved principal, present even on routes that do not authenticate.
    pub principal: Option<Principal>,
    /// Raw parent id for nested routes.
    pub parent_id: Option<String>,
    pub query: ReadQuery,
}

/// Action
///
/// A named custom operation attached to a readMany route. Its result is
/// returned as the response body in place of the default listing.
#[async_trait]
pub trait Action: Send + Sync {
    async fn execute(&self, ctx: ActionContext) -> Result<Value, ApiError>;
}

pub type ActionHandle = Arc<dyn Action>;

/// MeAction
///
/// `GET /users?action=me`: the principal's own user instance, honoring
/// `expand` like a read.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeAction;

#[async_trait]
impl Action for MeAction {
    async fn execute(&self, ctx: ActionContext) -> Result<Value, ApiError> {
        let principal = ctx.principal.ok_or_else(ApiError::unauthorized)?;
        let users = ctx
            .state
            .registry
            .user_resource()
            .ok_or_else(ApiError::unauthorized)?;

        let body = Expander::new(&ctx.state.registry, ctx.state.repo.as_ref(), Some(&principal))
            .render(users, &principal.user, &ctx.query.expand_request())
            .await?;
        Ok(wrap(users.singular(), Value::Object(body)))
    }
}
