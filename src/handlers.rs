use axum::{
    Json,
    extract::{Query, State, rejection::QueryRejection},
    http::StatusCode,
};
use futures::future::join_all;
use serde::Deserialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{
    AppState,
    actions::ActionContext,
    auth::Principal,
    authorization::{authorize, is_authorized},
    error::ApiError,
    expand::{ExpandRequest, Expander},
    models::{Document, FieldKind, FieldSpec, NewDocument, deep_merge, next_timestamp, set_path},
    registry::ResourceDefinition,
    repository::{Filter, RepositoryState, UpdateMode},
    routes::generator::Endpoint,
    validation::{WriteMode, parse_body, validate_input},
};

pub const DEFAULT_PAGE_LIMIT: u64 = 10;
pub const MAX_PAGE_LIMIT: u64 = 100;

/// ReadQuery
///
/// Query options recognized by the read routes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadQuery {
    /// Comma-separated reference paths to inline.
    pub expand: Option<String>,
    /// Fail the read instead of degrading an unresolvable reference.
    pub strict_expand: Option<bool>,
    /// Named custom action replacing the default listing.
    pub action: Option<String>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
}

impl ReadQuery {
    pub fn expand_request(&self) -> ExpandRequest {
        ExpandRequest::parse(self.expand.as_deref(), self.strict_expand.unwrap_or(false))
    }

    fn window(&self) -> (u64, u64) {
        let limit = self.limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);
        // Stores address rows with signed 64-bit offsets.
        let offset = self.offset.unwrap_or(0).min(i64::MAX as u64);
        (offset, limit)
    }
}

/// Maps a malformed query string to a validation error.
pub fn read_query(query: Result<Query<ReadQuery>, QueryRejection>) -> Result<ReadQuery, ApiError> {
    query
        .map(|Query(q)| q)
        .map_err(|e| ApiError::Validation(format!("invalid query: {}", e.body_text())))
}

/// Wraps a representation under its resource key, e.g. `{"bar": {...}}`.
pub(crate) fn wrap(key: &str, value: Value) -> Value {
    let mut body = Map::new();
    body.insert(key.to_string(), value);
    Value::Object(body)
}

/// The gate principal: `None` when the route does not authenticate,
/// `Unauthorized` when it does and nobody is logged in.
fn authenticate(endpoint: &Endpoint, principal: Option<Principal>) -> Result<Option<Principal>, ApiError> {
    if !endpoint.options.authenticate {
        return Ok(None);
    }
    principal.map(Some).ok_or_else(ApiError::unauthorized)
}

/// Identifiers that are not UUIDs cannot exist, so they are reported as missing.
fn parse_id(resource: &ResourceDefinition, raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::not_found(resource.name(), raw))
}

async fn fetch(state: &AppState, resource: &ResourceDefinition, id: Uuid) -> Result<Document, ApiError> {
    state
        .repo
        .find_by_id(resource.name(), id)
        .await?
        .ok_or_else(|| ApiError::not_found(resource.name(), id))
}

/// Resolves and gates the parent instance of a nested route.
async fn scoped_parent(
    state: &AppState,
    endpoint: &Endpoint,
    gate: Option<&Principal>,
    raw_parent_id: Option<&str>,
) -> Result<Option<Uuid>, ApiError> {
    let (Some(scope), Some(raw)) = (&endpoint.scope, raw_parent_id) else {
        return Ok(None);
    };
    let parent_id = parse_id(&scope.parent, raw)?;
    let parent = fetch(state, &scope.parent, parent_id).await?;
    if let Some(principal) = gate {
        authorize(&scope.parent, principal, &parent)?;
    }
    Ok(Some(parent_id))
}

/// Stored values of uneditable fields, which a full replace keeps.
fn retain_uneditable(fields: &[(String, FieldSpec)], stored: &Map<String, Value>) -> Map<String, Value> {
    let mut kept = Map::new();
    for (name, spec) in fields {
        let Some(value) = stored.get(name) else {
            continue;
        };
        if !spec.editable {
            kept.insert(name.clone(), value.clone());
            continue;
        }
        if let (FieldKind::Group(inner), Value::Object(nested)) = (&spec.kind, value) {
            let inner_kept = retain_uneditable(inner, nested);
            if !inner_kept.is_empty() {
                kept.insert(name.clone(), Value::Object(inner_kept));
            }
        }
    }
    kept
}

/// create
///
/// Validates the payload, assigns id and timestamps, persists and returns the
/// created representation. Nested routes take the parent id from the path and
/// record it in the scope field.
pub async fn create(
    state: &AppState,
    endpoint: &Endpoint,
    principal: Option<Principal>,
    raw_parent_id: Option<&str>,
    body: &[u8],
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let resource = &endpoint.resource;
    let gate = authenticate(endpoint, principal)?;
    let parent_id = scoped_parent(state, endpoint, gate.as_ref(), raw_parent_id).await?;

    let mut input = parse_body(body)?;
    let scope_value = endpoint
        .scope
        .as_ref()
        .zip(parent_id)
        .map(|(scope, id)| (scope.field.clone(), Value::String(id.to_string())));
    if let Some((path, value)) = &scope_value {
        set_path(&mut input, path.segments(), value.clone());
    }
    let mut fields = validate_input(resource, input, WriteMode::Create)?;
    if let Some((path, value)) = scope_value {
        set_path(&mut fields, path.segments(), value);
    }

    let candidate = NewDocument::new(fields);
    if let Some(principal) = &gate {
        let preview = Document {
            id: candidate.id,
            fields: candidate.fields.clone(),
            timestamp_created: candidate.created_at,
            timestamp_updated: candidate.created_at,
        };
        authorize(resource, principal, &preview)?;
    }

    let doc = state.repo.insert(resource.name(), candidate).await?;
    tracing::info!(resource = resource.name(), id = %doc.id, "created instance");
    Ok((
        StatusCode::CREATED,
        Json(wrap(resource.singular(), Value::Object(resource.represent(&doc)))),
    ))
}

/// read
///
/// Fetches one instance, gates it when the route authenticates, and expands
/// the requested references.
pub async fn read(
    state: &AppState,
    endpoint: &Endpoint,
    principal: Option<Principal>,
    raw_id: &str,
    query: ReadQuery,
) -> Result<Json<Value>, ApiError> {
    let resource = &endpoint.resource;
    let gate = authenticate(endpoint, principal.clone())?;
    let id = parse_id(resource, raw_id)?;
    let doc = fetch(state, resource, id).await?;
    if let Some(principal) = &gate {
        authorize(resource, principal, &doc)?;
    }

    let body = Expander::new(&state.registry, state.repo.as_ref(), principal.as_ref())
        .render(resource, &doc, &query.expand_request())
        .await?;
    Ok(Json(wrap(resource.singular(), Value::Object(body))))
}

/// read_many
///
/// Lists a page of instances ordered by creation time. A named `action`
/// replaces the default listing; nested routes list the parent's instances
/// only.
pub async fn read_many(
    state: &AppState,
    endpoint: &Endpoint,
    principal: Option<Principal>,
    raw_parent_id: Option<&str>,
    query: ReadQuery,
) -> Result<Json<Value>, ApiError> {
    let resource = &endpoint.resource;
    let gate = authenticate(endpoint, principal.clone())?;

    if let Some(name) = query.action.as_deref() {
        let action = endpoint
            .options
            .find_action(name)
            .ok_or_else(|| ApiError::Validation(format!("unknown action '{name}'")))?
            .clone();
        tracing::debug!(resource = resource.name(), action = name, "dispatching action");
        let ctx = ActionContext {
            state: state.clone(),
            resource: resource.clone(),
            principal,
            parent_id: raw_parent_id.map(str::to_string),
            query: query.clone(),
        };
        return action.execute(ctx).await.map(Json);
    }

    let (offset, limit) = query.window();
    let mut filter = Filter::all().page(offset, limit);
    let parent_id = scoped_parent(state, endpoint, gate.as_ref(), raw_parent_id).await?;
    if let (Some(scope), Some(parent_id)) = (&endpoint.scope, parent_id) {
        filter = filter.matching(scope.field.clone(), Value::String(parent_id.to_string()));
    }

    let mut docs = state.repo.find(resource.name(), &filter).await?;
    if let (Some(principal), None) = (&gate, parent_id) {
        docs.retain(|doc| is_authorized(resource, principal, doc));
    }

    let expander = Expander::new(&state.registry, state.repo.as_ref(), principal.as_ref());
    let request = query.expand_request();
    let rendered = join_all(docs.iter().map(|doc| expander.render(resource, doc, &request)))
        .await
        .into_iter()
        .map(|r| r.map(Value::Object))
        .collect::<Result<Vec<_>, _>>()?;

    let mut body = Map::new();
    body.insert(resource.plural().to_string(), Value::Array(rendered));
    body.insert("offset".to_string(), Value::from(offset));
    body.insert("limit".to_string(), Value::from(limit));
    Ok(Json(Value::Object(body)))
}

/// update
///
/// `WriteMode::Replace` swaps the whole editable field set (uneditable stored
/// fields survive); `WriteMode::Merge` changes only the provided fields,
/// deep-merging groups. Either way `timestampUpdated` moves forward.
pub async fn update(
    state: &AppState,
    endpoint: &Endpoint,
    principal: Option<Principal>,
    raw_id: &str,
    body: &[u8],
    mode: WriteMode,
) -> Result<Json<Value>, ApiError> {
    let resource = &endpoint.resource;
    let gate = authenticate(endpoint, principal)?;
    let id = parse_id(resource, raw_id)?;
    let current = fetch(state, resource, id).await?;
    if let Some(principal) = &gate {
        authorize(resource, principal, &current)?;
    }

    let validated = validate_input(resource, parse_body(body)?, mode)?;
    let (change, resulting) = match mode {
        WriteMode::Merge => {
            let mut patch = Map::new();
            for (key, value) in validated {
                let merged = match (current.fields.get(&key), value) {
                    (Some(Value::Object(existing)), Value::Object(incoming)) => {
                        let mut combined = existing.clone();
                        deep_merge(&mut combined, incoming);
                        Value::Object(combined)
                    }
                    (_, value) => value,
                };
                patch.insert(key, merged);
            }
            let mut resulting = current.fields.clone();
            resulting.extend(patch.clone());
            (UpdateMode::Merge(patch), resulting)
        }
        WriteMode::Create | WriteMode::Replace => {
            let mut fields = retain_uneditable(resource.fields(), &current.fields);
            deep_merge(&mut fields, validated);
            (UpdateMode::Replace(fields.clone()), fields)
        }
    };

    if let Some(principal) = &gate {
        let preview = Document {
            fields: resulting,
            ..current.clone()
        };
        authorize(resource, principal, &preview)?;
    }

    let doc = state
        .repo
        .update_by_id(resource.name(), id, change, next_timestamp(current.timestamp_updated))
        .await?
        .ok_or_else(|| ApiError::not_found(resource.name(), id))?;
    tracing::info!(resource = resource.name(), id = %doc.id, ?mode, "updated instance");
    Ok(Json(wrap(resource.singular(), Value::Object(resource.represent(&doc)))))
}

/// delete
///
/// Removes the instance. Deleting an id twice reports `NotFound` the second time.
pub async fn delete(
    state: &AppState,
    endpoint: &Endpoint,
    principal: Option<Principal>,
    raw_id: &str,
) -> Result<StatusCode, ApiError> {
    let resource = &endpoint.resource;
    let gate = authenticate(endpoint, principal)?;
    let id = parse_id(resource, raw_id)?;
    let current = fetch(state, resource, id).await?;
    if let Some(principal) = &gate {
        authorize(resource, principal, &current)?;
    }

    if !state.repo.delete_by_id(resource.name(), id).await? {
        return Err(ApiError::not_found(resource.name(), id));
    }
    tracing::info!(resource = resource.name(), id = %id, "deleted instance");
    Ok(StatusCode::NO_CONTENT)
}

/// clear_data
///
/// [Local-only Route] Removes every stored instance. Test suites call it
/// between scenarios.
pub async fn clear_data(State(repo): State<RepositoryState>) -> Result<StatusCode, ApiError> {
    repo.clear().await?;
    tracing::warn!("cleared all stored instances");
    Ok(StatusCode::OK)
}
