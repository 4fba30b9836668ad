mod common;

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{Method, Request, Uri, header, request::Parts},
};
use chrono::{DateTime, Utc};
use common::{create_token, spawn_app};
use resource_router::{
    AppState, ResourceRegistry,
    auth::{MaybePrincipal, Principal},
    config::{AppConfig, Env},
    error::ApiError,
    models::{Document, NewDocument, ResourceSchema, timestamp_now},
    repository::{Filter, Repository, RepositoryError, UpdateMode},
};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use uuid::Uuid;

// --- Mock Repository for Auth Logic ---

#[derive(Default)]
struct MockAuthRepo {
    user_to_return: Option<Document>,
    fail: bool,
}

#[async_trait]
impl Repository for MockAuthRepo {
    async fn prepare(&self, _resource: &str, _unique: &[resource_router::models::FieldPath]) -> Result<(), RepositoryError> {
        Ok(())
    }
    async fn insert(&self, _resource: &str, _doc: NewDocument) -> Result<Document, RepositoryError> {
        Err(RepositoryError::Upstream("read-only mock".to_string()))
    }
    async fn find_by_id(&self, _resource: &str, id: Uuid) -> Result<Option<Document>, RepositoryError> {
        if self.fail {
            return Err(RepositoryError::Upstream("connection reset".to_string()));
        }
        Ok(self.user_to_return.clone().filter(|user| user.id == id))
    }
    async fn find(&self, _resource: &str, _filter: &Filter) -> Result<Vec<Document>, RepositoryError> {
        Ok(vec![])
    }
    async fn update_by_id(
        &self,
        _resource: &str,
        _id: Uuid,
        _update: UpdateMode,
        _updated_at: DateTime<Utc>,
    ) -> Result<Option<Document>, RepositoryError> {
        Ok(None)
    }
    async fn delete_by_id(&self, _resource: &str, _id: Uuid) -> Result<bool, RepositoryError> {
        Ok(false)
    }
    async fn clear(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}

// --- Helper Functions ---

fn user_document(id: Uuid) -> Document {
    let now = timestamp_now();
    let mut fields = Map::new();
    fields.insert("email".to_string(), Value::String("test@example.com".to_string()));
    Document {
        id,
        fields,
        timestamp_created: now,
        timestamp_updated: now,
    }
}

async fn create_app_state(env: Env, repo: MockAuthRepo) -> AppState {
    let mut config = AppConfig::default();
    config.env = env;
    config.jwt_secret = common::TEST_JWT_SECRET.to_string();

    let mut registry = ResourceRegistry::new();
    registry.enable_auth(ResourceSchema::new()).unwrap();
    AppState::new(Arc::new(repo), registry, config).await.unwrap()
}

/// Helper to get the mutable Parts struct from a generated Request
fn get_request_parts(method: Method, uri: Uri) -> Parts {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap();
    let (parts, _) = request.into_parts();
    parts
}

fn with_bearer(parts: &mut Parts, token: &str) {
    parts.headers.insert(
        header::AUTHORIZATION,
        header::HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
    );
}

fn with_bypass(parts: &mut Parts, user_id: Uuid) {
    parts.headers.insert(
        header::HeaderName::from_static("x-user-id"),
        header::HeaderValue::from_str(&user_id.to_string()).unwrap(),
    );
}

// --- Extractor Tests ---

#[tokio::test]
async fn test_auth_success_with_valid_jwt() {
    let user_id = Uuid::new_v4();
    let repo = MockAuthRepo {
        user_to_return: Some(user_document(user_id)),
        ..Default::default()
    };
    let app_state = create_app_state(Env::Production, repo).await;

    let mut parts = get_request_parts(Method::GET, "/".parse().unwrap());
    with_bearer(&mut parts, &create_token(user_id, 3600));

    let principal = Principal::from_request_parts(&mut parts, &app_state).await.unwrap();
    assert_eq!(principal.id, user_id);
    assert_eq!(principal.user.fields["email"], "test@example.com");
}

#[tokio::test]
async fn test_auth_failure_with_missing_header() {
    let app_state = create_app_state(Env::Production, MockAuthRepo::default()).await;
    let mut parts = get_request_parts(Method::GET, "/".parse().unwrap());

    let MaybePrincipal(principal) = MaybePrincipal::from_request_parts(&mut parts, &app_state).await.unwrap();
    assert!(principal.is_none());

    let result = Principal::from_request_parts(&mut parts, &app_state).await;
    assert!(matches!(result, Err(ApiError::Unauthorized(_))));
}

#[tokio::test]
async fn test_auth_failure_with_expired_jwt() {
    let user_id = Uuid::new_v4();
    let repo = MockAuthRepo {
        user_to_return: Some(user_document(user_id)),
        ..Default::default()
    };
    let app_state = create_app_state(Env::Production, repo).await;

    let mut parts = get_request_parts(Method::GET, "/".parse().unwrap());
    with_bearer(&mut parts, &create_token(user_id, -3600));

    let MaybePrincipal(principal) = MaybePrincipal::from_request_parts(&mut parts, &app_state).await.unwrap();
    assert!(principal.is_none());
}

#[tokio::test]
async fn test_auth_failure_with_wrong_signature() {
    let user_id = Uuid::new_v4();
    let repo = MockAuthRepo {
        user_to_return: Some(user_document(user_id)),
        ..Default::default()
    };
    let mut app_state = create_app_state(Env::Production, repo).await;
    app_state.config.jwt_secret = "a-different-secret".to_string();

    let mut parts = get_request_parts(Method::GET, "/".parse().unwrap());
    with_bearer(&mut parts, &create_token(user_id, 3600));

    let MaybePrincipal(principal) = MaybePrincipal::from_request_parts(&mut parts, &app_state).await.unwrap();
    assert!(principal.is_none());
}

#[tokio::test]
async fn test_valid_token_for_deleted_user_authenticates_nobody() {
    let app_state = create_app_state(Env::Production, MockAuthRepo::default()).await;

    let mut parts = get_request_parts(Method::GET, "/".parse().unwrap());
    with_bearer(&mut parts, &create_token(Uuid::new_v4(), 3600));

    let MaybePrincipal(principal) = MaybePrincipal::from_request_parts(&mut parts, &app_state).await.unwrap();
    assert!(principal.is_none());
}

#[tokio::test]
async fn test_store_failure_during_lookup_is_upstream() {
    let repo = MockAuthRepo {
        fail: true,
        ..Default::default()
    };
    let app_state = create_app_state(Env::Production, repo).await;

    let mut parts = get_request_parts(Method::GET, "/".parse().unwrap());
    with_bearer(&mut parts, &create_token(Uuid::new_v4(), 3600));

    let result = MaybePrincipal::from_request_parts(&mut parts, &app_state).await;
    assert!(matches!(result, Err(ApiError::Upstream(_))));
}

#[tokio::test]
async fn test_local_bypass_success() {
    let user_id = Uuid::new_v4();
    let repo = MockAuthRepo {
        user_to_return: Some(user_document(user_id)),
        ..Default::default()
    };
    let app_state = create_app_state(Env::Local, repo).await;

    let mut parts = get_request_parts(Method::GET, "/".parse().unwrap());
    with_bypass(&mut parts, user_id);

    let principal = Principal::from_request_parts(&mut parts, &app_state).await.unwrap();
    assert_eq!(principal.id, user_id);
}

#[tokio::test]
async fn test_local_bypass_disabled_in_prod() {
    let user_id = Uuid::new_v4();
    let repo = MockAuthRepo {
        user_to_return: Some(user_document(user_id)),
        ..Default::default()
    };
    let app_state = create_app_state(Env::Production, repo).await;

    let mut parts = get_request_parts(Method::GET, "/".parse().unwrap());
    with_bypass(&mut parts, user_id);

    let result = Principal::from_request_parts(&mut parts, &app_state).await;
    assert!(matches!(result, Err(ApiError::Unauthorized(_))));
}

#[tokio::test]
async fn test_unknown_bypass_user_falls_back_to_bearer() {
    let user_id = Uuid::new_v4();
    let repo = MockAuthRepo {
        user_to_return: Some(user_document(user_id)),
        ..Default::default()
    };
    let app_state = create_app_state(Env::Local, repo).await;

    let mut parts = get_request_parts(Method::GET, "/".parse().unwrap());
    with_bypass(&mut parts, Uuid::new_v4());
    with_bearer(&mut parts, &create_token(user_id, 3600));

    let principal = Principal::from_request_parts(&mut parts, &app_state).await.unwrap();
    assert_eq!(principal.id, user_id);
}

// --- Route-level Tests ---

#[tokio::test]
async fn test_authenticated_route_without_credentials_is_401() {
    let app = spawn_app().await;
    let user = app.create_user("owner@example.com").await;

    let response = app
        .client
        .get(app.url(&format!("/users/{user}/foos")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "UNAUTHENTICATED");
}

#[tokio::test]
async fn test_bearer_token_reaches_authenticated_route() {
    let app = spawn_app().await;
    let user = app.create_user("bearer@example.com").await;

    let response = app
        .client
        .get(app.url("/users?action=me"))
        .bearer_auth(create_token(user, 3600))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["user"]["id"], user.to_string());
    assert_eq!(body["user"]["email"], "bearer@example.com");
    assert_eq!(body["user"]["name"]["first"], "Ada");
}

#[tokio::test]
async fn test_me_action_requires_login() {
    let app = spawn_app().await;
    let response = app.client.get(app.url("/users?action=me")).send().await.unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn test_duplicate_email_conflicts() {
    let app = spawn_app().await;
    app.create_user("same@example.com").await;

    let response = app
        .client
        .post(app.url("/users"))
        .json(&json!({ "email": "same@example.com" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
}

#[tokio::test]
async fn test_foo_owner_reads_and_non_owner_is_rejected() {
    let app = spawn_app().await;
    let owner = app.create_user("owner@example.com").await;
    let intruder = app.create_user("intruder@example.com").await;
    let foo = app.create_foo(owner, "mine").await;

    let response = app
        .client
        .get(app.url(&format!("/foos/{foo}")))
        .header("x-user-id", owner.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["foo"]["user"], owner.to_string());
    assert_eq!(body["foo"]["name"], "mine");

    let response = app
        .client
        .get(app.url(&format!("/foos/{foo}")))
        .header("x-user-id", intruder.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn test_nested_read_many_scoped_to_parent() {
    let app = spawn_app().await;
    let owner = app.create_user("owner@example.com").await;
    let other = app.create_user("other@example.com").await;
    app.create_foo(owner, "a").await;
    app.create_foo(owner, "b").await;
    app.create_foo(other, "c").await;

    let response = app
        .client
        .get(app.url(&format!("/users/{owner}/foos")))
        .header("x-user-id", owner.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    let names: Vec<&str> = body["foos"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, ["a", "b"]);

    // Listing someone else's collection fails the parent check.
    let response = app
        .client
        .get(app.url(&format!("/users/{other}/foos")))
        .header("x-user-id", owner.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn test_nested_create_requires_existing_parent_and_ownership() {
    let app = spawn_app().await;
    let owner = app.create_user("owner@example.com").await;
    let intruder = app.create_user("intruder@example.com").await;

    let response = app
        .client
        .post(app.url(&format!("/users/{}/foos", Uuid::new_v4())))
        .header("x-user-id", owner.to_string())
        .json(&json!({ "name": "orphan" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let response = app
        .client
        .post(app.url(&format!("/users/{owner}/foos")))
        .header("x-user-id", intruder.to_string())
        .json(&json!({ "name": "planted" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn test_nested_create_forces_scope_field() {
    let app = spawn_app().await;
    let owner = app.create_user("owner@example.com").await;
    let other = app.create_user("other@example.com").await;

    let response = app
        .client
        .post(app.url(&format!("/users/{owner}/foos")))
        .header("x-user-id", owner.to_string())
        .json(&json!({ "name": "pinned", "user": other.to_string() }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["foo"]["user"], owner.to_string());
}

#[tokio::test]
async fn test_baz_policy_decides_access() {
    let app = spawn_app().await;
    let owner = app.create_user("owner@example.com").await;
    let intruder = app.create_user("intruder@example.com").await;

    let response = app
        .client
        .post(app.url(&format!("/users/{owner}/bazs")))
        .header("x-user-id", owner.to_string())
        .json(&json!({ "name": "baz" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["baz"]["nested"]["user"], owner.to_string());
    let baz = body["baz"]["id"].as_str().unwrap().to_string();

    let response = app
        .client
        .get(app.url(&format!("/bazs/{baz}")))
        .header("x-user-id", owner.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = app
        .client
        .get(app.url(&format!("/bazs/{baz}")))
        .header("x-user-id", intruder.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn test_user_partial_update_only_by_self() {
    let app = spawn_app().await;
    let user = app.create_user("self@example.com").await;
    let other = app.create_user("other@example.com").await;

    let response = app
        .client
        .post(app.url(&format!("/users/{user}")))
        .header("x-user-id", other.to_string())
        .json(&json!({ "name": { "first": "Mallory" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = app
        .client
        .post(app.url(&format!("/users/{user}")))
        .header("x-user-id", user.to_string())
        .json(&json!({ "name": { "first": "Grace" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    // Groups are merged, so the untouched last name survives.
    assert_eq!(body["user"]["name"]["first"], "Grace");
    assert_eq!(body["user"]["name"]["last"], "Lovelace");
    assert_eq!(body["user"]["email"], "self@example.com");
}

#[tokio::test]
async fn test_user_partial_update_cannot_clear_email() {
    let app = spawn_app().await;
    let user = app.create_user("keep@example.com").await;

    let response = app
        .client
        .post(app.url(&format!("/users/{user}")))
        .header("x-user-id", user.to_string())
        .json(&json!({ "email": null }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "VALIDATION_FAILED");

    let response = app
        .client
        .get(app.url("/users?action=me"))
        .header("x-user-id", user.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["user"]["email"], "keep@example.com");
}
