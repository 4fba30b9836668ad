mod common;

use common::spawn_app;
use serde_json::{Value, json};
use uuid::Uuid;

async fn create_bar(app: &common::TestApp, name: &str) -> Value {
    let response = app
        .client
        .post(app.url("/bars"))
        .json(&json!({ "name": name }))
        .send()
        .await
        .expect("post bar failed");
    assert_eq!(response.status(), 201);
    let body: Value = response.json().await.unwrap();
    body["bar"].clone()
}

#[tokio::test]
async fn test_health_check() {
    let app = spawn_app().await;
    let response = app
        .client
        .get(format!("{}/health", app.address))
        .send()
        .await
        .expect("req fail");
    assert!(response.status().is_success());
    assert_eq!(response.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn test_bar_create_assigns_id_and_equal_timestamps() {
    let app = spawn_app().await;
    let bar = create_bar(&app, "first").await;

    assert_eq!(bar["name"], "first");
    assert!(Uuid::parse_str(bar["id"].as_str().unwrap()).is_ok());
    assert_eq!(bar["timestampCreated"], bar["timestampUpdated"]);

    let other = create_bar(&app, "second").await;
    assert_ne!(bar["id"], other["id"]);
}

#[tokio::test]
async fn test_bar_create_ignores_uneditable_system_fields() {
    let app = spawn_app().await;
    let forged_id = Uuid::new_v4().to_string();
    let response = app
        .client
        .post(app.url("/bars"))
        .json(&json!({
            "name": "forged",
            "id": forged_id,
            "timestampCreated": "2001-01-01T00:00:00Z",
            "timestampUpdated": "2001-01-01T00:00:00Z",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let body: Value = response.json().await.unwrap();

    assert_ne!(body["bar"]["id"], forged_id.as_str());
    assert!(!body["bar"]["timestampCreated"].as_str().unwrap().starts_with("2001"));
}

#[tokio::test]
async fn test_bar_duplicate_unique_name_conflicts() {
    let app = spawn_app().await;
    create_bar(&app, "taken").await;

    let response = app
        .client
        .post(app.url("/bars"))
        .json(&json!({ "name": "taken" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "ALREADY_EXISTS");
}

#[tokio::test]
async fn test_bar_unknown_field_is_validation_error() {
    let app = spawn_app().await;
    let response = app
        .client
        .post(app.url("/bars"))
        .json(&json!({ "name": "x", "colour": "red" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "VALIDATION_FAILED");
}

#[tokio::test]
async fn test_bar_type_mismatch_and_malformed_body() {
    let app = spawn_app().await;
    let response = app
        .client
        .post(app.url("/bars"))
        .json(&json!({ "name": 42 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = app
        .client
        .post(app.url("/bars"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_bar_read_and_not_found() {
    let app = spawn_app().await;
    let bar = create_bar(&app, "readable").await;
    let id = bar["id"].as_str().unwrap();

    let response = app.client.get(app.url(&format!("/bars/{id}"))).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["bar"], bar);

    let response = app
        .client
        .get(app.url(&format!("/bars/{}", Uuid::new_v4())))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "NOT_FOUND");

    // Ids that are not UUIDs cannot exist.
    let response = app.client.get(app.url("/bars/not-a-uuid")).send().await.unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_bar_partial_update_keeps_other_fields_and_advances_timestamp() {
    let app = spawn_app().await;
    let bar = create_bar(&app, "before").await;
    let id = bar["id"].as_str().unwrap();

    let response = app
        .client
        .post(app.url(&format!("/bars/{id}")))
        .json(&json!({ "name": "after", "timestampUpdated": "2001-01-01T00:00:00Z" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let updated: Value = response.json().await.unwrap();
    let updated = &updated["bar"];

    assert_eq!(updated["name"], "after");
    assert_eq!(updated["id"], bar["id"]);
    assert_eq!(updated["timestampCreated"], bar["timestampCreated"]);
    // RFC 3339 UTC strings at fixed precision order lexicographically.
    assert!(updated["timestampUpdated"].as_str().unwrap() > bar["timestampUpdated"].as_str().unwrap());

    // An empty partial update changes nothing but the timestamp.
    let response = app
        .client
        .post(app.url(&format!("/bars/{id}")))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let again: Value = response.json().await.unwrap();
    assert_eq!(again["bar"]["name"], "after");
    assert!(again["bar"]["timestampUpdated"].as_str().unwrap() > updated["timestampUpdated"].as_str().unwrap());
}

#[tokio::test]
async fn test_bar_update_replaces_editable_fields() {
    let app = spawn_app().await;
    let bar = create_bar(&app, "replace-me").await;
    let id = bar["id"].as_str().unwrap();

    let response = app
        .client
        .put(app.url(&format!("/bars/{id}")))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert!(body["bar"].get("name").is_none());
    assert_eq!(body["bar"]["timestampCreated"], bar["timestampCreated"]);

    // The cleared unique value can be reused.
    create_bar(&app, "replace-me").await;
}

#[tokio::test]
async fn test_bar_update_into_taken_name_conflicts() {
    let app = spawn_app().await;
    create_bar(&app, "one").await;
    let two = create_bar(&app, "two").await;

    let response = app
        .client
        .put(app.url(&format!("/bars/{}", two["id"].as_str().unwrap())))
        .json(&json!({ "name": "one" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
}

#[tokio::test]
async fn test_bar_delete_twice() {
    let app = spawn_app().await;
    let bar = create_bar(&app, "short-lived").await;
    let url = app.url(&format!("/bars/{}", bar["id"].as_str().unwrap()));

    let first = app.client.delete(&url).send().await.unwrap();
    assert_eq!(first.status(), 204);

    let second = app.client.delete(&url).send().await.unwrap();
    assert_eq!(second.status(), 404);

    let read = app.client.get(&url).send().await.unwrap();
    assert_eq!(read.status(), 404);
}

#[tokio::test]
async fn test_bar_read_many_pagination_in_creation_order() {
    let app = spawn_app().await;
    for i in 0..5 {
        create_bar(&app, &format!("bar-{i}")).await;
    }

    let response = app.client.get(app.url("/bars")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["bars"].as_array().unwrap().len(), 5);
    assert_eq!(body["offset"], 0);
    assert_eq!(body["limit"], 10);

    let response = app
        .client
        .get(app.url("/bars?offset=1&limit=2"))
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    let names: Vec<&str> = body["bars"]
        .as_array()
        .unwrap()
        .iter()
        .map(|b| b["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, ["bar-1", "bar-2"]);
    assert_eq!(body["offset"], 1);
    assert_eq!(body["limit"], 2);

    let response = app.client.get(app.url("/bars?limit=1000")).send().await.unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["limit"], 100);

    let response = app
        .client
        .get(app.url(&format!("/bars?offset={}", u64::MAX)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert!(body["bars"].as_array().unwrap().is_empty());
    assert_eq!(body["offset"], i64::MAX);
}

#[tokio::test]
async fn test_read_many_rejects_bad_query_and_unknown_action() {
    let app = spawn_app().await;

    let response = app.client.get(app.url("/bars?limit=lots")).send().await.unwrap();
    assert_eq!(response.status(), 400);

    let response = app.client.get(app.url("/bars?action=explode")).send().await.unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "VALIDATION_FAILED");
}

#[tokio::test]
async fn test_user_create_requires_email_and_known_group_fields() {
    let app = spawn_app().await;
    let response = app
        .client
        .post(app.url("/users"))
        .json(&json!({ "name": { "first": "No", "last": "Email" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    let response = app
        .client
        .post(app.url("/users"))
        .json(&json!({ "email": "nested@example.com", "name": { "middle": "X" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_clear_data_removes_everything() {
    let app = spawn_app().await;
    create_bar(&app, "doomed").await;

    let response = app.client.get(app.url("/clearData")).send().await.unwrap();
    assert_eq!(response.status(), 200);

    let body: Value = app
        .client
        .get(app.url("/bars"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(body["bars"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_clear_data_absent_in_production() {
    let app = common::spawn_app_with(
        std::sync::Arc::new(resource_router::InMemoryRepository::new()),
        resource_router::config::Env::Production,
    )
    .await;
    let response = app.client.get(app.url("/clearData")).send().await.unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_openapi_document_is_served() {
    let app = spawn_app().await;
    let response = app
        .client
        .get(format!("{}/api-docs/openapi.json", app.address))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let doc: Value = response.json().await.unwrap();
    assert!(doc["paths"]["/api/v1/bars/{id}"]["put"].is_object());
    assert!(doc["paths"]["/api/v1/users/{id}/foos"]["post"].is_object());
}
