#![allow(dead_code)]

use jsonwebtoken::{EncodingKey, Header, encode};
use resource_router::{
    AppConfig, AppState, InMemoryRepository, RepositoryState, auth::Claims, config::Env, create_router,
    sample::sample_api,
};
use serde_json::{Value, json};
use std::{sync::Arc, time::SystemTime};
use tokio::net::TcpListener;
use uuid::Uuid;

pub const TEST_JWT_SECRET: &str = "test-secret-value-1234567890";

pub struct TestApp {
    pub address: String,
    pub client: reqwest::Client,
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.address, path)
    }

    /// Signs up a user through the public create route and returns its id.
    pub async fn create_user(&self, email: &str) -> Uuid {
        let response = self
            .client
            .post(self.url("/users"))
            .json(&json!({ "email": email, "name": { "first": "Ada", "last": "Lovelace" } }))
            .send()
            .await
            .expect("post user failed");
        assert_eq!(response.status(), 201);
        let body: Value = response.json().await.unwrap();
        body["user"]["id"].as_str().unwrap().parse().unwrap()
    }

    /// Creates a Foo owned by `user` via the nested route.
    pub async fn create_foo(&self, user: Uuid, name: &str) -> Uuid {
        let response = self
            .client
            .post(self.url(&format!("/users/{user}/foos")))
            .header("x-user-id", user.to_string())
            .json(&json!({ "name": name }))
            .send()
            .await
            .expect("post foo failed");
        assert_eq!(response.status(), 201);
        let body: Value = response.json().await.unwrap();
        body["foo"]["id"].as_str().unwrap().parse().unwrap()
    }
}

/// Serves the sample resources on an ephemeral port with an in-memory store.
pub async fn spawn_app() -> TestApp {
    spawn_app_with(Arc::new(InMemoryRepository::new()), Env::Local).await
}

pub async fn spawn_app_with(repo: RepositoryState, env: Env) -> TestApp {
    let mut config = AppConfig::default();
    config.env = env;
    config.jwt_secret = TEST_JWT_SECRET.to_string();

    let (registry, routes) = sample_api(&config.api_path).expect("sample resources are valid");
    let state = AppState::new(repo, registry, config)
        .await
        .expect("Failed to prepare collections");
    let router = create_router(state, &routes);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind port");
    let port = listener.local_addr().unwrap().port();
    let address = format!("http://127.0.0.1:{}", port);

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    TestApp {
        address,
        client: reqwest::Client::new(),
    }
}

/// An HS256 token for `user_id` expiring `exp_offset` seconds from now
/// (negative offsets produce an already expired token).
pub fn create_token(user_id: Uuid, exp_offset: i64) -> String {
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;

    let claims = Claims {
        sub: user_id,
        iat: now as usize,
        exp: (now + exp_offset) as usize,
    };

    let key = EncodingKey::from_secret(TEST_JWT_SECRET.as_bytes());
    encode(&Header::default(), &claims, &key).unwrap()
}
