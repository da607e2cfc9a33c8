//! Router harness shared by the REST integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use parley_api::{AppStateInner, router};
use parley_db::{Database, RoomStore};
use parley_gateway::dispatcher::Dispatcher;
use parley_gateway::presence::{PresenceMode, PresenceRegistry};
use parley_types::policy::HierarchyPolicy;

pub const SECRET: &str = "rest-api-test-secret";
pub const PASSWORD: &str = "correct-horse";

pub struct Harness {
    pub app: Router,
    pub rooms: Arc<RoomStore>,
    pub presence: PresenceRegistry,
}

impl Harness {
    pub fn db(&self) -> &Database {
        self.rooms.database()
    }
}

pub fn harness() -> Harness {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let rooms = Arc::new(RoomStore::new(db.clone(), Arc::new(HierarchyPolicy)));
    let presence = PresenceRegistry::new(Dispatcher::new(), PresenceMode::Counted);

    let state = Arc::new(AppStateInner {
        db,
        rooms: rooms.clone(),
        presence: presence.clone(),
        jwt_secret: SECRET.to_string(),
        token_ttl: chrono::Duration::hours(1),
    });

    Harness {
        app: router(state),
        rooms,
        presence,
    }
}

pub async fn call(app: &Router, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    call_raw(app, method, uri, token, body.map(|b| b.to_string())).await
}

/// Like [`call`], but sends `body` verbatim so malformed JSON can be tested.
pub async fn call_raw(
    app: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<String>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

pub async fn login(app: &Router, email: &str, password: &str) -> (StatusCode, Value) {
    call(
        app,
        Method::POST,
        "/api/auth/login",
        None,
        Some(json!({ "email": email, "password": password })),
    )
    .await
}

pub async fn register_and_login(app: &Router, email: &str) -> String {
    let (status, _) = call(
        app,
        Method::POST,
        "/api/auth/signup",
        None,
        Some(json!({ "name": email, "email": email, "password": PASSWORD })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = login(app, email, PASSWORD).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["email"], email);
    body["token"].as_str().unwrap().to_string()
}
