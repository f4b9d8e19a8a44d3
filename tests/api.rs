mod common;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use branch_queue::api::routes::create_router;
use branch_queue::model::BranchAction;
use branch_queue::store::BranchQueueStore;
use common::MemoryQueueStore;

fn app(store: &Arc<MemoryQueueStore>) -> Router {
    let state: Arc<dyn BranchQueueStore> = store.clone();
    create_router().with_state(state)
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-user-id", "12")
        .header("x-user-name", "Dana")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health_check() {
    let store = MemoryQueueStore::new();
    let (status, body) = send(app(&store), get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_enqueue_fills_requester() {
    let store = MemoryQueueStore::new();
    let (status, body) = send(
        app(&store),
        post_json(
            "/branch-queue",
            json!({
                "name": "Spring campaign",
                "action": "create",
                "data": {
                    "databaseName": "shop_spring",
                    "entities": [{"entityType": "product", "mode": "Recent", "amountOfItems": 50}]
                }
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["id"], 1);

    let entry = store.entry(1).unwrap();
    assert_eq!(entry.action, BranchAction::Create);
    assert_eq!(entry.user_id, 12);
    assert_eq!(entry.added_by, "Dana");
    assert!(entry.started_on.is_none());
    assert!(entry.create_settings().is_ok());
}

#[tokio::test]
async fn test_enqueue_rejects_invalid_settings() {
    let store = MemoryQueueStore::new();
    let (status, body) = send(
        app(&store),
        post_json(
            "/branch-queue",
            json!({
                "name": "Spring campaign",
                "action": "create",
                "data": {
                    "databaseName": "shop_spring",
                    "entities": [{"entityType": "product", "mode": "Random"}]
                }
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("amount of items"));
    assert!(store.entry(1).is_none());
}

#[tokio::test]
async fn test_enqueue_rejects_non_numeric_user_id() {
    let store = MemoryQueueStore::new();
    let request = Request::builder()
        .method("POST")
        .uri("/branch-queue")
        .header("content-type", "application/json")
        .header("x-user-id", "dana")
        .body(Body::from(
            json!({"name": "old", "action": "delete", "data": {"databaseName": "shop_old"}}).to_string(),
        ))
        .unwrap();

    let (status, _) = send(app(&store), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_get_and_list_entries() {
    let store = MemoryQueueStore::new();
    for name in ["shop_a", "shop_b"] {
        let (status, _) = send(
            app(&store),
            post_json(
                "/branch-queue",
                json!({"name": name, "action": "delete", "data": {"databaseName": name}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, body) = send(app(&store), get("/branch-queue/2")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "shop_b");
    assert_eq!(body["action"], "delete");

    let (status, body) = send(app(&store), get("/branch-queue/9")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("#9"));

    let (status, body) = send(app(&store), get("/branch-queue?limit=1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["items"][0]["id"], 2);
}
