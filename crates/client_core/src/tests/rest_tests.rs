use super::*;
use std::sync::Mutex as StdMutex;

use axum::{
    extract::{Multipart, Query},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;

const APP_KEY: &str = "demo-app-key";
const APP_SECRET: &str = "shhh-secret";

async fn spawn_server(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

fn gateway(base_url: &str) -> RestGateway {
    RestGateway::new(base_url, APP_KEY, APP_SECRET, Duration::from_secs(5)).expect("gateway")
}

fn browser_key() -> BrowserKey {
    BrowserKey("bk-test".to_string())
}

#[tokio::test]
async fn config_fetch_sends_signature_as_query_params() {
    let seen: Arc<StdMutex<Option<HashMap<String, String>>>> = Arc::new(StdMutex::new(None));
    let route_seen = Arc::clone(&seen);
    let app = Router::new().route(
        "/config",
        get(move |Query(params): Query<HashMap<String, String>>| {
            let seen = Arc::clone(&route_seen);
            async move {
                *seen.lock().expect("seen") = Some(params);
                Json(json!({
                    "app_name": "demo",
                    "is_active": true,
                    "settings": {"theme": "dark"},
                    "required_fields": [
                        {"name": "name"},
                        {"name": "company", "required": false}
                    ],
                    "socket_url": "ws://localhost:6001",
                    "socket_api_key": "sock-key"
                }))
            }
        }),
    );
    let base_url = spawn_server(app).await;

    let config = gateway(&base_url).get_config().await.expect("config");

    assert_eq!(config.app_name, "demo");
    assert!(config.is_active);
    assert_eq!(config.required_fields.len(), 2);
    assert!(config.required_fields[0].required);
    assert!(!config.required_fields[1].required);

    let params = seen.lock().expect("seen").clone().expect("params");
    assert_eq!(params.get("key").map(String::as_str), Some(APP_KEY));
    assert_eq!(
        params.get("sig").map(String::as_str),
        Some(signature::sign(APP_KEY, APP_SECRET).as_str())
    );
}

#[tokio::test]
async fn posts_carry_signature_headers() {
    let seen: Arc<StdMutex<Option<(Option<String>, Option<String>)>>> =
        Arc::new(StdMutex::new(None));
    let route_seen = Arc::clone(&seen);
    let app = Router::new().route(
        "/register-browser",
        post(move |headers: HeaderMap| {
            let seen = Arc::clone(&route_seen);
            async move {
                let header = |name: &str| {
                    headers
                        .get(name)
                        .and_then(|value| value.to_str().ok())
                        .map(str::to_string)
                };
                *seen.lock().expect("seen") =
                    Some((header("x-chat-signature"), header("x-chat-app-key")));
                Json(json!({ "success": true, "browser_key": "bk-new" }))
            }
        }),
    );
    let base_url = spawn_server(app).await;

    let response = gateway(&base_url)
        .register_browser(&HashMap::new(), None)
        .await
        .expect("register");
    assert_eq!(response.browser_key.0, "bk-new");

    let (sig, key) = seen.lock().expect("seen").clone().expect("headers");
    assert_eq!(sig, Some(signature::sign(APP_KEY, APP_SECRET)));
    assert_eq!(key, Some(APP_KEY.to_string()));
}

#[tokio::test]
async fn validation_errors_map_is_joined() {
    let app = Router::new().route(
        "/send-message",
        post(|| async {
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({
                    "errors": {
                        "name": ["Name is required"],
                        "phone": ["Phone is required"]
                    }
                })),
            )
        }),
    );
    let base_url = spawn_server(app).await;

    let err = gateway(&base_url)
        .send_message(&browser_key(), "hi", None, None)
        .await
        .expect_err("rejected");

    match err {
        ChatError::Server { status, message } => {
            assert_eq!(status, 422);
            assert!(message.contains("Name is required"), "{message}");
            assert!(message.contains("Phone is required"), "{message}");
            assert!(message.contains("; "), "{message}");
        }
        other => panic!("expected server error, got {other:?}"),
    }
}

#[tokio::test]
async fn single_error_field_wins_over_message() {
    let app = Router::new().route(
        "/send-message",
        post(|| async {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "nope", "message": "ignored" })),
            )
        }),
    );
    let base_url = spawn_server(app).await;

    let err = gateway(&base_url)
        .send_message(&browser_key(), "hi", None, None)
        .await
        .expect_err("rejected");
    match err {
        ChatError::Server { message, .. } => assert_eq!(message, "nope"),
        other => panic!("expected server error, got {other:?}"),
    }
}

#[tokio::test]
async fn unstructured_body_falls_back_to_status_text() {
    let app = Router::new().route(
        "/send-message",
        post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
    );
    let base_url = spawn_server(app).await;

    let err = gateway(&base_url)
        .send_message(&browser_key(), "hi", None, None)
        .await
        .expect_err("rejected");
    match err {
        ChatError::Server { status, message } => {
            assert_eq!(status, 500);
            assert!(message.contains("500"), "{message}");
        }
        other => panic!("expected server error, got {other:?}"),
    }
}

#[tokio::test]
async fn slow_server_classifies_as_timeout() {
    let app = Router::new().route(
        "/send-message",
        post(|| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Json(json!({ "success": true }))
        }),
    );
    let base_url = spawn_server(app).await;

    let gateway =
        RestGateway::new(&base_url, APP_KEY, APP_SECRET, Duration::from_millis(200))
            .expect("gateway");
    let err = gateway
        .send_message(&browser_key(), "hi", None, None)
        .await
        .expect_err("timed out");
    assert!(matches!(err, ChatError::Timeout), "{err:?}");
}

#[tokio::test]
async fn history_page_parses_with_pagination() {
    let app = Router::new().route(
        "/messages",
        post(|Json(body): Json<Value>| async move {
            assert_eq!(body["page"], json!(2));
            assert_eq!(body["per_page"], json!(10));
            Json(json!({
                "messages": [{
                    "id": 5, "chat_id": 9, "content": "hello",
                    "sender_type": "staff", "sender_name": "Amira",
                    "created_at": "2026-01-05T10:00:00Z"
                }],
                "pagination": {
                    "total": 25, "current_page": 2, "per_page": 10,
                    "last_page": 3, "has_more": true
                }
            }))
        }),
    );
    let base_url = spawn_server(app).await;

    let page = gateway(&base_url)
        .get_messages(&browser_key(), 2, 10)
        .await
        .expect("history");

    assert_eq!(page.messages.len(), 1);
    assert_eq!(page.messages[0].content, "hello");
    assert_eq!(
        page.pagination.has_more,
        page.pagination.current_page < page.pagination.last_page
    );
}

#[tokio::test]
async fn edit_message_round_trips_the_edited_body() {
    let app = Router::new().route(
        "/edit-message",
        post(|Json(body): Json<Value>| async move {
            assert_eq!(body["chat_app_key"], json!(APP_KEY));
            assert_eq!(body["browser_key"], json!("bk-test"));
            assert_eq!(body["message_id"], json!(42));
            assert_eq!(body["content"], json!("fixed typo"));
            Json(json!({
                "success": true,
                "message": {
                    "id": 42,
                    "content": "fixed typo",
                    "edited": true,
                    "edited_at": "2026-04-01T10:00:00Z"
                }
            }))
        }),
    );
    let base_url = spawn_server(app).await;

    let edited = gateway(&base_url)
        .edit_message(&browser_key(), MessageId(42), "fixed typo")
        .await
        .expect("edit");
    assert_eq!(edited.message.id, MessageId(42));
    assert_eq!(edited.message.content, "fixed typo");
    assert!(edited.message.edited);
    assert!(edited.message.edited_at.is_some());
}

#[tokio::test]
async fn update_browser_replaces_the_profile() {
    let app = Router::new().route(
        "/browser/update",
        post(|Json(body): Json<Value>| async move {
            assert_eq!(body["browser_key"], json!("bk-test"));
            assert_eq!(body["user_data"]["name"], json!("Dana"));
            Json(json!({ "success": true, "chat_id": 88 }))
        }),
    );
    let base_url = spawn_server(app).await;

    let user_data = HashMap::from([("name".to_string(), json!("Dana"))]);
    let response = gateway(&base_url)
        .update_browser(&browser_key(), &user_data)
        .await
        .expect("update");
    assert!(response.success);
    assert_eq!(response.chat_id.map(|id| id.0), Some(88));
    assert!(response.last_messages.is_none());
}

#[tokio::test]
async fn update_user_data_returns_the_merged_profile() {
    let app = Router::new().route(
        "/browser/update-data",
        post(|Json(body): Json<Value>| async move {
            assert_eq!(body["browser_key"], json!("bk-test"));
            assert_eq!(body["data"]["phone"], json!("+100200300"));
            Json(json!({
                "success": true,
                "user_data": { "name": "Dana", "phone": "+100200300" },
                "message": "updated"
            }))
        }),
    );
    let base_url = spawn_server(app).await;

    let partial = HashMap::from([("phone".to_string(), json!("+100200300"))]);
    let response = gateway(&base_url)
        .update_user_data(&browser_key(), &partial)
        .await
        .expect("update");
    assert_eq!(response.user_data.get("name"), Some(&json!("Dana")));
    assert_eq!(response.user_data.get("phone"), Some(&json!("+100200300")));
    assert_eq!(response.message.as_deref(), Some("updated"));
}

#[tokio::test]
async fn upload_reports_progress_and_delivers_bytes() {
    let received: Arc<StdMutex<Vec<u8>>> = Arc::new(StdMutex::new(Vec::new()));
    let route_received = Arc::clone(&received);
    let app = Router::new().route(
        "/upload-image",
        post(move |mut multipart: Multipart| {
            let received = Arc::clone(&route_received);
            async move {
                let mut saw_app_key = false;
                while let Some(field) = multipart.next_field().await.expect("field") {
                    match field.name() {
                        Some("chat_app_key") => {
                            assert_eq!(field.text().await.expect("text"), APP_KEY);
                            saw_app_key = true;
                        }
                        Some("image") => {
                            let bytes = field.bytes().await.expect("bytes");
                            received.lock().expect("received").extend_from_slice(&bytes);
                        }
                        _ => {
                            let _ = field.bytes().await;
                        }
                    }
                }
                assert!(saw_app_key);
                Json(json!({ "image_url": "https://cdn.example.com/up.png" }))
            }
        }),
    );
    let base_url = spawn_server(app).await;

    let payload: Vec<u8> = (0..200_000u32).map(|n| (n % 251) as u8).collect();
    let expected = payload.clone();
    let progress_log: Arc<StdMutex<Vec<(u64, u64)>>> = Arc::new(StdMutex::new(Vec::new()));
    let progress_sink = Arc::clone(&progress_log);
    let progress: ProgressCallback = Arc::new(move |sent, total| {
        progress_sink.lock().expect("progress").push((sent, total));
    });

    let response = gateway(&base_url)
        .upload_attachment(&browser_key(), payload, "up.png", None, Some(progress), None)
        .await
        .expect("upload");
    assert_eq!(response.image_url, "https://cdn.example.com/up.png");
    assert_eq!(*received.lock().expect("received"), expected);

    let log = progress_log.lock().expect("progress").clone();
    assert!(!log.is_empty());
    assert!(log.windows(2).all(|pair| pair[0].0 <= pair[1].0));
    let (last_sent, total) = *log.last().expect("last");
    assert_eq!(last_sent, expected.len() as u64);
    assert_eq!(total, expected.len() as u64);
}

#[tokio::test]
async fn cancelled_upload_surfaces_cancellation_not_timeout() {
    let app = Router::new().route(
        "/upload-image",
        post(|| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Json(json!({ "image_url": "never" }))
        }),
    );
    let base_url = spawn_server(app).await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = gateway(&base_url)
        .upload_attachment(
            &browser_key(),
            vec![7u8; 256 * 1024],
            "big.bin",
            None,
            None,
            Some(cancel),
        )
        .await
        .expect_err("cancelled");
    assert!(matches!(err, ChatError::UploadCancelled), "{err:?}");
}
