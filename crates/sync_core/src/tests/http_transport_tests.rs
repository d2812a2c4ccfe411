use std::sync::{Arc, Mutex};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use shared::{
    domain::{ConversationId, ConversationKind, DeviceId},
    model::ReadPosition,
    protocol::{Priority, PullDirection},
};
use tokio::net::TcpListener;

use super::*;

#[derive(Clone, Default)]
struct ServerState {
    pulls: Arc<Mutex<Vec<PullMessagesRequest>>>,
    identity_lookups: Arc<Mutex<Vec<i64>>>,
}

async fn download(Path(key): Path<String>) -> Response {
    if key == "missing" {
        return (
            StatusCode::NOT_FOUND,
            Json(ApiError::new(ErrorCode::NotFound, "no such attachment")),
        )
            .into_response();
    }
    format!("bytes-of-{key}").into_response()
}

async fn receipts(Json(request): Json<SendReceiptsRequest>) -> Response {
    if request.batch.sender == UserId(10) {
        return (StatusCode::CONFLICT, Json(ApiError::identity_mismatch(10))).into_response();
    }
    Json(Ack {
        accepted: request.batch.timestamps.len() as u32,
    })
    .into_response()
}

async fn read_sync(Json(_request): Json<SyncReadCursorRequest>) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError::new(ErrorCode::Internal, "database unavailable")),
    )
        .into_response()
}

async fn pull(
    State(state): State<ServerState>,
    Path(_id): Path<i64>,
    Json(request): Json<PullMessagesRequest>,
) -> StatusCode {
    state.pulls.lock().expect("pulls lock").push(request);
    StatusCode::ACCEPTED
}

async fn identity(State(state): State<ServerState>, Path(id): Path<i64>) -> StatusCode {
    state
        .identity_lookups
        .lock()
        .expect("lookups lock")
        .push(id);
    StatusCode::OK
}

async fn spawn_sync_server() -> (String, ServerState) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let state = ServerState::default();
    let app = Router::new()
        .route("/attachments/:key", get(download))
        .route("/receipts", post(receipts))
        .route("/read-sync", post(read_sync))
        .route("/conversations/:id/pull", post(pull))
        .route("/users/:id/identity", get(identity))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

fn batch(sender: i64) -> ReadReceiptBatch {
    ReadReceiptBatch {
        sender: UserId(sender),
        timestamps: vec![100, 200],
        read_position: ReadPosition {
            source_device: DeviceId(1),
            conversation_id: ConversationId(5),
            sender: Some(UserId(sender)),
            sent_at: 200,
            read_at: 300,
            max_server_timestamp: 205,
            max_notify_sequence_id: 0,
            group_id: None,
        },
    }
}

#[tokio::test]
async fn download_returns_body_bytes() {
    let (url, _state) = spawn_sync_server().await;
    let transport = HttpSyncTransport::new(&url).expect("transport");

    let bytes = transport
        .download_attachment(&Attachment {
            cdn_key: "abc".into(),
            ..Attachment::default()
        })
        .await
        .expect("download");
    assert_eq!(bytes, b"bytes-of-abc");
}

#[tokio::test]
async fn missing_content_is_permanent() {
    let (url, _state) = spawn_sync_server().await;
    let transport = HttpSyncTransport::new(&url).expect("transport");

    let err = transport
        .download_attachment(&Attachment {
            cdn_key: "missing".into(),
            ..Attachment::default()
        })
        .await
        .expect_err("404");
    assert!(matches!(err, SyncError::PermanentContent(_)));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn identity_conflict_maps_to_identity_mismatch() {
    let (url, _state) = spawn_sync_server().await;
    let transport = HttpSyncTransport::new(&url).expect("transport");

    let err = transport
        .send_read_receipts(&batch(10), &ReceiptExtension::default())
        .await
        .expect_err("conflict");
    assert!(matches!(err, SyncError::IdentityMismatch { user_id: 10 }));

    let ack = transport
        .send_read_receipts(&batch(11), &ReceiptExtension::default())
        .await
        .expect("accepted");
    assert_eq!(ack.accepted, 2);
}

#[tokio::test]
async fn server_errors_are_transient() {
    let (url, _state) = spawn_sync_server().await;
    let transport = HttpSyncTransport::new(&url).expect("transport");

    let err = transport
        .sync_read_cursor(&[], &ReceiptExtension::default())
        .await
        .expect_err("500");
    assert!(matches!(err, SyncError::TransientNetwork(ref msg) if msg.contains("database unavailable")));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn pull_and_identity_refresh_hit_their_endpoints() {
    let (url, state) = spawn_sync_server().await;
    let transport = HttpSyncTransport::new(&format!("{url}/")).expect("transport");
    let window = SequenceRange::new(71, 120).expect("window");

    transport
        .pull_messages(
            ConversationRef {
                conversation_id: ConversationId(5),
                kind: ConversationKind::Group,
            },
            window,
            PullOptions {
                direction: PullDirection::Newer,
                priority: Priority::High,
            },
        )
        .await
        .expect("pull");
    transport
        .refresh_identity(UserId(42))
        .await
        .expect("refresh identity");

    let pulls = state.pulls.lock().expect("pulls lock");
    assert_eq!(pulls.len(), 1);
    assert_eq!(pulls[0].window, window);
    assert_eq!(pulls[0].priority, Priority::High);
    assert_eq!(*state.identity_lookups.lock().expect("lookups lock"), vec![42]);
}

#[tokio::test]
async fn unreachable_server_is_transient() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    let transport = HttpSyncTransport::new(&format!("http://{addr}")).expect("transport");

    let err = transport
        .refresh_identity(UserId(1))
        .await
        .expect_err("connection refused");
    assert!(matches!(err, SyncError::TransientNetwork(_)));
}
