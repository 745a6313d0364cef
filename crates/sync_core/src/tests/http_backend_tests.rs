use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{delete, get, post},
    Json, Router,
};
use shared::error::ErrorCode;
use tokio::{net::TcpListener, sync::Mutex};

use super::*;
use crate::fixtures::{channel, message, reaction, reply};

#[derive(Clone, Default)]
struct ServerState {
    sent: Arc<Mutex<Vec<SendMessageRequest>>>,
    auth: Arc<Mutex<Vec<String>>>,
}

async fn list_messages(
    State(state): State<ServerState>,
    Path((kind, id)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Message>>, (StatusCode, Json<ApiError>)> {
    if let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        state.auth.lock().await.push(value.to_string());
    }
    if kind != "channel" {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ApiError::new(ErrorCode::NotFound, format!("no {kind} {id}"))),
        ));
    }
    let limit: usize = query
        .get("limit")
        .and_then(|limit| limit.parse().ok())
        .unwrap_or(usize::MAX);
    let scope = channel(&id);
    let messages = vec![message("m1", &scope, 1), message("m2", &scope, 2)];
    Ok(Json(messages.into_iter().take(limit).collect()))
}

async fn list_replies(Path(id): Path<String>) -> Json<Vec<Message>> {
    Json(vec![reply("r1", &id, &channel("ch1"), 3)])
}

async fn list_reactions(Query(query): Query<HashMap<String, String>>) -> Json<Vec<Reaction>> {
    let ids = query.get("message_ids").cloned().unwrap_or_default();
    Json(
        ids.split(',')
            .map(|id| reaction(&format!("x-{id}"), id, "u2", "👍"))
            .collect(),
    )
}

async fn create_message(
    State(state): State<ServerState>,
    Json(request): Json<SendMessageRequest>,
) -> Json<MutationAck> {
    state.sent.lock().await.push(request);
    Json(MutationAck {
        id: Some("srv-1".into()),
    })
}

async fn add_reaction(Path(id): Path<String>) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::CONFLICT,
        Json(ApiError::new(
            ErrorCode::Conflict,
            format!("already reacted to {id}"),
        )),
    )
}

async fn remove_reaction(Path(_id): Path<String>) -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn serve() -> (String, ServerState) {
    let state = ServerState::default();
    let app = Router::new()
        .route("/api/scopes/:kind/:id/messages", get(list_messages))
        .route("/api/messages/:id/replies", get(list_replies))
        .route("/api/reactions", get(list_reactions))
        .route("/api/messages", post(create_message))
        .route("/api/messages/:id/reactions", post(add_reaction))
        .route("/api/reactions/:id", delete(remove_reaction))
        .with_state(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (format!("http://{addr}/api/"), state)
}

#[tokio::test]
async fn fetches_messages_with_limit_and_token() {
    let (base, state) = serve().await;
    let backend = HttpBackend::new(&base).expect("backend").with_token("secret");

    let messages = backend
        .fetch_top_level_messages(&channel("ch1"), 1)
        .await
        .expect("fetch");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id.as_str(), "m1");
    assert_eq!(state.auth.lock().await.as_slice(), ["Bearer secret"]);

    let replies = backend
        .fetch_thread_children(&"p1".into())
        .await
        .expect("replies");
    assert_eq!(replies[0].parent_id, Some(MessageId::from("p1")));
}

#[tokio::test]
async fn fetches_reactions_for_many_messages() {
    let (base, _state) = serve().await;
    let backend = HttpBackend::new(&base).expect("backend");

    let reactions = backend
        .fetch_reactions(&["m1".into(), "m2".into()])
        .await
        .expect("reactions");
    let ids: Vec<&str> = reactions.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["x-m1", "x-m2"]);
    assert!(backend.fetch_reactions(&[]).await.expect("empty").is_empty());
}

#[tokio::test]
async fn send_carries_client_reference() {
    let (base, state) = serve().await;
    let backend = HttpBackend::new(&base).expect("backend");

    let ack = backend
        .send_message(&channel("ch1"), "hi", Some(&"p1".into()), "local-7")
        .await
        .expect("send");
    assert_eq!(ack.id.as_deref(), Some("srv-1"));

    let sent = state.sent.lock().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].content, "hi");
    assert_eq!(sent[0].client_ref.as_deref(), Some("local-7"));
    assert_eq!(sent[0].parent_id, Some(MessageId::from("p1")));
}

#[tokio::test]
async fn api_errors_are_decoded() {
    let (base, _state) = serve().await;
    let backend = HttpBackend::new(&base).expect("backend");

    let err = backend
        .add_reaction(&"m1".into(), "👍")
        .await
        .expect_err("conflict");
    let api = err
        .downcast_ref::<ApiError>()
        .expect("decoded api error");
    assert_eq!(api.code, ErrorCode::Conflict);

    let err = backend
        .fetch_top_level_messages(
            &Scope::Conversation("c1".into()),
            10,
        )
        .await
        .expect_err("not found");
    assert!(format!("{err:#}").contains("404"));
}

#[tokio::test]
async fn empty_delete_body_is_an_ack_without_id() {
    let (base, _state) = serve().await;
    let backend = HttpBackend::new(&base).expect("backend");

    let ack = backend
        .remove_reaction(&"x1".into())
        .await
        .expect("removed");
    assert_eq!(ack, MutationAck::default());
}

#[test]
fn rejects_urls_without_a_path() {
    assert!(HttpBackend::new("not a url").is_err());
    assert!(HttpBackend::new("mailto:someone@example.com").is_err());
    let backend = HttpBackend::new("http://localhost:8080").expect("backend");
    assert_eq!(
        backend.endpoint(&["messages", "a b"]).expect("url").as_str(),
        "http://localhost:8080/messages/a%20b"
    );
}
