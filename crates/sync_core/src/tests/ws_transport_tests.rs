use std::collections::HashMap;

use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade},
        Query,
    },
    response::Response,
    routing::get,
    Router,
};
use shared::{
    domain::ChannelId,
    error::{ApiError, ErrorCode},
};
use tokio::net::TcpListener;

use super::*;
use crate::fixtures::{channel, message, message_insert};

async fn realtime(ws: WebSocketUpgrade, Query(query): Query<HashMap<String, String>>) -> Response {
    ws.on_upgrade(move |socket| session(socket, query))
}

async fn session(mut socket: WebSocket, query: HashMap<String, String>) {
    let Some(Ok(AxumMessage::Text(text))) = socket.recv().await else {
        return;
    };
    let Ok(ClientFrame::Subscribe { topic, filter }) = serde_json::from_str::<ClientFrame>(&text)
    else {
        return;
    };
    assert_eq!(query.get("column").map(String::as_str), Some("channel_id"));
    assert!(filter.starts_with("channel_id=eq."));

    if query.get("value").map(String::as_str) == Some("forbidden") {
        let frame = PushFrame::Error(ApiError::new(ErrorCode::Forbidden, "not a member"));
        let _ = socket
            .send(AxumMessage::Text(serde_json::to_string(&frame).expect("json")))
            .await;
        return;
    }

    let frames = [
        PushFrame::Heartbeat,
        PushFrame::Subscribed { topic },
        PushFrame::Change {
            notification: message_insert(&message("m1", &channel("ch1"), 1)),
        },
    ];
    for frame in frames {
        let text = serde_json::to_string(&frame).expect("json");
        if socket.send(AxumMessage::Text(text)).await.is_err() {
            return;
        }
    }
    let _ = socket.send(AxumMessage::Close(None)).await;
}

async fn serve() -> String {
    let app = Router::new().route("/realtime", get(realtime));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("ws://{addr}")
}

fn topic(id: &str) -> Topic {
    Topic::Channel(ChannelId::from(id))
}

#[tokio::test]
async fn forwards_changes_after_the_ack_then_closes() {
    let transport = WsPushTransport::new(&serve().await).expect("transport");
    let topic = topic("ch1");
    let mut push = transport
        .connect(&topic, &topic.filter())
        .await
        .expect("connect");

    let notification = push.events.recv().await.expect("change");
    assert_eq!(notification, message_insert(&message("m1", &channel("ch1"), 1)));
    assert!(push.events.recv().await.is_none());
}

#[tokio::test]
async fn error_frame_fails_the_connect() {
    let transport = WsPushTransport::new(&serve().await).expect("transport");
    let filter = TopicFilter::new("channel_id", "forbidden");
    let err = transport
        .connect(&topic("forbidden"), &filter)
        .await
        .err()
        .expect("rejected");
    let api = err.downcast_ref::<ApiError>().expect("api error");
    assert_eq!(api.code, ErrorCode::Forbidden);
}

#[test]
fn builds_realtime_url_from_http_base() {
    let transport = WsPushTransport::from_http_base("https://chat.example.com/api/")
        .expect("transport")
        .with_token("t0k");
    let topic = Topic::Thread("p 1".into());
    let url = transport
        .realtime_url(&topic, &topic.filter())
        .expect("url");
    assert_eq!(url.scheme(), "wss");
    assert_eq!(url.path(), "/api/realtime");
    let pairs: HashMap<String, String> = url.query_pairs().into_owned().collect();
    assert_eq!(pairs["topic"], "thread:p 1");
    assert_eq!(pairs["column"], "parent_id");
    assert_eq!(pairs["value"], "p 1");
    assert_eq!(pairs["access_token"], "t0k");

    assert!(WsPushTransport::from_http_base("ftp://example.com").is_err());
    assert!(WsPushTransport::new("http://example.com").is_err());
}
