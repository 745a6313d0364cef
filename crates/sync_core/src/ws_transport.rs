use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use shared::{
    domain::{Topic, TopicFilter},
    protocol::{ChangeNotification, ClientFrame, PushFrame},
};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};
use url::Url;

use crate::api::{PushChannel, PushTransport};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const CHANNEL_CAPACITY: usize = 256;

/// Push transport over a websocket per topic at `{ws_base}/realtime`.
#[derive(Debug, Clone)]
pub struct WsPushTransport {
    base: Url,
    token: Option<String>,
}

impl WsPushTransport {
    pub fn new(ws_base: &str) -> Result<Self> {
        let base = Url::parse(ws_base).with_context(|| format!("invalid websocket url: {ws_base}"))?;
        match base.scheme() {
            "ws" | "wss" => {}
            other => bail!("websocket url must use ws:// or wss://, got {other}://"),
        }
        Ok(Self {
            base,
            token: None,
        })
    }

    /// Derives the websocket base from the REST base (`http` becomes `ws`, `https` becomes `wss`).
    pub fn from_http_base(http_base: &str) -> Result<Self> {
        let ws_base = if let Some(rest) = http_base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = http_base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(anyhow!("server_url must start with http:// or https://"));
        };
        Self::new(&ws_base)
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn realtime_url(&self, topic: &Topic, filter: &TopicFilter) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("websocket url cannot carry a path: {}", self.base))?
            .pop_if_empty()
            .push("realtime");
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("topic", &topic.to_string())
                .append_pair("column", &filter.column)
                .append_pair("value", &filter.value);
            if let Some(token) = &self.token {
                query.append_pair("access_token", token);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl PushTransport for WsPushTransport {
    async fn connect(&self, topic: &Topic, filter: &TopicFilter) -> Result<PushChannel> {
        let url = self.realtime_url(topic, filter)?;
        let (socket, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket for {topic}"))?;
        let (mut writer, mut reader) = socket.split();

        let subscribe = ClientFrame::Subscribe {
            topic: topic.clone(),
            filter: filter.to_string(),
        };
        writer
            .send(WsMessage::Text(serde_json::to_string(&subscribe)?))
            .await
            .context("failed to send subscribe frame")?;
        await_ack(topic, &mut reader).await?;
        debug!(topic = %topic, "ws: subscription acknowledged");

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(pump(topic.clone(), writer, reader, tx));
        Ok(PushChannel::new(rx))
    }
}

async fn await_ack(topic: &Topic, reader: &mut SplitStream<Socket>) -> Result<()> {
    loop {
        let frame = reader
            .next()
            .await
            .ok_or_else(|| anyhow!("socket closed before subscription ack"))?
            .context("websocket receive failed")?;
        match frame {
            WsMessage::Text(text) => match serde_json::from_str::<PushFrame>(&text)
                .context("invalid push frame")?
            {
                PushFrame::Subscribed { topic: acked } if &acked == topic => return Ok(()),
                PushFrame::Error(err) => return Err(err.into()),
                PushFrame::Subscribed { .. } | PushFrame::Heartbeat | PushFrame::Change { .. } => {}
            },
            WsMessage::Close(_) => bail!("socket closed before subscription ack"),
            _ => {}
        }
    }
}

async fn pump(
    topic: Topic,
    mut writer: SplitSink<Socket, WsMessage>,
    mut reader: SplitStream<Socket>,
    events: mpsc::Sender<ChangeNotification>,
) {
    let mut ticks =
        tokio::time::interval_at(tokio::time::Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            _ = events.closed() => break,
            _ = ticks.tick() => {
                let Ok(frame) = serde_json::to_string(&ClientFrame::Heartbeat) else {
                    continue;
                };
                if let Err(err) = writer.send(WsMessage::Text(frame)).await {
                    warn!(topic = %topic, error = %err, "ws: heartbeat failed");
                    break;
                }
            }
            frame = reader.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<PushFrame>(&text) {
                    Ok(PushFrame::Change { notification }) => {
                        if events.send(notification).await.is_err() {
                            break;
                        }
                    }
                    Ok(PushFrame::Error(err)) => {
                        warn!(topic = %topic, code = ?err.code, retryable = err.is_retryable(), message = %err.message, "ws: server error");
                        break;
                    }
                    Ok(PushFrame::Subscribed { .. } | PushFrame::Heartbeat) => {}
                    Err(err) => warn!(topic = %topic, error = %err, "ws: ignoring invalid push frame"),
                },
                Some(Ok(WsMessage::Ping(payload))) => {
                    if writer.send(WsMessage::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(topic = %topic, error = %err, "ws: receive failed");
                    break;
                }
            },
        }
    }
    let _ = writer.close().await;
    debug!(topic = %topic, "ws: push channel closed");
}

#[cfg(test)]
#[path = "tests/ws_transport_tests.rs"]
mod tests;
