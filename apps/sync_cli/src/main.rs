use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use shared::domain::{ChannelId, ConversationId, MessageId, Scope, Topic, UserId};
use sync_core::{
    load_settings, load_settings_from, HttpBackend, MutationRequest, SyncBackends, SyncEngine,
    SyncEvent, SystemClock, WsPushTransport,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Connects a sync engine to a server, follows one topic and logs what happens to it.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: String,
    /// Realtime endpoint base; derived from --server-url when omitted.
    #[arg(long)]
    ws_url: Option<String>,
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    token: Option<String>,
    /// `channel:<id>`, `conversation:<id>` or `thread:<parent message id>`.
    #[arg(long, value_parser = parse_topic)]
    topic: Topic,
    /// Message to send once the first sweep has completed.
    #[arg(long)]
    send: Option<String>,
    /// Settings file; defaults to ./sync.toml plus SYNC__* environment overrides.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Stop after this many seconds instead of waiting for ctrl-c.
    #[arg(long)]
    duration_secs: Option<u64>,
}

fn parse_topic(raw: &str) -> Result<Topic> {
    let (kind, id) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("expected <kind>:<id>, got {raw}"))?;
    if id.is_empty() {
        bail!("topic id is empty");
    }
    match kind {
        "channel" => Ok(Topic::Channel(ChannelId::from(id))),
        "conversation" => Ok(Topic::Conversation(ConversationId::from(id))),
        "thread" => Ok(Topic::Thread(MessageId::from(id))),
        other => bail!("unknown topic kind {other}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let settings = match &args.config {
        Some(path) => load_settings_from(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => load_settings(),
    };
    let mut http = HttpBackend::new(&args.server_url)?;
    let mut ws = match &args.ws_url {
        Some(ws_url) => WsPushTransport::new(ws_url)?,
        None => WsPushTransport::from_http_base(&args.server_url)?,
    };
    if let Some(token) = &args.token {
        http = http.with_token(token.clone());
        ws = ws.with_token(token.clone());
    }
    let http = Arc::new(http);
    let engine = SyncEngine::new(
        UserId::from(args.user_id.as_str()),
        settings,
        SyncBackends {
            transport: Arc::new(ws),
            fetch: http.clone(),
            mutations: http,
        },
        Arc::new(SystemClock),
    );

    let mut events = engine.events();
    let handle = engine.subscribe(args.topic.clone()).await;
    info!(topic = %args.topic, "following topic");

    let mut pending_send = args.send.clone();
    let deadline = args
        .duration_secs
        .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = sleep_until(deadline) => break,
            event = events.recv() => event,
        };
        let event = match event {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "event stream lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        log_event(&event);

        if let SyncEvent::SweepCompleted { topic, .. } = &event {
            if topic == &args.topic {
                if let Some(content) = pending_send.take() {
                    send(&engine, &args.topic, content).await;
                }
            }
        }
    }

    let cached = match args.topic.thread_parent() {
        Some(parent_id) => engine.thread(parent_id).await,
        None => match args.topic.scope() {
            Some(scope) => engine.top_level(&scope).await,
            None => Vec::new(),
        },
    };
    for message in cached {
        info!(
            id = %message.id,
            sender = %message.sender_id,
            replies = message.reply_count,
            "{}",
            message.content
        );
    }
    engine.unsubscribe(&handle).await;
    engine.shutdown().await;
    Ok(())
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn topic_scope(engine: &SyncEngine, topic: &Topic) -> Option<Scope> {
    match topic.thread_parent() {
        Some(parent_id) => engine.message(parent_id).await.map(|parent| parent.scope),
        None => topic.scope(),
    }
}

async fn send(engine: &Arc<SyncEngine>, topic: &Topic, content: String) {
    let Some(scope) = topic_scope(engine, topic).await else {
        warn!(topic = %topic, "thread parent is not cached; not sending");
        return;
    };
    let request = MutationRequest::SendMessage {
        scope,
        parent_id: topic.thread_parent().cloned(),
        content,
    };
    match engine.submit(request).await {
        Ok(local_id) => info!(local_id = %local_id, "message submitted"),
        Err(err) => warn!(error = %err, "message rejected locally"),
    }
}

fn log_event(event: &SyncEvent) {
    match event {
        SyncEvent::TopicStatusChanged(status) => info!(
            topic = %status.topic,
            state = ?status.state,
            retry_count = status.retry_count,
            permanently_degraded = status.permanently_degraded,
            "topic status"
        ),
        SyncEvent::CacheChanged { topic } => info!(topic = %topic, "cache changed"),
        SyncEvent::MutationResolved(resolution) => info!(
            local_id = %resolution.local_id,
            kind = ?resolution.kind,
            outcome = ?resolution.outcome,
            "mutation resolved"
        ),
        SyncEvent::SweepCompleted { topic, diff } => info!(
            topic = %topic,
            inserted = diff.inserted.len(),
            removed = diff.removed.len(),
            refreshed = diff.refreshed,
            "sweep completed"
        ),
        SyncEvent::SweepFailed { topic, reason } => warn!(topic = %topic, %reason, "sweep failed"),
    }
}
