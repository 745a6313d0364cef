use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{Message, MessageId, Reaction, ReactionId, Scope},
    error::ApiError,
    protocol::{AddReactionRequest, MutationAck, SendMessageRequest},
};
use tracing::debug;
use url::Url;

use crate::api::{FetchApi, MutationApi};

/// REST implementation of the fetch and mutation APIs.
#[derive(Clone)]
pub struct HttpBackend {
    http: Client,
    base: Url,
    token: Option<String>,
}

impl HttpBackend {
    pub fn new(base: &str) -> Result<Self> {
        let base = Url::parse(base).with_context(|| format!("invalid server url: {base}"))?;
        if base.cannot_be_a_base() {
            return Err(anyhow!("server url cannot carry a path: {base}"));
        }
        Ok(Self {
            http: Client::new(),
            base,
            token: None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("server url cannot carry a path: {}", self.base))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = self.authorize(request).send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    async fn send_ack(&self, request: RequestBuilder) -> Result<MutationAck> {
        let response = self.authorize(request).send().await?;
        let response = check_status(response).await?;
        let body = response.bytes().await?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(MutationAck::default());
        }
        serde_json::from_slice(&body).context("invalid mutation acknowledgement")
    }
}

/// Turns a non-success response into an error, decoding the server's `ApiError` body if present.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(api_error) => Err(api_error)
            .with_context(|| format!("server answered {status}")),
        Err(_) => Err(anyhow!("server answered {status}: {body}")),
    }
}

#[async_trait]
impl FetchApi for HttpBackend {
    async fn fetch_top_level_messages(&self, scope: &Scope, limit: u32) -> Result<Vec<Message>> {
        let url = self.endpoint(&["scopes", scope.kind(), scope.id(), "messages"])?;
        debug!(scope = %scope, limit, "http: fetching top-level messages");
        self.send(self.http.get(url).query(&[("limit", limit)]))
            .await
    }

    async fn fetch_thread_children(&self, parent_id: &MessageId) -> Result<Vec<Message>> {
        let url = self.endpoint(&["messages", parent_id.as_str(), "replies"])?;
        self.send(self.http.get(url)).await
    }

    async fn fetch_reactions(&self, message_ids: &[MessageId]) -> Result<Vec<Reaction>> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.endpoint(&["reactions"])?;
        let ids = message_ids
            .iter()
            .map(MessageId::as_str)
            .collect::<Vec<_>>()
            .join(",");
        self.send(self.http.get(url).query(&[("message_ids", ids)]))
            .await
    }
}

#[async_trait]
impl MutationApi for HttpBackend {
    async fn send_message(
        &self,
        scope: &Scope,
        content: &str,
        parent_id: Option<&MessageId>,
        client_ref: &str,
    ) -> Result<MutationAck> {
        let url = self.endpoint(&["messages"])?;
        let payload = SendMessageRequest {
            scope: scope.clone(),
            content: content.to_string(),
            parent_id: parent_id.cloned(),
            client_ref: Some(client_ref.to_string()),
        };
        self.send_ack(self.http.post(url).json(&payload)).await
    }

    async fn add_reaction(&self, message_id: &MessageId, emoji: &str) -> Result<MutationAck> {
        let url = self.endpoint(&["messages", message_id.as_str(), "reactions"])?;
        let payload = AddReactionRequest {
            emoji: emoji.to_string(),
        };
        self.send_ack(self.http.post(url).json(&payload)).await
    }

    async fn remove_reaction(&self, reaction_id: &ReactionId) -> Result<MutationAck> {
        let url = self.endpoint(&["reactions", reaction_id.as_str()])?;
        self.send_ack(self.http.delete(url)).await
    }
}

#[cfg(test)]
#[path = "tests/http_backend_tests.rs"]
mod tests;
