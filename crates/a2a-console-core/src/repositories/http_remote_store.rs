use std::time::Duration;

use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::error::{RepositoryError, RepositoryResult};
use super::remote_store::{
    BoxFuture, ConversationPatch, ConversationRecord, MessagePayload, NewRun, Page, PageQuery,
    RemoteStore, RunPatch, RunRecord, RunRepository, StoredMessage,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// REST client for the conversation document store.
///
/// Routes live under `{base_url}/api/conversations` and `{base_url}/api/runs`.
#[derive(Clone)]
pub struct HttpRemoteStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpRemoteStore {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> RepositoryResult<Self> {
        let client = reqwest::Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self::with_client(client, base_url, token))
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        token: Option<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

/// Map a response onto `RepositoryError` unless it succeeded
async fn check(response: Response, resource: &str) -> RepositoryResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    debug!(status = status.as_u16(), resource, "Remote store request failed");
    Err(RepositoryError::from_status(status.as_u16(), resource, body))
}

async fn send_json<T: DeserializeOwned>(builder: RequestBuilder, resource: &str) -> RepositoryResult<T> {
    let response = check(builder.send().await?, resource).await?;
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn send_empty(builder: RequestBuilder, resource: &str) -> RepositoryResult<()> {
    check(builder.send().await?, resource).await?;
    Ok(())
}

fn page_params(query: PageQuery) -> [(&'static str, u32); 2] {
    [("page", query.page), ("page_size", query.page_size)]
}

impl RemoteStore for HttpRemoteStore {
    fn create_conversation(
        &self,
        record: ConversationRecord,
    ) -> BoxFuture<'static, RepositoryResult<()>> {
        let builder = self.request(Method::POST, "/api/conversations").json(&record);
        let resource = format!("conversation {}", record.id);
        Box::pin(async move { send_empty(builder, &resource).await })
    }

    fn delete_conversation(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let builder = self.request(Method::DELETE, &format!("/api/conversations/{}", id));
        let resource = format!("conversation {}", id);
        Box::pin(async move { send_empty(builder, &resource).await })
    }

    fn update_conversation(
        &self,
        id: &str,
        patch: ConversationPatch,
    ) -> BoxFuture<'static, RepositoryResult<()>> {
        let builder = self
            .request(Method::PATCH, &format!("/api/conversations/{}", id))
            .json(&patch);
        let resource = format!("conversation {}", id);
        Box::pin(async move { send_empty(builder, &resource).await })
    }

    fn get_conversations(
        &self,
        query: PageQuery,
    ) -> BoxFuture<'static, RepositoryResult<Page<ConversationRecord>>> {
        let builder = self
            .request(Method::GET, "/api/conversations")
            .query(&page_params(query));
        Box::pin(async move { send_json(builder, "conversations").await })
    }

    fn get_messages(
        &self,
        conversation_id: &str,
        query: PageQuery,
    ) -> BoxFuture<'static, RepositoryResult<Page<StoredMessage>>> {
        let builder = self
            .request(
                Method::GET,
                &format!("/api/conversations/{}/messages", conversation_id),
            )
            .query(&page_params(query));
        let resource = format!("messages of {}", conversation_id);
        Box::pin(async move { send_json(builder, &resource).await })
    }

    fn add_message(
        &self,
        conversation_id: &str,
        payload: MessagePayload,
    ) -> BoxFuture<'static, RepositoryResult<()>> {
        let builder = self
            .request(
                Method::POST,
                &format!("/api/conversations/{}/messages", conversation_id),
            )
            .json(&payload);
        let resource = format!("message {}", payload.message_id);
        Box::pin(async move { send_empty(builder, &resource).await })
    }
}

impl RunRepository for HttpRemoteStore {
    fn list_runs(&self, query: PageQuery) -> BoxFuture<'static, RepositoryResult<Page<RunRecord>>> {
        let builder = self
            .request(Method::GET, "/api/runs")
            .query(&page_params(query));
        Box::pin(async move { send_json(builder, "runs").await })
    }

    fn create_run(&self, run: NewRun) -> BoxFuture<'static, RepositoryResult<RunRecord>> {
        let builder = self.request(Method::POST, "/api/runs").json(&run);
        Box::pin(async move { send_json(builder, "runs").await })
    }

    fn update_run(
        &self,
        id: &str,
        patch: RunPatch,
    ) -> BoxFuture<'static, RepositoryResult<RunRecord>> {
        let builder = self
            .request(Method::PATCH, &format!("/api/runs/{}", id))
            .json(&patch);
        let resource = format!("run {}", id);
        Box::pin(async move { send_json(builder, &resource).await })
    }

    fn delete_run(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let builder = self.request(Method::DELETE, &format!("/api/runs/{}", id));
        let resource = format!("run {}", id);
        Box::pin(async move { send_empty(builder, &resource).await })
    }
}
