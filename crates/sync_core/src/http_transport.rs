//! REST adapter for [`SyncTransport`].

use anyhow::anyhow;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Serialize;
use shared::{
    domain::UserId,
    error::{ApiError, ErrorCode},
    model::Attachment,
    protocol::{
        Ack, ConversationRef, PullMessagesRequest, ReadReceiptBatch, ReadSyncEntry,
        ReceiptExtension, SendReceiptsRequest, SequenceRange, SyncReadCursorRequest,
    },
};
use url::Url;

use crate::{
    error::{SyncError, SyncResult},
    transport::{PullOptions, SyncTransport},
};

pub struct HttpSyncTransport {
    http: Client,
    base: Url,
}

impl HttpSyncTransport {
    pub fn new(server_url: &str) -> anyhow::Result<Self> {
        let base = Url::parse(server_url)?;
        if base.cannot_be_a_base() {
            return Err(anyhow!("server url '{server_url}' cannot be used as a base"));
        }
        Ok(Self {
            http: Client::new(),
            base,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> SyncResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("server url cannot be used as a base"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn post_json<B: Serialize + ?Sized>(&self, url: Url, body: &B) -> SyncResult<Response> {
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(transient)?;
        check(response).await
    }
}

#[async_trait]
impl SyncTransport for HttpSyncTransport {
    async fn download_attachment(&self, attachment: &Attachment) -> SyncResult<Vec<u8>> {
        let url = self.endpoint(&["attachments", &attachment.cdn_key])?;
        let response = self.http.get(url).send().await.map_err(transient)?;
        let bytes = check(response).await?.bytes().await.map_err(transient)?;
        Ok(bytes.to_vec())
    }

    async fn send_read_receipts(
        &self,
        batch: &ReadReceiptBatch,
        extension: &ReceiptExtension,
    ) -> SyncResult<Ack> {
        let request = SendReceiptsRequest {
            batch: batch.clone(),
            extension: extension.clone(),
        };
        let url = self.endpoint(&["receipts"])?;
        self.post_json(url, &request)
            .await?
            .json()
            .await
            .map_err(transient)
    }

    async fn sync_read_cursor(
        &self,
        entries: &[ReadSyncEntry],
        extension: &ReceiptExtension,
    ) -> SyncResult<Ack> {
        let request = SyncReadCursorRequest {
            entries: entries.to_vec(),
            extension: extension.clone(),
        };
        let url = self.endpoint(&["read-sync"])?;
        self.post_json(url, &request)
            .await?
            .json()
            .await
            .map_err(transient)
    }

    async fn pull_messages(
        &self,
        conversation: ConversationRef,
        window: SequenceRange,
        options: PullOptions,
    ) -> SyncResult<()> {
        let request = PullMessagesRequest {
            conversation,
            window,
            direction: options.direction,
            priority: options.priority,
        };
        let id = conversation.conversation_id.to_string();
        let url = self.endpoint(&["conversations", &id, "pull"])?;
        self.post_json(url, &request).await?;
        Ok(())
    }

    async fn refresh_identity(&self, user: UserId) -> SyncResult<()> {
        let id = user.to_string();
        let url = self.endpoint(&["users", &id, "identity"])?;
        let response = self.http.get(url).send().await.map_err(transient)?;
        check(response).await?;
        Ok(())
    }
}

fn transient(err: reqwest::Error) -> SyncError {
    SyncError::TransientNetwork(err.to_string())
}

/// Maps non-success statuses onto the sync error taxonomy.
async fn check(response: Response) -> SyncResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().clone();
    let body = response.json::<ApiError>().await.ok();

    Err(match body {
        Some(ApiError {
            code: ErrorCode::IdentityMismatch,
            user_id: Some(user_id),
            ..
        }) => SyncError::IdentityMismatch { user_id },
        _ if status == StatusCode::NOT_FOUND => {
            SyncError::PermanentContent(format!("{url} not found"))
        }
        body => SyncError::TransientNetwork(format!(
            "{status} from {url}: {}",
            body.map(|b| b.message).unwrap_or_default()
        )),
    })
}

#[cfg(test)]
#[path = "tests/http_transport_tests.rs"]
mod tests;
