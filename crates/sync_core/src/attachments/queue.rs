use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use futures::FutureExt;
use sha2::{Digest, Sha256};
use shared::{
    domain::{AttachmentJobKind, MessageId},
    model::{Attachment, AttachmentDownloadJob, ForwardRef, Message},
};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{error, info, warn};

use super::{AttachmentProcessor, WorkerPool, WorkerSlot};
use crate::{
    error::{SyncError, SyncResult},
    events::{EventBus, SyncEvent},
    messages::MessageRegistry,
    store::StoreGateway,
    transport::SyncTransport,
    write_batcher::AdaptiveWriteBatcher,
};

/// Which slot of which message a job fills.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTarget {
    pub message_id: MessageId,
    pub kind: AttachmentJobKind,
    pub index: usize,
    pub forward_ref: Option<ForwardRef>,
}

#[derive(Debug, Clone, Copy)]
pub struct AttachmentQueueConfig {
    pub tick: Duration,
    pub retry_budget: u32,
    pub backoff: Duration,
}

#[derive(Clone)]
pub struct AttachmentJobQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    store: StoreGateway,
    messages: Arc<MessageRegistry>,
    batcher: AdaptiveWriteBatcher<Message>,
    transport: Arc<dyn SyncTransport>,
    processor: Arc<dyn AttachmentProcessor>,
    pool: WorkerPool,
    events: EventBus,
    config: AttachmentQueueConfig,
    scheduling: tokio::sync::Mutex<()>,
}

/// Result of applying a job's outcome to its message slot.
enum SlotUpdate {
    Applied(Message, oneshot::Receiver<SyncResult<()>>),
    AlreadyResolved,
    Missing,
}

impl AttachmentJobQueue {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: StoreGateway,
        messages: Arc<MessageRegistry>,
        batcher: AdaptiveWriteBatcher<Message>,
        transport: Arc<dyn SyncTransport>,
        processor: Arc<dyn AttachmentProcessor>,
        pool: WorkerPool,
        events: EventBus,
        config: AttachmentQueueConfig,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                store,
                messages,
                batcher,
                transport,
                processor,
                pool,
                events,
                config,
                scheduling: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    /// Persists a job for `attachment` and returns the pending placeholder to put
    /// in the slot. Content arrives later through the message registry.
    pub async fn submit(&self, attachment: Attachment, target: JobTarget) -> SyncResult<Attachment> {
        let job = AttachmentDownloadJob::new(
            target.message_id,
            target.kind,
            target.index,
            attachment.clone(),
            target.forward_ref,
        );
        self.inner.store.save_job(&job).await?;
        info!(
            job_id = %job.id,
            message_id = %job.message_id,
            kind = job.kind.as_str(),
            index = job.index,
            "attachments: job queued"
        );
        self.trigger();

        Ok(Attachment {
            pending: true,
            error: false,
            download_job_id: Some(job.id),
            ..attachment
        })
    }

    /// Clears pending flags left by a previous process, then runs the scheduler on
    /// every tick until the handle is aborted.
    pub async fn start(&self) -> SyncResult<JoinHandle<()>> {
        let reset = self.inner.store.reset_all_pending_flags().await?;
        if reset > 0 {
            info!(reset, "attachments: recovered jobs left pending by a previous run");
        }
        let queue = self.clone();
        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(queue.inner.config.tick);
            loop {
                ticker.tick().await;
                queue.schedule().await;
            }
        }))
    }

    /// Runs the scheduler in the background.
    pub fn trigger(&self) {
        let queue = self.clone();
        tokio::spawn(async move {
            queue.schedule().await;
        });
    }

    /// Starts due jobs into free slots. Returns how many were started.
    pub async fn schedule(&self) -> usize {
        let _guard = self.inner.scheduling.lock().await;

        let free = self.inner.pool.free_slots();
        if free == 0 {
            return 0;
        }
        let jobs = match self.inner.store.get_next_jobs(free, Utc::now()).await {
            Ok(jobs) => jobs,
            Err(err) => {
                warn!(error = %err, "attachments: failed to fetch next jobs");
                return 0;
            }
        };

        let mut started = 0;
        for job in jobs {
            // Slots may have filled while the fetch was in flight.
            let Some(slot) = self.inner.pool.try_start(job.id) else {
                continue;
            };
            started += 1;
            let queue = self.clone();
            tokio::spawn(async move {
                queue.run_job(job, slot).await;
            });
        }
        started
    }

    async fn run_job(&self, job: AttachmentDownloadJob, slot: WorkerSlot) {
        let outcome = AssertUnwindSafe(self.execute(&job)).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self.handle_failure(job, err).await,
            Err(_) => {
                error!(job_id = %job.id, "attachments: job panicked");
                self.handle_failure(job, SyncError::PermanentContent("job panicked".into()))
                    .await;
            }
        }
        drop(slot);
        self.trigger();
    }

    async fn execute(&self, job: &AttachmentDownloadJob) -> SyncResult<()> {
        let inner = &self.inner;
        // Held until every save this job queues is confirmed.
        let Some((message, _lease)) = inner.messages.acquire(job.message_id).await? else {
            info!(job_id = %job.id, message_id = %job.message_id, "attachments: message gone, dropping job");
            return inner.store.remove_job(job.id).await;
        };

        let current = message
            .content_for(job.forward_ref.as_ref())
            .and_then(|content| content.slot(job.kind, job.index))
            .cloned();
        let Some(current) = current else {
            info!(job_id = %job.id, message_id = %job.message_id, "attachments: slot gone, dropping job");
            return inner.store.remove_job(job.id).await;
        };
        if current.has_local_content() {
            return self.reconcile_resolved(job).await;
        }

        if !job.attachment.has_decryption_material() {
            warn!(job_id = %job.id, "attachments: missing digest or key, not retrying");
            return self.finish_errored(job).await;
        }

        inner.store.set_job_pending(job.id, true).await?;
        let ciphertext = inner.transport.download_attachment(&job.attachment).await?;
        verify_digest(&job.attachment, &ciphertext)?;
        let processed = inner.processor.process(ciphertext, &job.attachment).await?;

        match self.update_slot(job, |slot| {
            *slot = Attachment {
                pending: false,
                error: false,
                download_job_id: None,
                ..processed
            };
        }) {
            SlotUpdate::Applied(message, saved) => {
                wait_saved(saved).await?;
                self.notify(job, &message);
                info!(job_id = %job.id, message_id = %job.message_id, "attachments: content attached");
                inner.store.remove_job(job.id).await
            }
            SlotUpdate::AlreadyResolved => {
                info!(job_id = %job.id, "attachments: slot already resolved, discarding result");
                inner.store.remove_job(job.id).await
            }
            SlotUpdate::Missing => Err(SyncError::OrphanedReference {
                message_id: job.message_id.0,
            }),
        }
    }

    /// Duplicate job for content already present: make sure that content is
    /// durable, then drop the job.
    async fn reconcile_resolved(&self, job: &AttachmentDownloadJob) -> SyncResult<()> {
        if let Some(message) = self.inner.messages.get(job.message_id) {
            self.inner.batcher.save(message).await?;
        }
        self.inner.store.remove_job(job.id).await
    }

    /// Terminal failure: flag the slot, persist, drop the job.
    async fn finish_errored(&self, job: &AttachmentDownloadJob) -> SyncResult<()> {
        let Some((_, _lease)) = self.inner.messages.acquire(job.message_id).await? else {
            return self.inner.store.remove_job(job.id).await;
        };
        let update = self.update_slot(job, |slot| {
            slot.pending = false;
            slot.error = true;
            slot.download_job_id = None;
        });
        if let SlotUpdate::Applied(message, saved) = update {
            wait_saved(saved).await?;
            self.notify(job, &message);
        }
        self.inner.store.remove_job(job.id).await
    }

    /// Mutates the target slot and queues the message for saving, all under the
    /// registry lock. A slot holding local content is never touched.
    fn update_slot(
        &self,
        job: &AttachmentDownloadJob,
        apply: impl FnOnce(&mut Attachment),
    ) -> SlotUpdate {
        let batcher = &self.inner.batcher;
        self.inner
            .messages
            .update(job.message_id, |message| {
                let Some(slot) = message
                    .content_for_mut(job.forward_ref.as_ref())
                    .and_then(|content| content.slot_mut(job.kind, job.index))
                else {
                    return SlotUpdate::Missing;
                };
                if slot.has_local_content() {
                    return SlotUpdate::AlreadyResolved;
                }
                apply(slot);
                SlotUpdate::Applied(message.clone(), batcher.enqueue(message.clone()))
            })
            .unwrap_or(SlotUpdate::Missing)
    }

    async fn handle_failure(&self, mut job: AttachmentDownloadJob, err: SyncError) {
        if matches!(err, SyncError::OrphanedReference { .. }) {
            info!(job_id = %job.id, "attachments: target vanished, dropping job");
            if let Err(remove_err) = self.inner.store.remove_job(job.id).await {
                warn!(job_id = %job.id, error = %remove_err, "attachments: failed to remove job");
            }
            return;
        }

        job.attempts += 1;
        let budget = self.inner.config.retry_budget;
        if !err.is_retryable() || job.attempts > budget {
            error!(
                job_id = %job.id,
                attempts = job.attempts,
                error = %err,
                "attachments: job failed permanently"
            );
            if let Err(finish_err) = self.finish_errored(&job).await {
                warn!(job_id = %job.id, error = %finish_err, "attachments: failed to record permanent failure");
            }
            return;
        }

        let backoff = chrono::Duration::from_std(self.inner.config.backoff)
            .unwrap_or_else(|_| chrono::Duration::zero());
        job.pending = false;
        job.scheduled_at = Utc::now() + backoff;
        warn!(
            job_id = %job.id,
            attempts = job.attempts,
            retry_at = %job.scheduled_at,
            error = %err,
            "attachments: job failed, rescheduled"
        );
        if let Err(save_err) = self.inner.store.save_job(&job).await {
            warn!(job_id = %job.id, error = %save_err, "attachments: failed to reschedule job");
        }
    }

    fn notify(&self, job: &AttachmentDownloadJob, message: &Message) {
        self.inner.events.publish(SyncEvent::MessageChanged {
            conversation_id: message.conversation_id,
            message_id: message.id,
        });
        if let Some(forward) = &job.forward_ref {
            self.inner.events.publish(SyncEvent::ForwardUpdated {
                conversation_id: message.conversation_id,
                message_id: message.id,
                forward_id: forward.forward_id.clone(),
            });
        }
    }
}

async fn wait_saved(saved: oneshot::Receiver<SyncResult<()>>) -> SyncResult<()> {
    saved
        .await
        .map_err(|_| SyncError::QueueAbandoned("messages"))?
}

fn verify_digest(attachment: &Attachment, ciphertext: &[u8]) -> SyncResult<()> {
    let expected = attachment.digest.as_deref().unwrap_or_default();
    let actual = STANDARD.encode(Sha256::digest(ciphertext));
    if actual != expected {
        return Err(SyncError::PermanentContent(format!(
            "digest mismatch for '{}'",
            attachment.cdn_key
        )));
    }
    Ok(())
}

#[cfg(test)]
#[path = "../tests/attachment_queue_tests.rs"]
mod tests;
