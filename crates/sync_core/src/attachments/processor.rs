use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use shared::model::Attachment;

use crate::error::SyncResult;

/// Turns downloaded ciphertext into a locally materialized attachment.
#[async_trait]
pub trait AttachmentProcessor: Send + Sync {
    async fn process(&self, ciphertext: Vec<u8>, descriptor: &Attachment) -> SyncResult<Attachment>;
}

/// Writes content under a root directory, named by its SHA-256.
pub struct FsAttachmentProcessor {
    root: PathBuf,
}

impl FsAttachmentProcessor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl AttachmentProcessor for FsAttachmentProcessor {
    async fn process(&self, ciphertext: Vec<u8>, descriptor: &Attachment) -> SyncResult<Attachment> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("failed to create attachment dir '{}'", self.root.display()))?;

        let name = format!("{:x}", Sha256::digest(&ciphertext));
        let path = self.root.join(&name);
        tokio::fs::write(&path, &ciphertext)
            .await
            .with_context(|| format!("failed to write attachment '{}'", path.display()))?;

        Ok(Attachment {
            path: Some(path.to_string_lossy().into_owned()),
            size_bytes: ciphertext.len() as u64,
            ..descriptor.clone()
        })
    }
}

#[cfg(test)]
#[path = "../tests/processor_tests.rs"]
mod tests;
