use async_trait::async_trait;

use crate::{Attachment, AttachmentError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentData {
    Bytes(Vec<u8>),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAttachment {
    pub original_name: String,
    pub data: AttachmentData,
}

/// Turns an [`Attachment`] reference into its content.
///
/// Implementations are called once per attachment per encode and must not be
/// relied on for caching across calls.
#[async_trait]
pub trait AttachmentResolver: Send + Sync {
    async fn resolve(&self, attachment: &Attachment)
    -> Result<ResolvedAttachment, AttachmentError>;
}
