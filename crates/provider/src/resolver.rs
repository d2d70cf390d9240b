use std::{io::ErrorKind, path::PathBuf};

use async_trait::async_trait;
use types::{
    Attachment, AttachmentData, AttachmentError, AttachmentKind, AttachmentResolver,
    ResolvedAttachment,
};

/// Resolves attachment locators as filesystem paths, optionally relative to
/// a root directory.
///
/// Images and PDFs are read as bytes; text and webpage captures must be
/// UTF-8.
#[derive(Debug, Clone, Default)]
pub struct FsAttachmentResolver {
    root: Option<PathBuf>,
}

impl FsAttachmentResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn path_for(&self, locator: &str) -> PathBuf {
        match &self.root {
            Some(root) => root.join(locator),
            None => PathBuf::from(locator),
        }
    }
}

#[async_trait]
impl AttachmentResolver for FsAttachmentResolver {
    async fn resolve(
        &self,
        attachment: &Attachment,
    ) -> Result<ResolvedAttachment, AttachmentError> {
        let path = self.path_for(&attachment.locator);
        tracing::debug!(
            name = %attachment.original_name,
            path = %path.display(),
            "resolving attachment"
        );
        let bytes = tokio::fs::read(&path).await.map_err(|error| match error.kind() {
            ErrorKind::NotFound => AttachmentError::NotFound {
                name: attachment.original_name.clone(),
            },
            _ => AttachmentError::Read {
                name: attachment.original_name.clone(),
                message: format!("{}: {error}", path.display()),
            },
        })?;

        let data = match attachment.kind {
            AttachmentKind::Image | AttachmentKind::Pdf => AttachmentData::Bytes(bytes),
            AttachmentKind::Text | AttachmentKind::Webpage => {
                AttachmentData::Text(String::from_utf8(bytes).map_err(|error| {
                    AttachmentError::UnsupportedData {
                        name: attachment.original_name.clone(),
                        message: format!("expected UTF-8 text: {error}"),
                    }
                })?)
            }
        };
        Ok(ResolvedAttachment {
            original_name: attachment.original_name.clone(),
            data,
        })
    }
}
