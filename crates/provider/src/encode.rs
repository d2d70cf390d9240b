//! Protocol-neutral half of request encoding.
//!
//! Attachments are resolved exactly once per encode into [`EncodedAttachment`]
//! values; the per-protocol request builders are then pure functions over the
//! resulting [`ResolvedMessage`] list.

use base64::Engine;
use types::{
    Attachment, AttachmentData, AttachmentError, AttachmentKind, AttachmentResolver, Conversation,
    Message, ProviderError, ToolCall, ToolResult,
};

pub(crate) const PDF_MEDIA_TYPE: &str = "application/pdf";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EncodedAttachment {
    Image {
        media_type: &'static str,
        base64: String,
    },
    Pdf {
        name: String,
        base64: String,
    },
    /// Already labelled text, e.g. `[File: notes.md]\n...`.
    Text { text: String },
}

impl EncodedAttachment {
    pub(crate) fn data_url(media_type: &str, base64: &str) -> String {
        format!("data:{media_type};base64,{base64}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ResolvedMessage<'a> {
    User {
        text: Option<&'a str>,
        attachments: Vec<EncodedAttachment>,
    },
    Assistant {
        text: Option<&'a str>,
        tool_calls: &'a [ToolCall],
    },
    ToolResults(&'a [ToolResult]),
}

/// Resolves every attachment of `conversation` in order. Messages that carry
/// nothing encodable are dropped.
pub(crate) async fn resolve_conversation<'a>(
    conversation: &'a Conversation,
    resolver: &dyn AttachmentResolver,
) -> Result<Vec<ResolvedMessage<'a>>, ProviderError> {
    let mut resolved = Vec::with_capacity(conversation.messages().len());
    for message in conversation.messages() {
        match message {
            Message::User { text, attachments } => {
                let text = present_text(text);
                let mut encoded = Vec::with_capacity(attachments.len());
                for attachment in attachments {
                    encoded.push(resolve_attachment(attachment, resolver).await?);
                }
                if text.is_none() && encoded.is_empty() {
                    tracing::debug!("skipping empty user message");
                    continue;
                }
                resolved.push(ResolvedMessage::User {
                    text,
                    attachments: encoded,
                });
            }
            Message::Assistant { text, tool_calls } => {
                let text = present_text(text);
                if text.is_none() && tool_calls.is_empty() {
                    tracing::debug!("skipping empty assistant message");
                    continue;
                }
                resolved.push(ResolvedMessage::Assistant {
                    text,
                    tool_calls: tool_calls.as_slice(),
                });
            }
            Message::ToolResults { results } => {
                if !results.is_empty() {
                    resolved.push(ResolvedMessage::ToolResults(results.as_slice()));
                }
            }
        }
    }
    Ok(resolved)
}

fn present_text(text: &Option<String>) -> Option<&str> {
    text.as_deref().filter(|text| !text.trim().is_empty())
}

async fn resolve_attachment(
    attachment: &Attachment,
    resolver: &dyn AttachmentResolver,
) -> Result<EncodedAttachment, ProviderError> {
    let resolved = resolver.resolve(attachment).await?;
    let name = if resolved.original_name.trim().is_empty() {
        attachment.original_name.clone()
    } else {
        resolved.original_name
    };

    let encoded = match attachment.kind {
        AttachmentKind::Image => EncodedAttachment::Image {
            media_type: image_media_type(&name),
            base64: base64_payload(resolved.data),
        },
        AttachmentKind::Pdf => EncodedAttachment::Pdf {
            base64: base64_payload(resolved.data),
            name,
        },
        AttachmentKind::Text => EncodedAttachment::Text {
            text: labelled_text("File", &name, text_payload(resolved.data, &name)?),
        },
        AttachmentKind::Webpage => EncodedAttachment::Text {
            text: labelled_text("Webpage", &name, text_payload(resolved.data, &name)?),
        },
    };
    Ok(encoded)
}

/// Infers an image media type from the file extension only. Unknown
/// extensions fall back to JPEG.
pub(crate) fn image_media_type(name: &str) -> &'static str {
    let extension = name
        .rsplit_once('.')
        .map(|(_, extension)| extension.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "image/jpeg",
    }
}

/// Binary payloads are base64-encoded; text payloads are taken to already be
/// base64.
fn base64_payload(data: AttachmentData) -> String {
    match data {
        AttachmentData::Bytes(bytes) => base64::engine::general_purpose::STANDARD.encode(bytes),
        AttachmentData::Text(text) => text.trim().to_owned(),
    }
}

fn text_payload(data: AttachmentData, name: &str) -> Result<String, AttachmentError> {
    match data {
        AttachmentData::Text(text) => Ok(text),
        AttachmentData::Bytes(bytes) => {
            String::from_utf8(bytes).map_err(|error| AttachmentError::UnsupportedData {
                name: name.to_owned(),
                message: format!("text attachment is not valid UTF-8: {error}"),
            })
        }
    }
}

fn labelled_text(label: &str, name: &str, content: String) -> String {
    format!("[{label}: {name}]\n{content}")
}

/// Text stand-in for a PDF in protocols without a document block.
pub(crate) fn pdf_placeholder_text(name: &str) -> String {
    format!(
        "[File: {name}] (PDF document supplied by the user; base64 data is available but this format cannot embed documents)"
    )
}
