//! Display text extraction.
//!
//! Gateway messages can carry multi-megabyte inline images, either as
//! markdown data URIs inside the text or as base64 attachment bodies.
//! Anything estimated above the configured threshold is elided here so the
//! display layer never sees it.

use std::{borrow::Cow, sync::LazyLock};

use pinchy_core::protocol::{ChatAttachment, ChatMessage, ContentBlock, MessageContent};
use regex::{Captures, Regex};

static INLINE_IMAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"!\[([^\]]*)\]\(data:(image/[^;]+);base64,([^)]+)\)").expect("valid regex")
});

/// Decoded size of a base64 body, ignoring whitespace.
#[must_use]
pub fn estimated_decoded_size(base64: &str) -> usize {
    base64.chars().filter(|c| !c.is_whitespace()).count() * 3 / 4
}

const fn rounded_kb(bytes: usize) -> usize {
    (bytes + 512) / 1024
}

/// Replace inline `![alt](data:image/...;base64,...)` images above
/// `threshold` bytes with a short placeholder. Smaller images are kept.
#[must_use]
pub fn strip_large_data_uris(text: &str, threshold: usize) -> Cow<'_, str> {
    INLINE_IMAGE.replace_all(text, |caps: &Captures<'_>| {
        let size = estimated_decoded_size(&caps[3]);
        if size <= threshold {
            return caps[0].to_string();
        }
        let alt = &caps[1];
        let name = if alt.is_empty() { "image.png" } else { alt };
        format!("[Image too large: {name} (~{}KB)]", rounded_kb(size))
    })
}

/// Drop attachments whose body is above `threshold` bytes.
///
/// Returns `None` when nothing is left.
#[must_use]
pub fn filter_large_attachments(
    attachments: Option<&[ChatAttachment]>,
    threshold: usize,
) -> Option<Vec<ChatAttachment>> {
    let kept: Vec<ChatAttachment> = attachments?
        .iter()
        .filter(|att| {
            let Some(content) = &att.content else {
                return true;
            };
            let size = content.len() * 3 / 4;
            if size > threshold {
                tracing::warn!(
                    "Filtered out large attachment: {} (~{}KB)",
                    att.file_name.as_deref().unwrap_or("unknown"),
                    rounded_kb(size)
                );
                return false;
            }
            true
        })
        .cloned()
        .collect();
    (!kept.is_empty()).then_some(kept)
}

/// Text to display for a message: a plain string as-is, or the `text`
/// blocks concatenated in order. Oversized inline images are elided.
#[must_use]
pub fn extract_text(message: &ChatMessage, threshold: usize) -> String {
    let raw: Cow<'_, str> = match &message.content {
        MessageContent::Text(text) => Cow::Borrowed(text.as_str()),
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Other => None,
            })
            .collect::<String>()
            .into(),
    };
    strip_large_data_uris(&raw, threshold).into_owned()
}
