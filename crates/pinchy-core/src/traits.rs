//! Collaborator traits the desktop shell provides.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::protocol::ChatAttachment;

/// Settings store error.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Corrupt settings file: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("No configuration directory available")]
    NoConfigDir,
}

/// Key/value settings persisted by the host.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Get a value by key.
    async fn get(&self, key: &str) -> Result<Option<Value>, SettingsError>;

    /// Set a value.
    async fn set(&self, key: &str, value: Value) -> Result<(), SettingsError>;

    /// Delete a value. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), SettingsError>;
}

/// Native "open file" dialog.
#[async_trait]
pub trait FilePicker: Send + Sync {
    /// Let the user choose files. Returns an empty list when cancelled.
    async fn pick_files(&self) -> Vec<PathBuf>;
}

/// File read error.
#[derive(Debug, Error)]
pub enum FileError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Not a file: {0}")]
    NotAFile(PathBuf),
}

/// A local file read for sending as an attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAttachment {
    pub name: String,
    pub mime_type: String,
    pub base64: String,
    pub size: u64,
}

impl FileAttachment {
    /// Convert to the attachment shape `chat.send` expects.
    #[must_use]
    pub fn into_chat_attachment(self) -> ChatAttachment {
        let kind = if crate::files::is_image(&self.mime_type) {
            "image"
        } else {
            "file"
        };
        ChatAttachment {
            kind: kind.to_string(),
            mime_type: self.mime_type,
            file_name: Some(self.name),
            content: Some(self.base64),
            size: Some(self.size),
        }
    }
}

/// Reads local files into attachments.
#[async_trait]
pub trait FileReader: Send + Sync {
    /// Read a file.
    async fn read(&self, path: &Path) -> Result<FileAttachment, FileError>;
}
