//! Attachment validation and normalization.
//!
//! Each attachment arrives as base64 content or a worker-local file path,
//! never both. Processing decodes, size-checks, resolves a MIME type, and
//! yields bytes for MIME assembly. File-sourced attachments are converted to
//! base64 so no filesystem path survives past the worker.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// One attachment as submitted and as stored in the queue row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentSpec {
    pub filename: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub base64_content: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub inline: bool,
    #[serde(default)]
    pub content_id: Option<String>,
}

/// A validated attachment with decoded bytes.
#[derive(Debug, Clone)]
pub struct ProcessedAttachment {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
    pub inline: bool,
    pub content_id: Option<String>,
}

impl ProcessedAttachment {
    /// Re-serialize for storage: always base64, never a path.
    pub fn to_spec(&self) -> AttachmentSpec {
        AttachmentSpec {
            filename: self.filename.clone(),
            content_type: Some(self.content_type.clone()),
            base64_content: Some(BASE64.encode(&self.bytes)),
            file_path: None,
            inline: self.inline,
            content_id: self.content_id.clone(),
        }
    }
}

/// Batch result; one bad attachment does not hide the others.
#[derive(Debug, Default)]
pub struct AttachmentOutcome {
    pub processed: Vec<ProcessedAttachment>,
    pub validation_errors: Vec<String>,
    pub total_size: u64,
}

impl AttachmentOutcome {
    pub fn is_valid(&self) -> bool {
        self.validation_errors.is_empty()
    }
}

pub struct AttachmentProcessor {
    max_bytes: u64,
}

const INVALID_FILENAME_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

impl AttachmentProcessor {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }

    /// Validate and decode every attachment in the batch.
    pub async fn process(&self, specs: &[AttachmentSpec]) -> AttachmentOutcome {
        let mut outcome = AttachmentOutcome::default();

        for spec in specs {
            match self.process_one(spec).await {
                Ok(processed) => {
                    outcome.total_size += processed.bytes.len() as u64;
                    outcome.processed.push(processed);
                }
                Err(reason) => outcome
                    .validation_errors
                    .push(format!("{}: {}", spec.filename, reason)),
            }
        }

        outcome
    }

    async fn process_one(&self, spec: &AttachmentSpec) -> Result<ProcessedAttachment, String> {
        validate_filename(&spec.filename)?;

        let bytes = match (&spec.base64_content, &spec.file_path) {
            (Some(content), None) => BASE64
                .decode(content.trim())
                .map_err(|e| format!("invalid base64 content: {e}"))?,
            (None, Some(path)) => tokio::fs::read(path)
                .await
                .map_err(|e| format!("failed to read file: {e}"))?,
            (Some(_), Some(_)) => {
                return Err("both content and file path provided".to_string());
            }
            (None, None) => {
                return Err("no content or file path provided".to_string());
            }
        };

        if bytes.len() as u64 > self.max_bytes {
            return Err(format!(
                "size {} exceeds limit of {} bytes",
                bytes.len(),
                self.max_bytes
            ));
        }

        Ok(ProcessedAttachment {
            filename: spec.filename.trim().to_string(),
            content_type: resolve_content_type(spec),
            bytes,
            inline: spec.inline,
            content_id: spec.content_id.clone(),
        })
    }
}

fn validate_filename(filename: &str) -> Result<(), String> {
    let trimmed = filename.trim();
    if trimmed.is_empty() {
        return Err("filename is empty".to_string());
    }
    if trimmed.chars().any(|c| INVALID_FILENAME_CHARS.contains(&c) || c.is_control()) {
        return Err("filename contains invalid characters".to_string());
    }
    Ok(())
}

/// Use the declared MIME type when it parses, otherwise map from the file
/// extension, otherwise fall back to octet-stream.
fn resolve_content_type(spec: &AttachmentSpec) -> String {
    if let Some(declared) = &spec.content_type {
        if declared.parse::<mime_guess::mime::Mime>().is_ok() {
            return declared.clone();
        }
    }

    mime_guess::from_path(&spec.filename)
        .first_raw()
        .unwrap_or("application/octet-stream")
        .to_string()
}

/// Decode the queue row's serialized attachment list.
pub fn specs_from_json(value: &serde_json::Value) -> anyhow::Result<Vec<AttachmentSpec>> {
    Ok(serde_json::from_value(value.clone())?)
}
