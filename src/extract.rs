//! Attachment extraction and validation.
//!
//! Flow per message:
//! 1. Parse the raw RFC 822 bytes and walk leaf parts carrying a
//!    Content-Disposition (structural multipart containers are skipped).
//! 2. Reject the whole message as soon as one decoded payload exceeds the
//!    size limit.
//! 3. Write each candidate to a fsynced temp file, sniff the real format
//!    from the bytes, fully decode to catch truncation and corruption.
//! 4. Promote validated files into the data directory by atomic rename
//!    under a deterministic content-hashed name.
//!
//! The function never fails outright: whatever happens inside, the caller
//! gets a [`ProcessOutcome`] it can answer the sender with.

use std::io::Write;
use std::path::{Path, PathBuf};

use mail_parser::{MessageParser, MessagePart, MimeHeaders, PartType};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// Closed reason taxonomy for rejected messages and attachments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// One decoded attachment exceeded the configured limit; the whole
    /// message is refused.
    AttachmentTooLarge,
    /// No attachment survived validation (also covers "no attachments at
    /// all": the stricter `NoAttachments` code stays reserved).
    NoValidImage,
    NoAttachments,
    /// Byte sniffing did not recognize any image format.
    InvalidMimeType,
    /// Sniffing succeeded but the full decode did not.
    ImageVerificationFailed,
}

impl RejectReason {
    /// Stable code for logs. User-facing text lives with the notifier.
    pub fn code(self) -> &'static str {
        match self {
            RejectReason::AttachmentTooLarge => "attachment_too_large",
            RejectReason::NoValidImage => "no_valid_image",
            RejectReason::NoAttachments => "no_attachments",
            RejectReason::InvalidMimeType => "invalid_mime_type",
            RejectReason::ImageVerificationFailed => "image_verification_failed",
        }
    }
}

/// Extraction outcome for one message. Returned by value, never mutated
/// afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// At least one image was validated and persisted; paths are in
    /// attachment order.
    Accepted { paths: Vec<PathBuf> },
    Rejected { reason: RejectReason },
}

impl ProcessOutcome {
    fn rejected(reason: RejectReason) -> Self {
        ProcessOutcome::Rejected { reason }
    }
}

/// Why a single attachment was skipped while the message as a whole
/// continued.
enum Skip {
    Reject(RejectReason),
    Io(std::io::Error),
}

/// Extract, validate and persist the image attachments of one raw message.
///
/// Size checking is fail-fast: one oversized attachment rejects the whole
/// message, even if earlier attachments were already promoted (those stay;
/// there is no rollback). Invalid images, by contrast, only skip that one
/// attachment. The asymmetry is intentional: oversize is a sender-policy
/// violation, corruption is a per-file accident.
pub fn process_message(
    raw: &[u8],
    temp_dir: &Path,
    data_dir: &Path,
    max_attachment_bytes: u64,
) -> ProcessOutcome {
    let Some(message) = MessageParser::default().parse(raw) else {
        debug!("message did not parse, nothing to extract");
        return ProcessOutcome::rejected(RejectReason::NoValidImage);
    };

    let mut stored: Vec<PathBuf> = Vec::new();

    for (index, part) in message.parts.iter().enumerate() {
        if !is_attachment_part(part) {
            continue;
        }
        let filename = part.attachment_name().unwrap_or("attachment");
        let payload = part.contents();

        if payload.is_empty() {
            debug!(index, filename, "skipping empty attachment payload");
            continue;
        }
        if payload.len() as u64 > max_attachment_bytes {
            info!(
                index,
                filename,
                size = payload.len(),
                limit = max_attachment_bytes,
                "attachment over size limit, rejecting message"
            );
            return ProcessOutcome::rejected(RejectReason::AttachmentTooLarge);
        }

        match validate_and_store(payload, filename, temp_dir, data_dir) {
            Ok(path) => {
                info!(index, filename, path = %path.display(), "stored attachment");
                stored.push(path);
            }
            Err(Skip::Reject(reason)) => {
                info!(index, filename, reason = reason.code(), "attachment rejected");
            }
            Err(Skip::Io(e)) => {
                warn!(index, filename, error = %e, "attachment skipped on IO error");
            }
        }
    }

    if stored.is_empty() {
        ProcessOutcome::rejected(RejectReason::NoValidImage)
    } else {
        ProcessOutcome::Accepted { paths: stored }
    }
}

/// Leaf parts with any Content-Disposition count as attachments, inline
/// ones included; multipart containers never do.
fn is_attachment_part(part: &MessagePart) -> bool {
    if matches!(part.body, PartType::Multipart(_)) {
        return false;
    }
    part.content_disposition().is_some()
}

/// Write the payload to a fsynced temp file, validate it, and promote it
/// into the data directory. The temp file is removed on any early return.
fn validate_and_store(
    payload: &[u8],
    filename: &str,
    temp_dir: &Path,
    data_dir: &Path,
) -> Result<PathBuf, Skip> {
    let stem = sanitize_stem(filename);

    let mut tmp = tempfile::Builder::new()
        .prefix("attach-")
        .suffix(&format!("-{stem}"))
        .tempfile_in(temp_dir)
        .map_err(Skip::Io)?;
    tmp.write_all(payload).map_err(Skip::Io)?;
    tmp.as_file().sync_all().map_err(Skip::Io)?;

    // Sniff from the bytes; the declared MIME type is untrusted.
    let format = image::guess_format(payload)
        .map_err(|_| Skip::Reject(RejectReason::InvalidMimeType))?;
    if let Err(e) = image::load_from_memory(payload) {
        debug!(filename, error = %e, "image verification failed");
        return Err(Skip::Reject(RejectReason::ImageVerificationFailed));
    }

    // Deterministic final name: identical bytes land on the identical
    // path, so reprocessing overwrites instead of accumulating copies.
    let digest = Sha256::digest(payload);
    let ext = format.extensions_str().first().copied().unwrap_or("img");
    let final_name = format!(
        "{stem}-{:02x}{:02x}{:02x}{:02x}.{ext}",
        digest[0], digest[1], digest[2], digest[3]
    );
    let final_path = data_dir.join(final_name);

    // Rename, never copy: same-filesystem rename is atomic, so the data
    // directory only ever contains fully written, validated files.
    tmp.persist(&final_path).map_err(|e| Skip::Io(e.error))?;
    Ok(final_path)
}

/// Strip the extension and anything path-like from a client-supplied
/// filename; it only serves as a human-readable hint in stored names.
fn sanitize_stem(filename: &str) -> String {
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("attachment");
    let cleaned: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(40)
        .collect();
    if cleaned.is_empty() {
        "attachment".to_string()
    } else {
        cleaned
    }
}
