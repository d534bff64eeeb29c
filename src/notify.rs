//! Outbound replies: the notifier seam, its SMTP implementation, and the
//! reply templates.
//!
//! Every processed message gets exactly one reply. The pipeline picks the
//! template; this module renders it and pushes it through lettre over
//! STARTTLS on a blocking thread.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox as EmailAddress, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use tracing::info;

use crate::config::FrameConfig;
use crate::error::NotifyError;
use crate::extract::RejectReason;

/// Content-ID the HTML templates use to reference the embedded preview.
pub const PREVIEW_CID: &str = "preview";

/// An in-memory attachment for a reply.
#[derive(Debug, Clone)]
pub struct ReplyAttachment {
    pub filename: String,
    pub mime: String,
    pub data: Vec<u8>,
}

impl ReplyAttachment {
    fn is_image(&self) -> bool {
        self.mime.starts_with("image/")
    }
}

/// The outbound mail seam.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send one reply. When `html_body` is present, the first image
    /// attachment is embedded inline under [`PREVIEW_CID`]; everything
    /// else rides along as a regular attachment.
    async fn send(
        &self,
        to: &str,
        subject: &str,
        plain_body: &str,
        html_body: Option<&str>,
        attachments: Vec<ReplyAttachment>,
    ) -> Result<(), NotifyError>;
}

// ── SMTP notifier ───────────────────────────────────────────────────

/// lettre-backed [`Notifier`].
pub struct SmtpNotifier {
    host: String,
    port: u16,
    user: String,
    password: String,
    from_address: String,
}

impl SmtpNotifier {
    pub fn new(config: &FrameConfig) -> Self {
        Self {
            host: config.smtp_host.clone(),
            port: config.smtp_port,
            user: config.smtp_user.clone(),
            password: config.smtp_password.clone(),
            from_address: config.smtp_user.clone(),
        }
    }

    fn transport(&self) -> Result<SmtpTransport, NotifyError> {
        let creds = Credentials::new(self.user.clone(), self.password.clone());
        Ok(SmtpTransport::starttls_relay(&self.host)
            .map_err(|e| NotifyError::Transport(e.to_string()))?
            .port(self.port)
            .credentials(creds)
            .build())
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        plain_body: &str,
        html_body: Option<&str>,
        attachments: Vec<ReplyAttachment>,
    ) -> Result<(), NotifyError> {
        let message = build_message(
            &self.from_address,
            to,
            subject,
            plain_body,
            html_body,
            attachments,
        )?;
        let transport = self.transport()?;

        let to = to.to_string();
        let subject = subject.to_string();
        tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| NotifyError::Transport(format!("send task failed: {e}")))?
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        info!(to = %to, subject = %subject, "reply sent");
        Ok(())
    }
}

/// Assemble the MIME tree:
///
/// ```text
/// mixed(
///   alternative(plain, related(html, inline preview)),
///   remaining attachments,
/// )
/// ```
///
/// degrading gracefully when there is no HTML part or no attachment.
fn build_message(
    from: &str,
    to: &str,
    subject: &str,
    plain_body: &str,
    html_body: Option<&str>,
    attachments: Vec<ReplyAttachment>,
) -> Result<Message, NotifyError> {
    let from: EmailAddress = from.parse().map_err(|e| NotifyError::InvalidAddress {
        address: from.to_string(),
        reason: format!("{e}"),
    })?;
    let to: EmailAddress = to.parse().map_err(|e| NotifyError::InvalidAddress {
        address: to.to_string(),
        reason: format!("{e}"),
    })?;

    let builder = Message::builder().from(from).to(to).subject(subject);

    let mut attachments = attachments;
    let inline = match html_body {
        Some(_) => {
            let first_image = attachments.iter().position(ReplyAttachment::is_image);
            first_image.map(|i| attachments.remove(i))
        }
        None => None,
    };

    let body = match (html_body, inline) {
        (Some(html), Some(preview)) => {
            let content_type = parse_mime(&preview.mime)?;
            let related = MultiPart::related()
                .singlepart(SinglePart::html(html.to_string()))
                .singlepart(
                    Attachment::new_inline(PREVIEW_CID.to_string())
                        .body(preview.data, content_type),
                );
            MultiPart::alternative()
                .singlepart(SinglePart::plain(plain_body.to_string()))
                .multipart(related)
        }
        (Some(html), None) => MultiPart::alternative()
            .singlepart(SinglePart::plain(plain_body.to_string()))
            .singlepart(SinglePart::html(html.to_string())),
        (None, _) => MultiPart::mixed().singlepart(SinglePart::plain(plain_body.to_string())),
    };

    let mut tree = MultiPart::mixed().multipart(body);
    for attachment in attachments {
        let content_type = parse_mime(&attachment.mime)?;
        tree = tree.singlepart(
            Attachment::new(attachment.filename).body(attachment.data, content_type),
        );
    }

    builder
        .multipart(tree)
        .map_err(|e| NotifyError::Build(e.to_string()))
}

fn parse_mime(mime: &str) -> Result<ContentType, NotifyError> {
    ContentType::parse(mime)
        .map_err(|e| NotifyError::Build(format!("bad content type {mime:?}: {e}")))
}

// ── User-facing reason mapping ──────────────────────────────────────

/// Human-readable text for a rejection. Technical codes never appear in
/// replies.
pub fn user_facing_reason(reason: RejectReason, max_attachment_bytes: u64) -> String {
    match reason {
        RejectReason::AttachmentTooLarge => format!(
            "The attachment was too large. Please send an image smaller than {} MB.",
            max_attachment_bytes / (1024 * 1024)
        ),
        RejectReason::NoValidImage => {
            "No valid image was found in your email. Please attach a JPEG, PNG, GIF, or BMP image."
                .to_string()
        }
        RejectReason::NoAttachments => {
            "Your email did not contain any attachments. Please attach an image file.".to_string()
        }
        RejectReason::InvalidMimeType => {
            "The file type is not supported. Please send a JPEG, PNG, GIF, or BMP image."
                .to_string()
        }
        RejectReason::ImageVerificationFailed => {
            "The image file appears to be corrupted or invalid. Please try a different image."
                .to_string()
        }
    }
}

// ── Reply templates ─────────────────────────────────────────────────

/// A rendered reply, ready for [`Notifier::send`].
#[derive(Debug, Clone)]
pub struct ReplyContent {
    pub subject: String,
    pub plain: String,
    pub html: String,
}

/// Image stored and queued for the panel; preview attached inline.
pub fn success_reply(device_name: &str, warnings: &[String]) -> ReplyContent {
    let mut plain = String::from("Your image was received and stored.");
    for warning in warnings {
        plain.push_str("\nNotice: ");
        plain.push_str(warning);
    }

    let warning_html = if warnings.is_empty() {
        String::new()
    } else {
        let items: String = warnings
            .iter()
            .map(|w| format!("<li>{}</li>", escape_html(w)))
            .collect();
        format!("<div class=\"notice\"><p><strong>Notice:</strong></p><ul>{items}</ul></div>")
    };
    let html = format!(
        "<html><body>\
         <h2>{device}</h2>\
         <p>Your image was received and stored. It will appear on the frame shortly.</p>\
         {warning_html}\
         <p><img src=\"cid:{cid}\" alt=\"preview\" style=\"max-width:100%\"/></p>\
         </body></html>",
        device = escape_html(device_name),
        cid = PREVIEW_CID,
    );

    ReplyContent {
        subject: format!("{device_name}: Image received"),
        plain,
        html,
    }
}

/// Image stored, but it could not be prepared for the panel.
pub fn prep_failure_reply(device_name: &str, reason: &str) -> ReplyContent {
    ReplyContent {
        subject: format!("{device_name}: Failed to prepare image"),
        plain: format!("Your image was stored but could not be prepared for display.\n{reason}"),
        html: format!(
            "<html><body>\
             <h2>{device}</h2>\
             <p>Your image was stored but could not be prepared for display.</p>\
             <p>{reason}</p>\
             </body></html>",
            device = escape_html(device_name),
            reason = escape_html(reason),
        ),
    }
}

/// Nothing usable in the message; `reason` comes from
/// [`user_facing_reason`].
pub fn failure_reply(device_name: &str, reason: &str) -> ReplyContent {
    ReplyContent {
        subject: format!("{device_name}: Image processing failed"),
        plain: format!("Reason: {reason}"),
        html: format!(
            "<html><body>\
             <h2>{device}</h2>\
             <p>Your email could not be processed.</p>\
             <p>{reason}</p>\
             </body></html>",
            device = escape_html(device_name),
            reason = escape_html(reason),
        ),
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use mail_parser::{MessageParser, MimeHeaders};

    fn tiny_png() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(4, 4, image::Rgb([9, 9, 9]));
        let mut buf = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    // ── Message assembly ────────────────────────────────────────────

    #[test]
    fn html_reply_embeds_preview_inline() {
        let payload = tiny_png();
        let message = build_message(
            "frame@example.com",
            "sender@example.com",
            "Picture Frame: Image received",
            "Your image was received.",
            Some("<html><body><img src=\"cid:preview\"/></body></html>"),
            vec![ReplyAttachment {
                filename: "preview.png".into(),
                mime: "image/png".into(),
                data: payload.clone(),
            }],
        )
        .unwrap();

        let raw = message.formatted();
        let parsed = MessageParser::default().parse(&raw[..]).unwrap();

        assert!(parsed.body_text(0).is_some(), "plain alternative present");
        assert!(parsed.body_html(0).is_some(), "html alternative present");

        let inline = parsed
            .parts
            .iter()
            .find(|p| p.content_id().is_some())
            .expect("an inline part with a content id");
        let cid = inline
            .content_id()
            .unwrap()
            .trim_start_matches('<')
            .trim_end_matches('>');
        assert_eq!(cid, PREVIEW_CID);
        assert_eq!(inline.contents(), &payload[..]);
    }

    #[test]
    fn plain_reply_has_no_html_part() {
        let message = build_message(
            "frame@example.com",
            "sender@example.com",
            "subject",
            "plain words",
            None,
            Vec::new(),
        )
        .unwrap();

        let raw = message.formatted();
        let parsed = MessageParser::default().parse(&raw[..]).unwrap();
        assert!(parsed.body_text(0).is_some());
        assert!(parsed.body_html(0).is_none());
    }

    #[test]
    fn bad_recipient_is_reported() {
        let result = build_message(
            "frame@example.com",
            "not an address",
            "subject",
            "body",
            None,
            Vec::new(),
        );
        assert!(matches!(result, Err(NotifyError::InvalidAddress { .. })));
    }

    #[test]
    fn non_image_attachments_are_not_inlined() {
        let message = build_message(
            "frame@example.com",
            "sender@example.com",
            "subject",
            "body",
            Some("<html><body>hi</body></html>"),
            vec![ReplyAttachment {
                filename: "log.txt".into(),
                mime: "text/plain".into(),
                data: b"log line".to_vec(),
            }],
        )
        .unwrap();

        let raw = message.formatted();
        let parsed = MessageParser::default().parse(&raw[..]).unwrap();
        assert!(
            parsed.parts.iter().all(|p| p.content_id().is_none()),
            "text attachments never become the inline preview"
        );
    }

    // ── Reason mapping ──────────────────────────────────────────────

    #[test]
    fn every_reason_maps_to_prose_without_its_code() {
        let reasons = [
            RejectReason::AttachmentTooLarge,
            RejectReason::NoValidImage,
            RejectReason::NoAttachments,
            RejectReason::InvalidMimeType,
            RejectReason::ImageVerificationFailed,
        ];
        for reason in reasons {
            let text = user_facing_reason(reason, 20 * 1024 * 1024);
            assert!(!text.is_empty());
            assert!(
                !text.contains(reason.code()),
                "technical code leaked into user text: {text}"
            );
        }
    }

    #[test]
    fn size_limit_is_spelled_out_in_megabytes() {
        let text = user_facing_reason(RejectReason::AttachmentTooLarge, 20 * 1024 * 1024);
        assert!(text.contains("20 MB"), "got: {text}");
    }

    // ── Templates ───────────────────────────────────────────────────

    #[test]
    fn success_reply_references_the_preview_cid() {
        let reply = success_reply("Picture Frame", &[]);
        assert_eq!(reply.subject, "Picture Frame: Image received");
        assert!(reply.html.contains(&format!("cid:{PREVIEW_CID}")));
        assert!(!reply.html.contains("notice"), "no warnings, no notice box");
    }

    #[test]
    fn success_reply_lists_warnings() {
        let warnings = vec!["EXIF orientation data could not be applied.".to_string()];
        let reply = success_reply("Picture Frame", &warnings);
        assert!(reply.plain.contains("Notice: EXIF orientation"));
        assert!(reply.html.contains("<li>EXIF orientation"));
    }

    #[test]
    fn templates_escape_markup() {
        let reply = failure_reply("<Frame & Co>", "a <b>bold</b> reason");
        assert!(reply.html.contains("&lt;Frame &amp; Co&gt;"));
        assert!(reply.html.contains("a &lt;b&gt;bold&lt;/b&gt; reason"));
    }
}
