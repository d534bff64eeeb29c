//! Per-message processing pipeline.
//!
//! **Core invariant: every uid above the cursor gets exactly one pass,
//! and exactly one reply when its message can be fetched and names a
//! sender.**
//!
//! Steps, in fixed order: fetch → extract → prepare → notify → delete →
//! display → cursor advance. Each step reports its outcome as a plain
//! value; a failed step is logged and the pipeline moves on to the next
//! step rather than rolling anything back. Cursor advance is reached by
//! ordinary control flow whenever the fetch succeeded, so a permanently
//! broken message can never wedge the loop.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::FrameConfig;
use crate::display::{self, DisplaySession, Panel, Prepared};
use crate::extract::{self, ProcessOutcome, RejectReason};
use crate::mailbox::{Mailbox, Uid};
use crate::notify::{self, Notifier, ReplyAttachment, ReplyContent};
use crate::store::CursorStore;

/// Orchestrates one message at a time through the fixed step sequence.
pub struct Pipeline {
    mailbox: Arc<dyn Mailbox>,
    notifier: Arc<dyn Notifier>,
    panel: Arc<dyn Panel>,
    store: Arc<Mutex<CursorStore>>,
    session: Arc<Mutex<DisplaySession>>,
    device_name: String,
    temp_dir: PathBuf,
    data_dir: PathBuf,
    max_attachment_bytes: u64,
    saturation: f32,
}

/// What preparation produced for one accepted message.
enum PrepStep {
    Ready { prepared: Prepared, path: PathBuf },
    Failed(String),
}

impl Pipeline {
    pub fn new(
        config: &FrameConfig,
        mailbox: Arc<dyn Mailbox>,
        notifier: Arc<dyn Notifier>,
        panel: Arc<dyn Panel>,
        store: Arc<Mutex<CursorStore>>,
        session: Arc<Mutex<DisplaySession>>,
    ) -> Self {
        Self {
            mailbox,
            notifier,
            panel,
            store,
            session,
            device_name: config.device_name.clone(),
            temp_dir: config.temp_dir.clone(),
            data_dir: config.data_dir.clone(),
            max_attachment_bytes: config.attachment_max_bytes,
            saturation: config.saturation,
        }
    }

    /// Process a batch of uids in ascending order.
    ///
    /// Uids at or below the cursor are skipped with zero side effects, so
    /// re-delivered listings are harmless. Returns the number of messages
    /// that went through the step sequence.
    pub async fn process_batch(&self, mut uids: Vec<Uid>) -> usize {
        uids.sort_unstable();
        uids.dedup();

        let mut handled = 0;
        for uid in uids {
            let cursor = self.store.lock().await.last_processed_uid();
            if uid <= cursor {
                debug!(uid, cursor, "uid already processed, skipping");
                continue;
            }
            self.process_one(uid).await;
            handled += 1;
        }
        if handled > 0 {
            info!(handled, "batch complete");
        }
        handled
    }

    /// Run one uid through the full step sequence.
    async fn process_one(&self, uid: Uid) {
        // Step 1: fetch. The only step whose failure skips the cursor
        // advance; the uid reappears in the next listing and is retried.
        let raw = match self.mailbox.fetch(uid).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(uid, error = %e, "fetch failed, will retry next batch");
                return;
            }
        };
        info!(uid, bytes = raw.len(), "fetched message");

        let sender = sender_address(&raw);

        // Step 2: extract. Infallible by construction; a panic inside the
        // blocking task is contained here so the sender still gets a reply.
        let outcome = self.extract(raw).await;

        // Step 3: prepare the first stored image for the panel.
        let prep = match &outcome {
            ProcessOutcome::Accepted { paths } => Some(self.prepare(uid, paths[0].clone()).await),
            ProcessOutcome::Rejected { .. } => None,
        };

        // Step 4: exactly one reply, template picked by outcome.
        match &sender {
            Some(to) => self.notify(uid, to, &outcome, prep.as_ref()).await,
            None => warn!(uid, "message has no usable From address, no reply sent"),
        }

        // Step 5: delete and empty trash, both best-effort.
        if let Err(e) = self.mailbox.delete(uid).await {
            warn!(uid, error = %e, "failed to delete message from mailbox");
        }
        if let Err(e) = self.mailbox.empty_trash().await {
            warn!(uid, error = %e, "failed to empty trash");
        }

        // Step 6: display, only when preparation produced a frame.
        if let Some(PrepStep::Ready { prepared, path }) = prep {
            self.show(uid, prepared, path).await;
        }

        // Step 7: cursor advance, unconditional once the fetch succeeded.
        let mut store = self.store.lock().await;
        let next = store.last_processed_uid().max(uid);
        if let Err(e) = store.set_last_processed_uid(next) {
            error!(uid, error = %e, "cursor write failed; a restart may reprocess this message");
        }
    }

    async fn extract(&self, raw: Vec<u8>) -> ProcessOutcome {
        let temp_dir = self.temp_dir.clone();
        let data_dir = self.data_dir.clone();
        let limit = self.max_attachment_bytes;
        match tokio::task::spawn_blocking(move || {
            extract::process_message(&raw, &temp_dir, &data_dir, limit)
        })
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "extraction task failed");
                ProcessOutcome::Rejected {
                    reason: RejectReason::NoValidImage,
                }
            }
        }
    }

    async fn prepare(&self, uid: Uid, path: PathBuf) -> PrepStep {
        let orientation = self.session.lock().await.orientation;
        let saturation = self.saturation;
        let resolution = self.panel.resolution();
        let prep_path = path.clone();
        let result = tokio::task::spawn_blocking(move || {
            display::prepare(&prep_path, orientation, saturation, resolution)
        })
        .await;
        match result {
            Ok(Ok(prepared)) => PrepStep::Ready { prepared, path },
            Ok(Err(e)) => {
                warn!(uid, error = %e, "image preparation failed");
                PrepStep::Failed(e.to_string())
            }
            Err(e) => {
                error!(uid, error = %e, "preparation task failed");
                PrepStep::Failed("image preparation was interrupted".to_string())
            }
        }
    }

    /// Pick the template and send the reply. Failures are logged and never
    /// block the remaining steps.
    async fn notify(&self, uid: Uid, to: &str, outcome: &ProcessOutcome, prep: Option<&PrepStep>) {
        let (content, attachments) = match outcome {
            ProcessOutcome::Rejected { reason } => {
                let text = notify::user_facing_reason(*reason, self.max_attachment_bytes);
                (notify::failure_reply(&self.device_name, &text), Vec::new())
            }
            ProcessOutcome::Accepted { .. } => match prep {
                Some(PrepStep::Ready { prepared, .. }) => match &prepared.preview_png {
                    Some(png) => (
                        notify::success_reply(&self.device_name, &prepared.warnings),
                        vec![ReplyAttachment {
                            filename: "preview.png".to_string(),
                            mime: "image/png".to_string(),
                            data: png.clone(),
                        }],
                    ),
                    // The image is stored and will be shown, but without a
                    // preview the success template would render a broken
                    // inline image.
                    None => (
                        notify::prep_failure_reply(
                            &self.device_name,
                            "A preview of your image could not be generated.",
                        ),
                        Vec::new(),
                    ),
                },
                Some(PrepStep::Failed(reason)) => (
                    notify::prep_failure_reply(&self.device_name, reason),
                    Vec::new(),
                ),
                // Preparation runs for every accepted message; this arm
                // only matters if that ever changes.
                None => (
                    notify::prep_failure_reply(
                        &self.device_name,
                        "The image could not be prepared for display.",
                    ),
                    Vec::new(),
                ),
            },
        };
        self.send_reply(uid, to, content, attachments).await;
    }

    async fn send_reply(
        &self,
        uid: Uid,
        to: &str,
        content: ReplyContent,
        attachments: Vec<ReplyAttachment>,
    ) {
        let result = self
            .notifier
            .send(
                to,
                &content.subject,
                &content.plain,
                Some(&content.html),
                attachments,
            )
            .await;
        match result {
            Ok(()) => info!(uid, to, subject = %content.subject, "reply sent"),
            Err(e) => warn!(uid, to, error = %e, "failed to send reply"),
        }
    }

    /// Push the frame to the panel and record it in the session. The
    /// session lock is held across the refresh so the input watcher can
    /// never drive the panel concurrently.
    async fn show(&self, uid: Uid, prepared: Prepared, path: PathBuf) {
        let mut session = self.session.lock().await;
        let panel = Arc::clone(&self.panel);
        let renderable = prepared.renderable;
        let result =
            tokio::task::spawn_blocking(move || panel.show(&renderable)).await;
        match result {
            Ok(Ok(())) => {
                info!(uid, path = %path.display(), "image displayed");
                session.source_path = Some(path);
            }
            Ok(Err(e)) => warn!(uid, error = %e, "panel refresh failed"),
            Err(e) => error!(uid, error = %e, "display task failed"),
        }
    }
}

/// First address in the From header, if the message parses and has one.
fn sender_address(raw: &[u8]) -> Option<String> {
    mail_parser::MessageParser::default()
        .parse(raw)?
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
}
