//! Mailbox poll/notify loop.
//!
//! Discovers pending uids forever: one startup pass over whatever is
//! already in the folder, then either a blocking IDLE wait (bounded by the
//! configured timeout) or a fixed-interval sleep, followed by a full
//! listing that goes to the pipeline. Mailbox faults are logged, diagnosed
//! with a quick connectivity probe, and retried after the poll interval;
//! the loop never exits on its own.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::FrameConfig;
use crate::error::MailboxError;
use crate::mailbox::Mailbox;
use crate::pipeline::Pipeline;

/// Well-known public resolvers, used only to tell "network down" from
/// "mail server down" in logs.
const PROBE_ADDRS: [&str; 3] = ["1.1.1.1:53", "8.8.8.8:53", "9.9.9.9:53"];

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Endless discovery loop feeding the pipeline.
pub struct Poller {
    mailbox: Arc<dyn Mailbox>,
    pipeline: Arc<Pipeline>,
    poll_interval: Duration,
    idle_timeout: Duration,
}

impl Poller {
    pub fn new(config: &FrameConfig, mailbox: Arc<dyn Mailbox>, pipeline: Arc<Pipeline>) -> Self {
        Self {
            mailbox,
            pipeline,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
        }
    }

    /// Spawn the loop as a background task. Setting the returned flag makes
    /// it wind down after the current iteration.
    pub fn spawn(self) -> (JoinHandle<()>, Arc<AtomicBool>) {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = tokio::spawn(async move { self.run(shutdown).await });
        (handle, flag)
    }

    pub async fn run(&self, shutdown: Arc<AtomicBool>) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            idle_timeout_secs = self.idle_timeout.as_secs(),
            "poll loop started"
        );

        // Startup pass: whatever accumulated while the process was down.
        self.poll_and_process().await;

        // Whether IDLE is worth trying on the current connection. Reset on
        // any mailbox fault, since the next operation builds a fresh
        // connection that may well support it.
        let mut idle_usable = true;

        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("poll loop shutting down");
                return;
            }

            if idle_usable {
                match self.mailbox.wait_for_change(self.idle_timeout).await {
                    Ok(true) => debug!("change notification received"),
                    Ok(false) => debug!("wait timed out, listing anyway"),
                    Err(MailboxError::IdleUnsupported) => {
                        info!("server lacks IDLE, using fixed-interval polling");
                        idle_usable = false;
                        continue;
                    }
                    Err(e) => {
                        self.report_fault("wait for change", &e).await;
                        tokio::time::sleep(self.poll_interval).await;
                        continue;
                    }
                }
            } else {
                tokio::time::sleep(self.poll_interval).await;
            }

            if shutdown.load(Ordering::Relaxed) {
                info!("poll loop shutting down");
                return;
            }
            if !self.poll_and_process().await {
                // A listing fault tears the connection down; the rebuilt
                // one gets a fresh shot at IDLE.
                idle_usable = true;
            }
        }
    }

    /// One listing plus pipeline pass. Returns false on a mailbox fault,
    /// after logging it and sleeping the poll interval.
    async fn poll_and_process(&self) -> bool {
        let uids = match self.mailbox.list_pending().await {
            Ok(uids) => uids,
            Err(e) => {
                self.report_fault("listing", &e).await;
                tokio::time::sleep(self.poll_interval).await;
                return false;
            }
        };
        debug!(count = uids.len(), "listed mailbox");
        self.pipeline.process_batch(uids).await;
        true
    }

    async fn report_fault(&self, operation: &str, error: &MailboxError) {
        if probe_connectivity().await {
            warn!(operation, %error, "mailbox fault; network is up, server unreachable or unhappy");
        } else {
            warn!(operation, %error, "mailbox fault; network appears to be down");
        }
    }
}

/// True if any well-known DNS server answers a TCP dial on port 53.
async fn probe_connectivity() -> bool {
    tokio::task::spawn_blocking(|| {
        PROBE_ADDRS.iter().any(|addr| {
            addr.parse::<SocketAddr>().is_ok_and(|addr| {
                std::net::TcpStream::connect_timeout(&addr, PROBE_TIMEOUT).is_ok()
            })
        })
    })
    .await
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::{DisplaySession, Orientation, Panel, Renderable};
    use crate::error::DisplayError;
    use crate::error::NotifyError;
    use crate::mailbox::Uid;
    use crate::notify::{Notifier, ReplyAttachment};
    use crate::store::CursorStore;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;
    use tokio::sync::Mutex;

    // ── Mocks ───────────────────────────────────────────────────────

    struct ScriptedMailbox {
        // One entry per wait_for_change call, consumed in order; when the
        // script runs out the wait just reports a timeout.
        wait_script: StdMutex<Vec<Result<bool, MailboxError>>>,
        wait_calls: AtomicUsize,
        message: Vec<u8>,
        uid: Uid,
    }

    #[async_trait::async_trait]
    impl Mailbox for ScriptedMailbox {
        async fn list_pending(&self) -> Result<Vec<Uid>, MailboxError> {
            Ok(vec![self.uid])
        }

        async fn fetch(&self, uid: Uid) -> Result<Vec<u8>, MailboxError> {
            if uid == self.uid {
                Ok(self.message.clone())
            } else {
                Err(MailboxError::NotFound { uid })
            }
        }

        async fn delete(&self, _uid: Uid) -> Result<(), MailboxError> {
            Ok(())
        }

        async fn empty_trash(&self) -> Result<(), MailboxError> {
            Ok(())
        }

        async fn wait_for_change(&self, _timeout: Duration) -> Result<bool, MailboxError> {
            self.wait_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.wait_script.lock().unwrap().pop().unwrap_or(Ok(false))
        }
    }

    struct CountingNotifier {
        sent: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Notifier for CountingNotifier {
        async fn send(
            &self,
            _to: &str,
            _subject: &str,
            _plain_body: &str,
            _html_body: Option<&str>,
            _attachments: Vec<ReplyAttachment>,
        ) -> Result<(), NotifyError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct NullPanel;

    impl Panel for NullPanel {
        fn resolution(&self) -> (u32, u32) {
            (60, 44)
        }

        fn show(&self, _renderable: &Renderable) -> Result<(), DisplayError> {
            Ok(())
        }
    }

    // ── Fixtures ────────────────────────────────────────────────────

    fn image_email() -> Vec<u8> {
        use lettre::message::header::ContentType;
        use lettre::message::{Attachment, MultiPart, SinglePart};
        let img = image::RgbImage::from_pixel(8, 8, image::Rgb([10, 20, 30]));
        let mut png = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        lettre::Message::builder()
            .from("Sender <sender@example.com>".parse().unwrap())
            .to("frame@example.com".parse().unwrap())
            .subject("picture")
            .multipart(
                MultiPart::mixed()
                    .singlepart(SinglePart::plain("hi".to_string()))
                    .singlepart(
                        Attachment::new("photo.png".to_string())
                            .body(png, ContentType::parse("image/png").unwrap()),
                    ),
            )
            .unwrap()
            .formatted()
    }

    fn build_poller(
        mailbox: Arc<ScriptedMailbox>,
        notifier: Arc<CountingNotifier>,
        poll_interval_secs: u64,
    ) -> (Poller, TempDir, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let data_dir = TempDir::new().unwrap();
        let config = FrameConfig {
            imap_host: "imap.example.com".into(),
            imap_port: 993,
            imap_user: "frame@example.com".into(),
            imap_password: "secret".into(),
            mailbox: "INBOX".into(),
            trash: "Trash".into(),
            smtp_host: "smtp.example.com".into(),
            smtp_port: 587,
            smtp_user: "frame@example.com".into(),
            smtp_password: "secret".into(),
            device_name: "Picture Frame".into(),
            default_orientation: Orientation::Landscape,
            saturation: 0.5,
            attachment_max_bytes: 20 * 1024 * 1024,
            poll_interval_secs,
            idle_timeout_secs: 1,
            debounce_secs: 15,
            data_dir: data_dir.path().to_path_buf(),
            temp_dir: temp_dir.path().to_path_buf(),
            state_file: data_dir.path().join("frame_state.json"),
            panel_width: 60,
            panel_height: 44,
            panel_dump: None,
            log_dir: None,
        };

        let store = Arc::new(Mutex::new(CursorStore::load(
            &config.state_file,
            Orientation::Landscape,
        )));
        let session = Arc::new(Mutex::new(DisplaySession::new(Orientation::Landscape)));
        let pipeline = Arc::new(Pipeline::new(
            &config,
            Arc::clone(&mailbox) as Arc<dyn Mailbox>,
            notifier as Arc<dyn Notifier>,
            Arc::new(NullPanel) as Arc<dyn Panel>,
            store,
            session,
        ));
        let poller = Poller::new(&config, mailbox as Arc<dyn Mailbox>, pipeline);
        (poller, temp_dir, data_dir)
    }

    async fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        done()
    }

    // ── Tests ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn startup_pass_processes_pending_before_first_wait() {
        let mailbox = Arc::new(ScriptedMailbox {
            wait_script: StdMutex::new(Vec::new()),
            wait_calls: AtomicUsize::new(0),
            message: image_email(),
            uid: 3,
        });
        let notifier = Arc::new(CountingNotifier {
            sent: AtomicUsize::new(0),
        });
        let (poller, _t, _d) = build_poller(Arc::clone(&mailbox), Arc::clone(&notifier), 60);

        let (handle, shutdown) = poller.spawn();
        let replied = wait_until(Duration::from_secs(10), || {
            notifier.sent.load(Ordering::SeqCst) == 1
        })
        .await;
        shutdown.store(true, Ordering::Relaxed);
        handle.abort();

        assert!(replied, "the pending message was processed");
    }

    #[tokio::test]
    async fn idle_unsupported_falls_back_to_interval_polling() {
        let mailbox = Arc::new(ScriptedMailbox {
            wait_script: StdMutex::new(vec![Err(MailboxError::IdleUnsupported)]),
            wait_calls: AtomicUsize::new(0),
            message: image_email(),
            uid: 3,
        });
        let notifier = Arc::new(CountingNotifier {
            sent: AtomicUsize::new(0),
        });
        // Zero poll interval keeps the fallback path fast under test.
        let (poller, _t, _d) = build_poller(Arc::clone(&mailbox), Arc::clone(&notifier), 0);

        let (handle, shutdown) = poller.spawn();
        let replied = wait_until(Duration::from_secs(10), || {
            notifier.sent.load(Ordering::SeqCst) >= 1
        })
        .await;
        // Give the fallback loop a few more iterations, then stop.
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.store(true, Ordering::Relaxed);
        handle.abort();

        assert!(replied);
        assert_eq!(
            mailbox.wait_calls.load(Ordering::SeqCst),
            1,
            "IDLE is not retried once the server declines it"
        );
    }
}
