//! Control-input watcher.
//!
//! Listens for input events on an mpsc channel and flips the display
//! orientation: persist the new value, re-prepare the current image (or
//! the newest stored one when nothing was shown this run) and redraw.
//! Events inside the debounce window are dropped, since the panel takes
//! on the order of the window to refresh anyway.
//!
//! The default event source reads stdin lines; a GPIO button driver can
//! feed the same channel on real hardware.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::FrameConfig;
use crate::display::{self, DisplaySession, Panel};
use crate::store::CursorStore;

/// Control inputs the frame reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    /// Flip landscape↔portrait and redraw (button A on the hardware).
    ToggleOrientation,
}

/// Debounced consumer of [`InputEvent`]s.
pub struct Watcher {
    store: Arc<Mutex<CursorStore>>,
    session: Arc<Mutex<DisplaySession>>,
    panel: Arc<dyn Panel>,
    data_dir: PathBuf,
    saturation: f32,
    debounce: Duration,
}

impl Watcher {
    pub fn new(
        config: &FrameConfig,
        store: Arc<Mutex<CursorStore>>,
        session: Arc<Mutex<DisplaySession>>,
        panel: Arc<dyn Panel>,
    ) -> Self {
        Self {
            store,
            session,
            panel,
            data_dir: config.data_dir.clone(),
            saturation: config.saturation,
            debounce: Duration::from_secs(config.debounce_secs),
        }
    }

    pub fn spawn(self, rx: mpsc::Receiver<InputEvent>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(rx).await })
    }

    /// Drain events until the channel closes.
    pub async fn run(self, mut rx: mpsc::Receiver<InputEvent>) {
        let mut last_accepted: Option<Instant> = None;
        while let Some(event) = rx.recv().await {
            if let Some(at) = last_accepted {
                let since = at.elapsed();
                if since < self.debounce {
                    debug!(
                        ?event,
                        remaining_ms = (self.debounce - since).as_millis() as u64,
                        "input ignored, debounce active"
                    );
                    continue;
                }
            }
            last_accepted = Some(Instant::now());
            match event {
                InputEvent::ToggleOrientation => self.toggle_orientation().await,
            }
        }
        debug!("input channel closed, watcher exiting");
    }

    /// Flip the orientation, persist it, and redraw the current image.
    ///
    /// The session lock is held for the whole operation so the redraw can
    /// never interleave with a pipeline display.
    async fn toggle_orientation(&self) {
        let mut session = self.session.lock().await;
        let orientation = session.orientation.toggled();
        session.orientation = orientation;
        info!(%orientation, "orientation toggled");

        if let Err(e) = self.store.lock().await.set_orientation(orientation) {
            error!(error = %e, "failed to persist orientation; a restart will revert it");
        }

        let path = match &session.source_path {
            Some(path) => path.clone(),
            None => match display::find_latest_image(&self.data_dir) {
                Some(path) => {
                    info!(path = %path.display(), "nothing shown yet, redrawing newest stored image");
                    path
                }
                None => {
                    warn!("no image available to redraw after orientation toggle");
                    return;
                }
            },
        };

        let saturation = self.saturation;
        let resolution = self.panel.resolution();
        let prep_path = path.clone();
        let prepared = tokio::task::spawn_blocking(move || {
            display::prepare(&prep_path, orientation, saturation, resolution)
        })
        .await;
        let prepared = match prepared {
            Ok(Ok(prepared)) => prepared,
            Ok(Err(e)) => {
                error!(path = %path.display(), error = %e, "failed to prepare image after toggle");
                return;
            }
            Err(e) => {
                error!(error = %e, "preparation task failed");
                return;
            }
        };

        let panel = Arc::clone(&self.panel);
        let renderable = prepared.renderable;
        match tokio::task::spawn_blocking(move || panel.show(&renderable)).await {
            Ok(Ok(())) => {
                session.source_path = Some(path);
                info!(%orientation, "redrew after orientation toggle");
            }
            Ok(Err(e)) => error!(error = %e, "panel refresh failed after toggle"),
            Err(e) => error!(error = %e, "display task failed"),
        }
    }
}

/// Feed stdin lines into the event channel: `a` (case-insensitive) acts as
/// button A. Exits on EOF.
pub fn spawn_stdin_source(tx: mpsc::Sender<InputEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let Some(event) = event_for_line(&line) else {
                        debug!(line = %line.trim(), "unmapped input line");
                        continue;
                    };
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "stdin read failed, input source exiting");
                    break;
                }
            }
        }
    })
}

fn event_for_line(line: &str) -> Option<InputEvent> {
    match line.trim() {
        "a" | "A" => Some(InputEvent::ToggleOrientation),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::{Orientation, Renderable};
    use crate::error::DisplayError;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    struct RecordingPanel {
        shown: StdMutex<Vec<(u32, u32)>>,
    }

    impl Panel for RecordingPanel {
        fn resolution(&self) -> (u32, u32) {
            (60, 44)
        }

        fn show(&self, renderable: &Renderable) -> Result<(), DisplayError> {
            self.shown
                .lock()
                .unwrap()
                .push(renderable.frame.dimensions());
            Ok(())
        }
    }

    fn write_png(dir: &std::path::Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        image::RgbImage::from_pixel(100, 80, image::Rgb([5, 5, 5]))
            .save_with_format(&path, image::ImageFormat::Png)
            .unwrap();
        path
    }

    fn build_watcher(
        data_dir: &TempDir,
        debounce_secs: u64,
    ) -> (Watcher, Arc<Mutex<CursorStore>>, Arc<Mutex<DisplaySession>>, Arc<RecordingPanel>) {
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
            poll_interval_secs: 60,
            idle_timeout_secs: 900,
            debounce_secs,
            data_dir: data_dir.path().to_path_buf(),
            temp_dir: data_dir.path().to_path_buf(),
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
        let panel = Arc::new(RecordingPanel {
            shown: StdMutex::new(Vec::new()),
        });
        let watcher = Watcher::new(
            &config,
            Arc::clone(&store),
            Arc::clone(&session),
            Arc::clone(&panel) as Arc<dyn Panel>,
        );
        (watcher, store, session, panel)
    }

    // ── Toggling ────────────────────────────────────────────────────

    #[tokio::test]
    async fn toggle_flips_persists_and_redraws_latest() {
        let dir = TempDir::new().unwrap();
        write_png(dir.path(), "photo.png");
        let (watcher, store, session, panel) = build_watcher(&dir, 0);

        let (tx, rx) = mpsc::channel(4);
        let handle = watcher.spawn(rx);
        tx.send(InputEvent::ToggleOrientation).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(session.lock().await.orientation, Orientation::Portrait);
        assert_eq!(store.lock().await.orientation(), Orientation::Portrait);
        assert_eq!(
            panel.shown.lock().unwrap().as_slice(),
            &[(60, 44)],
            "one redraw at panel resolution"
        );
        assert!(
            session.lock().await.source_path.is_some(),
            "latest stored image became the session source"
        );
    }

    #[tokio::test]
    async fn rapid_toggles_collapse_into_one() {
        let dir = TempDir::new().unwrap();
        write_png(dir.path(), "photo.png");
        let (watcher, _store, session, panel) = build_watcher(&dir, 30);

        let (tx, rx) = mpsc::channel(4);
        let handle = watcher.spawn(rx);
        tx.send(InputEvent::ToggleOrientation).await.unwrap();
        tx.send(InputEvent::ToggleOrientation).await.unwrap();
        tx.send(InputEvent::ToggleOrientation).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(panel.shown.lock().unwrap().len(), 1, "debounce ate the repeats");
        assert_eq!(
            session.lock().await.orientation,
            Orientation::Portrait,
            "only one flip happened"
        );
    }

    #[tokio::test]
    async fn toggle_without_any_image_still_flips_and_persists() {
        let dir = TempDir::new().unwrap();
        let (watcher, store, session, panel) = build_watcher(&dir, 0);

        let (tx, rx) = mpsc::channel(4);
        let handle = watcher.spawn(rx);
        tx.send(InputEvent::ToggleOrientation).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(session.lock().await.orientation, Orientation::Portrait);
        assert_eq!(store.lock().await.orientation(), Orientation::Portrait);
        assert!(panel.shown.lock().unwrap().is_empty(), "nothing to redraw");
    }

    // ── Input mapping ───────────────────────────────────────────────

    #[test]
    fn stdin_lines_map_to_events() {
        assert_eq!(event_for_line("a"), Some(InputEvent::ToggleOrientation));
        assert_eq!(event_for_line(" A "), Some(InputEvent::ToggleOrientation));
        assert_eq!(event_for_line(""), None);
        assert_eq!(event_for_line("quit"), None);
    }
}
