use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{Mutex, mpsc};
use tracing::info;

use inkframe::config::FrameConfig;
use inkframe::display::{DisplaySession, Panel, VirtualPanel};
use inkframe::mailbox::{ImapMailbox, Mailbox};
use inkframe::notify::{Notifier, SmtpNotifier};
use inkframe::pipeline::Pipeline;
use inkframe::poller::Poller;
use inkframe::store::CursorStore;
use inkframe::watcher::{self, Watcher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let config = FrameConfig::from_env().context("loading configuration")?;
    let _log_guard = init_logging(config.log_dir.as_deref());
    info!("inkframe starting: {}", config.summary());

    config
        .ensure_dirs()
        .context("creating data/temp directories")?;

    let store = CursorStore::load(&config.state_file, config.default_orientation);
    info!(
        last_processed_uid = store.last_processed_uid(),
        orientation = %store.orientation(),
        "loaded persisted state"
    );
    let orientation = store.orientation();
    let store = Arc::new(Mutex::new(store));
    let session = Arc::new(Mutex::new(DisplaySession::new(orientation)));

    let mailbox: Arc<dyn Mailbox> = Arc::new(ImapMailbox::new(&config));
    let notifier: Arc<dyn Notifier> = Arc::new(SmtpNotifier::new(&config));
    let panel: Arc<dyn Panel> = Arc::new(VirtualPanel::new(
        config.panel_width,
        config.panel_height,
        config.panel_dump.clone(),
    ));

    let (input_tx, input_rx) = mpsc::channel(8);
    let _input_source = watcher::spawn_stdin_source(input_tx);
    let _watcher = Watcher::new(
        &config,
        Arc::clone(&store),
        Arc::clone(&session),
        Arc::clone(&panel),
    )
    .spawn(input_rx);

    let pipeline = Arc::new(Pipeline::new(
        &config,
        Arc::clone(&mailbox),
        notifier,
        panel,
        store,
        session,
    ));

    // Runs until the process is killed.
    let (poll_handle, _shutdown) = Poller::new(&config, mailbox, pipeline).spawn();
    poll_handle.await.context("poll loop task failed")?;
    Ok(())
}

/// Stderr logging, plus a daily-rotated file layer when a log directory is
/// configured. The returned guard must live as long as the process so
/// buffered file output gets flushed.
fn init_logging(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match log_dir {
        Some(dir) if std::fs::create_dir_all(dir).is_ok() => {
            let appender = tracing_appender::rolling::daily(dir, "inkframe.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .init();
            None
        }
    }
}
