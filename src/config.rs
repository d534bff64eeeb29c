//! Configuration, built from `INKFRAME_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;

use crate::display::Orientation;
use crate::error::ConfigError;

/// Frame daemon configuration.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// IMAP server host.
    pub imap_host: String,
    /// IMAP server port (implicit TLS).
    pub imap_port: u16,
    /// IMAP login name.
    pub imap_user: String,
    /// IMAP password.
    pub imap_password: String,
    /// Folder polled for incoming images.
    pub mailbox: String,
    /// Folder expunged after deletes.
    pub trash: String,
    /// SMTP server host (STARTTLS).
    pub smtp_host: String,
    /// SMTP server port.
    pub smtp_port: u16,
    /// SMTP login name.
    pub smtp_user: String,
    /// SMTP password.
    pub smtp_password: String,
    /// Device name used in reply subjects and bodies.
    pub device_name: String,
    /// Display orientation applied when no persisted value exists yet.
    pub default_orientation: Orientation,
    /// Panel saturation, clamped to 0.0..=1.0.
    pub saturation: f32,
    /// Upper bound on a single decoded attachment.
    pub attachment_max_bytes: u64,
    /// Sleep between polls when the server offers no change notification.
    pub poll_interval_secs: u64,
    /// Upper bound on one blocking wait for a mailbox change.
    pub idle_timeout_secs: u64,
    /// Window in which repeated control inputs collapse into one.
    pub debounce_secs: u64,
    /// Directory holding validated images.
    pub data_dir: PathBuf,
    /// Directory for candidate temp files; must share a filesystem with
    /// `data_dir` so promotion is a rename, not a copy.
    pub temp_dir: PathBuf,
    /// Path of the persisted cursor/orientation record.
    pub state_file: PathBuf,
    /// Panel width in pixels.
    pub panel_width: u32,
    /// Panel height in pixels.
    pub panel_height: u32,
    /// When set, frames are also written here as PNG (virtual panel).
    pub panel_dump: Option<PathBuf>,
    /// When set, logs are additionally written to daily files here.
    pub log_dir: Option<PathBuf>,
}

impl FrameConfig {
    /// Build config from environment variables.
    ///
    /// `INKFRAME_IMAP_HOST`, `INKFRAME_IMAP_USER` and `INKFRAME_IMAP_PASSWORD`
    /// are required; everything else has a default. SMTP credentials fall
    /// back to the IMAP ones.
    pub fn from_env() -> Result<Self, ConfigError> {
        let imap_host = require_var("INKFRAME_IMAP_HOST")?;
        let imap_user = require_var("INKFRAME_IMAP_USER")?;
        let imap_password = require_var("INKFRAME_IMAP_PASSWORD")?;

        let smtp_host = std::env::var("INKFRAME_SMTP_HOST")
            .unwrap_or_else(|_| imap_host.replace("imap", "smtp"));
        let smtp_user =
            std::env::var("INKFRAME_SMTP_USER").unwrap_or_else(|_| imap_user.clone());
        let smtp_password =
            std::env::var("INKFRAME_SMTP_PASSWORD").unwrap_or_else(|_| imap_password.clone());

        let data_dir: PathBuf = std::env::var("INKFRAME_DATA_DIR")
            .unwrap_or_else(|_| "data".to_string())
            .into();
        let temp_dir: PathBuf = std::env::var("INKFRAME_TMP_DIR")
            .unwrap_or_else(|_| "tmp".to_string())
            .into();
        let state_file: PathBuf = match std::env::var("INKFRAME_STATE_FILE") {
            Ok(p) => p.into(),
            Err(_) => data_dir.join("frame_state.json"),
        };

        Ok(Self {
            imap_host,
            imap_port: parse_var("INKFRAME_IMAP_PORT", 993)?,
            imap_user,
            imap_password,
            mailbox: string_var("INKFRAME_MAILBOX", "INBOX"),
            trash: string_var("INKFRAME_TRASH", "Trash"),
            smtp_host,
            smtp_port: parse_var("INKFRAME_SMTP_PORT", 587)?,
            smtp_user,
            smtp_password,
            device_name: string_var("INKFRAME_DEVICE_NAME", "Picture Frame"),
            default_orientation: parse_var("INKFRAME_ORIENTATION", Orientation::Landscape)?,
            saturation: parse_var("INKFRAME_SATURATION", 0.5f32)?.clamp(0.0, 1.0),
            attachment_max_bytes: parse_var("INKFRAME_ATTACHMENT_MAX_BYTES", 20 * 1024 * 1024)?,
            poll_interval_secs: parse_var("INKFRAME_POLL_INTERVAL_SECS", 60)?,
            idle_timeout_secs: parse_var("INKFRAME_IDLE_TIMEOUT_SECS", 900)?,
            debounce_secs: parse_var("INKFRAME_DEBOUNCE_SECS", 15)?,
            data_dir,
            temp_dir,
            state_file,
            panel_width: parse_var("INKFRAME_PANEL_WIDTH", 600)?,
            panel_height: parse_var("INKFRAME_PANEL_HEIGHT", 448)?,
            panel_dump: std::env::var("INKFRAME_PANEL_DUMP").ok().map(PathBuf::from),
            log_dir: std::env::var("INKFRAME_LOG_DIR").ok().map(PathBuf::from),
        })
    }

    /// Create the data and temp directories and the state file's parent.
    pub fn ensure_dirs(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.temp_dir)?;
        if let Some(parent) = self.state_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    /// One-line settings summary for the startup log, passwords masked.
    pub fn summary(&self) -> String {
        format!(
            "imap={}:{} user={} pass=***** mailbox={:?} trash={:?} \
             smtp={}:{} device={:?} orientation={} saturation={} \
             max_attachment={}B poll={}s idle={}s debounce={}s \
             data_dir={} temp_dir={} panel={}x{}",
            self.imap_host,
            self.imap_port,
            self.imap_user,
            self.mailbox,
            self.trash,
            self.smtp_host,
            self.smtp_port,
            self.device_name,
            self.default_orientation,
            self.saturation,
            self.attachment_max_bytes,
            self.poll_interval_secs,
            self.idle_timeout_secs,
            self.debounce_secs,
            self.data_dir.display(),
            self.temp_dir.display(),
            self.panel_width,
            self.panel_height,
        )
    }
}

fn require_var(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

fn string_var(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse an optional variable, failing loudly on a malformed value rather
/// than silently falling back to the default.
fn parse_var<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{e} (got {raw:?})"),
        }),
        Err(_) => Ok(default),
    }
}
