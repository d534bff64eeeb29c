//! Image preparation and the panel seam.
//!
//! Preparation turns a stored image file into a frame sized for the panel:
//! EXIF orientation first, then the portrait rotation, then an aspect-fill
//! resize with a center crop. The emailed preview is the same frame rotated
//! back upright for portrait mounts.

use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use image::imageops::FilterType;
use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::DisplayError;

/// User-facing warning carried into the success reply when EXIF data is
/// present but unreadable.
const EXIF_WARNING: &str = "EXIF orientation data could not be applied. \
    Please check the preview to verify your image displays correctly.";

// ── Orientation ─────────────────────────────────────────────────────

/// Physical mounting of the panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Landscape,
    Portrait,
}

impl Orientation {
    pub fn toggled(self) -> Self {
        match self {
            Orientation::Landscape => Orientation::Portrait,
            Orientation::Portrait => Orientation::Landscape,
        }
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Orientation::Landscape => f.write_str("landscape"),
            Orientation::Portrait => f.write_str("portrait"),
        }
    }
}

impl FromStr for Orientation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "landscape" => Ok(Orientation::Landscape),
            "portrait" => Ok(Orientation::Portrait),
            other => Err(format!("expected \"landscape\" or \"portrait\", got {other:?}")),
        }
    }
}

// ── Prepared frames ─────────────────────────────────────────────────

/// A frame ready for the panel.
#[derive(Debug, Clone)]
pub struct Renderable {
    /// Pixels at exactly the panel resolution.
    pub frame: RgbImage,
    /// Panel saturation, 0.0..=1.0.
    pub saturation: f32,
}

/// Output of [`prepare`].
#[derive(Debug)]
pub struct Prepared {
    pub renderable: Renderable,
    /// PNG bytes for the reply email; `None` when encoding failed, which
    /// downgrades the reply but not the display.
    pub preview_png: Option<Vec<u8>>,
    /// User-facing notices (EXIF trouble and the like).
    pub warnings: Vec<String>,
}

/// Load, orient, rotate and resize `path` for a panel of `resolution`.
pub fn prepare(
    path: &Path,
    orientation: Orientation,
    saturation: f32,
    resolution: (u32, u32),
) -> Result<Prepared, DisplayError> {
    let mut warnings = Vec::new();

    let reader = ImageReader::open(path)
        .map_err(|e| DisplayError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?
        .with_guessed_format()
        .map_err(|e| DisplayError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

    let mut decoder = reader.into_decoder().map_err(|e| DisplayError::Decode {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    // A failed EXIF read is survivable; the sender just gets a warning to
    // double-check the preview.
    let exif = match decoder.orientation() {
        Ok(o) => Some(o),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "EXIF orientation unreadable");
            warnings.push(EXIF_WARNING.to_string());
            None
        }
    };

    let mut img = DynamicImage::from_decoder(decoder).map_err(|e| DisplayError::Decode {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    if let Some(exif) = exif {
        img.apply_orientation(exif);
    }

    // Portrait mounts are fed a frame rotated 90° counter-clockwise; the
    // panel itself always works in its native landscape geometry.
    if orientation == Orientation::Portrait {
        img = img.rotate270();
    }

    let (width, height) = resolution;
    let frame = img.resize_to_fill(width, height, FilterType::Lanczos3);

    let preview_png = match encode_preview(&frame, orientation) {
        Ok(png) => Some(png),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "preview encoding failed");
            None
        }
    };

    info!(path = %path.display(), %orientation, width, height, "prepared image");
    Ok(Prepared {
        renderable: Renderable {
            frame: frame.to_rgb8(),
            saturation,
        },
        preview_png,
        warnings,
    })
}

/// PNG-encode the frame, rotated back upright for portrait mounts so the
/// emailed preview is not sideways.
fn encode_preview(frame: &DynamicImage, orientation: Orientation) -> Result<Vec<u8>, DisplayError> {
    let upright = match orientation {
        Orientation::Landscape => frame.clone(),
        Orientation::Portrait => frame.rotate90(),
    };
    let mut buf = Vec::new();
    upright
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(|e| DisplayError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Newest image file in `data_dir` by modification time, if any.
///
/// Used when orientation is toggled before any message arrived this run:
/// the frame then redraws whatever it last stored.
pub fn find_latest_image(data_dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(data_dir).ok()?;
    let mut files: Vec<(std::time::SystemTime, PathBuf)> = entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            let ext = path.extension()?.to_str()?;
            ImageFormat::from_extension(ext)?;
            let mtime = entry.metadata().ok()?.modified().ok()?;
            Some((mtime, path))
        })
        .collect();
    files.sort_by_key(|(mtime, _)| std::cmp::Reverse(*mtime));
    files.into_iter().next().map(|(_, path)| path)
}

// ── Panel ───────────────────────────────────────────────────────────

/// The display device seam.
pub trait Panel: Send + Sync {
    /// Native resolution in landscape geometry.
    fn resolution(&self) -> (u32, u32);

    /// Push a frame to the device. Expected to block for the refresh.
    fn show(&self, renderable: &Renderable) -> Result<(), DisplayError>;
}

/// Panel stand-in for machines without the e-paper hardware: logs every
/// frame and optionally writes it to a PNG file.
pub struct VirtualPanel {
    width: u32,
    height: u32,
    dump_path: Option<PathBuf>,
}

impl VirtualPanel {
    pub fn new(width: u32, height: u32, dump_path: Option<PathBuf>) -> Self {
        Self {
            width,
            height,
            dump_path,
        }
    }
}

impl Panel for VirtualPanel {
    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn show(&self, renderable: &Renderable) -> Result<(), DisplayError> {
        info!(
            width = renderable.frame.width(),
            height = renderable.frame.height(),
            saturation = renderable.saturation,
            "virtual panel refresh"
        );
        if let Some(path) = &self.dump_path {
            renderable
                .frame
                .save_with_format(path, ImageFormat::Png)
                .map_err(|e| DisplayError::Panel(e.to_string()))?;
        }
        Ok(())
    }
}

// ── Display session ─────────────────────────────────────────────────

/// What is currently on the panel.
///
/// Shared between the pipeline (after each successful show) and the input
/// watcher (orientation toggles) behind a mutex; neither task touches the
/// panel without holding it.
#[derive(Debug, Clone)]
pub struct DisplaySession {
    /// Source file of the frame on the panel, if any was shown this run.
    pub source_path: Option<PathBuf>,
    pub orientation: Orientation,
}

impl DisplaySession {
    pub fn new(orientation: Orientation) -> Self {
        Self {
            source_path: None,
            orientation,
        }
    }
}
