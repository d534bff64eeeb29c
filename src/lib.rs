//! inkframe — mailbox-fed e-paper picture frame daemon.
//!
//! Email an image to the frame's address; it lands on the panel and the
//! sender gets a reply with a preview. The interesting machinery is the
//! mailbox-to-display pipeline: a crash-safe persisted cursor, idempotent
//! attachment extraction with atomic file promotion, and a fixed step
//! sequence with per-step failure isolation.

pub mod config;
pub mod display;
pub mod error;
pub mod extract;
pub mod mailbox;
pub mod notify;
pub mod pipeline;
pub mod poller;
pub mod store;
pub mod watcher;

pub use error::{Error, Result};
