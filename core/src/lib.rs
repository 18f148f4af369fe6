//! Clipboard history daemon: records what gets copied, keeps it on disk, and
//! pastes old entries back into the focused window on request.

pub mod clipboard;
pub mod config;
pub mod control;
pub mod daemon;
pub mod dispatch;
pub mod entry;
pub mod error;
pub mod injector;
pub mod observer;
pub mod session;
pub mod store;
pub mod ui;

pub use clipboard::{ClipContent, RawImage};
pub use config::Config;
pub use control::{Claim, ListedEntry, Request, Response};
pub use entry::{Content, Entry, EntryId, EntryKind, Fingerprint};
pub use error::{Error, Result};
pub use injector::PasteOutcome;
pub use session::{DisplayServer, InjectionMode, Session};
pub use store::Store;
