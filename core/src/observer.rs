use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use crate::clipboard::{self, ClipContent, RawImage, SharedClipboard};
use crate::config::Config;
use crate::entry::{Content, Entry, EntryKind, Fingerprint};
use crate::error::{Error, Result};
use crate::store::SharedStore;
use crate::ui::UiBridge;

/// Fingerprint of the clipboard content the observer last acted on.
///
/// Shared with the paste injector so content we put on the clipboard
/// ourselves is not recorded again. Every change bumps a generation, which
/// lets a tick detect that a paste landed while its read was in flight.
#[derive(Clone, Default)]
pub struct SeenMarker(Arc<Mutex<Seen>>);

#[derive(Default)]
struct Seen {
    fingerprint: Option<Fingerprint>,
    generation: u64,
}

impl SeenMarker {
    pub fn mark(&self, fingerprint: Fingerprint) {
        self.set(Some(fingerprint));
    }

    pub fn get(&self) -> Option<Fingerprint> {
        self.0.lock().fingerprint.clone()
    }

    pub fn is_current(&self, fingerprint: &Fingerprint) -> bool {
        self.0.lock().fingerprint.as_ref() == Some(fingerprint)
    }

    pub fn clear(&self) {
        self.set(None);
    }

    /// Puts back a value previously returned by [`SeenMarker::get`].
    pub fn restore(&self, fingerprint: Option<Fingerprint>) {
        self.set(fingerprint);
    }

    pub fn generation(&self) -> u64 {
        self.0.lock().generation
    }

    /// Marks `fingerprint` if nothing changed the marker since `generation`
    /// was read and it is not already the current value.
    pub fn observe(&self, fingerprint: Fingerprint, generation: u64) -> bool {
        let mut seen = self.0.lock();
        if seen.generation != generation || seen.fingerprint.as_ref() == Some(&fingerprint) {
            return false;
        }
        seen.fingerprint = Some(fingerprint);
        seen.generation += 1;
        true
    }

    fn set(&self, fingerprint: Option<Fingerprint>) {
        let mut seen = self.0.lock();
        seen.fingerprint = fingerprint;
        seen.generation += 1;
    }
}

#[derive(Debug, Clone)]
pub struct Limits {
    pub max_text_bytes: usize,
    pub max_image_bytes: usize,
    pub trim_whitespace: bool,
}

impl From<&Config> for Limits {
    fn from(config: &Config) -> Self {
        Self {
            max_text_bytes: config.max_text_bytes,
            max_image_bytes: config.max_image_bytes,
            trim_whitespace: config.trim_whitespace,
        }
    }
}

pub struct Observer {
    clipboard: SharedClipboard,
    store: SharedStore,
    seen: SeenMarker,
    ui: UiBridge,
    limits: Limits,
    interval: Duration,
    read_timeout: Duration,
}

impl Observer {
    pub fn new(
        clipboard: SharedClipboard,
        store: SharedStore,
        seen: SeenMarker,
        ui: UiBridge,
        limits: Limits,
        interval: Duration,
        read_timeout: Duration,
    ) -> Self {
        Self {
            clipboard,
            store,
            seen,
            ui,
            limits,
            interval,
            read_timeout,
        }
    }

    /// Polls forever; individual tick failures are logged and skipped.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            self.tick().await;
        }
    }

    /// One observation. Returns the entry that was inserted or promoted.
    pub async fn tick(&self) -> Option<Entry> {
        let generation = self.seen.generation();
        let content = match clipboard::read(&self.clipboard, self.read_timeout).await {
            Ok(Some(content)) => content,
            Ok(None) => return None,
            Err(e) => {
                debug!("clipboard read skipped: {}", e);
                return None;
            }
        };

        let content = self.normalize(content)?;
        let fingerprint = Fingerprint::of_content(&content);
        if !self.seen.observe(fingerprint.clone(), generation) {
            // Unchanged, or a paste replaced the clipboard during the read.
            return None;
        }

        if let ClipContent::Image(image) = &content {
            if image.rgba.len() > self.limits.max_image_bytes {
                warn!(
                    "ignoring {}x{} image: {} bytes exceeds limit of {}",
                    image.width,
                    image.height,
                    image.rgba.len(),
                    self.limits.max_image_bytes
                );
                return None;
            }
        }

        let result = match content {
            ClipContent::Image(image) => self.record_image(fingerprint, image).await,
            text => self.store.lock().insert(text),
        };
        match result {
            Ok(entry) => {
                self.ui.history_changed(entry.id);
                Some(entry)
            }
            Err(e) => {
                warn!("failed to record clipboard entry: {}", e);
                None
            }
        }
    }

    /// Encodes new images on the blocking pool, outside the store lock.
    async fn record_image(&self, fingerprint: Fingerprint, image: RawImage) -> Result<Entry> {
        let blobs = {
            let mut store = self.store.lock();
            if store.knows(EntryKind::Image, &fingerprint) {
                // Promotion only; nothing to encode.
                return store.insert(ClipContent::Image(image));
            }
            store.blob_dir()
        };

        let staged_fingerprint = fingerprint.clone();
        let staged = tokio::task::spawn_blocking(move || blobs.write(&staged_fingerprint, &image))
            .await
            .map_err(|e| Error::TransientIo(format!("blob worker failed: {e}")))??;
        self.store
            .lock()
            .insert_prepared(fingerprint, Content::Image(staged))
    }

    /// Drops empty text and caps oversized text at a char boundary.
    fn normalize(&self, content: ClipContent) -> Option<ClipContent> {
        match content {
            ClipContent::Text(text) => {
                if text.trim().is_empty() {
                    return None;
                }
                let mut text = if self.limits.trim_whitespace {
                    text.trim().to_string()
                } else {
                    text
                };
                if text.len() > self.limits.max_text_bytes {
                    let mut end = self.limits.max_text_bytes;
                    while end > 0 && !text.is_char_boundary(end) {
                        end -= 1;
                    }
                    debug!("truncating {} byte clipboard text to {}", text.len(), end);
                    text.truncate(end);
                }
                Some(ClipContent::Text(text))
            }
            ClipContent::Image(image) if image.width == 0 || image.height == 0 => None,
            image => Some(image),
        }
    }
}
