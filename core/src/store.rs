use image::{ImageBuffer, ImageEncoder, Rgba};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::clipboard::{ClipContent, RawImage};
use crate::entry::{Content, Entry, EntryId, EntryKind, Fingerprint, ImageRef, now_millis};
use crate::error::{Error, Result};

const INDEX_FILE: &str = "history.json";
const INDEX_VERSION: u32 = 1;
const BLOB_DIR: &str = "images";
const PREVIEW_EDGE: u32 = 128;

pub type SharedStore = Arc<Mutex<Store>>;

#[derive(Serialize)]
struct IndexRef<'a> {
    version: u32,
    next_id: EntryId,
    clock: u64,
    entries: Vec<&'a Entry>,
}

// Entries stay untyped until each one is validated on its own.
#[derive(Deserialize)]
struct RawIndex {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    next_id: EntryId,
    #[serde(default)]
    clock: u64,
    #[serde(default)]
    entries: Vec<serde_json::Value>,
}

/// Ordered, deduplicated clipboard history backed by `history.json` and a
/// directory of image blobs.
///
/// Pinned entries list first (most recently pinned first), then unpinned
/// entries most-recently-seen first. At most `capacity` unpinned entries are
/// kept; pins never count against it.
pub struct Store {
    root: PathBuf,
    blobs: BlobDir,
    capacity: usize,
    entries: Vec<Entry>,
    next_id: EntryId,
    clock: u64,
    dirty: bool,
}

impl Store {
    /// Loads the snapshot under `root`, dropping entries whose blobs went
    /// missing and deleting blobs nothing references.
    pub fn open(root: impl Into<PathBuf>, capacity: usize) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(BLOB_DIR))?;

        let mut store = Self {
            blobs: BlobDir {
                path: root.join(BLOB_DIR),
            },
            root,
            capacity: capacity.max(1),
            entries: Vec::new(),
            next_id: 1,
            clock: 0,
            dirty: false,
        };
        store.load()?;
        store.collect_garbage()?;
        store.enforce_capacity();

        info!(
            "loaded {} history entries from {}",
            store.entries.len(),
            store.root.display()
        );
        Ok(store)
    }

    pub fn shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn unpinned_len(&self) -> usize {
        self.entries.iter().filter(|e| !e.pinned).count()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Records freshly observed content.
    ///
    /// Known content (same kind and fingerprint) is promoted to most recent,
    /// keeping its id and pin state. New content gets the next id; image
    /// pixels are written to the blob directory before the entry goes live.
    pub fn insert(&mut self, content: ClipContent) -> Result<Entry> {
        let fingerprint = Fingerprint::of_content(&content);
        if let Some(entry) = self.promote(content.kind(), &fingerprint) {
            return Ok(entry);
        }

        let content = match content {
            ClipContent::Text(text) => Content::Text { text },
            ClipContent::Image(image) => Content::Image(self.blobs.write(&fingerprint, &image)?),
        };
        Ok(self.push(fingerprint, content))
    }

    /// Like [`Store::insert`], for content whose blob was already written
    /// through [`Store::blob_dir`].
    pub fn insert_prepared(&mut self, fingerprint: Fingerprint, content: Content) -> Result<Entry> {
        if let Some(entry) = self.promote(content.kind(), &fingerprint) {
            return Ok(entry);
        }
        if let Content::Image(image) = &content {
            if !self.blob_path(image).is_file() {
                return Err(Error::TransientIo(format!(
                    "blob {} vanished before insert",
                    image.blob
                )));
            }
        }
        Ok(self.push(fingerprint, content))
    }

    /// Whether content with this kind and fingerprint is already recorded.
    pub fn knows(&self, kind: EntryKind, fingerprint: &Fingerprint) -> bool {
        self.entries
            .iter()
            .any(|e| e.kind() == kind && &e.fingerprint == fingerprint)
    }

    pub fn blob_dir(&self) -> BlobDir {
        self.blobs.clone()
    }

    fn promote(&mut self, kind: EntryKind, fingerprint: &Fingerprint) -> Option<Entry> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.kind() == kind && &e.fingerprint == fingerprint)?;
        let tick = self.tick();
        let existing = &mut self.entries[pos];
        existing.created_at = now_millis();
        existing.order_key = tick;
        self.dirty = true;
        debug!("promoted entry {}", existing.id);
        Some(existing.clone())
    }

    fn push(&mut self, fingerprint: Fingerprint, content: Content) -> Entry {
        let kind = content.kind();
        let entry = Entry {
            id: self.next_id,
            fingerprint,
            created_at: now_millis(),
            pinned: false,
            content,
            order_key: self.tick(),
            pin_key: None,
        };
        self.next_id += 1;
        self.entries.push(entry.clone());
        self.dirty = true;
        debug!("inserted entry {} ({:?})", entry.id, kind);

        self.enforce_capacity();
        entry
    }

    /// Snapshot of the history in display order.
    pub fn list(&self) -> Vec<Entry> {
        let mut entries = self.entries.clone();
        entries.sort_by(|a, b| {
            b.pinned
                .cmp(&a.pinned)
                .then_with(|| b.pin_key.cmp(&a.pin_key))
                .then_with(|| b.order_key.cmp(&a.order_key))
        });
        entries
    }

    /// Case-insensitive substring match over text entries, in display order.
    pub fn search(&self, query: &str) -> Vec<Entry> {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return self.list();
        }
        self.list()
            .into_iter()
            .filter(|e| e.text().is_some_and(|t| t.to_lowercase().contains(&query)))
            .collect()
    }

    pub fn get(&self, id: EntryId) -> Result<Entry> {
        self.entries
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or(Error::NotFound(id))
    }

    pub fn contains(&self, id: EntryId) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    /// Returns false when `id` is unknown.
    pub fn pin(&mut self, id: EntryId) -> bool {
        let tick = self.tick();
        let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) else {
            return false;
        };
        if !entry.pinned {
            entry.pinned = true;
            entry.pin_key = Some(tick);
            self.dirty = true;
        }
        true
    }

    /// Returns false when `id` is unknown. The entry rejoins the unpinned
    /// history at its last-seen position, which may push the oldest out.
    pub fn unpin(&mut self, id: EntryId) -> bool {
        let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) else {
            return false;
        };
        if entry.pinned {
            entry.pinned = false;
            entry.pin_key = None;
            self.dirty = true;
            self.enforce_capacity();
        }
        true
    }

    /// Returns false when `id` is unknown.
    pub fn delete(&mut self, id: EntryId) -> bool {
        let Some(pos) = self.entries.iter().position(|e| e.id == id) else {
            return false;
        };
        let entry = self.entries.remove(pos);
        self.remove_blob(&entry);
        self.dirty = true;
        true
    }

    /// Drops every unpinned entry, and the pinned ones too unless `keep_pinned`.
    pub fn clear(&mut self, keep_pinned: bool) {
        let (keep, drop): (Vec<Entry>, Vec<Entry>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| keep_pinned && e.pinned);
        self.entries = keep;
        for entry in &drop {
            self.remove_blob(entry);
        }
        if !drop.is_empty() {
            self.dirty = true;
        }
        info!("cleared {} history entries", drop.len());
    }

    pub fn blob_path(&self, image: &ImageRef) -> PathBuf {
        self.root.join(BLOB_DIR).join(&image.blob)
    }

    /// Decodes an image entry's blob back into clipboard pixels.
    pub fn load_image(&self, image: &ImageRef) -> Result<RawImage> {
        let data = fs::read(self.blob_path(image))?;
        let rgba = image::load_from_memory(&data)?.to_rgba8();
        Ok(RawImage {
            width: rgba.width(),
            height: rgba.height(),
            rgba: rgba.into_raw(),
        })
    }

    /// Writes the index if anything changed since the last flush.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let index = IndexRef {
            version: INDEX_VERSION,
            next_id: self.next_id,
            clock: self.clock,
            entries: self.entries.iter().collect(),
        };
        let data = serde_json::to_vec_pretty(&index)?;

        let path = self.root.join(INDEX_FILE);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;

        self.dirty = false;
        debug!("flushed {} entries to {}", self.entries.len(), path.display());
        Ok(())
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn enforce_capacity(&mut self) {
        while self.unpinned_len() > self.capacity {
            let Some(pos) = self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| !e.pinned)
                .min_by_key(|(_, e)| e.order_key)
                .map(|(pos, _)| pos)
            else {
                break;
            };
            let evicted = self.entries.remove(pos);
            self.remove_blob(&evicted);
            self.dirty = true;
            debug!("evicted entry {}", evicted.id);
        }
    }

    fn remove_blob(&self, entry: &Entry) {
        if let Some(image) = entry.image() {
            let dir = self.root.join(BLOB_DIR);
            for name in [image.blob.clone(), preview_name(&image.blob)] {
                if let Err(e) = fs::remove_file(dir.join(&name)) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("failed to remove blob {}: {}", name, e);
                    }
                }
            }
        }
    }

    fn load(&mut self) -> Result<()> {
        let path = self.root.join(INDEX_FILE);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let raw: RawIndex = match serde_json::from_slice(&data) {
            Ok(raw) => raw,
            Err(e) => {
                let err = Error::PersistenceCorruption(e.to_string());
                warn!("{}; starting with an empty history", err);
                let backup = path.with_extension("json.corrupt");
                if let Err(e) = fs::rename(&path, &backup) {
                    warn!("failed to move corrupt index aside: {}", e);
                }
                self.dirty = true;
                return Ok(());
            }
        };

        if raw.version > INDEX_VERSION {
            warn!(
                "history index version {} is newer than supported {}",
                raw.version, INDEX_VERSION
            );
        }

        let mut seen_ids = HashSet::new();
        let mut seen_prints = HashSet::new();
        for value in raw.entries {
            let mut entry: Entry = match serde_json::from_value(value) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("{}", Error::PersistenceCorruption(format!("dropping entry: {e}")));
                    self.dirty = true;
                    continue;
                }
            };

            if !seen_ids.insert(entry.id) || !seen_prints.insert((entry.kind(), entry.fingerprint.clone())) {
                warn!("dropping duplicate history entry {}", entry.id);
                self.dirty = true;
                continue;
            }

            if let Content::Image(image) = &mut entry.content {
                if !is_safe_name(&image.blob) || !self.root.join(BLOB_DIR).join(&image.blob).is_file() {
                    warn!(
                        "{}",
                        Error::PersistenceCorruption(format!(
                            "entry {} references missing blob {}",
                            entry.id, image.blob
                        ))
                    );
                    self.dirty = true;
                    continue;
                }
                image.preview = self.load_preview(image);
            }

            self.entries.push(entry);
        }

        let max_id = self.entries.iter().map(|e| e.id).max().unwrap_or(0);
        let max_key = self
            .entries
            .iter()
            .map(|e| e.order_key.max(e.pin_key.unwrap_or(0)))
            .max()
            .unwrap_or(0);
        self.next_id = raw.next_id.max(max_id + 1).max(1);
        self.clock = raw.clock.max(max_key);
        Ok(())
    }

    fn load_preview(&self, image: &ImageRef) -> Vec<u8> {
        let dir = self.root.join(BLOB_DIR);
        if let Ok(preview) = fs::read(dir.join(preview_name(&image.blob))) {
            return preview;
        }

        // Regenerate a lost thumbnail from the full blob.
        let regenerated = self.load_image(image).and_then(|raw| {
            let buffer = ImageBuffer::<Rgba<u8>, Vec<u8>>::from_raw(raw.width, raw.height, raw.rgba)
                .ok_or_else(|| Error::PersistenceCorruption(format!("bad blob {}", image.blob)))?;
            let (tw, th) = preview_dims(raw.width, raw.height);
            let thumb = image::imageops::thumbnail(&buffer, tw, th);
            let preview = encode_png(&thumb)?;
            fs::write(dir.join(preview_name(&image.blob)), &preview)?;
            Ok(preview)
        });
        match regenerated {
            Ok(preview) => preview,
            Err(e) => {
                warn!("failed to rebuild preview for {}: {}", image.blob, e);
                Vec::new()
            }
        }
    }

    fn collect_garbage(&mut self) -> Result<()> {
        let referenced: HashSet<String> = self
            .entries
            .iter()
            .filter_map(|e| e.image())
            .flat_map(|img| [img.blob.clone(), preview_name(&img.blob)])
            .collect();

        for dirent in fs::read_dir(self.root.join(BLOB_DIR))? {
            let dirent = dirent?;
            let name = dirent.file_name().to_string_lossy().into_owned();
            if referenced.contains(&name) || !dirent.file_type()?.is_file() {
                continue;
            }
            match fs::remove_file(dirent.path()) {
                Ok(()) => info!("removed orphan blob {}", name),
                Err(e) => warn!("failed to remove orphan blob {}: {}", name, e),
            }
        }
        Ok(())
    }
}

/// Handle on the image blob directory, usable without the store lock.
#[derive(Debug, Clone)]
pub struct BlobDir {
    path: PathBuf,
}

impl BlobDir {
    /// Encodes `image` as `<fingerprint>.png` plus its thumbnail.
    pub fn write(&self, fingerprint: &Fingerprint, image: &RawImage) -> Result<ImageRef> {
        if !fingerprint.is_well_formed() {
            return Err(Error::PersistenceCorruption(format!(
                "invalid blob name {fingerprint}"
            )));
        }

        let buffer = ImageBuffer::<Rgba<u8>, &[u8]>::from_raw(image.width, image.height, image.rgba.as_slice())
            .ok_or_else(|| Error::TransientIo("image size does not match its pixel data".into()))?;

        let blob = format!("{fingerprint}.png");
        let path = self.path.join(&blob);
        if !path.exists() {
            fs::write(&path, encode_png(&buffer)?)?;
        }

        let (tw, th) = preview_dims(image.width, image.height);
        let thumb = image::imageops::thumbnail(&buffer, tw, th);
        let preview = encode_png(&thumb)?;
        fs::write(self.path.join(preview_name(&blob)), &preview)?;

        Ok(ImageRef {
            blob,
            width: image.width,
            height: image.height,
            preview,
        })
    }
}

fn preview_name(blob: &str) -> String {
    match blob.strip_suffix(".png") {
        Some(stem) => format!("{stem}.thumb.png"),
        None => format!("{blob}.thumb.png"),
    }
}

fn is_safe_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && !name.contains('\\') && !name.contains("..")
}

/// Thumbnail size fitting a `PREVIEW_EDGE` square, aspect preserved.
fn preview_dims(width: u32, height: u32) -> (u32, u32) {
    let longest = width.max(height).max(1);
    if longest <= PREVIEW_EDGE {
        return (width.max(1), height.max(1));
    }
    let scale = |side: u32| ((side as u64 * PREVIEW_EDGE as u64) / longest as u64).max(1) as u32;
    (scale(width), scale(height))
}

fn encode_png<C>(buffer: &ImageBuffer<Rgba<u8>, C>) -> Result<Vec<u8>>
where
    C: std::ops::Deref<Target = [u8]>,
{
    let mut png_data = Vec::new();
    let encoder = image::codecs::png::PngEncoder::new(&mut png_data);
    encoder.write_image(
        buffer.as_raw(),
        buffer.width(),
        buffer.height(),
        image::ExtendedColorType::Rgba8,
    )?;
    Ok(png_data)
}
