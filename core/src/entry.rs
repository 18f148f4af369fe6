use blake3::Hasher;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::clipboard::{ClipContent, RawImage};

pub type EntryId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Text,
    Image,
}

/// blake3 hex digest of normalized content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of_text(text: &str) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(text.as_bytes());
        Self(hasher.finalize().to_hex().to_string())
    }

    pub fn of_image(image: &RawImage) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(&image.width.to_le_bytes());
        hasher.update(&image.height.to_le_bytes());
        hasher.update(&image.rgba);
        Self(hasher.finalize().to_hex().to_string())
    }

    pub fn of_content(content: &ClipContent) -> Self {
        match content {
            ClipContent::Text(text) => Self::of_text(text),
            ClipContent::Image(image) => Self::of_image(image),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hex digests only, so the value is safe to use as a file name.
    pub fn is_well_formed(&self) -> bool {
        !self.0.is_empty() && self.0.chars().all(|c| c.is_ascii_hexdigit())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// File name inside the blob directory.
    pub blob: String,
    pub width: u32,
    pub height: u32,
    /// PNG thumbnail, kept beside the blob rather than in the index.
    #[serde(skip)]
    pub preview: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Content {
    Text { text: String },
    Image(ImageRef),
}

impl Content {
    pub fn kind(&self) -> EntryKind {
        match self {
            Content::Text { .. } => EntryKind::Text,
            Content::Image(_) => EntryKind::Image,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub fingerprint: Fingerprint,
    /// Milliseconds since the unix epoch of the latest observation.
    pub created_at: u64,
    pub pinned: bool,
    pub content: Content,
    /// Logical clock value of the latest observation; higher sorts first.
    pub order_key: u64,
    /// Logical clock value at pin time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin_key: Option<u64>,
}

impl Entry {
    pub fn kind(&self) -> EntryKind {
        self.content.kind()
    }

    pub fn text(&self) -> Option<&str> {
        match &self.content {
            Content::Text { text } => Some(text),
            Content::Image(_) => None,
        }
    }

    pub fn image(&self) -> Option<&ImageRef> {
        match &self.content {
            Content::Image(image) => Some(image),
            Content::Text { .. } => None,
        }
    }

    /// Single-line summary used by the CLI listing.
    pub fn summary(&self, max_chars: usize) -> String {
        match &self.content {
            Content::Text { text } => truncate_to_fit(text, max_chars),
            Content::Image(image) => format!("[IMG:{}x{}px]", image.width, image.height),
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn truncate_to_fit(text: &str, max_chars: usize) -> String {
    let text = text.replace(['\n', '\t'], " ");

    if text.chars().count() <= max_chars {
        text
    } else {
        let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
        out.push('…');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_depends_on_image_shape() {
        let wide = RawImage {
            width: 2,
            height: 1,
            rgba: vec![0; 8],
        };
        let tall = RawImage {
            width: 1,
            height: 2,
            rgba: vec![0; 8],
        };
        assert_ne!(Fingerprint::of_image(&wide), Fingerprint::of_image(&tall));
        assert!(Fingerprint::of_image(&wide).is_well_formed());
    }

    #[test]
    fn summary_flattens_and_truncates() {
        let entry = Entry {
            id: 1,
            fingerprint: Fingerprint::of_text("a\nb"),
            created_at: 0,
            pinned: false,
            content: Content::Text {
                text: "line one\nline two".to_string(),
            },
            order_key: 1,
            pin_key: None,
        };
        assert_eq!(entry.summary(80), "line one line two");
        assert_eq!(entry.summary(5), "line…");
    }

    #[test]
    fn content_serializes_with_kind_tag() {
        let content = Content::Text {
            text: "hi".to_string(),
        };
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json["kind"], "text");
        assert_eq!(json["text"], "hi");
    }
}
