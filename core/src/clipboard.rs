use arboard::{Clipboard, ImageData};
use parking_lot::Mutex;
use std::borrow::Cow;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroize;

use crate::entry::EntryKind;
use crate::error::{Error, Result};

/// Decoded RGBA8 pixels as the system clipboard hands them out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClipContent {
    Text(String),
    Image(RawImage),
}

impl ClipContent {
    pub fn kind(&self) -> EntryKind {
        match self {
            ClipContent::Text(_) => EntryKind::Text,
            ClipContent::Image(_) => EntryKind::Image,
        }
    }
}

/// Content on its way to the clipboard.
///
/// Retries and timed-out workers share one allocation; text is wiped when
/// the last handle drops.
pub struct Outgoing(ClipContent);

impl Outgoing {
    pub fn new(content: ClipContent) -> Arc<Self> {
        Arc::new(Self(content))
    }
}

impl Deref for Outgoing {
    type Target = ClipContent;

    fn deref(&self) -> &ClipContent {
        &self.0
    }
}

impl Outgoing {
    fn wipe(&mut self) {
        if let ClipContent::Text(text) = &mut self.0 {
            text.zeroize();
        }
    }
}

impl Drop for Outgoing {
    fn drop(&mut self) {
        self.wipe();
    }
}

/// Blocking access to the platform clipboard.
///
/// `read` returns `Ok(None)` when the clipboard is empty or holds a type we
/// do not track. Implementations map owner hiccups to [`Error::TransientIo`].
pub trait SystemClipboard: Send {
    fn read(&mut self) -> Result<Option<ClipContent>>;
    fn write(&mut self, content: &ClipContent) -> Result<()>;
}

pub type SharedClipboard = Arc<Mutex<Box<dyn SystemClipboard>>>;

pub fn shared<C: SystemClipboard + 'static>(clipboard: C) -> SharedClipboard {
    Arc::new(Mutex::new(Box::new(clipboard)))
}

pub struct ArboardClipboard {
    inner: Clipboard,
}

impl ArboardClipboard {
    pub fn new() -> Result<Self> {
        let inner = Clipboard::new().map_err(|e| Error::TransientIo(e.to_string()))?;
        Ok(Self { inner })
    }
}

fn map_arboard(err: arboard::Error) -> Error {
    Error::TransientIo(err.to_string())
}

impl SystemClipboard for ArboardClipboard {
    fn read(&mut self) -> Result<Option<ClipContent>> {
        match self.inner.get_text() {
            Ok(text) => return Ok(Some(ClipContent::Text(text))),
            Err(arboard::Error::ContentNotAvailable | arboard::Error::ConversionFailure) => {}
            Err(e) => return Err(map_arboard(e)),
        }

        match self.inner.get_image() {
            Ok(img) => Ok(Some(ClipContent::Image(RawImage {
                width: img.width as u32,
                height: img.height as u32,
                rgba: img.bytes.into_owned(),
            }))),
            Err(arboard::Error::ContentNotAvailable | arboard::Error::ConversionFailure) => Ok(None),
            Err(e) => Err(map_arboard(e)),
        }
    }

    fn write(&mut self, content: &ClipContent) -> Result<()> {
        match content {
            ClipContent::Text(text) => self.inner.set_text(text.as_str()).map_err(map_arboard),
            ClipContent::Image(img) => self
                .inner
                .set_image(ImageData {
                    width: img.width as usize,
                    height: img.height as usize,
                    bytes: Cow::Borrowed(&img.rgba),
                })
                .map_err(map_arboard),
        }
    }
}

/// Reads the clipboard on the blocking pool, giving up after `timeout`.
///
/// A hung owner leaves the worker thread parked on the clipboard lock; later
/// calls fail fast with `TransientIo` until it returns.
pub async fn read(clipboard: &SharedClipboard, timeout: Duration) -> Result<Option<ClipContent>> {
    let clipboard = clipboard.clone();
    run_bounded(timeout, move || {
        let mut guard = clipboard
            .try_lock_for(timeout)
            .ok_or_else(|| Error::TransientIo("clipboard busy".to_string()))?;
        guard.read()
    })
    .await
}

pub async fn write(clipboard: &SharedClipboard, content: Arc<Outgoing>, timeout: Duration) -> Result<()> {
    let clipboard = clipboard.clone();
    run_bounded(timeout, move || {
        let mut guard = clipboard
            .try_lock_for(timeout)
            .ok_or_else(|| Error::TransientIo("clipboard busy".to_string()))?;
        guard.write(&content)
    })
    .await
}

async fn run_bounded<T, F>(timeout: Duration, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let handle = tokio::task::spawn_blocking(f);
    match tokio::time::timeout(timeout * 2, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(Error::TransientIo(format!("clipboard worker failed: {join}"))),
        Err(_) => Err(Error::TransientIo("clipboard timed out".to_string())),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted clipboard shared between a test and the code under test.
    #[derive(Clone, Default)]
    pub struct FakeClipboard {
        pub state: Arc<Mutex<FakeState>>,
    }

    #[derive(Default)]
    pub struct FakeState {
        pub current: Option<ClipContent>,
        pub read_failures: VecDeque<Error>,
        pub write_failures: VecDeque<Error>,
        pub writes: Vec<ClipContent>,
        /// Address of the payload handed to every write attempt.
        pub write_sources: Vec<usize>,
        /// Reads snapshot the content, then stall this long.
        pub read_delay: Option<Duration>,
    }

    impl FakeClipboard {
        pub fn set(&self, content: Option<ClipContent>) {
            self.state.lock().current = content;
        }

        pub fn current(&self) -> Option<ClipContent> {
            self.state.lock().current.clone()
        }

        pub fn fail_next_reads(&self, n: usize) {
            let mut state = self.state.lock();
            for _ in 0..n {
                state.read_failures.push_back(Error::TransientIo("owner busy".into()));
            }
        }

        pub fn fail_next_writes(&self, n: usize) {
            let mut state = self.state.lock();
            for _ in 0..n {
                state.write_failures.push_back(Error::TransientIo("owner busy".into()));
            }
        }

        pub fn write_count(&self) -> usize {
            self.state.lock().writes.len()
        }

        pub fn slow_reads(&self, delay: Duration) {
            self.state.lock().read_delay = Some(delay);
        }
    }

    impl SystemClipboard for FakeClipboard {
        fn read(&mut self) -> Result<Option<ClipContent>> {
            let (current, delay) = {
                let mut state = self.state.lock();
                if let Some(err) = state.read_failures.pop_front() {
                    return Err(err);
                }
                (state.current.clone(), state.read_delay)
            };
            if let Some(delay) = delay {
                std::thread::sleep(delay);
            }
            Ok(current)
        }

        fn write(&mut self, content: &ClipContent) -> Result<()> {
            let mut state = self.state.lock();
            state.write_sources.push(content as *const ClipContent as usize);
            if let Some(err) = state.write_failures.pop_front() {
                return Err(err);
            }
            state.current = Some(content.clone());
            state.writes.push(content.clone());
            Ok(())
        }
    }
}
