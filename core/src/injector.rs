//! Puts a history entry back on the clipboard and presses paste for the user.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::clipboard::{self, ClipContent, Outgoing, SharedClipboard};
use crate::entry::{Content, EntryId};
use crate::error::{Error, Result};
use crate::observer::SeenMarker;
use crate::session::InjectionMode;
use crate::store::SharedStore;

const RETRY_BACKOFF: Duration = Duration::from_millis(40);

/// Emits the platform paste shortcut into the focused window.
pub trait KeySender: Send {
    fn name(&self) -> &'static str;

    /// Wait between the clipboard write and the keystroke so focus can
    /// return to the target window.
    fn settle_delay(&self) -> Duration;

    fn send_paste(&mut self) -> Result<()>;
}

/// Synthetic Ctrl+V through the X server's XTest extension.
///
/// The X connection is opened per paste; construction only proves the
/// server accepts one.
pub struct DirectInjection {
    settings: enigo::Settings,
}

impl DirectInjection {
    pub fn new() -> Result<Self> {
        let settings = enigo::Settings::default();
        Self::connect(&settings)?;
        Ok(Self { settings })
    }

    fn connect(settings: &enigo::Settings) -> Result<enigo::Enigo> {
        enigo::Enigo::new(settings)
            .map_err(|e| Error::PermissionDenied(format!("synthetic input unavailable: {e}")))
    }
}

impl KeySender for DirectInjection {
    fn name(&self) -> &'static str {
        "xtest"
    }

    fn settle_delay(&self) -> Duration {
        Duration::from_millis(30)
    }

    fn send_paste(&mut self) -> Result<()> {
        use enigo::{Direction, Key, Keyboard};

        let mut enigo = Self::connect(&self.settings)?;
        let fail = |e: enigo::InputError| Error::TransientIo(format!("key injection failed: {e}"));
        enigo.key(Key::Control, Direction::Press).map_err(fail)?;
        let clicked = enigo.key(Key::Unicode('v'), Direction::Click).map_err(fail);
        // Never leave Control latched, even if the click failed.
        enigo.key(Key::Control, Direction::Release).map_err(fail)?;
        clicked
    }
}

#[cfg(target_os = "linux")]
pub use uinput::VirtualKeyboard;

#[cfg(target_os = "linux")]
mod uinput {
    use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
    use evdev::{AttributeSet, EventType, InputEvent, Key};
    use std::io::ErrorKind;
    use std::time::Duration;

    use super::KeySender;
    use crate::error::{Error, Result};

    const DEVICE_NAME: &str = "clipstack-paste";

    /// Kernel-level keyboard registered through /dev/uinput.
    pub struct VirtualKeyboard {
        device: VirtualDevice,
    }

    impl VirtualKeyboard {
        pub fn new() -> Result<Self> {
            let mut keys = AttributeSet::<Key>::new();
            keys.insert(Key::KEY_LEFTCTRL);
            keys.insert(Key::KEY_V);

            let device = VirtualDeviceBuilder::new()
                .and_then(|b| b.name(DEVICE_NAME).with_keys(&keys))
                .and_then(|b| b.build())
                .map_err(|e| match e.kind() {
                    ErrorKind::PermissionDenied | ErrorKind::NotFound => Error::PermissionDenied(
                        format!("cannot create uinput device ({e}); add your user to the 'input' group"),
                    ),
                    _ => Error::Io(e),
                })?;

            // Give the compositor a moment to pick up the new device.
            std::thread::sleep(Duration::from_millis(50));
            Ok(Self { device })
        }

        fn emit(&mut self, key: Key, value: i32) -> Result<()> {
            self.device
                .emit(&[InputEvent::new(EventType::KEY, key.code(), value)])
                .map_err(|e| Error::TransientIo(format!("uinput write failed: {e}")))
        }
    }

    impl KeySender for VirtualKeyboard {
        fn name(&self) -> &'static str {
            "uinput"
        }

        fn settle_delay(&self) -> Duration {
            Duration::from_millis(200)
        }

        fn send_paste(&mut self) -> Result<()> {
            self.emit(Key::KEY_LEFTCTRL, 1)?;
            self.emit(Key::KEY_V, 1)?;
            std::thread::sleep(Duration::from_millis(10));
            let released = self.emit(Key::KEY_V, 0);
            self.emit(Key::KEY_LEFTCTRL, 0)?;
            released
        }
    }
}

/// Builds the keystroke strategy for the probed session.
pub fn select_strategy(mode: InjectionMode) -> Result<Box<dyn KeySender>> {
    match mode {
        InjectionMode::DirectInjection => Ok(Box::new(DirectInjection::new()?)),
        #[cfg(target_os = "linux")]
        InjectionMode::VirtualDevice => Ok(Box::new(VirtualKeyboard::new()?)),
        #[cfg(not(target_os = "linux"))]
        InjectionMode::VirtualDevice => Err(Error::PermissionDenied(
            "virtual input devices are only supported on Linux".to_string(),
        )),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PasteOutcome {
    /// Content is on the clipboard and the shortcut was sent.
    Pasted,
    /// Content is on the clipboard; no keystroke strategy is available.
    ClipboardOnly,
}

pub struct PasteInjector {
    store: SharedStore,
    clipboard: SharedClipboard,
    seen: SeenMarker,
    keys: Option<Box<dyn KeySender>>,
    write_timeout: Duration,
    write_retries: u32,
    delay_override: Option<Duration>,
}

impl PasteInjector {
    pub fn new(
        store: SharedStore,
        clipboard: SharedClipboard,
        seen: SeenMarker,
        keys: Option<Box<dyn KeySender>>,
    ) -> Self {
        Self {
            store,
            clipboard,
            seen,
            keys,
            write_timeout: Duration::from_millis(500),
            write_retries: 3,
            delay_override: None,
        }
    }

    pub fn with_write_policy(mut self, timeout: Duration, retries: u32) -> Self {
        self.write_timeout = timeout;
        self.write_retries = retries.max(1);
        self
    }

    pub fn with_paste_delay(mut self, delay: Option<Duration>) -> Self {
        self.delay_override = delay;
        self
    }

    pub fn strategy_name(&self) -> Option<&'static str> {
        self.keys.as_ref().map(|k| k.name())
    }

    /// Writes entry `id` to the clipboard and sends the paste shortcut.
    ///
    /// Unknown ids fail with `NotFound` before the clipboard is touched.
    pub async fn paste_entry(&mut self, id: EntryId) -> Result<PasteOutcome> {
        let (entry, payload) = {
            let store = self.store.lock();
            let entry = store.get(id)?;
            let payload = match &entry.content {
                Content::Text { text } => ClipContent::Text(text.clone()),
                Content::Image(image) => ClipContent::Image(store.load_image(image)?),
            };
            (entry, Outgoing::new(payload))
        };

        // Mark first so the observer never sees our own write as new content.
        let previous = self.seen.get();
        self.seen.mark(entry.fingerprint.clone());
        if let Err(e) = self.write_with_retry(payload).await {
            self.seen.restore(previous);
            return Err(e);
        }
        // A tick that read the old content during the write may have moved
        // the marker back.
        self.seen.mark(entry.fingerprint.clone());
        debug!("entry {} placed on clipboard", id);

        let Some(keys) = self.keys.as_mut() else {
            return Ok(PasteOutcome::ClipboardOnly);
        };

        let delay = self.delay_override.unwrap_or_else(|| keys.settle_delay());
        tokio::time::sleep(delay).await;
        keys.send_paste()?;
        info!("pasted entry {} via {}", id, keys.name());
        Ok(PasteOutcome::Pasted)
    }

    async fn write_with_retry(&mut self, payload: Arc<Outgoing>) -> Result<()> {
        let mut attempt = 1;
        loop {
            match clipboard::write(&self.clipboard, payload.clone(), self.write_timeout).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.write_retries => {
                    debug!("clipboard write attempt {} failed: {}", attempt, e);
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!("giving up on clipboard write after {} attempts: {}", attempt, e);
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Counts paste shortcuts instead of sending them.
    #[derive(Clone, Default)]
    pub struct RecordingKeys {
        pub presses: Arc<Mutex<usize>>,
        pub fail: Arc<Mutex<bool>>,
    }

    impl KeySender for RecordingKeys {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn settle_delay(&self) -> Duration {
            Duration::from_millis(1)
        }

        fn send_paste(&mut self) -> Result<()> {
            if *self.fail.lock() {
                return Err(Error::TransientIo("device gone".into()));
            }
            *self.presses.lock() += 1;
            Ok(())
        }
    }
}
