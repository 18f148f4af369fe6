use anyhow::{Context, Result, bail};
use log::{info, warn};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::clipboard::{self, ArboardClipboard, SharedClipboard};
use crate::config::Config;
use crate::control::{self, Claim, ControlServer};
use crate::dispatch::Dispatcher;
use crate::injector::{self, KeySender, PasteInjector};
use crate::observer::{Limits, Observer, SeenMarker};
use crate::session::Session;
use crate::store::{SharedStore, Store};
use crate::ui::UiBridge;

/// What a plain invocation should do.
pub enum Launch {
    /// Another daemon owns the socket; hand it the request.
    Forward,
    Serve(ControlServer),
}

/// Decides between forwarding and serving.
///
/// Without a display a live daemon can still be poked, but the socket is
/// never claimed, so a refused start leaves nothing behind.
pub fn launch(socket: &Path, display_available: bool) -> Result<Launch> {
    if control::is_running(socket) {
        return Ok(Launch::Forward);
    }
    if !display_available {
        bail!("No display server available (neither X11 nor Wayland)");
    }
    match control::claim(socket).context("Failed to bind control socket")? {
        Claim::Running => Ok(Launch::Forward),
        Claim::Owner(server) => Ok(Launch::Serve(server)),
    }
}

/// Runs the daemon on an already-claimed control socket until SIGINT or
/// SIGTERM, then writes the history one last time.
pub async fn run(config: &Config, session: &Session, server: ControlServer) -> Result<()> {
    let store = Store::open(&config.data_dir, config.capacity)
        .with_context(|| format!("Failed to open history in {}", config.data_dir.display()))?
        .shared();
    let clipboard = clipboard::shared(ArboardClipboard::new().context("Failed to initialize clipboard")?);

    let keys = match injector::select_strategy(session.injection) {
        Ok(keys) => {
            info!("paste strategy: {}", keys.name());
            Some(keys)
        }
        Err(e) => {
            warn!("automatic paste disabled: {}", e);
            warn!("selected entries will be copied to the clipboard; paste them manually");
            None
        }
    };

    info!(
        "clipstack started ({} session, desktop {:?}, socket {})",
        session.display_server,
        session.desktop,
        server.path().display()
    );

    Daemon::new(config, store, clipboard, keys)
        .serve_until(&server, shutdown_signal())
        .await
}

/// The observer, the control dispatcher and the flush loop over one store.
pub struct Daemon {
    store: SharedStore,
    observer: Observer,
    dispatcher: Arc<Dispatcher>,
    flush_every: Duration,
}

impl Daemon {
    pub fn new(
        config: &Config,
        store: SharedStore,
        clipboard: SharedClipboard,
        keys: Option<Box<dyn KeySender>>,
    ) -> Self {
        let seen = SeenMarker::default();
        let ui = UiBridge::new(config.toggle_command.clone());

        let injector = PasteInjector::new(store.clone(), clipboard.clone(), seen.clone(), keys)
            .with_write_policy(config.clipboard_timeout(), config.write_retries)
            .with_paste_delay(config.paste_delay());
        let dispatcher = Arc::new(Dispatcher::new(store.clone(), injector, ui.clone()));
        let observer = Observer::new(
            clipboard,
            store.clone(),
            seen,
            ui,
            Limits::from(config),
            config.poll_interval(),
            config.clipboard_timeout(),
        );

        Self {
            store,
            observer,
            dispatcher,
            flush_every: config.flush_interval(),
        }
    }

    /// Serves until `shutdown` resolves, then flushes the snapshot.
    pub async fn serve_until<F>(&self, server: &ControlServer, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            _ = self.observer.run() => {}
            _ = server.serve(self.dispatcher.clone()) => {}
            _ = flush_loop(&self.store, self.flush_every) => {}
            _ = shutdown => info!("shutting down"),
        }

        self.store
            .lock()
            .flush()
            .context("Failed to write history on shutdown")?;
        Ok(())
    }
}

/// Debounces index writes: mutations only mark the store dirty.
async fn flush_loop(store: &SharedStore, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if let Err(e) = store.lock().flush() {
            warn!("failed to write history: {}", e);
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::ClipContent;
    use crate::clipboard::testing::FakeClipboard;
    use crate::control::Request;
    use crate::error::Error;
    use tempfile::tempdir;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn shutdown_flushes_last_mutation() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("data"), 10).unwrap().shared();
        let server = control::claim(&dir.path().join("ctl.sock"))
            .unwrap()
            .into_owner()
            .unwrap();
        let config = Config {
            flush_interval_ms: 60_000,
            ..Config::default()
        };
        let daemon = Daemon::new(&config, store.clone(), clipboard::shared(FakeClipboard::default()), None);

        let (stop, stopped) = oneshot::channel::<()>();
        let serving = daemon.serve_until(&server, async {
            let _ = stopped.await;
        });
        let mutate = async {
            // Let the flush loop's immediate first tick go by.
            tokio::time::sleep(Duration::from_millis(50)).await;
            store.lock().insert(ClipContent::Text("last words".into())).unwrap();
            stop.send(()).unwrap();
        };
        let (result, ()) = tokio::join!(serving, mutate);
        result.unwrap();

        assert!(!store.lock().is_dirty());
        let reopened = Store::open(dir.path().join("data"), 10).unwrap();
        assert_eq!(reopened.list()[0].text(), Some("last words"));
    }

    #[tokio::test]
    async fn refused_start_leaves_no_socket() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("ctl.sock");

        assert!(launch(&socket, false).is_err());
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn live_daemon_is_poked_even_without_display() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("ctl.sock");
        let Launch::Serve(server) = launch(&socket, true).unwrap() else {
            panic!("first launch should serve");
        };

        assert!(matches!(launch(&socket, false).unwrap(), Launch::Forward));
        assert!(matches!(launch(&socket, true).unwrap(), Launch::Forward));

        drop(server);
        assert!(matches!(
            control::send(&socket, &Request::Query(None)).await,
            Err(Error::NotRunning)
        ));
    }
}
