use log::warn;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

use crate::control::{ListedEntry, Request, Response};
use crate::entry::EntryId;
use crate::error::Error;
use crate::injector::PasteInjector;
use crate::store::{SharedStore, Store};
use crate::ui::UiBridge;

/// Routes control requests to the store, the paste injector and the UI.
pub struct Dispatcher {
    store: SharedStore,
    injector: Arc<AsyncMutex<PasteInjector>>,
    ui: UiBridge,
}

impl Dispatcher {
    pub fn new(store: SharedStore, injector: PasteInjector, ui: UiBridge) -> Self {
        Self {
            store,
            injector: Arc::new(AsyncMutex::new(injector)),
            ui,
        }
    }

    /// Handles one request. `None` means the request takes no reply.
    pub async fn dispatch(&self, request: Request) -> Option<Response> {
        let response = match request {
            Request::Toggle => {
                self.ui.toggle();
                return None;
            }
            Request::Paste(id) => {
                // One paste at a time; the caller waits for the keystroke.
                let result = self.injector.lock().await.paste_entry(id).await;
                match result {
                    Ok(outcome) => Response::Pasted { outcome },
                    Err(e) => {
                        self.ui.paste_failed(e.to_string());
                        Response::from(&e)
                    }
                }
            }
            Request::Query(filter) => {
                let store = self.store.lock();
                let entries = match filter {
                    Some(query) => store.search(&query),
                    None => store.list(),
                };
                Response::Entries {
                    entries: entries
                        .into_iter()
                        .map(|entry| ListedEntry::new(&store, entry))
                        .collect(),
                }
            }
            Request::Pin(id) => self.mutate(id, |store| store.pin(id)),
            Request::Unpin(id) => self.mutate(id, |store| store.unpin(id)),
            Request::Delete(id) => self.mutate(id, |store| store.delete(id)),
            Request::Clear { keep_pinned } => {
                self.store.lock().clear(keep_pinned);
                Response::Ok
            }
        };
        Some(response)
    }

    fn mutate<F>(&self, id: EntryId, op: F) -> Response
    where
        F: FnOnce(&mut Store) -> bool,
    {
        if op(&mut *self.store.lock()) {
            Response::Ok
        } else {
            let err = Error::NotFound(id);
            warn!("{}", err);
            Response::from(&err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::testing::FakeClipboard;
    use crate::clipboard::{ClipContent, shared};
    use crate::control::ErrorCode;
    use crate::injector::PasteOutcome;
    use crate::injector::testing::RecordingKeys;
    use crate::observer::SeenMarker;
    use crate::ui::UiEvent;
    use tempfile::tempdir;

    fn dispatcher(store: SharedStore, ui: UiBridge) -> Dispatcher {
        let injector = PasteInjector::new(
            store.clone(),
            shared(FakeClipboard::default()),
            SeenMarker::default(),
            Some(Box::new(RecordingKeys::default())),
        );
        Dispatcher::new(store, injector, ui)
    }

    #[tokio::test]
    async fn toggle_is_forwarded_without_reply() {
        let dir = tempdir().unwrap();
        let ui = UiBridge::new(Vec::new());
        let mut events = ui.subscribe();
        let d = dispatcher(Store::open(dir.path(), 5).unwrap().shared(), ui);

        assert!(d.dispatch(Request::Toggle).await.is_none());
        assert_eq!(events.recv().await.unwrap(), UiEvent::Toggle);
    }

    #[tokio::test]
    async fn query_pin_and_delete() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path(), 5).unwrap().shared();
        let a = store.lock().insert(ClipContent::Text("alpha".into())).unwrap();
        let b = store.lock().insert(ClipContent::Text("beta".into())).unwrap();
        let d = dispatcher(store.clone(), UiBridge::new(Vec::new()));

        assert_eq!(d.dispatch(Request::Pin(a.id)).await, Some(Response::Ok));
        let Some(Response::Entries { entries }) = d.dispatch(Request::Query(None)).await else {
            panic!("expected entries");
        };
        let ids: Vec<_> = entries.iter().map(|e| e.entry.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);

        let Some(Response::Entries { entries }) =
            d.dispatch(Request::Query(Some("BET".into()))).await
        else {
            panic!("expected entries");
        };
        assert_eq!(entries.len(), 1);

        assert_eq!(d.dispatch(Request::Delete(b.id)).await, Some(Response::Ok));
        assert!(matches!(
            d.dispatch(Request::Delete(b.id)).await,
            Some(Response::Error { code: ErrorCode::NotFound, .. })
        ));
    }

    #[tokio::test]
    async fn paste_of_unknown_id_reports_not_found_to_caller_and_ui() {
        let dir = tempdir().unwrap();
        let ui = UiBridge::new(Vec::new());
        let mut events = ui.subscribe();
        let d = dispatcher(Store::open(dir.path(), 5).unwrap().shared(), ui);

        assert!(matches!(
            d.dispatch(Request::Paste(42)).await,
            Some(Response::Error { code: ErrorCode::NotFound, .. })
        ));
        assert!(matches!(events.recv().await.unwrap(), UiEvent::PasteFailed(_)));
    }

    #[tokio::test]
    async fn paste_reports_outcome() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path(), 5).unwrap().shared();
        let a = store.lock().insert(ClipContent::Text("alpha".into())).unwrap();
        let d = dispatcher(store, UiBridge::new(Vec::new()));

        assert_eq!(
            d.dispatch(Request::Paste(a.id)).await,
            Some(Response::Pasted {
                outcome: PasteOutcome::Pasted
            })
        );
    }

    #[tokio::test]
    async fn clear_keeps_pins_unless_all() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path(), 5).unwrap().shared();
        let a = store.lock().insert(ClipContent::Text("alpha".into())).unwrap();
        store.lock().insert(ClipContent::Text("beta".into())).unwrap();
        store.lock().pin(a.id);
        let d = dispatcher(store.clone(), UiBridge::new(Vec::new()));

        d.dispatch(Request::Clear { keep_pinned: true }).await;
        assert_eq!(store.lock().len(), 1);
        d.dispatch(Request::Clear { keep_pinned: false }).await;
        assert!(store.lock().is_empty());
    }

    #[tokio::test]
    async fn dispatch_runs_on_spawned_tasks() {
        let dir = tempdir().unwrap();
        let d = Arc::new(dispatcher(
            Store::open(dir.path(), 5).unwrap().shared(),
            UiBridge::new(Vec::new()),
        ));

        // Connection handlers spawn dispatch, so its future must be Send.
        let response = tokio::spawn(async move { d.dispatch(Request::Paste(1)).await })
            .await
            .unwrap();
        assert!(matches!(
            response,
            Some(Response::Error {
                code: ErrorCode::NotFound,
                ..
            })
        ));
    }
}
