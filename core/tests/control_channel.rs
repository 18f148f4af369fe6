use clipstack::clipboard::{self, SystemClipboard};
use clipstack::control::{self, ErrorCode};
use clipstack::dispatch::Dispatcher;
use clipstack::injector::PasteInjector;
use clipstack::observer::SeenMarker;
use clipstack::ui::{UiBridge, UiEvent};
use clipstack::{Claim, ClipContent, Error, PasteOutcome, Request, Response, Store};
use parking_lot::Mutex;
use std::sync::Arc;
use tempfile::tempdir;

#[derive(Clone, Default)]
struct MemoryClipboard(Arc<Mutex<Option<ClipContent>>>);

impl SystemClipboard for MemoryClipboard {
    fn read(&mut self) -> clipstack::Result<Option<ClipContent>> {
        Ok(self.0.lock().clone())
    }

    fn write(&mut self, content: &ClipContent) -> clipstack::Result<()> {
        *self.0.lock() = Some(content.clone());
        Ok(())
    }
}

#[tokio::test]
async fn requests_round_trip_through_the_socket() {
    let dir = tempdir().unwrap();
    let socket = dir.path().join("clipstack.sock");

    let store = Store::open(dir.path().join("data"), 10).unwrap().shared();
    let entry = store.lock().insert(ClipContent::Text("hello".into())).unwrap();

    let memory = MemoryClipboard::default();
    let injector = PasteInjector::new(
        store.clone(),
        clipboard::shared(memory.clone()),
        SeenMarker::default(),
        None,
    );
    let ui = UiBridge::new(Vec::new());
    let mut events = ui.subscribe();
    let dispatcher = Arc::new(Dispatcher::new(store.clone(), injector, ui));

    let server = control::claim(&socket).unwrap().into_owner().unwrap();
    let serving = tokio::spawn(async move { server.serve(dispatcher).await });

    let listed = control::send(&socket, &Request::Query(None)).await.unwrap();
    let Some(Response::Entries { entries }) = listed else {
        panic!("expected entries, got {listed:?}");
    };
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].entry.text(), Some("hello"));
    assert!(entries[0].preview.is_none());

    // Without a keystroke strategy the entry still lands on the clipboard.
    let pasted = control::send(&socket, &Request::Paste(entry.id)).await.unwrap();
    assert_eq!(
        pasted,
        Some(Response::Pasted {
            outcome: PasteOutcome::ClipboardOnly
        })
    );
    assert_eq!(*memory.0.lock(), Some(ClipContent::Text("hello".into())));

    let missing = control::send(&socket, &Request::Pin(999)).await.unwrap();
    assert!(matches!(
        missing,
        Some(Response::Error {
            code: ErrorCode::NotFound,
            ..
        })
    ));

    assert_eq!(control::send(&socket, &Request::Toggle).await.unwrap(), None);
    assert_eq!(events.recv().await.unwrap(), UiEvent::Toggle);

    serving.abort();
}

#[tokio::test]
async fn second_instance_defers_to_the_first() {
    let dir = tempdir().unwrap();
    let socket = dir.path().join("clipstack.sock");

    let first = control::claim(&socket).unwrap();
    assert!(matches!(first, Claim::Owner(_)));

    let second = control::claim(&socket).unwrap();
    assert!(matches!(second.into_owner(), Err(Error::AlreadyRunning)));

    drop(first);
    assert!(!socket.exists());
    assert!(matches!(
        control::send(&socket, &Request::Query(None)).await,
        Err(Error::NotRunning)
    ));
}
