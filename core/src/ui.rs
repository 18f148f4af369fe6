use log::{debug, info, warn};
use tokio::sync::broadcast;

use crate::entry::EntryId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    Toggle,
    HistoryChanged(EntryId),
    PasteFailed(String),
}

/// Fan-out to whatever popup is attached: in-process subscribers get
/// [`UiEvent`]s, and TOGGLE can also launch an external command.
#[derive(Clone)]
pub struct UiBridge {
    tx: broadcast::Sender<UiEvent>,
    toggle_command: Vec<String>,
}

impl UiBridge {
    pub fn new(toggle_command: Vec<String>) -> Self {
        let (tx, _) = broadcast::channel(32);
        Self { tx, toggle_command }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.tx.subscribe()
    }

    pub fn toggle(&self) {
        self.emit(UiEvent::Toggle);

        let Some((program, args)) = self.toggle_command.split_first() else {
            return;
        };
        match tokio::process::Command::new(program).args(args).spawn() {
            Ok(_) => debug!("launched toggle command {}", program),
            Err(e) => warn!("failed to launch toggle command {}: {}", program, e),
        }
    }

    pub fn history_changed(&self, id: EntryId) {
        self.emit(UiEvent::HistoryChanged(id));
    }

    pub fn paste_failed(&self, message: String) {
        info!("paste failed: {}", message);
        self.emit(UiEvent::PasteFailed(message));
    }

    fn emit(&self, event: UiEvent) {
        // No subscribers is the normal headless case.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let ui = UiBridge::new(Vec::new());
        let mut rx = ui.subscribe();

        ui.toggle();
        ui.history_changed(4);
        ui.paste_failed("no entry with id 9".into());

        assert_eq!(rx.recv().await.unwrap(), UiEvent::Toggle);
        assert_eq!(rx.recv().await.unwrap(), UiEvent::HistoryChanged(4));
        assert_eq!(
            rx.recv().await.unwrap(),
            UiEvent::PasteFailed("no entry with id 9".into())
        );
    }
}
