use preset_proto::protocol::{transport_actions, Presentation};
use tokio::sync::broadcast;
use tracing::trace;

use crate::BroadcastMessage;

/// Title shown when no station owns the notification.
pub const IDLE_TITLE: &str = "Radio Presets";

/// Where the controller sends user-visible status.
pub trait PresentationSink: Send {
    /// Replace the persistent status line.
    fn publish(&mut self, presentation: Presentation);

    /// Drop foreground status and reset to the idle title with `status`.
    fn clear_foreground(&mut self, status: &str);

    /// One-shot message.
    fn toast(&mut self, message: &str, long: bool);

    fn current(&self) -> Option<Presentation>;
}

/// Keeps the current presentation for snapshots and pushes toasts to
/// attached clients.
pub struct BroadcastPresenter {
    tx: broadcast::Sender<BroadcastMessage>,
    current: Option<Presentation>,
}

impl BroadcastPresenter {
    pub fn new(tx: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { tx, current: None }
    }
}

impl PresentationSink for BroadcastPresenter {
    fn publish(&mut self, presentation: Presentation) {
        trace!(status = %presentation.status, "presentation");
        self.current = Some(presentation);
    }

    fn clear_foreground(&mut self, status: &str) {
        self.current = Some(Presentation {
            title: IDLE_TITLE.to_string(),
            status: status.to_string(),
            stop_label: "Stop".to_string(),
            ticker: false,
            foreground: false,
            actions: transport_actions(),
        });
    }

    fn toast(&mut self, message: &str, long: bool) {
        // No receivers is fine.
        let _ = self.tx.send(BroadcastMessage::Toast {
            message: message.to_string(),
            long,
        });
    }

    fn current(&self) -> Option<Presentation> {
        self.current.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_foreground_resets_title() {
        let (tx, _rx) = broadcast::channel(8);
        let mut presenter = BroadcastPresenter::new(tx);
        presenter.publish(Presentation {
            title: "1. Jazz".to_string(),
            status: "Playing".to_string(),
            stop_label: "Stop".to_string(),
            ticker: true,
            foreground: true,
            actions: transport_actions(),
        });
        presenter.clear_foreground("Stopped");
        let current = presenter.current().unwrap();
        assert_eq!(current.title, IDLE_TITLE);
        assert_eq!(current.status, "Stopped");
        assert!(!current.foreground);
    }

    #[test]
    fn test_toast_reaches_subscribers() {
        let (tx, mut rx) = broadcast::channel(8);
        let mut presenter = BroadcastPresenter::new(tx);
        presenter.toast("Timed out", true);
        match rx.try_recv().unwrap() {
            BroadcastMessage::Toast { message, long } => {
                assert_eq!(message, "Timed out");
                assert!(long);
            }
            other => panic!("unexpected broadcast {:?}", other),
        }
    }
}
