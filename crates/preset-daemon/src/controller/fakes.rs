//! In-memory collaborators for driving the controller without mpv or a
//! real network.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use preset_proto::protocol::{Connectivity, NetworkKind, Presentation};

use crate::error::{HandleError, MediaFault};
use crate::media::{HandleId, MediaBackend, MediaHandle};
use crate::network::NetworkMonitor;
use crate::presenter::{PresentationSink, IDLE_TITLE};

pub(crate) const WIFI: Connectivity = Connectivity::Connected(NetworkKind::Wifi);
pub(crate) const MOBILE: Connectivity = Connectivity::Connected(NetworkKind::Mobile);

#[derive(Default)]
pub(crate) struct Ledger {
    pub opened: Vec<(HandleId, String)>,
    pub released: Vec<HandleId>,
    pub started: Vec<HandleId>,
    pub stopped: Vec<HandleId>,
    pub prepared: HashSet<HandleId>,
    pub fail_open: bool,
}

pub(crate) struct FakeHandle {
    id: HandleId,
    ledger: Arc<Mutex<Ledger>>,
}

impl MediaHandle for FakeHandle {
    fn id(&self) -> HandleId {
        self.id
    }

    fn prepare_async(&mut self) -> Result<(), HandleError> {
        Ok(())
    }

    fn start(&mut self) -> Result<(), HandleError> {
        let mut ledger = self.ledger.lock().unwrap();
        if !ledger.prepared.contains(&self.id) {
            return Err(HandleError::IllegalState {
                op: "start",
                phase: "preparing",
            });
        }
        ledger.started.push(self.id);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), HandleError> {
        let mut ledger = self.ledger.lock().unwrap();
        if !ledger.prepared.contains(&self.id) {
            return Err(HandleError::IllegalState {
                op: "stop",
                phase: "preparing",
            });
        }
        ledger.stopped.push(self.id);
        Ok(())
    }

    fn is_playing(&self) -> Result<bool, HandleError> {
        Ok(self.ledger.lock().unwrap().started.contains(&self.id))
    }

    fn release(self: Box<Self>) {
        self.ledger.lock().unwrap().released.push(self.id);
    }
}

pub(crate) struct FakeBackend {
    pub ledger: Arc<Mutex<Ledger>>,
}

impl MediaBackend for FakeBackend {
    fn open(&mut self, id: HandleId, url: &str) -> Result<Box<dyn MediaHandle>, HandleError> {
        let mut ledger = self.ledger.lock().unwrap();
        if ledger.fail_open {
            return Err(HandleError::Fault(MediaFault::Io));
        }
        ledger.opened.push((id, url.to_string()));
        Ok(Box::new(FakeHandle {
            id,
            ledger: self.ledger.clone(),
        }))
    }
}

pub(crate) struct FakeNetwork(pub Arc<Mutex<Connectivity>>);

impl NetworkMonitor for FakeNetwork {
    fn current(&self) -> Connectivity {
        *self.0.lock().unwrap()
    }
}

#[derive(Default)]
pub(crate) struct Shown {
    pub current: Option<Presentation>,
    pub toasts: Vec<(String, bool)>,
    pub cleared: Vec<String>,
}

pub(crate) struct FakePresenter(pub Arc<Mutex<Shown>>);

impl PresentationSink for FakePresenter {
    fn publish(&mut self, presentation: Presentation) {
        self.0.lock().unwrap().current = Some(presentation);
    }

    fn clear_foreground(&mut self, status: &str) {
        let mut shown = self.0.lock().unwrap();
        shown.cleared.push(status.to_string());
        shown.current = Some(Presentation {
            title: IDLE_TITLE.to_string(),
            status: status.to_string(),
            stop_label: "Stop".to_string(),
            ticker: false,
            foreground: false,
            actions: preset_proto::protocol::transport_actions(),
        });
    }

    fn toast(&mut self, message: &str, long: bool) {
        self.0.lock().unwrap().toasts.push((message.to_string(), long));
    }

    fn current(&self) -> Option<Presentation> {
        self.0.lock().unwrap().current.clone()
    }
}
