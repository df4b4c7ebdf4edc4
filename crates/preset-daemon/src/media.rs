//! Media handle seam.
//!
//! A `MediaHandle` is one decode/playback engine instance bound to one URL.
//! Preparation is asynchronous: `prepare_async` returns at once and the
//! handle later reports `Prepared` (or `Error`) through its callbacks.
//! Callbacks are plain events tagged with the handle id; they travel over a
//! channel into the daemon core and are applied one at a time.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::{HandleError, MediaFault};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Informational signals a handle emits while playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaInfo {
    BufferingStart,
    BufferingEnd,
    /// Engine-specific bandwidth estimate in kbit/s.
    Bandwidth(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleEventKind {
    Prepared,
    Info(MediaInfo),
    Error(MediaFault),
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleEvent {
    pub handle: HandleId,
    pub kind: HandleEventKind,
}

pub trait MediaHandle: Send {
    fn id(&self) -> HandleId;

    /// Begin preparing.  Completion is reported as a `Prepared` event.
    fn prepare_async(&mut self) -> Result<(), HandleError>;

    /// Start playback.  `IllegalState` unless prepared.
    fn start(&mut self) -> Result<(), HandleError>;

    /// Stop playback.  `IllegalState` unless prepared or started.
    fn stop(&mut self) -> Result<(), HandleError>;

    fn is_playing(&self) -> Result<bool, HandleError>;

    /// Unregister callbacks, then free the engine.  Consumes the handle so a
    /// released handle cannot be used again.
    fn release(self: Box<Self>);
}

/// Creates handles.  The backend registers the four lifecycle callbacks on
/// every handle it opens.
pub trait MediaBackend: Send {
    fn open(&mut self, id: HandleId, url: &str) -> Result<Box<dyn MediaHandle>, HandleError>;
}

/// Callback registration for one handle.
///
/// Cloned into the handle's IO tasks.  Once `unregister` has been called no
/// further event leaves the handle, so a released handle cannot deliver a
/// late callback.
#[derive(Debug, Clone)]
pub struct HandleCallbacks {
    handle: HandleId,
    tx: mpsc::UnboundedSender<HandleEvent>,
    registered: Arc<AtomicBool>,
}

impl HandleCallbacks {
    pub fn register(handle: HandleId, tx: mpsc::UnboundedSender<HandleEvent>) -> Self {
        Self {
            handle,
            tx,
            registered: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Returns false when the event was dropped.
    pub fn emit(&self, kind: HandleEventKind) -> bool {
        if !self.registered.load(Ordering::Acquire) {
            return false;
        }
        self.tx
            .send(HandleEvent {
                handle: self.handle,
                kind,
            })
            .is_ok()
    }

    /// Idempotent.  Returns true if this call did the unregistering.
    pub fn unregister(&self) -> bool {
        self.registered.swap(false, Ordering::AcqRel)
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unregistered_callbacks_drop_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let callbacks = HandleCallbacks::register(HandleId(7), tx);
        let clone = callbacks.clone();

        assert!(clone.emit(HandleEventKind::Prepared));
        assert!(callbacks.unregister());
        assert!(!callbacks.unregister());
        assert!(!clone.emit(HandleEventKind::Completed));

        let evt = rx.try_recv().unwrap();
        assert_eq!(evt.handle, HandleId(7));
        assert_eq!(evt.kind, HandleEventKind::Prepared);
        assert!(rx.try_recv().is_err());
    }
}
