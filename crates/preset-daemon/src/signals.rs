//! Subscription gates for the phone and headset signal sources.
//!
//! Phone and headset reports reach the daemon as client commands at any
//! time; the controller only acts on them while it is subscribed.

use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Headset,
    Phone,
}

#[derive(Debug)]
pub struct Subscription {
    kind: SignalKind,
    active: bool,
}

impl Subscription {
    pub fn new(kind: SignalKind) -> Self {
        Self {
            kind,
            active: false,
        }
    }

    /// Returns false if already subscribed.
    pub fn subscribe(&mut self) -> bool {
        let changed = !self.active;
        self.active = true;
        trace!(signal = ?self.kind, changed, "subscribe");
        changed
    }

    /// Returns false if already unsubscribed.
    pub fn unsubscribe(&mut self) -> bool {
        let changed = self.active;
        self.active = false;
        trace!(signal = ?self.kind, changed, "unsubscribe");
        changed
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

#[derive(Debug)]
pub struct SignalSubscriptions {
    pub headset: Subscription,
    pub phone: Subscription,
}

impl Default for SignalSubscriptions {
    fn default() -> Self {
        Self {
            headset: Subscription::new(SignalKind::Headset),
            phone: Subscription::new(SignalKind::Phone),
        }
    }
}
