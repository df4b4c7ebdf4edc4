//! Folding environment signals (network, phone, headset, client binding)
//! into the session.

use preset_proto::protocol::{Connectivity, PhoneState, PlaybackState};
use tracing::{debug, error, info, warn};

use super::{EndOutcome, PlaybackController};

impl PlaybackController {
    pub fn on_network_changed(&mut self) {
        let now = self.network.current();
        let state = self.session.state;
        debug!(%state, last = %self.session.network, %now, "network notification");

        match now {
            Connectivity::Connected(_) => {
                if now == self.session.network {
                    return;
                }
                if state == PlaybackState::Preparing && self.session.active.is_none() {
                    info!(%now, "network back, rebuilding dropped prepare");
                    self.session.network = now;
                    if let Err(e) = self.play_current() {
                        error!("rebuild after reconnect failed: {}", e);
                    }
                    return;
                }
                match state {
                    PlaybackState::Uninitialized
                    | PlaybackState::Stopped
                    | PlaybackState::Stopping
                    | PlaybackState::Paused
                    | PlaybackState::Phone => {
                        self.session.network = now;
                    }
                    _ => {
                        if !self.session.interrupted {
                            self.present("Network updated, reconnecting", "Cancel", true, true);
                            self.session.interrupted = true;
                        }
                        self.session.network = now;
                        if let Err(e) = self.play_current() {
                            error!("reconnect failed: {}", e);
                        }
                    }
                }
            }
            Connectivity::Disconnected => {
                self.session.network = Connectivity::Disconnected;
                match state {
                    PlaybackState::Preparing | PlaybackState::Error => {
                        self.release_active();
                        self.waiting_for_network("Waiting for network");
                    }
                    PlaybackState::Playing | PlaybackState::Buffering => {
                        self.waiting_for_network("Waiting for network");
                    }
                    PlaybackState::Stopped
                    | PlaybackState::Uninitialized
                    | PlaybackState::Initializing => {
                        info!(%state, "network lost, nothing playing");
                    }
                    _ => {
                        warn!(%state, "network lost in unexpected state");
                        if self.session.current_preset == 0 {
                            self.waiting_for_network("bad state detected");
                        } else {
                            self.waiting_for_network("Waiting for network?");
                        }
                    }
                }
            }
        }
    }

    pub fn on_phone_state(&mut self, phone: PhoneState) {
        if !self.signals.phone.is_active() {
            debug!(?phone, "phone signal while unsubscribed, ignoring");
            return;
        }
        match phone {
            PhoneState::Ringing => {
                if self.session.state.is_playing() {
                    info!("phone ringing, pausing");
                    self.pause();
                    self.set_state(PlaybackState::Phone);
                }
            }
            PhoneState::Idle => {
                if self.session.state == PlaybackState::Phone {
                    info!("phone idle, resuming");
                    if let Err(e) = self.resume() {
                        error!("resume after call failed: {}", e);
                    }
                }
            }
            PhoneState::Offhook => info!("phone offhook"),
        }
    }

    /// Returns the outcome when the removal ended the session.
    pub fn on_headset_removed(&mut self) -> Option<EndOutcome> {
        if !self.signals.headset.is_active() {
            debug!("headset signal while unsubscribed, ignoring");
            return None;
        }
        match self.session.state {
            PlaybackState::Phone | PlaybackState::Paused => {
                debug!(state = %self.session.state, "headset removed while paused");
                None
            }
            _ => {
                info!("headset removed, stopping");
                Some(self.end())
            }
        }
    }

    pub fn client_bound(&mut self) {
        self.session.bound_clients += 1;
        debug!(clients = self.session.bound_clients, "client bound");
    }

    pub fn client_unbound(&mut self) -> Option<EndOutcome> {
        self.session.bound_clients = self.session.bound_clients.saturating_sub(1);
        debug!(clients = self.session.bound_clients, "client unbound");
        if self.session.bound_clients == 0 && !self.session.state.is_playing() {
            Some(self.end())
        } else {
            None
        }
    }
}
