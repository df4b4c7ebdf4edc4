//! PlaybackController: the single owner of the playback session.
//!
//! Every method runs on the daemon core's event loop, one event at a time.
//! Media handles report back through `on_handle_event`; events carrying an
//! id that is neither the active nor the pending handle are dropped.

#[cfg(test)]
pub(crate) mod fakes;
mod reconcile;

use preset_proto::protocol::{
    transport_actions, Connectivity, PlaybackState, Presentation, SessionSnapshot,
};
use tracing::{debug, error, info, trace, warn};

use crate::error::{
    ControllerError, ControllerResult, HandleError, MediaFault, MEDIA_ERROR_UNKNOWN,
};
use crate::media::{
    HandleEvent, HandleEventKind, HandleId, MediaBackend, MediaHandle, MediaInfo,
};
use crate::network::NetworkMonitor;
use crate::presenter::{PresentationSink, IDLE_TITLE};
use crate::signals::SignalSubscriptions;
use crate::store::StationStore;

const CONNECT_ERROR_PREFIX: &str = "An error occurred while trying to connect to the server. ";
const ERROR_PREFIX: &str = "Error: ";

/// Mutable session data.  Lives exactly as long as the controller.
#[derive(Default)]
pub struct Session {
    pub state: PlaybackState,
    /// 0 = none selected.
    pub current_preset: u32,
    pub current_title: Option<String>,
    pub current_url: Option<String>,
    active: Option<Box<dyn MediaHandle>>,
    /// Only populated during an end-of-stream handover.
    pending: Option<Box<dyn MediaHandle>>,
    pub network: Connectivity,
    pub interrupted: bool,
    pub bound_clients: usize,
}

/// Result of `end()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOutcome {
    TornDown,
    /// A client is still bound; the session stays alive in `Stopped`.
    Deferred,
}

/// External collaborators the controller drives.
pub struct Collaborators {
    pub backend: Box<dyn MediaBackend>,
    pub store: Box<dyn StationStore>,
    pub network: Box<dyn NetworkMonitor>,
    pub presenter: Box<dyn PresentationSink>,
}

pub struct PlaybackController {
    session: Session,
    backend: Box<dyn MediaBackend>,
    store: Box<dyn StationStore>,
    network: Box<dyn NetworkMonitor>,
    presenter: Box<dyn PresentationSink>,
    signals: SignalSubscriptions,
    next_handle_id: u64,
}

impl PlaybackController {
    /// `first_handle_id` keeps ids unique across sessions so a late event
    /// from a previous session can never match a live handle.
    pub fn new(parts: Collaborators, first_handle_id: u64) -> Self {
        Self {
            session: Session::default(),
            backend: parts.backend,
            store: parts.store,
            network: parts.network,
            presenter: parts.presenter,
            signals: SignalSubscriptions::default(),
            next_handle_id: first_handle_id.max(1),
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.session.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn next_handle_id(&self) -> u64 {
        self.next_handle_id
    }

    pub fn active_handle(&self) -> Option<HandleId> {
        self.session.active.as_ref().map(|h| h.id())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.session.state,
            current_preset: self.session.current_preset,
            current_title: self.session.current_title.clone(),
            current_url: self.session.current_url.clone(),
            interrupted: self.session.interrupted,
            network: self.session.network,
            bound_clients: self.session.bound_clients,
            presentation: self.presenter.current(),
            ..Default::default()
        }
    }

    /// Point a fresh session at the preset selected last time, without
    /// playing it.  Unknown presets are ignored.
    pub fn restore_cursor(&mut self, preset: u32) {
        if preset == 0 || self.session.current_preset != 0 {
            return;
        }
        match self.store.lookup(preset) {
            Some(station) => {
                debug!(preset, "restoring preset cursor");
                self.session.current_preset = preset;
                self.session.current_title = Some(station.title);
                self.session.current_url = Some(station.url);
            }
            None => debug!(preset, "remembered preset no longer exists"),
        }
    }

    fn set_state(&mut self, next: PlaybackState) {
        let prev = self.session.state;
        if prev != next {
            info!(from = %prev, to = %next, preset = self.session.current_preset, "state");
        }
        self.session.state = next;
    }

    // ── presentation ──────────────────────────────────────────────────────

    fn title_line(&self) -> String {
        match (&self.session.current_title, self.session.current_preset) {
            (Some(title), preset) if preset != 0 => format!("{}. {}", preset, title),
            _ => IDLE_TITLE.to_string(),
        }
    }

    fn present(&mut self, status: &str, stop_label: &str, ticker: bool, foreground: bool) {
        let presentation = Presentation {
            title: self.title_line(),
            status: status.to_string(),
            stop_label: stop_label.to_string(),
            ticker,
            foreground,
            actions: transport_actions(),
        };
        self.presenter.publish(presentation);
    }

    fn waiting_for_network(&mut self, status: &str) {
        self.present(status, "Stop", false, true);
    }

    // ── handle ownership ──────────────────────────────────────────────────

    fn release_active(&mut self) {
        if let Some(handle) = self.session.active.take() {
            debug!(handle = %handle.id(), "releasing active handle");
            handle.release();
        }
    }

    fn release_pending(&mut self) {
        if let Some(handle) = self.session.pending.take() {
            debug!(handle = %handle.id(), "releasing pending handle");
            handle.release();
        }
    }

    fn allocate_handle_id(&mut self) -> HandleId {
        let id = HandleId(self.next_handle_id);
        self.next_handle_id += 1;
        id
    }

    // ── commands ──────────────────────────────────────────────────────────

    pub fn play_preset(&mut self, preset: u32) -> ControllerResult<()> {
        if preset == 0 {
            return Err(ControllerError::InvalidArgument(
                "preset 0 does not name a station".to_string(),
            ));
        }
        let station = self
            .store
            .lookup(preset)
            .ok_or(ControllerError::NotFound(preset))?;

        self.set_state(PlaybackState::Initializing);
        self.session.current_preset = preset;
        self.session.current_title = Some(station.title);
        self.session.current_url = Some(station.url.clone());

        let connectivity = self.network.current();
        if !connectivity.is_connected() {
            self.session.network = Connectivity::Disconnected;
            if self.session.interrupted {
                info!(preset, "no network, waiting to resume");
                self.set_state(PlaybackState::Playing);
                self.waiting_for_network("Waiting for network");
            } else {
                info!(preset, "no network, not starting playback");
                self.release_active();
                self.set_state(PlaybackState::Uninitialized);
                self.presenter.clear_foreground("No network connection");
            }
            return Ok(());
        }
        self.session.network = connectivity;

        if !self.signals.headset.subscribe() {
            trace!("headset already subscribed");
        }
        if !self.signals.phone.subscribe() {
            trace!("phone already subscribed");
        }

        self.release_active();
        let id = self.allocate_handle_id();
        let mut handle = match self.backend.open(id, &station.url) {
            Ok(h) => h,
            Err(e) => {
                error!(handle = %id, "failed to open media handle: {}", e);
                self.set_state(PlaybackState::Preparing);
                self.fail_active(fault_of(e));
                return Ok(());
            }
        };
        let prepared = handle.prepare_async();
        self.session.active = Some(handle);
        self.set_state(PlaybackState::Preparing);

        match prepared {
            Ok(()) => {
                info!(handle = %id, url = %station.url, "preparing");
                self.present("Preparing", "Cancel", true, true);
            }
            Err(e) => {
                error!(handle = %id, "prepare failed: {}", e);
                self.fail_active(fault_of(e));
            }
        }
        Ok(())
    }

    pub fn play_current(&mut self) -> ControllerResult<()> {
        if self.session.current_preset == 0 {
            return Err(ControllerError::InvalidArgument(
                "no preset selected".to_string(),
            ));
        }
        self.play_preset(self.session.current_preset)
    }

    pub fn next(&mut self) -> ControllerResult<()> {
        let Some(lowest) = self.store.lowest() else {
            warn!("next: no presets defined");
            return Ok(());
        };
        let wanted = self.session.current_preset.saturating_add(1);
        let resolved = self.store.first_at_or_after(wanted).unwrap_or(lowest);
        debug!(from = self.session.current_preset, to = resolved, "next");
        self.session.current_preset = resolved;
        self.play_current()
    }

    pub fn previous(&mut self) -> ControllerResult<()> {
        let max = self.store.max_preset();
        if max == 0 {
            warn!("previous: no presets defined");
            return Ok(());
        }
        let wanted = self.session.current_preset.saturating_sub(1);
        let resolved = if wanted == 0 {
            max
        } else {
            self.store.last_at_or_before(wanted).unwrap_or(max)
        };
        if self.store.lookup(resolved).is_none() {
            error!(preset = resolved, "previous: store reported a preset it cannot resolve");
            return Err(ControllerError::Internal(format!(
                "preset {} vanished during lookup",
                resolved
            )));
        }
        debug!(from = self.session.current_preset, to = resolved, "previous");
        self.session.current_preset = resolved;
        self.play_current()
    }

    pub fn pause(&mut self) {
        match self.session.active.take() {
            None => error!(state = %self.session.state, "pause: no active handle"),
            Some(handle) if self.session.state == PlaybackState::Preparing => {
                debug!(handle = %handle.id(), "pause while preparing, releasing");
                handle.release();
            }
            Some(mut handle) => {
                if let Err(e) = handle.stop() {
                    debug!(handle = %handle.id(), "pause: {}", e);
                }
                handle.release();
                self.present("Paused", "Stop", false, false);
            }
        }
        self.set_state(PlaybackState::Paused);
    }

    pub fn resume(&mut self) -> ControllerResult<()> {
        self.play_current()
    }

    pub fn stop(&mut self) {
        self.session.interrupted = false;
        if matches!(
            self.session.state,
            PlaybackState::Stopped | PlaybackState::End | PlaybackState::Uninitialized
        ) {
            debug!(state = %self.session.state, "stop: nothing to stop");
            return;
        }
        let cancelling_prepare = self.session.state == PlaybackState::Preparing;
        self.set_state(PlaybackState::Stopping);
        self.presenter.clear_foreground("Stopped");
        if !cancelling_prepare {
            self.presenter.toast("Stopping playback", false);
        }

        match self.session.active.take() {
            Some(mut handle) => {
                if let Err(e) = handle.stop() {
                    debug!(handle = %handle.id(), "stop: {}", e);
                }
                handle.release();
            }
            None => warn!("stop: no active handle"),
        }
        self.release_pending();

        if !self.signals.headset.unsubscribe() {
            debug!("headset already unsubscribed");
        }
        if !self.signals.phone.unsubscribe() {
            debug!("phone already unsubscribed");
        }
        self.set_state(PlaybackState::Stopped);
    }

    pub fn end(&mut self) -> EndOutcome {
        self.stop();
        if self.session.bound_clients == 0 {
            self.release_active();
            self.release_pending();
            self.set_state(PlaybackState::End);
            info!("session torn down");
            EndOutcome::TornDown
        } else {
            debug!(clients = self.session.bound_clients, "end deferred, clients bound");
            EndOutcome::Deferred
        }
    }

    // ── handle callbacks ──────────────────────────────────────────────────

    pub fn on_handle_event(&mut self, event: HandleEvent) {
        let is_active = self.active_handle() == Some(event.handle);
        let is_pending = self.session.pending.as_ref().map(|h| h.id()) == Some(event.handle);
        if !is_active && !is_pending {
            debug!(handle = %event.handle, kind = ?event.kind, "dropping stale handle event");
            return;
        }
        match event.kind {
            HandleEventKind::Prepared => self.on_prepared(is_pending),
            HandleEventKind::Info(info) => {
                if is_active {
                    self.on_info(info);
                }
            }
            HandleEventKind::Error(fault) => {
                if is_pending {
                    warn!(handle = %event.handle, "pending handle failed: {}", fault);
                    self.release_pending();
                } else {
                    self.on_error(fault);
                }
            }
            HandleEventKind::Completed => {
                if is_active {
                    self.on_completion();
                }
            }
        }
    }

    fn on_prepared(&mut self, from_pending: bool) {
        if from_pending {
            debug!("pending handle prepared, waiting for handover");
            return;
        }
        if matches!(
            self.session.state,
            PlaybackState::Restarting | PlaybackState::Complete
        ) {
            info!(state = %self.session.state, "prepared during handover, not starting");
            return;
        }
        if let Some(handle) = self.session.active.as_mut() {
            if let Err(e) = handle.start() {
                warn!(handle = %handle.id(), "start: {}", e);
            }
        }
        self.set_state(PlaybackState::Playing);
        self.session.interrupted = false;
        self.present("Playing", "Stop", true, true);
        let toast = format!("Playing {}", self.title_line());
        self.presenter.toast(&toast, false);
    }

    fn on_info(&mut self, info: MediaInfo) {
        match info {
            MediaInfo::BufferingStart => {
                self.set_state(PlaybackState::Buffering);
                self.present("Buffering", "Cancel", true, true);
            }
            MediaInfo::BufferingEnd => {
                self.set_state(PlaybackState::Playing);
                self.present("Playing", "Stop", true, true);
            }
            MediaInfo::Bandwidth(kbps) => debug!(kbps, "bandwidth estimate"),
        }
    }

    fn on_completion(&mut self) {
        self.set_state(PlaybackState::Complete);
        if self.session.interrupted {
            info!("playback completed after interruption");
            self.presenter.toast("Playback completed after interruption", false);
        } else {
            warn!("playback completed without interruption, restarting");
            self.presenter
                .toast("Playback completed, no interruption reported", false);
            if let Err(e) = self.play_current() {
                error!("restart after completion failed: {}", e);
            }
        }

        // Handover.  Nothing populates `pending` today.
        if let Some(next) = self.session.pending.take() {
            self.release_active();
            let playing = next.is_playing().unwrap_or(false);
            self.session.active = Some(next);
            if playing {
                self.set_state(PlaybackState::Playing);
                self.session.interrupted = false;
            } else {
                warn!("handover: new handle is not playing yet");
            }
        }
    }

    fn on_error(&mut self, fault: MediaFault) {
        self.fail_active(fault);
    }

    /// Tear down the active handle after a fault and surface the message.
    fn fail_active(&mut self, fault: MediaFault) {
        let previous = self.session.state;
        let (code, extra) = fault.codes();
        error!(state = %previous, code, extra, "media fault: {}", fault);

        self.presenter.clear_foreground("Error");
        if let Some(mut handle) = self.session.active.take() {
            match handle.stop() {
                Ok(()) => {}
                Err(HandleError::IllegalState { op, phase }) => {
                    debug!(handle = %handle.id(), op, phase, "handle not prepared, skipping stop")
                }
                Err(e) => warn!(handle = %handle.id(), "stop after fault: {}", e),
            }
            handle.release();
        }
        self.set_state(PlaybackState::Error);

        let prefix = if previous == PlaybackState::Preparing {
            CONNECT_ERROR_PREFIX
        } else {
            ERROR_PREFIX
        };
        self.presenter.toast(&format!("{}{}", prefix, fault), true);

        if previous == PlaybackState::Preparing {
            self.stop();
        }
    }
}

fn fault_of(err: HandleError) -> MediaFault {
    match err {
        HandleError::Fault(fault) => fault,
        HandleError::IllegalState { .. } => MediaFault::Other {
            code: MEDIA_ERROR_UNKNOWN,
            extra: 0,
        },
    }
}
