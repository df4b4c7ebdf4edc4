/// DaemonCore: single-owner event loop for the playback session.
///
/// Every input (client commands, client bind/unbind, media handle
/// callbacks, network notifications) arrives as a `DaemonEvent` on one
/// mailbox and is applied to the `PlaybackController` one at a time.  No
/// other task touches the session.
///
/// After each event the controller snapshot is published through the
/// `StateManager` and a `BroadcastMessage::StateUpdated` goes out to every
/// attached client.
///
/// The session is created on the first bind or command and dropped once it
/// reaches `End`.  With `daemon.exit_when_idle` the loop then returns and the
/// process exits.
use std::sync::Arc;

use preset_proto::config::{Config, MpvConfig};
use preset_proto::protocol::{Command, Disposition, PlaybackState, SessionSnapshot};
use preset_proto::state::StateManager;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::controller::{Collaborators, PlaybackController};
use crate::media::HandleEvent;
use crate::mpv::MpvBackend;
use crate::network::SystemNetworkMonitor;
use crate::presenter::BroadcastPresenter;
use crate::store::{load_presets, PresetStore};
use crate::BroadcastMessage;

// ── DaemonEvent ───────────────────────────────────────────────────────────────

/// All inputs into the DaemonCore loop.
#[derive(Debug)]
pub enum DaemonEvent {
    /// A command from a socket client or the HTTP API.
    ClientCommand(Command),
    /// A socket client attached.  The sender is acked once the bind is
    /// reflected in the published snapshot.
    ClientBound(oneshot::Sender<()>),
    /// A socket client went away.
    ClientUnbound,
    /// Callback from a media handle (forwarded from the handle channel).
    Handle(HandleEvent),
    /// Connectivity may have changed.
    NetworkChanged,
    Shutdown,
}

// ── Session collaborators ─────────────────────────────────────────────────────

/// What a new session's collaborators are built from.
pub struct SessionDeps<'a> {
    pub mpv: &'a MpvConfig,
    pub presets: &'a PresetStore,
    pub handle_tx: &'a mpsc::UnboundedSender<HandleEvent>,
    pub clients_tx: &'a broadcast::Sender<BroadcastMessage>,
}

/// Called once per session.
pub type CollaboratorFactory = Box<dyn FnMut(SessionDeps<'_>) -> Collaborators + Send>;

/// mpv handles, the host's network state and client-facing presentation.
pub fn system_collaborators(deps: SessionDeps<'_>) -> Collaborators {
    Collaborators {
        backend: Box::new(MpvBackend::new(deps.mpv.clone(), deps.handle_tx.clone())),
        store: Box::new(deps.presets.clone()),
        network: Box::new(SystemNetworkMonitor::new()),
        presenter: Box::new(BroadcastPresenter::new(deps.clients_tx.clone())),
    }
}

// ── DaemonCore ────────────────────────────────────────────────────────────────

pub struct DaemonCore {
    config: Config,
    state_manager: Arc<StateManager>,
    presets: PresetStore,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    handle_tx: mpsc::UnboundedSender<HandleEvent>,
    factory: CollaboratorFactory,
    session: Option<PlaybackController>,
    /// Carried across sessions so handle ids never repeat.
    next_handle_id: u64,
    /// Cursor a fresh session starts from.
    last_preset: u32,
}

impl DaemonCore {
    pub async fn new(
        config: Config,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
        event_tx: mpsc::Sender<DaemonEvent>,
    ) -> anyhow::Result<Self> {
        let presets = PresetStore::from_entries(load_presets(&config).await);
        if presets.is_empty() {
            warn!(
                "DaemonCore: no presets configured, add stations to {:?}",
                config.stations.stations_toml
            );
        } else {
            info!("DaemonCore: {} presets", presets.len());
        }
        Ok(Self::with_factory(
            config,
            presets,
            broadcast_tx,
            event_tx,
            Box::new(system_collaborators),
        )
        .await)
    }

    pub async fn with_factory(
        config: Config,
        presets: PresetStore,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
        event_tx: mpsc::Sender<DaemonEvent>,
        factory: CollaboratorFactory,
    ) -> Self {
        let state_manager = Arc::new(StateManager::new(
            config.daemon.state_file.clone(),
            presets.entries(),
        ));
        let last_preset = state_manager.persistent().await.last_preset;

        // Handle callbacks arrive on an unbounded channel and are moved into
        // the mailbox in emission order.
        let (handle_tx, mut handle_rx) = mpsc::unbounded_channel::<HandleEvent>();
        tokio::spawn(async move {
            while let Some(evt) = handle_rx.recv().await {
                if event_tx.send(DaemonEvent::Handle(evt)).await.is_err() {
                    break;
                }
            }
            debug!("handle event forwarder exiting");
        });

        Self {
            config,
            state_manager,
            presets,
            broadcast_tx,
            handle_tx,
            factory,
            session: None,
            next_handle_id: 1,
            last_preset,
        }
    }

    /// Borrow the state manager (for the socket and HTTP servers).
    pub fn state_manager(&self) -> Arc<StateManager> {
        Arc::clone(&self.state_manager)
    }

    /// The live session, created on demand.
    fn session(&mut self) -> &mut PlaybackController {
        let Self {
            session,
            config,
            presets,
            broadcast_tx,
            handle_tx,
            factory,
            next_handle_id,
            last_preset,
            ..
        } = self;
        session.get_or_insert_with(|| {
            info!("DaemonCore: opening session");
            let parts = factory(SessionDeps {
                mpv: &config.mpv,
                presets: &*presets,
                handle_tx: &*handle_tx,
                clients_tx: &*broadcast_tx,
            });
            let mut ctl = PlaybackController::new(parts, *next_handle_id);
            ctl.restore_cursor(*last_preset);
            ctl
        })
    }

    /// Run the core event loop.  Returns on `Shutdown`, when the mailbox
    /// closes, or when the session ends and the daemon should exit.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<DaemonEvent>) -> anyhow::Result<()> {
        info!("DaemonCore: starting event loop");
        self.publish().await;

        if self.config.daemon.resume_on_start {
            if let Some(preset) = self.state_manager.persistent().await.redeliver_preset {
                info!("DaemonCore: redelivering play of preset {}", preset);
                self.handle_command(Command::Play { preset }).await;
                if self.after_event().await {
                    return Ok(());
                }
            }
        }

        loop {
            let Some(evt) = event_rx.recv().await else {
                info!("DaemonCore: event channel closed, shutting down");
                break;
            };

            let mut bound_ack = None;
            match evt {
                DaemonEvent::Shutdown => {
                    info!("DaemonCore: shutdown requested");
                    break;
                }
                DaemonEvent::ClientCommand(cmd) => {
                    info!("DaemonCore: command {:?}", cmd);
                    self.handle_command(cmd).await;
                }
                DaemonEvent::ClientBound(ack) => {
                    self.session().client_bound();
                    bound_ack = Some(ack);
                }
                DaemonEvent::ClientUnbound => match self.session.as_mut() {
                    Some(ctl) => {
                        ctl.client_unbound();
                    }
                    None => warn!("DaemonCore: unbind with no session"),
                },
                DaemonEvent::Handle(evt) => match self.session.as_mut() {
                    Some(ctl) => ctl.on_handle_event(evt),
                    None => debug!("DaemonCore: no session for handle event {:?}", evt),
                },
                DaemonEvent::NetworkChanged => match self.session.as_mut() {
                    Some(ctl) => ctl.on_network_changed(),
                    None => debug!("DaemonCore: network change with no session"),
                },
            }

            let exit = self.after_event().await;
            if let Some(ack) = bound_ack {
                // The client may have gone already.
                let _ = ack.send(());
            }
            if exit {
                break;
            }
        }

        self.cleanup();
        Ok(())
    }

    async fn handle_command(&mut self, cmd: Command) {
        if matches!(cmd, Command::GetState) {
            // Every client gets a fresh snapshot after each event anyway.
            return;
        }
        let kind = cmd.kind();
        let disposition = cmd.disposition();

        let ctl = self.session();
        let result = match cmd {
            Command::Play { preset } => ctl.play_preset(preset),
            Command::Next => ctl.next(),
            Command::Previous => ctl.previous(),
            Command::Stop => {
                ctl.end();
                Ok(())
            }
            Command::Pause => {
                ctl.pause();
                Ok(())
            }
            Command::Resume => ctl.resume(),
            Command::PhoneState { state } => {
                ctl.on_phone_state(state);
                Ok(())
            }
            Command::HeadsetRemoved => {
                ctl.on_headset_removed();
                Ok(())
            }
            Command::NetworkChanged => {
                ctl.on_network_changed();
                Ok(())
            }
            Command::GetState => Ok(()),
        };

        match result {
            Ok(()) => {
                if disposition == Disposition::Redeliver {
                    let preset = ctl.session().current_preset;
                    if let Err(e) = self.state_manager.set_redeliver(Some(preset)).await {
                        warn!("DaemonCore: failed to persist redelivery: {}", e);
                    }
                }
            }
            Err(e) => {
                error!("DaemonCore: {} failed: {}", kind, e);
                let _ = self
                    .broadcast_tx
                    .send(BroadcastMessage::Error(format!("{}: {}", kind, e)));
            }
        }
    }

    /// Publish the snapshot and retire an ended session.  Returns true when
    /// the daemon should exit.
    async fn after_event(&mut self) -> bool {
        let ended = self
            .session
            .as_ref()
            .map_or(false, |ctl| ctl.state() == PlaybackState::End);

        if let Some(ctl) = self.session.as_ref() {
            let session = ctl.session();
            let state = session.state;
            let preset = session.current_preset;
            if preset != 0 {
                self.last_preset = preset;
                if let Err(e) = self.state_manager.remember_preset(preset).await {
                    warn!("DaemonCore: failed to save state: {}", e);
                }
            }
            let redeliver = if state.is_playing() {
                self.state_manager
                    .persistent()
                    .await
                    .redeliver_preset
                    .map(|_| preset)
            } else {
                None
            };
            if let Err(e) = self.state_manager.set_redeliver(redeliver).await {
                warn!("DaemonCore: failed to save state: {}", e);
            }
        }

        self.publish().await;

        if ended {
            if let Some(ctl) = self.session.take() {
                self.next_handle_id = ctl.next_handle_id();
            }
            info!("DaemonCore: session ended");
            return self.config.daemon.exit_when_idle;
        }
        false
    }

    async fn publish(&self) {
        let snapshot = match self.session.as_ref() {
            Some(ctl) => ctl.snapshot(),
            None => SessionSnapshot::default(),
        };
        let rev = self.state_manager.publish(snapshot).await;
        debug!("DaemonCore: published rev {}", rev);
        // No receivers is fine.
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }

    fn cleanup(&mut self) {
        if let Some(mut ctl) = self.session.take() {
            info!("DaemonCore: releasing session");
            ctl.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use preset_proto::protocol::PresetEntry;

    use crate::controller::fakes::{FakeBackend, FakeNetwork, FakePresenter, Ledger, Shown, WIFI};
    use crate::media::HandleId;

    struct Rig {
        core: DaemonCore,
        tx: mpsc::Sender<DaemonEvent>,
        rx: mpsc::Receiver<DaemonEvent>,
        clients_rx: broadcast::Receiver<BroadcastMessage>,
        state_manager: Arc<StateManager>,
        ledger: Arc<Mutex<Ledger>>,
        sessions: Arc<AtomicUsize>,
    }

    fn station(preset: u32, name: &str) -> PresetEntry {
        PresetEntry {
            preset,
            title: name.to_uppercase(),
            url: format!("http://radio.test/{}", name),
        }
    }

    async fn new_rig(state_file: &Path, tweak: impl FnOnce(&mut Config)) -> Rig {
        let mut config = Config::default();
        config.daemon.state_file = state_file.to_path_buf();
        config.daemon.exit_when_idle = false;
        config.daemon.resume_on_start = false;
        tweak(&mut config);

        let (clients_tx, clients_rx) = broadcast::channel(64);
        let (tx, rx) = mpsc::channel(64);
        let ledger = Arc::new(Mutex::new(Ledger::default()));
        let sessions = Arc::new(AtomicUsize::new(0));

        let factory: CollaboratorFactory = {
            let ledger = ledger.clone();
            let sessions = sessions.clone();
            Box::new(move |deps: SessionDeps<'_>| {
                sessions.fetch_add(1, Ordering::SeqCst);
                Collaborators {
                    backend: Box::new(FakeBackend {
                        ledger: ledger.clone(),
                    }),
                    store: Box::new(deps.presets.clone()),
                    network: Box::new(FakeNetwork(Arc::new(Mutex::new(WIFI)))),
                    presenter: Box::new(FakePresenter(Arc::new(Mutex::new(Shown::default())))),
                }
            })
        };
        let presets = PresetStore::from_entries(vec![station(1, "a"), station(3, "b")]);
        let core = DaemonCore::with_factory(config, presets, clients_tx, tx.clone(), factory).await;
        let state_manager = core.state_manager();
        Rig {
            core,
            tx,
            rx,
            clients_rx,
            state_manager,
            ledger,
            sessions,
        }
    }

    impl Rig {
        async fn feed(&self, events: Vec<DaemonEvent>) {
            for evt in events {
                self.tx.send(evt).await.unwrap();
            }
        }

        async fn command(&self, cmd: Command) {
            self.feed(vec![DaemonEvent::ClientCommand(cmd)]).await;
        }

        /// Run the loop to completion; the queued events must end it.
        async fn finish(self) -> Finished {
            tokio::time::timeout(Duration::from_secs(5), self.core.run(self.rx))
                .await
                .expect("core loop did not return")
                .unwrap();
            Finished {
                snapshot: self.state_manager.get_state().await,
                persisted: self.state_manager.persistent().await,
                opened: self.ledger.lock().unwrap().opened.clone(),
                sessions: self.sessions.load(Ordering::SeqCst),
                clients_rx: self.clients_rx,
            }
        }
    }

    struct Finished {
        snapshot: SessionSnapshot,
        persisted: preset_proto::state::PersistentState,
        opened: Vec<(HandleId, String)>,
        sessions: usize,
        clients_rx: broadcast::Receiver<BroadcastMessage>,
    }

    fn state_file(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("state.json")
    }

    #[tokio::test]
    async fn test_session_is_created_lazily() {
        let dir = tempfile::tempdir().unwrap();

        let rig = new_rig(&state_file(&dir), |_| {}).await;
        rig.command(Command::GetState).await;
        rig.feed(vec![DaemonEvent::Shutdown]).await;
        let done = rig.finish().await;
        assert_eq!(done.sessions, 0);
        assert_eq!(done.snapshot.state, PlaybackState::Uninitialized);

        let rig = new_rig(&state_file(&dir), |_| {}).await;
        rig.command(Command::Play { preset: 1 }).await;
        rig.command(Command::Next).await;
        rig.feed(vec![DaemonEvent::Shutdown]).await;
        let done = rig.finish().await;
        assert_eq!(done.sessions, 1);
        assert_eq!(done.snapshot.state, PlaybackState::Preparing);
        assert_eq!(done.snapshot.current_preset, 3);
        assert_eq!(
            done.opened,
            vec![
                (HandleId(1), "http://radio.test/a".to_string()),
                (HandleId(2), "http://radio.test/b".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_bind_is_acked_after_publish() {
        let dir = tempfile::tempdir().unwrap();
        let rig = new_rig(&state_file(&dir), |_| {}).await;
        let (ack_tx, ack_rx) = oneshot::channel();
        rig.feed(vec![DaemonEvent::ClientBound(ack_tx), DaemonEvent::Shutdown])
            .await;
        let done = rig.finish().await;

        ack_rx.await.unwrap();
        assert_eq!(done.sessions, 1);
        assert_eq!(done.snapshot.bound_clients, 1);
    }

    #[tokio::test]
    async fn test_ended_session_is_retired_and_ids_continue() {
        let dir = tempfile::tempdir().unwrap();
        let rig = new_rig(&state_file(&dir), |_| {}).await;
        rig.command(Command::Play { preset: 1 }).await;
        rig.command(Command::Stop).await;
        rig.command(Command::Play { preset: 3 }).await;
        rig.feed(vec![DaemonEvent::Shutdown]).await;
        let done = rig.finish().await;

        assert_eq!(done.sessions, 2);
        assert_eq!(done.snapshot.state, PlaybackState::Preparing);
        let ids: Vec<HandleId> = done.opened.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![HandleId(1), HandleId(2)]);
    }

    #[tokio::test]
    async fn test_exit_when_idle_returns_after_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let rig = new_rig(&state_file(&dir), |c| c.daemon.exit_when_idle = true).await;
        rig.command(Command::Play { preset: 1 }).await;
        rig.command(Command::Stop).await;
        // No Shutdown queued: the loop has to leave on its own.
        let done = rig.finish().await;

        assert_eq!(done.snapshot.state, PlaybackState::End);
        assert_eq!(done.persisted.redeliver_preset, None);
        assert_eq!(done.persisted.last_preset, 1);
    }

    #[tokio::test]
    async fn test_play_is_persisted_and_replayed_on_start() {
        let dir = tempfile::tempdir().unwrap();
        let file = state_file(&dir);

        let rig = new_rig(&file, |_| {}).await;
        rig.command(Command::Play { preset: 3 }).await;
        rig.feed(vec![DaemonEvent::Shutdown]).await;
        let done = rig.finish().await;
        assert_eq!(done.persisted.redeliver_preset, Some(3));

        let rig = new_rig(&file, |c| c.daemon.resume_on_start = true).await;
        rig.feed(vec![DaemonEvent::Shutdown]).await;
        let done = rig.finish().await;
        assert_eq!(
            done.opened,
            vec![(HandleId(1), "http://radio.test/b".to_string())]
        );
        assert_eq!(done.snapshot.current_preset, 3);
        assert_eq!(done.persisted.redeliver_preset, Some(3));
    }

    #[tokio::test]
    async fn test_resume_on_start_without_redelivery_stays_idle() {
        let dir = tempfile::tempdir().unwrap();
        let rig = new_rig(&state_file(&dir), |c| c.daemon.resume_on_start = true).await;
        rig.feed(vec![DaemonEvent::Shutdown]).await;
        let done = rig.finish().await;
        assert_eq!(done.sessions, 0);
        assert!(done.opened.is_empty());
    }

    #[tokio::test]
    async fn test_controller_errors_reach_clients() {
        let dir = tempfile::tempdir().unwrap();
        let rig = new_rig(&state_file(&dir), |_| {}).await;
        rig.command(Command::Play { preset: 5 }).await;
        rig.feed(vec![DaemonEvent::Shutdown]).await;
        let mut done = rig.finish().await;

        let mut errors = Vec::new();
        while let Ok(msg) = done.clients_rx.try_recv() {
            if let BroadcastMessage::Error(text) = msg {
                errors.push(text);
            }
        }
        assert_eq!(errors, vec!["play: preset 5 not found".to_string()]);
        assert_eq!(done.snapshot.state, PlaybackState::Uninitialized);
        assert_eq!(done.persisted.redeliver_preset, None);
    }

    #[tokio::test]
    async fn test_fresh_session_resumes_last_preset() {
        let dir = tempfile::tempdir().unwrap();
        let file = state_file(&dir);

        let rig = new_rig(&file, |_| {}).await;
        rig.command(Command::Play { preset: 3 }).await;
        rig.command(Command::Stop).await;
        rig.feed(vec![DaemonEvent::Shutdown]).await;
        let done = rig.finish().await;
        assert_eq!(done.persisted.last_preset, 3);

        let rig = new_rig(&file, |_| {}).await;
        rig.command(Command::Resume).await;
        rig.feed(vec![DaemonEvent::Shutdown]).await;
        let done = rig.finish().await;
        assert_eq!(
            done.opened,
            vec![(HandleId(1), "http://radio.test/b".to_string())]
        );
        assert_eq!(done.snapshot.current_title.as_deref(), Some("B"));
    }
}
