//! mpv-backed media handles.
//!
//! Every handle owns one mpv process and one JSON IPC connection:
//!
//! ```text
//!   MpvMediaHandle::prepare_async()
//!         │
//!         └── PrepareJob: spawn mpv, connect, observe, loadfile
//!                   ├── writer_task  ← Outgoing via mpsc → socket
//!                   ├── reader_task  ← JSON lines from socket
//!                   │                     ├── reply (request_id) → oneshot
//!                   │                     └── event / property-change → MpvEvent
//!                   └── translate    → HandleCallbacks
//! ```
//!
//! `start` and `stop` never wait for mpv; they queue requests in call order.
//! The IPC endpoint is a Unix socket path, or `\\.\pipe\<name>` on Windows.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, trace, warn};

use preset_proto::config::MpvConfig;

use crate::error::{HandleError, MediaFault, MEDIA_ERROR_UNKNOWN};
use crate::media::{
    HandleCallbacks, HandleEvent, HandleEventKind, HandleId, MediaBackend, MediaHandle, MediaInfo,
};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_POLL: Duration = Duration::from_millis(100);
const CONNECT_ATTEMPTS: u32 = 50;

static REQUEST_IDS: AtomicU64 = AtomicU64::new(1);

// Property observation ids.
pub const OBS_CORE_IDLE: u64 = 1;
pub const OBS_PAUSED_FOR_CACHE: u64 = 2;
pub const OBS_CACHE_SPEED: u64 = 3;

const OBSERVED: [(u64, &str); 3] = [
    (OBS_CORE_IDLE, "core-idle"),
    (OBS_PAUSED_FOR_CACHE, "paused-for-cache"),
    (OBS_CACHE_SPEED, "cache-speed"),
];

type Reply = anyhow::Result<Value>;
type Waiters = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

/// One request on its way to the writer task.
struct Outgoing {
    id: u64,
    /// Newline-terminated JSON.
    line: String,
    reply: oneshot::Sender<Reply>,
}

impl Outgoing {
    fn new(command: Value) -> anyhow::Result<(Self, oneshot::Receiver<Reply>)> {
        let id = REQUEST_IDS.fetch_add(1, Ordering::Relaxed);
        let mut line = serde_json::to_string(&json!({ "command": command, "request_id": id }))?;
        line.push('\n');
        let (reply, rx) = oneshot::channel();
        Ok((Self { id, line, reply }, rx))
    }
}

/// Unsolicited mpv output: an event or an observed property change.
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// `(observation id, value)` for `property-change` events.
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.event_name()? != "property-change" {
            return None;
        }
        let id = self.raw.get("id")?.as_u64()?;
        Some((id, self.raw.get("data").unwrap_or(&Value::Null)))
    }

    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }
}

/// A decoded IPC line.
#[derive(Debug)]
enum Incoming {
    Reply { id: u64, result: Reply },
    Event(MpvEvent),
}

fn parse_incoming(line: &str) -> Option<Incoming> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            debug!("mpv: unparseable IPC line {:?}: {}", line, e);
            return None;
        }
    };
    let Some(id) = value.get("request_id").and_then(Value::as_u64) else {
        return Some(Incoming::Event(MpvEvent { raw: value }));
    };
    let result = match value.get("error").and_then(Value::as_str) {
        Some("success") => Ok(value),
        other => Err(anyhow::anyhow!(
            "mpv rejected request {}: {}",
            id,
            other.unwrap_or("no error field")
        )),
    };
    Some(Incoming::Reply { id, result })
}

async fn fail_waiters(waiters: &Waiters, reason: &str) {
    for (_, tx) in waiters.lock().await.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("{}", reason)));
    }
}

// ── IPC client ────────────────────────────────────────────────────────────────

/// Request side of one mpv connection.
#[derive(Clone)]
pub struct MpvIpc {
    tx: mpsc::Sender<Outgoing>,
}

impl MpvIpc {
    fn spawn<S>(stream: S, events: mpsc::Sender<MpvEvent>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let waiters: Waiters = Arc::default();
        let (tx, rx) = mpsc::channel::<Outgoing>(64);
        tokio::spawn(writer_task(write_half, rx, Arc::clone(&waiters)));
        tokio::spawn(reader_task(BufReader::new(read_half), waiters, events));
        Self { tx }
    }

    /// Send a command and await mpv's reply.
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let (out, rx) = Outgoing::new(command)?;
        let id = out.id;
        self.tx
            .send(out)
            .await
            .map_err(|_| anyhow::anyhow!("mpv connection closed"))?;
        match tokio::time::timeout(REPLY_TIMEOUT, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => anyhow::bail!("mpv request {} abandoned", id),
            Err(_) => anyhow::bail!("mpv request {} timed out", id),
        }
    }

    /// Queue a command; the reply is discarded.
    pub fn post(&self, command: Value) -> anyhow::Result<()> {
        let (out, _) = Outgoing::new(command)?;
        self.tx
            .try_send(out)
            .map_err(|e| anyhow::anyhow!("mpv request queue: {}", e))
    }

    pub async fn observe_properties(&self) {
        for (id, name) in OBSERVED {
            if let Err(e) = self.send(json!(["observe_property", id, name])).await {
                warn!("mpv: cannot observe {}: {}", name, e);
            }
        }
    }

    pub async fn load_stream(&self, url: &str, volume: f32) -> anyhow::Result<()> {
        let percent = (volume * 100.0).clamp(0.0, 100.0);
        if let Err(e) = self.send(json!(["set_property", "volume", percent])).await {
            debug!("mpv: volume not applied: {}", e);
        }
        self.send(json!(["loadfile", url])).await.map(|_| ())
    }
}

#[cfg(unix)]
async fn connect_ipc(endpoint: &str, events: mpsc::Sender<MpvEvent>) -> anyhow::Result<MpvIpc> {
    let path = std::path::Path::new(endpoint);
    for _ in 0..CONNECT_ATTEMPTS {
        tokio::time::sleep(CONNECT_POLL).await;
        if !path.exists() {
            continue;
        }
        // mpv creates the socket file before it listens on it.
        match UnixStream::connect(path).await {
            Ok(stream) => {
                info!("mpv: connected to {}", endpoint);
                return Ok(MpvIpc::spawn(stream, events));
            }
            Err(e) => trace!("mpv: {} not ready: {}", endpoint, e),
        }
    }
    anyhow::bail!("mpv IPC socket {} never accepted a connection", endpoint)
}

#[cfg(windows)]
async fn connect_ipc(endpoint: &str, events: mpsc::Sender<MpvEvent>) -> anyhow::Result<MpvIpc> {
    let pipe = format!(r"\\.\pipe\{}", endpoint);
    for _ in 0..CONNECT_ATTEMPTS {
        tokio::time::sleep(CONNECT_POLL).await;
        if let Ok(client) = ClientOptions::new().open(&pipe) {
            info!("mpv: connected to {}", pipe);
            return Ok(MpvIpc::spawn(client, events));
        }
    }
    anyhow::bail!("mpv named pipe {} never appeared", pipe)
}

async fn reader_task<R>(mut reader: BufReader<R>, waiters: Waiters, events: mpsc::Sender<MpvEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    let reason = loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break "mpv closed the IPC connection".to_string(),
            Ok(_) => match parse_incoming(&line) {
                Some(Incoming::Reply { id, result }) => {
                    // Posted requests have nobody waiting.
                    if let Some(tx) = waiters.lock().await.remove(&id) {
                        let _ = tx.send(result);
                    }
                }
                Some(Incoming::Event(event)) => {
                    trace!("mpv: event {}", event.raw);
                    if events.send(event).await.is_err() {
                        break "event receiver dropped".to_string();
                    }
                }
                None => {}
            },
            Err(e) => break format!("mpv IPC read failed: {}", e),
        }
    };
    debug!("mpv reader: {}", reason);
    fail_waiters(&waiters, &reason).await;
}

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<Outgoing>, waiters: Waiters)
where
    W: AsyncWrite + Unpin,
{
    while let Some(out) = rx.recv().await {
        // Registered first so the reply always finds its waiter.
        waiters.lock().await.insert(out.id, out.reply);
        trace!("mpv: -> {}", out.line.trim_end());
        if let Err(e) = writer.write_all(out.line.as_bytes()).await {
            warn!("mpv: IPC write failed: {}", e);
            fail_waiters(&waiters, "mpv IPC write failed").await;
            return;
        }
    }
}

// ── handle lifecycle ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Phase {
    Idle = 0,
    Preparing = 1,
    Prepared = 2,
    Started = 3,
    Stopped = 4,
    Released = 5,
}

impl Phase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Phase::Idle,
            1 => Phase::Preparing,
            2 => Phase::Prepared,
            3 => Phase::Started,
            4 => Phase::Stopped,
            _ => Phase::Released,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Preparing => "preparing",
            Phase::Prepared => "prepared",
            Phase::Started => "started",
            Phase::Stopped => "stopped",
            Phase::Released => "released",
        }
    }
}

/// State shared between the handle and its prepare task.
struct Shared {
    phase: AtomicU8,
    core_idle: AtomicBool,
    ipc: OnceLock<MpvIpc>,
    process: std::sync::Mutex<Option<tokio::process::Child>>,
}

impl Shared {
    fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    fn advance(&self, from: Phase, to: Phase) -> bool {
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Opens one mpv process per handle.
pub struct MpvBackend {
    config: MpvConfig,
    callbacks_tx: mpsc::UnboundedSender<HandleEvent>,
}

impl MpvBackend {
    pub fn new(config: MpvConfig, callbacks_tx: mpsc::UnboundedSender<HandleEvent>) -> Self {
        Self {
            config,
            callbacks_tx,
        }
    }
}

impl MediaBackend for MpvBackend {
    fn open(&mut self, id: HandleId, url: &str) -> Result<Box<dyn MediaHandle>, HandleError> {
        debug!("mpv: open handle {} for {}", id, url);
        let callbacks = HandleCallbacks::register(id, self.callbacks_tx.clone());
        Ok(Box::new(MpvMediaHandle::new(
            id,
            url,
            self.config.clone(),
            callbacks,
        )))
    }
}

pub struct MpvMediaHandle {
    id: HandleId,
    url: String,
    socket_name: String,
    config: MpvConfig,
    callbacks: HandleCallbacks,
    shared: Arc<Shared>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl MpvMediaHandle {
    fn new(id: HandleId, url: &str, config: MpvConfig, callbacks: HandleCallbacks) -> Self {
        Self {
            id,
            url: url.to_string(),
            socket_name: preset_proto::platform::mpv_socket_name(id.0),
            config,
            callbacks,
            shared: Arc::new(Shared {
                phase: AtomicU8::new(Phase::Idle as u8),
                core_idle: AtomicBool::new(true),
                ipc: OnceLock::new(),
                process: std::sync::Mutex::new(None),
            }),
            task: None,
        }
    }

    fn illegal(&self, op: &'static str) -> HandleError {
        HandleError::IllegalState {
            op,
            phase: self.shared.phase().name(),
        }
    }

    fn post(&self, command: Value) {
        match self.shared.ipc.get() {
            Some(ipc) => {
                if let Err(e) = ipc.post(command) {
                    warn!("mpv {}: {}", self.id, e);
                }
            }
            None => warn!("mpv {}: no IPC connection", self.id),
        }
    }
}

impl MediaHandle for MpvMediaHandle {
    fn id(&self) -> HandleId {
        self.id
    }

    fn prepare_async(&mut self) -> Result<(), HandleError> {
        if !self.shared.advance(Phase::Idle, Phase::Preparing) {
            return Err(self.illegal("prepare"));
        }
        let job = PrepareJob {
            id: self.id,
            url: self.url.clone(),
            socket_name: self.socket_name.clone(),
            config: self.config.clone(),
            callbacks: self.callbacks.clone(),
            shared: self.shared.clone(),
        };
        self.task = Some(tokio::spawn(job.run()));
        Ok(())
    }

    fn start(&mut self) -> Result<(), HandleError> {
        match self.shared.phase() {
            Phase::Prepared | Phase::Started => {
                self.post(json!(["set_property", "pause", false]));
                self.shared.set_phase(Phase::Started);
                Ok(())
            }
            _ => Err(self.illegal("start")),
        }
    }

    fn stop(&mut self) -> Result<(), HandleError> {
        match self.shared.phase() {
            Phase::Prepared | Phase::Started | Phase::Stopped => {
                self.post(json!(["stop"]));
                self.shared.set_phase(Phase::Stopped);
                Ok(())
            }
            _ => Err(self.illegal("stop")),
        }
    }

    fn is_playing(&self) -> Result<bool, HandleError> {
        Ok(self.shared.phase() == Phase::Started && !self.shared.core_idle.load(Ordering::Acquire))
    }

    fn release(mut self: Box<Self>) {
        self.callbacks.unregister();
        self.shared.set_phase(Phase::Released);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        match self.shared.process.lock() {
            Ok(mut guard) => {
                if let Some(mut child) = guard.take() {
                    if let Err(e) = child.start_kill() {
                        debug!("mpv {}: kill: {}", self.id, e);
                    }
                }
            }
            Err(_) => warn!("mpv {}: process lock poisoned", self.id),
        }
        #[cfg(unix)]
        {
            let _ = std::fs::remove_file(&self.socket_name);
        }
        debug!("mpv {}: released", self.id);
    }
}

// ── prepare task ──────────────────────────────────────────────────────────────

struct PrepareJob {
    id: HandleId,
    url: String,
    socket_name: String,
    config: MpvConfig,
    callbacks: HandleCallbacks,
    shared: Arc<Shared>,
}

impl PrepareJob {
    async fn run(self) {
        let (event_tx, mut event_rx) = mpsc::channel::<MpvEvent>(64);
        if let Err(e) = self.connect_and_load(event_tx).await {
            warn!("mpv {}: prepare failed: {}", self.id, e);
            self.callbacks.emit(HandleEventKind::Error(MediaFault::Io));
            return;
        }

        while let Some(evt) = event_rx.recv().await {
            if let Some(kind) = self.translate(&evt) {
                if !self.callbacks.emit(kind) {
                    break;
                }
            }
        }

        // Connection gone without an end-file: the process died.
        if self.callbacks.is_registered() {
            warn!("mpv {}: IPC connection lost", self.id);
            self.callbacks.emit(HandleEventKind::Error(MediaFault::Io));
        }
    }

    async fn connect_and_load(&self, event_tx: mpsc::Sender<MpvEvent>) -> anyhow::Result<()> {
        #[cfg(unix)]
        let _ = tokio::fs::remove_file(&self.socket_name).await;

        let mpv_binary = preset_proto::platform::find_mpv_binary(self.config.binary.as_deref())
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;

        info!("mpv {}: spawning process for {}", self.id, self.url);
        let child = tokio::process::Command::new(mpv_binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg("--pause=yes")
            .arg("--quiet")
            .arg(preset_proto::platform::mpv_socket_arg(&self.socket_name))
            .arg(format!("--network-timeout={}", self.config.network_timeout_secs))
            .arg(format!("--cache-secs={}", self.config.cache_secs))
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        {
            let mut guard = self
                .shared
                .process
                .lock()
                .map_err(|_| anyhow::anyhow!("process lock poisoned"))?;
            *guard = Some(child);
        }

        let ipc = connect_ipc(&self.socket_name, event_tx).await?;
        ipc.observe_properties().await;
        ipc.load_stream(&self.url, self.config.volume).await?;
        // Released while connecting: the handle never sees this connection.
        let _ = self.shared.ipc.set(ipc);
        Ok(())
    }

    fn translate(&self, evt: &MpvEvent) -> Option<HandleEventKind> {
        if let Some((obs_id, data)) = evt.as_property_change() {
            return match obs_id {
                OBS_CORE_IDLE => {
                    self.shared
                        .core_idle
                        .store(data.as_bool().unwrap_or(true), Ordering::Release);
                    None
                }
                OBS_PAUSED_FOR_CACHE => {
                    if matches!(self.shared.phase(), Phase::Preparing | Phase::Idle) {
                        return None;
                    }
                    match data.as_bool() {
                        Some(true) => Some(HandleEventKind::Info(MediaInfo::BufferingStart)),
                        Some(false) => Some(HandleEventKind::Info(MediaInfo::BufferingEnd)),
                        None => None,
                    }
                }
                // bytes/s → kbit/s
                OBS_CACHE_SPEED => data.as_f64().map(|bps| {
                    HandleEventKind::Info(MediaInfo::Bandwidth((bps * 8.0 / 1000.0) as u32))
                }),
                _ => None,
            };
        }

        match evt.event_name()? {
            "file-loaded" => {
                if self.shared.advance(Phase::Preparing, Phase::Prepared) {
                    Some(HandleEventKind::Prepared)
                } else {
                    None
                }
            }
            "end-file" => match evt.raw.get("reason").and_then(|r| r.as_str()) {
                Some("eof") => Some(HandleEventKind::Completed),
                Some("error") => {
                    let detail = evt
                        .raw
                        .get("file_error")
                        .and_then(|e| e.as_str())
                        .unwrap_or("");
                    Some(HandleEventKind::Error(classify_file_error(detail)))
                }
                other => {
                    debug!("mpv {}: end-file reason {:?}", self.id, other);
                    None
                }
            },
            _ => None,
        }
    }
}

/// Map mpv's `file_error` text onto a media fault.
pub fn classify_file_error(detail: &str) -> MediaFault {
    let detail = detail.to_ascii_lowercase();
    if detail.contains("timeout") || detail.contains("timed out") {
        MediaFault::TimedOut
    } else if detail.contains("loading failed") || detail.contains("network") {
        MediaFault::Io
    } else {
        MediaFault::Other {
            code: MEDIA_ERROR_UNKNOWN,
            extra: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (MpvMediaHandle, mpsc::UnboundedReceiver<HandleEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callbacks = HandleCallbacks::register(HandleId(1), tx);
        let h = MpvMediaHandle::new(
            HandleId(1),
            "http://example.invalid/stream",
            MpvConfig::default(),
            callbacks,
        );
        (h, rx)
    }

    fn job(h: &MpvMediaHandle) -> PrepareJob {
        PrepareJob {
            id: h.id,
            url: h.url.clone(),
            socket_name: h.socket_name.clone(),
            config: h.config.clone(),
            callbacks: h.callbacks.clone(),
            shared: h.shared.clone(),
        }
    }

    #[test]
    fn test_start_and_stop_before_prepare_are_illegal() {
        let (mut h, _rx) = handle();
        assert_eq!(
            h.start(),
            Err(HandleError::IllegalState {
                op: "start",
                phase: "idle"
            })
        );
        assert!(matches!(h.stop(), Err(HandleError::IllegalState { .. })));
        assert_eq!(h.is_playing(), Ok(false));
    }

    #[test]
    fn test_file_loaded_prepares_once() {
        let (h, _rx) = handle();
        h.shared.set_phase(Phase::Preparing);
        let job = job(&h);
        let loaded = MpvEvent {
            raw: json!({"event": "file-loaded"}),
        };
        assert_eq!(job.translate(&loaded), Some(HandleEventKind::Prepared));
        assert_eq!(job.translate(&loaded), None);
        assert_eq!(h.shared.phase(), Phase::Prepared);
    }

    #[test]
    fn test_end_file_translation() {
        let (h, _rx) = handle();
        let job = job(&h);
        let eof = MpvEvent {
            raw: json!({"event": "end-file", "reason": "eof"}),
        };
        let err = MpvEvent {
            raw: json!({"event": "end-file", "reason": "error", "file_error": "loading failed"}),
        };
        let stop = MpvEvent {
            raw: json!({"event": "end-file", "reason": "stop"}),
        };
        assert_eq!(job.translate(&eof), Some(HandleEventKind::Completed));
        assert_eq!(
            job.translate(&err),
            Some(HandleEventKind::Error(MediaFault::Io))
        );
        assert_eq!(job.translate(&stop), None);
    }

    #[test]
    fn test_buffering_only_after_prepare() {
        let (h, _rx) = handle();
        let job = job(&h);
        let stall = MpvEvent {
            raw: json!({"event": "property-change", "id": OBS_PAUSED_FOR_CACHE, "data": true}),
        };
        h.shared.set_phase(Phase::Preparing);
        assert_eq!(job.translate(&stall), None);
        h.shared.set_phase(Phase::Started);
        assert_eq!(
            job.translate(&stall),
            Some(HandleEventKind::Info(MediaInfo::BufferingStart))
        );
    }

    #[test]
    fn test_parse_incoming_splits_replies_and_events() {
        match parse_incoming("{\"request_id\":7,\"error\":\"success\",\"data\":null}\n") {
            Some(Incoming::Reply { id: 7, result }) => assert!(result.is_ok()),
            other => panic!("unexpected {:?}", other),
        }
        match parse_incoming(r#"{"request_id":8,"error":"property not found"}"#) {
            Some(Incoming::Reply { id: 8, result }) => assert!(result.is_err()),
            other => panic!("unexpected {:?}", other),
        }
        match parse_incoming(r#"{"event":"property-change","id":3,"data":16000.0}"#) {
            Some(Incoming::Event(evt)) => {
                let (id, data) = evt.as_property_change().unwrap();
                assert_eq!(id, OBS_CACHE_SPEED);
                assert_eq!(data.as_f64(), Some(16000.0));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(parse_incoming("  \n").is_none());
        assert!(parse_incoming("not json").is_none());
    }

    #[tokio::test]
    async fn test_send_matches_reply_by_request_id() {
        let (client, server) = tokio::io::duplex(4096);
        let (events_tx, mut events_rx) = mpsc::channel(4);
        let ipc = MpvIpc::spawn(client, events_tx);

        let fake_mpv = tokio::spawn(async move {
            let (read_half, mut write_half) = tokio::io::split(server);
            let mut lines = BufReader::new(read_half).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            let req: Value = serde_json::from_str(&line).unwrap();
            assert_eq!(req["command"], json!(["get_property", "volume"]));
            let id = req["request_id"].as_u64().unwrap();
            let out = format!(
                "{}\n{}\n",
                json!({"event": "file-loaded"}),
                json!({"request_id": id, "error": "success", "data": 80.0})
            );
            write_half.write_all(out.as_bytes()).await.unwrap();
        });

        let reply = ipc.send(json!(["get_property", "volume"])).await.unwrap();
        assert_eq!(reply["data"], json!(80.0));
        let evt = events_rx.recv().await.unwrap();
        assert_eq!(evt.event_name(), Some("file-loaded"));
        fake_mpv.await.unwrap();
    }

    #[test]
    fn test_classify_file_error() {
        assert_eq!(classify_file_error("Network timeout"), MediaFault::TimedOut);
        assert_eq!(classify_file_error("loading failed"), MediaFault::Io);
        assert_eq!(
            classify_file_error("unrecognized file format").to_string(),
            "1:0"
        );
    }
}
