use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent from a client to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    Play { preset: u32 },
    Next,
    Previous,
    Stop,
    Pause,
    Resume,
    /// Telephony bridge report.
    PhoneState { state: PhoneState },
    /// Audio route lost its headset; treated as an explicit stop request.
    HeadsetRemoved,
    /// Connectivity hint; the daemon re-reads the network itself.
    NetworkChanged,
    GetState,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Play { .. } => CommandKind::Play,
            Command::Next => CommandKind::Next,
            Command::Previous => CommandKind::Previous,
            Command::Stop => CommandKind::Stop,
            Command::Pause => CommandKind::Pause,
            Command::Resume => CommandKind::Resume,
            Command::PhoneState { .. } => CommandKind::PhoneState,
            Command::HeadsetRemoved => CommandKind::HeadsetRemoved,
            Command::NetworkChanged => CommandKind::NetworkChanged,
            Command::GetState => CommandKind::GetState,
        }
    }

    /// Whether a restarted daemon should re-issue this command.
    pub fn disposition(&self) -> Disposition {
        match self {
            Command::Play { .. } => Disposition::Redeliver,
            _ => Disposition::NotSticky,
        }
    }
}

/// Closed set of action names accepted on string-typed surfaces (HTTP routes,
/// command line).  Anything else is rejected before it reaches the daemon core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandKind {
    Play,
    Next,
    Previous,
    Stop,
    Pause,
    Resume,
    PhoneState,
    HeadsetRemoved,
    NetworkChanged,
    GetState,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Play => "play",
            CommandKind::Next => "next",
            CommandKind::Previous => "previous",
            CommandKind::Stop => "stop",
            CommandKind::Pause => "pause",
            CommandKind::Resume => "resume",
            CommandKind::PhoneState => "phone-state",
            CommandKind::HeadsetRemoved => "headset-removed",
            CommandKind::NetworkChanged => "network-changed",
            CommandKind::GetState => "get-state",
        }
    }

    /// Build the command for kinds that carry no payload.
    pub fn without_payload(self) -> Option<Command> {
        match self {
            CommandKind::Next => Some(Command::Next),
            CommandKind::Previous => Some(Command::Previous),
            CommandKind::Stop => Some(Command::Stop),
            CommandKind::Pause => Some(Command::Pause),
            CommandKind::Resume => Some(Command::Resume),
            CommandKind::HeadsetRemoved => Some(Command::HeadsetRemoved),
            CommandKind::NetworkChanged => Some(Command::NetworkChanged),
            CommandKind::GetState => Some(Command::GetState),
            CommandKind::Play | CommandKind::PhoneState => None,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "play" => Ok(CommandKind::Play),
            "next" => Ok(CommandKind::Next),
            "previous" | "prev" => Ok(CommandKind::Previous),
            "stop" => Ok(CommandKind::Stop),
            "pause" => Ok(CommandKind::Pause),
            "resume" => Ok(CommandKind::Resume),
            "phone-state" => Ok(CommandKind::PhoneState),
            "headset-removed" => Ok(CommandKind::HeadsetRemoved),
            "network-changed" => Ok(CommandKind::NetworkChanged),
            "get-state" | "state" => Ok(CommandKind::GetState),
            _ => Err(UnknownVariant(s.to_string())),
        }
    }
}

/// Returned when a string names no known variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown variant '{}'", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

/// What the daemon should do with a command if it is restarted before the
/// command's effect is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Disposition {
    /// Do not restart automatically.
    NotSticky,
    /// Re-issue the command after a restart.
    Redeliver,
}

/// Messages sent from daemon to clients (broadcasts).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: daemon version + full state snapshot.
    Hello {
        protocol_version: u32,
        daemon_rev: u64,
        state: SessionSnapshot,
    },
    State {
        data: SessionSnapshot,
    },
    /// One-shot, short-lived status message.
    Toast {
        message: String,
        #[serde(default)]
        long: bool,
    },
    Log {
        message: String,
    },
    Error {
        message: String,
    },
}

/// Playback session state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Uninitialized,
    Initializing,
    Preparing,
    Playing,
    Buffering,
    Paused,
    Phone,
    Error,
    Restarting,
    Stopping,
    Stopped,
    Complete,
    End,
}

impl PlaybackState {
    /// States in which the session must be kept alive even with no client
    /// attached.
    pub fn is_playing(&self) -> bool {
        matches!(
            self,
            PlaybackState::Buffering
                | PlaybackState::Playing
                | PlaybackState::Paused
                | PlaybackState::Phone
                | PlaybackState::Preparing
                | PlaybackState::Initializing
                | PlaybackState::Complete
                | PlaybackState::Restarting
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            PlaybackState::Uninitialized => "Uninitialized",
            PlaybackState::Initializing => "Initializing",
            PlaybackState::Preparing => "Preparing",
            PlaybackState::Playing => "Playing",
            PlaybackState::Buffering => "Buffering",
            PlaybackState::Paused => "Paused",
            PlaybackState::Phone => "Phone",
            PlaybackState::Error => "Error",
            PlaybackState::Restarting => "Restarting",
            PlaybackState::Stopping => "Stopping",
            PlaybackState::Stopped => "Stopped",
            PlaybackState::Complete => "Complete",
            PlaybackState::End => "Ended",
        }
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Classification of the active network path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NetworkKind {
    Wifi,
    Mobile,
    Ethernet,
    Bluetooth,
    Other,
}

impl fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkKind::Wifi => "wifi",
            NetworkKind::Mobile => "mobile",
            NetworkKind::Ethernet => "ethernet",
            NetworkKind::Bluetooth => "bluetooth",
            NetworkKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// Last observed connectivity.  `Disconnected` doubles as the "no network
/// seen yet" sentinel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Connectivity {
    #[default]
    Disconnected,
    Connected(NetworkKind),
}

impl Connectivity {
    pub fn is_connected(&self) -> bool {
        matches!(self, Connectivity::Connected(_))
    }
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Connectivity::Disconnected => f.write_str("disconnected"),
            Connectivity::Connected(kind) => kind.fmt(f),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PhoneState {
    Idle,
    Ringing,
    Offhook,
}

impl FromStr for PhoneState {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "idle" => Ok(PhoneState::Idle),
            "ringing" => Ok(PhoneState::Ringing),
            "offhook" | "off-hook" => Ok(PhoneState::Offhook),
            _ => Err(UnknownVariant(s.to_string())),
        }
    }
}

/// The persistent, notification-style status line shown for the session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Presentation {
    pub title: String,
    pub status: String,
    /// Label of the stop action ("Stop" while playing, "Cancel" otherwise).
    pub stop_label: String,
    /// Whether the status should also scroll by as a ticker.
    #[serde(default)]
    pub ticker: bool,
    /// Whether the session is shown as a foreground service.
    #[serde(default)]
    pub foreground: bool,
    /// Transport actions offered alongside the status.
    #[serde(default = "transport_actions")]
    pub actions: Vec<CommandKind>,
}

pub fn transport_actions() -> Vec<CommandKind> {
    vec![CommandKind::Previous, CommandKind::Stop, CommandKind::Next]
}

/// One populated preset slot as shown to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresetEntry {
    pub preset: u32,
    pub title: String,
    pub url: String,
}

/// Snapshot of the playback session.  `rev` is a monotonically increasing
/// counter incremented every time the snapshot is republished.  Clients can
/// use it to detect missed updates.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionSnapshot {
    #[serde(default)]
    pub rev: u64,
    pub state: PlaybackState,
    /// 0 means no preset selected.
    pub current_preset: u32,
    pub current_title: Option<String>,
    pub current_url: Option<String>,
    pub interrupted: bool,
    pub network: Connectivity,
    pub bound_clients: usize,
    pub presentation: Option<Presentation>,
    #[serde(default)]
    pub presets: Vec<PresetEntry>,
    #[serde(default)]
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

/// Largest frame body either side accepts.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Outcome of trying to pull one frame off the front of a read buffer.
#[derive(Debug)]
pub enum Frame {
    /// Not enough bytes buffered yet.
    Incomplete,
    /// A whole frame was consumed and decoded.
    Message(Message, usize),
    /// A whole frame was consumed but its body did not decode.
    Malformed(usize, String),
    /// The header announces a body above `MAX_FRAME_LEN`.  The stream cannot
    /// be resynchronised; the peer should be dropped.
    Oversized(usize),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        if json.len() > MAX_FRAME_LEN {
            anyhow::bail!("message of {} bytes exceeds frame limit", json.len());
        }
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        match Self::next_frame(data) {
            Frame::Incomplete => anyhow::bail!("Insufficient data for message"),
            Frame::Message(msg, consumed) => Ok((msg, consumed)),
            Frame::Malformed(_, err) => anyhow::bail!("Malformed message: {}", err),
            Frame::Oversized(len) => anyhow::bail!("Frame of {} bytes exceeds limit", len),
        }
    }

    /// Like `decode`, but tells a short buffer apart from a bad frame so the
    /// caller can skip the bad frame and keep reading.
    pub fn next_frame(data: &[u8]) -> Frame {
        if data.len() < 4 {
            return Frame::Incomplete;
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Frame::Oversized(len);
        }
        if data.len() < 4 + len {
            return Frame::Incomplete;
        }
        match serde_json::from_slice::<Self>(&data[4..4 + len]) {
            Ok(msg) => Frame::Message(msg, 4 + len),
            Err(e) => Frame::Malformed(4 + len, e.to_string()),
        }
    }
}
