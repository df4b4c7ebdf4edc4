use crate::protocol::{PresetEntry, SessionSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

/// What survives a daemon restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistentState {
    /// Preset selected when the daemon last ran (0 = none).
    #[serde(default)]
    pub last_preset: u32,
    /// PLAY command whose effect was still live when the daemon went away.
    #[serde(default)]
    pub redeliver_preset: Option<u32>,
}

/// Holds the last published session snapshot for readers (socket server,
/// HTTP API) and persists the small amount of state kept across restarts.
///
/// Only the daemon core writes; everyone else reads.
pub struct StateManager {
    state: Arc<RwLock<SessionSnapshot>>,
    persistent: RwLock<PersistentState>,
    state_file: PathBuf,
}

impl StateManager {
    pub fn new(state_file: PathBuf, presets: Vec<PresetEntry>) -> Self {
        let persistent = Self::load_persistent(&state_file);

        let state = SessionSnapshot {
            rev: 1,
            current_preset: 0,
            presets,
            ..Default::default()
        };

        Self {
            state: Arc::new(RwLock::new(state)),
            persistent: RwLock::new(persistent),
            state_file,
        }
    }

    pub async fn get_state(&self) -> SessionSnapshot {
        self.state.read().await.clone()
    }

    pub async fn persistent(&self) -> PersistentState {
        self.persistent.read().await.clone()
    }

    /// Replace the published snapshot.  The revision always moves forward and
    /// the preset list is kept when the incoming snapshot carries none.
    pub async fn publish(&self, mut snapshot: SessionSnapshot) -> u64 {
        let mut state = self.state.write().await;
        snapshot.rev = state.rev + 1;
        snapshot.updated_at = Some(chrono::Utc::now());
        if snapshot.presets.is_empty() {
            snapshot.presets = std::mem::take(&mut state.presets);
        }
        *state = snapshot;
        state.rev
    }

    /// Remember the selected preset; written only when it changes.
    pub async fn remember_preset(&self, preset: u32) -> anyhow::Result<()> {
        {
            let mut persistent = self.persistent.write().await;
            if persistent.last_preset == preset {
                return Ok(());
            }
            persistent.last_preset = preset;
        }
        self.save().await
    }

    pub async fn set_redeliver(&self, preset: Option<u32>) -> anyhow::Result<()> {
        {
            let mut persistent = self.persistent.write().await;
            if persistent.redeliver_preset == preset {
                return Ok(());
            }
            persistent.redeliver_preset = preset;
        }
        self.save().await
    }

    async fn save(&self) -> anyhow::Result<()> {
        let persistent = self.persistent.read().await.clone();

        if let Some(parent) = self.state_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(&persistent)?;
        tokio::fs::write(&self.state_file, json).await?;
        Ok(())
    }

    fn load_persistent(state_file: &Path) -> PersistentState {
        if let Ok(content) = std::fs::read_to_string(state_file) {
            match serde_json::from_str::<PersistentState>(&content) {
                Ok(persistent) => return persistent,
                Err(e) => warn!("Ignoring unreadable state file {:?}: {}", state_file, e),
            }
        }
        PersistentState::default()
    }
}

// ── m3u station loader ────────────────────────────────────────────────────────

/// Parse an m3u list.  Entries become presets 1..N in list order.
pub fn parse_m3u_from_str(content: &str) -> anyhow::Result<Vec<PresetEntry>> {
    let mut presets = Vec::new();
    let mut pending_name: Option<String> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            if let Some(comma_idx) = rest.find(',') {
                pending_name = Some(rest[comma_idx + 1..].trim().to_string());
            }
            continue;
        }

        if line.starts_with('#') {
            continue;
        }

        let url = line.to_string();
        let title = pending_name.take().unwrap_or_else(|| url.clone());

        presets.push(PresetEntry {
            preset: presets.len() as u32 + 1,
            title,
            url,
        });
    }

    Ok(presets)
}

pub fn load_presets_from_m3u(path: &Path) -> anyhow::Result<Vec<PresetEntry>> {
    let content = std::fs::read_to_string(path)?;
    parse_m3u_from_str(&content)
}

// ── TOML preset loader ────────────────────────────────────────────────────────

/// Intermediate struct that matches the TOML `[[station]]` table.
/// Kept apart from `PresetEntry` so the file schema can diverge from the wire
/// struct without breaking either.
#[derive(Debug, Deserialize)]
struct TomlStationFile {
    #[serde(default)]
    station: Vec<TomlStation>,
}

#[derive(Debug, Deserialize)]
struct TomlStation {
    #[serde(default)]
    preset: Option<u32>,
    #[serde(alias = "name")]
    title: String,
    url: String,
}

pub fn load_presets_from_toml(path: &Path) -> anyhow::Result<Vec<PresetEntry>> {
    let content = std::fs::read_to_string(path)?;
    parse_presets_from_toml_str(&content)
}

/// Parse a preset file.  Stations without an explicit `preset` number are
/// numbered after the highest explicit one, in file order.  A repeated preset
/// number keeps the later station.
pub fn parse_presets_from_toml_str(content: &str) -> anyhow::Result<Vec<PresetEntry>> {
    let file: TomlStationFile = toml::from_str(content)?;

    let mut next_free = file
        .station
        .iter()
        .filter_map(|s| s.preset)
        .max()
        .unwrap_or(0);

    let mut slots: BTreeMap<u32, PresetEntry> = BTreeMap::new();
    for s in file.station {
        let preset = match s.preset {
            Some(0) => {
                warn!("Station '{}' uses reserved preset 0, renumbering", s.title);
                next_free += 1;
                next_free
            }
            Some(n) => n,
            None => {
                next_free += 1;
                next_free
            }
        };
        let entry = PresetEntry {
            preset,
            title: s.title,
            url: s.url,
        };
        if let Some(old) = slots.insert(preset, entry) {
            warn!("Preset {} defined twice, dropping '{}'", preset, old.title);
        }
    }

    Ok(slots.into_values().collect())
}
