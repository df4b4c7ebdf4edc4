use std::collections::BTreeMap;
use std::path::PathBuf;

use preset_proto::config::Config;
use preset_proto::protocol::PresetEntry;
use preset_proto::state::{load_presets_from_m3u, load_presets_from_toml, parse_m3u_from_str};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Station {
    pub title: String,
    pub url: String,
}

/// Preset number → station.  Queries are ordered by ascending preset number.
pub trait StationStore: Send {
    fn lookup(&self, preset: u32) -> Option<Station>;

    /// Highest populated preset, 0 when empty.
    fn max_preset(&self) -> u32;

    /// Nearest populated preset `>= preset`.
    fn first_at_or_after(&self, preset: u32) -> Option<u32>;

    /// Nearest populated preset `<= preset`.
    fn last_at_or_before(&self, preset: u32) -> Option<u32>;

    fn lowest(&self) -> Option<u32> {
        self.first_at_or_after(1)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PresetStore {
    slots: BTreeMap<u32, Station>,
}

impl PresetStore {
    pub fn from_entries(entries: Vec<PresetEntry>) -> Self {
        let mut slots = BTreeMap::new();
        for e in entries {
            if e.preset == 0 {
                warn!("Skipping '{}': preset 0 is reserved", e.title);
                continue;
            }
            let station = Station {
                title: e.title,
                url: e.url,
            };
            if let Some(old) = slots.insert(e.preset, station) {
                warn!("Preset {} defined twice, dropping '{}'", e.preset, old.title);
            }
        }
        Self { slots }
    }

    pub fn entries(&self) -> Vec<PresetEntry> {
        self.slots
            .iter()
            .map(|(preset, s)| PresetEntry {
                preset: *preset,
                title: s.title.clone(),
                url: s.url.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl StationStore for PresetStore {
    fn lookup(&self, preset: u32) -> Option<Station> {
        self.slots.get(&preset).cloned()
    }

    fn max_preset(&self) -> u32 {
        self.slots.keys().next_back().copied().unwrap_or(0)
    }

    fn first_at_or_after(&self, preset: u32) -> Option<u32> {
        self.slots.range(preset..).next().map(|(k, _)| *k)
    }

    fn last_at_or_before(&self, preset: u32) -> Option<u32> {
        self.slots.range(..=preset).next_back().map(|(k, _)| *k)
    }
}

// ── preset loader ─────────────────────────────────────────────────────────────

/// Load presets from the configured TOML file, falling back to the m3u
/// source.  An absent or unreadable source yields an empty list.
pub async fn load_presets(config: &Config) -> Vec<PresetEntry> {
    let toml_path = &config.stations.stations_toml;
    if toml_path.exists() {
        match load_presets_from_toml(toml_path) {
            Ok(p) => {
                info!("Loaded {} presets from TOML: {}", p.len(), toml_path.display());
                return p;
            }
            Err(e) => warn!("Failed to parse TOML presets: {}", e),
        }
    }

    let local_toml = PathBuf::from("stations.toml");
    if local_toml.exists() {
        match load_presets_from_toml(&local_toml) {
            Ok(p) => {
                info!("Loaded {} presets from local stations.toml", p.len());
                return p;
            }
            Err(e) => warn!("Failed to parse local stations.toml: {}", e),
        }
    }

    if let Some(source) = &config.stations.m3u_url {
        info!("Loading presets from m3u: {}", source);
        if source.starts_with("http://") || source.starts_with("https://") {
            match fetch_m3u_url(source).await {
                Ok(p) => {
                    info!("Loaded {} presets from URL", p.len());
                    return p;
                }
                Err(e) => warn!("Failed to fetch presets from URL: {}", e),
            }
        } else {
            match load_presets_from_m3u(&PathBuf::from(source)) {
                Ok(p) => {
                    info!("Loaded {} presets from m3u file", p.len());
                    return p;
                }
                Err(e) => warn!("Failed to read m3u file: {}", e),
            }
        }
    }

    info!("No preset source available, starting with an empty store");
    Vec::new()
}

async fn fetch_m3u_url(url: &str) -> anyhow::Result<Vec<PresetEntry>> {
    let response = reqwest::get(url).await?;
    if !response.status().is_success() {
        anyhow::bail!("HTTP {}", response.status());
    }
    let text = response.text().await?;
    parse_m3u_from_str(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(preset: u32, title: &str) -> PresetEntry {
        PresetEntry {
            preset,
            title: title.to_string(),
            url: format!("http://{}", title.to_lowercase()),
        }
    }

    #[test]
    fn test_cursor_queries() {
        let store = PresetStore::from_entries(vec![entry(3, "B"), entry(1, "A"), entry(7, "C")]);
        assert_eq!(store.max_preset(), 7);
        assert_eq!(store.lowest(), Some(1));
        assert_eq!(store.first_at_or_after(2), Some(3));
        assert_eq!(store.first_at_or_after(8), None);
        assert_eq!(store.last_at_or_before(6), Some(3));
        assert_eq!(store.last_at_or_before(0), None);
        assert_eq!(store.lookup(3).map(|s| s.title), Some("B".to_string()));
        assert_eq!(store.lookup(2), None);
    }

    #[test]
    fn test_empty_store() {
        let store = PresetStore::default();
        assert!(store.is_empty());
        assert_eq!(store.max_preset(), 0);
        assert_eq!(store.lowest(), None);
    }

    #[test]
    fn test_reserved_preset_zero_is_skipped() {
        let store = PresetStore::from_entries(vec![entry(0, "Zero"), entry(2, "Two")]);
        assert_eq!(store.len(), 1);
        assert_eq!(store.entries()[0].preset, 2);
    }

    #[tokio::test]
    async fn test_load_presets_from_configured_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stations.toml");
        std::fs::write(
            &path,
            "[[station]]\npreset = 2\ntitle = \"Two\"\nurl = \"http://two\"\n",
        )
        .unwrap();
        let mut config = Config::default();
        config.stations.stations_toml = path;
        let presets = load_presets(&config).await;
        assert_eq!(presets.len(), 1);
        assert_eq!(presets[0].preset, 2);
    }
}
