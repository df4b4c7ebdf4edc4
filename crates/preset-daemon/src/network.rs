//! Connectivity detection and the network-change signal source.
//!
//! The controller re-reads connectivity through `NetworkMonitor::current`
//! on every notification; the watcher task only decides *when* to notify.

use std::path::PathBuf;
use std::time::Duration;

use preset_proto::protocol::{Connectivity, NetworkKind};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::core::DaemonEvent;

pub trait NetworkMonitor: Send {
    fn current(&self) -> Connectivity;
}

/// Reads the default route and classifies its interface from sysfs.
#[derive(Debug, Clone)]
pub struct SystemNetworkMonitor {
    root: PathBuf,
}

impl Default for SystemNetworkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemNetworkMonitor {
    pub fn new() -> Self {
        Self::with_root("/")
    }

    /// Read `proc/` and `sys/` below `root` instead of `/`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Interface carrying the default route, if any route is up.
    fn default_route_interface(&self) -> Option<String> {
        let table = std::fs::read_to_string(self.root.join("proc/net/route")).ok()?;
        table.lines().skip(1).find_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }
            let flags = u32::from_str_radix(fields[3], 16).ok()?;
            // RTF_UP
            if fields[1] == "00000000" && flags & 0x1 != 0 {
                Some(fields[0].to_string())
            } else {
                None
            }
        })
    }

    fn classify(&self, iface: &str) -> NetworkKind {
        let class_dir = self.root.join("sys/class/net").join(iface);
        if class_dir.join("wireless").exists() || class_dir.join("phy80211").exists() {
            return NetworkKind::Wifi;
        }
        if ["wwan", "ppp", "rmnet", "ccmni"]
            .iter()
            .any(|p| iface.starts_with(p))
        {
            return NetworkKind::Mobile;
        }
        if iface.starts_with("bnep") {
            return NetworkKind::Bluetooth;
        }
        if iface.starts_with("eth") || iface.starts_with("en") {
            return NetworkKind::Ethernet;
        }
        NetworkKind::Other
    }

    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    fn read_route(&self) -> Connectivity {
        match self.default_route_interface() {
            Some(iface) => {
                let kind = self.classify(&iface);
                debug!("network: default route via {} ({})", iface, kind);
                Connectivity::Connected(kind)
            }
            None => Connectivity::Disconnected,
        }
    }
}

impl NetworkMonitor for SystemNetworkMonitor {
    #[cfg(target_os = "linux")]
    fn current(&self) -> Connectivity {
        self.read_route()
    }

    // No portable route table; assume the host is online.
    #[cfg(not(target_os = "linux"))]
    fn current(&self) -> Connectivity {
        Connectivity::Connected(NetworkKind::Other)
    }
}

/// Poll `monitor` and enqueue `NetworkChanged` whenever the observation
/// differs from the previous poll.
pub fn spawn_watcher<M>(
    monitor: M,
    interval: Duration,
    event_tx: mpsc::Sender<DaemonEvent>,
) -> tokio::task::JoinHandle<()>
where
    M: NetworkMonitor + 'static,
{
    tokio::spawn(async move {
        let mut last = monitor.current();
        info!("network watcher: initial connectivity {}", last);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let now = monitor.current();
            if now == last {
                continue;
            }
            info!("network watcher: {} → {}", last, now);
            last = now;
            if event_tx.send(DaemonEvent::NetworkChanged).await.is_err() {
                debug!("network watcher: core gone, exiting");
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTE_HEADER: &str =
        "Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT\n";

    fn fake_root(route_rows: &str, wireless: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("proc/net")).unwrap();
        std::fs::write(
            dir.path().join("proc/net/route"),
            format!("{}{}", ROUTE_HEADER, route_rows),
        )
        .unwrap();
        for iface in wireless {
            std::fs::create_dir_all(dir.path().join("sys/class/net").join(iface).join("wireless"))
                .unwrap();
        }
        dir
    }

    #[test]
    fn test_wireless_default_route_is_wifi() {
        let root = fake_root(
            "wlan0\t00000000\t0102A8C0\t0003\t0\t0\t600\t00000000\t0\t0\t0\n",
            &["wlan0"],
        );
        let monitor = SystemNetworkMonitor::with_root(root.path());
        assert_eq!(monitor.read_route(), Connectivity::Connected(NetworkKind::Wifi));
    }

    #[test]
    fn test_mobile_and_ethernet_by_name() {
        let root = fake_root(
            "wwan0\t00000000\t0102A8C0\t0003\t0\t0\t600\t00000000\t0\t0\t0\n",
            &[],
        );
        let monitor = SystemNetworkMonitor::with_root(root.path());
        assert_eq!(monitor.read_route(), Connectivity::Connected(NetworkKind::Mobile));
        assert_eq!(monitor.classify("enp3s0"), NetworkKind::Ethernet);
        assert_eq!(monitor.classify("bnep0"), NetworkKind::Bluetooth);
    }

    #[test]
    fn test_no_default_route_is_disconnected() {
        // Only a link-local route, and a default route that is down.
        let root = fake_root(
            "eth0\t0000FEA9\t00000000\t0001\t0\t0\t1000\t0000FFFF\t0\t0\t0\n\
             eth0\t00000000\t0102A8C0\t0002\t0\t0\t100\t00000000\t0\t0\t0\n",
            &[],
        );
        let monitor = SystemNetworkMonitor::with_root(root.path());
        assert_eq!(monitor.read_route(), Connectivity::Disconnected);
    }

    #[test]
    fn test_missing_route_table_is_disconnected() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = SystemNetworkMonitor::with_root(dir.path());
        assert_eq!(monitor.read_route(), Connectivity::Disconnected);
    }
}
