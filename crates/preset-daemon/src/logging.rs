//! Log sink setup: a plain-text file under the data dir plus a layer that
//! forwards warnings and errors to attached clients.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::BroadcastMessage;

const DEFAULT_FILTER: &str = "info,preset_daemon=debug";

/// Install the global subscriber.  Returns the log file path.
pub fn init(
    data_dir: &Path,
    clients: broadcast::Sender<BroadcastMessage>,
) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(data_dir)?;
    let log_path = data_dir.join("daemon.log");
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(log_file)
                .with_ansi(false),
        )
        .with(ClientLogLayer { clients })
        .with(filter)
        .init();

    Ok(log_path)
}

/// Forwards WARN and ERROR records as `BroadcastMessage::Log`.
struct ClientLogLayer {
    clients: broadcast::Sender<BroadcastMessage>,
}

impl<S: Subscriber> Layer<S> for ClientLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::WARN {
            return;
        }
        // Nobody attached.
        if self.clients.receiver_count() == 0 {
            return;
        }
        let line = render(level, event);
        let _ = self.clients.send(BroadcastMessage::Log(line));
    }
}

fn render(level: Level, event: &Event<'_>) -> String {
    let mut fields = FieldCollector::default();
    event.record(&mut fields);
    let mut line = format!(
        "{} {:<5} {}",
        chrono::Local::now().format("%H:%M:%S"),
        level,
        fields.message
    );
    if !fields.rest.is_empty() {
        let _ = write!(line, " ({})", fields.rest.join(", "));
    }
    line
}

#[derive(Default)]
struct FieldCollector {
    message: String,
    rest: Vec<String>,
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.rest.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            self.rest.push(format!("{}={:?}", field.name(), value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warnings_reach_clients_with_fields() {
        let (tx, mut rx) = broadcast::channel(8);
        let subscriber = tracing_subscriber::registry().with(ClientLogLayer { clients: tx });

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("not forwarded");
            tracing::warn!(preset = 3, "stream stalled");
        });

        match rx.try_recv().unwrap() {
            BroadcastMessage::Log(line) => {
                assert!(line.contains("WARN"));
                assert!(line.ends_with("stream stalled (preset=3)"), "{}", line);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }
}
