mod connection;

use std::time::Duration;

use clap::{Parser, Subcommand};
use preset_proto::protocol::{
    Broadcast, Command, Message, PhoneState, SessionSnapshot, PROTOCOL_VERSION,
};
use tracing::{debug, warn};

use crate::connection::DaemonConnection;

/// How long a one-shot command waits for the daemon's state update.
const REPLY_WAIT: Duration = Duration::from_secs(3);

#[derive(Parser)]
#[command(name = "presetctl")]
#[command(about = "Control the radio preset daemon", long_about = None)]
struct Cli {
    /// Daemon address (host:port)
    #[arg(short, long, default_value_t = preset_proto::platform::daemon_address())]
    address: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play a preset
    Play { preset: u32 },
    /// Next populated preset
    Next,
    /// Previous populated preset
    Prev,
    /// Stop playback
    Stop,
    Pause,
    Resume,
    /// Report a phone state change (ringing, idle, offhook)
    Phone { state: PhoneState },
    /// Report that the headset was unplugged
    HeadsetRemoved,
    /// Print the current session
    Status {
        /// Print the raw snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Stay attached and print every update
    Watch,
}

impl Commands {
    fn to_command(&self) -> Option<Command> {
        Some(match self {
            Commands::Play { preset } => Command::Play { preset: *preset },
            Commands::Next => Command::Next,
            Commands::Prev => Command::Previous,
            Commands::Stop => Command::Stop,
            Commands::Pause => Command::Pause,
            Commands::Resume => Command::Resume,
            Commands::Phone { state } => Command::PhoneState { state: *state },
            Commands::HeadsetRemoved => Command::HeadsetRemoved,
            Commands::Status { .. } | Commands::Watch => return None,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let mut conn = DaemonConnection::connect(&cli.address).await?;

    let hello = match conn.next_message().await? {
        Some(Message::Broadcast(Broadcast::Hello {
            protocol_version,
            state,
            ..
        })) => {
            if protocol_version != PROTOCOL_VERSION {
                warn!(
                    "daemon speaks protocol {}, this client {}",
                    protocol_version, PROTOCOL_VERSION
                );
            }
            state
        }
        Some(other) => anyhow::bail!("expected hello from daemon, got {:?}", other),
        None => anyhow::bail!("daemon closed the connection"),
    };

    match &cli.command {
        Commands::Status { json } => {
            if *json {
                println!("{}", serde_json::to_string_pretty(&hello)?);
            } else {
                print_status(&hello);
            }
        }
        Commands::Watch => {
            println!("{}", describe(&hello));
            watch(&mut conn).await?;
        }
        cmd => {
            if let Some(command) = cmd.to_command() {
                conn.send_command(command).await?;
                await_reply(&mut conn, hello.rev).await?;
            }
        }
    }
    Ok(())
}

/// Wait for the first state newer than `seen_rev`, surfacing any error the
/// daemon reports first.
async fn await_reply(conn: &mut DaemonConnection, seen_rev: u64) -> anyhow::Result<()> {
    let wait = async {
        while let Some(msg) = conn.next_message().await? {
            match msg {
                Message::Broadcast(Broadcast::Error { message }) => anyhow::bail!(message),
                Message::Broadcast(Broadcast::Toast { message, .. }) => println!("{}", message),
                Message::Broadcast(Broadcast::State { data }) if data.rev > seen_rev => {
                    println!("{}", describe(&data));
                    return Ok(());
                }
                other => debug!("ignoring {:?}", other),
            }
        }
        Ok(())
    };
    match tokio::time::timeout(REPLY_WAIT, wait).await {
        Ok(result) => result,
        Err(_) => {
            warn!("no state update from daemon within {:?}", REPLY_WAIT);
            Ok(())
        }
    }
}

async fn watch(conn: &mut DaemonConnection) -> anyhow::Result<()> {
    while let Some(msg) = conn.next_message().await? {
        match msg {
            Message::Broadcast(Broadcast::State { data }) => println!("{}", describe(&data)),
            Message::Broadcast(Broadcast::Toast { message, .. }) => println!("  {}", message),
            Message::Broadcast(Broadcast::Log { message }) => eprintln!("{}", message),
            Message::Broadcast(Broadcast::Error { message }) => eprintln!("error: {}", message),
            other => debug!("ignoring {:?}", other),
        }
    }
    Ok(())
}

fn describe(snapshot: &SessionSnapshot) -> String {
    let mut line = format!("[{}]", snapshot.state);
    if let Some(p) = &snapshot.presentation {
        line.push_str(&format!(" {}: {}", p.title, p.status));
    }
    if snapshot.interrupted {
        line.push_str(" (interrupted)");
    }
    line
}

fn print_status(snapshot: &SessionSnapshot) {
    println!("{}", describe(snapshot));
    println!("network: {}", snapshot.network);
    println!("clients: {}", snapshot.bound_clients);
    for entry in &snapshot.presets {
        let marker = if entry.preset == snapshot.current_preset {
            '*'
        } else {
            ' '
        };
        println!("{} {:>3}. {}", marker, entry.preset, entry.title);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use preset_proto::protocol::{PlaybackState, Presentation};

    #[test]
    fn test_cli_maps_to_commands() {
        let cli = Cli::try_parse_from(["presetctl", "play", "4"]).unwrap();
        assert_eq!(cli.command.to_command(), Some(Command::Play { preset: 4 }));

        let cli = Cli::try_parse_from(["presetctl", "phone", "ringing"]).unwrap();
        assert_eq!(
            cli.command.to_command(),
            Some(Command::PhoneState {
                state: PhoneState::Ringing
            })
        );

        let cli = Cli::try_parse_from(["presetctl", "status"]).unwrap();
        assert_eq!(cli.command.to_command(), None);
        assert!(Cli::try_parse_from(["presetctl", "phone", "busy"]).is_err());
    }

    #[test]
    fn test_describe_snapshot() {
        let snapshot = SessionSnapshot {
            state: PlaybackState::Playing,
            interrupted: true,
            presentation: Some(Presentation {
                title: "2. Jazz".to_string(),
                status: "Playing".to_string(),
                stop_label: "Stop".to_string(),
                ticker: true,
                foreground: true,
                actions: Vec::new(),
            }),
            ..Default::default()
        };
        assert_eq!(describe(&snapshot), "[Playing] 2. Jazz: Playing (interrupted)");
    }
}
