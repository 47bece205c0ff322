mod connection;
mod view;

use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use station_proto::config::Config;
use station_proto::playback::{PlaybackState, Transition};
use station_proto::protocol::{
    Broadcast, Command, FocusChange, FOCUS_DENIED, LOAD_FAILED, PLAYBACK_ERROR,
};
use station_proto::replica::{ReplicaUpdate, StateReplica};
use station_proto::track::TrackFetcher;
use tracing::{debug, warn};

use crate::connection::DaemonConnection;

#[derive(Parser)]
#[command(name = "station-ctl", version, about = "Control and watch station-daemon")]
struct Cli {
    /// Daemon address (host:port). Defaults to the configured socket.
    #[arg(long, env = "STATION_ADDR", global = true)]
    address: Option<String>,

    /// Seconds to wait for a transport command to take effect.
    #[arg(long, default_value_t = 20, global = true)]
    timeout: u64,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print the daemon's current state
    Status,
    Play,
    Pause,
    Stop,
    /// Pause when playing, play otherwise
    Toggle,
    /// Ask the daemon to re-fetch the track label
    Refresh,
    /// Report an audio-focus change (gain, loss, loss-transient, duck)
    Focus { change: FocusChange },
    /// Follow the daemon and print the icon line on every change
    Watch,
    /// Fetch the track label from the station page directly
    Track {
        /// Page to scrape instead of the configured one
        #[arg(long)]
        url: Option<String>,
    },
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
    let config = Config::load().unwrap_or_else(|e| {
        warn!("config unreadable, using defaults: {}", e);
        Config::default()
    });
    let address = cli
        .address
        .clone()
        .unwrap_or_else(|| config.socket_address());
    let timeout = Duration::from_secs(cli.timeout);

    match cli.command {
        Cmd::Track { url } => {
            let mut config = config;
            if let Some(url) = url {
                config.station.page_url = url;
            }
            let fetcher = TrackFetcher::from_config(&config).context("invalid track settings")?;
            println!("{}", fetcher.fetch_label().await.display());
            Ok(())
        }
        Cmd::Status => {
            let (_, replica) = connect(&address).await?;
            println!("{}", view::status_block(&replica));
            Ok(())
        }
        Cmd::Watch => watch(&address).await,
        Cmd::Refresh => send_only(&address, Command::RefreshTrack).await,
        Cmd::Focus { change } => send_only(&address, Command::AudioFocus { change }).await,
        Cmd::Play => transport(&address, Transport::Play, timeout).await,
        Cmd::Pause => transport(&address, Transport::Pause, timeout).await,
        Cmd::Stop => transport(&address, Transport::Stop, timeout).await,
        Cmd::Toggle => transport(&address, Transport::Toggle, timeout).await,
    }
}

/// Connect and wait for the Hello snapshot.
async fn connect(address: &str) -> anyhow::Result<(DaemonConnection, StateReplica)> {
    let mut conn = DaemonConnection::connect(address).await?;
    let mut replica = StateReplica::new();
    match conn.next_broadcast().await? {
        Some(hello @ Broadcast::Hello { .. }) => {
            replica.apply(hello);
        }
        Some(other) => anyhow::bail!("expected Hello from daemon, got {:?}", other),
        None => anyhow::bail!("daemon closed the connection"),
    }
    if let Some(version) = replica.protocol_mismatch() {
        warn!(
            "daemon speaks protocol {}, this client {}",
            version,
            station_proto::protocol::PROTOCOL_VERSION
        );
    }
    Ok((conn, replica))
}

async fn send_only(address: &str, cmd: Command) -> anyhow::Result<()> {
    let (mut conn, _) = connect(address).await?;
    conn.send_command(cmd).await
}

#[derive(Clone, Copy)]
enum Transport {
    Play,
    Pause,
    Stop,
    Toggle,
}

/// Send a transport command and wait until the daemon publishes the result.
async fn transport(address: &str, transport: Transport, timeout: Duration) -> anyhow::Result<()> {
    let (mut conn, mut replica) = connect(address).await?;
    let current = replica.playback();

    let (transition, cmd) = match transport {
        Transport::Play => (Transition::Play, Command::Play),
        Transport::Pause => (Transition::Pause, Command::Pause),
        Transport::Stop => (Transition::Stop, Command::Stop),
        Transport::Toggle => (Transition::toggle(current), Command::TogglePause),
    };

    // The daemon stays silent on no-ops, so there would be nothing to wait for.
    let Some(target) = transition.apply(current) else {
        println!("{}", view::icon_line(&replica));
        return Ok(());
    };

    conn.send_command(cmd).await?;

    let waiting = wait_for(&mut conn, &mut replica, transition, target);
    match tokio::time::timeout(timeout, waiting).await {
        Ok(result) => {
            result?;
            println!("{}", view::icon_line(&replica));
            Ok(())
        }
        Err(_) => anyhow::bail!("no confirmation from daemon after {}s", timeout.as_secs()),
    }
}

/// Apply broadcasts until the replica reaches `target`.  Fails on a notice
/// that refuses `transition`; other notices (another client's request, a
/// stream dropping) are passed over.
async fn wait_for(
    conn: &mut DaemonConnection,
    replica: &mut StateReplica,
    transition: Transition,
    target: PlaybackState,
) -> anyhow::Result<()> {
    while let Some(broadcast) = conn.next_broadcast().await? {
        match replica.apply(broadcast) {
            ReplicaUpdate::Changed if replica.playback() == target => return Ok(()),
            ReplicaUpdate::Notice(message) if refuses(transition, &message) => {
                anyhow::bail!(message)
            }
            other => debug!("waiting for {:?}: {:?}", target, other),
        }
    }
    anyhow::bail!("daemon closed the connection")
}

fn refuses(transition: Transition, message: &str) -> bool {
    let engine_error = message.starts_with(PLAYBACK_ERROR);
    match transition {
        Transition::Play => engine_error || message == FOCUS_DENIED || message == LOAD_FAILED,
        _ => engine_error,
    }
}

async fn watch(address: &str) -> anyhow::Result<()> {
    let (mut conn, mut replica) = connect(address).await?;
    println!("{}", view::icon_line(&replica));

    while let Some(broadcast) = conn.next_broadcast().await? {
        match replica.apply(broadcast) {
            ReplicaUpdate::Changed => println!("{}", view::icon_line(&replica)),
            ReplicaUpdate::Unchanged => {}
            ReplicaUpdate::Notice(message) => println!("! {}", message),
            ReplicaUpdate::Log(line) => eprintln!("{}", line),
        }
    }

    eprintln!("daemon disconnected");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use station_proto::protocol::StationState;

    #[test]
    fn test_cli_parses_focus_change() {
        let cli = Cli::try_parse_from(["station-ctl", "focus", "duck"]).unwrap();
        assert!(matches!(
            cli.command,
            Cmd::Focus {
                change: FocusChange::LossTransientCanDuck
            }
        ));
        assert!(Cli::try_parse_from(["station-ctl", "focus", "sideways"]).is_err());
    }

    #[test]
    fn test_only_matching_notices_refuse_a_request() {
        assert!(refuses(Transition::Play, FOCUS_DENIED));
        assert!(refuses(Transition::Play, LOAD_FAILED));
        assert!(refuses(Transition::Stop, "Playback error: mpv IPC timeout"));
        assert!(!refuses(Transition::Pause, LOAD_FAILED));
        assert!(!refuses(Transition::Play, "Stream stopped: network"));
    }

    async fn serve_broadcasts(broadcasts: Vec<Broadcast>) -> String {
        use station_proto::protocol::Message;
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            for b in broadcasts {
                let frame = Message::Broadcast(b).encode().unwrap();
                stream.write_all(&frame).await.unwrap();
            }
            // hold the connection open until the client is done
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        addr
    }

    fn stopped_replica() -> StateReplica {
        let mut replica = StateReplica::new();
        replica.apply(Broadcast::Hello {
            protocol_version: station_proto::protocol::PROTOCOL_VERSION,
            daemon_rev: 1,
            state: StationState {
                rev: 1,
                ..Default::default()
            },
        });
        replica
    }

    #[tokio::test]
    async fn test_wait_for_passes_over_unrelated_notice() {
        let addr = serve_broadcasts(vec![
            Broadcast::Notice {
                message: "Stream stopped: network".into(),
            },
            Broadcast::State {
                data: StationState {
                    rev: 2,
                    playback: PlaybackState::Playing,
                    ..Default::default()
                },
            },
        ])
        .await;
        let mut conn = DaemonConnection::connect(&addr).await.unwrap();
        let mut replica = stopped_replica();
        wait_for(&mut conn, &mut replica, Transition::Play, PlaybackState::Playing)
            .await
            .unwrap();
        assert!(replica.is_playing());
    }

    #[tokio::test]
    async fn test_wait_for_fails_on_refusal() {
        let addr = serve_broadcasts(vec![Broadcast::Notice {
            message: FOCUS_DENIED.into(),
        }])
        .await;
        let mut conn = DaemonConnection::connect(&addr).await.unwrap();
        let mut replica = stopped_replica();
        let err = wait_for(&mut conn, &mut replica, Transition::Play, PlaybackState::Playing)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), FOCUS_DENIED);
    }

    #[test]
    fn test_cli_global_address() {
        let cli =
            Cli::try_parse_from(["station-ctl", "status", "--address", "127.0.0.1:1"]).unwrap();
        assert_eq!(cli.address.as_deref(), Some("127.0.0.1:1"));
        assert!(matches!(cli.command, Cmd::Status));
    }
}
