//! Lanmesh Peer
//!
//! Demo CLI for the lanmesh session protocol: host a session on the local
//! network or join one with its name and passcode. Once the mesh is up,
//! stdin lines broadcast to every member.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use lanmesh_core::{Client, Host, SessionConfig, SessionEvent};

mod beacon;

use beacon::LanBeacon;

/// Lanmesh - secure LAN mesh sessions
#[derive(Parser)]
#[command(name = "lanmesh-peer")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Identifier for this peer (random mnemonic if omitted)
    #[arg(short, long)]
    identifier: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Host a session and start the mesh once enough peers joined
    Host {
        /// Number of peers to wait for before starting the mesh
        #[arg(short, long, default_value = "1")]
        peers: usize,
    },

    /// Join an advertised session
    Join {
        /// The advertised session name
        session: String,

        /// The six-digit passcode
        passcode: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let config = SessionConfig {
        identifier: cli.identifier,
        ..SessionConfig::default()
    };

    match cli.command {
        Commands::Host { peers } => cmd_host(config, peers).await,
        Commands::Join { session, passcode } => cmd_join(config, session, passcode).await,
    }
}

async fn cmd_host(config: SessionConfig, peers: usize) -> Result<()> {
    let discovery = LanBeacon::new();
    let mut host = Host::create(config, discovery).await?;
    let mut events = host.subscribe();
    host.advertise().await?;

    println!("Session:  {}", host.identifier());
    println!("Passcode: {}", host.passcode());
    println!("Waiting for {peers} peer(s) to join...");

    let mut joined = 0usize;
    while joined < peers {
        match events.recv().await {
            Ok(SessionEvent::MemberAuthenticated { username }) => {
                joined += 1;
                println!("+ {username} authenticated ({joined}/{peers})");
            }
            Ok(SessionEvent::ConnectionAttemptFail { username, error, .. }) => {
                println!("! {username}: {error}");
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => anyhow::bail!("session closed"),
        }
    }

    info!("starting mesh");
    host.start_mesh().await?;
    run_chat(events, ChatPeer::Host(host)).await
}

async fn cmd_join(config: SessionConfig, session: String, passcode: String) -> Result<()> {
    let discovery = LanBeacon::new();
    let mut client = Client::create(config, discovery).await?;
    let events = client.subscribe();

    println!("Joining '{session}' as {}...", client.identifier());
    client.connect_session(&session, &passcode).await?;
    println!("Authenticated. Waiting for the host to start the mesh...");

    run_chat(events, ChatPeer::Client(client)).await
}

enum ChatPeer {
    Host(Host),
    Client(Client),
}

impl ChatPeer {
    async fn broadcast(&self, text: &str) -> Result<()> {
        match self {
            ChatPeer::Host(host) => host.broadcast(text).await?,
            ChatPeer::Client(client) => client.broadcast(text).await?,
        }
        Ok(())
    }

    async fn destroy(&mut self) {
        match self {
            ChatPeer::Host(host) => host.destroy().await,
            ChatPeer::Client(client) => client.destroy().await,
        }
    }
}

async fn run_chat(
    mut events: broadcast::Receiver<SessionEvent>,
    mut peer: ChatPeer,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::SessionStarted) => println!("* mesh is up; type to chat"),
                Ok(SessionEvent::Message { from, text, .. }) => println!("[{from}] {text}"),
                Ok(SessionEvent::PeerDisconnected(user)) => println!("* {user} disconnected"),
                Ok(SessionEvent::PeerReconnected(user)) => println!("* {user} reconnected"),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            line = lines.next_line() => match line? {
                Some(text) if !text.is_empty() => peer.broadcast(&text).await?,
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    println!("Shutting down...");
    peer.destroy().await;
    Ok(())
}
