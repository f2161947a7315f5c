//! Fieldlink command-line client

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use fieldlink_core::prelude::*;
use fieldlink_core::ChannelState;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, env = "FIELDLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Signaling server base URL (e.g., "wss://relay.example.org/")
    #[arg(short, long, env = "FIELDLINK_URL")]
    url: Option<String>,

    /// Local user id, optionally as `user:token`
    #[arg(short, long, env = "FIELDLINK_IDENTITY")]
    identity: String,

    /// Authentication token; overrides a token given with the identity
    #[arg(short, long, env = "FIELDLINK_TOKEN", default_value = "")]
    token: String,

    /// Group call connection strategy
    #[arg(long, value_enum, env = "FIELDLINK_GROUP_STRATEGY")]
    strategy: Option<CliStrategy>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open every channel and print incoming traffic
    Connect {
        /// Accept incoming calls
        #[arg(long)]
        auto_accept: bool,
    },

    /// Call a peer
    Call {
        /// Peer user id
        peer: String,

        /// Audio only
        #[arg(long)]
        audio_only: bool,
    },

    /// Join or start a group call
    Join {
        /// Group id
        group: String,

        /// Audio only
        #[arg(long)]
        audio_only: bool,

        /// Start the call as its creator instead of joining
        #[arg(long)]
        create: bool,
    },

    /// Print the resolved configuration
    Status,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CliStrategy {
    ServerManaged,
    Mesh,
}

impl From<CliStrategy> for GroupStrategy {
    fn from(strategy: CliStrategy) -> Self {
        match strategy {
            CliStrategy::ServerManaged => GroupStrategy::ServerManaged,
            CliStrategy::Mesh => GroupStrategy::Mesh,
        }
    }
}

fn call_kind(audio_only: bool) -> CallKind {
    if audio_only {
        CallKind::Audio
    } else {
        CallKind::Video
    }
}

fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("org", "fieldlink", "fieldlink").map(|dirs| dirs.config_dir().join("config.json"))
}

fn load_config(cli: &Cli) -> Result<SessionConfig> {
    let mut config = match cli.config.clone().or_else(|| default_config_path().filter(|p| p.exists())) {
        Some(path) => {
            tracing::debug!(path = %path.display(), "Loading configuration");
            SessionConfig::from_file(&path).with_context(|| format!("loading {}", path.display()))?
        }
        None => SessionConfig::default(),
    };
    if let Some(url) = &cli.url {
        url::Url::parse(url).with_context(|| format!("invalid server url {url}"))?;
        config.channels.base_url = url.clone();
    }
    if let Some(strategy) = cli.strategy {
        config.group.strategy = strategy.into();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("FIELDLINK_LOG").unwrap_or_else(|_| EnvFilter::new("fieldlink=info")))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    if let Commands::Status = cli.command {
        return handle_status(&cli, &config);
    }

    let identity = if cli.token.is_empty() {
        StaticIdentity::parse(&cli.identity)?
    } else {
        StaticIdentity::new(cli.identity.as_str(), cli.token.as_str())
    };
    let identity = Arc::new(identity);
    let session = Session::builder(identity)
        .with_config(config)
        .build()
        .await
        .context("starting session")?;
    println!("🔗 Signed in as {}", session.local_id());

    let outcome = match cli.command {
        Commands::Connect { auto_accept } => handle_connect(&session, auto_accept).await,
        Commands::Call { peer, audio_only } => handle_call(&session, &peer, call_kind(audio_only)).await,
        Commands::Join {
            group,
            audio_only,
            create,
        } => handle_join(&session, &group, call_kind(audio_only), create).await,
        Commands::Status => Ok(()),
    };

    session.shutdown().await;
    outcome
}

async fn handle_connect(session: &Session, auto_accept: bool) -> Result<()> {
    let mut events = session.subscribe_events();
    session.connect().await.context("opening channels")?;
    println!("👂 Channels open, waiting for traffic (Ctrl-C to quit)");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(SessionEvent::Call(CallEvent::Incoming { call_id, from, call_kind })) => {
                    println!("📞 Incoming {call_kind} call {call_id} from {from}");
                    if auto_accept {
                        session.accept_call(call_id).await?;
                        println!("✅ Accepted");
                    }
                }
                Ok(SessionEvent::Chat { from, payload, .. }) => {
                    let from = from.map_or_else(|| "unknown".to_string(), |f| f.to_string());
                    println!("💬 {from}: {payload}");
                }
                Ok(event) => print_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    Ok(())
}

async fn handle_call(session: &Session, peer: &str, call_kind: CallKind) -> Result<()> {
    let mut events = session.subscribe_events();
    session.connect().await.context("opening channels")?;
    let call_id = session.start_call(UserId::new(peer), call_kind).await?;
    println!("📞 Calling {peer} ({call_kind}), call {call_id}");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                session.end_call(call_id).await?;
                println!("📴 Hung up");
                break;
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Call(CallEvent::Ended { call_id: id })) if id == call_id => {
                    println!("📴 Call ended");
                    break;
                }
                Ok(SessionEvent::Call(CallEvent::Failed { call_id: id, error })) if id == call_id => {
                    anyhow::bail!("call failed: {error}");
                }
                Ok(event) => print_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    Ok(())
}

async fn handle_join(session: &Session, group: &str, call_kind: CallKind, create: bool) -> Result<()> {
    let mut events = session.subscribe_events();
    session.connect().await.context("opening channels")?;
    let group_id = GroupId::new(group);
    let roster = if create {
        session.create_group_call(&group_id, call_kind).await?
    } else {
        session.join_group_call(&group_id, call_kind).await?
    };
    println!(
        "👥 In group {} with {} member(s), created by {}",
        roster.group_id,
        roster.members.len(),
        roster.creator_id
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                session.leave_group_call(&group_id).await?;
                println!("📴 Left group");
                break;
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Group(GroupEvent::Ended { group_id: ended })) if ended == group_id => {
                    println!("📴 Group call ended");
                    break;
                }
                Ok(event) => print_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    Ok(())
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Channel(ChannelEvent::StateChanged { kind, state }) => match state {
            ChannelState::Open => println!("✅ {kind:?} channel open"),
            other => tracing::debug!(?kind, state = ?other, "Channel state"),
        },
        SessionEvent::Channel(ChannelEvent::Reconnecting { kind, attempt, .. }) => {
            println!("🔄 {kind:?} channel reconnecting, attempt {attempt}");
        }
        SessionEvent::Channel(ChannelEvent::TransportDegraded { kind }) => {
            println!("⚠️  {kind:?} channel keeps dropping");
        }
        SessionEvent::Channel(ChannelEvent::ConnectionLost { kind }) => {
            println!("❌ {kind:?} channel lost");
        }
        SessionEvent::Call(CallEvent::Connected { call_id }) => println!("🎙️  Call {call_id} connected"),
        SessionEvent::Group(GroupEvent::MemberJoined { user_id, .. }) => println!("➕ {user_id} joined"),
        SessionEvent::Group(GroupEvent::MemberLeft { user_id, .. }) => println!("➖ {user_id} left"),
        SessionEvent::Group(GroupEvent::Error { error, .. }) => println!("❌ {error}"),
        other => tracing::debug!(event = ?other, "Session event"),
    }
}

fn handle_status(cli: &Cli, config: &SessionConfig) -> Result<()> {
    println!("📊 Fieldlink status");
    println!("==================");
    let user = cli.identity.split_once(':').map_or(cli.identity.as_str(), |(user, _)| user);
    println!("Identity:      {user}");
    println!("Server:        {}", config.channels.base_url);
    println!("Roster query:  {}", config.roster_base_url());
    println!("Delivery:      {:?}", config.channels.delivery_mode);
    println!("Group calls:   {:?}", config.group.strategy);
    if let Some(path) = default_config_path() {
        println!("Config file:   {}", path.display());
    }
    println!();
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
