//! bidchat - terminal client for bid negotiation chat

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bidchat::api::ApiClient;
use bidchat::config::Config;
use bidchat::models::ChatMessage;
use bidchat::realtime::{ChatSession, ConnectionEvent, RoomEvent};

#[derive(Parser)]
#[command(name = "bidchat")]
#[command(about = "Real-time chat for bid negotiation rooms", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and print room messages and notifications until Ctrl-C
    Listen {
        /// User id (defaults to the configured user)
        #[arg(short, long)]
        user: Option<String>,

        /// Room (bid id) to join; repeatable
        #[arg(short, long = "room", required = true)]
        rooms: Vec<String>,
    },

    /// Send a message to a room
    Send {
        /// Room (bid id)
        #[arg(short, long)]
        room: String,

        /// Message content
        message: String,
    },

    /// Print a room's message history
    History {
        /// Room (bid id)
        #[arg(short, long)]
        room: String,
    },

    /// Show or update configuration
    Config {
        /// Store the default user id
        #[arg(long)]
        set_user: Option<String>,

        /// Store the socket server URL
        #[arg(long)]
        server: Option<String>,

        /// Store the REST API base URL
        #[arg(long)]
        api: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = Config::load()?;

    match cli.command {
        Commands::Listen { user, rooms } => {
            let user = match user.or_else(|| config.user_id.clone()) {
                Some(u) => u,
                None => bail!("No user id. Pass --user or run 'bidchat config --set-user <id>'."),
            };
            listen(&config, &user, &rooms).await?;
        }
        Commands::Send { room, message } => {
            tracing::info!("Sending message...");
            let client = ApiClient::from_config(&config);
            let sent = client.send_message(&room, &message).await?;
            println!("Message sent ({}).", sent.id);
        }
        Commands::History { room } => {
            let client = ApiClient::from_config(&config);
            let messages = client.message_history(&room).await?;
            if messages.is_empty() {
                println!("(no messages)");
            }
            for msg in &messages {
                print_message(msg);
            }
        }
        Commands::Config {
            set_user,
            server,
            api,
        } => {
            update_config(config, set_user, server, api)?;
        }
    }

    Ok(())
}

fn print_message(msg: &ChatMessage) {
    println!(
        "[{}] {}: {}",
        msg.sent_at.format("%Y-%m-%d %H:%M:%S"),
        msg.sender_label(),
        msg.body
    );
}

fn print_room_event(room: &str, event: &RoomEvent) {
    match event {
        RoomEvent::Message(msg) => {
            print!("#{} ", room);
            print_message(msg);
        }
        RoomEvent::Provisional(msg) => println!("#{} (sending) {}", room, msg.body),
        RoomEvent::Reconciled { message, .. } => println!("#{} (sent) {}", room, message.id),
        RoomEvent::Retracted { provisional_id } => {
            println!("#{} (failed) {}", room, provisional_id)
        }
    }
}

async fn listen(config: &Config, user: &str, rooms: &[String]) -> Result<()> {
    let session = ChatSession::with_server(&config.server_url, config.session());
    let api = ApiClient::from_config(config);
    let mut connection_events = BroadcastStream::new(session.connection_events());
    let mut notifications = BroadcastStream::new(session.notifications());

    tracing::info!("Connecting to {} as {}...", config.server_url, user);
    session.connect(user);

    let mut subscriptions = Vec::new();
    let mut guards = Vec::new();
    for room in rooms {
        match api.message_history(room).await {
            Ok(history) => {
                for msg in &history {
                    print!("#{} ", room);
                    print_message(msg);
                }
                session.seed_history(room, &history);
            }
            Err(e) => tracing::warn!("Could not load history for {}: {:#}", room, e),
        }

        let name = room.clone();
        subscriptions.push(session.subscribe(room, move |event| print_room_event(&name, event)));
        guards.push(session.enter(room));
    }

    if !session.wait_connected(config.session().handshake_timeout).await {
        tracing::warn!("Not connected yet ({}), still retrying", session.state());
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Interrupted, leaving rooms");
                break;
            }
            Some(event) = connection_events.next() => match event {
                Ok(ConnectionEvent::Connected { user_id }) => {
                    // Joins are forgotten when a link drops
                    for guard in &guards {
                        guard.rejoin();
                    }
                    tracing::info!("Connected as {} (rooms: {})", user_id, session.joined_rooms().join(", "));
                }
                Ok(ConnectionEvent::ConnectError { reason, retryable }) => {
                    tracing::warn!("Connect failed: {}", reason);
                    if !retryable {
                        bail!("Server rejected the connection: {}", reason);
                    }
                }
                Ok(ConnectionEvent::Dropped { reason }) => {
                    tracing::warn!("Connection dropped: {}", reason);
                }
                Ok(ConnectionEvent::StateChanged(state)) => {
                    tracing::debug!("Connection state: {}", state);
                }
                Err(e) => tracing::debug!("Missed connection events: {}", e),
            },
            Some(notification) = notifications.next() => match notification {
                Ok(n) => println!("* {}: {}", n.title, n.message),
                Err(e) => tracing::debug!("Missed notifications: {}", e),
            },
        }
    }

    drop(guards);
    drop(subscriptions);
    session.close().await;
    Ok(())
}

fn update_config(
    mut config: Config,
    set_user: Option<String>,
    server: Option<String>,
    api: Option<String>,
) -> Result<()> {
    let changed = set_user.is_some() || server.is_some() || api.is_some();
    if let Some(user) = set_user {
        config.user_id = Some(user);
    }
    if let Some(server) = server {
        url::Url::parse(&server).with_context(|| format!("Invalid server URL: {}", server))?;
        config.server_url = server;
    }
    if let Some(api) = api {
        url::Url::parse(&api).with_context(|| format!("Invalid API URL: {}", api))?;
        config.api_url = api;
    }

    if changed {
        config.save()?;
        println!("Saved {}", Config::config_path()?.display());
    }

    println!("server_url: {}", config.server_url);
    println!("api_url:    {}", config.api_url);
    println!(
        "user_id:    {}",
        config.user_id.as_deref().unwrap_or("(not set)")
    );
    println!(
        "token:      {}",
        if config.access_token.is_some() { "set" } else { "not set" }
    );
    Ok(())
}
