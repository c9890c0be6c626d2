use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use unobot_client::{Client, Feed};
use unobot_player::{
    resume, strategy, Config, Coordinator, PointerStore, Resume, SessionOutcome, TableState,
    TracingSink, ValidatedConfig,
};
use unobot_types::{PlayerId, RoomId};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Strategy to play with (overrides the config file)
    #[arg(long)]
    strategy: Option<String>,

    /// Room to join (overrides the config file)
    #[arg(long)]
    room: Option<String>,

    /// Ignore any stored session pointer and join from scratch
    #[arg(long)]
    fresh: bool,
}

fn load_config(args: &Args) -> Result<ValidatedConfig> {
    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("failed to read config {}", args.config.display()))?;
    let mut config = Config::from_yaml(&raw)
        .with_context(|| format!("failed to parse config {}", args.config.display()))?;
    if let Some(strategy) = &args.strategy {
        config.strategy = strategy.clone();
    }
    if let Some(room) = &args.room {
        config.room_id = Some(room.clone());
    }
    config.validate().context("invalid config")
}

fn init_tracing(config: &ValidatedConfig) {
    let builder = tracing_subscriber::fmt().with_max_level(config.log_level);
    if config.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn join_fresh(client: &Client, config: &ValidatedConfig) -> Result<(RoomId, PlayerId)> {
    let room = match &config.room_id {
        Some(room) => RoomId::from(room.as_str()),
        None => {
            let listed = client.list_rooms().await.context("failed to list rooms")?;
            match listed.into_iter().next() {
                Some(listing) => listing.id,
                None => client
                    .create_room(config.is_sandbox)
                    .await
                    .context("failed to create room")?,
            }
        }
    };
    let player = client
        .join(&room, &config.join_request())
        .await
        .with_context(|| format!("failed to join room {room}"))?;
    info!(%room, %player, name = %config.identity.first_name, "joined room");
    Ok((room, player))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(&config);

    let client = Client::new(&config.api_base_url, config.mac_address.clone())
        .context("failed to build client")?
        .with_retry_policy(config.retry_policy.clone());
    let store = PointerStore::new(&config.session_file);

    let resumed = if args.fresh {
        store.discard().context("failed to clear session pointer")?;
        Resume::Fresh
    } else {
        resume(&client, &store)
            .await
            .context("failed to resume session")?
    };
    let (room, table) = match resumed {
        Resume::Resumed { pointer, table } => (pointer.room_id, table),
        Resume::Fresh => {
            let (room, player) = join_fresh(&client, &config).await?;
            (room, TableState::new(player))
        }
    };

    let feed_config = client
        .feed_config(&config.socket_url, room.clone(), table.me().clone())
        .context("invalid socket url")?
        .with_backoff(config.reconnect_initial_backoff, config.reconnect_max_backoff)
        .with_max_reconnect_attempts(config.max_reconnect_attempts)
        .with_capacity(config.feed_buffer);
    let feed = Feed::connect(feed_config);

    let factory = strategy::by_name(config.strategy)
        .with_context(|| format!("unknown strategy {}", config.strategy))?;
    info!(%room, strategy = factory.name, "starting session");
    let coordinator = Coordinator::new(
        client,
        room,
        table,
        (factory.make)(),
        config.coordinator_config(),
    )
    .with_store(store)
    .with_sink(TracingSink);

    match coordinator.run(feed).await? {
        SessionOutcome::GameOver(summary) => {
            info!(result = ?summary.result, points = summary.points, "game over");
        }
        SessionOutcome::RoomEnded => info!("room ended"),
    }
    Ok(())
}
