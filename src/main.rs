use chatsync::store::{CacheBackend, FileCacheBackend, MemoryCacheBackend};
use chatsync::types::{MessageKind, NewMessage, SenderKind, SenderProfile, Viewer};
use chatsync::{Client, MemoryBackend, SyncConfig};
use chrono::Local;
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

// Runs two viewers against the in-process backend and prints what the
// manager's client ends up showing.
//
// Usage:
//   cargo run                                   # in-memory cache
//   cargo run -- --cache-dir ./chat_cache       # file cache, survives restarts
//   cargo run -- --viewer maria --page-size 10

#[derive(Parser)]
#[command(name = "chatsync")]
#[command(about = "Chat synchronization demo against an in-process backend")]
struct Cli {
    /// Directory for the persistent cache; in-memory when omitted.
    #[arg(short, long)]
    cache_dir: Option<PathBuf>,

    #[arg(short, long, default_value_t = chatsync::config::DEFAULT_PAGE_SIZE)]
    page_size: usize,

    /// User id of the manager whose view is printed.
    #[arg(short, long, default_value = "manager")]
    viewer: String,
}

fn main() {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    if let Err(e) = rt.block_on(run(cli)) {
        log::error!("Demo failed: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), anyhow::Error> {
    let config = SyncConfig {
        page_size: cli.page_size.max(1),
        ..SyncConfig::default()
    };

    let cache: Arc<dyn CacheBackend> = match &cli.cache_dir {
        Some(dir) => Arc::new(FileCacheBackend::new(dir.clone()).await?),
        None => Arc::new(MemoryCacheBackend::new()),
    };

    let manager = Viewer::new(
        SenderProfile::new(&cli.viewer, "Maria", "Manager"),
        SenderKind::Manager,
    );
    let tenant = Viewer::new(SenderProfile::new("tenant-4b", "Theo", "Tenant"), SenderKind::Tenant);

    let backend = MemoryBackend::with_capacity(config.subscription_capacity);
    let manager_session = backend.session(&manager);
    let tenant_session = backend.session(&tenant);

    let room = backend.create_room("Unit 4B", Some("Maintenance and rent questions"));
    backend.add_member(&room.id, &manager.id, SenderKind::Manager)?;
    backend.add_member(&room.id, &tenant.id, SenderKind::Tenant)?;
    for i in 1..=25 {
        backend.post(
            &tenant.id,
            NewMessage {
                room_id: room.id.clone(),
                body: format!("Earlier note #{i}"),
                kind: MessageKind::Text,
            },
        )?;
    }
    info!("Seeded room {} with 25 messages", room.id);

    let client = Client::builder(manager)
        .with_backend(manager_session)
        .with_cache_backend(cache)
        .with_config(config.clone())
        .build()?;
    let other = Client::builder(tenant)
        .with_backend(tenant_session)
        .with_config(config)
        .build()?;

    let purged = client.sweep_cache().await;
    if purged > 0 {
        info!("Purged {purged} expired cache entries");
    }

    let directory = client.rooms();
    directory.start().await?;
    let unread = client.unread();
    unread.start().await?;
    info!("Unread before opening the room: {}", unread.count());

    let timeline = client.timeline();
    timeline.open(&room.id).await?;
    let typing = client.typing(&room.id);
    typing.start().await?;

    // The tenant types, then writes; the manager answers.
    let tenant_typing = other.typing(&room.id);
    tenant_typing.set_typing(true);
    tokio::time::sleep(Duration::from_millis(100)).await;
    for signal in typing.typing_users() {
        info!("{} is typing...", signal.user_id);
    }

    let tenant_timeline = other.timeline();
    tenant_timeline.open(&room.id).await?;
    tenant_timeline
        .send("The kitchen tap is leaking again.", MessageKind::Text)
        .await?;
    tenant_typing.set_typing(false);

    let reply = timeline
        .send("Thanks, a plumber will come by tomorrow.", MessageKind::Text)
        .await?;
    info!("Reply confirmed as {}", reply.id);

    while timeline.has_more() {
        let loaded = timeline.load_more().await?;
        info!("Loaded {loaded} older messages");
        if loaded == 0 {
            break;
        }
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    for room in directory.rooms() {
        let last = room
            .last_message
            .as_ref()
            .map(|p| p.text.as_str())
            .unwrap_or("-");
        info!("Room {} ({} members), last: {last}", room.name, room.members.len());
    }
    let messages = timeline.messages();
    info!("Timeline holds {} messages; newest five:", messages.len());
    for message in messages.iter().rev().take(5).rev() {
        let who = message
            .sender_profile
            .as_ref()
            .map(|p| p.display_name())
            .unwrap_or_else(|| message.sender_id.clone());
        info!("  [{}] {who}: {}", message.created_at.format("%H:%M:%S"), message.body);
    }
    if typing.typing_users().is_empty() {
        info!("Nobody is typing");
    } else {
        warn!("Typing set did not clear");
    }
    info!("Unread for {}: {}", client.viewer_id(), unread.count());

    timeline.close();
    typing.stop();
    unread.stop();
    directory.stop();
    Ok(())
}
