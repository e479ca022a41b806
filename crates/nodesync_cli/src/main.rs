//! nodesync CLI - inspect and seed a peer's local sync state
//!
//! Usage: nodesync <command> [options]

use clap::{Parser, Subcommand};
use nodesync::store::keys;
use nodesync::{CachedEntity, Fields, LocalSettings, LocalStore, MutationIntent, MutationKind, OfflineQueue};
use nodesync_common::{NodeError, EXIT_ERROR, NODESYNC_DIR};
use nodesync_config::Config;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "nodesync",
    version,
    about = "nodesync offline-first sync peer"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose/debug logging
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize .nodesync in the current directory
    Init,

    /// Show this peer's identity and pending queue size
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect or edit the offline action queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Inspect cached workspace state
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// List pending actions in FIFO order
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Append an action to the queue
    Add {
        #[arg(long)]
        workspace: String,

        #[arg(long)]
        entity: String,

        /// create, update or delete
        #[arg(long)]
        kind: MutationKind,

        /// JSON object of fields
        #[arg(long)]
        payload: Option<String>,
    },

    /// Drop every pending action
    Clear,
}

#[derive(Subcommand)]
enum CacheAction {
    /// Print the cached nodes of a workspace
    Show {
        #[arg(long)]
        workspace: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    nodesync_common::telemetry::init_tracing(cli.verbose, false);

    let result = match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Status { json } => cmd_status(json).await,
        Commands::Queue { action } => match action {
            QueueAction::List { json } => cmd_queue_list(json).await,
            QueueAction::Add {
                workspace,
                entity,
                kind,
                payload,
            } => cmd_queue_add(workspace, entity, kind, payload).await,
            QueueAction::Clear => cmd_queue_clear().await,
        },
        Commands::Cache { action } => match action {
            CacheAction::Show { workspace, json } => cmd_cache_show(workspace, json).await,
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(EXIT_ERROR);
    }
}

//
// Helper functions
//

/// Load config for an initialized workspace in the current directory
fn load_workspace() -> anyhow::Result<Config> {
    let root = std::env::current_dir()?;
    if !root.join(NODESYNC_DIR).exists() {
        return Err(NodeError::NotInitialized(
            "no .nodesync directory here, run `nodesync init`".to_string(),
        )
        .into());
    }
    Ok(Config::load(&root)?)
}

async fn open_queue(
    store: &Arc<LocalStore>,
    config: &Config,
    workspace: &str,
) -> anyhow::Result<OfflineQueue> {
    Ok(OfflineQueue::open(store.clone(), workspace, config.queue.max_retries).await?)
}

/// Every persisted queue in the state directory, by workspace
async fn open_all_queues(
    store: &Arc<LocalStore>,
    config: &Config,
) -> anyhow::Result<Vec<OfflineQueue>> {
    let mut queues = Vec::new();
    for workspace in OfflineQueue::workspaces(store).await? {
        queues.push(open_queue(store, config, &workspace).await?);
    }
    Ok(queues)
}

async fn pending_intents(
    store: &Arc<LocalStore>,
    config: &Config,
) -> anyhow::Result<Vec<MutationIntent>> {
    let mut pending = Vec::new();
    for queue in open_all_queues(store, config).await? {
        pending.extend(queue.pending().await);
    }
    Ok(pending)
}

fn format_millis(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

fn parse_payload(payload: Option<&str>) -> anyhow::Result<Fields> {
    let Some(raw) = payload else {
        return Ok(Fields::new());
    };
    match serde_json::from_str::<serde_json::Value>(raw)? {
        serde_json::Value::Object(fields) => Ok(fields),
        _ => Err(NodeError::ValidationError("--payload must be a JSON object".to_string()).into()),
    }
}

//
// Command implementations
//

async fn cmd_init() -> anyhow::Result<()> {
    let root = std::env::current_dir()?;
    let nodesync_dir = root.join(NODESYNC_DIR);

    if !nodesync_dir.exists() {
        std::fs::create_dir(&nodesync_dir)?;
        eprintln!("✓ Created {}/", NODESYNC_DIR);
    } else {
        eprintln!("✓ {}/ already exists", NODESYNC_DIR);
    }

    let config_path = Config::path_for(&root);
    let config = if config_path.exists() {
        eprintln!("✓ {} already exists", display_relative(&root, &config_path));
        Config::load(&root)?
    } else {
        let config = Config {
            root: root.clone(),
            ..Default::default()
        };
        config.save()?;
        eprintln!("✓ Created {}", display_relative(&root, &config_path));
        config
    };

    let store = LocalStore::new(config.state_dir());
    let settings = LocalSettings::load_or_init(&store, &config.identity.display_name).await?;
    eprintln!("✓ Peer id {}", settings.peer_id);

    eprintln!("\nWorkspace initialized.");
    Ok(())
}

fn display_relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root).unwrap_or(path).display().to_string()
}

async fn cmd_status(json: bool) -> anyhow::Result<()> {
    let config = load_workspace()?;
    let store = Arc::new(LocalStore::new(config.state_dir()));
    let settings = LocalSettings::load_or_init(&store, &config.identity.display_name).await?;
    let pending = pending_intents(&store, &config).await?.len();

    if json {
        let status = serde_json::json!({
            "peer_id": settings.peer_id,
            "display_name": settings.display_name,
            "colour": settings.colour,
            "pending": pending,
            "max_retries": config.queue.max_retries,
            "state_dir": config.state_dir(),
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("Peer:     {} ({})", settings.display_name, settings.peer_id);
        println!("Colour:   {}", settings.colour);
        println!("Pending:  {} action(s)", pending);
        println!("State:    {}", config.state_dir().display());
    }
    Ok(())
}

async fn cmd_queue_list(json: bool) -> anyhow::Result<()> {
    let config = load_workspace()?;
    let store = Arc::new(LocalStore::new(config.state_dir()));
    let pending = pending_intents(&store, &config).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&pending)?);
        return Ok(());
    }

    if pending.is_empty() {
        println!("No pending actions.");
        return Ok(());
    }

    for intent in &pending {
        println!(
            "{}  {:<6}  {}/{}  retries={}  queued {}",
            intent.id,
            intent.kind,
            intent.workspace_id,
            intent.target_entity,
            intent.retry_count,
            format_millis(intent.enqueued_at)
        );
    }
    println!("\n{} pending action(s)", pending.len());
    Ok(())
}

async fn cmd_queue_add(
    workspace: String,
    entity: String,
    kind: MutationKind,
    payload: Option<String>,
) -> anyhow::Result<()> {
    let config = load_workspace()?;
    let fields = parse_payload(payload.as_deref())?;
    if kind == MutationKind::Delete && !fields.is_empty() {
        tracing::warn!("Ignoring payload on delete");
    }

    let intent = match kind {
        MutationKind::Delete => MutationIntent::delete(&workspace, &entity),
        _ => MutationIntent::new(kind, workspace.as_str(), entity, fields),
    };

    let store = Arc::new(LocalStore::new(config.state_dir()));
    let queue = open_queue(&store, &config, &workspace).await?;
    let id = queue.enqueue(intent).await?;
    println!("{}", id);
    eprintln!("✓ Queued {} ({} pending)", kind, queue.len().await);
    Ok(())
}

async fn cmd_queue_clear() -> anyhow::Result<()> {
    let config = load_workspace()?;
    let store = Arc::new(LocalStore::new(config.state_dir()));
    let mut removed = 0;
    for queue in open_all_queues(&store, &config).await? {
        removed += queue.clear().await?;
    }
    eprintln!("✓ Cleared {} pending action(s)", removed);
    Ok(())
}

async fn cmd_cache_show(workspace: String, json: bool) -> anyhow::Result<()> {
    let config = load_workspace()?;
    let store = LocalStore::new(config.state_dir());
    let cached: BTreeMap<String, CachedEntity> = store
        .read(&keys::cache(&workspace, "nodes"))
        .await?
        .unwrap_or_default();

    let records: Vec<_> = cached
        .values()
        .filter_map(|entity| entity.current.as_ref().map(|record| (record, entity.provisional)))
        .collect();

    if json {
        let items: Vec<serde_json::Value> = records
            .iter()
            .map(|(record, provisional)| {
                serde_json::json!({
                    "id": record.id,
                    "version": record.version,
                    "provisional": provisional,
                    "fields": record.fields,
                    "updated_at": record.updated_at,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No cached nodes for workspace {}.", workspace);
        return Ok(());
    }

    for (record, provisional) in &records {
        let marker = if *provisional { " (provisional)" } else { "" };
        println!(
            "{}  v{}{}  {}",
            record.id,
            record.version,
            marker,
            serde_json::Value::Object(record.fields.clone())
        );
    }
    Ok(())
}
