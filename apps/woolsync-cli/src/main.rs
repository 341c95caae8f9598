use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use woolsync_common::{DeviceId, VersionId, now_millis};
use woolsync_kernel::{StateLimits, VersionedGameState, generate_checksum, validate_values};
use woolsync_persist::SaveStore;
use woolsync_sync::{
    FileLocalStore, LocalPersistence, MemoryLocal, MemoryRemote, Resolution, SyncConfig,
    SyncEngine, SyncResult,
};

#[derive(Parser)]
#[command(name = "woolsync", about = "Cloud save sync and version control for idle games")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Sync configuration (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version and effective configuration
    Info,
    /// Recompute the checksum of a JSON save file
    Checksum {
        /// Path to a save in its JSON wire form
        file: PathBuf,
    },
    /// Run a two-device sync demo
    Demo {
        /// Keep the laptop's save and history in this store directory
        #[arg(short, long)]
        store: Option<PathBuf>,
    },
    /// Check a save store's hash chain and contents
    Verify {
        store: PathBuf,
    },
    /// Print branches and the active history of a save store
    History {
        store: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    let config = match &cli.config {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => SyncConfig::default(),
    };

    match cli.command {
        Commands::Info => {
            println!("woolsync v{}", env!("CARGO_PKG_VERSION"));
            println!("max building level: {}", config.limits.max_building_level);
            println!("max clock skew: {} ms", config.max_clock_skew_ms);
            println!("default branch: {}", config.version_control.default_branch);
            for rule in &config.strategies {
                println!("strategy: {} -> {:?}", rule.pattern, rule.strategy);
            }
        }
        Commands::Checksum { file } => checksum(&file, &config.limits)?,
        Commands::Demo { store } => demo(config, store.as_deref()).await?,
        Commands::Verify { store } => verify(&store)?,
        Commands::History { store } => history(&store)?,
    }

    Ok(())
}

fn checksum(file: &Path, limits: &StateLimits) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let state: VersionedGameState = serde_json::from_str(&raw)?;
    let computed = generate_checksum(&state);
    println!("stored:   {}", state.checksum);
    println!("computed: {computed}");
    println!("match: {}", if computed == state.checksum { "OK" } else { "MISMATCH" });
    match validate_values(&state, limits) {
        Ok(()) => println!("values: OK"),
        Err(e) => println!("values: {e}"),
    }
    Ok(())
}

async fn demo(config: SyncConfig, store: Option<&Path>) -> anyhow::Result<()> {
    let now = now_millis();
    let mut phone = VersionedGameState::new(DeviceId::new("phone"), now)
        .with_resource("wool", "50")
        .with_building("barn", 1, true)
        .with_achievement("first-shear")
        .with_achievement("ten-sheep");
    phone.version = VersionId::new();
    let phone = phone.sealed();

    let laptop = VersionedGameState::new(DeviceId::new("laptop"), now + 1)
        .with_resource("wool", "100")
        .with_building("barn", 1, true)
        .with_achievement("first-click")
        .with_achievement("first-shear");

    let remote = Arc::new(MemoryRemote::new(phone));
    let (local, file_store): (Arc<dyn LocalPersistence>, Option<FileLocalStore>) = match store {
        Some(path) => {
            let file = FileLocalStore::open(path)?;
            (Arc::new(file.clone()), Some(file))
        }
        None => (Arc::new(MemoryLocal::new(None)), None),
    };
    local.save_local_state(&laptop).await?;

    let engine = SyncEngine::new(DeviceId::new("laptop"), remote.clone(), local.clone(), config);

    println!("== full sync: diverged resources and achievements");
    let merged = report(engine.full_sync().await).context("first sync produced no state")?;

    println!("== full sync: both devices rebuilt the barn");
    let mut other = merged.clone().with_building("barn", 2, true);
    other.device_id = DeviceId::new("phone");
    other.version = VersionId::new();
    remote.push_from_other_device(other.sealed());
    local
        .save_local_state(&merged.with_building("barn", 3, true))
        .await?;
    report(engine.full_sync().await);

    println!("== resolving: keep the laptop barn");
    let keep = Resolution::manual(
        "buildings.barn",
        Some(serde_json::json!({"level": 3, "unlocked": true})),
        "kept laptop barn",
    );
    report(engine.resolve_user_conflicts(vec![keep]).await);

    if let (Some(file), Some(graph)) = (file_store, engine.version_graph()) {
        file.store().lock().save_graph(&graph)?;
        println!("history saved ({} versions)", graph.len());
    }
    Ok(())
}

fn report(result: SyncResult) -> Option<VersionedGameState> {
    println!(
        "success={} conflicts={} auto_resolved={}",
        result.success, result.conflicts, result.auto_resolved
    );
    for r in &result.resolutions {
        println!("  {} -> {:?} ({})", r.path, r.strategy, r.reason);
    }
    for c in &result.user_conflicts {
        println!(
            "  needs decision: {} local={:?} remote={:?}",
            c.path, c.local_value, c.remote_value
        );
    }
    for r in &result.stale_resolutions {
        println!("  ignored decision: {} (no longer in conflict)", r.path);
    }
    if let Some(error) = &result.error {
        println!("  error: {error}");
    }
    let state = result.new_state?;
    println!(
        "  wool={} barn={:?} achievements={:?}",
        state.resources.get("wool").map_or("0", String::as_str),
        state.buildings.get("barn").map(|b| b.level),
        state.achievements
    );
    Some(state)
}

fn verify(path: &Path) -> anyhow::Result<()> {
    let store = SaveStore::open(path)?;
    store.verify_integrity()?;
    let meta = store.meta();
    println!(
        "schema v{}: {} state segment(s), {} graph segment(s), hash chain OK",
        meta.schema_version, meta.state_count, meta.graph_count
    );
    if let Some(state) = store.load_latest_state()? {
        println!("latest save: version {} checksum OK", state.version);
    }
    if let Some(graph) = store.load_latest_graph()? {
        println!("version graph: {} versions, invariants OK", graph.len());
    }
    Ok(())
}

fn history(path: &Path) -> anyhow::Result<()> {
    let store = SaveStore::open(path)?;
    let Some(graph) = store.load_latest_graph()? else {
        println!("no history stored");
        return Ok(());
    };
    let active = graph.active_branch()?.name.clone();
    for branch in graph.branches() {
        let marker = if branch.name == active { "*" } else { " " };
        println!("{marker} {} -> {}", branch.name, branch.head);
    }
    let head = graph.head()?;
    for version in graph.history(head.id)? {
        println!(
            "{} {} [{}] {}",
            version.id,
            version.timestamp,
            version.metadata.tags.join(","),
            version.metadata.title
        );
    }
    Ok(())
}
