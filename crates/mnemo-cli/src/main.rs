//! Mnemo - persistent memory store CLI
//!
//! The `mnemo` command records, retrieves and maintains agent memories in a
//! store directory (default `.mnemo`, or `MNEMO_HOME`).
//!
//! ## Commands
//!
//! - `record`: Store a new memory (rejects near-duplicates unless `--force`)
//! - `get` / `query`: Retrieve memories (counts as access)
//! - `update` / `delete` / `reactivate`: Edit or remove a memory
//! - `chain`: Walk relationship edges from a memory
//! - `consolidate`: Merge near-duplicate memories
//! - `maintenance`: Decay, archive, stats, index rebuild
//! - `export` / `import`: Move memories between stores

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::Level;

use mnemo_core::model::timestamp;
use mnemo_core::{
    ArchivedFilter, ExportFormat, FsRecordStore, MaintenanceOp, MemoryPatch, MemoryStore,
    MemoryType, NewMemory, QuerySpec, SortKey, StoreConfig,
};

#[derive(Parser)]
#[command(name = "mnemo")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Persistent memory store for autonomous agents", long_about = None)]
struct Cli {
    /// Store directory
    #[arg(long, global = true, env = "MNEMO_HOME", default_value = ".mnemo")]
    root: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a new memory
    Record {
        /// Memory body; `-` reads it from stdin
        content: String,

        /// Short label
        #[arg(short, long)]
        summary: String,

        /// breakthrough, decision, feedback, error-recovery, pattern, user-preference
        #[arg(short = 't', long = "type")]
        memory_type: MemoryType,

        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Entities; extracted from the text when omitted
        #[arg(long = "entity")]
        entities: Vec<String>,

        #[arg(long)]
        project: Option<String>,

        #[arg(long)]
        task: Option<String>,

        #[arg(long)]
        confidence: Option<f64>,

        /// Related memory ids
        #[arg(long = "related")]
        related: Vec<String>,

        /// Id of the memory this one replaces
        #[arg(long)]
        supersedes: Option<String>,

        #[arg(long)]
        author: Option<String>,

        /// Store even if a near-identical memory was just recorded
        #[arg(long)]
        force: bool,
    },

    /// Show one memory
    Get {
        id: String,

        /// Do not count this read as an access
        #[arg(long)]
        peek: bool,
    },

    /// Search memories
    Query(QueryArgs),

    /// Edit a memory (bumps its version)
    Update {
        id: String,

        #[arg(long)]
        content: Option<String>,

        #[arg(long)]
        summary: Option<String>,

        #[arg(long = "type")]
        memory_type: Option<MemoryType>,

        /// Replace all tags
        #[arg(long = "tag")]
        tags: Option<Vec<String>>,

        #[arg(long)]
        confidence: Option<f64>,

        /// Replace related memory ids
        #[arg(long = "related")]
        related: Option<Vec<String>>,

        #[arg(long)]
        project: Option<String>,

        #[arg(long)]
        archived: Option<bool>,
    },

    /// Hard-delete a memory
    Delete { id: String },

    /// Bring an archived memory back into default queries
    Reactivate { id: String },

    /// Show memories reachable over relationship edges
    Chain {
        id: String,

        #[arg(short, long, default_value = "2")]
        depth: usize,

        /// Omit memory bodies
        #[arg(long)]
        no_content: bool,
    },

    /// Merge near-duplicate memories
    Consolidate {
        /// Only list candidate pairs
        #[arg(long)]
        dry_run: bool,
    },

    /// Lifecycle maintenance
    Maintenance {
        #[command(subcommand)]
        action: MaintenanceAction,
    },

    /// Export memories
    Export {
        /// structured (JSON) or narrative (Markdown)
        #[arg(short, long, default_value = "structured")]
        format: ExportFormat,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(long)]
        project: Option<String>,

        #[arg(long = "tag")]
        tags: Vec<String>,

        #[arg(long)]
        include_archived: bool,
    },

    /// Import a structured export
    Import {
        file: PathBuf,

        /// Replace memories whose id already exists
        #[arg(long)]
        overwrite: bool,
    },
}

#[derive(clap::Args)]
struct QueryArgs {
    /// Free-text search
    text: Option<String>,

    #[arg(long)]
    project: Option<String>,

    #[arg(long)]
    task: Option<String>,

    #[arg(long = "type")]
    types: Vec<MemoryType>,

    #[arg(long = "tag")]
    tags: Vec<String>,

    #[arg(long = "entity")]
    entities: Vec<String>,

    /// Created at or after (RFC 3339, ISO-8601 or epoch millis)
    #[arg(long, value_parser = parse_time)]
    since: Option<DateTime<Utc>>,

    #[arg(long, value_parser = parse_time)]
    until: Option<DateTime<Utc>>,

    #[arg(long)]
    min_relevance: Option<f64>,

    #[arg(long, value_enum, default_value = "exclude")]
    archived: ArchivedArg,

    #[arg(long, value_enum, default_value = "relevance")]
    sort: SortArg,

    #[arg(short, long)]
    limit: Option<usize>,

    /// Expand each hit into its relationship chain, to this depth
    #[arg(long)]
    expand_chains: Option<usize>,
}

#[derive(Subcommand)]
enum MaintenanceAction {
    /// Decay relevance of active memories
    Decay {
        #[arg(long)]
        half_life_days: Option<f64>,
    },
    /// Archive old, low-relevance memories
    Archive {
        #[arg(long)]
        age_days: Option<u64>,
        #[arg(long)]
        relevance_floor: Option<f64>,
    },
    /// Recompute aggregate counters
    Stats,
    /// Rebuild the index from the stored records
    Rebuild,
}

#[derive(Clone, Copy, ValueEnum)]
enum ArchivedArg {
    Exclude,
    Include,
    Only,
}

impl From<ArchivedArg> for ArchivedFilter {
    fn from(arg: ArchivedArg) -> Self {
        match arg {
            ArchivedArg::Exclude => ArchivedFilter::Exclude,
            ArchivedArg::Include => ArchivedFilter::Include,
            ArchivedArg::Only => ArchivedFilter::Only,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum SortArg {
    Relevance,
    Recency,
    AccessCount,
}

impl From<SortArg> for SortKey {
    fn from(arg: SortArg) -> Self {
        match arg {
            SortArg::Relevance => SortKey::Relevance,
            SortArg::Recency => SortKey::Recency,
            SortArg::AccessCount => SortKey::AccessCount,
        }
    }
}

fn parse_time(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    timestamp::parse(raw).map_err(|e| e.to_string())
}

type Store = MemoryStore<FsRecordStore>;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    mnemo_core::init_tracing(cli.json, level);

    let config = StoreConfig::load(&cli.root)
        .await
        .with_context(|| format!("Failed to load config from {}", cli.root.display()))?;
    let store = MemoryStore::open_dir(config)
        .await
        .with_context(|| format!("Failed to open memory store at {}", cli.root.display()))?;

    match cli.command {
        Commands::Record {
            content,
            summary,
            memory_type,
            tags,
            entities,
            project,
            task,
            confidence,
            related,
            supersedes,
            author,
            force,
        } => {
            let new = NewMemory {
                content: read_content(content)?,
                summary,
                memory_type: Some(memory_type),
                tags,
                entities,
                project_id: project,
                task_id: task,
                confidence,
                related_memories: related,
                supersedes,
                author,
                force,
                ..NewMemory::default()
            };
            cmd_record(&store, new).await
        }
        Commands::Get { id, peek } => cmd_get(&store, &id, peek).await,
        Commands::Query(args) => cmd_query(&store, args).await,
        Commands::Update {
            id,
            content,
            summary,
            memory_type,
            tags,
            confidence,
            related,
            project,
            archived,
        } => {
            let patch = MemoryPatch {
                content,
                summary,
                memory_type,
                tags,
                confidence,
                related_memories: related,
                project_id: project,
                archived,
                ..MemoryPatch::default()
            };
            cmd_update(&store, &id, patch).await
        }
        Commands::Delete { id } => cmd_delete(&store, &id).await,
        Commands::Reactivate { id } => cmd_reactivate(&store, &id).await,
        Commands::Chain {
            id,
            depth,
            no_content,
        } => cmd_chain(&store, &id, depth, !no_content).await,
        Commands::Consolidate { dry_run } => cmd_consolidate(&store, dry_run).await,
        Commands::Maintenance { action } => {
            let op = match action {
                MaintenanceAction::Decay { half_life_days } => MaintenanceOp::Decay { half_life_days },
                MaintenanceAction::Archive {
                    age_days,
                    relevance_floor,
                } => MaintenanceOp::Archive {
                    age_days,
                    relevance_floor,
                },
                MaintenanceAction::Stats => MaintenanceOp::Stats,
                MaintenanceAction::Rebuild => MaintenanceOp::RebuildIndex,
            };
            cmd_maintenance(&store, op).await
        }
        Commands::Export {
            format,
            output,
            project,
            tags,
            include_archived,
        } => {
            let mut spec = QuerySpec {
                project_id: project,
                tags,
                ..QuerySpec::all()
            };
            if include_archived {
                spec = spec.include_archived();
            }
            cmd_export(&store, &spec, format, output.as_deref()).await
        }
        Commands::Import { file, overwrite } => cmd_import(&store, &file, overwrite).await,
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_content(content: String) -> Result<String> {
    if content != "-" {
        return Ok(content);
    }
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .context("Failed to read memory content from stdin")?;
    Ok(buf)
}

async fn cmd_record(store: &Store, new: NewMemory) -> Result<()> {
    let memory = store.record(new).await.context("Failed to record memory")?;
    print_json(&memory)
}

async fn cmd_get(store: &Store, id: &str, peek: bool) -> Result<()> {
    let memory = if peek {
        store.peek(id).await
    } else {
        store.get(id).await
    }
    .with_context(|| format!("Failed to read memory {id}"))?;
    print_json(&memory)
}

async fn cmd_query(store: &Store, args: QueryArgs) -> Result<()> {
    let spec = QuerySpec {
        project_id: args.project,
        task_id: args.task,
        types: args.types,
        tags: args.tags,
        entities: args.entities,
        since: args.since,
        until: args.until,
        min_relevance: args.min_relevance,
        archived: args.archived.into(),
        text: args.text,
        sort: args.sort.into(),
        limit: args.limit,
        expand_chains: args.expand_chains,
    };
    let memories = store.query(&spec).await.context("Query failed")?;
    print_json(&memories)
}

async fn cmd_update(store: &Store, id: &str, patch: MemoryPatch) -> Result<()> {
    let memory = store
        .update(id, patch)
        .await
        .with_context(|| format!("Failed to update memory {id}"))?;
    print_json(&memory)
}

async fn cmd_delete(store: &Store, id: &str) -> Result<()> {
    let existed = store
        .delete(id)
        .await
        .with_context(|| format!("Failed to delete memory {id}"))?;
    print_json(&serde_json::json!({ "id": id, "deleted": existed }))
}

async fn cmd_reactivate(store: &Store, id: &str) -> Result<()> {
    let memory = store
        .reactivate(id)
        .await
        .with_context(|| format!("Failed to reactivate memory {id}"))?;
    print_json(&memory)
}

async fn cmd_chain(store: &Store, id: &str, depth: usize, include_content: bool) -> Result<()> {
    let chain = store
        .get_chain(id, depth, include_content)
        .await
        .with_context(|| format!("Failed to walk chain from {id}"))?;
    print_json(&chain)
}

async fn cmd_consolidate(store: &Store, dry_run: bool) -> Result<()> {
    if dry_run {
        let candidates = store
            .consolidation_candidates()
            .await
            .context("Failed to compute consolidation candidates")?;
        return print_json(&candidates);
    }
    let report = store.consolidate().await.context("Consolidation failed")?;
    print_json(&report)
}

async fn cmd_maintenance(store: &Store, op: MaintenanceOp) -> Result<()> {
    let name = op.name();
    let report = store
        .maintenance(op)
        .await
        .with_context(|| format!("Maintenance `{name}` failed"))?;
    print_json(&report)
}

async fn cmd_export(
    store: &Store,
    spec: &QuerySpec,
    format: ExportFormat,
    output: Option<&Path>,
) -> Result<()> {
    let bytes = store.export(spec, format).await.context("Export failed")?;
    match output {
        Some(path) => {
            std::fs::write(path, &bytes)
                .with_context(|| format!("Failed to write export to {}", path.display()))?;
            eprintln!("Exported to {}", path.display());
        }
        None => println!("{}", String::from_utf8_lossy(&bytes)),
    }
    Ok(())
}

async fn cmd_import(store: &Store, file: &Path, overwrite: bool) -> Result<()> {
    let bytes =
        std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let report = store
        .import(&bytes, overwrite)
        .await
        .with_context(|| format!("Failed to import {}", file.display()))?;
    print_json(&report)
}
