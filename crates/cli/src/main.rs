use std::io::Read;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use horizon_core::{Object, ObjectKey, Scope, NAMESPACE_ROOT};
use horizon_persist::SqliteKv;
use horizon_store::{
    ApplyRequest, Change, CreateRequest, Ctx, DeleteRequest, Store, StoreConfig, UpdateRequest, Validators, WatchRequest,
};
use horizon_substrate::Substrate;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "hzctl", version, about = "Horizon object store CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace for get/ls/delete/watch and override for manifests
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// SQLite database file (default: ~/.horizon/horizon.db)
    #[arg(long = "db", global = true, env = "HZ_DB_PATH")]
    db: Option<String>,

    /// Per-request timeout in seconds (watch is not limited)
    #[arg(long = "timeout", global = true, env = "HZ_TIMEOUT_SECS", default_value_t = 30)]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an object from a YAML/JSON manifest ("-" reads stdin)
    Create { file: String },
    /// Print one object
    Get { kind: String, name: String },
    /// List objects, optionally narrowed to a kind (and --ns)
    Ls { kind: Option<String> },
    /// Replace an object from a manifest
    Update {
        file: String,
        /// Only write if the stored revision still matches
        #[arg(long = "revision")]
        revision: Option<u64>,
    },
    /// Create or merge an object from a manifest
    Apply { file: String },
    /// Delete an object
    Delete {
        kind: String,
        name: String,
        #[arg(long = "revision")]
        revision: Option<u64>,
    },
    /// Stream changes and print +/- events until Ctrl-C
    Watch {
        kind: Option<String>,
        /// Replay changes starting at this revision instead of a snapshot
        #[arg(long = "from")]
        from: Option<u64>,
    },
}

fn init_tracing() {
    let env = std::env::var("HZ_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("HZ_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid HZ_METRICS_ADDR; expected host:port");
        }
    }
}

fn read_manifest(file: &str, ns: Option<&str>) -> Result<horizon_apply::Manifest> {
    let text = if file == "-" {
        let mut s = String::new();
        std::io::stdin().read_to_string(&mut s).context("reading manifest from stdin")?;
        s
    } else {
        std::fs::read_to_string(file).with_context(|| format!("reading manifest {}", file))?
    };
    horizon_apply::parse_manifest(&text, ns)
}

fn open_store(db: Option<&str>) -> Result<Store> {
    let kv = match db {
        Some(path) => SqliteKv::open(path)?,
        None => SqliteKv::open_default()?,
    };
    let kv: Arc<dyn Substrate> = Arc::new(kv);
    Ok(Store::new(Arc::clone(&kv))
        .with_validators(Validators::standard(kv))
        .with_config(StoreConfig::from_env()))
}

fn print_object(output: Output, obj: &Object) -> Result<()> {
    match output {
        Output::Human => println!("{}\trevision {}", obj.key(), obj.revision().unwrap_or_default()),
        Output::Json => println!("{}", serde_json::to_string_pretty(obj)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let store = open_store(cli.db.as_deref())?;
    let ctx = Ctx::with_timeout(Duration::from_secs(cli.timeout_secs.max(1)));
    let ns = cli.namespace.as_deref();
    let key_for = |kind: &str, name: &str| ObjectKey::new(kind, ns.unwrap_or(NAMESPACE_ROOT), name);

    match cli.command {
        Commands::Create { file } => {
            let m = read_manifest(&file, ns)?;
            info!(key = %m.key, "create invoked");
            let obj = store.create(&ctx, CreateRequest { key: m.key, data: serde_json::to_vec(&m.doc)? }).await?;
            print_object(cli.output, &obj)?;
        }
        Commands::Get { kind, name } => {
            let obj = store.get(&ctx, &key_for(&kind, &name)).await?;
            print_object(cli.output, &obj)?;
        }
        Commands::Ls { kind } => {
            let scope = match (kind, ns) {
                (Some(kind), Some(ns)) => Scope::kind(kind).namespace(ns),
                (Some(kind), None) => Scope::kind(kind),
                (None, _) => Scope::all(),
            };
            let mut items = store.list(&ctx, &scope).await?;
            if scope.kind_name().is_none() {
                if let Some(ns) = ns {
                    items.retain(|o| o.metadata.namespace == ns);
                }
            }
            match cli.output {
                Output::Human => {
                    println!("{:<16} {:<12} {:<24} {:>9} AGE", "KIND", "NAMESPACE", "NAME", "REVISION");
                    for o in &items {
                        let age = render_age(o.metadata.creation_timestamp.map(|t| t.timestamp()).unwrap_or(0));
                        println!(
                            "{:<16} {:<12} {:<24} {:>9} {}",
                            o.kind,
                            o.metadata.namespace,
                            o.metadata.name,
                            o.revision().unwrap_or_default(),
                            age
                        );
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&items)?),
            }
        }
        Commands::Update { file, revision } => {
            let m = read_manifest(&file, ns)?;
            info!(key = %m.key, ?revision, "update invoked");
            let obj = store.update(&ctx, UpdateRequest { key: m.key, data: serde_json::to_vec(&m.doc)?, revision }).await?;
            print_object(cli.output, &obj)?;
        }
        Commands::Apply { file } => {
            let m = read_manifest(&file, ns)?;
            info!(key = %m.key, "apply invoked");
            let res = store.apply(&ctx, ApplyRequest { data: serde_json::to_vec(&m.doc)? }).await?;
            match cli.output {
                Output::Human => {
                    let verb = if res.created { "created" } else if res.updated { "configured" } else { "unchanged" };
                    println!(
                        "{} {} (revision {}; +{} ~{} -{})",
                        res.object.key(),
                        verb,
                        res.object.revision().unwrap_or_default(),
                        res.summary.adds,
                        res.summary.updates,
                        res.summary.removes
                    );
                }
                Output::Json => {
                    #[derive(serde::Serialize)]
                    struct Row<'a> { created: bool, updated: bool, object: &'a Object, adds: usize, updates: usize, removes: usize }
                    let row = Row {
                        created: res.created,
                        updated: res.updated,
                        object: &res.object,
                        adds: res.summary.adds,
                        updates: res.summary.updates,
                        removes: res.summary.removes,
                    };
                    println!("{}", serde_json::to_string_pretty(&row)?);
                }
            }
        }
        Commands::Delete { kind, name, revision } => {
            let key = key_for(&kind, &name);
            store.delete(&ctx, DeleteRequest { key: key.clone(), revision }).await?;
            println!("{} deleted", key);
        }
        Commands::Watch { kind, from } => {
            let scope = match (kind, ns) {
                (Some(kind), Some(ns)) => Scope::kind(kind).namespace(ns),
                (Some(kind), None) => Scope::kind(kind),
                (None, _) => Scope::all(),
            };
            // Scopes are kind-first; without a kind the namespace is filtered here.
            let only_ns = if scope.kind_name().is_none() { ns } else { None };
            info!(scope = ?scope, ?from, ns = ?only_ns, "watch invoked");
            let watch_ctx = Ctx::background();
            let mut watcher = store.watch(&watch_ctx, WatchRequest { scope, from }).await?;
            loop {
                tokio::select! {
                    maybe = watcher.next() => {
                        match maybe {
                            Some(Ok(ev)) if !in_namespace(only_ns, &ev.key) => {}
                            Some(Ok(ev)) => match (cli.output, &ev.change) {
                                (Output::Human, Change::Put(_)) => println!("+ {} {}", ev.key, ev.revision),
                                (Output::Human, Change::Delete) => println!("- {} {}", ev.key, ev.revision),
                                (Output::Json, Change::Put(obj)) => println!("{}", serde_json::to_string(obj)?),
                                (Output::Json, Change::Delete) => {
                                    println!("{}", serde_json::json!({"deleted": ev.key.key(), "revision": ev.revision}));
                                }
                            },
                            Some(Err(e)) => {
                                warn!(error = %e, resume = ?watcher.resume_from(), "watch failed");
                                return Err(e.into());
                            }
                            None => {
                                warn!("watch stream ended");
                                break;
                            }
                        }
                    }
                    _ = signal::ctrl_c() => {
                        info!(resume = ?watcher.resume_from(), "Ctrl-C received; shutting down watch loop");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

fn in_namespace(ns: Option<&str>, key: &ObjectKey) -> bool {
    ns.map_or(true, |ns| key.namespace == ns)
}

fn render_age(creation_ts: i64) -> String {
    if creation_ts <= 0 { return "-".to_string(); }
    let now = chrono::Utc::now().timestamp();
    let mut secs = (now - creation_ts).max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}
