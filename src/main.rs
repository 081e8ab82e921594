use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use loglens_agent::{Collaborators, ForensicTeam};
use loglens_core::config::AppConfig;
use loglens_core::event::EventBus;
use loglens_core::traits::ObjectStore;
use loglens_core::types::{JobPayload, LogType};
use loglens_gateway::GatewayServer;
use loglens_store::{FsObjectStore, SqliteStore, StagedLogSource};

#[derive(Parser)]
#[command(name = "loglens", version, about = "Forensic log analysis with a supervised agent team")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "loglens.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve,
    /// Analyze one log bundle and print the job result
    Run {
        /// Log type (prefetch, application, security, forwarded, setup, system)
        #[arg(long)]
        log_type: String,
        /// JSON file holding an array of records, or an object with a `records` array
        #[arg(long)]
        file: PathBuf,
        /// Computer the logs came from, used when searching prior analyses
        #[arg(long)]
        computer_id: Option<i64>,
    },
    /// Print the assembled agent graph
    Graph,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Everything a job needs, opened from config.
struct Runtime {
    team: Arc<ForensicTeam>,
    store: Arc<SqliteStore>,
    staged: Arc<StagedLogSource>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("loglens=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "loglens", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            let mut shown = config.clone();
            if shown.model.api_key.is_some() {
                shown.model.api_key = Some("********".to_string());
            }
            println!("{}", toml::to_string_pretty(&shown)?);
        }
        Commands::Graph => {
            let runtime = open_runtime(&config)?;
            println!("{}", serde_json::to_string_pretty(&runtime.team.describe())?);
        }
        Commands::Run {
            log_type,
            file,
            computer_id,
        } => {
            let log_type = LogType::parse(&log_type)
                .with_context(|| format!("unknown log type '{}'", log_type))?;
            let records = read_records(&file)?;
            info!(%log_type, records = records.len(), "Running forensic job");

            let runtime = open_runtime(&config)?;
            let mut payload = JobPayload::inline(log_type, records);
            payload.computer_id = computer_id;

            let cancel = CancellationToken::new();
            spawn_ctrl_c(cancel.clone(), "Cancelling job...");

            let result = runtime.team.start_job(payload, cancel).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.is_completed() {
                std::process::exit(1);
            }
        }
        Commands::Serve => {
            let runtime = open_runtime(&config)?;
            let gateway_config = config.gateway.clone().unwrap_or_default();
            if gateway_config.api_keys.is_empty() && gateway_config.token.is_none() {
                warn!("No API keys or token configured; the gateway accepts anonymous requests");
            }
            match runtime.store.purge_expired_tokens() {
                Ok(n) if n > 0 => info!(purged = n, "Expired access tokens removed"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to purge expired tokens"),
            }

            info!(bind = %gateway_config.bind, "Starting HTTP gateway");
            let server =
                GatewayServer::new(gateway_config, runtime.team, runtime.store, runtime.staged);

            // Graceful shutdown on Ctrl-C
            let cancel = CancellationToken::new();
            spawn_ctrl_c(cancel.clone(), "Shutting down gateway...");

            server.run(cancel).await?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    let home_config = dirs_home().map(|h| h.join(".loglens").join("config.toml"));
    match home_config {
        Some(ref p) if p.exists() => {
            info!(path = %p.display(), "Loading config from home directory");
            Ok(AppConfig::load(p)?)
        }
        _ => anyhow::bail!(
            "No config file found at {}. See loglens.toml.example for reference.",
            path.display()
        ),
    }
}

fn open_runtime(config: &AppConfig) -> anyhow::Result<Runtime> {
    let workspace = config.workspace_dir();
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("creating workspace {}", workspace.display()))?;

    let store = Arc::new(SqliteStore::open(&config.database_path())?);

    let mut fs_objects = FsObjectStore::new(config.objects_dir());
    if let Some(ref url) = config.storage.public_base_url {
        fs_objects = fs_objects.with_public_base_url(url.clone());
    }
    let objects: Arc<dyn ObjectStore> = Arc::new(fs_objects);
    let staged = Arc::new(StagedLogSource::new(objects.clone()));

    let reasoner = loglens_llm::create_reasoner(&config.model);
    let collaborators = Collaborators::new(reasoner, objects)
        .with_log_source(staged.clone())
        .with_index(store.clone());

    let mut team = ForensicTeam::assemble(config, collaborators, Arc::new(EventBus::default()))?;
    if let (Some(dir), Some(log)) = (config.log_dir(), config.log.as_ref()) {
        info!(dir = %dir.display(), level = log.level, "Run logging enabled");
        team = team.with_run_log(dir, log.level);
    }

    info!(
        provider = %config.model.provider,
        model = %config.model.model_id,
        policy = ?config.engine.policy,
        "Forensic team assembled"
    );

    Ok(Runtime {
        team: Arc::new(team),
        store,
        staged,
    })
}

/// Parse a bundle file: a bare array of records or `{"records": [...]}`.
fn read_records(path: &Path) -> anyhow::Result<Vec<serde_json::Value>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("parsing {}", path.display()))?;
    match value {
        serde_json::Value::Array(records) => Ok(records),
        serde_json::Value::Object(mut map) => match map.remove("records") {
            Some(serde_json::Value::Array(records)) => Ok(records),
            _ => anyhow::bail!("{}: expected a `records` array", path.display()),
        },
        _ => anyhow::bail!("{}: expected a JSON array of records", path.display()),
    }
}

fn spawn_ctrl_c(cancel: CancellationToken, message: &'static str) {
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("{}", message);
        cancel.cancel();
    });
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
