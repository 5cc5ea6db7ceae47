//! tenantsync CLI - Command line interface for a tenant's local profile and
//! its remote sync state.
//!
//! Every invocation opens the profile store named in the config file, acts
//! as one "tab" for the duration of the command and exits.

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use tenantsync_app::{
    CoreConfig, DataType, RemoteConfig, ScheduleMode, StoreConfig, SyncCore, SyncResult,
    SyncStatus, TenantId,
};

#[derive(Parser)]
#[command(name = "tenantsync")]
#[command(about = "tenantsync - Multi-tenant profile storage and remote sync")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Config file (default: <config dir>/tenantsync/config.json).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Tenant to act on, overriding the config.
    #[arg(short, long, global = true)]
    tenant: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config file.
    Init {
        /// Profile store: "memory", "local" or "sqlite".
        #[arg(long, default_value = "sqlite")]
        store: String,

        /// Directory (local) or database file (sqlite) for the profile.
        #[arg(long)]
        store_path: Option<PathBuf>,

        /// Base URL of the remote REST endpoint. Omit for an in-process remote.
        #[arg(long)]
        remote_url: Option<String>,

        /// API key sent with every remote request.
        #[arg(long)]
        api_key: Option<String>,

        /// The remote procedures are not provisioned; use direct table access.
        #[arg(long)]
        no_rpc: bool,

        /// Only sync on request.
        #[arg(long)]
        manual: bool,

        /// Seconds between automatic cycles.
        #[arg(long, default_value = "60")]
        interval: u64,

        /// Overwrite an existing config file.
        #[arg(long)]
        force: bool,
    },

    /// Print this profile's device id.
    DeviceId,

    /// Store a JSON payload locally for the active tenant.
    Write {
        /// Data type: settings, services, staff, appointments or themes.
        #[arg(value_parser = parse_data_type)]
        data_type: DataType,

        /// JSON payload.
        json: String,

        /// Run a sync cycle right after writing.
        #[arg(long)]
        sync: bool,
    },

    /// Print the locally stored payload.
    Read {
        #[arg(value_parser = parse_data_type)]
        data_type: DataType,
    },

    /// Show or set the active theme id.
    Theme {
        /// New theme id.
        id: Option<String>,
    },

    /// Create the tenant remotely if it does not exist.
    EnsureTenant,

    /// Check that the remote answers.
    Ping,

    /// Push the local payload of one data type.
    Push {
        #[arg(value_parser = parse_data_type)]
        data_type: DataType,
    },

    /// Print the newest remote payload of one data type.
    Pull {
        #[arg(value_parser = parse_data_type)]
        data_type: DataType,
    },

    /// Print the newest remote payload of every data type.
    PullAll,

    /// Run a full sync cycle.
    Sync {
        /// Treat every locally present data type as modified.
        #[arg(long)]
        all_local: bool,
    },

    /// Apply the remote state locally without pushing.
    Hydrate,

    /// Store a merged payload locally and remotely.
    Resolve {
        #[arg(value_parser = parse_data_type)]
        data_type: DataType,

        /// Merged JSON payload.
        json: String,
    },

    /// Show sync status.
    Status {
        /// Print the raw state as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Run the scheduler and print changes until interrupted.
    Watch,

    /// Generate shell completions.
    Completions {
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins over --verbose.
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let config_path = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };

    match cli.command {
        Commands::Init {
            store,
            store_path,
            remote_url,
            api_key,
            no_rpc,
            manual,
            interval,
            force,
        } => {
            cmd_init(
                &config_path,
                cli.tenant,
                &store,
                store_path,
                remote_url,
                api_key,
                !no_rpc,
                manual,
                interval,
                force,
            )?;
        }
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "tenantsync", &mut std::io::stdout());
        }
        command => {
            let core = open_core(&config_path, cli.tenant)?;
            run(&core, command).await?;
        }
    }

    Ok(())
}

async fn run(core: &SyncCore, command: Commands) -> Result<()> {
    match command {
        Commands::DeviceId => println!("{}", core.get_current_device_id()),
        Commands::Write {
            data_type,
            json,
            sync,
        } => cmd_write(core, data_type, &json, sync).await?,
        Commands::Read { data_type } => cmd_read(core, data_type)?,
        Commands::Theme { id } => cmd_theme(core, id)?,
        Commands::EnsureTenant => cmd_ensure_tenant(core).await?,
        Commands::Ping => cmd_ping(core).await?,
        Commands::Push { data_type } => cmd_push(core, data_type).await?,
        Commands::Pull { data_type } => cmd_pull(core, data_type).await?,
        Commands::PullAll => cmd_pull_all(core).await?,
        Commands::Sync { all_local } => cmd_sync(core, all_local).await?,
        Commands::Hydrate => {
            require_tenant(core)?;
            let result = core.hydrate().await;
            print_result("Hydrate", &result);
        }
        Commands::Resolve { data_type, json } => cmd_resolve(core, data_type, &json).await?,
        Commands::Status { json } => cmd_status(core, json)?,
        Commands::Watch => cmd_watch(core).await?,
        Commands::Init { .. } | Commands::Completions { .. } => {
            bail!("This command does not open the sync core")
        }
    }
    Ok(())
}

fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir().context("No config directory on this platform")?;
    Ok(dir.join("tenantsync").join("config.json"))
}

fn default_profile_path(kind: &str) -> Result<PathBuf> {
    let dir = dirs::data_dir()
        .context("No data directory on this platform")?
        .join("tenantsync");
    Ok(match kind {
        "sqlite" => dir.join("profile.db"),
        _ => dir.join("profile"),
    })
}

fn parse_data_type(s: &str) -> std::result::Result<DataType, String> {
    s.parse::<DataType>().map_err(|e| e.to_string())
}

fn parse_json(json: &str) -> Result<Value> {
    serde_json::from_str(json).context("Payload is not valid JSON")
}

fn open_core(config_path: &Path, tenant: Option<String>) -> Result<SyncCore> {
    let mut config = if config_path.exists() {
        CoreConfig::load(config_path)
            .with_context(|| format!("Failed to load config {}", config_path.display()))?
    } else {
        debug!("No config at {}, using a sqlite profile", config_path.display());
        CoreConfig {
            store: StoreConfig::sqlite(default_profile_path("sqlite")?),
            ..CoreConfig::default()
        }
    };
    if tenant.is_some() {
        config.tenant = tenant;
    }
    if config.remote == RemoteConfig::Memory {
        warn!("No remote configured; remote state lives only for this command");
    }

    SyncCore::builder(config)
        .build()
        .context("Failed to open the sync core")
}

fn require_tenant(core: &SyncCore) -> Result<TenantId> {
    core.current_tenant()
        .context("No tenant selected; pass --tenant or set \"tenant\" in the config")
}

#[allow(clippy::too_many_arguments)]
fn cmd_init(
    config_path: &Path,
    tenant: Option<String>,
    store: &str,
    store_path: Option<PathBuf>,
    remote_url: Option<String>,
    api_key: Option<String>,
    rpc_enabled: bool,
    manual: bool,
    interval: u64,
    force: bool,
) -> Result<()> {
    if config_path.exists() && !force {
        bail!(
            "Config {} already exists; use --force to overwrite",
            config_path.display()
        );
    }

    let store = match store {
        "memory" => StoreConfig::memory(),
        "local" => StoreConfig::local(match store_path {
            Some(path) => path,
            None => default_profile_path("local")?,
        }),
        "sqlite" => StoreConfig::sqlite(match store_path {
            Some(path) => path,
            None => default_profile_path("sqlite")?,
        }),
        other => bail!("Unknown store kind: {}", other),
    };

    let remote = match remote_url {
        Some(base_url) => RemoteConfig::Http {
            base_url,
            api_key,
            rpc_enabled,
        },
        None => RemoteConfig::Memory,
    };

    let config = CoreConfig {
        store,
        remote,
        tenant,
        sync_interval_secs: interval,
        sync_mode: if manual {
            ScheduleMode::Manual
        } else {
            ScheduleMode::Periodic
        },
        ..CoreConfig::default()
    };
    // Validate before writing.
    config.tenant_id().context("Invalid tenant id")?;
    config.remote.build().context("Invalid remote config")?;

    config
        .save(config_path)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;
    println!("Config written to {}", config_path.display());
    Ok(())
}

async fn cmd_write(core: &SyncCore, data_type: DataType, json: &str, sync: bool) -> Result<()> {
    require_tenant(core)?;
    let payload = parse_json(json)?;

    if !core.write(data_type, payload) {
        bail!("Local write of {} failed", data_type);
    }
    println!("Stored {}", data_type);

    if sync {
        let result = core.force_sync_all().await;
        print_result("Sync", &result);
    }
    Ok(())
}

fn cmd_read(core: &SyncCore, data_type: DataType) -> Result<()> {
    require_tenant(core)?;
    match core.read(data_type) {
        Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        None => println!("(no local {})", data_type),
    }
    Ok(())
}

fn cmd_theme(core: &SyncCore, id: Option<String>) -> Result<()> {
    match id {
        Some(id) => {
            if !core.set_active_theme_id(&id) {
                bail!("Failed to store the active theme");
            }
            println!("Active theme: {}", id);
        }
        None => match core.active_theme_id() {
            Some(id) => println!("{}", id),
            None => println!("(no active theme)"),
        },
    }
    Ok(())
}

async fn cmd_ensure_tenant(core: &SyncCore) -> Result<()> {
    let tenant = require_tenant(core)?;
    if !core.ensure_tenant().await {
        bail!("Could not confirm tenant {} remotely", tenant);
    }
    println!("Tenant {} exists remotely", tenant);
    Ok(())
}

async fn cmd_ping(core: &SyncCore) -> Result<()> {
    let backend = core.client().backend().name().to_string();
    if !core.client().test_connection().await {
        bail!("Remote {} is unreachable", backend);
    }
    println!("Remote {} is reachable", backend);
    Ok(())
}

async fn cmd_push(core: &SyncCore, data_type: DataType) -> Result<()> {
    let tenant = require_tenant(core)?;
    let payload = core
        .read(data_type)
        .with_context(|| format!("No local {} to push", data_type))?;

    if !core.client().push(&tenant, data_type, payload).await {
        bail!("Push of {} failed", data_type);
    }
    println!("Pushed {}", data_type);
    Ok(())
}

async fn cmd_pull(core: &SyncCore, data_type: DataType) -> Result<()> {
    let tenant = require_tenant(core)?;
    match core.client().pull(&tenant, data_type).await {
        Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        None => println!("(no remote {})", data_type),
    }
    Ok(())
}

async fn cmd_pull_all(core: &SyncCore) -> Result<()> {
    let tenant = require_tenant(core)?;
    let records = core.client().pull_all(&tenant).await;
    if records.is_empty() {
        println!("(no remote data for {})", tenant);
        return Ok(());
    }

    for data_type in DataType::ALL {
        if let Some(value) = records.get(&data_type) {
            println!("{}: {}", data_type, value);
        }
    }
    Ok(())
}

async fn cmd_sync(core: &SyncCore, all_local: bool) -> Result<()> {
    require_tenant(core)?;
    if all_local {
        for data_type in DataType::ALL {
            if core.read(data_type).is_some() {
                core.orchestrator().mark_dirty(data_type);
            }
        }
    }

    let result = core.force_sync_all().await;
    print_result("Sync", &result);
    if result.types_failed > 0 {
        bail!("{} data type(s) failed to sync", result.types_failed);
    }
    Ok(())
}

async fn cmd_resolve(core: &SyncCore, data_type: DataType, json: &str) -> Result<()> {
    require_tenant(core)?;
    let payload = parse_json(json)?;
    if !core.resolve_conflict(data_type, payload).await {
        bail!("Resolution of {} was not stored remotely", data_type);
    }
    println!("Resolved {}", data_type);
    Ok(())
}

fn cmd_status(core: &SyncCore, json: bool) -> Result<()> {
    let state = core.get_sync_status();
    if json {
        println!("{}", state.to_json()?);
        return Ok(());
    }

    println!("Device: {}", core.get_current_device_id());
    match core.current_tenant() {
        Some(tenant) => println!("Tenant: {}", tenant),
        None => println!("Tenant: (none)"),
    }
    println!("Online: {}", if core.is_online() { "yes" } else { "no" });
    if state.tenant_missing {
        println!("Tenant is not confirmed remotely");
    }
    println!();

    for entry in state.entries() {
        let marker = if entry.dirty { "*" } else { " " };
        let detail = match (&entry.status, &entry.last_error) {
            (SyncStatus::Error, Some(error)) => format!(" ({})", error),
            _ => String::new(),
        };
        println!(
            "{} {:<14} {:?}{}",
            marker,
            entry.data_type.as_str(),
            entry.status,
            detail
        );
    }
    Ok(())
}

async fn cmd_watch(core: &SyncCore) -> Result<()> {
    let tenant = require_tenant(core)?;
    core.start();

    let mut subscriptions = Vec::new();
    for data_type in DataType::ALL {
        subscriptions.push(core.subscribe(data_type, |event| {
            let payload = event
                .payload
                .as_ref()
                .map_or_else(|| "(removed)".to_string(), Value::to_string);
            println!("[{:?}] {}: {}", event.source, event.topic, payload);
        }));
    }

    info!("Watching tenant {}; press Ctrl-C to stop", tenant);
    if let Some(scheduler) = core.scheduler() {
        match scheduler.request_sync().await {
            Ok(result) => print_result("Initial sync", &result),
            Err(e) => warn!("Initial sync failed: {}", e),
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    for subscription in subscriptions {
        subscription.unsubscribe();
    }
    core.shutdown().await;
    Ok(())
}

fn print_result(label: &str, result: &SyncResult) {
    if result.skipped {
        println!("{} skipped: a cycle is already running", label);
        return;
    }
    println!(
        "{}: {} synced, {} failed, {} pending, {} conflicts in {:?}",
        label,
        result.types_synced,
        result.types_failed,
        result.types_pending,
        result.conflicts_found,
        result.duration
    );
}
