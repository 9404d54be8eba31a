//! Stratus CLI entrypoint.
//!
//! This is the main entrypoint for the stratus command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use stratus_control::cli::{Cli, Commands, LeaseCommands, OutputFormatter, TaskCommands};
use stratus_control::config::{
    ConfigParser, ConfigValidator, MarkerHasher, StateBackend, StratusConfig, find_config_file,
};
use stratus_control::control::{ControlPlane, CreateRequest};
use stratus_control::driver::DriverRegistry;
use stratus_control::error::{ConfigError, ControlPlaneError, Result, TaskError};
use stratus_control::provider::{
    HttpProviderAdapter, InMemoryProvider, ProviderAdapter, ProviderRegistry,
};
use stratus_control::state::{
    JournalBackend, LOCK_EXPIRY_SECS, LocalJournal, LockInfo, MemoryStore, ResourceKind,
    ResourceStore, S3Journal, ScopeRef, TaskStore, generate_holder_id, spawn_lease_keeper,
};
use stratus_control::tasks::{RecoveryReport, TaskHandle, TaskOutcome, UserContext};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// How often an open session renews its journal lease.
#[allow(clippy::cast_sign_loss)]
const LEASE_RENEW_SECS: u64 = (LOCK_EXPIRY_SECS / 3) as u64;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse_args();

    init_logging(cli.verbose, cli.log_json);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system; `RUST_LOG` overrides the level.
fn init_logging(verbose: bool, json: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);
    let config_path = cli.config.as_ref();

    match cli.command {
        Commands::Validate { warnings } => cmd_validate(config_path, warnings, &formatter),
        Commands::Inventory { scope } => cmd_inventory(config_path, scope, &formatter).await,
        Commands::Lease { command } => cmd_lease(config_path, command, &formatter).await,
        Commands::Tasks {
            command: TaskCommands::List { all },
        } => cmd_tasks_list(config_path, all, &formatter).await,
        Commands::Tasks {
            command: TaskCommands::Show { id },
        } => cmd_tasks_show(config_path, &id, &formatter).await,
        command => {
            let session = Session::open(config_path).await?;
            let outcome = match command {
                Commands::Sync { provider, kind } => {
                    cmd_sync(&session, provider.as_deref(), kind, &formatter).await
                }
                Commands::Create {
                    scope,
                    kind,
                    name,
                    size_gb,
                    storage_type,
                    parent,
                    wait,
                } => {
                    let request = CreateRequest {
                        size_gb,
                        storage_type,
                        parent_id: parent,
                        ..CreateRequest::new(scope, kind, &name)
                    };
                    cmd_create(&session, request, wait, &formatter).await
                }
                Commands::Delete { id, wait } => {
                    match session.plane.request_delete(&id, cli_user()).await {
                        Ok(handle) => report_task(&session, &handle, wait, &formatter).await,
                        Err(e) => Err(e),
                    }
                }
                Commands::Refresh { id, wait } => {
                    match session.plane.request_sync_status(&id, cli_user()).await {
                        Ok(handle) => report_task(&session, &handle, wait, &formatter).await,
                        Err(e) => Err(e),
                    }
                }
                Commands::Tasks {
                    command: TaskCommands::Recover,
                } => {
                    // Recovery already ran when the session opened.
                    emit(&formatter.format_recovery(&session.recovered));
                    Ok(())
                }
                _ => Err(ControlPlaneError::internal("command does not need a session")),
            };
            session.close(outcome).await
        }
    }
}

/// An open control plane holding the journal lease.
struct Session {
    config: StratusConfig,
    plane: ControlPlane,
    journal: Arc<dyn JournalBackend>,
    lease: LockInfo,
    keeper: JoinHandle<()>,
    recovered: RecoveryReport,
}

impl Session {
    /// Loads the configuration, takes the lease, restores the inventory and
    /// recovers tasks abandoned by a previous run.
    async fn open(config_path: Option<&PathBuf>) -> Result<Self> {
        let (config, config_file) = load_config(config_path)?;
        let journal = open_journal(&config, &config_file).await?;
        let lease = journal.acquire_lease(&generate_holder_id()).await?;
        debug!("Acquired journal lease {}", lease.lock_id);
        let keeper = spawn_lease_keeper(
            journal.clone(),
            lease.lock_id.clone(),
            Duration::from_secs(LEASE_RENEW_SECS),
        );

        let opened = async {
            let store = Arc::new(MemoryStore::open(journal.clone()).await?);
            let plane = ControlPlane::new(
                store,
                build_providers(&config)?,
                DriverRegistry::with_defaults(),
                config.engine.settings(),
            )
            .await?
            .with_scopes(config.scopes())
            .with_cascade(config.sync.cascade.clone());
            let recovered = plane.recover_stale().await?;
            if !recovered.is_empty() {
                warn!(
                    "Recovered stale tasks: {} redriven, {} failed",
                    recovered.redriven.len(),
                    recovered.failed.len()
                );
            }
            Ok::<_, ControlPlaneError>((plane, recovered))
        };

        match opened.await {
            Ok((plane, recovered)) => Ok(Self {
                config,
                plane,
                journal,
                lease,
                keeper,
                recovered,
            }),
            Err(e) => {
                keeper.abort();
                journal.release_lease(&lease.lock_id).await?;
                Err(e)
            }
        }
    }

    /// Waits for in-flight tasks, then releases the lease.
    async fn close(self, outcome: Result<()>) -> Result<()> {
        let limit = self.config.engine.settings().remote_deadline + Duration::from_secs(5);
        match self.plane.tasks().list_unfinished().await {
            Ok(unfinished) if !unfinished.is_empty() => {
                info!("Waiting for {} unfinished task(s)", unfinished.len());
                for task in unfinished {
                    if let Err(e) = self.plane.tasks().wait_terminal(&task.id, limit).await {
                        warn!("Task {} still unfinished: {e}", task.id);
                    }
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to list unfinished tasks: {e}"),
        }

        self.keeper.abort();
        self.journal.release_lease(&self.lease.lock_id).await?;
        debug!("Released journal lease {}", self.lease.lock_id);
        outcome
    }
}

/// Validate configuration.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().check(&config);
    for error in &result.errors {
        eprintln!("  - {error}");
    }
    if show_warnings {
        for warning in &result.warnings {
            emit(&formatter.warning(warning));
        }
    }
    if !result.is_valid() {
        return Err(ConfigError::validation(
            format!("{} error(s) found", result.error_count()),
            "config",
        )
        .into());
    }

    let hasher = MarkerHasher::new();
    emit(&formatter.success("Configuration is valid"));
    eprintln!("\nConfiguration summary:");
    eprintln!("  Control plane: {}", config.control_plane.name);
    eprintln!("  Fingerprint: {}", hasher.short_hash(&hasher.hash_config(&config), 12));
    eprintln!("  Providers: {}", config.providers.len());
    eprintln!("  Scopes: {}", config.scopes().len());
    eprintln!("  Warnings: {}", result.warning_count());
    Ok(())
}

/// Reconcile configured scopes.
async fn cmd_sync(
    session: &Session,
    provider: Option<&str>,
    kind: Option<ResourceKind>,
    formatter: &OutputFormatter,
) -> Result<()> {
    let plane = match provider {
        Some(name) => {
            let entry = session
                .config
                .providers
                .iter()
                .find(|p| p.name == name)
                .ok_or_else(|| {
                    ConfigError::validation(format!("No provider entry named {name}"), "provider")
                })?;
            session.plane.clone().with_scopes(entry.scopes())
        }
        None => session.plane.clone(),
    };
    let kinds = kind.map_or_else(|| session.config.sync.kinds.clone(), |k| vec![k]);

    info!("Syncing {} kind(s) across {} scope(s)", kinds.len(), plane.scopes().len());
    let outcomes = plane.sync_all(&kinds).await;
    emit(&formatter.format_sync(&outcomes));

    let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
    if failed > 0 {
        return Err(ControlPlaneError::internal(format!("{failed} sync pass(es) failed")));
    }
    Ok(())
}

/// Request a create.
async fn cmd_create(
    session: &Session,
    request: CreateRequest,
    wait: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (entity, handle) = session.plane.request_create(request, cli_user()).await?;
    emit(&formatter.success(&format!("Recorded {} as {}", entity.short_desc(), entity.id)));
    report_task(session, &handle, wait, formatter).await
}

/// Print a task id, or wait for it and print its record.
async fn report_task(
    session: &Session,
    handle: &TaskHandle,
    wait: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    if !wait {
        emit(&formatter.success(&format!("Task {} started", handle.id())));
        return Ok(());
    }

    let limit = session.config.engine.settings().remote_deadline + Duration::from_secs(5);
    let record = handle.wait(limit).await?;
    emit(&formatter.format_task(&record));
    if record.outcome == TaskOutcome::Failed {
        return Err(ControlPlaneError::internal(format!(
            "Task {} failed: {}",
            record.id,
            record.failure_reason.unwrap_or_default()
        )));
    }
    Ok(())
}

/// List recorded entities.
async fn cmd_inventory(
    config_path: Option<&PathBuf>,
    scope: Option<ScopeRef>,
    formatter: &OutputFormatter,
) -> Result<()> {
    let store = open_store_read_only(config_path).await?;
    let entities = match scope {
        Some(scope) => store.list_by_scope(&scope).await?,
        None => store.list_all().await?,
    };
    emit(&formatter.format_inventory(&entities));
    Ok(())
}

/// List tasks.
async fn cmd_tasks_list(
    config_path: Option<&PathBuf>,
    all: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let store = open_store_read_only(config_path).await?;
    let tasks = if all {
        store.list_tasks().await?
    } else {
        store.list_unfinished().await?
    };
    emit(&formatter.format_tasks(&tasks));
    Ok(())
}

/// Show one task.
async fn cmd_tasks_show(
    config_path: Option<&PathBuf>,
    id: &str,
    formatter: &OutputFormatter,
) -> Result<()> {
    let store = open_store_read_only(config_path).await?;
    let task = store
        .get_task(id)
        .await?
        .ok_or_else(|| TaskError::NotFound { id: id.to_string() })?;
    emit(&formatter.format_task(&task));
    Ok(())
}

/// Inspect or release the journal lease.
async fn cmd_lease(
    config_path: Option<&PathBuf>,
    command: LeaseCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, config_file) = load_config(config_path)?;
    let journal = open_journal(&config, &config_file).await?;

    match command {
        LeaseCommands::Show => {
            let lease = journal.lease_info().await?;
            emit(&formatter.format_lease(lease.as_ref()));
        }
        LeaseCommands::Release { lock_id, force } => {
            if force {
                journal.break_lease().await?;
                emit(&formatter.warning("Lease forcefully released"));
            } else if let Some(id) = lock_id {
                journal.release_lease(&id).await?;
                emit(&formatter.success("Lease released"));
            } else {
                eprintln!("Please provide --lock-id or use --force");
            }
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Writes command output to stdout.
fn emit(output: &str) {
    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{}", output.trim_end());
}

/// The user recorded on tasks started from the CLI.
fn cli_user() -> UserContext {
    let user = std::env::var("USER").unwrap_or_else(|_| String::from("cli"));
    UserContext::new(&user)
}

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Directory holding the configuration file.
fn config_dir(config_file: &Path) -> &Path {
    config_file.parent().unwrap_or_else(|| Path::new("."))
}

/// Loads and validates the configuration.
fn load_config(config_path: Option<&PathBuf>) -> Result<(StratusConfig, PathBuf)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;
    ConfigValidator::new().validate(&config)?;

    Ok((config, config_file))
}

/// Creates the configured journal backend.
async fn open_journal(config: &StratusConfig, config_file: &Path) -> Result<Arc<dyn JournalBackend>> {
    let journal: Arc<dyn JournalBackend> = match config.state.backend {
        StateBackend::Local => {
            let path = config
                .state
                .path
                .as_ref()
                .map_or_else(|| config_dir(config_file).join(".stratus"), PathBuf::from);
            Arc::new(LocalJournal::with_base_dir(path))
        }
        StateBackend::S3 => {
            let bucket = config
                .state
                .bucket
                .as_deref()
                .ok_or_else(|| ConfigError::validation("S3 bucket not configured", "state.bucket"))?;
            Arc::new(
                S3Journal::new(bucket, config.state.prefix.as_deref(), config.state.region.as_deref())
                    .await?,
            )
        }
    };
    Ok(journal)
}

/// Restores the inventory without taking the lease.
async fn open_store_read_only(config_path: Option<&PathBuf>) -> Result<MemoryStore> {
    let (config, config_file) = load_config(config_path)?;
    let journal = open_journal(&config, &config_file).await?;
    MemoryStore::open(journal).await
}

/// Creates one adapter per provider family.
fn build_providers(config: &StratusConfig) -> Result<ProviderRegistry> {
    let mut providers = ProviderRegistry::new();
    for entry in &config.providers {
        if providers.kinds().contains(&entry.kind) {
            continue;
        }
        let adapter: Arc<dyn ProviderAdapter> = match (&entry.endpoint, &entry.api_key_env) {
            (Some(endpoint), Some(var)) => Arc::new(HttpProviderAdapter::with_options(
                endpoint,
                &ConfigParser::api_key(var)?,
                entry.timeout_secs,
                &entry.proxy,
            )?),
            (Some(_), None) => {
                return Err(ConfigError::validation(
                    format!("Provider {} has an endpoint but no api_key_env", entry.name),
                    "api_key_env",
                )
                .into());
            }
            (None, _) => {
                debug!("Using the in-process provider for {}", entry.name);
                Arc::new(InMemoryProvider::new())
            }
        };
        providers.register(entry.kind, adapter);
    }
    Ok(providers)
}
