/// Version injected at compile time via GCPFIND_VERSION env var (set by CI/CD),
/// or "dev" for local builds.
pub const VERSION: &str = match option_env!("GCPFIND_VERSION") {
    Some(v) => v,
    None => "dev",
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use gcpfind::cache::{FileCache, LocationCache, ResourceKind};
use gcpfind::config::Config;
use gcpfind::gcp::client::GcpClient;
use gcpfind::gcp::compute::Scope;
use gcpfind::gcp::projects::list_project_ids;
use gcpfind::iplookup::{IpAssociation, IpLookup, IpLookupMode};
use gcpfind::progress::{Progress, ProgressEvent};
use gcpfind::resolve::{ResolvedVia, Resolver};
use gcpfind::search::providers::default_providers;
use gcpfind::search::{SearchEngine, SearchQuery, SearchResult};
use gcpfind::shell::{ssh_to_instance, ShellResult, SshOptions};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// Find where GCP resources live
#[derive(Parser, Debug)]
#[command(name = "gcpfind", version = VERSION, about, long_about = None)]
struct Args {
    /// GCP project to use
    #[arg(short, long, global = true)]
    project: Option<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table", global = true)]
    output: OutputFormat,

    /// Do not read or write the location cache
    #[arg(long, global = true)]
    no_cache: bool,

    /// Hide progress messages
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log level for debugging
    #[arg(long, value_enum, default_value = "off", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Find the zone of a VM instance
    Instance {
        name: String,
        /// Skip discovery and look only in this zone
        #[arg(long)]
        zone: Option<String>,
    },
    /// Find a managed instance group and the member to connect to
    Mig {
        name: String,
        #[arg(long, conflicts_with = "region")]
        zone: Option<String>,
        #[arg(long)]
        region: Option<String>,
    },
    /// Find the resources using an IP address
    Ip {
        address: String,
        /// Lookup strategy (defaults to the configured mode)
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
    },
    /// Search resources by name, IP or description across projects
    Search {
        term: String,
        /// Projects to search (comma separated)
        #[arg(long, value_delimiter = ',', conflicts_with = "all_projects")]
        projects: Vec<String>,
        /// Search every project the credentials can see
        #[arg(long)]
        all_projects: bool,
        /// Resource kinds to search (comma separated)
        #[arg(long, value_delimiter = ',')]
        kind: Vec<String>,
    },
    /// SSH into an instance (or a member of a MIG) via gcloud
    Ssh {
        name: String,
        #[arg(long, conflicts_with = "region")]
        zone: Option<String>,
        /// Region of a regional managed instance group
        #[arg(long, requires = "mig")]
        region: Option<String>,
        /// Treat NAME as a managed instance group
        #[arg(long)]
        mig: bool,
        /// Tunnel through IAP and remember the preference
        #[arg(long)]
        iap: bool,
        /// Extra arguments passed to ssh
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Manage the location cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Show or change configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    /// Record the location of every instance and MIG in the project
    Warm,
    /// Record every subnet of the project for IP lookups
    Subnets,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Set the default project
    SetProject { project: String },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
    Yaml,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Fast,
    Smart,
    Complete,
}

impl From<ModeArg> for IpLookupMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Fast => IpLookupMode::FastOnly,
            ModeArg::Smart => IpLookupMode::SmartFallback,
            ModeArg::Complete => IpLookupMode::AlwaysComplete,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Option<Level> {
        match self {
            LogLevel::Off => None,
            LogLevel::Error => Some(Level::ERROR),
            LogLevel::Warn => Some(Level::WARN),
            LogLevel::Info => Some(Level::INFO),
            LogLevel::Debug => Some(Level::DEBUG),
            LogLevel::Trace => Some(Level::TRACE),
        }
    }
}

fn setup_logging(level: LogLevel) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let Some(tracing_level) = level.to_tracing_level() else {
        return Ok(None);
    };

    let log_path = get_log_path();

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file {:?}", log_path))?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    tracing_subscriber::fmt()
        .with_max_level(tracing_level)
        .with_writer(non_blocking.with_max_level(tracing_level))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("gcpfind {} started with log level: {:?}", VERSION, level);
    tracing::info!("Log file: {:?}", log_path);

    Ok(Some(guard))
}

fn get_log_path() -> PathBuf {
    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("gcpfind").join("gcpfind.log");
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".gcpfind").join("gcpfind.log");
    }
    PathBuf::from("gcpfind.log")
}

/// Everything a subcommand needs once the project is known
struct Session {
    project: String,
    client: GcpClient,
    cache: Option<Arc<dyn LocationCache>>,
    progress: Progress,
    config: Config,
    cancel: CancellationToken,
}

impl Session {
    fn resolver(&self) -> Resolver {
        Resolver::new(Arc::new(self.client.clone()))
            .with_cache(self.cache.clone())
            .with_progress(self.progress.clone())
            .with_probe_concurrency(self.config.probe_concurrency)
    }

    fn ip_lookup(&self) -> IpLookup {
        IpLookup::new(Arc::new(self.client.clone()))
            .with_cache(self.cache.clone())
            .with_progress(self.progress.clone())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let _log_guard = setup_logging(args.log_level)?;

    let config = Config::load();

    if let Command::Config { action } = &args.command {
        return run_config(action, config, &args);
    }

    let project = config
        .effective_project(args.project.as_deref())
        .ok_or_else(|| {
            anyhow::anyhow!("No GCP project configured. Set GOOGLE_CLOUD_PROJECT or use --project flag")
        })?;
    tracing::info!("Using project: {}", project);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    let cache = config.effective_cache_path(args.no_cache).map(|path| {
        tracing::debug!("Location cache: {:?}", path);
        Arc::new(FileCache::open(&path)) as Arc<dyn LocationCache>
    });

    let progress = if args.quiet {
        Progress::none()
    } else {
        Progress::new(Arc::new(|event: ProgressEvent| eprintln!("{}", event)))
    };

    let ctx = Session {
        client: GcpClient::new(&project).await?,
        project,
        cache,
        progress,
        config,
        cancel,
    };

    match &args.command {
        Command::Instance { name, zone } => {
            let location = ctx
                .resolver()
                .resolve_instance(name, zone.as_deref(), &ctx.cancel)
                .await?;
            render(args.output, &location, || {
                table(
                    &["NAME", "PROJECT", "ZONE", "FOUND VIA"],
                    vec![vec![
                        location.name.clone(),
                        location.project.clone(),
                        location.zone.clone(),
                        via_label(location.via).to_string(),
                    ]],
                )
            })
        }
        Command::Mig { name, zone, region } => {
            let scope = zone
                .clone()
                .map(Scope::Zone)
                .or_else(|| region.clone().map(Scope::Region));
            let found = ctx
                .resolver()
                .resolve_mig_instance(name, scope, &ctx.cancel)
                .await?;
            render(args.output, &found, || {
                table(
                    &["MIG", "PROJECT", "LOCATION", "FOUND VIA", "INSTANCE", "ZONE", "STATUS"],
                    vec![vec![
                        found.mig.name.clone(),
                        found.mig.project.clone(),
                        found.mig.scope.to_string(),
                        via_label(found.mig.via).to_string(),
                        found.instance.name.clone(),
                        found.instance.zone.clone(),
                        found.instance.status.clone(),
                    ]],
                )
            })
        }
        Command::Ip { address, mode } => {
            let mode = mode.map(IpLookupMode::from).unwrap_or(ctx.config.ip_mode);
            let found = ctx.ip_lookup().lookup(address, mode, &ctx.cancel).await?;
            if found.is_empty() {
                eprintln!("No resource in {} uses {}", ctx.project, address);
            }
            render(args.output, &found, || ip_table(&found))
        }
        Command::Search {
            term,
            projects,
            all_projects,
            kind,
        } => run_search(&ctx, args.output, term, projects, *all_projects, kind).await,
        Command::Ssh {
            name,
            zone,
            region,
            mig,
            iap,
            args: extra,
        } => {
            let target = SshTarget {
                name,
                zone: zone.as_deref(),
                region: region.as_deref(),
                mig: *mig,
            };
            run_ssh(&ctx, target, *iap, extra).await
        }
        Command::Cache { action } => {
            let count = match action {
                CacheAction::Warm => ctx.resolver().warm_cache(&ctx.cancel).await?,
                CacheAction::Subnets => ctx.ip_lookup().refresh_subnets(&ctx.cancel).await?,
            };
            if ctx.cache.is_none() {
                eprintln!("Location cache is disabled; nothing stored");
            }
            println!("Cached {} entries for {}", count, ctx.project);
            Ok(())
        }
        Command::Config { .. } => Ok(()),
    }
}

fn run_config(action: &ConfigAction, mut config: Config, args: &Args) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let effective = Config {
                project_id: config.effective_project(args.project.as_deref()),
                cache_path: config.effective_cache_path(args.no_cache),
                ..config
            };
            match args.output {
                OutputFormat::Yaml => print!("{}", serde_yaml::to_string(&effective)?),
                _ => println!("{}", serde_json::to_string_pretty(&effective)?),
            }
            Ok(())
        }
        ConfigAction::SetProject { project } => {
            if !gcpfind::gcp::auth::validate_project_id(project) {
                anyhow::bail!("'{}' is not a valid project ID", project);
            }
            config.project_id = Some(project.clone());
            config.save()?;
            println!("Default project set to {}", project);
            Ok(())
        }
    }
}

async fn run_search(
    ctx: &Session,
    output: OutputFormat,
    term: &str,
    projects: &[String],
    all_projects: bool,
    kinds: &[String],
) -> Result<()> {
    let projects = if all_projects {
        list_project_ids(&ctx.client, &ctx.cancel).await?
    } else {
        ctx.config
            .effective_search_projects(projects, Some(&ctx.project))
    };

    let engine = SearchEngine::new(default_providers(&ctx.client))
        .with_concurrency(ctx.config.search_concurrency)
        .with_progress(ctx.progress.clone());
    let query = SearchQuery::new(term).with_kinds(kinds);

    let outcome = engine
        .search_with_warnings(&projects, &query, &ctx.cancel)
        .await?;

    if !outcome.warnings.is_empty() {
        let failed: std::collections::BTreeSet<&str> =
            outcome.warnings.iter().map(|w| w.project.as_str()).collect();
        eprintln!(
            "{} result(s), {} project(s) had errors:",
            outcome.results.len(),
            failed.len()
        );
        for warning in &outcome.warnings {
            eprintln!("  {} / {}: {:#}", warning.project, warning.kind, warning.error);
        }
    }

    render(output, &outcome, || search_table(&outcome.results))
}

/// What `ssh` was asked to connect to
#[derive(Debug, Clone, Copy)]
struct SshTarget<'a> {
    name: &'a str,
    zone: Option<&'a str>,
    region: Option<&'a str>,
    mig: bool,
}

impl SshTarget<'_> {
    /// Explicit MIG scope; a zone wins over a region
    fn mig_scope(&self) -> Option<Scope> {
        self.zone
            .map(|z| Scope::Zone(z.to_string()))
            .or_else(|| self.region.map(|r| Scope::Region(r.to_string())))
    }
}

async fn run_ssh(ctx: &Session, target: SshTarget<'_>, iap: bool, extra: &[String]) -> Result<()> {
    let resolver = ctx.resolver();
    let name = target.name;
    let (instance, zone, remembered, kind) = if target.mig {
        let found = resolver
            .resolve_mig_instance(name, target.mig_scope(), &ctx.cancel)
            .await?;
        (
            found.instance.name,
            found.instance.zone,
            found.mig.use_iap,
            ResourceKind::Mig,
        )
    } else {
        let found = resolver.resolve_instance(name, target.zone, &ctx.cancel).await?;
        (found.name, found.zone, found.use_iap, ResourceKind::Instance)
    };

    let use_iap = iap || remembered.unwrap_or(false);
    let opts = SshOptions::new(&instance, &zone, &ctx.project)
        .with_iap(use_iap)
        .with_extra_args(extra.to_vec());

    let result = tokio::task::spawn_blocking(move || ssh_to_instance(&opts))
        .await
        .context("SSH task failed")?;

    match result {
        ShellResult::Success => {
            if iap {
                resolver.remember_preference(name, kind, true);
            }
            Ok(())
        }
        ShellResult::Failed(code) => anyhow::bail!("ssh exited with code {}", code),
        ShellResult::Error(message) => anyhow::bail!(message),
    }
}

// =============================================================================
// Output
// =============================================================================

fn render<T: Serialize>(format: OutputFormat, value: &T, table: impl FnOnce() -> String) -> Result<()> {
    match format {
        OutputFormat::Table => print!("{}", table()),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

fn via_label(via: ResolvedVia) -> &'static str {
    match via {
        ResolvedVia::Explicit => "explicit",
        ResolvedVia::Cache => "cache",
        ResolvedVia::Scan => "scan",
        ResolvedVia::RegionProbe => "region probe",
    }
}

/// Left-aligned columns sized to their widest cell
fn table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if let Some(w) = widths.get_mut(i) {
                *w = (*w).max(cell.chars().count());
            }
        }
    }

    let line = |cells: Vec<&str>| {
        let padded: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(c, w)| format!("{:<width$}", c, width = *w))
            .collect();
        format!("{}\n", padded.join("  ").trim_end())
    };

    let mut out = line(headers.to_vec());
    for row in &rows {
        out.push_str(&line(row.iter().map(String::as_str).collect()));
    }
    out
}

fn ip_table(found: &[IpAssociation]) -> String {
    table(
        &["PROJECT", "KIND", "RESOURCE", "LOCATION", "DETAILS"],
        found
            .iter()
            .map(|a| {
                vec![
                    a.project.clone(),
                    a.kind.to_string(),
                    a.resource.clone(),
                    a.location.clone(),
                    a.details.clone(),
                ]
            })
            .collect(),
    )
}

fn search_table(results: &[SearchResult]) -> String {
    table(
        &["PROJECT", "KIND", "NAME", "LOCATION", "DETAIL"],
        results
            .iter()
            .map(|r| {
                let detail: Vec<String> = r.detail.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                vec![
                    r.project.clone(),
                    r.kind.clone(),
                    r.name.clone(),
                    r.location.clone(),
                    detail.join(" "),
                ]
            })
            .collect(),
    )
}
