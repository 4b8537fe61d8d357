use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use search_reindex::config::{AppConfig, CliConfig, FileConfig};
use search_reindex::metrics;
use search_reindex::reindex::{
    JobOrchestrator, JobStatus, ReindexJobRecord, ReindexJobStore, ReindexNotifier,
    ReindexWorker, ResourceRateThrottle, SqliteReindexJobStore, SystemClock,
};
use search_reindex::resource_store::{SearchParamDefinition, SqliteResourceStore};
use std::collections::BTreeSet;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn parse_path(s: &str) -> Result<PathBuf> {
    let original_path = PathBuf::from(s);
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

fn parse_status(s: &str) -> Result<JobStatus> {
    JobStatus::from_db_str(&s.to_ascii_uppercase())
        .with_context(|| format!("Unknown job status: {}", s))
}

#[derive(Parser, Debug)]
#[command(version, about = "Background search reindexing worker")]
struct CliArgs {
    /// Directory holding reindex_jobs.db and resources.db.
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// Path to a TOML config file. Its values override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Default worker concurrency for new jobs.
    #[clap(long)]
    pub max_concurrency: Option<u32>,

    /// Default page size for new jobs.
    #[clap(long)]
    pub max_resources_per_page: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Creates a queued reindex job and prints its id.
    Create {
        /// Resource types to reindex.
        #[clap(long = "resource-type", required = true)]
        resource_types: Vec<String>,

        /// Search parameter URLs to mark searchable once done. Defaults to
        /// every non-searchable parameter of the given types.
        #[clap(long = "param")]
        params: Vec<String>,
    },

    /// Runs queued and orphaned jobs until interrupted.
    Run {
        /// Stop once no runnable job remains.
        #[clap(long)]
        once: bool,

        /// Print the metrics exposition on exit.
        #[clap(long)]
        print_metrics: bool,
    },

    /// Prints a job record as JSON.
    Status { job_id: String },

    /// Lists jobs.
    List {
        #[clap(long, value_parser = parse_status)]
        status: Option<JobStatus>,

        #[clap(long, default_value_t = 50)]
        limit: usize,
    },

    /// Adds or redefines a search parameter.
    AddParam {
        #[clap(long)]
        url: String,
        #[clap(long)]
        resource_type: String,
        #[clap(long)]
        code: String,
        /// JSON pointer into the resource payload, e.g. /name/0/family
        #[clap(long)]
        expression: String,
    },

    /// Loads resources of one type from a JSON-lines file. Each object must
    /// carry a string "id".
    Load {
        #[clap(long)]
        resource_type: String,
        #[clap(value_parser = parse_path)]
        file: PathBuf,
    },
}

struct Stores {
    jobs: Arc<SqliteReindexJobStore>,
    resources: Arc<SqliteResourceStore>,
}

fn open_stores(config: &AppConfig) -> Result<Stores> {
    info!("Opening job database at {:?}...", config.jobs_db_path());
    let jobs = Arc::new(SqliteReindexJobStore::new(config.jobs_db_path())?);
    info!("Opening resource database at {:?}...", config.resources_db_path());
    let resources = Arc::new(SqliteResourceStore::new(config.resources_db_path())?);
    Ok(Stores { jobs, resources })
}

fn create_job(
    config: &AppConfig,
    stores: &Stores,
    resource_types: Vec<String>,
    params: Vec<String>,
) -> Result<String> {
    let types: Vec<String> = resource_types
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let param_hashes = stores.resources.current_param_hashes(&types)?;
    let param_urls: BTreeSet<String> = if params.is_empty() {
        stores.resources.pending_param_urls(&types)?
    } else {
        params.into_iter().collect()
    };

    let job_id = uuid::Uuid::new_v4().to_string();
    let record = ReindexJobRecord::new(
        job_id.clone(),
        param_hashes,
        param_urls,
        config.reindex.job_config(),
        chrono::Utc::now(),
    );
    stores.jobs.create_job(&record)?;
    info!(
        "Created reindex job {} for {} resource types",
        job_id,
        types.len()
    );
    Ok(job_id)
}

async fn run_worker(config: &AppConfig, stores: Stores, once: bool) -> Result<()> {
    let throttle = Arc::new(ResourceRateThrottle::new(config.throttle.throttle_config()));
    let orchestrator = Arc::new(JobOrchestrator::new(
        stores.jobs,
        stores.resources.clone(),
        stores.resources,
        throttle,
        Arc::new(SystemClock),
        ReindexNotifier::new(),
        config.reindex.orchestrator_settings(),
    ));
    let worker = ReindexWorker::new(orchestrator, config.reindex.worker_idle_interval());

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutdown requested");
        signal_token.cancel();
    });

    if once {
        loop {
            let ran = worker.run_once(&shutdown).await?;
            if ran == 0 || shutdown.is_cancelled() {
                break;
            }
        }
    } else {
        worker.run(shutdown).await;
    }
    Ok(())
}

fn load_resources(stores: &Stores, resource_type: &str, file: &Path) -> Result<usize> {
    let reader = std::io::BufReader::new(
        std::fs::File::open(file).with_context(|| format!("Failed to open {:?}", file))?,
    );
    let mut loaded = 0;
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let payload: serde_json::Value = serde_json::from_str(&line)
            .with_context(|| format!("Invalid JSON on line {}", line_no + 1))?;
        let Some(id) = payload.get("id").and_then(|v| v.as_str()) else {
            bail!("Resource on line {} has no string \"id\"", line_no + 1);
        };
        stores.resources.put_resource(resource_type, id, &payload)?;
        loaded += 1;
    }
    Ok(loaded)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    let file_config = match &cli_args.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => None,
    };
    let cli_config = CliConfig {
        db_dir: cli_args.db_dir.clone(),
        max_concurrency: cli_args.max_concurrency,
        max_resources_per_page: cli_args.max_resources_per_page,
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;

    metrics::init_metrics();
    let stores = open_stores(&config)?;

    match cli_args.command {
        Command::Create {
            resource_types,
            params,
        } => {
            let job_id = create_job(&config, &stores, resource_types, params)?;
            println!("{}", job_id);
        }
        Command::Run {
            once,
            print_metrics,
        } => {
            run_worker(&config, stores, once).await?;
            if print_metrics {
                print!("{}", metrics::render());
            }
        }
        Command::Status { job_id } => {
            let stored = stores
                .jobs
                .get_job(&job_id)?
                .with_context(|| format!("No job with id {}", job_id))?;
            println!("{}", serde_json::to_string_pretty(&stored.record)?);
        }
        Command::List { status, limit } => {
            for job in stores.jobs.list_jobs(status, limit)? {
                println!("{}", serde_json::to_string(&job.record.summary())?);
            }
        }
        Command::AddParam {
            url,
            resource_type,
            code,
            expression,
        } => {
            stores.resources.put_search_param(&SearchParamDefinition {
                url,
                resource_type,
                code,
                expression,
            })?;
        }
        Command::Load {
            resource_type,
            file,
        } => {
            let loaded = load_resources(&stores, &resource_type, &file)?;
            info!("Loaded {} {} resources", loaded, resource_type);
        }
    }

    Ok(())
}
