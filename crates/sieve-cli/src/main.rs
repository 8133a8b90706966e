use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use sieve_client::ReqwestFetcher;
use sieve_core::export::{ExportFormat, ExportOptions, export};
use sieve_core::traits::{NullStore, Storage};
use sieve_core::{EngineConfig, Job, JobStatus, Orchestrator, ProxyPool, Schema, TransformRegistry};
use sieve_db::{Database, DatabaseConfig, SqliteStore};

#[derive(Parser)]
#[command(name = "sieve", version, about = "Schema-driven structured data extraction")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// CSV layout flags shared by `run` and `export`.
#[derive(Args, Debug, Clone)]
struct CsvArgs {
    /// CSV field separator
    #[arg(long, default_value_t = ',')]
    delimiter: char,

    /// Omit the CSV header row
    #[arg(long, default_value_t = false)]
    no_headers: bool,
}

impl CsvArgs {
    fn options(&self, format: ExportFormat) -> ExportOptions {
        let options = ExportOptions::new(format).with_delimiter(self.delimiter);
        if self.no_headers {
            options.without_headers()
        } else {
            options
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a schema file and print the extracted items
    Run {
        /// Path to the schema JSON file
        #[arg(short, long)]
        schema: PathBuf,

        /// Output format: json, csv, xml or sql
        #[arg(short, long, default_value = "json")]
        format: ExportFormat,

        /// Write the export here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        csv: CsvArgs,

        /// Persist the schema and job (uses DATABASE_URL)
        #[arg(long, default_value_t = false)]
        save: bool,

        /// Proxies for schemas with proxy rotation (comma separated)
        #[arg(long = "proxy", env = "SIEVE_PROXIES", value_delimiter = ',')]
        proxies: Vec<String>,

        /// Allow fetching loopback and private network addresses
        #[arg(long, default_value_t = false)]
        allow_private: bool,
    },

    /// Validate a schema file without fetching anything
    Validate {
        #[arg(short, long)]
        schema: PathBuf,
    },

    /// List stored schemas
    Schemas,

    /// List stored jobs, newest first
    Jobs {
        #[arg(long)]
        schema_id: Option<String>,
    },

    /// Export the results of a stored job
    Export {
        #[arg(long)]
        job_id: Uuid,

        #[arg(short, long, default_value = "json")]
        format: ExportFormat,

        /// Only these fields, in this order (comma separated)
        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,

        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        csv: CsvArgs,
    },

    /// Compare the results of two stored jobs
    Diff {
        #[arg(long)]
        old: Uuid,

        #[arg(long)]
        new: Uuid,

        /// Identity field (defaults to the schema's keyField)
        #[arg(long)]
        key_field: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("sieve=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            schema,
            format,
            output,
            csv,
            save,
            proxies,
            allow_private,
        } => {
            let schema = load_schema(&schema)?;
            let job = if save {
                let store = connect_db().await?;
                store
                    .save_schema(&schema)
                    .await
                    .map_err(|e| anyhow::anyhow!(e))?;
                cmd_run(&schema, store, proxies, allow_private).await?
            } else {
                cmd_run(&schema, NullStore, proxies, allow_private).await?
            };

            let payload =
                export(job.results(), &csv.options(format)).map_err(|e| anyhow::anyhow!(e))?;
            write_output(output.as_deref(), &payload)?;

            if job.status() == JobStatus::Failed {
                bail!("Job {} failed: {}", job.id(), job.error().unwrap_or("unknown error"));
            }
        }
        Commands::Validate { schema } => {
            cmd_validate(&schema)?;
        }
        Commands::Schemas => {
            let store = connect_db().await?;
            cmd_schemas(&store).await?;
        }
        Commands::Jobs { schema_id } => {
            let store = connect_db().await?;
            cmd_jobs(&store, schema_id.as_deref()).await?;
        }
        Commands::Export {
            job_id,
            format,
            fields,
            output,
            csv,
        } => {
            let store = connect_db().await?;
            let job = load_job(&store, job_id).await?;
            let mut options = csv.options(format);
            if !fields.is_empty() {
                options = options.with_fields(fields);
            }
            let payload = export(job.results(), &options).map_err(|e| anyhow::anyhow!(e))?;
            write_output(output.as_deref(), &payload)?;
        }
        Commands::Diff {
            old,
            new,
            key_field,
        } => {
            let store = connect_db().await?;
            cmd_diff(&store, old, new, key_field).await?;
        }
    }

    Ok(())
}

/// Open the SQLite store configured by DATABASE_URL.
async fn connect_db() -> Result<SqliteStore> {
    let config = DatabaseConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
    let db = Database::connect(&config)
        .await
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to open database")?;
    db.migrate().await.map_err(|e| anyhow::anyhow!(e))?;
    Ok(db.store())
}

fn load_schema(path: &Path) -> Result<Schema> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read schema file: {}", path.display()))?;
    Schema::from_json(&raw)
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("Invalid schema in {}", path.display()))
}

fn write_output(path: Option<&Path>, payload: &str) -> Result<()> {
    match path {
        Some(path) => {
            std::fs::write(path, payload)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            tracing::info!(path = %path.display(), bytes = payload.len(), "Export written");
        }
        None => println!("{payload}"),
    }
    Ok(())
}

async fn load_job<S: Storage>(store: &S, id: Uuid) -> Result<Job> {
    store
        .get_job(id)
        .await
        .map_err(|e| anyhow::anyhow!(e))?
        .with_context(|| format!("No job with id {id}"))
}

async fn cmd_run<S: Storage + 'static>(
    schema: &Schema,
    store: S,
    proxies: Vec<String>,
    allow_private: bool,
) -> Result<Job> {
    let mut fetcher = ReqwestFetcher::new().context("Failed to create HTTP client")?;
    if allow_private {
        fetcher = fetcher.allow_private_urls();
    }
    let config = EngineConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;

    let shutdown = CancellationToken::new();
    let mut orchestrator = Orchestrator::new(fetcher, store, config)
        .with_registry(TransformRegistry::new())
        .with_shutdown(shutdown.clone());
    if !proxies.is_empty() {
        orchestrator = orchestrator.with_proxy_pool(ProxyPool::new(proxies));
    }

    let handle = orchestrator
        .start(schema)
        .map_err(|e| anyhow::anyhow!(e))
        .context("Schema rejected")?;
    tracing::info!(job_id = %handle.job_id(), schema = %schema.name, "Job submitted");

    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling job");
            ctrl_c.cancel();
        }
    });

    let job = handle.join().await.map_err(|e| anyhow::anyhow!(e))?;
    let stats = job.stats(schema);
    tracing::info!(
        job_id = %job.id(),
        status = %job.status(),
        pages = stats.pages_processed,
        items = stats.total_records,
        errors = job.progress().errors(),
        duration_ms = stats.duration,
        success_rate = format!("{:.1}%", stats.success_rate),
        failed_fields = ?stats.failed_fields,
        "Job done"
    );
    Ok(job)
}

fn cmd_validate(path: &Path) -> Result<()> {
    let schema = load_schema(path)?;
    let compiled = schema
        .compile(&TransformRegistry::new())
        .map_err(|e| anyhow::anyhow!(e))?;
    let pagination = compiled.pagination();
    println!(
        "Schema '{}' is valid: {} field(s), {} source URL(s), pagination: {:?}",
        schema.name,
        compiled.fields.len(),
        schema.source.urls.len(),
        pagination.kind
    );
    Ok(())
}

async fn cmd_schemas<S: Storage>(store: &S) -> Result<()> {
    let schemas = store
        .get_all_schemas()
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    if schemas.is_empty() {
        println!("No schemas stored");
        return Ok(());
    }
    for schema in &schemas {
        println!(
            "  {} — {} (v{}, {} field(s), updated {})",
            schema.id,
            schema.name,
            schema.version,
            schema.fields.len(),
            schema.updated_at.format("%Y-%m-%d %H:%M:%S UTC"),
        );
    }
    println!("\nTotal: {} schemas", schemas.len());
    Ok(())
}

async fn cmd_jobs<S: Storage>(store: &S, schema_id: Option<&str>) -> Result<()> {
    let jobs = store
        .get_jobs(schema_id)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    if jobs.is_empty() {
        println!("No jobs found");
        return Ok(());
    }
    for job in &jobs {
        let progress = job.progress();
        println!(
            "  [{}] {} — schema {} ({} page(s), {} item(s), {} error(s), created {})",
            job.status(),
            job.id(),
            job.schema_id(),
            progress.pages_processed(),
            progress.items_extracted(),
            progress.errors(),
            job.created_at().format("%Y-%m-%d %H:%M:%S UTC"),
        );
    }
    println!("\nTotal: {} jobs", jobs.len());
    Ok(())
}

async fn cmd_diff<S: Storage>(
    store: &S,
    old: Uuid,
    new: Uuid,
    key_field: Option<String>,
) -> Result<()> {
    let old_job = load_job(store, old).await?;
    let new_job = load_job(store, new).await?;
    if old_job.schema_id() != new_job.schema_id() {
        tracing::warn!(
            old = %old_job.schema_id(),
            new = %new_job.schema_id(),
            "Comparing jobs of different schemas"
        );
    }

    let key_field = match key_field {
        Some(k) => Some(k),
        None => store
            .get_schema(new_job.schema_id())
            .await
            .map_err(|e| anyhow::anyhow!(e))?
            .and_then(|s| s.key_field),
    };

    let changes = sieve_core::diff(old_job.results(), new_job.results(), key_field.as_deref());
    tracing::info!(
        added = changes.added.len(),
        modified = changes.modified.len(),
        removed = changes.removed.len(),
        unchanged = changes.unchanged.len(),
        "Diff complete"
    );
    println!("{}", serde_json::to_string_pretty(&changes)?);
    Ok(())
}
