//! murmur worker and administration binary.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use futures::StreamExt;
use murmur_core::config::AppConfig;
use murmur_core::{Bucket, JobId, JobPayload, JobPriority, JobStatus, ObjectId};
use murmur_worker::handlers::VerifyHandler;
use murmur_worker::{AppContext, JobQuery, StoreRequest};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// murmur - encrypted media store and job runner
#[derive(Parser)]
#[command(name = "murmurd")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "MURMUR_CONFIG", default_value = "config/murmur.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the stale-lease reaper and the worker pool until Ctrl-C
    Run,
    /// Release stale jobs once and exit
    Reap,
    /// Job ledger commands
    Jobs {
        #[command(subcommand)]
        command: JobCommands,
    },
    /// Key vault commands
    Keys {
        #[command(subcommand)]
        command: KeyCommands,
    },
    /// Stored object commands
    Objects {
        #[command(subcommand)]
        command: ObjectCommands,
    },
}

#[derive(Subcommand)]
enum JobCommands {
    /// List jobs, newest first
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        owner: Option<String>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long = "type")]
        job_type: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
        /// Cursor returned by a previous page
        #[arg(long)]
        cursor: Option<String>,
    },
    /// Show one job
    Get { job_id: String },
    /// Queue a new job
    Create {
        #[arg(long = "type")]
        job_type: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        object: Option<String>,
        #[arg(long, default_value = "normal")]
        priority: String,
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// Cancel a pending or processing job
    Cancel { job_id: String },
    /// Requeue a failed job
    Retry { job_id: String },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// List key names in the vault
    List,
    /// Store a new version of a key
    Rotate { name: String },
}

#[derive(Args)]
struct PutArgs {
    /// File to upload
    path: PathBuf,
    #[arg(long)]
    bucket: String,
    #[arg(long)]
    user: String,
    /// Object name, defaults to the file name
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    content_type: Option<String>,
    #[arg(long)]
    encrypt: Option<bool>,
    #[arg(long)]
    compress: bool,
}

#[derive(Subcommand)]
enum ObjectCommands {
    /// Upload a file
    Put(PutArgs),
    /// Download an object, verifying it on the way
    Get {
        object_id: String,
        /// Output file
        #[arg(long)]
        out: PathBuf,
        /// Write the stored bytes without decrypting
        #[arg(long)]
        raw: bool,
    },
    /// Show object metadata
    Info { object_id: String },
    /// List objects
    List {
        #[arg(long)]
        bucket: Option<String>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Delete an object with its keys and jobs
    Delete { object_id: String },
    /// Grant a user access to an encrypted object
    Share { object_id: String, user: String },
    /// Revoke a user's access
    Revoke { object_id: String, user: String },
    /// Re-wrap an object's data key under the current key versions
    Rewrap { object_id: String },
    /// Delete blobs in a bucket that no object record points at
    Sweep {
        #[arg(long)]
        bucket: String,
        /// Leave blobs younger than this alone
        #[arg(long, default_value_t = 3600)]
        grace_secs: i64,
        /// Only report what would be deleted
        #[arg(long)]
        dry_run: bool,
    },
}

fn load_config(path: &Path) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if path.exists() {
        tracing::debug!(config_path = %path.display(), "loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!(config_path = %path.display(), "no config file, using defaults and environment");
    }
    figment
        .merge(Env::prefixed("MURMUR_").split("__"))
        .extract()
        .context("failed to load configuration")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_job_id(s: &str) -> Result<JobId> {
    JobId::parse(s).with_context(|| format!("invalid job id {s}"))
}

fn parse_object_id(s: &str) -> Result<ObjectId> {
    ObjectId::parse(s).with_context(|| format!("invalid object id {s}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(&cli.config)?;
    let ctx = AppContext::from_config(config).await?;

    match cli.command {
        Commands::Run => run(ctx).await,
        Commands::Reap => {
            let outcome = ctx.reaper().run_once().await?;
            println!(
                "requeued {}, failed {}, errors {}",
                outcome.requeued, outcome.failed, outcome.errors
            );
            Ok(())
        }
        Commands::Jobs { command } => jobs(&ctx, command).await,
        Commands::Keys { command } => keys(&ctx, command).await,
        Commands::Objects { command } => objects(&ctx, command).await,
    }
}

async fn run(ctx: AppContext) -> Result<()> {
    tracing::info!("murmur v{}", env!("CARGO_PKG_VERSION"));
    let shutdown = CancellationToken::new();
    let reaper = ctx.reaper().spawn(shutdown.clone());
    let pool = Arc::new(ctx.worker_pool(Arc::new(VerifyHandler)));
    let workers = tokio::spawn(pool.run(shutdown.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("shutdown requested, waiting for jobs in flight");
    shutdown.cancel();

    workers.await.context("worker pool task failed")?;
    reaper.await.context("reaper task failed")?;
    Ok(())
}

async fn jobs(ctx: &AppContext, command: JobCommands) -> Result<()> {
    match command {
        JobCommands::List {
            status,
            owner,
            user,
            job_type,
            limit,
            cursor,
        } => {
            let query = JobQuery {
                status: status
                    .map(|s| s.parse::<JobStatus>())
                    .transpose()
                    .context("invalid --status")?,
                owner_lease_id: owner,
                priority: None,
                job_type,
                user_id: user,
            };
            let page = ctx
                .ledger
                .list_jobs(&query, cursor.as_deref(), limit)
                .await?;
            print_json(&page.jobs)?;
            if let Some(next) = page.next_cursor {
                eprintln!("next cursor: {next}");
            }
        }
        JobCommands::Get { job_id } => {
            print_json(&ctx.ledger.get_job(parse_job_id(&job_id)?).await?)?;
        }
        JobCommands::Create {
            job_type,
            user,
            object,
            priority,
            max_retries,
        } => {
            let mut payload = JobPayload::new(job_type, user);
            if let Some(object) = object {
                payload = payload.with_object(parse_object_id(&object)?);
            }
            let priority: JobPriority = priority.parse().context("invalid --priority")?;
            print_json(&ctx.ledger.create_job(payload, priority, max_retries).await?)?;
        }
        JobCommands::Cancel { job_id } => {
            print_json(&ctx.ledger.cancel_job(parse_job_id(&job_id)?).await?)?;
        }
        JobCommands::Retry { job_id } => {
            print_json(&ctx.ledger.retry_job(parse_job_id(&job_id)?).await?)?;
        }
    }
    Ok(())
}

async fn keys(ctx: &AppContext, command: KeyCommands) -> Result<()> {
    match command {
        KeyCommands::List => {
            for name in ctx.keys.list_keys().await? {
                println!("{name}");
            }
        }
        KeyCommands::Rotate { name } => {
            let key = ctx.keys.rotate_key(&name).await?;
            println!("{} is now at version {}", key.name(), key.version());
        }
    }
    Ok(())
}

async fn objects(ctx: &AppContext, command: ObjectCommands) -> Result<()> {
    match command {
        ObjectCommands::Put(args) => {
            let file = tokio::fs::File::open(&args.path)
                .await
                .with_context(|| format!("failed to open {}", args.path.display()))?;
            let size = file.metadata().await?.len();
            let name = match args.name {
                Some(name) => name,
                None => args
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .context("path has no file name, pass --name")?,
            };
            let mut request = StoreRequest::new(args.user, name, Bucket::new(args.bucket)?)
                .with_declared_size(size)
                .with_compression(args.compress);
            if let Some(content_type) = args.content_type {
                request = request.with_content_type(content_type);
            }
            if let Some(encrypt) = args.encrypt {
                request = request.with_encryption(encrypt);
            }
            let info = ctx.content.store(request, ReaderStream::new(file)).await?;
            print_json(&info)?;
        }
        ObjectCommands::Get {
            object_id,
            out,
            raw,
        } => {
            let (info, mut stream) = ctx
                .content
                .retrieve(parse_object_id(&object_id)?, !raw)
                .await?;
            let partial = out.with_extension("partial");
            let mut file = tokio::fs::File::create(&partial)
                .await
                .with_context(|| format!("failed to create {}", partial.display()))?;
            let mut written = 0u64;
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        drop(file);
                        let _ = tokio::fs::remove_file(&partial).await;
                        return Err(e).context("object failed verification");
                    }
                };
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            tokio::fs::rename(&partial, &out).await?;
            eprintln!("wrote {written} bytes of {} to {}", info.name, out.display());
        }
        ObjectCommands::Info { object_id } => {
            match ctx.content.get_info(parse_object_id(&object_id)?).await? {
                Some(info) => print_json(&info)?,
                None => anyhow::bail!("object {object_id} not found"),
            }
        }
        ObjectCommands::List {
            bucket,
            user,
            limit,
        } => {
            let bucket = bucket.map(Bucket::new).transpose()?;
            let objects = ctx
                .content
                .list_objects(bucket.as_ref(), user.as_deref(), limit)
                .await?;
            print_json(&objects)?;
        }
        ObjectCommands::Delete { object_id } => {
            if ctx.content.delete(parse_object_id(&object_id)?).await? {
                println!("deleted {object_id}");
            } else {
                println!("{object_id} did not exist");
            }
        }
        ObjectCommands::Share { object_id, user } => {
            ctx.file_keys
                .share(parse_object_id(&object_id)?, &user)
                .await?;
            println!("shared {object_id} with {user}");
        }
        ObjectCommands::Revoke { object_id, user } => {
            if ctx
                .file_keys
                .revoke(parse_object_id(&object_id)?, &user)
                .await?
            {
                println!("revoked {user} from {object_id}");
            } else {
                println!("{user} had no share of {object_id}");
            }
        }
        ObjectCommands::Rewrap { object_id } => {
            let outcome = ctx
                .file_keys
                .rewrap(parse_object_id(&object_id)?)
                .await?;
            println!(
                "re-wrapped {object_id} under key version {} ({} shares)",
                outcome.kek_version, outcome.shares
            );
        }
        ObjectCommands::Sweep {
            bucket,
            grace_secs,
            dry_run,
        } => {
            let outcome = ctx
                .content
                .sweep_orphans(
                    &Bucket::new(bucket)?,
                    time::Duration::seconds(grace_secs.max(0)),
                    dry_run,
                )
                .await?;
            println!(
                "scanned {} blobs, {} orphaned, {} deleted, {} errors",
                outcome.scanned, outcome.orphaned, outcome.deleted, outcome.errors
            );
        }
    }
    Ok(())
}
