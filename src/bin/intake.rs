//! intake CLI — operator interface to the intake engine.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use intake::config::Config;
use intake::db::Db;
use intake::engine::{Engine, EngineConfig};
use intake::handler::HandlerRegistry;
use intake::model::{ArtifactId, ArtifactType, JobId, NewArtifact, NewJob};
use intake::registry::StageRegistry;
use intake::status::JobStatusView;
use intake::telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "intake", about = "Evidence intake pipeline engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the processing engine daemon
    Serve {
        /// Directory containing pipeline TOML descriptors
        #[arg(long, default_value = "pipelines")]
        pipelines: PathBuf,
        /// Concurrent workers per artifact-type queue
        #[arg(long, default_value_t = 2)]
        workers: usize,
        /// Handler failures tolerated before dead-lettering
        #[arg(long, default_value_t = 3)]
        max_retries: u32,
    },
    /// Job operations
    Job {
        #[command(subcommand)]
        action: JobAction,
    },
    /// Dead-letter operations
    Dlq {
        #[command(subcommand)]
        action: DlqAction,
    },
}

#[derive(Subcommand)]
enum JobAction {
    /// Submit a new job
    Submit {
        /// Artifacts as `<type>=<filename>` (repeatable)
        #[arg(long = "artifact", required = true)]
        artifacts: Vec<String>,
        /// Case label grouping related submissions
        #[arg(long = "case")]
        case_label: Option<String>,
        /// Parent job ID (full UUID or prefix)
        #[arg(long)]
        parent: Option<String>,
        /// Source language hint passed to every handler
        #[arg(long)]
        lang: Option<String>,
    },
    /// Show aggregate and per-artifact status for a job
    Status {
        /// Job ID (full UUID or prefix)
        id: String,
    },
    /// List jobs
    List {
        /// Filter by case label
        #[arg(long = "case")]
        case_label: Option<String>,
        /// Include archived jobs
        #[arg(long)]
        all: bool,
        /// Maximum jobs to show
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Hide a job from listings
    Archive {
        /// Job ID (full UUID or prefix)
        id: String,
    },
    /// Mark a parked artifact's shared downstream stage as done
    CompleteDownstream {
        /// Artifact ID (full UUID)
        artifact_id: String,
    },
}

#[derive(Subcommand)]
enum DlqAction {
    /// List dead letters for a queue
    List {
        /// Queue name (document, audio, video, cdr)
        queue: String,
    },
    /// Re-enqueue a dead letter with a fresh retry budget
    Replay {
        queue: String,
        seq: i64,
    },
    /// Drop a dead letter for good
    Purge {
        queue: String,
        seq: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            pipelines,
            workers,
            max_retries,
        } => cmd_serve(pipelines, workers, max_retries).await,
        Command::Job { action } => {
            let engine = connect_engine().await?;
            match action {
                JobAction::Submit {
                    artifacts,
                    case_label,
                    parent,
                    lang,
                } => cmd_job_submit(&engine, artifacts, case_label, parent, lang).await,
                JobAction::Status { id } => cmd_job_status(&engine, id).await,
                JobAction::List {
                    case_label,
                    all,
                    limit,
                } => cmd_job_list(&engine, case_label, all, limit).await,
                JobAction::Archive { id } => cmd_job_archive(&engine, id).await,
                JobAction::CompleteDownstream { artifact_id } => {
                    let id = ArtifactId(uuid::Uuid::parse_str(&artifact_id)?);
                    engine.complete_downstream(id).await?;
                    println!("Artifact {artifact_id} completed.");
                    Ok(())
                }
            }
        }
        Command::Dlq { action } => {
            let engine = connect_engine().await?;
            match action {
                DlqAction::List { queue } => cmd_dlq_list(&engine, queue).await,
                DlqAction::Replay { queue, seq } => {
                    let entry = engine.replay_dead_letter(&queue, seq).await?;
                    println!("Replayed: artifact {} back on '{}'", entry.artifact_id.0, queue);
                    Ok(())
                }
                DlqAction::Purge { queue, seq } => {
                    engine.purge_dead_letter(&queue, seq).await?;
                    println!("Purged dead letter {seq} from '{queue}'.");
                    Ok(())
                }
            }
        }
    }
}

/// Engine wiring without background tasks, for one-shot commands.
async fn connect_engine() -> anyhow::Result<Engine> {
    let config = Config::from_env()?;
    let db = Arc::new(Db::open(&config.db_path).await?);
    Ok(Engine::connect(
        db,
        StageRegistry::builtin(),
        HandlerRegistry::empty(),
        EngineConfig::default(),
    ))
}

async fn cmd_serve(pipelines: PathBuf, workers: usize, max_retries: u32) -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "intake".to_string(),
        log_filter: config.log_level.clone(),
    })?;

    let db = Arc::new(Db::open(&config.db_path).await?);
    let registry = if pipelines.is_dir() {
        StageRegistry::load_from_dir(&pipelines)?
    } else {
        StageRegistry::builtin()
    };
    let handlers = HandlerRegistry::from_commands(&registry);

    let engine_config = EngineConfig {
        workers_per_type: workers,
        max_retries,
        ..EngineConfig::default()
    };
    let engine = Engine::start(db, registry, handlers, engine_config);

    tokio::signal::ctrl_c().await.ok();
    engine.shutdown().await;
    Ok(())
}

async fn cmd_job_submit(
    engine: &Engine,
    artifacts: Vec<String>,
    case_label: Option<String>,
    parent: Option<String>,
    lang: Option<String>,
) -> anyhow::Result<()> {
    let mut new = NewJob::new();
    if let Some(label) = case_label {
        new = new.case_label(label);
    }
    if let Some(parent) = parent {
        let parent_id = resolve_job_id(engine, &parent).await?;
        new = new.parent(parent_id);
    }

    for spec in &artifacts {
        let (ty, filename) = spec
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("artifact must be <type>=<filename>, got '{spec}'"))?;
        let artifact_type: ArtifactType = ty.parse()?;
        let mut artifact = NewArtifact::new(filename, artifact_type);
        if let Some(ref lang) = lang {
            artifact = artifact.options(serde_json::json!({ "source_language": lang }));
        }
        new = new.artifact(artifact);
    }

    let job_id = engine.submit(new).await?;
    println!("Submitted: {} ({} artifact(s))", job_id.0, artifacts.len());
    Ok(())
}

async fn cmd_job_status(engine: &Engine, id_str: String) -> anyhow::Result<()> {
    let job_id = resolve_job_id(engine, &id_str).await?;
    let view = engine.job_status(job_id).await?;
    print_job_status(&view);
    Ok(())
}

fn print_job_status(view: &JobStatusView) {
    println!("Job:        {}", view.job_id.0);
    if let Some(ref case) = view.case_label {
        println!("Case:       {case}");
    }
    println!("Status:     {}", view.status);
    println!(
        "Progress:   {:.1}% ({}/{} files)",
        view.progress_percentage, view.processed_files, view.total_files
    );
    println!("Created:    {}", view.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(completed) = view.completed_at {
        println!("Completed:  {}", completed.format("%Y-%m-%d %H:%M:%S"));
    }

    println!();
    println!(
        "{:<8}  {:<10}  {:<22}  {:<20}  {:>6}  ERROR",
        "ID", "TYPE", "FILENAME", "STAGE", "PROG"
    );
    println!("{}", "-".repeat(100));
    for artifact in &view.artifacts {
        let filename = truncate_cell(&artifact.filename, 22);
        println!(
            "{:<8}  {:<10}  {:<22}  {:<20}  {:>5.0}%  {}",
            artifact.artifact_id,
            artifact.artifact_type,
            filename,
            artifact.current_stage.as_deref().unwrap_or("-"),
            artifact.progress_percentage,
            artifact.error_message.as_deref().unwrap_or("-"),
        );
    }
}

async fn cmd_job_list(
    engine: &Engine,
    case_label: Option<String>,
    all: bool,
    limit: u32,
) -> anyhow::Result<()> {
    let jobs = engine.list_jobs(case_label.as_deref(), all, limit).await?;

    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<10}  {:<6}  {:<20}  CREATED",
        "ID", "STATUS", "FILES", "CASE"
    );
    println!("{}", "-".repeat(70));
    for job in &jobs {
        let case = job.case_label.as_deref().unwrap_or("-");
        let case_display = truncate_cell(case, 20);
        println!(
            "{:<8}  {:<10}  {:<6}  {:<20}  {}",
            job.id,
            job.status,
            job.total_files,
            case_display,
            job.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!("\n{} job(s)", jobs.len());
    Ok(())
}

async fn cmd_job_archive(engine: &Engine, id_str: String) -> anyhow::Result<()> {
    let job_id = resolve_job_id(engine, &id_str).await?;
    engine.archive_job(job_id).await?;
    println!("Archived: {}", job_id.0);
    Ok(())
}

async fn cmd_dlq_list(engine: &Engine, queue: String) -> anyhow::Result<()> {
    let dead = engine.dead_letters(&queue).await?;

    if dead.is_empty() {
        println!("No dead letters in '{queue}'.");
        return Ok(());
    }

    println!(
        "{:<6}  {:<8}  {:<8}  {:<20}  ERROR",
        "SEQ", "ARTIFACT", "FAILS", "LAST FAILURE"
    );
    println!("{}", "-".repeat(90));
    for letter in &dead {
        println!(
            "{:<6}  {:<8}  {:<8}  {:<20}  {}",
            letter.seq,
            letter.entry.artifact_id,
            letter.failure_count,
            letter.last_failed_at.format("%Y-%m-%d %H:%M:%S"),
            letter.last_error,
        );
    }
    println!("\n{} dead letter(s)", dead.len());
    Ok(())
}

/// Truncate a table cell to at most `max` characters. Filenames and case
/// labels are operator input and not always ASCII; slicing by byte index
/// would panic mid code point.
fn truncate_cell(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Accept a full UUID or a unique prefix of one.
async fn resolve_job_id(engine: &Engine, id_str: &str) -> anyhow::Result<JobId> {
    if id_str.len() >= 36 {
        return Ok(JobId(uuid::Uuid::parse_str(id_str)?));
    }

    let jobs = engine.list_jobs(None, true, 200).await?;
    let matches: Vec<_> = jobs
        .iter()
        .filter(|job| job.id.0.to_string().starts_with(id_str))
        .collect();
    match matches.len() {
        0 => anyhow::bail!("no job matching prefix '{id_str}'"),
        1 => Ok(matches[0].id),
        n => anyhow::bail!("{n} jobs match prefix '{id_str}' — be more specific"),
    }
}
