use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand};
use paperbatch_contracts::events::EventWriter;
use paperbatch_contracts::jobs::{JobLedger, JobRecord};
use paperbatch_contracts::models::{ModelRegistry, DEFAULT_IMAGE_MODEL, DEFAULT_TEXT_MODEL};
use paperbatch_engine::{
    backend_for_model, normalize_to_a4, zip_directory, BatchEngine, CheckOutcome,
};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(
    name = "paperbatch",
    version,
    about = "Batch generator for junk journal background papers"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Invent a theme, write prompts, and submit a new batch job
    Submit(SubmitArgs),
    /// Query a submitted job and download its images when ready
    Check(CheckArgs),
    /// Show all known jobs, newest first
    List(ListArgs),
    /// Normalize images to print-ready A4 at 300dpi
    Print(PrintArgs),
    /// Bundle a job's images into a zip file
    Archive(ArchiveArgs),
}

#[derive(Debug, Parser)]
struct SubmitArgs {
    /// Optional theme direction; prompted interactively when omitted
    #[arg(long)]
    hint: Option<String>,
    #[arg(long, default_value_t = 20)]
    count: usize,
    #[arg(long, default_value = "collections")]
    out: PathBuf,
    #[arg(long, default_value = DEFAULT_TEXT_MODEL)]
    text_model: String,
    #[arg(long, default_value = DEFAULT_IMAGE_MODEL)]
    image_model: String,
}

#[derive(Debug, Parser)]
struct CheckArgs {
    /// Job to check; defaults to the most recently submitted one
    #[arg(long)]
    job: Option<String>,
    #[arg(long, default_value = "collections")]
    out: PathBuf,
    #[arg(long, default_value = DEFAULT_TEXT_MODEL)]
    text_model: String,
    #[arg(long, default_value = DEFAULT_IMAGE_MODEL)]
    image_model: String,
}

#[derive(Debug, Parser)]
struct ListArgs {
    #[arg(long, default_value = "collections")]
    out: PathBuf,
}

#[derive(Debug, Parser)]
struct PrintArgs {
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    #[arg(long, default_value = "a4_prints")]
    dest: PathBuf,
    /// Also bundle the normalized pages into this zip file
    #[arg(long)]
    zip: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ArchiveArgs {
    /// Job to archive; defaults to the most recently submitted one
    #[arg(long)]
    job: Option<String>,
    #[arg(long, default_value = "collections")]
    out: PathBuf,
    /// Destination zip; defaults to images_<job>.zip
    #[arg(long)]
    dest: Option<PathBuf>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("paperbatch error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Submit(args) => run_submit(args),
        Command::Check(args) => run_check(args),
        Command::List(args) => run_list(args),
        Command::Print(args) => run_print(args),
        Command::Archive(args) => run_archive(args),
    }
}

fn run_submit(args: SubmitArgs) -> Result<i32> {
    if args.count == 0 {
        bail!("--count must be at least 1");
    }
    let registry = ModelRegistry::default();
    ensure_capability(&registry, &args.text_model, "text")?;
    ensure_capability(&registry, &args.image_model, "image")?;

    let hint = match args.hint {
        Some(hint) => Some(hint),
        None => prompt_for_hint()?,
    };

    let backend = backend_for_model(&registry, &args.image_model, &args.out)?;
    let engine = BatchEngine::new(&args.out, backend, args.text_model, args.image_model)?;

    println!("Developing a collection theme...");
    let record = engine.start_collection(hint.as_deref(), args.count)?;

    println!("Theme: {}", record.theme);
    println!(
        "Submitted {} prompts as batch job {}",
        record.prompts.len(),
        record.job_id
    );
    println!("Images are generating remotely. Run `paperbatch check` to poll and download.");
    Ok(0)
}

fn run_check(args: CheckArgs) -> Result<i32> {
    let ledger = JobLedger::new(&args.out);
    let mut record = resolve_record(&ledger, args.job.as_deref(), &args.out)?;
    println!("Checking job {}...", record.job_id);

    let registry = ModelRegistry::default();
    let backend = backend_for_model(&registry, &args.image_model, &args.out)?;
    let engine = BatchEngine::new(&args.out, backend, args.text_model, args.image_model)?;

    match engine.check_job(&mut record)? {
        CheckOutcome::Running { state } => {
            println!("Status: {state}");
            println!("The job is still running. Check again later.");
            Ok(0)
        }
        CheckOutcome::Failed { error } => {
            println!("Status: JOB_STATE_FAILED");
            println!("Job failed: {error}");
            Ok(1)
        }
        CheckOutcome::NoImages { discarded } => {
            println!("Status: JOB_STATE_SUCCEEDED");
            println!("No images in content ({discarded} result lines discarded).");
            Ok(0)
        }
        CheckOutcome::Completed { images, discarded } => {
            println!("Status: JOB_STATE_SUCCEEDED");
            let dir = engine.job_image_dir(&record.job_id)?;
            println!("Saved {} images to {}", images.len(), dir.display());
            if discarded > 0 {
                println!("Discarded {discarded} malformed result lines.");
            }
            Ok(0)
        }
    }
}

fn run_list(args: ListArgs) -> Result<i32> {
    let ledger = JobLedger::new(&args.out);
    let records = ledger.list();
    if records.is_empty() {
        println!("No jobs found in {}.", args.out.display());
        return Ok(0);
    }
    for record in records {
        let images = record
            .image_count
            .map(|count| format!("{count} images"))
            .unwrap_or_else(|| "no images yet".to_string());
        println!(
            "[{}] {} - {} ({}, {})",
            record.status,
            record.theme,
            record.job_id,
            local_time(record.timestamp),
            images
        );
    }
    Ok(0)
}

fn run_print(args: PrintArgs) -> Result<i32> {
    fs::create_dir_all(&args.dest)
        .with_context(|| format!("failed creating {}", args.dest.display()))?;

    for input in &args.inputs {
        let image = image::open(input)
            .with_context(|| format!("failed opening {}", input.display()))?;
        let normalized = normalize_to_a4(&image);
        let stem = input
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("image");
        let path = args.dest.join(format!("A4_{stem}.png"));
        normalized
            .save(&path)
            .with_context(|| format!("failed saving {}", path.display()))?;
        println!("Normalized {} -> {}", input.display(), path.display());
    }

    if let Some(zip_path) = args.zip {
        let cursor = zip_directory(&args.dest)?;
        fs::write(&zip_path, cursor.into_inner())
            .with_context(|| format!("failed writing {}", zip_path.display()))?;
        println!("Bundled print-ready pages into {}", zip_path.display());
    }
    Ok(0)
}

fn run_archive(args: ArchiveArgs) -> Result<i32> {
    let ledger = JobLedger::new(&args.out);
    let record = resolve_record(&ledger, args.job.as_deref(), &args.out)?;
    let safe_id = record.safe_id()?;
    let dir = args.out.join(&safe_id);
    if !dir.is_dir() {
        bail!("job {} has no materialized images yet", record.job_id);
    }

    let cursor = zip_directory(&dir)?;
    let dest = args
        .dest
        .unwrap_or_else(|| PathBuf::from(format!("images_{safe_id}.zip")));
    fs::write(&dest, cursor.into_inner())
        .with_context(|| format!("failed writing {}", dest.display()))?;

    let events = EventWriter::new(args.out.join("events.jsonl"), Uuid::new_v4().to_string());
    events.emit(
        "archive_created",
        json!({
            "job_id": record.job_id,
            "dest": dest.to_string_lossy().to_string(),
        }),
    )?;

    println!("Archived job {} to {}", record.job_id, dest.display());
    Ok(0)
}

fn resolve_record(
    ledger: &JobLedger,
    job: Option<&str>,
    out: &std::path::Path,
) -> Result<JobRecord> {
    match job {
        Some(job_id) => ledger
            .find(job_id)?
            .with_context(|| format!("no ledger record for job {job_id}")),
        None => ledger
            .latest()
            .with_context(|| format!("no jobs found in {}", out.display())),
    }
}

fn ensure_capability(registry: &ModelRegistry, name: &str, capability: &str) -> Result<()> {
    if let Some(spec) = registry.get(name) {
        if !spec.supports(capability) {
            bail!("model {name} does not support {capability} generation");
        }
    }
    Ok(())
}

fn prompt_for_hint() -> Result<Option<String>> {
    print!("Your idea (optional, press Enter for a surprise theme): ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    let trimmed = line.trim();
    Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
}

fn local_time(timestamp: f64) -> String {
    Local
        .timestamp_opt(timestamp.trunc() as i64, 0)
        .single()
        .map(|time| time.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "unknown time".to_string())
}
