//! DT-021: CLI subcommands: init, validate, resolve, compile, status, queue, completions.

use crate::batch::store::{RowStore, SqliteRowStore};
use crate::batch::types::WriteBackStatus;
use crate::core::config::DetentConfig;
use crate::core::dictionary::CanonicalDictionary;
use crate::core::parser;
use crate::core::pipeline::FilterPipeline;
use crate::core::token::TokenService;
use crate::tripwire::eventlog;
use clap::{CommandFactory, Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(
    name = "detent",
    version,
    about = "Deterministic filter compilation and crash-safe batch execution"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new detent project
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate detent.yaml and the dictionary it points at
    Validate {
        /// Path to detent.yaml
        #[arg(short, long, default_value = "detent.yaml")]
        file: PathBuf,
    },

    /// Resolve a filter intent request (JSON) against a schema snapshot
    Resolve {
        /// Path to detent.yaml
        #[arg(short, long, default_value = "detent.yaml")]
        file: PathBuf,

        /// Schema snapshot (YAML)
        #[arg(short, long, default_value = "schema.yaml")]
        schema: PathBuf,

        /// Request JSON file, or - for stdin
        request: PathBuf,
    },

    /// Compile a resolved spec request (JSON) to a parameterized predicate
    Compile {
        /// Path to detent.yaml
        #[arg(short, long, default_value = "detent.yaml")]
        file: PathBuf,

        /// Schema snapshot (YAML)
        #[arg(short, long, default_value = "schema.yaml")]
        schema: PathBuf,

        /// Request JSON file, or - for stdin
        request: PathBuf,
    },

    /// Show per-status row counts for jobs
    Status {
        /// Path to detent.yaml
        #[arg(short, long, default_value = "detent.yaml")]
        file: PathBuf,

        /// Show a single job, row by row
        #[arg(short, long)]
        job: Option<String>,
    },

    /// Inspect the write-back queue
    Queue {
        /// Path to detent.yaml
        #[arg(short, long, default_value = "detent.yaml")]
        file: PathBuf,

        /// Restrict to one job
        #[arg(short, long)]
        job: Option<String>,

        /// Move a dead-lettered task back to pending
        #[arg(long)]
        requeue: Option<i64>,
    },

    /// Generate shell completions
    Completions {
        shell: clap_complete::Shell,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Resolve {
            file,
            schema,
            request,
        } => cmd_resolve(&file, &schema, &request),
        Commands::Compile {
            file,
            schema,
            request,
        } => cmd_compile(&file, &schema, &request),
        Commands::Status { file, job } => cmd_status(&file, job.as_deref()),
        Commands::Queue { file, job, requeue } => cmd_queue(&file, job.as_deref(), requeue),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "detent", &mut std::io::stdout());
            Ok(())
        }
    }
}

fn cmd_init(path: &Path) -> Result<(), String> {
    let config_path = path.join("detent.yaml");
    if config_path.exists() {
        return Err(format!("{} already exists", config_path.display()));
    }

    let state_dir = path.join("state");
    std::fs::create_dir_all(&state_dir).map_err(|e| format!("cannot create state dir: {}", e))?;

    let template = r#"version: "1.0"
state_dir: state

token:
  secret_env: FILTER_TOKEN_SECRET
  ttl_seconds: 600

execution:
  concurrency: 5
  max_recovery_attempts: 3

write_back:
  max_retries: 3
  batch_size: 100
  poll_interval_ms: 1000
"#;
    std::fs::write(&config_path, template)
        .map_err(|e| format!("cannot write {}: {}", config_path.display(), e))?;

    let schema_path = path.join("schema.yaml");
    if !schema_path.exists() {
        let schema = "columns:\n  state: VARCHAR\n  city: VARCHAR\n  amount: DOUBLE\n";
        std::fs::write(&schema_path, schema)
            .map_err(|e| format!("cannot write {}: {}", schema_path.display(), e))?;
    }

    println!("Initialized detent project at {}", path.display());
    println!("  Created: {}", config_path.display());
    println!("  Created: {}/", state_dir.display());
    Ok(())
}

/// Parse and validate a detent config file, returning errors if invalid.
fn parse_and_validate(file: &Path) -> Result<DetentConfig, String> {
    let config = parser::parse_config_file(file)?;
    let errors = parser::validate_config(&config);
    if errors.is_empty() {
        return Ok(config);
    }
    for e in &errors {
        eprintln!("  ERROR: {}", e);
    }
    Err(format!("{} validation error(s)", errors.len()))
}

/// Relative paths in the config resolve against the config's directory.
fn relative_to(file: &Path, path: &Path) -> PathBuf {
    match file.parent() {
        Some(dir) if path.is_relative() => dir.join(path),
        _ => path.to_path_buf(),
    }
}

fn load_dictionary(file: &Path, config: &DetentConfig) -> Result<CanonicalDictionary, String> {
    let Some(path) = &config.dictionary else {
        return Ok(CanonicalDictionary::builtin());
    };
    let dict = CanonicalDictionary::load(&relative_to(file, path))?;
    let problems = dict.validate();
    if !problems.is_empty() {
        for p in &problems {
            eprintln!("  ERROR: {}", p);
        }
        return Err(format!("{} dictionary error(s)", problems.len()));
    }
    Ok(dict)
}

fn open_store(file: &Path, config: &DetentConfig) -> Result<SqliteRowStore, String> {
    let db = relative_to(file, &config.database_path());
    SqliteRowStore::open(&db).map_err(|e| format!("cannot open {}: {}", db.display(), e))
}

fn cmd_validate(file: &Path) -> Result<(), String> {
    let config = parse_and_validate(file)?;
    let dict = load_dictionary(file, &config)?;
    println!(
        "OK: {} (dictionary {}, concurrency {})",
        file.display(),
        dict.version(),
        config.execution.concurrency
    );
    Ok(())
}

fn pipeline(file: &Path) -> Result<FilterPipeline, String> {
    let config = parse_and_validate(file)?;
    let dict = load_dictionary(file, &config)?;
    let tokens = TokenService::from_env(&config.token.secret_env, config.token.ttl_seconds)
        .map_err(|e| e.to_string())?;
    Ok(FilterPipeline::new(dict, tokens))
}

fn read_request(path: &Path) -> Result<serde_json::Value, String> {
    let content = if path.as_os_str() == "-" {
        std::io::read_to_string(std::io::stdin()).map_err(|e| format!("cannot read stdin: {}", e))?
    } else {
        std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?
    };
    serde_json::from_str(&content).map_err(|e| format!("request is not valid JSON: {}", e))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), String> {
    let out = serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialize error: {}", e))?;
    println!("{}", out);
    Ok(())
}

fn cmd_resolve(file: &Path, schema: &Path, request: &Path) -> Result<(), String> {
    let pipeline = pipeline(file)?;
    let schema = parser::parse_schema_file(schema)?;
    let payload = read_request(request)?;
    let spec = pipeline
        .resolve_intent(&payload, &schema, eventlog::unix_now())
        .map_err(|e| e.to_string())?;
    print_json(&spec)
}

fn cmd_compile(file: &Path, schema: &Path, request: &Path) -> Result<(), String> {
    let pipeline = pipeline(file)?;
    let schema = parser::parse_schema_file(schema)?;
    let payload = read_request(request)?;
    let compiled = pipeline
        .compile_filter(&payload, &schema, eventlog::unix_now())
        .map_err(|e| e.to_string())?;
    print_json(&compiled)
}

fn cmd_status(file: &Path, job: Option<&str>) -> Result<(), String> {
    let config = parse_and_validate(file)?;
    let store = open_store(file, &config)?;

    if let Some(job) = job {
        let rows = store.job_rows(job).map_err(|e| e.to_string())?;
        if rows.is_empty() {
            return Err(format!("no rows for job {}", job));
        }
        println!("Job: {} ({} rows)", job, rows.len());
        for r in &rows {
            let reference = r.external_reference.as_deref().unwrap_or("-");
            let error = r
                .error_code
                .as_deref()
                .map(|c| format!(" [{}]", c))
                .unwrap_or_default();
            println!("  row {:>4}: {:<12} {}{}", r.row_number, r.status, reference, error);
        }
        return Ok(());
    }

    let jobs = store.job_ids().map_err(|e| e.to_string())?;
    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }
    for job in &jobs {
        let s = store.summary(job).map_err(|e| e.to_string())?;
        let flag = if s.is_interrupted() { "  (recovery pending)" } else { "" };
        println!(
            "{}: {} rows, {} pending, {} in_flight, {} completed, {} failed, {} needs_review{}",
            job, s.total, s.pending, s.in_flight, s.completed, s.failed, s.needs_review, flag
        );
    }
    Ok(())
}

fn cmd_queue(file: &Path, job: Option<&str>, requeue: Option<i64>) -> Result<(), String> {
    let config = parse_and_validate(file)?;
    let store = open_store(file, &config)?;

    if let Some(id) = requeue {
        store.requeue_write_back(id).map_err(|e| e.to_string())?;
        println!("Requeued write-back task {}", id);
        return Ok(());
    }

    let tasks = store.write_backs(job).map_err(|e| e.to_string())?;
    if tasks.is_empty() {
        println!("Write-back queue is empty.");
        return Ok(());
    }
    let mut dead = 0;
    for t in &tasks {
        if t.status == WriteBackStatus::DeadLetter {
            dead += 1;
        }
        let error = t
            .last_error
            .as_deref()
            .map(|e| format!(" ({})", e))
            .unwrap_or_default();
        println!(
            "  #{} {} row {}: {} {} retries={}{}",
            t.id, t.job_id, t.row_number, t.external_reference, t.status, t.retry_count, error
        );
    }
    println!();
    println!("{} task(s), {} dead-lettered", tasks.len(), dead);
    Ok(())
}
