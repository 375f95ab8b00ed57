use crate::{
    budget::BpeCounter,
    catalog::Catalog,
    config::Config,
    dispatch::CancelFlag,
    engine::openai::OpenAiClient,
    input::{self, Record, SharedContext},
    pipeline::{self, Pipeline, PreparedJob},
    report::ValidationReport,
    util::{ensure_dir, fingerprint, now_rfc3339, unix_seconds},
};
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "gpa-dispatch")]
#[command(about = "Batch LLM record review with token budgets and bounded concurrency")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Path to config TOML. If omitted, uses ./gpa-dispatch.toml if present.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override log level (trace/debug/info/warn/error).
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the jobs defined in the catalog.
    Jobs {},
    /// Check every record against the job's token budget.
    Validate {
        #[arg(long)]
        job: String,
    },
    /// Validate and print the first request that would be sent.
    Plan {
        #[arg(long)]
        job: String,
    },
    Run {
        #[arg(long)]
        job: String,
        #[arg(long)]
        out_dir: Option<PathBuf>,
        #[arg(long)]
        max_concurrency: Option<usize>,
    },
}

pub fn dispatch(args: Args) -> Result<()> {
    let cfg_path = resolve_config_path(args.config.as_deref())?;
    let cfg = Config::load(&cfg_path)?;

    match &args.cmd {
        Command::Jobs {} => {
            let log_path = resolve_log_path(&cfg, None);
            let _guard = init_logging(&args, &cfg, log_path.as_deref())?;
            jobs(&cfg)
        }
        Command::Validate { job } => {
            let log_path = resolve_log_path(&cfg, None);
            let _guard = init_logging(&args, &cfg, log_path.as_deref())?;
            validate(&cfg, job)
        }
        Command::Plan { job } => {
            let log_path = resolve_log_path(&cfg, None);
            let _guard = init_logging(&args, &cfg, log_path.as_deref())?;
            plan(&cfg, job)
        }
        Command::Run {
            job,
            out_dir,
            max_concurrency,
        } => run(&args, &cfg, job, out_dir.as_deref(), *max_concurrency),
    }
}

fn resolve_config_path(user: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = user {
        return Ok(p.to_path_buf());
    }
    let default = PathBuf::from("gpa-dispatch.toml");
    if default.exists() {
        Ok(default)
    } else {
        Ok(PathBuf::from("gpa-dispatch.example.toml"))
    }
}

fn init_logging(args: &Args, cfg: &Config, file_path: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(cfg.logging.level.as_str());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stdout_layer = if cfg.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .boxed()
    };

    let (file_layer, guard) = if let Some(path) = file_path {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        ensure_dir(parent)?;
        let file = std::fs::File::create(path)
            .with_context(|| format!("create log file: {}", path.display()))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to init logging: {e}"))?;

    Ok(guard)
}

fn load_catalog(cfg: &Config) -> Result<Catalog> {
    let path = Path::new(&cfg.paths.catalog);
    Catalog::load(path).with_context(|| format!("loading job catalog: {}", path.display()))
}

fn load_inputs(cfg: &Config) -> Result<(Vec<Record>, SharedContext)> {
    let records = input::load_records(
        Path::new(&cfg.paths.records_dir),
        cfg.input.normalize_unicode,
    )?;
    let context = input::load_context(
        Path::new(&cfg.paths.context_dir),
        cfg.input.normalize_unicode,
    )?;
    Ok((records, context))
}

fn prepare_job(cfg: &Config, catalog: &Catalog, job: &str) -> Result<PreparedJob> {
    let model = &catalog.job(job)?.model;
    let counter = BpeCounter::for_model(model, &cfg.tokenizer.fallback_encoding)?;
    let (records, context) = load_inputs(cfg)?;
    pipeline::prepare(catalog, job, records, context, &counter)
}

fn jobs(cfg: &Config) -> Result<()> {
    let catalog = load_catalog(cfg)?;
    let listing: Vec<_> = catalog
        .jobs
        .iter()
        .map(|j| {
            serde_json::json!({
                "name": j.name,
                "model": j.model,
                "input_context_limit": j.input_context_limit,
                "questions": catalog.questions_for(&j.name).count(),
                "priced": catalog.pricing_for(&j.model).is_some(),
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&listing)?);
    Ok(())
}

fn validate(cfg: &Config, job: &str) -> Result<()> {
    let catalog = load_catalog(cfg)?;
    let prepared = prepare_job(cfg, &catalog, job)?;
    let report = ValidationReport::new(job, &prepared.job.model, &prepared.budget);
    println!("{}", serde_json::to_string_pretty(&report)?);
    prepared.budget.into_admissible()?;
    Ok(())
}

fn plan(cfg: &Config, job: &str) -> Result<()> {
    let catalog = load_catalog(cfg)?;
    let prepared = prepare_job(cfg, &catalog, job)?;
    let descriptors = prepared.descriptors()?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "job": job,
            "requests": descriptors.len(),
            "max_request_tokens": prepared.budget.max_request_tokens(),
            "first_request": descriptors.first(),
        }))?
    );
    Ok(())
}

fn run(
    args: &Args,
    cfg: &Config,
    job: &str,
    out_override: Option<&Path>,
    max_concurrency: Option<usize>,
) -> Result<()> {
    let mut cfg = cfg.clone();
    if let Some(n) = max_concurrency {
        if n == 0 {
            return Err(anyhow!("--max-concurrency must be at least 1"));
        }
        cfg.global.max_concurrency = n;
    }

    let catalog = load_catalog(&cfg)?;
    catalog.job(job)?;

    let cfg_norm = format!("{}\njob={job}\n", cfg.normalized_for_hash());
    let digest = fingerprint(
        &cfg_norm,
        &[
            Path::new(&cfg.paths.catalog),
            Path::new(&cfg.paths.records_dir),
            Path::new(&cfg.paths.context_dir),
        ],
    )
    .with_context(|| "fingerprinting inputs")?;
    let run_id = format!("{}-{}", &digest[..12], unix_seconds());

    let out_root = out_override
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(&cfg.paths.out_dir));
    let run_dir = out_root.join(job).join(&run_id);

    ensure_dir(&run_dir)?;
    ensure_dir(&run_dir.join("logs"))?;

    let log_path = resolve_log_path(&cfg, Some(&run_dir));
    let _guard = init_logging(args, &cfg, log_path.as_deref())?;

    info!("run_id={run_id} job={job} out={}", run_dir.display());

    if cfg.debug.dump_effective_config {
        let raw = toml::to_string(&cfg).unwrap_or_default();
        std::fs::write(run_dir.join("effective-config.toml"), raw)?;
    }

    let prepared = prepare_job(&cfg, &catalog, job)?;
    let client = OpenAiClient::new(&cfg)?;
    let pipeline = Pipeline::new(&cfg, catalog, client);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .with_context(|| "building tokio runtime")?;

    let started = now_rfc3339();
    let cancel = CancelFlag::new();
    let result = runtime.block_on(async {
        let interrupt = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; admitting no new requests, draining in-flight ones");
                    cancel.cancel();
                }
            })
        };
        let out = pipeline.run_job(&prepared, &run_dir, cancel.clone()).await;
        interrupt.abort();
        out
    })?;
    let summary = &result.summary;

    if cfg.output.write_summary_json {
        std::fs::write(
            run_dir.join(&cfg.output.summary_filename),
            serde_json::to_string_pretty(summary)?,
        )?;
    }

    if cfg.output.write_index_json {
        let index = serde_json::json!({
            "run_id": run_id,
            "job": job,
            "model": prepared.job.model,
            "started": started,
            "finished": now_rfc3339(),
            "results": cfg.output.results_filename,
            "descriptors": result
                .descriptors_path
                .as_ref()
                .map(|_| cfg.output.descriptors_filename.clone()),
            "summary": cfg
                .output
                .write_summary_json
                .then(|| cfg.output.summary_filename.clone()),
        });
        std::fs::write(run_dir.join("index.json"), serde_json::to_string_pretty(&index)?)?;
    }

    if cfg.global.print_summary {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "run_id": run_id,
                "run_dir": run_dir,
                "results": result.results_path,
                "status": if summary.was_cancelled { "cancelled" } else { "ok" },
                "summary": summary,
            }))?
        );
    }

    Ok(())
}

fn resolve_log_path(cfg: &Config, run_dir: Option<&Path>) -> Option<PathBuf> {
    if !cfg.logging.write_to_file {
        return None;
    }

    if !cfg.logging.file_path.is_empty() {
        return Some(PathBuf::from(&cfg.logging.file_path));
    }

    if let Some(run_dir) = run_dir {
        return Some(run_dir.join("logs").join("gpa-dispatch.log"));
    }

    Some(PathBuf::from(&cfg.paths.out_dir).join("gpa-dispatch.log"))
}
