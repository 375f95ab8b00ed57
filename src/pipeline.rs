use crate::{
    budget::{self, BudgetReport, TokenCounter},
    catalog::{Catalog, JobDefinition},
    config::Config,
    dispatch::{CancelFlag, DispatchConfig, Dispatcher},
    engine::InferenceClient,
    input::{Record, SharedContext},
    report::RunSummary,
    request::{self, RequestDescriptor},
    schema::{self, OutputSchema},
    sink::ResultSink,
    util::ensure_dir,
};
use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// A job whose schema is resolved and whose records have been costed.
pub struct PreparedJob {
    pub job: JobDefinition,
    pub schema: OutputSchema,
    pub context: SharedContext,
    pub budget: BudgetReport,
}

impl PreparedJob {
    /// Builds one descriptor per record, or fails the whole job if any
    /// record is over budget.
    pub fn descriptors(&self) -> Result<Vec<RequestDescriptor>> {
        let admissible = self.budget.clone().into_admissible()?;
        Ok(request::build_all(
            &admissible,
            &self.context,
            &self.job,
            &self.schema,
        ))
    }
}

/// Resolves the job's output schema and runs the budget check.
pub fn prepare(
    catalog: &Catalog,
    job_name: &str,
    records: Vec<Record>,
    context: SharedContext,
    counter: &dyn TokenCounter,
) -> Result<PreparedJob> {
    let job = catalog.job(job_name)?.clone();
    let schema = schema::resolve(&job, catalog.questions_for(job_name), &context)
        .with_context(|| format!("resolving output schema for job {job_name}"))?;
    debug!(?schema, "output schema");

    info!(
        "job={} model={} records={} context_tables={} context_rows={}",
        job.name,
        job.model,
        records.len(),
        context.tables().len(),
        context.row_count()
    );

    let budget = budget::validate(records, &context, &job, counter)?;
    Ok(PreparedJob {
        job,
        schema,
        context,
        budget,
    })
}

pub struct Pipeline<C: InferenceClient> {
    cfg: Config,
    catalog: Catalog,
    client: Arc<C>,
}

pub struct JobOutput {
    pub summary: RunSummary,
    pub results_path: PathBuf,
    pub descriptors_path: Option<PathBuf>,
}

impl<C: InferenceClient + 'static> Pipeline<C> {
    pub fn new(cfg: &Config, catalog: Catalog, client: C) -> Self {
        Self {
            cfg: cfg.clone(),
            catalog,
            client: Arc::new(client),
        }
    }

    pub async fn run_job(
        &self,
        prepared: &PreparedJob,
        run_dir: &Path,
        cancel: CancelFlag,
    ) -> Result<JobOutput> {
        let descriptors = prepared.descriptors()?;
        ensure_dir(run_dir)?;

        let descriptors_path = if self.cfg.output.write_descriptors {
            let path = run_dir.join(&self.cfg.output.descriptors_filename);
            write_descriptors(&path, &descriptors)?;
            info!("wrote {} request descriptors to {}", descriptors.len(), path.display());
            Some(path)
        } else {
            None
        };

        let results_path = run_dir.join(&self.cfg.output.results_filename);
        let sink = Arc::new(
            ResultSink::create(&results_path)
                .with_context(|| format!("opening results file: {}", results_path.display()))?,
        );

        let debug_dir = self
            .cfg
            .debug
            .write_parse_failures
            .then(|| run_dir.join("debug"));
        let dispatcher = Dispatcher::new(
            DispatchConfig {
                max_concurrency: self.cfg.global.max_concurrency,
                debug_dir,
            },
            prepared.schema.clone(),
            self.catalog.pricing_for(&prepared.job.model).cloned(),
            cancel,
        );

        let progress = self.spawn_progress(&dispatcher, descriptors.len());
        let outcome = dispatcher
            .run(descriptors, self.client.clone(), sink)
            .await;
        if let Some(handle) = progress {
            handle.abort();
        }
        let summary = outcome.with_context(|| format!("dispatching job {}", prepared.job.name))?;

        Ok(JobOutput {
            summary,
            results_path,
            descriptors_path,
        })
    }

    fn spawn_progress(
        &self,
        dispatcher: &Dispatcher,
        total: usize,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let secs = self.cfg.global.progress_interval_seconds;
        if secs == 0 {
            return None;
        }
        let stats = dispatcher.stats();
        Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(secs));
            tick.tick().await;
            loop {
                tick.tick().await;
                let snap = stats.snapshot();
                info!(
                    "progress: {}/{} complete, {} failed, {} in-flight, {:.1}s elapsed, cost {}",
                    snap.completed(),
                    total,
                    snap.failed,
                    snap.in_flight,
                    snap.elapsed_seconds,
                    snap.total_cost
                );
            }
        }))
    }
}

fn write_descriptors(path: &Path, descriptors: &[RequestDescriptor]) -> Result<()> {
    let mut out = std::io::BufWriter::new(
        std::fs::File::create(path).with_context(|| format!("create {}", path.display()))?,
    );
    for desc in descriptors {
        serde_json::to_writer(&mut out, desc)?;
        out.write_all(b"\n")?;
    }
    out.flush()
        .with_context(|| format!("flush {}", path.display()))?;
    Ok(())
}
