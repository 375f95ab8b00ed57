//! Bounded-concurrency dispatch of request descriptors.
//!
//! Descriptors are admitted in submission order through a semaphore with
//! `max_concurrency` permits. Each admitted descriptor runs in its own task,
//! holds its permit until it reaches a terminal state, and writes exactly one
//! result. Cancellation is a level-triggered flag checked only at admission
//! boundaries: in-flight calls always run to completion.

use crate::{
    catalog::PricingEntry,
    engine::{InferenceClient, InferenceResponse, Usage},
    report::RunSummary,
    request::RequestDescriptor,
    schema::OutputSchema,
    sink::{FailureReason, Outcome, ResultSink, RunResult, SinkError},
    stats::{compute_cost, StatsHandle},
    util::now_rfc3339,
};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RequestState {
    Pending,
    Admitted,
    InFlight,
    Succeeded,
    Failed,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Succeeded | RequestState::Failed | RequestState::Cancelled
        )
    }

    fn can_become(self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Pending, Admitted)
                | (Pending, Cancelled)
                | (Admitted, InFlight)
                | (Admitted, Cancelled)
                | (InFlight, Succeeded)
                | (InFlight, Failed)
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("record {0} was submitted more than once")]
    DuplicateRecord(u64),

    #[error("record {0} is not registered with this dispatcher")]
    UnknownRecord(u64),

    #[error("illegal transition for record {record_id}: {from:?} -> {to:?}")]
    IllegalTransition {
        record_id: u64,
        from: RequestState,
        to: RequestState,
    },

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("dispatch task failed: {0}")]
    Task(String),

    #[error("a dispatcher runs only once")]
    AlreadyRun,
}

/// Per-record lifecycle table.
#[derive(Debug, Default)]
pub struct StateTable {
    states: Mutex<HashMap<u64, RequestState>>,
}

impl StateTable {
    fn register(&self, ids: impl IntoIterator<Item = u64>) -> Result<(), DispatchError> {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        for id in ids {
            if states.insert(id, RequestState::Pending).is_some() {
                return Err(DispatchError::DuplicateRecord(id));
            }
        }
        Ok(())
    }

    fn transition(&self, record_id: u64, to: RequestState) -> Result<(), DispatchError> {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states
            .get_mut(&record_id)
            .ok_or(DispatchError::UnknownRecord(record_id))?;
        if !state.can_become(to) {
            return Err(DispatchError::IllegalTransition {
                record_id,
                from: *state,
                to,
            });
        }
        *state = to;
        Ok(())
    }

    pub fn get(&self, record_id: u64) -> Option<RequestState> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&record_id)
            .copied()
    }

    pub fn count(&self, state: RequestState) -> usize {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| **s == state)
            .count()
    }

    pub fn snapshot(&self) -> HashMap<u64, RequestState> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Run-scoped cancellation flag. Once raised it stays raised.
#[derive(Debug, Clone)]
pub struct CancelFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelFlag {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the flag is raised.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so the channel cannot close here.
        let _ = rx.wait_for(|raised| *raised).await;
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub max_concurrency: usize,
    /// Where parse-failure artifacts go; `None` disables them.
    pub debug_dir: Option<PathBuf>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 50,
            debug_dir: None,
        }
    }
}

pub struct Dispatcher {
    cfg: DispatchConfig,
    schema: Arc<OutputSchema>,
    pricing: Option<PricingEntry>,
    cancel: CancelFlag,
    stats: StatsHandle,
    states: Arc<StateTable>,
    started: AtomicBool,
}

struct TaskCtx<C> {
    client: Arc<C>,
    sink: Arc<ResultSink>,
    schema: Arc<OutputSchema>,
    pricing: Option<PricingEntry>,
    cancel: CancelFlag,
    stats: StatsHandle,
    states: Arc<StateTable>,
    debug_dir: Option<PathBuf>,
    total: usize,
}

impl Dispatcher {
    pub fn new(
        cfg: DispatchConfig,
        schema: OutputSchema,
        pricing: Option<PricingEntry>,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            cfg,
            schema: Arc::new(schema),
            pricing,
            cancel,
            stats: StatsHandle::new(),
            states: Arc::new(StateTable::default()),
            started: AtomicBool::new(false),
        }
    }

    pub fn stats(&self) -> StatsHandle {
        self.stats.clone()
    }

    pub fn states(&self) -> Arc<StateTable> {
        self.states.clone()
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Dispatches every descriptor and returns once all admitted descriptors
    /// are terminal. Results land in `sink` in completion order.
    ///
    /// A dispatcher is single-use: its state table and statistics describe
    /// one run, and a second call fails with `DispatchError::AlreadyRun`.
    pub async fn run<C>(
        &self,
        descriptors: Vec<RequestDescriptor>,
        client: Arc<C>,
        sink: Arc<ResultSink>,
    ) -> Result<RunSummary, DispatchError>
    where
        C: InferenceClient + 'static,
    {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(DispatchError::AlreadyRun);
        }
        let total = descriptors.len();
        self.states
            .register(descriptors.iter().map(|d| d.record_id))?;
        self.stats.restart_clock();

        let max_concurrency = self.cfg.max_concurrency.max(1);
        if self.pricing.is_none() {
            warn!("no pricing entry for this model; costs will be reported as unknown");
        }
        info!("dispatching {total} requests, max concurrency {max_concurrency}");

        let gate = Arc::new(Semaphore::new(max_concurrency));
        let ctx = Arc::new(TaskCtx {
            client,
            sink,
            schema: self.schema.clone(),
            pricing: self.pricing.clone(),
            cancel: self.cancel.clone(),
            stats: self.stats.clone(),
            states: self.states.clone(),
            debug_dir: self.cfg.debug_dir.clone(),
            total,
        });

        let mut tasks = JoinSet::new();
        let mut queue = descriptors.into_iter();
        let mut never_admitted: Vec<u64> = Vec::new();
        let mut first_err: Option<DispatchError> = None;

        for desc in queue.by_ref() {
            while let Some(joined) = tasks.try_join_next() {
                self.note_finished(joined, &mut first_err);
            }
            if self.cancel.is_cancelled() {
                never_admitted.push(desc.record_id);
                break;
            }
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                permit = gate.clone().acquire_owned() => {
                    Some(permit.map_err(|e| DispatchError::Task(e.to_string()))?)
                }
            };
            let Some(permit) = permit else {
                never_admitted.push(desc.record_id);
                break;
            };

            self.states.transition(desc.record_id, RequestState::Admitted)?;
            self.stats.record_admitted();

            let ctx = ctx.clone();
            tasks.spawn(async move {
                let _permit = permit;
                ctx.process(desc).await
            });
        }

        never_admitted.extend(queue.map(|d| d.record_id));
        for id in &never_admitted {
            self.states.transition(*id, RequestState::Cancelled)?;
        }
        if !never_admitted.is_empty() {
            info!(
                "cancellation: {} requests never admitted; draining {} in flight",
                never_admitted.len(),
                self.stats.snapshot().in_flight
            );
        }

        while let Some(joined) = tasks.join_next().await {
            self.note_finished(joined, &mut first_err);
        }
        if let Some(err) = first_err {
            return Err(err);
        }

        let snap = self.stats.snapshot();
        let summary = RunSummary::from_snapshot(total, &snap, self.cancel.is_cancelled());
        info!(
            "dispatch finished: {}/{} succeeded, {} failed, {} never started, cost {}",
            summary.succeeded, total, summary.failed, summary.never_started, summary.total_cost
        );
        Ok(summary)
    }

    /// Keeps the first task error and stops further admissions once one occurs.
    fn note_finished(
        &self,
        joined: Result<Result<(), DispatchError>, tokio::task::JoinError>,
        first_err: &mut Option<DispatchError>,
    ) {
        let outcome = joined
            .map_err(|e| DispatchError::Task(e.to_string()))
            .and_then(|r| r);
        if let Err(err) = outcome {
            error!("{err}");
            if first_err.is_none() {
                self.cancel.cancel();
                *first_err = Some(err);
            }
        }
    }
}

impl<C: InferenceClient + 'static> TaskCtx<C> {
    async fn process(&self, desc: RequestDescriptor) -> Result<(), DispatchError> {
        let id = desc.record_id;

        if self.cancel.is_cancelled() {
            self.states.transition(id, RequestState::Cancelled)?;
            self.stats.record_cancelled();
            debug!(record_id = id, "cancelled before start");
            return Ok(());
        }

        self.states.transition(id, RequestState::InFlight)?;
        let desc = Arc::new(desc);
        let call = {
            let client = self.client.clone();
            let desc = desc.clone();
            tokio::spawn(async move { client.invoke(&desc).await }).await
        };
        let result = match call {
            Ok(Ok(resp)) => self.complete(&desc, resp).await,
            Ok(Err(err)) => self.dispatch_failure(&desc, err.to_string()),
            Err(join) => self.dispatch_failure(&desc, format!("inference call panicked: {join}")),
        };

        let terminal = if result.is_success() {
            RequestState::Succeeded
        } else {
            RequestState::Failed
        };

        // Row and stats update run on the blocking pool, under the sink lock.
        // A record turns terminal only once its row is written.
        let written = {
            let sink = self.sink.clone();
            let stats = self.stats.clone();
            tokio::task::spawn_blocking(move || {
                sink.append_then(result, |row| stats.record_terminal(row))
            })
            .await
        };
        match written {
            Ok(Ok(())) => self.states.transition(id, terminal)?,
            Ok(Err(err)) => {
                self.stats.record_unwritten();
                return Err(err.into());
            }
            Err(join) => {
                self.stats.record_unwritten();
                return Err(DispatchError::Task(join.to_string()));
            }
        }

        let snap = self.stats.snapshot();
        info!(
            record_id = id,
            "{}/{} complete, {} failed, {} in-flight",
            snap.completed(),
            self.total,
            snap.failed,
            snap.in_flight
        );
        Ok(())
    }

    async fn complete(&self, desc: &RequestDescriptor, resp: InferenceResponse) -> RunResult {
        let parsed = match resp.content.as_deref() {
            Some(content) => self
                .schema
                .parse_results(content)
                .map_err(|e| e.to_string()),
            None => Err(match resp.refusal.as_deref() {
                Some(refusal) => format!("model refused: {refusal}"),
                None => "response has no content".to_string(),
            }),
        };

        let outcome = match parsed {
            Ok(fields) => Outcome::Succeeded { fields },
            Err(mut message) => {
                if let Some(reason) = resp.finish_reason.as_deref().filter(|r| *r != "stop") {
                    message.push_str(&format!(" (finish_reason={reason})"));
                }
                warn!(record_id = desc.record_id, "parse failed: {message}");
                self.write_parse_failure(desc, &resp, &message).await;
                Outcome::Failed {
                    reason: FailureReason::Parse(message),
                }
            }
        };
        self.build_result(desc, outcome, resp.usage)
    }

    fn dispatch_failure(&self, desc: &RequestDescriptor, message: String) -> RunResult {
        warn!(record_id = desc.record_id, "dispatch failed: {message}");
        self.build_result(
            desc,
            Outcome::Failed {
                reason: FailureReason::Dispatch(message),
            },
            Usage::default(),
        )
    }

    fn build_result(&self, desc: &RequestDescriptor, outcome: Outcome, usage: Usage) -> RunResult {
        RunResult {
            record_id: desc.record_id,
            source: desc.source.clone(),
            outcome,
            input_tokens: usage.input_tokens,
            cached_input_tokens: usage.cached_input_tokens,
            output_tokens: usage.output_tokens,
            cost: compute_cost(self.pricing.as_ref(), &usage),
            completed_at: now_rfc3339(),
        }
    }

    async fn write_parse_failure(
        &self,
        desc: &RequestDescriptor,
        resp: &InferenceResponse,
        reason: &str,
    ) {
        let Some(dir) = self.debug_dir.as_ref() else {
            return;
        };
        let artifact = serde_json::json!({
            "record_id": desc.record_id,
            "source": desc.source,
            "reason": reason,
            "messages": desc.messages,
            "response_format": desc.response_format,
            "completion": {
                "content": resp.content,
                "finish_reason": resp.finish_reason,
                "refusal": resp.refusal,
                "usage": resp.usage,
            },
        });
        let path = dir.join(format!("record_{}_parse_failure.json", desc.record_id));
        let body = serde_json::to_vec_pretty(&artifact).unwrap_or_default();
        let written = match tokio::fs::create_dir_all(dir).await {
            Ok(()) => tokio::fs::write(&path, body).await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            warn!("writing debug artifact {}: {err}", path.display());
        }
    }
}
