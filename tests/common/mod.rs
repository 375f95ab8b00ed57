#![allow(dead_code)]

use async_trait::async_trait;
use gpa_dispatch::{
    budget::{TokenCounter, ValidatedRecord},
    catalog::{JobDefinition, QuestionDef},
    engine::{InferenceClient, InferenceResponse, InvokeError, Usage},
    input::{Record, Row, SharedContext},
    request::{self, RequestDescriptor},
    schema::{self, OutputSchema},
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

/// One token per character.
pub struct CharCounter;

impl TokenCounter for CharCounter {
    fn count(&self, text: &str) -> usize {
        text.chars().count()
    }
}

pub fn mk_job(limit: i64, overhead: i64) -> JobDefinition {
    JobDefinition {
        name: "GPA Review".into(),
        model: "test-model".into(),
        temperature: 0.5,
        input_context_limit: limit,
        input_context_overhead: overhead,
        output_context_limit: 0,
        assistant_role: "You review records.".into(),
        tool_description: "Review results".into(),
    }
}

pub fn mk_question(key: &str, kind: &str, enum_source: Option<&str>) -> QuestionDef {
    QuestionDef {
        job: "GPA Review".into(),
        key: key.into(),
        description: format!("{key} of the record"),
        kind: kind.into(),
        enum_source: enum_source.map(str::to_string),
    }
}

pub fn mk_schema() -> OutputSchema {
    let questions = [
        mk_question("label", "string", None),
        mk_question("score", "integer", None),
    ];
    schema::resolve(&mk_job(100_000, 0), &questions, &SharedContext::empty())
        .expect("resolve schema")
}

pub fn mk_row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

pub fn mk_records(n: usize) -> Vec<Record> {
    (0..n)
        .map(|i| Record::new(i as u64, "records.json", mk_row(json!({"name": format!("record {i}")}))))
        .collect()
}

pub fn mk_descriptors(n: usize) -> Vec<RequestDescriptor> {
    let validated: Vec<ValidatedRecord> = mk_records(n)
        .into_iter()
        .map(|record| ValidatedRecord {
            token_cost: record.json.len(),
            record,
        })
        .collect();
    request::build_all(
        &validated,
        &SharedContext::empty(),
        &mk_job(100_000, 0),
        &mk_schema(),
    )
}

pub fn usage(input: u64, output: u64) -> Usage {
    Usage {
        input_tokens: input,
        cached_input_tokens: 0,
        output_tokens: output,
    }
}

pub fn reply(content: &str, usage: Usage) -> InferenceResponse {
    InferenceResponse {
        content: Some(content.to_string()),
        finish_reason: Some("stop".into()),
        refusal: None,
        usage,
    }
}

pub fn good_reply() -> InferenceResponse {
    reply(r#"{"results":[{"label":"ok","score":3}]}"#, usage(100, 10))
}

/// Answers every call with `answer`, optionally after a delay, and tracks
/// how many calls overlap.
pub struct FakeClient<F> {
    answer: F,
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl<F> FakeClient<F>
where
    F: Fn(&RequestDescriptor) -> Result<InferenceResponse, InvokeError> + Send + Sync,
{
    pub fn new(answer: F) -> Self {
        Self::with_delay(answer, Duration::ZERO)
    }

    pub fn with_delay(answer: F, delay: Duration) -> Self {
        Self {
            answer,
            delay,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<F> InferenceClient for FakeClient<F>
where
    F: Fn(&RequestDescriptor) -> Result<InferenceResponse, InvokeError> + Send + Sync,
{
    async fn invoke(&self, req: &RequestDescriptor) -> Result<InferenceResponse, InvokeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        (self.answer)(req)
    }
}

/// Answers records below `fast` at once; every other call waits until the
/// test releases it.
pub struct GatedClient {
    fast: u64,
    started: AtomicUsize,
    release: Semaphore,
}

impl GatedClient {
    pub fn new(fast: u64) -> Self {
        Self {
            fast,
            started: AtomicUsize::new(0),
            release: Semaphore::new(0),
        }
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn release(&self, n: usize) {
        self.release.add_permits(n);
    }
}

#[async_trait]
impl InferenceClient for GatedClient {
    async fn invoke(&self, req: &RequestDescriptor) -> Result<InferenceResponse, InvokeError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        if req.record_id >= self.fast {
            let _permit = self
                .release
                .acquire()
                .await
                .map_err(|e| InvokeError::Transport(e.to_string()))?;
        }
        Ok(good_reply())
    }
}
