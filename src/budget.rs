//! Token budget validation.
//!
//! Every request carries one record (as a singleton JSON array) plus the whole
//! shared example context. A run may only be dispatched when every record
//! fits in `input_context_limit - input_context_overhead`; otherwise the run is
//! rejected as a whole with every offending record listed.

use crate::{
    catalog::JobDefinition,
    input::{row_json, Record, SharedContext},
};
use anyhow::{anyhow, Result};
use serde::Serialize;
use tiktoken_rs::CoreBPE;
use tracing::{info, warn};

/// Counts model-specific token units for a piece of text.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// BPE counter backed by the model's tiktoken encoding.
pub struct BpeCounter {
    bpe: CoreBPE,
}

impl BpeCounter {
    pub fn for_model(model: &str, fallback_encoding: &str) -> Result<Self> {
        match tiktoken_rs::get_bpe_from_model(model) {
            Ok(bpe) => Ok(Self { bpe }),
            Err(_) => {
                warn!(
                    "model {model:?} not recognized by tokenizer; using {fallback_encoding} encoding"
                );
                Self::for_encoding(fallback_encoding)
            }
        }
    }

    pub fn for_encoding(encoding: &str) -> Result<Self> {
        let bpe = match encoding {
            "o200k_base" => tiktoken_rs::o200k_base(),
            "cl100k_base" => tiktoken_rs::cl100k_base(),
            "p50k_base" => tiktoken_rs::p50k_base(),
            "r50k_base" => tiktoken_rs::r50k_base(),
            other => return Err(anyhow!("unknown tokenizer encoding: {other}")),
        }
        .map_err(|e| anyhow!("loading {encoding} encoding: {e}"))?;
        Ok(Self { bpe })
    }
}

impl TokenCounter for BpeCounter {
    fn count(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

#[derive(Debug, Clone)]
pub struct ValidatedRecord {
    pub record: Record,
    pub token_cost: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Rejection {
    pub record_id: u64,
    pub source: String,
    pub record_tokens: usize,
    pub shared_tokens: usize,
    pub total_tokens: usize,
    pub available: usize,
}

impl Rejection {
    pub fn overflow(&self) -> usize {
        self.total_tokens.saturating_sub(self.available)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BudgetError {
    #[error(
        "job {job:?} has no available context: input_context_limit {limit} - input_context_overhead {overhead} <= 0"
    )]
    NoAvailableContext {
        job: String,
        limit: i64,
        overhead: i64,
    },

    #[error("{}", render_exceeded(.available, .shared_tokens, .rejected))]
    RecordsExceedLimit {
        available: usize,
        shared_tokens: usize,
        rejected: Vec<Rejection>,
    },
}

const SHOWN_REJECTIONS: usize = 5;

fn render_exceeded(available: &usize, shared_tokens: &usize, rejected: &[Rejection]) -> String {
    let (available, shared_tokens) = (*available, *shared_tokens);
    let mut msg = format!("{} record(s) exceed the token limit\n", rejected.len());
    msg.push_str(&format!("available context: {available} tokens\n"));
    msg.push_str(&format!(
        "shared example context (sent with every record): {shared_tokens} tokens\n"
    ));
    msg.push_str(&format!(
        "max tokens per record: {}\n",
        available.saturating_sub(shared_tokens)
    ));
    msg.push_str("records exceeding limit:\n");
    for (i, r) in rejected.iter().take(SHOWN_REJECTIONS).enumerate() {
        msg.push_str(&format!(
            "{}. id={} source={} record={} tokens total={} tokens (exceeds by {})\n",
            i + 1,
            r.record_id,
            r.source,
            r.record_tokens,
            r.total_tokens,
            r.overflow()
        ));
    }
    if rejected.len() > SHOWN_REJECTIONS {
        msg.push_str(&format!(
            "... and {} more\n",
            rejected.len() - SHOWN_REJECTIONS
        ));
    }
    msg.push_str(
        "raise input_context_limit, lower input_context_overhead, \
         or shrink the example context or the records",
    );
    msg
}

#[derive(Debug, Clone)]
pub struct BudgetReport {
    pub validated: Vec<ValidatedRecord>,
    pub rejected: Vec<Rejection>,
    pub shared_context_tokens: usize,
    pub available_context: usize,
    pub max_record_tokens: usize,
}

impl BudgetReport {
    pub fn is_admissible(&self) -> bool {
        self.rejected.is_empty()
    }

    pub fn max_request_tokens(&self) -> usize {
        self.max_record_tokens + self.shared_context_tokens
    }

    /// All-or-nothing: any rejected record fails the whole run.
    pub fn into_admissible(self) -> Result<Vec<ValidatedRecord>, BudgetError> {
        if self.rejected.is_empty() {
            Ok(self.validated)
        } else {
            Err(BudgetError::RecordsExceedLimit {
                available: self.available_context,
                shared_tokens: self.shared_context_tokens,
                rejected: self.rejected,
            })
        }
    }
}

/// Cost of one record presented as a singleton array.
pub fn record_cost(record: &Record, counter: &dyn TokenCounter) -> usize {
    counter.count(&record.json) + counter.count(",") + counter.count("[]")
}

/// Cost of the whole shared context block, independent of record count.
pub fn shared_context_cost(context: &SharedContext, counter: &dyn TokenCounter) -> usize {
    let separator = counter.count(",");
    let rows: usize = context
        .tables()
        .iter()
        .flat_map(|t| t.rows.iter())
        .map(|row| counter.count(&row_json(row)) + separator)
        .sum();
    rows + context.tables().len() * counter.count("[]")
}

pub fn validate(
    records: Vec<Record>,
    context: &SharedContext,
    job: &JobDefinition,
    counter: &dyn TokenCounter,
) -> Result<BudgetReport, BudgetError> {
    let available = job.available_context();
    if available <= 0 {
        return Err(BudgetError::NoAvailableContext {
            job: job.name.clone(),
            limit: job.input_context_limit,
            overhead: job.input_context_overhead,
        });
    }
    let available = available as usize;

    let shared_tokens = shared_context_cost(context, counter);
    info!("shared example context tokens (sent with every record): {shared_tokens}");

    let mut validated = Vec::with_capacity(records.len());
    let mut rejected = Vec::new();
    let mut max_record_tokens = 0;

    for record in records {
        let record_tokens = record_cost(&record, counter);
        max_record_tokens = max_record_tokens.max(record_tokens);
        let total = record_tokens + shared_tokens;
        if total > available {
            rejected.push(Rejection {
                record_id: record.id,
                source: record.source.clone(),
                record_tokens,
                shared_tokens,
                total_tokens: total,
                available,
            });
        } else {
            validated.push(ValidatedRecord {
                record,
                token_cost: record_tokens,
            });
        }
    }

    if rejected.is_empty() {
        info!(
            "budget ok: {} records, largest={} tokens, max request={} of {} available",
            validated.len(),
            max_record_tokens,
            max_record_tokens + shared_tokens,
            available
        );
    } else {
        warn!(
            "budget exceeded by {} of {} records",
            rejected.len(),
            rejected.len() + validated.len()
        );
    }

    Ok(BudgetReport {
        validated,
        rejected,
        shared_context_tokens: shared_tokens,
        available_context: available,
        max_record_tokens,
    })
}
