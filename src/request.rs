use crate::{
    budget::ValidatedRecord,
    catalog::JobDefinition,
    input::SharedContext,
    schema::OutputSchema,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const RECORD_PREAMBLE: &str = "Here is the record I want reviewed. Provide a detailed response.";
pub const CONTEXT_PREAMBLE: &str = "Here is information you can use to help create your response:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Developer,
    User,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Everything the inference boundary needs for one record. Built once and
/// never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestDescriptor {
    pub record_id: u64,
    pub source: String,
    pub token_cost: usize,
    pub model: String,
    pub temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u32>,
    pub messages: Vec<Message>,
    pub response_format: Value,
}

pub fn build(
    record: &ValidatedRecord,
    context: &SharedContext,
    job: &JobDefinition,
    schema: &OutputSchema,
) -> RequestDescriptor {
    let mut messages = vec![
        Message::new(Role::Developer, job.assistant_role.as_str()),
        Message::new(Role::User, RECORD_PREAMBLE),
        Message::new(Role::User, format!("[{}]", record.record.json)),
    ];
    if !context.is_empty() {
        messages.push(Message::new(Role::Developer, CONTEXT_PREAMBLE));
        messages.push(Message::new(Role::Developer, context.json()));
    }

    RequestDescriptor {
        record_id: record.record.id,
        source: record.record.source.clone(),
        token_cost: record.token_cost,
        model: job.model.clone(),
        temperature: job.temperature,
        max_completion_tokens: (job.output_context_limit > 0).then_some(job.output_context_limit),
        messages,
        response_format: schema.response_format(),
    }
}

/// Builds descriptors for every validated record, in submission order.
pub fn build_all(
    records: &[ValidatedRecord],
    context: &SharedContext,
    job: &JobDefinition,
    schema: &OutputSchema,
) -> Vec<RequestDescriptor> {
    records
        .iter()
        .map(|r| build(r, context, job, schema))
        .collect()
}
