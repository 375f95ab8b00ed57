//! Job catalog: job definitions, model pricing and per-job questions.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("reading catalog {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("parsing catalog {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("no job named {0:?} in catalog")]
    UnknownJob(String),

    #[error("catalog defines job {0:?} more than once")]
    DuplicateJob(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub jobs: Vec<JobDefinition>,
    #[serde(default)]
    pub pricing: Vec<PricingEntry>,
    #[serde(default)]
    pub questions: Vec<QuestionDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    pub input_context_limit: i64,
    #[serde(default)]
    pub input_context_overhead: i64,
    #[serde(default)]
    pub output_context_limit: u32,
    pub assistant_role: String,
    #[serde(default)]
    pub tool_description: String,
}

fn default_temperature() -> f64 {
    1.0
}

impl JobDefinition {
    /// Tokens left for record plus shared context. May be zero or negative
    /// for a misconfigured job.
    pub fn available_context(&self) -> i64 {
        self.input_context_limit - self.input_context_overhead
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingEntry {
    pub model: String,
    pub input_cost_per_million: f64,
    #[serde(default)]
    pub cached_input_cost_per_million: Option<f64>,
    pub output_cost_per_million: f64,
}

/// One output field requested from the model for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionDef {
    pub job: String,
    pub key: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Context table (by file name) whose first column supplies enum values.
    #[serde(default)]
    pub enum_source: Option<String>,
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let catalog: Catalog = toml::from_str(&raw).map_err(|source| CatalogError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        catalog.check_unique_jobs()?;
        Ok(catalog)
    }

    fn check_unique_jobs(&self) -> Result<(), CatalogError> {
        let mut seen = std::collections::HashSet::new();
        for job in &self.jobs {
            if !seen.insert(job.name.as_str()) {
                return Err(CatalogError::DuplicateJob(job.name.clone()));
            }
        }
        Ok(())
    }

    pub fn job(&self, name: &str) -> Result<&JobDefinition, CatalogError> {
        self.jobs
            .iter()
            .find(|j| j.name == name)
            .ok_or_else(|| CatalogError::UnknownJob(name.to_string()))
    }

    pub fn pricing_for(&self, model: &str) -> Option<&PricingEntry> {
        self.pricing.iter().find(|p| p.model == model)
    }

    pub fn questions_for<'a>(&'a self, job: &'a str) -> impl Iterator<Item = &'a QuestionDef> + 'a {
        self.questions.iter().filter(move |q| q.job == job)
    }
}
