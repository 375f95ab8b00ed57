use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: Global,
    #[serde(default)]
    pub paths: Paths,
    #[serde(default)]
    pub input: Input,
    #[serde(default)]
    pub api: Api,
    #[serde(default)]
    pub tokenizer: Tokenizer,
    #[serde(default)]
    pub output: Output,
    #[serde(default)]
    pub logging: Logging,
    #[serde(default)]
    pub debug: Debug,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let cfg: Config = toml::from_str(&raw).with_context(|| "parsing TOML")?;
        Ok(cfg)
    }

    /// A stable, normalization-friendly string for hashing.
    pub fn normalized_for_hash(&self) -> String {
        toml::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Global {
    pub max_concurrency: usize,
    pub progress_interval_seconds: u64,
    pub print_summary: bool,
}
impl Default for Global {
    fn default() -> Self {
        Self {
            max_concurrency: 50,
            progress_interval_seconds: 5,
            print_summary: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paths {
    pub catalog: String,
    pub records_dir: String,
    pub context_dir: String,
    pub out_dir: String,
}
impl Default for Paths {
    fn default() -> Self {
        Self {
            catalog: "jobs.toml".into(),
            records_dir: "context/records".into(),
            context_dir: "context/examples".into(),
            out_dir: "out".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Input {
    pub normalize_unicode: bool,
}
impl Default for Input {
    fn default() -> Self {
        Self {
            normalize_unicode: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Api {
    pub base_url: String,
    pub api_key_env: String,
    pub api_key_file: String,
    pub request_timeout_seconds: u64,
}
impl Default for Api {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            api_key_file: "".into(),
            request_timeout_seconds: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tokenizer {
    pub fallback_encoding: String,
}
impl Default for Tokenizer {
    fn default() -> Self {
        Self {
            fallback_encoding: "o200k_base".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Output {
    pub results_filename: String,
    pub descriptors_filename: String,
    pub summary_filename: String,
    pub write_descriptors: bool,
    pub write_summary_json: bool,
    pub write_index_json: bool,
}
impl Default for Output {
    fn default() -> Self {
        Self {
            results_filename: "results.jsonl".into(),
            descriptors_filename: "descriptors.jsonl".into(),
            summary_filename: "summary.json".into(),
            write_descriptors: true,
            write_summary_json: true,
            write_index_json: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    pub level: String,
    pub json: bool,
    pub write_to_file: bool,
    pub file_path: String,
}
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            write_to_file: true,
            file_path: "".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Debug {
    pub dump_effective_config: bool,
    pub write_parse_failures: bool,
}
impl Default for Debug {
    fn default() -> Self {
        Self {
            dump_effective_config: true,
            write_parse_failures: true,
        }
    }
}
