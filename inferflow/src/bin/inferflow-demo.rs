//! Runs a few prompts through an in-memory pipeline.
//!
//! Usage: `inferflow-demo [PROMPT]...`
//!
//! Configuration is read from the JSON file named by `INFERFLOW_CONFIG`,
//! if set, then from `INFERFLOW_*` overrides. Payloads larger than the
//! inline limit are written under `INFERFLOW_OBJECT_DIR` when set.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use inferflow::prelude::*;

const CORPUS: &[&str] = &[
    "Rust guarantees memory safety without a garbage collector.",
    "Tokio is an asynchronous runtime for the Rust programming language.",
    "A saga undoes completed steps when a later step fails.",
    "Dead letter queues hold messages that could not be processed.",
    "Exponential backoff spaces out retries of a failing operation.",
];

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(str::to_lowercase)
        .collect()
}

/// Picks corpus lines sharing a word with the prompt.
struct KeywordRetriever;

#[async_trait]
impl StageExecutor for KeywordRetriever {
    fn stage(&self) -> Stage {
        Stage::Retrieve
    }

    async fn execute(&self, _job_id: JobId, input: serde_json::Value) -> Result<serde_json::Value, HandlerError> {
        let prompt = input["prompt"]
            .as_str()
            .ok_or_else(|| HandlerError::permanent("input has no prompt"))?
            .to_string();
        let terms = words(&prompt);
        let documents: Vec<&str> = CORPUS
            .iter()
            .copied()
            .filter(|doc| words(doc).iter().any(|w| terms.contains(w)))
            .collect();
        Ok(serde_json::json!({ "prompt": prompt, "documents": documents }))
    }
}

/// Orders documents by how many prompt words they contain.
struct OverlapReranker;

#[async_trait]
impl StageExecutor for OverlapReranker {
    fn stage(&self) -> Stage {
        Stage::Rerank
    }

    async fn execute(&self, _job_id: JobId, input: serde_json::Value) -> Result<serde_json::Value, HandlerError> {
        let prompt = input["prompt"].as_str().unwrap_or_default().to_string();
        let terms = words(&prompt);
        let mut documents: Vec<String> = input["documents"]
            .as_array()
            .map(|docs| docs.iter().filter_map(|d| d.as_str().map(String::from)).collect())
            .unwrap_or_default();
        documents.sort_by_key(|doc| std::cmp::Reverse(words(doc).iter().filter(|w| terms.contains(w)).count()));
        documents.truncate(2);
        Ok(serde_json::json!({ "prompt": prompt, "documents": documents }))
    }
}

/// Answers with the best context line.
struct TemplateModel;

#[async_trait]
impl StageExecutor for TemplateModel {
    fn stage(&self) -> Stage {
        Stage::Generate
    }

    async fn execute(&self, _job_id: JobId, input: serde_json::Value) -> Result<serde_json::Value, HandlerError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let prompt = input["prompt"].as_str().unwrap_or_default();
        let answer = input["documents"][0]
            .as_str()
            .map_or_else(|| format!("I have no context for '{prompt}'."), |doc| format!("Regarding '{prompt}': {doc}"));
        Ok(serde_json::json!({ "answer": answer }))
    }
}

fn load_config() -> Result<InferflowConfig> {
    let config = match std::env::var("INFERFLOW_CONFIG") {
        Ok(path) => InferflowConfig::from_json_file(&path)
            .with_context(|| format!("loading configuration from {path}"))?,
        Err(_) => InferflowConfig::default(),
    };
    Ok(config.with_env_overrides()?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    init_tracing(config.log_format);

    let mut builder = Engine::builder()
        .config(config)
        .executor(Arc::new(KeywordRetriever))
        .executor(Arc::new(OverlapReranker))
        .executor(Arc::new(TemplateModel));
    if let Ok(dir) = std::env::var("INFERFLOW_OBJECT_DIR") {
        info!(dir = %dir, "Offloading large payloads to disk");
        builder = builder.object_store(Arc::new(FileObjectStore::new(dir)));
    }
    let engine = builder.build().context("building engine")?;
    let handle = engine.start();
    let jobs = engine.job_service();

    let mut prompts: Vec<String> = std::env::args().skip(1).collect();
    if prompts.is_empty() {
        prompts = vec![
            "Why use exponential backoff for retries?".to_string(),
            "What does a saga do when a step fails?".to_string(),
        ];
    }

    let mut submitted = Vec::with_capacity(prompts.len());
    for prompt in prompts {
        submitted.push((jobs.submit_default(prompt.clone()).await?, prompt));
    }

    for (job_id, prompt) in submitted {
        let view = jobs.wait_for_terminal(job_id, Duration::from_secs(30)).await?;
        match jobs.get_result(job_id).await? {
            Some(output) => info!(job_id = %job_id, prompt = %prompt, answer = %output["answer"], "Job finished"),
            None => warn!(job_id = %job_id, status = %view.status, error = ?view.error, "Job did not complete"),
        }
    }

    let stats = handle.stats();
    handle.shutdown().await?;
    info!(?stats, "Demo finished");
    Ok(())
}
