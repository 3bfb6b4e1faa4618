pub mod backoff;
mod cache;
pub mod directives;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::core::errors::SpecrunError;
use crate::core::fetch::FileFetch;
use crate::core::llm::{ChatMessage, ModelClient, ModelParams, PartialChunk};
use crate::core::project::{Fragment, Project, Script};
use crate::core::retrieval::{RetrievalService, SearchOptions};

pub const DEFAULT_MODEL: &str = "gpt-4";
const CACHE_DIR: &str = ".specrun/cache";
pub const DEFAULT_RETRY_COUNT: u32 = 8;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(15_000);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(180_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Notice,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Notice => "notice",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "error" => Some(Severity::Error),
            "warning" => Some(Severity::Warning),
            "notice" => Some(Severity::Notice),
            _ => None,
        }
    }
}

/// A diagnostic extracted from a run's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annotation {
    pub severity: Severity,
    pub filename: String,
    pub start_line: u32,
    pub end_line: u32,
    pub message: String,
}

/// A proposed full-content replacement for one file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEdit {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    pub after: String,
}

/// The immutable output record of one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunResult {
    pub text: Option<String>,
    pub error: Option<String>,
    pub annotations: Vec<Annotation>,
    pub changelogs: Vec<String>,
    pub frames: Vec<serde_json::Value>,
    pub file_edits: BTreeMap<String, FileEdit>,
    pub prompt: Vec<ChatMessage>,
    pub trace: Option<String>,
}

/// Everything that parameterizes one run. Immutable for the run's
/// lifetime.
#[derive(Debug, Clone)]
pub struct RunConfiguration {
    pub model: String,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub seed: Option<i64>,
    pub max_tokens: Option<u32>,
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub max_delay: Duration,
    pub cache: bool,
    pub dry_run: bool,
    pub label: Option<String>,
    pub vars: HashMap<String, String>,
    pub trace: bool,
}

impl Default for RunConfiguration {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            temperature: None,
            top_p: None,
            seed: None,
            max_tokens: None,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_delay: DEFAULT_RETRY_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            cache: false,
            dry_run: false,
            label: None,
            vars: HashMap::new(),
            trace: false,
        }
    }
}

impl RunConfiguration {
    fn model_params(&self) -> ModelParams {
        ModelParams {
            model: self.model.clone(),
            temperature: self.temperature,
            top_p: self.top_p,
            seed: self.seed,
            max_tokens: self.max_tokens,
        }
    }
}

/// Events streamed to the caller while a run is in flight. Delivered
/// through an unbounded channel so a slow consumer never blocks the call
/// loop.
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// Milestone/status text ("querying", retry notices).
    Status(String),
    /// One incremental text chunk with the cumulative token count.
    Chunk { text: String, tokens_so_far: u64 },
}

/// Markdown trace accumulated during a run when tracing is enabled.
#[derive(Debug, Default)]
struct Trace {
    enabled: bool,
    lines: Vec<String>,
}

impl Trace {
    fn new(enabled: bool) -> Self {
        Self {
            enabled,
            lines: Vec::new(),
        }
    }

    fn log(&mut self, line: impl Into<String>) {
        if self.enabled {
            self.lines.push(line.into());
        }
    }

    fn finish(self) -> Option<String> {
        if self.enabled {
            Some(self.lines.join("\n"))
        } else {
            None
        }
    }
}

/// Pick the script and target fragment for a run. The fragment is the
/// first one of the first specification by convention.
pub fn resolve<'p>(
    project: &'p Project,
    script_id: &str,
) -> Result<(&'p Script, &'p Fragment), SpecrunError> {
    let script = project
        .find_script(script_id)
        .ok_or_else(|| SpecrunError::NotFound(format!("script {script_id}")))?;
    let fragment = project
        .spec_files
        .iter()
        .flat_map(|f| f.fragments.first())
        .next()
        .ok_or_else(|| {
            SpecrunError::NotFound("specification resolved to zero fragments".to_string())
        })?;
    Ok((script, fragment))
}

/// Execute one run: build the prompt, call the model inside the retry
/// loop, post-process directives. Produces exactly one RunResult; model
/// failures are captured in it rather than propagated.
pub async fn run_script(
    script: &Script,
    fragment: &Fragment,
    config: &RunConfiguration,
    model: &dyn ModelClient,
    fetch: &dyn FileFetch,
    retrieval: Option<&RetrievalService>,
    events: &UnboundedSender<RunEvent>,
) -> RunResult {
    let mut trace = Trace::new(config.trace);
    trace.log(format!("# run {}", config.label.as_deref().unwrap_or(&script.id)));
    trace.log(format!("- script: {} ({})", script.id, script.filename));
    trace.log(format!("- fragment: {}", fragment.id));

    let prompt = build_prompt(script, fragment, config, fetch, retrieval, &mut trace).await;

    if config.dry_run {
        trace.log("- dry run, model call skipped");
        return RunResult {
            prompt,
            trace: trace.finish(),
            ..Default::default()
        };
    }

    let params = config.model_params();
    let cache_key = config.cache.then(|| cache::key(&params, &prompt));

    let mut cached = None;
    if let Some(key) = &cache_key
        && let Some(output) = cache::lookup(Path::new(CACHE_DIR), key).await
    {
        trace.log("- cache hit, model call skipped");
        let _ = events.send(RunEvent::Chunk {
            text: output.text.clone(),
            tokens_so_far: output.token_count,
        });
        cached = Some(output);
    }

    let outcome = match cached {
        Some(output) => Ok(output),
        None => {
            let _ = events.send(RunEvent::Status("querying".to_string()));

            // Chunks are held back per attempt and flushed only when the
            // attempt succeeds: the consumer never sees output from an
            // attempt that is later retried, and token counts stay
            // monotone within the run.
            let pending: std::sync::Mutex<Vec<PartialChunk>> =
                std::sync::Mutex::new(Vec::new());
            let on_partial = |chunk: PartialChunk| {
                if let Ok(mut pending) = pending.lock() {
                    pending.push(chunk);
                }
            };

            let mut attempt = 0u32;
            let outcome = loop {
                attempt += 1;
                if let Ok(mut pending) = pending.lock() {
                    pending.clear();
                }
                match model.call(&prompt, &params, &on_partial).await {
                    Ok(output) => {
                        if let Ok(mut pending) = pending.lock() {
                            for chunk in pending.drain(..) {
                                // Fire-and-forget: an unbounded send never
                                // blocks the loop.
                                let _ = events.send(RunEvent::Chunk {
                                    text: chunk.text,
                                    tokens_so_far: chunk.tokens_so_far,
                                });
                            }
                        }
                        trace.log(format!(
                            "- attempt {attempt}: ok ({} tokens)",
                            output.token_count
                        ));
                        break Ok(output);
                    }
                    Err(e) if e.is_transient() && attempt < config.retry_count => {
                        let delay = backoff::delay_for_attempt(
                            attempt + 1,
                            config.retry_delay,
                            config.max_delay,
                        );
                        trace.log(format!(
                            "- attempt {attempt}: transient failure, retrying in {}ms: {e}",
                            delay.as_millis()
                        ));
                        warn!("model call attempt {} failed, retrying: {}", attempt, e);
                        let _ = events.send(RunEvent::Status(format!(
                            "retrying in {}s",
                            delay.as_secs()
                        )));
                        tokio::time::sleep(backoff::jittered(delay)).await;
                    }
                    Err(e) => {
                        trace.log(format!("- attempt {attempt}: fatal: {e}"));
                        break Err(e);
                    }
                }
            };
            if let (Ok(output), Some(key)) = (&outcome, &cache_key) {
                cache::store(Path::new(CACHE_DIR), key, output).await;
            }
            outcome
        }
    };

    match outcome {
        Ok(output) => {
            let parsed = directives::parse(&output.text);
            for dropped in &parsed.dropped {
                trace.log(format!("- dropped malformed directive: {dropped}"));
            }
            debug!(
                "run complete: {} annotations, {} edits, {} frames",
                parsed.annotations.len(),
                parsed.file_edits.len(),
                parsed.frames.len()
            );
            RunResult {
                text: Some(output.text),
                error: None,
                annotations: parsed.annotations,
                changelogs: parsed.changelogs,
                frames: parsed.frames,
                file_edits: parsed.file_edits,
                prompt,
                trace: trace.finish(),
            }
        }
        Err(e) => RunResult {
            text: None,
            error: Some(e.to_string()),
            prompt,
            trace: trace.finish(),
            ..Default::default()
        },
    }
}

/// Assemble the prompt message sequence: script body (plus caller vars)
/// as the system message, retrieval excerpts when the script asks for
/// them, then the fragment text and its referenced files.
async fn build_prompt(
    script: &Script,
    fragment: &Fragment,
    config: &RunConfiguration,
    fetch: &dyn FileFetch,
    retrieval: Option<&RetrievalService>,
    trace: &mut Trace,
) -> Vec<ChatMessage> {
    let mut messages = Vec::new();

    let mut system = script.prompt.clone();
    if !config.vars.is_empty() {
        let mut vars: Vec<(&String, &String)> = config.vars.iter().collect();
        vars.sort();
        system.push_str("\n\n### Variables\n");
        for (k, v) in vars {
            system.push_str(&format!("{k}: {v}\n"));
        }
    }
    messages.push(ChatMessage::system(system));

    if script.retrieval
        && let Some(service) = retrieval
    {
        let query = if fragment.title.is_empty() {
            fragment.text.chars().take(200).collect()
        } else {
            fragment.title.clone()
        };
        match service.search(&query, &SearchOptions::default()).await {
            Ok(res) if !res.files.is_empty() => {
                let mut context = String::from("Relevant indexed content:\n");
                for file in &res.files {
                    context.push_str(&format!("\nFILE {}\n{}\n", file.filename, file.content));
                }
                trace.log(format!("- retrieval: {} files injected", res.files.len()));
                messages.push(ChatMessage::system(context));
            }
            Ok(_) => trace.log("- retrieval: no matches"),
            Err(e) => trace.log(format!("- retrieval failed: {e:#}")),
        }
    }

    let mut user = format!("{}\n\n{}", fragment.title, fragment.text);
    for reference in &fragment.references {
        match fetch.read(&reference.filename).await {
            Ok(content) => {
                user.push_str(&format!("\n\nFILE {}:\n{}", reference.filename, content));
            }
            Err(e) => {
                trace.log(format!(
                    "- reference {} ({}) unreadable: {e:#}",
                    reference.name, reference.filename
                ));
            }
        }
    }
    messages.push(ChatMessage::user(user));

    messages
}

#[cfg(test)]
mod tests;
