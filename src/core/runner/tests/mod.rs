mod prompt_building;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::core::fetch::FileFetch;
use crate::core::llm::{ChatMessage, ModelClient, ModelError, ModelOutput, ModelParams, PartialChunk};
use crate::core::project::{Fragment, Script, SpecFile};

/// Model client scripted to fail a fixed number of times before
/// succeeding with the given chunks.
pub(crate) struct ScriptedClient {
    pub failures_before_success: u32,
    pub terminal: bool,
    pub chunks: Vec<&'static str>,
    pub calls: AtomicU32,
}

impl ScriptedClient {
    pub fn succeeding(chunks: Vec<&'static str>) -> Self {
        Self {
            failures_before_success: 0,
            terminal: false,
            chunks,
            calls: AtomicU32::new(0),
        }
    }

    pub fn flaky(failures: u32, chunks: Vec<&'static str>) -> Self {
        Self {
            failures_before_success: failures,
            terminal: false,
            chunks,
            calls: AtomicU32::new(0),
        }
    }

    pub fn terminal() -> Self {
        Self {
            failures_before_success: u32::MAX,
            terminal: true,
            chunks: Vec::new(),
            calls: AtomicU32::new(0),
        }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    async fn call(
        &self,
        _messages: &[ChatMessage],
        _params: &ModelParams,
        on_partial: &(dyn Fn(PartialChunk) + Send + Sync),
    ) -> Result<ModelOutput, ModelError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures_before_success {
            return if self.terminal {
                Err(ModelError::Terminal("scripted terminal failure".to_string()))
            } else {
                Err(ModelError::Transient("scripted transient failure".to_string()))
            };
        }
        let mut text = String::new();
        let mut tokens = 0;
        for chunk in &self.chunks {
            tokens += 1;
            text.push_str(chunk);
            on_partial(PartialChunk {
                text: chunk.to_string(),
                tokens_so_far: tokens,
            });
        }
        Ok(ModelOutput {
            text,
            token_count: tokens,
        })
    }
}

/// In-memory file store.
pub(crate) struct MapFetch {
    pub files: HashMap<String, String>,
}

impl MapFetch {
    pub fn new(files: &[(&str, &str)]) -> Self {
        Self {
            files: files
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

#[async_trait]
impl FileFetch for MapFetch {
    async fn read(&self, filename: &str) -> Result<String> {
        self.files
            .get(filename)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such file: {filename}"))
    }

    async fn list(&self, pattern: &str) -> Result<Vec<String>> {
        let suffix = pattern.trim_start_matches(['*', '/', '.']);
        Ok(self
            .files
            .keys()
            .filter(|k| k.ends_with(suffix))
            .cloned()
            .collect())
    }
}

pub(crate) fn test_script(retrieval: bool) -> Script {
    Script {
        id: "review".to_string(),
        title: Some("Review".to_string()),
        description: None,
        filename: "review.script.md".to_string(),
        system: false,
        retrieval,
        prompt: "You are a careful reviewer.".to_string(),
    }
}

pub(crate) fn test_fragment() -> Fragment {
    SpecFile::parse(
        "demo.spec.md",
        "# Demo\n\nCheck the attached file.\n\n-   [lib](./src/lib.rs)\n",
    )
    .fragments
    .remove(0)
}
