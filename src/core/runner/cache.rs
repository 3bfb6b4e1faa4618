use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use tracing::debug;

use crate::core::llm::{ChatMessage, ModelOutput, ModelParams};

#[derive(Serialize, Deserialize)]
struct CachedOutput {
    text: String,
    token_count: u64,
}

/// Cache key over everything that determines the model's reply: the
/// sampling parameters and the full prompt.
pub(super) fn key(params: &ModelParams, prompt: &[ChatMessage]) -> String {
    let mut hasher = DefaultHasher::new();
    format!("{params:?}").hash(&mut hasher);
    for message in prompt {
        message.role.hash(&mut hasher);
        message.content.hash(&mut hasher);
    }
    format!("{:016x}", hasher.finish())
}

pub(super) async fn lookup(dir: &Path, key: &str) -> Option<ModelOutput> {
    let path = dir.join(format!("{key}.json"));
    let raw = tokio::fs::read_to_string(&path).await.ok()?;
    let cached: CachedOutput = serde_json::from_str(&raw).ok()?;
    debug!("cache hit: {}", path.display());
    Some(ModelOutput {
        text: cached.text,
        token_count: cached.token_count,
    })
}

/// Best-effort: a cache write failure never affects the run.
pub(super) async fn store(dir: &Path, key: &str, output: &ModelOutput) {
    let cached = CachedOutput {
        text: output.text.clone(),
        token_count: output.token_count,
    };
    let Ok(raw) = serde_json::to_string(&cached) else {
        return;
    };
    if tokio::fs::create_dir_all(dir).await.is_err() {
        return;
    }
    if let Err(e) = tokio::fs::write(dir.join(format!("{key}.json")), raw).await {
        debug!("cache write failed: {}", e);
    }
}
