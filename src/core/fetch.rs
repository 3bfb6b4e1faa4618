use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// File and URL content access used by the project resolver and the
/// retrieval index. Kept behind a trait so tests can substitute an
/// in-memory store.
#[async_trait]
pub trait FileFetch: Send + Sync {
    async fn read(&self, filename: &str) -> Result<String>;
    async fn list(&self, pattern: &str) -> Result<Vec<String>>;
}

pub fn is_url(target: &str) -> bool {
    target.starts_with("http://") || target.starts_with("https://")
}

/// Local filesystem plus HTTP(S) fetch.
pub struct NativeFetch {
    client: reqwest::Client,
}

impl NativeFetch {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for NativeFetch {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileFetch for NativeFetch {
    async fn read(&self, filename: &str) -> Result<String> {
        if is_url(filename) {
            let res = self.client.get(filename).send().await?;
            if !res.status().is_success() {
                return Err(anyhow!("fetch {} failed: {}", filename, res.status()));
            }
            return Ok(res.text().await?);
        }
        tokio::fs::read_to_string(filename)
            .await
            .with_context(|| format!("reading {filename}"))
    }

    async fn list(&self, pattern: &str) -> Result<Vec<String>> {
        // Patterns are suffix globs: everything up to the first wildcard
        // component is the root directory, everything after the last `*`
        // must match the end of the path.
        if let Some(star) = pattern.find('*') {
            let root = pattern[..star].trim_end_matches(['/', '*']);
            let root = if root.is_empty() { "." } else { root };
            let suffix = pattern[star..].trim_start_matches('*').trim_start_matches('/');
            let suffix = suffix.trim_start_matches('*');
            let mut found = walk_files(Path::new(root)).await?;
            found.retain(|f| suffix.is_empty() || f.ends_with(suffix));
            found.sort();
            return Ok(found);
        }

        let path = Path::new(pattern);
        let meta = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(_) => return Ok(Vec::new()),
        };
        if meta.is_dir() {
            let mut found = walk_files(path).await?;
            found.sort();
            Ok(found)
        } else {
            Ok(vec![pattern.to_string()])
        }
    }
}

async fn walk_files(root: &Path) -> Result<Vec<String>> {
    let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];
    let mut found = Vec::new();
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if path.is_dir() {
                // Skip VCS metadata and build output
                if name.starts_with('.') || name == "target" || name == "node_modules" {
                    continue;
                }
                pending.push(path);
            } else {
                found.push(path.to_string_lossy().trim_start_matches("./").to_string());
            }
        }
    }
    Ok(found)
}
