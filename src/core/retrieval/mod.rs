pub mod backend;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::core::fetch::{FileFetch, is_url};
use backend::RetrievalBackend;

// Non-text content types that are still worth indexing.
const INDEXABLE_MIME_TYPES: &[&str] = &[
    "application/pdf",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
];

pub const DEFAULT_TOP_K: usize = 6;

/// ok/error status of one index operation, returned as data rather than
/// an error so a failed item never aborts its batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseStatus {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseStatus {
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(msg.into()),
        }
    }
}

/// A source file or synthesized excerpt carried through search results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFile {
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResponse {
    /// One synthesized excerpt per distinct source file, fragments joined
    /// in rank order with ellipsis markers.
    pub files: Vec<SourceFile>,
    /// Raw matched fragments in rank order, labeled with their entry id.
    pub fragments: Vec<SourceFile>,
}

/// Per-item progress of an upsert batch. The `succeeded` field is absent
/// on the "before" event and present on the outcome event.
#[derive(Debug, Clone, Serialize)]
pub struct UpsertProgress {
    pub count: usize,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub succeeded: Option<bool>,
}

#[derive(Default)]
pub struct UpsertOptions {
    /// Inline content; when absent the target is fetched.
    pub content: Option<String>,
    pub cancel: CancellationToken,
    pub progress: Option<UnboundedSender<UpsertProgress>>,
}

#[derive(Default)]
pub struct SearchOptions {
    pub top_k: Option<usize>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceState {
    Uninitialized,
    Ready,
}

/// The retrieval index service. `init` must complete before any other
/// operation; every public operation awaits it internally, so callers
/// holding a service handle cannot observe an uninitialized index.
pub struct RetrievalService {
    backend: Arc<dyn RetrievalBackend>,
    fetch: Arc<dyn FileFetch>,
    state: Mutex<ServiceState>,
}

impl RetrievalService {
    pub fn new(backend: Arc<dyn RetrievalBackend>, fetch: Arc<dyn FileFetch>) -> Self {
        Self {
            backend,
            fetch,
            state: Mutex::new(ServiceState::Uninitialized),
        }
    }

    /// Idempotent. Concurrent callers serialize on the state lock and all
    /// observe the same completed initialization.
    pub async fn init(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if *state == ServiceState::Ready {
            return Ok(());
        }
        self.backend.init().await?;
        *state = ServiceState::Ready;
        debug!("retrieval: index ready");
        Ok(())
    }

    /// Empty the index. All-or-nothing: on failure the index is left
    /// untouched and the error is reported as data.
    pub async fn clear(&self) -> ResponseStatus {
        if let Err(e) = self.init().await {
            return ResponseStatus::error(e.to_string());
        }
        match self.backend.clear().await {
            Ok(()) => ResponseStatus::ok(),
            Err(e) => ResponseStatus::error(e.to_string()),
        }
    }

    /// Index one file or URL. Unindexable content types are silently
    /// skipped and report ok.
    pub async fn upsert(&self, file_or_url: &str, content: Option<String>) -> ResponseStatus {
        if let Err(e) = self.init().await {
            return ResponseStatus::error(e.to_string());
        }
        if !is_indexable(file_or_url) {
            debug!("retrieval: skipping unindexable {}", file_or_url);
            return ResponseStatus::ok();
        }
        let content = match content {
            Some(c) => c,
            None => match self.fetch.read(file_or_url).await {
                Ok(c) => c,
                Err(e) => return ResponseStatus::error(format!("{e:#}")),
            },
        };
        match self.backend.upsert(file_or_url, &content).await {
            Ok(()) => ResponseStatus::ok(),
            Err(e) => ResponseStatus::error(e.to_string()),
        }
    }

    /// Index a batch. Cancellation is checked before each item, never
    /// mid-item; each item reports progress before and an outcome after,
    /// in input order. Returns the per-item outcomes processed.
    pub async fn upsert_batch(
        &self,
        files: &[String],
        options: &UpsertOptions,
    ) -> Vec<(String, ResponseStatus)> {
        let mut outcomes = Vec::new();
        let mut count = 0;
        for file in files {
            if options.cancel.is_cancelled() {
                debug!("retrieval: upsert batch cancelled after {} items", count);
                break;
            }
            count += 1;
            if let Some(tx) = &options.progress {
                let _ = tx.send(UpsertProgress {
                    count,
                    filename: file.clone(),
                    succeeded: None,
                });
            }
            let status = self.upsert(file, options.content.clone()).await;
            if let Some(tx) = &options.progress {
                let _ = tx.send(UpsertProgress {
                    count,
                    filename: file.clone(),
                    succeeded: Some(status.ok),
                });
            }
            if !status.ok {
                warn!(
                    "retrieval: upsert {} failed: {}",
                    file,
                    status.error.as_deref().unwrap_or("unknown")
                );
            }
            outcomes.push((file.clone(), status));
        }
        outcomes
    }

    /// Query the index and group ranked fragments into one excerpt per
    /// source file. An already-cancelled call returns the empty result
    /// without touching the backend.
    pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<SearchResponse> {
        self.init().await?;
        if options.cancel.is_cancelled() {
            return Ok(SearchResponse::default());
        }

        let top_k = options.top_k.unwrap_or(DEFAULT_TOP_K);
        let ranked = self.backend.query(query, top_k).await?;

        let fragments: Vec<SourceFile> = ranked
            .into_iter()
            .map(|r| SourceFile {
                filename: r.filename,
                label: Some(r.id),
                content: r.text,
            })
            .collect();

        let mut files: Vec<SourceFile> = Vec::new();
        for fragment in &fragments {
            let file = match files.iter_mut().find(|f| f.filename == fragment.filename) {
                Some(f) => f,
                None => {
                    files.push(SourceFile {
                        filename: fragment.filename.clone(),
                        label: Some("fragments".to_string()),
                        content: "...\n".to_string(),
                    });
                    files.last_mut().unwrap()
                }
            };
            file.content.push_str(&fragment.content);
            file.content.push_str("\n...");
        }

        Ok(SearchResponse { files, fragments })
    }
}

/// Content is indexable when its type is text or on the document
/// allow-list. Unknown extensions default to text so extensionless
/// README-style files stay indexable.
pub fn is_indexable(file_or_url: &str) -> bool {
    let path = if is_url(file_or_url) {
        match Url::parse(file_or_url) {
            Ok(u) => u.path().to_string(),
            Err(_) => file_or_url.to_string(),
        }
    } else {
        file_or_url.to_string()
    };
    match mime_guess::from_path(&path).first() {
        Some(mime) => {
            mime.type_() == mime_guess::mime::TEXT
                || INDEXABLE_MIME_TYPES.contains(&mime.essence_str())
        }
        None => true, // no known type, treat as text
    }
}
