use anyhow::Result;
use async_trait::async_trait;
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// One ranked match returned by a backend query.
#[derive(Debug, Clone)]
pub struct RankedFragment {
    /// Backend-assigned opaque identifier of the index entry.
    pub id: String,
    pub filename: String,
    pub text: String,
    pub score: f64,
}

/// Storage and ranking for the retrieval index. The scoring strategy is
/// the backend's own business; the service layer only depends on ranked
/// results coming back in descending score order.
#[async_trait]
pub trait RetrievalBackend: Send + Sync {
    async fn init(&self) -> Result<()>;
    async fn clear(&self) -> Result<()>;
    /// Replace all fragments for `filename` with a fresh chunking of
    /// `content`.
    async fn upsert(&self, filename: &str, content: &str) -> Result<()>;
    async fn query(&self, text: &str, top_k: usize) -> Result<Vec<RankedFragment>>;
}

// Fragment chunks target this size so one excerpt stays prompt-friendly.
const CHUNK_TARGET_BYTES: usize = 1200;

/// SQLite-backed default backend. All access serializes behind one async
/// mutex, so mutations never interleave and queries never observe torn
/// state.
pub struct SqliteBackend {
    db: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(dir) = path.as_ref().parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)?;
        }
        let db = Connection::open(path)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }
}

#[async_trait]
impl RetrievalBackend for SqliteBackend {
    async fn init(&self) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "CREATE TABLE IF NOT EXISTS retrieval_fragments (
                id TEXT PRIMARY KEY,
                filename TEXT NOT NULL,
                seq INTEGER NOT NULL,
                content TEXT NOT NULL,
                indexed_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_retrieval_fragments_filename
             ON retrieval_fragments(filename)",
            [],
        )?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let db = self.db.lock().await;
        db.execute("DELETE FROM retrieval_fragments", [])?;
        Ok(())
    }

    async fn upsert(&self, filename: &str, content: &str) -> Result<()> {
        let db = self.db.lock().await;
        // Single transaction: replacing a file's fragments is atomic.
        db.execute_batch("BEGIN")?;
        let outcome = (|| -> Result<()> {
            db.execute(
                "DELETE FROM retrieval_fragments WHERE filename = ?1",
                [filename],
            )?;
            for (seq, chunk) in chunk_content(content).into_iter().enumerate() {
                db.execute(
                    "INSERT INTO retrieval_fragments (id, filename, seq, content)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![
                        uuid::Uuid::new_v4().to_string(),
                        filename,
                        seq as i64,
                        chunk
                    ],
                )?;
            }
            Ok(())
        })();
        match outcome {
            Ok(()) => {
                db.execute_batch("COMMIT")?;
                Ok(())
            }
            Err(e) => {
                db.execute_batch("ROLLBACK").ok();
                Err(e)
            }
        }
    }

    async fn query(&self, text: &str, top_k: usize) -> Result<Vec<RankedFragment>> {
        let terms = query_terms(text);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let db = self.db.lock().await;
        let mut stmt =
            db.prepare("SELECT id, filename, content FROM retrieval_fragments ORDER BY filename, seq")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut scored: Vec<RankedFragment> = Vec::new();
        for row in rows {
            let (id, filename, content) = row?;
            let score = score_fragment(&terms, &content);
            if score > 0.0 {
                scored.push(RankedFragment {
                    id,
                    filename,
                    text: content,
                    score,
                });
            }
        }
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }
}

fn query_terms(text: &str) -> Vec<String> {
    let mut terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 3)
        .map(|t| t.to_lowercase())
        .collect();
    terms.sort();
    terms.dedup();
    terms
}

fn score_fragment(terms: &[String], content: &str) -> f64 {
    let haystack = content.to_lowercase();
    let mut score = 0.0;
    for term in terms {
        score += haystack.matches(term.as_str()).count() as f64;
    }
    // Mild length normalization keeps short exact matches ahead of long
    // fragments that merely mention a term often.
    score / (1.0 + (content.len() as f64 / CHUNK_TARGET_BYTES as f64))
}

/// Split content into paragraph-aligned chunks of roughly
/// CHUNK_TARGET_BYTES.
fn chunk_content(content: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for paragraph in content.split("\n\n") {
        if !current.is_empty() && current.len() + paragraph.len() > CHUNK_TARGET_BYTES {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
    }
    if !current.trim().is_empty() {
        chunks.push(current);
    }
    chunks.retain(|c| !c.trim().is_empty());
    chunks
}

/// In-memory mock backend used across the retrieval and RPC tests.
#[cfg(test)]
pub(crate) struct MemoryBackend {
    pub entries: Mutex<HashMap<String, String>>,
    pub query_calls: std::sync::atomic::AtomicUsize,
    pub canned: Vec<RankedFragment>,
}

#[cfg(test)]
impl MemoryBackend {
    pub fn new(canned: Vec<RankedFragment>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            query_calls: std::sync::atomic::AtomicUsize::new(0),
            canned,
        }
    }
}

#[cfg(test)]
#[async_trait]
impl RetrievalBackend for MemoryBackend {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.lock().await.clear();
        Ok(())
    }

    async fn upsert(&self, filename: &str, content: &str) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert(filename.to_string(), content.to_string());
        Ok(())
    }

    async fn query(&self, _text: &str, top_k: usize) -> Result<Vec<RankedFragment>> {
        self.query_calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(self.canned.iter().take(top_k).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_replaces_previous_fragments() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.init().await.unwrap();
        backend.upsert("doc.md", "alpha beta gamma").await.unwrap();
        backend.upsert("doc.md", "delta epsilon").await.unwrap();

        let hits = backend.query("alpha", 10).await.unwrap();
        assert!(hits.is_empty());
        let hits = backend.query("delta", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].filename, "doc.md");
    }

    #[tokio::test]
    async fn query_ranks_by_term_occurrences() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.init().await.unwrap();
        backend
            .upsert("strong.md", "tokio tokio tokio runtime")
            .await
            .unwrap();
        backend.upsert("weak.md", "tokio mentioned once").await.unwrap();

        let hits = backend.query("tokio", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].filename, "strong.md");
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.init().await.unwrap();
        backend.upsert("doc.md", "searchable content").await.unwrap();
        backend.clear().await.unwrap();
        assert!(backend.query("searchable", 10).await.unwrap().is_empty());
    }

    #[test]
    fn chunking_splits_on_paragraphs() {
        let paragraph = "x".repeat(700);
        let content = format!("{paragraph}\n\n{paragraph}\n\n{paragraph}");
        let chunks = chunk_content(&content);
        assert!(chunks.len() >= 2);
        assert!(chunks.iter().all(|c| !c.trim().is_empty()));
    }

    #[test]
    fn short_query_terms_are_ignored() {
        assert!(query_terms("a an it").is_empty());
        assert_eq!(query_terms("retry Loop retry"), vec!["loop", "retry"]);
    }
}
