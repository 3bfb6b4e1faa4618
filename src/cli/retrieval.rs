use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::fetch::{FileFetch, NativeFetch, is_url};
use crate::core::retrieval::{RetrievalService, SearchOptions, UpsertOptions, UpsertProgress};
use crate::core::retrieval::backend::SqliteBackend;
use crate::core::terminal::{print_error, print_info, print_success, print_warn};

fn print_retrieval_help() {
    println!("Usage: specrun retrieval <subcommand>\n");
    println!("  index <files-or-urls...>   add or refresh documents in the index");
    println!("  search <query> [--top-k n] query the index");
    println!("  clear                      empty the index");
}

fn open_service() -> Result<RetrievalService> {
    let backend = Arc::new(SqliteBackend::open(super::INDEX_DB_PATH)?);
    Ok(RetrievalService::new(backend, Arc::new(NativeFetch::new())))
}

pub(crate) async fn command(args: &[String], start: usize) -> Result<i32> {
    match args.get(start).map(String::as_str) {
        Some("index") => index(&args[start + 1..]).await,
        Some("search") => search(&args[start + 1..]).await,
        Some("clear") => clear().await,
        _ => {
            print_retrieval_help();
            Ok(1)
        }
    }
}

/// Expand the arguments into concrete targets and upsert them one by one.
/// Ctrl-C stops the batch at the next item boundary.
async fn index(patterns: &[String]) -> Result<i32> {
    if patterns.is_empty() {
        print_error("usage: specrun retrieval index <files-or-urls...>");
        return Ok(1);
    }

    let fetch = NativeFetch::new();
    let mut files: Vec<String> = Vec::new();
    for pattern in patterns {
        if is_url(pattern) {
            files.push(pattern.clone());
        } else {
            files.extend(fetch.list(pattern).await?);
        }
    }
    if files.is_empty() {
        print_warn("nothing to index");
        return Ok(0);
    }

    let service = open_service()?;
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let (tx, mut rx) = mpsc::unbounded_channel::<UpsertProgress>();
    let total = files.len();
    let reporter = tokio::spawn(async move {
        while let Some(progress) = rx.recv().await {
            match progress.succeeded {
                None => print_info(&format!(
                    "[{}/{}] indexing {}",
                    progress.count, total, progress.filename
                )),
                Some(false) => print_warn(&format!("failed: {}", progress.filename)),
                Some(true) => {}
            }
        }
    });

    let options = UpsertOptions {
        content: None,
        cancel: cancel.clone(),
        progress: Some(tx),
    };
    let outcomes = service.upsert_batch(&files, &options).await;
    drop(options);
    reporter.await.ok();

    let failed = outcomes.iter().filter(|(_, s)| !s.ok).count();
    if cancel.is_cancelled() {
        print_warn(&format!("interrupted after {} of {} items", outcomes.len(), total));
    }
    if failed > 0 {
        print_error(&format!("{failed} item(s) failed"));
        return Ok(1);
    }
    print_success(&format!("indexed {} item(s)", outcomes.len()));
    Ok(0)
}

async fn search(args: &[String]) -> Result<i32> {
    let mut query: Option<String> = None;
    let mut top_k: Option<usize> = None;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--top-k" | "-k" => {
                if i + 1 < args.len() {
                    top_k = args[i + 1].parse().ok();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            text if query.is_none() => {
                query = Some(text.to_string());
                i += 1;
            }
            _ => i += 1,
        }
    }
    let Some(query) = query else {
        print_error("usage: specrun retrieval search <query> [--top-k n]");
        return Ok(1);
    };

    let service = open_service()?;
    let options = SearchOptions {
        top_k,
        ..Default::default()
    };
    let res = service.search(&query, &options).await?;
    if res.files.is_empty() {
        print_info("no matches");
        return Ok(0);
    }
    for file in &res.files {
        println!("FILE {}", file.filename);
        println!("{}\n", file.content);
    }
    Ok(0)
}

async fn clear() -> Result<i32> {
    let service = open_service()?;
    let status = service.clear().await;
    if let Some(error) = status.error {
        print_error(&error);
        return Ok(1);
    }
    print_success("index cleared");
    Ok(0)
}
