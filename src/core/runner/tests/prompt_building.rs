use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{MapFetch, ScriptedClient, test_fragment, test_script};
use crate::core::retrieval::RetrievalService;
use crate::core::retrieval::backend::{MemoryBackend, RankedFragment};
use crate::core::runner::{RunConfiguration, run_script};

#[tokio::test]
async fn vars_are_appended_to_the_system_message() {
    let client = ScriptedClient::succeeding(vec!["ok"]);
    let mut vars = HashMap::new();
    vars.insert("style".to_string(), "terse".to_string());
    let config = RunConfiguration {
        vars,
        ..Default::default()
    };
    let fetch = MapFetch::new(&[("src/lib.rs", "fn x() {}")]);
    let (tx, _rx) = mpsc::unbounded_channel();
    let result = run_script(
        &test_script(false),
        &test_fragment(),
        &config,
        &client,
        &fetch,
        None,
        &tx,
    )
    .await;

    let system = &result.prompt[0];
    assert_eq!(system.role, "system");
    assert!(system.content.contains("style: terse"));
}

#[tokio::test]
async fn referenced_files_are_inlined_into_the_user_message() {
    let client = ScriptedClient::succeeding(vec!["ok"]);
    let fetch = MapFetch::new(&[("src/lib.rs", "pub fn answer() {}")]);
    let (tx, _rx) = mpsc::unbounded_channel();
    let result = run_script(
        &test_script(false),
        &test_fragment(),
        &RunConfiguration::default(),
        &client,
        &fetch,
        None,
        &tx,
    )
    .await;

    let user = result.prompt.last().unwrap();
    assert_eq!(user.role, "user");
    assert!(user.content.contains("FILE src/lib.rs:"));
    assert!(user.content.contains("pub fn answer() {}"));
}

#[tokio::test]
async fn unreadable_references_are_noted_in_trace_not_fatal() {
    let client = ScriptedClient::succeeding(vec!["ok"]);
    let fetch = MapFetch::new(&[]); // src/lib.rs missing
    let config = RunConfiguration {
        trace: true,
        ..Default::default()
    };
    let (tx, _rx) = mpsc::unbounded_channel();
    let result = run_script(
        &test_script(false),
        &test_fragment(),
        &config,
        &client,
        &fetch,
        None,
        &tx,
    )
    .await;

    assert!(result.error.is_none());
    let trace = result.trace.unwrap();
    assert!(trace.contains("unreadable"), "{trace}");
    assert!(trace.contains("src/lib.rs"), "{trace}");
}

#[tokio::test]
async fn retrieval_scripts_get_indexed_excerpts_in_the_prompt() {
    let client = ScriptedClient::succeeding(vec!["ok"]);
    let backend = Arc::new(MemoryBackend::new(vec![RankedFragment {
        id: "e1".to_string(),
        filename: "notes.md".to_string(),
        text: "retry policy notes".to_string(),
        score: 1.0,
    }]));
    let fetch = Arc::new(MapFetch::new(&[("src/lib.rs", "fn x() {}")]));
    let service = RetrievalService::new(backend, fetch.clone());

    let (tx, _rx) = mpsc::unbounded_channel();
    let result = run_script(
        &test_script(true),
        &test_fragment(),
        &RunConfiguration::default(),
        &client,
        fetch.as_ref(),
        Some(&service),
        &tx,
    )
    .await;

    let context = result
        .prompt
        .iter()
        .find(|m| m.content.contains("Relevant indexed content"))
        .expect("retrieval context message");
    assert!(context.content.contains("FILE notes.md"));
    assert!(context.content.contains("retry policy notes"));
}

#[tokio::test]
async fn non_retrieval_scripts_never_query_the_index() {
    let client = ScriptedClient::succeeding(vec!["ok"]);
    let backend = Arc::new(MemoryBackend::new(Vec::new()));
    let fetch = Arc::new(MapFetch::new(&[("src/lib.rs", "fn x() {}")]));
    let service = RetrievalService::new(backend.clone(), fetch.clone());

    let (tx, _rx) = mpsc::unbounded_channel();
    run_script(
        &test_script(false),
        &test_fragment(),
        &RunConfiguration::default(),
        &client,
        fetch.as_ref(),
        Some(&service),
        &tx,
    )
    .await;

    assert_eq!(
        backend.query_calls.load(std::sync::atomic::Ordering::SeqCst),
        0
    );
}
