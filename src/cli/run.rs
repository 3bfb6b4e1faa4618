use anyhow::Result;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::info;

use crate::core::errors::SpecrunError;
use crate::core::fetch::{FileFetch, NativeFetch};
use crate::core::llm::openai::OpenAiClient;
use crate::core::output;
use crate::core::project::{self, SPEC_SUFFIX, SpecFile, SpecSource};
use crate::core::retrieval::RetrievalService;
use crate::core::retrieval::backend::SqliteBackend;
use crate::core::runner::{self, RunConfiguration, RunEvent, Severity};
use crate::core::terminal::{print_error, print_success, print_warn};

#[derive(Debug, Default)]
pub(crate) struct RunFlags {
    pub script: Option<String>,
    pub spec_patterns: Vec<String>,
    pub excludes: Vec<String>,
    pub out: Option<String>,
    pub remove_out: bool,
    pub json: bool,
    pub yaml: bool,
    pub prompt_only: bool,
    pub out_trace: Option<String>,
    pub out_annotations: Option<String>,
    pub out_changelogs: Option<String>,
    pub out_data: Option<String>,
    pub apply_edits: bool,
    pub fail_on_errors: bool,
    pub csv_separator: String,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub seed: Option<i64>,
    pub max_tokens: Option<u32>,
    pub retry: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub cache: bool,
    pub label: Option<String>,
    pub vars: HashMap<String, String>,
    pub help: bool,
}

pub(crate) fn parse_run_flags(args: &[String], start: usize) -> RunFlags {
    let mut flags = RunFlags {
        csv_separator: "\t".to_string(),
        ..Default::default()
    };

    let take = |i: &mut usize| -> Option<String> {
        if *i + 1 < args.len() {
            *i += 2;
            Some(args[*i - 1].clone())
        } else {
            *i += 1;
            None
        }
    };

    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                flags.help = true;
                i += 1;
            }
            "--out" | "-o" => flags.out = take(&mut i),
            "--remove-out" => {
                flags.remove_out = true;
                i += 1;
            }
            "--json" => {
                flags.json = true;
                i += 1;
            }
            "--yaml" => {
                flags.yaml = true;
                i += 1;
            }
            "--prompt" => {
                flags.prompt_only = true;
                i += 1;
            }
            "--out-trace" => flags.out_trace = take(&mut i),
            "--out-annotations" | "--out-diagnostics" => flags.out_annotations = take(&mut i),
            "--out-changelogs" => flags.out_changelogs = take(&mut i),
            "--out-data" => flags.out_data = take(&mut i),
            "--apply-edits" => {
                flags.apply_edits = true;
                i += 1;
            }
            "--fail-on-errors" => {
                flags.fail_on_errors = true;
                i += 1;
            }
            "--csv-separator" => {
                if let Some(sep) = take(&mut i) {
                    flags.csv_separator = sep;
                }
            }
            "--model" | "-m" => flags.model = take(&mut i),
            "--temperature" => {
                flags.temperature = take(&mut i).and_then(|v| v.parse().ok());
            }
            "--top-p" => {
                flags.top_p = take(&mut i).and_then(|v| v.parse().ok());
            }
            "--seed" => {
                flags.seed = take(&mut i).and_then(|v| v.parse().ok());
            }
            "--max-tokens" => {
                flags.max_tokens = take(&mut i).and_then(|v| v.parse().ok());
            }
            "--retry" => {
                flags.retry = take(&mut i).and_then(|v| v.parse().ok());
            }
            "--retry-delay" => {
                flags.retry_delay_ms = take(&mut i).and_then(|v| v.parse().ok());
            }
            "--max-delay" => {
                flags.max_delay_ms = take(&mut i).and_then(|v| v.parse().ok());
            }
            "--cache" => {
                flags.cache = true;
                i += 1;
            }
            "--label" | "-l" => flags.label = take(&mut i),
            "--exclude" => {
                if let Some(pattern) = take(&mut i) {
                    flags.excludes.push(pattern);
                }
            }
            "--vars" => {
                if let Some(pair) = take(&mut i)
                    && let Some((k, v)) = pair.split_once('=')
                {
                    flags.vars.insert(k.to_string(), v.to_string());
                }
            }
            positional if !positional.starts_with('-') => {
                if flags.script.is_none() {
                    flags.script = Some(positional.to_string());
                } else {
                    flags.spec_patterns.push(positional.to_string());
                }
                i += 1;
            }
            _ => i += 1,
        }
    }
    flags
}

impl RunFlags {
    fn configuration(&self) -> RunConfiguration {
        let defaults = RunConfiguration::default();
        RunConfiguration {
            model: self.model.clone().unwrap_or(defaults.model),
            temperature: self.temperature,
            top_p: self.top_p,
            seed: self.seed,
            max_tokens: self.max_tokens,
            retry_count: self.retry.unwrap_or(defaults.retry_count),
            retry_delay: self
                .retry_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_delay),
            max_delay: self
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            cache: self.cache,
            dry_run: self.prompt_only,
            label: self.label.clone(),
            vars: self.vars.clone(),
            // Traces are only kept when something will consume them
            trace: self.out.is_some() || self.out_trace.is_some(),
        }
    }
}

fn print_run_help() {
    println!("Usage: specrun run <script> [specs...] [flags]\n");
    println!("Runs <script> against the given specification files. With no");
    println!("specs the specification is read from stdin; loose (non-spec)");
    println!("files are gathered into a synthesized specification.\n");
    println!("Flags:");
    for (flag, text) in [
        ("--out <dir|file.json>", "write the full artifact set"),
        ("--remove-out", "empty the output directory first"),
        ("--json / --yaml", "print the result to stdout"),
        ("--prompt", "build and print the prompt, skip the model call"),
        ("--out-trace <file>", "write the markdown run trace"),
        ("--out-annotations <file>", "write diagnostics (json/csv/yaml/sarif/jsonl by suffix)"),
        ("--out-changelogs <file>", "write changelog blocks"),
        ("--out-data <file>", "write data frames (json or jsonl)"),
        ("--apply-edits", "apply proposed file edits to the working tree"),
        ("--fail-on-errors", "exit 4 when error diagnostics are present"),
        ("--csv-separator <sep>", "separator for csv outputs (default tab)"),
        ("--model <id>", "model identifier"),
        ("--temperature / --top-p / --seed / --max-tokens", "sampling parameters"),
        ("--retry <n>", "max model call attempts"),
        ("--retry-delay / --max-delay <ms>", "backoff bounds"),
        ("--label <text>", "label for the run"),
        ("--vars k=v", "template variable (repeatable)"),
        ("--exclude <pattern>", "drop matching files from spec expansion (repeatable)"),
        ("--cache", "enable model response caching"),
    ] {
        println!("  {flag:<34} {text}");
    }
}

/// Expand the positional spec arguments into project spec sources,
/// mirroring the stdin / single-spec / loose-files conventions.
async fn assemble_specs(
    fetch: &dyn FileFetch,
    patterns: &[String],
    excludes: &[String],
) -> Result<Vec<SpecSource>> {
    if patterns.is_empty() {
        let mut content = String::new();
        tokio::io::stdin().read_to_string(&mut content).await?;
        return Ok(vec![SpecSource::Inline {
            filename: "stdin.spec.md".to_string(),
            content,
        }]);
    }

    if patterns.len() == 1 && !patterns[0].contains('*') && patterns[0].ends_with(SPEC_SUFFIX) {
        return Ok(vec![SpecSource::File(patterns[0].clone())]);
    }

    let mut files: BTreeSet<String> = BTreeSet::new();
    for pattern in patterns {
        for file in fetch.list(pattern).await? {
            files.insert(file);
        }
    }
    files.retain(|f| {
        !excludes
            .iter()
            .any(|e| f.ends_with(e.trim_start_matches('*')))
    });
    if files.is_empty() {
        return Err(SpecrunError::NotFound(format!(
            "no files matched {}",
            patterns.join(" ")
        ))
        .into());
    }

    // Spec documents become the preamble; everything else is linked.
    let mut preamble = String::new();
    let mut linked: BTreeSet<String> = BTreeSet::new();
    for file in files {
        if file.ends_with(SPEC_SUFFIX) {
            let content = fetch.read(&file).await?;
            preamble.push_str(content.trim_end());
            preamble.push_str("\n\n");
        } else {
            linked.insert(file);
        }
    }
    let preamble = if preamble.is_empty() {
        None
    } else {
        Some(preamble)
    };
    let synthesized = SpecFile::synthesized("input.spec.md", preamble.as_deref(), &linked);
    Ok(vec![SpecSource::Inline {
        filename: synthesized.filename,
        content: synthesized.content,
    }])
}

pub(crate) async fn command(args: &[String], start: usize) -> Result<i32> {
    let flags = parse_run_flags(args, start);
    if flags.help {
        print_run_help();
        return Ok(0);
    }
    let Some(script_id) = flags.script.clone() else {
        print_error("usage: specrun run <script> [specs...]");
        print_run_help();
        return Ok(1);
    };

    let fetch: Arc<NativeFetch> = Arc::new(NativeFetch::new());

    let specs = match assemble_specs(fetch.as_ref(), &flags.spec_patterns, &flags.excludes).await {
        Ok(specs) => specs,
        Err(e) if e.is::<SpecrunError>() => {
            print_error(&format!("{e:#}"));
            return Ok(2);
        }
        Err(e) => return Err(e),
    };
    let project = match project::build_project(fetch.as_ref(), &[], specs).await {
        Ok(project) => project,
        Err(e) if e.is::<SpecrunError>() => {
            print_error(&format!("{e:#}"));
            return Ok(2);
        }
        Err(e) => return Err(e),
    };

    let (script, fragment) = match runner::resolve(&project, &script_id) {
        Ok(pair) => pair,
        Err(e @ SpecrunError::NotFound(_)) => {
            print_error(&e.to_string());
            return Ok(2);
        }
        Err(e) => return Err(e.into()),
    };
    let spec_content = project.spec_files.first().map(|f| f.content.clone());

    let retrieval = if script.retrieval {
        let backend = Arc::new(SqliteBackend::open(super::INDEX_DB_PATH)?);
        Some(RetrievalService::new(backend, fetch.clone()))
    } else {
        None
    };

    // Without a structured output destination the model text streams
    // straight to stdout as it arrives.
    let stream =
        !flags.json && !flags.yaml && !flags.prompt_only && flags.out.is_none();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        use std::io::Write as _;
        let mut streamed = false;
        while let Some(event) = rx.recv().await {
            match event {
                RunEvent::Chunk { text, .. } if stream => {
                    streamed = true;
                    print!("{text}");
                    std::io::stdout().flush().ok();
                }
                RunEvent::Chunk { .. } => {}
                RunEvent::Status(status) => info!("{}", status),
            }
        }
        if streamed {
            println!();
        }
    });

    let model = OpenAiClient::from_env();
    let config = flags.configuration();
    let result = runner::run_script(
        script,
        fragment,
        &config,
        &model,
        fetch.as_ref(),
        retrieval.as_ref(),
        &tx,
    )
    .await;
    drop(tx);
    printer.await.ok();

    if flags.prompt_only {
        println!("{}", serde_json::to_string_pretty(&result.prompt)?);
    }
    if flags.json {
        println!("{}", output::result_to_json(&result)?);
    }
    if flags.yaml {
        println!("{}", output::result_to_yaml(&result)?);
    }

    if let Some(path) = &flags.out_trace
        && let Some(trace) = &result.trace
    {
        output::write_text(path, trace).await?;
    }
    if let Some(path) = &flags.out_annotations
        && !result.annotations.is_empty()
    {
        output::write_annotations(path, script, &result.annotations, &flags.csv_separator).await?;
    }
    if let Some(path) = &flags.out_changelogs
        && !result.changelogs.is_empty()
    {
        output::write_text(path, &result.changelogs.join("\n")).await?;
    }
    if let Some(path) = &flags.out_data
        && !result.frames.is_empty()
    {
        output::write_frames(path, &result.frames).await?;
    }
    if let Some(out) = &flags.out {
        let failures = output::write_artifact_set(
            out,
            flags.remove_out,
            script,
            spec_content.as_deref(),
            &result,
        )
        .await;
        for failure in failures {
            print_warn(&format!("artifact failed: {failure}"));
        }
    }

    if let Some(error) = &result.error {
        print_error(error);
        return Ok(3);
    }

    if flags.apply_edits && !result.file_edits.is_empty() {
        let applied = output::apply_file_edits(&result).await?;
        print_success(&format!("applied {} file edit(s)", applied.len()));
    }

    let errors = result
        .annotations
        .iter()
        .filter(|a| a.severity == Severity::Error)
        .count();
    if flags.fail_on_errors && errors > 0 {
        print_error(&format!("{errors} error annotation(s)"));
        return Ok(4);
    }

    Ok(0)
}
