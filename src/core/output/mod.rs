pub mod sarif;

use anyhow::{Context, Result};
use serde_json::Value;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::core::project::Script;
use crate::core::runner::{Annotation, RunResult};

/// Separator used for the canonical annotations artifact.
pub const CSV_ARTIFACT_SEPARATOR: &str = ", ";

pub fn is_jsonl_filename(filename: &str) -> bool {
    filename.ends_with(".jsonl") || filename.ends_with(".mjsonl")
}

pub fn result_to_json(result: &RunResult) -> Result<String> {
    Ok(serde_json::to_string_pretty(result)?)
}

pub fn result_to_yaml(result: &RunResult) -> Result<String> {
    Ok(serde_yaml::to_string(result)?)
}

/// Fixed five-column layout: one header row, one row per annotation in
/// original order.
pub fn annotations_to_csv(annotations: &[Annotation], separator: &str) -> String {
    let mut out = ["severity", "filename", "start", "end", "message"].join(separator);
    out.push('\n');
    for a in annotations {
        // Newlines would break the one-row-per-annotation contract
        let message = a.message.replace(['\n', '\r'], " ");
        out.push_str(&format!(
            "{}{sep}{}{sep}{}{sep}{}{sep}{}\n",
            a.severity.as_str(),
            a.filename,
            a.start_line,
            a.end_line,
            message,
            sep = separator
        ));
    }
    out
}

/// Append one compact JSON record per line, so repeated runs accumulate a
/// log rather than overwriting it.
pub async fn append_jsonl<T: serde::Serialize>(filename: &str, records: &[T]) -> Result<()> {
    let mut buf = String::new();
    for record in records {
        buf.push_str(&serde_json::to_string(record)?);
        buf.push('\n');
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(filename)
        .await
        .with_context(|| format!("opening {filename}"))?;
    file.write_all(buf.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

pub async fn write_text(filename: &str, content: &str) -> Result<()> {
    if let Some(dir) = Path::new(filename).parent()
        && !dir.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::write(filename, content)
        .await
        .with_context(|| format!("writing {filename}"))
}

/// Apply the run's proposed file edits. The caller gates this on explicit
/// opt-in and on the run having no terminal error.
pub async fn apply_file_edits(result: &RunResult) -> Result<Vec<String>> {
    debug_assert!(result.error.is_none());
    let mut applied = Vec::new();
    for (filename, edit) in &result.file_edits {
        write_text(filename, &edit.after).await?;
        info!("applied edit: {}", filename);
        applied.push(filename.clone());
    }
    Ok(applied)
}

/// Render the annotations into whatever format the destination's suffix
/// declares: JSONL appends, CSV/TSV, YAML, SARIF, JSON otherwise.
pub async fn write_annotations(
    filename: &str,
    script: &Script,
    annotations: &[Annotation],
    csv_separator: &str,
) -> Result<()> {
    if is_jsonl_filename(filename) {
        return append_jsonl(filename, annotations).await;
    }
    let lower = filename.to_lowercase();
    let rendered = if lower.ends_with(".csv") || lower.ends_with(".tsv") {
        annotations_to_csv(annotations, csv_separator)
    } else if lower.ends_with(".yaml") || lower.ends_with(".yml") {
        serde_yaml::to_string(annotations)?
    } else if lower.ends_with(".sarif") {
        serde_json::to_string_pretty(&sarif::annotations_to_sarif(script, annotations))?
    } else {
        serde_json::to_string_pretty(annotations)?
    };
    write_text(filename, &rendered).await
}

/// Write arbitrary data frames: JSONL appends, otherwise pretty JSON.
pub async fn write_frames(filename: &str, frames: &[Value]) -> Result<()> {
    if is_jsonl_filename(filename) {
        return append_jsonl(filename, frames).await;
    }
    write_text(filename, &serde_json::to_string_pretty(frames)?).await
}

/// Write the full artifact set for one run under `out` (a directory, or a
/// `.json` path used as the naming stem). Each artifact failure is
/// contained: the remaining artifacts still attempt to write, and the
/// failures come back as data.
pub async fn write_artifact_set(
    out: &str,
    remove_out: bool,
    script: &Script,
    spec_content: Option<&str>,
    result: &RunResult,
) -> Vec<String> {
    let mut failures = Vec::new();

    let json_path = if out.to_lowercase().ends_with(".json") {
        out.to_string()
    } else {
        if remove_out {
            tokio::fs::remove_dir_all(out).await.ok();
        }
        if let Err(e) = tokio::fs::create_dir_all(out).await {
            failures.push(format!("{out}: {e}"));
            return failures;
        }
        Path::new(out).join("res.json").to_string_lossy().to_string()
    };
    let stem = |ext: &str| json_path.trim_end_matches(".json").to_string() + ext;

    let mut artifacts: Vec<(String, Result<String>)> = vec![
        (json_path.clone(), result_to_json(result)),
        (stem(".yaml"), result_to_yaml(result)),
    ];
    if !result.prompt.is_empty() {
        artifacts.push((
            stem(".prompt.json"),
            serde_json::to_string_pretty(&result.prompt).map_err(Into::into),
        ));
    }
    if let Some(text) = &result.text {
        artifacts.push((stem(".output.md"), Ok(text.clone())));
    }
    if let Some(trace) = &result.trace {
        artifacts.push((stem(".trace.md"), Ok(trace.clone())));
    }
    if !result.annotations.is_empty() {
        artifacts.push((
            stem(".annotations.csv"),
            Ok(annotations_to_csv(&result.annotations, CSV_ARTIFACT_SEPARATOR)),
        ));
        artifacts.push((
            stem(".sarif"),
            serde_json::to_string_pretty(&sarif::annotations_to_sarif(
                script,
                &result.annotations,
            ))
            .map_err(Into::into),
        ));
    }
    if !result.changelogs.is_empty() {
        artifacts.push((stem(".changelog.txt"), Ok(result.changelogs.join("\n"))));
    }
    if let Some(spec) = spec_content {
        artifacts.push((stem(".spec.md"), Ok(spec.to_string())));
    }

    for (path, content) in artifacts {
        match content {
            Ok(content) => {
                if let Err(e) = write_text(&path, &content).await {
                    warn!("artifact {} failed: {:#}", path, e);
                    failures.push(format!("{path}: {e:#}"));
                }
            }
            Err(e) => failures.push(format!("{path}: {e:#}")),
        }
    }

    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::runner::Severity;

    fn sample_annotations() -> Vec<Annotation> {
        vec![
            Annotation {
                severity: Severity::Error,
                filename: "src/lib.rs".to_string(),
                start_line: 3,
                end_line: 5,
                message: "missing bounds check".to_string(),
            },
            Annotation {
                severity: Severity::Warning,
                filename: "src/main.rs".to_string(),
                start_line: 10,
                end_line: 10,
                message: "shadowed variable".to_string(),
            },
        ]
    }

    #[test]
    fn csv_has_header_plus_one_line_per_annotation() {
        let annotations = sample_annotations();
        let csv = annotations_to_csv(&annotations, "\t");
        let lines: Vec<&str> = csv.trim_end().lines().collect();
        assert_eq!(lines.len(), annotations.len() + 1);
        assert_eq!(lines[0], "severity\tfilename\tstart\tend\tmessage");
    }

    #[test]
    fn csv_reparse_recovers_the_tuples() {
        let annotations = sample_annotations();
        let csv = annotations_to_csv(&annotations, "\t");
        for (line, a) in csv.trim_end().lines().skip(1).zip(&annotations) {
            let fields: Vec<&str> = line.splitn(5, '\t').collect();
            assert_eq!(fields[0], a.severity.as_str());
            assert_eq!(fields[1], a.filename);
            assert_eq!(fields[2], a.start_line.to_string());
            assert_eq!(fields[3], a.end_line.to_string());
            assert_eq!(fields[4], a.message);
        }
    }

    #[test]
    fn csv_of_no_annotations_is_just_the_header() {
        let csv = annotations_to_csv(&[], ", ");
        assert_eq!(csv.trim_end().lines().count(), 1);
    }

    #[test]
    fn multiline_messages_stay_on_one_row() {
        let annotations = vec![Annotation {
            severity: Severity::Notice,
            filename: "a.rs".to_string(),
            start_line: 1,
            end_line: 1,
            message: "first\nsecond".to_string(),
        }];
        let csv = annotations_to_csv(&annotations, "\t");
        assert_eq!(csv.trim_end().lines().count(), 2);
    }

    #[test]
    fn jsonl_detection_is_suffix_based() {
        assert!(is_jsonl_filename("out/annotations.jsonl"));
        assert!(is_jsonl_filename("log.mjsonl"));
        assert!(!is_jsonl_filename("out/annotations.json"));
        assert!(!is_jsonl_filename("jsonl.txt"));
    }

    #[tokio::test]
    async fn jsonl_appends_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.jsonl").to_string_lossy().to_string();
        let records = vec![serde_json::json!({"run": 1})];
        append_jsonl(&path, &records).await.unwrap();
        append_jsonl(&path, &records).await.unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        for line in content.lines() {
            serde_json::from_str::<Value>(line).unwrap();
        }
    }

    #[tokio::test]
    async fn file_edits_replace_target_content() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("edited.txt").to_string_lossy().to_string();
        std::fs::write(&target, "old").unwrap();

        let mut result = RunResult::default();
        result.file_edits.insert(
            target.clone(),
            crate::core::runner::FileEdit {
                before: Some("old".to_string()),
                after: "new".to_string(),
            },
        );
        let applied = apply_file_edits(&result).await.unwrap();
        assert_eq!(applied, vec![target.clone()]);
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "new");
    }

    #[tokio::test]
    async fn artifact_set_writes_json_yaml_and_csv() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("run-out").to_string_lossy().to_string();
        let script = Script {
            id: "review".to_string(),
            title: None,
            description: None,
            filename: "review.script.md".to_string(),
            system: false,
            retrieval: false,
            prompt: String::new(),
        };
        let result = RunResult {
            text: Some("output".to_string()),
            annotations: sample_annotations(),
            prompt: vec![crate::core::llm::ChatMessage::user("hi")],
            ..Default::default()
        };

        let failures = write_artifact_set(&out, false, &script, Some("# spec"), &result).await;
        assert!(failures.is_empty(), "{failures:?}");
        for artifact in [
            "res.json",
            "res.yaml",
            "res.prompt.json",
            "res.output.md",
            "res.annotations.csv",
            "res.sarif",
            "res.spec.md",
        ] {
            assert!(dir.path().join("run-out").join(artifact).exists(), "{artifact}");
        }
    }
}
