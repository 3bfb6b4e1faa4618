use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use super::{Annotation, FileEdit, Severity};

/// Structured directives extracted from model output. Parsing is
/// best-effort: malformed directives land in `dropped` instead of
/// failing the run.
#[derive(Debug, Default)]
pub struct ParsedDirectives {
    pub annotations: Vec<Annotation>,
    pub changelogs: Vec<String>,
    pub frames: Vec<Value>,
    pub file_edits: BTreeMap<String, FileEdit>,
    pub dropped: Vec<String>,
}

fn annotation_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^::(error|warning|notice)\s+file=([^,]+),\s*line=(\d+)(?:,\s*endLine=(\d+))?::(.*)$",
        )
        .unwrap()
    })
}

/// Scan model output for directives:
/// - annotations as GitHub workflow commands
///   (`::error file=f,line=1,endLine=2::message`)
/// - `FILE <path>` headers followed by a fenced block (full-file edits)
/// - fenced ```changelog blocks (one entry per line)
/// - fenced ```data blocks (JSON, whole-block or per-line)
pub fn parse(output: &str) -> ParsedDirectives {
    let mut parsed = ParsedDirectives::default();
    let lines: Vec<&str> = output.lines().collect();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        let trimmed = line.trim();

        if trimmed.starts_with("::") {
            match parse_annotation(trimmed) {
                Some(a) => parsed.annotations.push(a),
                None => parsed.dropped.push(trimmed.to_string()),
            }
            i += 1;
            continue;
        }

        if let Some(path) = trimmed.strip_prefix("FILE ") {
            let path = path.trim().trim_end_matches(':').to_string();
            match read_fence(&lines, i + 1) {
                Some((body, next)) => {
                    parsed.file_edits.insert(path, FileEdit {
                        before: None,
                        after: body,
                    });
                    i = next;
                }
                None => {
                    parsed.dropped.push(trimmed.to_string());
                    i += 1;
                }
            }
            continue;
        }

        if trimmed == "```changelog" {
            match read_fence(&lines, i) {
                Some((body, next)) => {
                    parsed
                        .changelogs
                        .extend(body.lines().filter(|l| !l.trim().is_empty()).map(String::from));
                    i = next;
                }
                None => {
                    parsed.dropped.push(trimmed.to_string());
                    i += 1;
                }
            }
            continue;
        }

        if trimmed == "```data" {
            match read_fence(&lines, i) {
                Some((body, next)) => {
                    parse_frames(&body, &mut parsed);
                    i = next;
                }
                None => {
                    parsed.dropped.push(trimmed.to_string());
                    i += 1;
                }
            }
            continue;
        }

        i += 1;
    }

    parsed
}

fn parse_annotation(line: &str) -> Option<Annotation> {
    let caps = annotation_regex().captures(line)?;
    let severity = Severity::from_str(&caps[1])?;
    let start_line: u32 = caps[3].parse().ok()?;
    let end_line: u32 = caps
        .get(4)
        .map(|m| m.as_str().parse().ok())
        .unwrap_or(Some(start_line))?;
    Some(Annotation {
        severity,
        filename: caps[2].trim().to_string(),
        start_line,
        end_line,
        message: caps[5].trim().to_string(),
    })
}

/// Read a fenced block opening at `open` (a line starting with ```),
/// returning its body and the index after the closing fence.
fn read_fence(lines: &[&str], open: usize) -> Option<(String, usize)> {
    if open >= lines.len() || !lines[open].trim().starts_with("```") {
        return None;
    }
    let mut body = Vec::new();
    for (offset, line) in lines[open + 1..].iter().enumerate() {
        if line.trim() == "```" {
            return Some((body.join("\n"), open + 2 + offset));
        }
        body.push(*line);
    }
    None // unterminated fence
}

fn parse_frames(body: &str, parsed: &mut ParsedDirectives) {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        match value {
            Value::Array(items) => parsed.frames.extend(items),
            other => parsed.frames.push(other),
        }
        return;
    }
    // Fall back to one JSON record per line
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(v) => parsed.frames.push(v),
            Err(_) => parsed.dropped.push(line.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotations_parse_with_and_without_end_line() {
        let out = "intro\n::error file=src/lib.rs,line=3,endLine=5::missing check\n::warning file=a.md,line=7::loose wording\n";
        let parsed = parse(out);
        assert_eq!(parsed.annotations.len(), 2);
        assert_eq!(parsed.annotations[0].severity, Severity::Error);
        assert_eq!(parsed.annotations[0].filename, "src/lib.rs");
        assert_eq!(parsed.annotations[0].start_line, 3);
        assert_eq!(parsed.annotations[0].end_line, 5);
        assert_eq!(parsed.annotations[1].end_line, 7);
        assert!(parsed.dropped.is_empty());
    }

    #[test]
    fn malformed_annotations_are_dropped_not_fatal() {
        let parsed = parse("::error file=x.rs::no line field\n::error garbage\n");
        assert!(parsed.annotations.is_empty());
        assert_eq!(parsed.dropped.len(), 2);
    }

    #[test]
    fn file_edit_blocks_capture_full_content() {
        let out = "FILE src/config.rs\n```rust\npub const N: usize = 4;\n```\ntrailing prose\n";
        let parsed = parse(out);
        assert_eq!(parsed.file_edits.len(), 1);
        let edit = &parsed.file_edits["src/config.rs"];
        assert_eq!(edit.after, "pub const N: usize = 4;");
        assert!(edit.before.is_none());
    }

    #[test]
    fn unterminated_file_fence_is_dropped() {
        let parsed = parse("FILE a.rs\n```\nno closing fence");
        assert!(parsed.file_edits.is_empty());
        assert_eq!(parsed.dropped, vec!["FILE a.rs".to_string()]);
    }

    #[test]
    fn changelog_lines_keep_order() {
        let out = "```changelog\nAdded retry cap\nFixed CSV header\n```\n";
        let parsed = parse(out);
        assert_eq!(
            parsed.changelogs,
            vec!["Added retry cap".to_string(), "Fixed CSV header".to_string()]
        );
    }

    #[test]
    fn data_blocks_accept_arrays_and_line_records() {
        let out = "```data\n[{\"k\":1},{\"k\":2}]\n```\n```data\n{\"a\":1}\nnot-json\n{\"b\":2}\n```\n";
        let parsed = parse(out);
        assert_eq!(parsed.frames.len(), 4);
        assert_eq!(parsed.dropped, vec!["not-json".to_string()]);
    }
}
