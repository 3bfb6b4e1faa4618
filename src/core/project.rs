use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::OnceLock;
use tracing::debug;

use crate::core::fetch::FileFetch;

pub const SCRIPT_SUFFIX: &str = ".script.md";
pub const SPEC_SUFFIX: &str = ".spec.md";

/// An identified, versioned prompt template. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Script {
    pub id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub filename: String,
    /// Bundled scripts shipped with the tool rather than authored in the
    /// project.
    pub system: bool,
    /// Scripts that want per-file excerpts from the retrieval index
    /// injected into their prompt.
    pub retrieval: bool,
    /// The markdown body, used verbatim as the system prompt.
    pub prompt: String,
}

#[derive(Debug, Default, Deserialize)]
struct ScriptFrontMatter {
    id: Option<String>,
    title: Option<String>,
    description: Option<String>,
    #[serde(default)]
    system: bool,
    #[serde(default)]
    retrieval: bool,
}

/// A file referenced from a specification fragment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileReference {
    pub name: String,
    pub filename: String,
}

/// One addressable subsection of a specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fragment {
    pub id: String,
    pub title: String,
    pub text: String,
    pub references: Vec<FileReference>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecFile {
    pub filename: String,
    pub content: String,
    pub fragments: Vec<Fragment>,
}

#[derive(Debug, Default)]
pub struct Project {
    pub scripts: Vec<Script>,
    pub spec_files: Vec<SpecFile>,
}

fn link_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[([^\]]+)\]\(([^)]+)\)").unwrap())
}

fn default_script_id(filename: &str) -> String {
    Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| filename.to_string())
        .trim_end_matches(SCRIPT_SUFFIX)
        .to_string()
}

impl Script {
    /// Parse a `*.script.md` file: optional YAML front matter between
    /// `---` fences, markdown body as the prompt.
    pub fn parse(filename: &str, content: &str) -> Result<Self> {
        let (front, body) = split_front_matter(content);
        let meta: ScriptFrontMatter = match front {
            Some(yaml) => serde_yaml::from_str(yaml)
                .with_context(|| format!("front matter of {filename}"))?,
            None => ScriptFrontMatter::default(),
        };
        Ok(Self {
            id: meta.id.unwrap_or_else(|| default_script_id(filename)),
            title: meta.title,
            description: meta.description,
            filename: filename.to_string(),
            system: meta.system,
            retrieval: meta.retrieval,
            prompt: body.trim().to_string(),
        })
    }
}

fn split_front_matter(content: &str) -> (Option<&str>, &str) {
    let Some(rest) = content.strip_prefix("---\n") else {
        return (None, content);
    };
    match rest.find("\n---") {
        Some(end) => {
            let front = &rest[..end];
            let body = rest[end + 4..].trim_start_matches('\n');
            (Some(front), body)
        }
        None => (None, content),
    }
}

impl SpecFile {
    /// Split a markdown specification into fragments, one per heading.
    /// A file without headings is a single fragment.
    pub fn parse(filename: &str, content: &str) -> Self {
        let mut fragments: Vec<Fragment> = Vec::new();
        let mut current: Option<(String, Vec<String>)> = None;

        for line in content.lines() {
            if let Some(title) = line.strip_prefix('#') {
                if let Some((title, lines)) = current.take() {
                    fragments.push(build_fragment(filename, fragments.len(), title, &lines));
                }
                current = Some((title.trim_start_matches('#').trim().to_string(), Vec::new()));
            } else if let Some((_, lines)) = current.as_mut() {
                lines.push(line.to_string());
            } else if !line.trim().is_empty() {
                // Content before any heading opens an untitled fragment
                current = Some((filename.to_string(), vec![line.to_string()]));
            }
        }
        if let Some((title, lines)) = current.take() {
            fragments.push(build_fragment(filename, fragments.len(), title, &lines));
        }

        Self {
            filename: filename.to_string(),
            content: content.to_string(),
            fragments,
        }
    }

    /// Build the markdown spec the CLI synthesizes when given loose files
    /// instead of a `*.spec.md` document.
    pub fn synthesized(filename: &str, preamble: Option<&str>, files: &BTreeSet<String>) -> Self {
        let mut content = preamble.unwrap_or("# Specification").trim_end().to_string();
        content.push_str("\n\n");
        for f in files {
            let name = Path::new(f)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| f.clone());
            content.push_str(&format!("-   [{}](./{})\n", name, f));
        }
        Self::parse(filename, &content)
    }
}

fn build_fragment(filename: &str, index: usize, title: String, lines: &[String]) -> Fragment {
    let text = lines.join("\n").trim().to_string();
    let mut references = Vec::new();
    for line in lines {
        if !line.trim_start().starts_with('-') {
            continue;
        }
        for caps in link_regex().captures_iter(line) {
            let target = caps[2].trim();
            references.push(FileReference {
                name: caps[1].to_string(),
                filename: target.trim_start_matches("./").to_string(),
            });
        }
    }
    Fragment {
        id: format!("{filename}#{index}"),
        title,
        text,
        references,
    }
}

impl Project {
    pub fn find_script(&self, tool: &str) -> Option<&Script> {
        self.scripts
            .iter()
            .find(|s| s.id == tool || s.filename == tool || s.filename.ends_with(tool))
    }

}

/// A specification source: an on-disk file or content synthesized by the
/// caller (stdin, loose file lists).
#[derive(Debug)]
pub enum SpecSource {
    File(String),
    Inline { filename: String, content: String },
}

/// Scan and parse scripts and specifications into a project. Scripts come
/// from the working tree plus any explicitly named script files.
pub async fn build_project(
    fetch: &dyn FileFetch,
    script_files: &[String],
    specs: Vec<SpecSource>,
) -> Result<Project> {
    let mut script_paths: BTreeSet<String> = fetch
        .list(&format!("**/*{SCRIPT_SUFFIX}"))
        .await?
        .into_iter()
        .collect();
    for f in script_files {
        script_paths.insert(f.clone());
    }

    let mut scripts = Vec::new();
    for path in &script_paths {
        let content = fetch
            .read(path)
            .await
            .with_context(|| format!("loading script {path}"))?;
        scripts.push(Script::parse(path, &content)?);
    }
    let system_count = scripts.iter().filter(|s| s.system).count();
    debug!(
        "project: {} scripts loaded ({} system)",
        scripts.len(),
        system_count
    );

    let mut spec_files = Vec::new();
    for spec in specs {
        match spec {
            SpecSource::File(path) => {
                // An unreadable named spec is a resolution failure, not a
                // generic I/O error.
                let content = fetch.read(&path).await.map_err(|_| {
                    crate::core::errors::SpecrunError::NotFound(format!("specification {path}"))
                })?;
                spec_files.push(SpecFile::parse(&path, &content));
            }
            SpecSource::Inline { filename, content } => {
                spec_files.push(SpecFile::parse(&filename, &content));
            }
        }
    }

    Ok(Project {
        scripts,
        spec_files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_front_matter_is_parsed() {
        let content = "---\nid: code-review\ntitle: Code review\nretrieval: true\n---\n\nReview the following code.\n";
        let script = Script::parse("tools/code-review.script.md", content).unwrap();
        assert_eq!(script.id, "code-review");
        assert_eq!(script.title.as_deref(), Some("Code review"));
        assert!(script.retrieval);
        assert!(!script.system);
        assert_eq!(script.prompt, "Review the following code.");
    }

    #[test]
    fn script_without_front_matter_uses_file_stem_as_id() {
        let script = Script::parse("summarize.script.md", "Summarize this.").unwrap();
        assert_eq!(script.id, "summarize");
        assert_eq!(script.prompt, "Summarize this.");
    }

    #[test]
    fn spec_fragments_split_on_headings() {
        let content = "# First\n\nbody one\n\n## Second\n\n-   [main](./src/main.rs)\n";
        let spec = SpecFile::parse("demo.spec.md", content);
        assert_eq!(spec.fragments.len(), 2);
        assert_eq!(spec.fragments[0].title, "First");
        assert_eq!(spec.fragments[0].text, "body one");
        assert_eq!(spec.fragments[1].references.len(), 1);
        assert_eq!(spec.fragments[1].references[0].filename, "src/main.rs");
    }

    #[test]
    fn spec_without_headings_is_one_fragment() {
        let spec = SpecFile::parse("plain.spec.md", "just some text\nmore text\n");
        assert_eq!(spec.fragments.len(), 1);
        assert_eq!(spec.fragments[0].title, "plain.spec.md");
    }

    #[test]
    fn empty_spec_has_no_fragments() {
        let spec = SpecFile::parse("empty.spec.md", "\n\n");
        assert!(spec.fragments.is_empty());
    }

    struct EmptyFetch;

    #[async_trait::async_trait]
    impl FileFetch for EmptyFetch {
        async fn read(&self, filename: &str) -> Result<String> {
            anyhow::bail!("no such file: {filename}")
        }

        async fn list(&self, _pattern: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn missing_named_spec_is_a_resolution_failure() {
        let err = build_project(
            &EmptyFetch,
            &[],
            vec![SpecSource::File("missing.spec.md".to_string())],
        )
        .await
        .unwrap_err();
        let err = err
            .downcast_ref::<crate::core::errors::SpecrunError>()
            .expect("typed resolution error");
        assert!(matches!(
            err,
            crate::core::errors::SpecrunError::NotFound(_)
        ));
        assert!(err.to_string().contains("missing.spec.md"));
    }

    #[test]
    fn synthesized_spec_links_every_file() {
        let files: BTreeSet<String> =
            ["src/a.rs".to_string(), "src/b.rs".to_string()].into_iter().collect();
        let spec = SpecFile::synthesized("cli.spec.md", None, &files);
        assert_eq!(spec.fragments.len(), 1);
        assert_eq!(spec.fragments[0].references.len(), 2);
        assert_eq!(spec.fragments[0].references[0].filename, "src/a.rs");
    }
}
