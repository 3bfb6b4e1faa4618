use serde_json::{Value, json};

use crate::core::project::Script;
use crate::core::runner::{Annotation, Severity};

const SARIF_SCHEMA: &str =
    "https://raw.githubusercontent.com/oasis-tcs/sarif-spec/master/Schemata/sarif-schema-2.1.0.json";

fn sarif_level(severity: Severity) -> &'static str {
    match severity {
        Severity::Error => "error",
        Severity::Warning => "warning",
        Severity::Notice => "note",
    }
}

/// Render annotations as a SARIF 2.1.0 log with one run, keyed by the
/// originating script's identity, for static-analysis consumers.
pub fn annotations_to_sarif(script: &Script, annotations: &[Annotation]) -> Value {
    let results: Vec<Value> = annotations
        .iter()
        .map(|a| {
            json!({
                "ruleId": script.id,
                "level": sarif_level(a.severity),
                "message": { "text": a.message },
                "locations": [{
                    "physicalLocation": {
                        "artifactLocation": { "uri": a.filename },
                        "region": {
                            "startLine": a.start_line.max(1),
                            "endLine": a.end_line.max(1),
                        }
                    }
                }]
            })
        })
        .collect();

    json!({
        "$schema": SARIF_SCHEMA,
        "version": "2.1.0",
        "runs": [{
            "tool": {
                "driver": {
                    "name": script.id,
                    "fullName": script.title.as_deref().unwrap_or(&script.id),
                    "informationUri": script.filename,
                    "rules": [{
                        "id": script.id,
                        "shortDescription": {
                            "text": script.description.as_deref().unwrap_or(&script.id)
                        }
                    }]
                }
            },
            "results": results,
        }]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script() -> Script {
        Script {
            id: "code-review".to_string(),
            title: Some("Code review".to_string()),
            description: None,
            filename: "code-review.script.md".to_string(),
            system: false,
            retrieval: false,
            prompt: String::new(),
        }
    }

    #[test]
    fn one_sarif_result_per_annotation() {
        let annotations = vec![
            Annotation {
                severity: Severity::Error,
                filename: "src/lib.rs".to_string(),
                start_line: 3,
                end_line: 5,
                message: "broken".to_string(),
            },
            Annotation {
                severity: Severity::Notice,
                filename: "src/lib.rs".to_string(),
                start_line: 9,
                end_line: 9,
                message: "fyi".to_string(),
            },
        ];
        let sarif = annotations_to_sarif(&script(), &annotations);
        assert_eq!(sarif["version"], "2.1.0");
        let results = sarif["runs"][0]["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["ruleId"], "code-review");
        assert_eq!(results[0]["level"], "error");
        assert_eq!(results[1]["level"], "note");
        assert_eq!(
            results[0]["locations"][0]["physicalLocation"]["region"]["startLine"],
            3
        );
    }

    #[test]
    fn zero_line_numbers_are_clamped_for_sarif() {
        let annotations = vec![Annotation {
            severity: Severity::Warning,
            filename: "a.rs".to_string(),
            start_line: 0,
            end_line: 0,
            message: "whole file".to_string(),
        }];
        let sarif = annotations_to_sarif(&script(), &annotations);
        let region = &sarif["runs"][0]["results"][0]["locations"][0]["physicalLocation"]["region"];
        assert_eq!(region["startLine"], 1);
    }
}
