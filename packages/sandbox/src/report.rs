// ABOUTME: Parses each audit tool's JSON report into finding counts
// ABOUTME: Renders the summary.md handed to operators after an audit run

use crate::audit::{AuditRunResult, AuditTool, ToolOutcome};
use crate::sync::ReportFile;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;

pub const SUMMARY_FILE_NAME: &str = "summary.md";

const UNPARSEABLE: &str = "(could not parse)";

const NEXT_STEPS: &str = "## Next Steps

Turn these reports into remediation specs:

1. Run `/accessibility-audit` to write accessibility specs to `docs/accessibility/specs/pending/`
2. Run `/seo-audit` to write SEO and performance specs to `docs/seo/specs/pending/`
3. Run `/implement-specs` to implement the pending specs
";

/// Counts extracted from one tool's report
#[derive(Debug, Clone, PartialEq)]
pub enum ToolSummary {
    Lighthouse {
        /// Category title and score out of 100, in report order
        scores: Vec<(String, Option<u32>)>,
    },
    Axe {
        violations: usize,
        affected_nodes: usize,
        by_impact: BTreeMap<String, usize>,
    },
    Pa11y {
        errors: usize,
        warnings: usize,
        notices: usize,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("Unexpected report shape: {0}")]
    Shape(&'static str),
}

pub fn parse_report(tool: AuditTool, content: &[u8]) -> Result<ToolSummary, ParseError> {
    let value: Value = serde_json::from_slice(content)?;
    match tool {
        AuditTool::Lighthouse => parse_lighthouse(&value),
        AuditTool::Axe => parse_axe(&value),
        AuditTool::Pa11y => parse_pa11y(&value),
    }
}

fn parse_lighthouse(value: &Value) -> Result<ToolSummary, ParseError> {
    let categories = value
        .get("categories")
        .and_then(Value::as_object)
        .ok_or(ParseError::Shape("lighthouse report without categories"))?;

    let scores = categories
        .iter()
        .map(|(key, category)| {
            let title = category
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or(key.as_str())
                .to_string();
            let score = category
                .get("score")
                .and_then(Value::as_f64)
                .map(|s| (s * 100.0).round() as u32);
            (title, score)
        })
        .collect();

    Ok(ToolSummary::Lighthouse { scores })
}

fn parse_axe(value: &Value) -> Result<ToolSummary, ParseError> {
    // axe-cli saves one result per audited page
    let pages: Vec<&Value> = match value {
        Value::Array(pages) => pages.iter().collect(),
        Value::Object(_) => vec![value],
        _ => return Err(ParseError::Shape("axe report is neither array nor object")),
    };

    let mut violations = 0;
    let mut affected_nodes = 0;
    let mut by_impact = BTreeMap::new();

    for page in pages {
        let found = page
            .get("violations")
            .and_then(Value::as_array)
            .ok_or(ParseError::Shape("axe result without violations"))?;
        for violation in found {
            violations += 1;
            affected_nodes += violation
                .get("nodes")
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            let impact = violation
                .get("impact")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            *by_impact.entry(impact.to_string()).or_insert(0) += 1;
        }
    }

    Ok(ToolSummary::Axe {
        violations,
        affected_nodes,
        by_impact,
    })
}

fn parse_pa11y(value: &Value) -> Result<ToolSummary, ParseError> {
    let issues = match value {
        Value::Array(issues) => issues,
        Value::Object(_) => value
            .get("issues")
            .and_then(Value::as_array)
            .ok_or(ParseError::Shape("pa11y report without issues"))?,
        _ => return Err(ParseError::Shape("pa11y report is neither array nor object")),
    };

    let (mut errors, mut warnings, mut notices) = (0, 0, 0);
    for issue in issues {
        match issue.get("type").and_then(Value::as_str) {
            Some("error") => errors += 1,
            Some("warning") => warnings += 1,
            Some("notice") => notices += 1,
            _ => {}
        }
    }

    Ok(ToolSummary::Pa11y {
        errors,
        warnings,
        notices,
    })
}

fn outcome_label(outcome: ToolOutcome) -> &'static str {
    match outcome {
        ToolOutcome::Passed => "passed",
        ToolOutcome::IssuesFound => "issues found",
        ToolOutcome::RanWithWarnings => "ran with warnings",
        ToolOutcome::Failed => "failed",
    }
}

fn report_label(report: Option<&ReportFile>) -> &'static str {
    match report {
        Some(ReportFile::Downloaded(_)) => "downloaded",
        Some(ReportFile::Empty) => "empty",
        Some(ReportFile::Missing) | None => "missing",
        Some(ReportFile::Failed(_)) => "download failed",
    }
}

fn write_findings(out: &mut String, summary: &ToolSummary) {
    match summary {
        ToolSummary::Lighthouse { scores } => {
            for (title, score) in scores {
                match score {
                    Some(score) => {
                        let _ = writeln!(out, "- {}: {}/100", title, score);
                    }
                    None => {
                        let _ = writeln!(out, "- {}: n/a", title);
                    }
                }
            }
        }
        ToolSummary::Axe {
            violations,
            affected_nodes,
            by_impact,
        } => {
            let _ = writeln!(
                out,
                "- Violations: {} ({} affected nodes)",
                violations, affected_nodes
            );
            for (impact, count) in by_impact {
                let _ = writeln!(out, "- {}: {}", impact, count);
            }
        }
        ToolSummary::Pa11y {
            errors,
            warnings,
            notices,
        } => {
            let _ = writeln!(out, "- Errors: {}", errors);
            let _ = writeln!(out, "- Warnings: {}", warnings);
            let _ = writeln!(out, "- Notices: {}", notices);
        }
    }
}

/// Markdown summary with one table row and one findings section per tool
pub fn render_summary(
    url: &str,
    results: &[AuditRunResult],
    reports: &BTreeMap<String, ReportFile>,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Audit Summary\n");
    let _ = writeln!(out, "- **URL:** {}", url);
    let _ = writeln!(out, "- **Generated:** {}\n", chrono::Utc::now().to_rfc3339());

    out.push_str("| Tool | Outcome | Exit code | Duration | Report |\n");
    out.push_str("|------|---------|-----------|----------|--------|\n");
    for result in results {
        let exit_code = result
            .exit_code
            .map_or_else(|| "-".to_string(), |code| code.to_string());
        let _ = writeln!(
            out,
            "| {} | {} | {} | {:.1}s | {} |",
            result.tool,
            outcome_label(result.outcome),
            exit_code,
            result.duration.as_secs_f64(),
            report_label(reports.get(result.tool.report_file_name()))
        );
    }

    for result in results {
        let file_name = result.tool.report_file_name();
        let _ = writeln!(out, "\n## {} (`{}`)\n", result.tool, file_name);

        match reports.get(file_name) {
            Some(ReportFile::Downloaded(content)) => match parse_report(result.tool, content) {
                Ok(summary) => write_findings(&mut out, &summary),
                Err(_) => {
                    let _ = writeln!(out, "{}", UNPARSEABLE);
                }
            },
            Some(ReportFile::Empty) => {
                out.push_str("Report file exists but is empty: the tool ran and wrote nothing.\n");
            }
            Some(ReportFile::Failed(reason)) => {
                let _ = writeln!(out, "Report could not be downloaded: {}", reason);
            }
            Some(ReportFile::Missing) | None => {
                out.push_str("No report produced: the tool did not write its output file.\n");
            }
        }

        if let Some(detail) = &result.error_detail {
            let _ = writeln!(out, "\n> {}", detail);
        }
    }

    out.push('\n');
    out.push_str(NEXT_STEPS);
    out
}
