// ABOUTME: Audit tool catalogue, exit-code policy table and concurrent audit pipeline
// ABOUTME: Runs every configured tool against one URL and collects their report files

use crate::providers::{shell_escape, Environment};
use crate::report;
use crate::runner::{self, OutputSink, RunOptions, RunnerError};
use crate::sync::{download_named, ReportFile};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

/// Point every tool at the Chromium shipped in the audit image
pub const CHROME_ENV: &str =
    "CHROME_PATH=/usr/bin/chromium PUPPETEER_EXECUTABLE_PATH=/usr/bin/chromium";

/// Flags Chromium needs to run headless as an unprivileged sandbox user
pub const CHROME_FLAGS: &[&str] = &[
    "--headless=new",
    "--no-sandbox",
    "--disable-setuid-sandbox",
    "--disable-gpu",
    "--disable-dev-shm-usage",
    "--disable-software-rasterizer",
    "--disable-extensions",
    "--no-first-run",
    "--disable-background-networking",
    "--disable-default-apps",
];

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(300);

const CHROME_INSTALL_TIMEOUT: Duration = Duration::from_secs(300);
const TOOL_INSTALL_TIMEOUT: Duration = Duration::from_secs(420);

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Failed to install audit tools: {0}")]
    ToolInstall(String),

    #[error(transparent)]
    Runner(#[from] RunnerError),
}

impl From<crate::providers::ProviderError> for AuditError {
    fn from(e: crate::providers::ProviderError) -> Self {
        AuditError::Runner(RunnerError::Provider(e))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditTool {
    Lighthouse,
    Axe,
    Pa11y,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown audit tool '{0}' (expected lighthouse, axe or pa11y)")]
pub struct UnknownTool(pub String);

impl AuditTool {
    pub const ALL: [AuditTool; 3] = [AuditTool::Lighthouse, AuditTool::Axe, AuditTool::Pa11y];

    pub fn name(&self) -> &'static str {
        match self {
            AuditTool::Lighthouse => "lighthouse",
            AuditTool::Axe => "axe",
            AuditTool::Pa11y => "pa11y",
        }
    }

    /// Distinct report file each tool writes into the results directory
    pub fn report_file_name(&self) -> &'static str {
        match self {
            AuditTool::Lighthouse => "lighthouse-results.json",
            AuditTool::Axe => "axe-results.json",
            AuditTool::Pa11y => "pa11y-results.json",
        }
    }

    fn npm_package(&self) -> &'static str {
        match self {
            AuditTool::Lighthouse => "lighthouse@latest",
            AuditTool::Axe => "@axe-core/cli",
            AuditTool::Pa11y => "pa11y",
        }
    }

    /// Shell command that audits `url` and writes the report into `results_dir`
    pub fn command(&self, url: &str, results_dir: &str) -> String {
        let url = shell_escape(url);
        match self {
            AuditTool::Lighthouse => format!(
                "{} lighthouse {} --output json --output-path {} \
                 --only-categories=accessibility,best-practices,performance,seo \
                 --chrome-flags=\"{}\"",
                CHROME_ENV,
                url,
                shell_escape(&format!("{}/{}", results_dir, self.report_file_name())),
                CHROME_FLAGS.join(" ")
            ),
            AuditTool::Axe => format!(
                "cd {} && {} axe {} --save {} \
                 --chrome-options=\"headless,no-sandbox,disable-gpu,disable-dev-shm-usage\"",
                shell_escape(results_dir),
                CHROME_ENV,
                url,
                self.report_file_name()
            ),
            AuditTool::Pa11y => format!(
                "{} pa11y {} --reporter json --runner htmlcs > {}",
                CHROME_ENV,
                url,
                shell_escape(&format!("{}/{}", results_dir, self.report_file_name()))
            ),
        }
    }
}

impl fmt::Display for AuditTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AuditTool {
    type Err = UnknownTool;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lighthouse" => Ok(AuditTool::Lighthouse),
            "axe" => Ok(AuditTool::Axe),
            "pa11y" => Ok(AuditTool::Pa11y),
            other => Err(UnknownTool(other.to_string())),
        }
    }
}

/// Parse a comma separated tool list such as `lighthouse,axe`
pub fn parse_tool_list(list: &str) -> Result<Vec<AuditTool>, UnknownTool> {
    list.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(str::parse)
        .collect()
}

/// How a finished tool run is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolOutcome {
    Passed,
    /// The tool ran and reported findings through its exit code
    IssuesFound,
    /// Non-zero exit; whatever report it managed to write is kept
    RanWithWarnings,
    Failed,
}

impl ToolOutcome {
    pub fn ran(&self) -> bool {
        !matches!(self, ToolOutcome::Failed)
    }
}

struct ExitPolicy {
    tool: AuditTool,
    codes: &'static [(i64, ToolOutcome)],
    otherwise: ToolOutcome,
}

const EXIT_POLICIES: &[ExitPolicy] = &[
    ExitPolicy {
        tool: AuditTool::Lighthouse,
        codes: &[(0, ToolOutcome::Passed)],
        otherwise: ToolOutcome::RanWithWarnings,
    },
    ExitPolicy {
        tool: AuditTool::Axe,
        codes: &[(0, ToolOutcome::Passed)],
        otherwise: ToolOutcome::RanWithWarnings,
    },
    ExitPolicy {
        tool: AuditTool::Pa11y,
        codes: &[(0, ToolOutcome::Passed), (2, ToolOutcome::IssuesFound)],
        otherwise: ToolOutcome::Failed,
    },
];

/// Map a tool's exit code to its outcome
pub fn classify(tool: AuditTool, exit_code: i64) -> ToolOutcome {
    EXIT_POLICIES
        .iter()
        .find(|policy| policy.tool == tool)
        .map(|policy| {
            policy
                .codes
                .iter()
                .find(|(code, _)| *code == exit_code)
                .map(|(_, outcome)| *outcome)
                .unwrap_or(policy.otherwise)
        })
        .unwrap_or(if exit_code == 0 {
            ToolOutcome::Passed
        } else {
            ToolOutcome::RanWithWarnings
        })
}

/// Outcome of one tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRunResult {
    pub tool: AuditTool,
    /// Remote path of the tool's report
    pub output_path: String,
    /// `None` when the tool could not be started at all
    pub exit_code: Option<i64>,
    pub outcome: ToolOutcome,
    pub succeeded: bool,
    pub error_detail: Option<String>,
    pub duration: Duration,
}

/// Everything a pipeline run produced
#[derive(Debug, Clone)]
pub struct AuditReport {
    pub url: String,
    pub results: Vec<AuditRunResult>,
    /// Keyed by report file name
    pub reports: BTreeMap<String, ReportFile>,
    pub summary: String,
}

/// Runs a set of audit tools concurrently against one URL
#[derive(Clone)]
pub struct AuditPipeline {
    tools: Vec<AuditTool>,
    results_dir: String,
    tool_timeout: Duration,
    on_output: Option<OutputSink>,
}

impl AuditPipeline {
    /// Duplicate tools are dropped, keeping the first occurrence
    pub fn new(tools: impl IntoIterator<Item = AuditTool>, results_dir: impl Into<String>) -> Self {
        let mut unique = Vec::new();
        for tool in tools {
            if !unique.contains(&tool) {
                unique.push(tool);
            }
        }

        Self {
            tools: unique,
            results_dir: results_dir.into(),
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            on_output: None,
        }
    }

    pub fn tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn on_output(mut self, sink: OutputSink) -> Self {
        self.on_output = Some(sink);
        self
    }

    pub fn tools(&self) -> &[AuditTool] {
        &self.tools
    }

    pub fn results_dir(&self) -> &str {
        &self.results_dir
    }

    /// Launch every tool at once, wait for all of them, then fetch their reports
    pub async fn run(&self, env: &dyn Environment, url: &str) -> Result<AuditReport, AuditError> {
        env.make_dir(&self.results_dir).await?;

        info!(
            "Running {} audit tool(s) against {}",
            self.tools.len(),
            url
        );

        let results = join_all(self.tools.iter().map(|tool| self.run_tool(env, *tool, url))).await;

        let names: Vec<&str> = self.tools.iter().map(|t| t.report_file_name()).collect();
        let reports = download_named(env, &self.results_dir, &names).await;
        let summary = report::render_summary(url, &results, &reports);

        Ok(AuditReport {
            url: url.to_string(),
            results,
            reports,
            summary,
        })
    }

    async fn run_tool(&self, env: &dyn Environment, tool: AuditTool, url: &str) -> AuditRunResult {
        let output_path = format!("{}/{}", self.results_dir, tool.report_file_name());
        let started = Instant::now();
        info!("Running {}...", tool);

        let mut options = RunOptions::default()
            .cwd(self.results_dir.clone())
            .timeout(self.tool_timeout);
        if let Some(sink) = &self.on_output {
            options = options.on_output(sink.clone());
        }

        let (exit_code, outcome, error_detail) =
            match runner::run(env, &tool.command(url, &self.results_dir), options).await {
                Ok(result) if result.timed_out => (
                    Some(result.exit_code),
                    ToolOutcome::Failed,
                    Some(format!("timed out after {:?}", self.tool_timeout)),
                ),
                Ok(result) => {
                    let outcome = classify(tool, result.exit_code);
                    let detail = match outcome {
                        ToolOutcome::Passed | ToolOutcome::IssuesFound => None,
                        _ => Some(stderr_excerpt(&result.stderr, result.exit_code)),
                    };
                    (Some(result.exit_code), outcome, detail)
                }
                Err(e) => (None, ToolOutcome::Failed, Some(e.to_string())),
            };

        match outcome {
            ToolOutcome::Passed => info!("{} completed", tool),
            ToolOutcome::IssuesFound => info!("{} completed (issues found)", tool),
            ToolOutcome::RanWithWarnings => warn!(
                "{} exited with code {:?}; keeping whatever it produced",
                tool, exit_code
            ),
            ToolOutcome::Failed => warn!(
                "{} failed: {}",
                tool,
                error_detail.as_deref().unwrap_or("unknown error")
            ),
        }

        AuditRunResult {
            tool,
            output_path,
            exit_code,
            outcome,
            succeeded: outcome.ran(),
            error_detail,
            duration: started.elapsed(),
        }
    }
}

fn stderr_excerpt(stderr: &str, exit_code: i64) -> String {
    let last = stderr.lines().rev().find(|line| !line.trim().is_empty());
    match last {
        Some(line) => format!("exit code {}: {}", exit_code, line.trim()),
        None => format!("exit code {}", exit_code),
    }
}

/// Run `command` directly when the shell is root, through sudo otherwise.
/// Plain node images run as root and ship without sudo.
fn privileged(command: &str) -> String {
    format!(
        "if [ \"$(id -u)\" = 0 ]; then {}; else sudo sh -c {}; fi",
        command,
        shell_escape(command)
    )
}

/// Install Chromium and the selected tools unless the image already has them
pub async fn ensure_tools(
    env: &dyn Environment,
    tools: &[AuditTool],
    on_output: Option<OutputSink>,
) -> Result<(), AuditError> {
    if tools.is_empty() {
        return Ok(());
    }

    let binaries: Vec<&str> = tools.iter().map(|t| t.name()).collect();
    let check = runner::run(
        env,
        &format!("which {}", binaries.join(" ")),
        RunOptions::default().cwd("/"),
    )
    .await?;
    if check.success() {
        info!("Audit tools already installed in template");
        return Ok(());
    }

    info!("Installing audit tools (not pre-installed in template)...");

    let mut options = RunOptions::default().cwd("/");
    if let Some(sink) = on_output {
        options = options.on_output(sink);
    }

    let chrome = runner::run(
        env,
        &format!(
            "which chromium || {{ {}; }}",
            privileged("apt-get update && apt-get install -y chromium chromium-driver")
        ),
        options.clone().timeout(CHROME_INSTALL_TIMEOUT),
    )
    .await?;
    if !chrome.success() {
        return Err(AuditError::ToolInstall(format!(
            "chromium: {}",
            chrome.stderr.trim()
        )));
    }

    let packages: Vec<&str> = tools.iter().map(|t| t.npm_package()).collect();
    let install = runner::run(
        env,
        &privileged(&format!("npm install -g {}", packages.join(" "))),
        options.timeout(TOOL_INSTALL_TIMEOUT),
    )
    .await?;
    if !install.success() {
        return Err(AuditError::ToolInstall(install.stderr.trim().to_string()));
    }

    info!("Installed {}", packages.join(", "));
    Ok(())
}
