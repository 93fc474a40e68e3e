// ABOUTME: The `siteaudit run` command
// ABOUTME: Resolves settings, drives one audit under the lifecycle guard and prints the results

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use siteaudit_sandbox::audit::parse_tool_list;
use siteaudit_sandbox::{
    AuditOutcome, AuditRun, AuditSettings, EnvironmentPool, Lifecycle, OrchestratorError,
    ReportFile, StreamType, ToolOutcome,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Project directory to upload and audit
    #[arg(default_value = ".")]
    pub project_dir: PathBuf,

    /// URL to audit; anything other than localhost skips upload and the dev server
    #[arg(long)]
    pub url: Option<String>,

    /// Comma separated tools to run (lighthouse,axe,pa11y)
    #[arg(long)]
    pub tools: Option<String>,

    /// Local directory for downloaded reports, relative to the project
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Command that starts the dev server
    #[arg(long)]
    pub dev_command: Option<String>,

    /// Port the dev server listens on
    #[arg(long)]
    pub dev_port: Option<u16>,

    /// npm, yarn or pnpm (detected from the lockfile by default)
    #[arg(long)]
    pub package_manager: Option<String>,

    /// Overall timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Sandbox backend: e2b or docker
    #[arg(long)]
    pub provider: Option<String>,

    /// E2B template or Docker image
    #[arg(long)]
    pub template: Option<String>,
}

impl RunArgs {
    /// Flags override the config file and environment
    pub fn apply(&self, settings: &mut AuditSettings) -> Result<()> {
        if let Some(provider) = &self.provider {
            settings.provider = provider.parse()?;
        }
        if let Some(template) = &self.template {
            settings.template = Some(template.clone());
        }
        if let Some(url) = &self.url {
            settings.url = url.clone();
        }
        if let Some(tools) = &self.tools {
            settings.tools = parse_tool_list(tools)?;
        }
        if let Some(output) = &self.output {
            settings.output_dir = output.clone();
        }
        if let Some(command) = &self.dev_command {
            settings.dev_command = command.clone();
        }
        if let Some(port) = self.dev_port {
            settings.dev_port = port;
        }
        if let Some(manager) = &self.package_manager {
            settings.package_manager = Some(manager.parse()?);
        }
        if let Some(secs) = self.timeout {
            settings.timeout = Duration::from_secs(secs);
        }

        if settings.tools.is_empty() {
            bail!("No audit tools selected");
        }
        Ok(())
    }
}

pub async fn execute(args: RunArgs, verbose: bool) -> Result<()> {
    let project_dir = args
        .project_dir
        .canonicalize()
        .with_context(|| format!("Project directory {} not found", args.project_dir.display()))?;

    let mut settings = AuditSettings::load(&project_dir)?;
    args.apply(&mut settings)?;
    debug!("Resolved settings: {:?}", settings);

    println!("{}", "🔍 Site Audit".blue().bold());
    println!("   Target:   {}", settings.url.cyan());
    println!(
        "   Tools:    {}",
        settings
            .tools
            .iter()
            .map(|t| t.name())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("   Provider: {} ({})", settings.provider, settings.template());
    println!();

    let provider = settings.build_provider()?;
    let pool = Arc::new(
        EnvironmentPool::new(provider, settings.template())
            .with_workdir(settings.remote_project_dir.clone()),
    );

    let mut run = AuditRun::new(pool.clone(), settings);
    if verbose {
        run = run.on_output(Arc::new(print_chunk));
    }

    let outcome = Lifecycle::new(pool)
        .run(async move { run.execute(&project_dir).await })
        .await
        .map_err(OrchestratorError::from)
        .and_then(|result| result)?;

    print_outcome(&outcome);
    Ok(())
}

fn print_chunk(stream: StreamType, data: &[u8]) {
    let _ = match stream {
        StreamType::Stdout => std::io::stdout().lock().write_all(data),
        StreamType::Stderr => std::io::stderr().lock().write_all(data),
    };
}

fn outcome_cell(outcome: ToolOutcome) -> ColoredString {
    match outcome {
        ToolOutcome::Passed => "passed".green(),
        ToolOutcome::IssuesFound => "issues found".yellow(),
        ToolOutcome::RanWithWarnings => "ran with warnings".yellow(),
        ToolOutcome::Failed => "failed".red(),
    }
}

fn report_cell(report: Option<&ReportFile>) -> String {
    match report {
        Some(ReportFile::Downloaded(bytes)) => format!("{} bytes", bytes.len()),
        Some(ReportFile::Empty) => "empty".to_string(),
        Some(ReportFile::Missing) | None => "missing".to_string(),
        Some(ReportFile::Failed(_)) => "download failed".to_string(),
    }
}

fn print_outcome(outcome: &AuditOutcome) {
    println!();
    println!("{}", "📊 Audit Results".blue().bold());

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Tool", "Outcome", "Exit code", "Duration", "Report"]);

    for result in &outcome.report.results {
        table.add_row(vec![
            result.tool.name().to_string(),
            outcome_cell(result.outcome).to_string(),
            result
                .exit_code
                .map_or_else(|| "-".to_string(), |code| code.to_string()),
            format!("{:.1}s", result.duration.as_secs_f64()),
            report_cell(outcome.report.reports.get(result.tool.report_file_name())),
        ]);
    }
    println!("{table}");

    if let Some(upload) = &outcome.upload {
        let line = format!(
            "Uploaded {} files ({} skipped, {} excluded)",
            upload.uploaded, upload.skipped, upload.excluded
        );
        println!("{}", line.as_str().dimmed());
    }

    println!();
    for path in &outcome.written {
        println!("   {} {}", "✓".green(), path.display());
    }
    println!();
    println!(
        "{} Audit finished in {}s",
        "✅".green(),
        outcome.duration.as_secs()
    );
}
