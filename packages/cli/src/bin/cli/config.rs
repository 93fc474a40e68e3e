// ABOUTME: The `siteaudit config` command
// ABOUTME: Prints the settings a run would use and optionally checks the provider is reachable

use anyhow::{Context, Result};
use clap::Args;
use colored::*;
use siteaudit_config::constants;
use siteaudit_config::env_string;
use siteaudit_sandbox::settings::ConfigFile;
use siteaudit_sandbox::{AuditSettings, Provider, ProviderKind};
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Project directory whose configuration to resolve
    #[arg(default_value = ".")]
    pub project_dir: PathBuf,

    /// Also check that the sandbox provider is reachable
    #[arg(long)]
    pub check: bool,
}

pub async fn execute(args: ConfigArgs) -> Result<()> {
    let project_dir = args
        .project_dir
        .canonicalize()
        .with_context(|| format!("Project directory {} not found", args.project_dir.display()))?;
    let settings = AuditSettings::load(&project_dir)?;

    println!("{}", "⚙️  Site Audit Configuration".blue().bold());
    println!();

    match ConfigFile::find(&project_dir) {
        Some(path) => println!("  Config file:     {}", path.display()),
        None => println!("  Config file:     {}", "(none, using defaults)".dimmed()),
    }
    println!("  Provider:        {}", settings.provider);
    println!("  Template:        {}", settings.template());
    if settings.provider == ProviderKind::E2B {
        let key = if env_string(constants::E2B_API_KEY).is_some() {
            "set".green()
        } else {
            "missing".red()
        };
        println!("  {}:     {}", constants::E2B_API_KEY, key);
    }
    println!("  URL:             {}", settings.url);
    println!("  Audited URL:     {}", settings.audit_url());
    println!(
        "  Tools:           {}",
        settings
            .tools
            .iter()
            .map(|t| t.name())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("  Output:          {}", settings.output_dir.display());
    println!("  Dev server:      {} (port {})", settings.dev_command, settings.dev_port);
    println!("  Timeout:         {}s", settings.timeout.as_secs());
    if !settings.exclude.is_empty() {
        println!("  Extra excludes:  {}", settings.exclude.join(", "));
    }

    if args.check {
        println!();
        let provider = settings.build_provider()?;
        if provider.is_available().await? {
            println!("{} {} provider is reachable", "✅".green(), provider.name());
        } else {
            println!("{} {} provider is not reachable", "❌".red(), provider.name());
        }
    }

    Ok(())
}
