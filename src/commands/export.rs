use anyhow::{Context as _, Result};
use std::path::{Path, PathBuf};

use tcmsync::{ExportOptions, ExportTarget, Exporter};

use super::Context;

pub struct ExportArgs {
    pub descendants: bool,
    pub include_attachments: bool,
    pub include_environments: bool,
    pub dry_run: bool,
}

pub fn default_output(target: ExportTarget) -> PathBuf {
    let name = match target {
        ExportTarget::Plan(id) => format!("testplan_{}.toml", id),
        ExportTarget::Case(id) => format!("testcase_{}.toml", id),
        ExportTarget::Product(id) => format!("product_{}.toml", id),
    };
    PathBuf::from(name)
}

pub fn run(ctx: &Context, target: ExportTarget, output: Option<&Path>, args: &ExportArgs) -> Result<()> {
    let output = output.map(Path::to_path_buf).unwrap_or_else(|| default_output(target));
    let dest_dir = output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut options = ExportOptions::from_config(&ctx.config).context("Invalid export configuration")?;
    options.descendants = args.descendants;
    options.include_attachments = args.include_attachments && !args.dry_run;
    options.include_environments = args.include_environments;

    let gateway = ctx.open_store()?;
    let container = Exporter::new(&gateway, options)
        .export(target, Some(&dest_dir))
        .with_context(|| format!("Failed to export {:?}", target))?;

    let e = &container.entities;
    if args.dry_run {
        println!(
            "Would write {} ({} plans, {} cases, {} master data objects)",
            output.display(),
            e.test_plans.len(),
            e.test_cases.len(),
            e.master_data.object_count()
        );
        return Ok(());
    }
    container
        .save(&output)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!(
        "Exported {} plans and {} cases to {}",
        e.test_plans.len(),
        e.test_cases.len(),
        output.display()
    );
    Ok(())
}
