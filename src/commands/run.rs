use anyhow::{Context as _, Result};
use std::path::PathBuf;

use tcmsync::reconcile::results::resolve_build;
use tcmsync::runner::executable::Registry;
use tcmsync::runner::write_result_container;
use tcmsync::{
    ApplyPort, Container, Engine, EntityType, ExportOptions, ExportTarget, Exporter, ImportOptions,
    ImportReport, LiveApply, ObjectId, ProductPaths, RunOptions, RunReport, RunTarget, Runner,
    RunnerSettings, SimulatedApply, SourceId, TcmsGateway,
};

use super::{Context, print_report};

pub struct RunArgs {
    pub file: Option<PathBuf>,
    pub plan: Option<ObjectId>,
    pub case: Option<ObjectId>,
    pub dry_run: bool,
    pub store_result: bool,
    pub build: Option<String>,
    pub environment: Option<String>,
    pub descendants: bool,
    pub tester: Option<String>,
}

/// Which part of the container to run.
pub fn target_of(container: &Container, case: Option<ObjectId>) -> Result<RunTarget> {
    if let Some(case) = case {
        return Ok(RunTarget::Case(SourceId(case)));
    }
    match container.entity_type {
        EntityType::TestPlan => Ok(RunTarget::Plan(SourceId(container.entity_id))),
        EntityType::TestCase => Ok(RunTarget::Case(SourceId(container.entity_id))),
        other => anyhow::bail!("Cannot run a {:?} container; pass --case", other),
    }
}

fn print_results(report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&report.results)?);
        return Ok(());
    }
    for r in &report.results {
        let what = match (&r.case_summary, r.case_id) {
            (Some(summary), Some(id)) => format!("case {} '{}'", id, summary),
            _ => format!("plan {} '{}'", r.plan_id, r.plan_name),
        };
        let code = if r.matrix_code.is_empty() {
            String::new()
        } else {
            format!(" [{}]", r.matrix_code)
        };
        let detail = if r.detail.is_empty() {
            String::new()
        } else {
            format!(": {}", r.detail)
        };
        println!("{:<10} {}{}{}", r.status.to_string(), what, code, detail);
    }
    println!(
        "{} passed, {} failed, {} skipped",
        report.passed(),
        report.failed(),
        report.skipped()
    );
    Ok(())
}

/// Store a run report against the build named `build_name` of the first
/// plan that ran.
pub fn store_report<P: ApplyPort>(
    gateway: &dyn TcmsGateway,
    apply: &P,
    options: &ImportOptions,
    report: &RunReport,
    build_name: &str,
) -> Result<ImportReport> {
    let plan_id = report
        .plans
        .first()
        .map(|p| p.plan_id)
        .or_else(|| report.results.first().map(|r| r.plan_id))
        .context("Nothing was run")?;
    let build = resolve_build(gateway, plan_id, build_name)
        .with_context(|| format!("Cannot resolve build '{}'", build_name))?;
    Ok(Engine::new(gateway, apply, options).store_results(build, report))
}

pub fn run(ctx: &Context, args: &RunArgs) -> Result<()> {
    // runner paths are checked before TCMS is touched
    let paths = ProductPaths::from_config(&ctx.config).context("Invalid runner configuration")?;
    let settings = RunnerSettings::from_config(&ctx.config).context("Invalid runner configuration")?;
    let build_name = match (args.store_result, &args.build) {
        (true, None) => anyhow::bail!("--store-result needs --build"),
        (_, build) => build.clone(),
    };

    let needs_store = args.plan.is_some() || args.store_result || args.tester.is_none();
    let gateway = if needs_store { Some(ctx.open_store()?) } else { None };

    let container = match (&args.file, args.plan) {
        (Some(file), _) => Container::load(file)
            .with_context(|| format!("Failed to load container {}", file.display()))?,
        (None, Some(plan)) => {
            let gateway = gateway.as_ref().context("TCMS store unavailable")?;
            let mut options = ExportOptions::from_config(&ctx.config)?;
            options.descendants = args.descendants;
            options.include_attachments = true;
            options.include_environments = true;
            let dest = paths.working.join("entities").join(format!("testplan_{}", plan));
            let container = Exporter::new(gateway, options)
                .export(ExportTarget::Plan(plan), Some(&dest))
                .with_context(|| format!("Failed to export plan {}", plan))?;
            container
                .save(dest.join(format!("testplan_{}.toml", plan)))
                .context("Failed to write exported plan")?;
            container
        }
        (None, None) => anyhow::bail!("Pass a container file or --plan"),
    };

    let environment = match &args.environment {
        Some(name) => Some(
            container
                .entities
                .environments
                .iter()
                .find(|e| &e.name == name)
                .with_context(|| format!("Environment '{}' is not in the container", name))?,
        ),
        None => None,
    };

    let tester = match (&args.tester, &gateway) {
        (Some(t), _) => t.clone(),
        (None, Some(gw)) => gw
            .current_user()
            .ok()
            .and_then(|u| u.str_field("username").map(str::to_string))
            .unwrap_or_else(super::default_username),
        (None, None) => super::default_username(),
    };

    let target = target_of(&container, args.case)?;
    let registry = Registry::new();
    let runner = Runner::new(
        paths,
        settings,
        &registry,
        RunOptions {
            dry_run: args.dry_run,
            descendants: args.descendants,
            tester,
        },
    )
    .context("Invalid runner configuration")?;
    let report = runner
        .run(&container, target, environment)
        .context("Run failed")?;
    print_results(&report, ctx.json)?;

    if args.store_result {
        let gateway = gateway.as_ref().context("TCMS store unavailable")?;
        let build_name = build_name.unwrap_or_default();
        let options = ImportOptions::from_config(&ctx.config).context("Invalid import configuration")?;
        let stored = if args.dry_run {
            store_report(gateway, &SimulatedApply::new(), &options, &report, &build_name)?
        } else {
            store_report(gateway, &LiveApply::new(gateway), &options, &report, &build_name)?
        };
        print_report(&stored, ctx.json)?;
        if !args.dry_run {
            ctx.save_store(gateway)?;
        }
        if !stored.is_success() {
            anyhow::bail!("Storing results finished with {} failed decision(s)", stored.summary.failed);
        }
    } else if !args.dry_run {
        let plan = report
            .plans
            .first()
            .and_then(|p| container.plan(SourceId(p.plan_id)))
            .or_else(|| {
                report
                    .results
                    .first()
                    .and_then(|r| container.plan(SourceId(r.plan_id)))
            });
        if let Some(plan) = plan {
            let path = write_result_container(runner.paths(), plan, &report)
                .context("Failed to write results")?;
            println!("Results written to {}", path.display());
        }
    }

    if !args.dry_run && report.failed() > 0 {
        anyhow::bail!("{} of {} results failed", report.failed(), report.results.len());
    }
    Ok(())
}
