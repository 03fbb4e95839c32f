use anyhow::{Context as _, Result};
use std::path::Path;

use tcmsync::reconcile::results::{report_from_records, resolve_build};
use tcmsync::{
    ApplyPort, Container, Engine, EntityType, ExistingResultPolicy, ImportOptions, ImportReport,
    LiveApply, SimulatedApply, TcmsGateway, UserPolicy,
};

use super::{Context, print_report};

pub struct ImportArgs {
    pub dry_run: bool,
    pub auto_create: bool,
    pub include_attachments: bool,
    pub include_environments: bool,
    pub user_references: Option<UserPolicy>,
    pub existing_results: Option<ExistingResultPolicy>,
    pub build: Option<String>,
}

/// Configured import options with command-line flags applied on top.
pub fn options(ctx: &Context, args: &ImportArgs) -> Result<ImportOptions> {
    let mut options = ImportOptions::from_config(&ctx.config).context("Invalid import configuration")?;
    options.auto_create |= args.auto_create;
    options.include_attachments = args.include_attachments;
    options.include_environments = args.include_environments;
    if let Some(policy) = args.user_references {
        options.user_policy = policy;
    }
    if let Some(policy) = args.existing_results {
        options.existing_results = policy;
    }
    Ok(options)
}

/// Reconcile a definition container, or store a result container against
/// `build`.
pub fn reconcile<P: ApplyPort>(
    gateway: &dyn TcmsGateway,
    apply: &P,
    options: &ImportOptions,
    container: &Container,
    build: Option<&str>,
) -> Result<ImportReport> {
    let engine = Engine::new(gateway, apply, options);
    if container.entity_type != EntityType::PlanResult {
        return Ok(engine.import_container(container));
    }
    let build = build.context("Result containers need --build")?;
    let build = resolve_build(gateway, container.entity_id, build)
        .with_context(|| format!("Cannot resolve build '{}'", build))?;
    let report = report_from_records(
        &container.entities.plan_results,
        &container.entities.case_results,
    );
    Ok(engine.store_results(build, &report))
}

pub fn run(ctx: &Context, file: &Path, args: &ImportArgs) -> Result<()> {
    let container = Container::load(file)
        .with_context(|| format!("Failed to load container {}", file.display()))?;
    let options = options(ctx, args)?;
    let gateway = ctx.open_store()?;

    let report = if args.dry_run {
        let apply = SimulatedApply::new();
        reconcile(&gateway, &apply, &options, &container, args.build.as_deref())?
    } else {
        let apply = LiveApply::new(&gateway);
        reconcile(&gateway, &apply, &options, &container, args.build.as_deref())?
    };
    print_report(&report, ctx.json)?;

    if !args.dry_run {
        ctx.save_store(&gateway)?;
    }
    if !report.is_success() {
        anyhow::bail!(
            "Import of {} finished with {} failed decision(s)",
            file.display(),
            report.summary.failed
        );
    }
    Ok(())
}
