//! Execution runner: expands a plan or case over the property matrix,
//! gates what may run on this host, drives assistants and scripts, and
//! collects one [`ExecutionResult`] per case and matrix cell.

pub mod assistant;
pub mod executable;
pub mod result;

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::Config;
use crate::container::{Container, EntityType};
use crate::entity::{Environment, ObjectId, Property, SourceId, TestCase, TestPlan};
use crate::error::{SyncError, SyncResult};
use crate::platform::{Applicability, Host};
use crate::property_matrix::{MatrixCell, PropertyMatrix};
use crate::status::StatusWeights;
use assistant::{Assistants, Phase, Scope};
use executable::{CallContext, Executable, Outcome, Registry, ScriptSettings, env_vars};
use result::{ExecutionResult, PlanRecord, ResultStatus, RunReport, SkipReason};

/// Product directories the runner works with.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductPaths {
    pub source: PathBuf,
    pub tests: PathBuf,
    pub working: PathBuf,
}

impl ProductPaths {
    /// Paths from `[product]` and `[runner]`; the test path defaults to the
    /// source path.
    pub fn from_config(config: &Config) -> SyncResult<Self> {
        let Some(source) = config.product.source_path.clone() else {
            return Err(SyncError::Configuration(
                "product source-path is not configured".to_string(),
            ));
        };
        let tests = config
            .product
            .test_path
            .clone()
            .unwrap_or_else(|| source.clone());
        let paths = Self {
            source,
            tests,
            working: config.runner.working_path.clone(),
        };
        paths.validate()?;
        Ok(paths)
    }

    /// Source and test paths must be existing directories; the working
    /// directory is created when missing.
    pub fn validate(&self) -> SyncResult<()> {
        for (label, dir) in [("source", &self.source), ("test", &self.tests)] {
            if !dir.is_dir() {
                return Err(SyncError::Configuration(format!(
                    "{} path {} is not a directory",
                    label,
                    dir.display()
                )));
            }
        }
        fs::create_dir_all(&self.working).map_err(|e| {
            SyncError::Configuration(format!(
                "working path {} cannot be created: {}",
                self.working.display(),
                e
            ))
        })
    }

    pub fn results_dir(&self) -> PathBuf {
        self.working.join("results")
    }

    fn case_log(&self, plan: ObjectId, case: ObjectId, output_log: &str, code: &str) -> PathBuf {
        self.results_dir()
            .join("case")
            .join(format!("{}_{}", plan, case))
            .join(with_code(output_log, code))
    }

    fn assistant_log(&self, name: &str, code: &str) -> PathBuf {
        self.results_dir()
            .join("assistant")
            .join(with_code(&format!("{}.log", name), code))
    }
}

fn with_code(name: &str, code: &str) -> String {
    if code.is_empty() {
        name.to_string()
    } else {
        format!("{}_{}", name, code)
    }
}

/// Runner knobs taken from the configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerSettings {
    pub output_log: String,
    pub assistants: Assistants,
    pub custom_script_path: Option<PathBuf>,
    pub test_driver: Option<String>,
    /// Plan property names exported to scripts
    pub plan_properties: Vec<String>,
    /// Case property names exported to scripts
    pub case_properties: Vec<String>,
    pub env: Vec<(String, String)>,
    pub weights: StatusWeights,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            output_log: "console.log".to_string(),
            assistants: Assistants::default(),
            custom_script_path: None,
            test_driver: None,
            plan_properties: Vec::new(),
            case_properties: Vec::new(),
            env: Vec::new(),
            weights: StatusWeights::default(),
        }
    }
}

impl RunnerSettings {
    pub fn from_config(config: &Config) -> SyncResult<Self> {
        let runner = &config.runner;
        Ok(Self {
            output_log: runner.output_log.clone(),
            assistants: Assistants::parse(
                runner.entity_assistant.as_deref(),
                runner.plan_assistant.as_deref(),
                runner.case_assistant.as_deref(),
            )?,
            custom_script_path: runner.custom_script_path.clone(),
            test_driver: runner.test_driver.clone(),
            plan_properties: runner.plan_properties.clone(),
            case_properties: runner.case_properties.clone(),
            env: config.resolved_env(),
            weights: StatusWeights::with_overrides(&config.tcms.status_weights),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOptions {
    pub dry_run: bool,
    /// Also run child plans, depth-first
    pub descendants: bool,
    /// Username recorded as tester
    pub tester: String,
}

/// Shared cancellation flag. Once set, all remaining work is skipped.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTarget {
    Plan(SourceId),
    Case(SourceId),
}

/// Plan a case runs under; detached when a case is run outside any plan
/// of its container.
struct PlanScope<'c> {
    id: ObjectId,
    name: &'c str,
    plan: Option<&'c TestPlan>,
}

impl<'c> PlanScope<'c> {
    fn of(plan: &'c TestPlan) -> Self {
        Self {
            id: plan.id.0,
            name: &plan.name,
            plan: Some(plan),
        }
    }
}

/// State of one `run` call.
struct Pass<'c> {
    container: &'c Container,
    cells: Vec<MatrixCell>,
    report: RunReport,
    visited: BTreeSet<SourceId>,
}

pub struct Runner<'r> {
    paths: ProductPaths,
    settings: RunnerSettings,
    scripts: ScriptSettings,
    registry: &'r Registry,
    options: RunOptions,
    host: Host,
    abort: AbortHandle,
}

impl<'r> Runner<'r> {
    /// Fails with a configuration error when the product paths are unusable.
    pub fn new(
        paths: ProductPaths,
        settings: RunnerSettings,
        registry: &'r Registry,
        options: RunOptions,
    ) -> SyncResult<Self> {
        paths.validate()?;
        let scripts = ScriptSettings {
            tests_path: paths.tests.clone(),
            custom_script_path: settings.custom_script_path.clone(),
            test_driver: settings.test_driver.clone(),
        };
        Ok(Self {
            paths,
            settings,
            scripts,
            registry,
            options,
            host: Host::local(),
            abort: AbortHandle::default(),
        })
    }

    pub fn with_host(mut self, host: Host) -> Self {
        self.host = host;
        self
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn paths(&self) -> &ProductPaths {
        &self.paths
    }

    /// Execute a plan (with its children when requested) or a single case
    /// from `container`, once per cell of the environment's matrix.
    pub fn run(
        &self,
        container: &Container,
        target: RunTarget,
        environment: Option<&Environment>,
    ) -> SyncResult<RunReport> {
        let cells = environment
            .map(PropertyMatrix::from_environment)
            .unwrap_or_default()
            .cells();
        let mut pass = Pass {
            container,
            cells,
            report: RunReport::default(),
            visited: BTreeSet::new(),
        };

        let (entity_scope, case) = match target {
            RunTarget::Plan(id) => {
                let plan = container.plan(id).ok_or_else(|| {
                    SyncError::Configuration(format!("test plan {} is not in the container", id))
                })?;
                (PlanScope::of(plan), None)
            }
            RunTarget::Case(id) => {
                let case = container.case(id).ok_or_else(|| {
                    SyncError::Configuration(format!("test case {} is not in the container", id))
                })?;
                let scope = container
                    .entities
                    .test_plans
                    .iter()
                    .find(|p| p.cases.contains(&id))
                    .map(PlanScope::of)
                    .unwrap_or(PlanScope {
                        id: 0,
                        name: "",
                        plan: None,
                    });
                (scope, Some(case))
            }
        };

        tracing::info!(?target, cells = pass.cells.len(), dry_run = self.options.dry_run, "run started");

        let no_cell = MatrixCell::default();
        let mut forced = None;
        let mut entity_ready = false;
        if !self.options.dry_run {
            match self.hook(Scope::Entity, Phase::Init, &pass, &entity_scope, None, &no_cell) {
                Ok(()) => entity_ready = true,
                Err(err) => {
                    let start = Utc::now();
                    let failed = self.assistant_result(&entity_scope, None, &no_cell, start, err);
                    pass.report.results.push(failed);
                    forced = Some(SkipReason::Aborted);
                }
            }
        }

        match (case, entity_scope.plan) {
            (None, Some(plan)) => {
                self.run_plan(&mut pass, plan, forced);
            }
            (Some(case), _) => {
                for index in 0..pass.cells.len() {
                    let cell = &pass.cells[index];
                    let result = self.run_case(&pass, &entity_scope, case, cell, forced);
                    pass.report.results.push(result);
                }
            }
            (None, None) => {}
        }

        if entity_ready
            && let Err(err) =
                self.hook(Scope::Entity, Phase::Cleanup, &pass, &entity_scope, None, &no_cell)
        {
            let start = Utc::now();
            let failed = self.assistant_result(&entity_scope, None, &no_cell, start, err);
            pass.report.results.push(failed);
        }

        let report = pass.report;
        tracing::info!(
            passed = report.passed(),
            failed = report.failed(),
            skipped = report.skipped(),
            "run finished"
        );
        Ok(report)
    }

    /// Run one plan and, on request, its children. Returns the IDs of the
    /// descendant plans that were visited.
    fn run_plan(&self, pass: &mut Pass<'_>, plan: &TestPlan, forced: Option<SkipReason>) -> Vec<ObjectId> {
        if !pass.visited.insert(plan.id) {
            return Vec::new();
        }
        let start = Utc::now();
        let scope = PlanScope::of(plan);
        let applicability = Applicability::from_parts(&plan.os, &plan.arch, &plan.tags);
        let mut plan_forced = forced
            .or((!plan.is_active).then_some(SkipReason::PlanNotActive))
            .or(applicability.check(&self.host).err());
        if let Some(reason) = plan_forced {
            tracing::info!(plan = plan.id.0, %reason, "plan skipped");
        }

        let container = pass.container;
        let cases: Vec<&TestCase> = plan.cases.iter().filter_map(|id| container.case(*id)).collect();
        let first_result = pass.report.results.len();

        for index in 0..pass.cells.len() {
            let cell = pass.cells[index].clone();
            if plan_forced.is_none() && self.abort.is_aborted() {
                plan_forced = Some(SkipReason::Aborted);
            }

            let mut plan_ready = false;
            if plan_forced.is_none() && !self.options.dry_run {
                match self.hook(Scope::Plan, Phase::Init, pass, &scope, None, &cell) {
                    Ok(()) => plan_ready = true,
                    Err(err) => {
                        let failed = self.assistant_result(&scope, None, &cell, Utc::now(), err);
                        pass.report.results.push(failed);
                        plan_forced = Some(SkipReason::Aborted);
                    }
                }
            }

            for case in &cases {
                let result = self.run_case(pass, &scope, case, &cell, plan_forced);
                pass.report.results.push(result);
            }

            if plan_ready
                && let Err(err) = self.hook(Scope::Plan, Phase::Cleanup, pass, &scope, None, &cell)
            {
                let failed = self.assistant_result(&scope, None, &cell, Utc::now(), err);
                pass.report.results.push(failed);
            }
        }

        let own = &pass.report.results[first_result..];
        let passed = own.iter().filter(|r| r.status == ResultStatus::Passed).count();
        let failed = own.iter().filter(|r| r.status.is_failure()).count();
        let skipped = own.iter().filter(|r| r.status.is_skipped()).count();

        let mut descendants = Vec::new();
        if self.options.descendants {
            let children: Vec<&TestPlan> = container
                .entities
                .test_plans
                .iter()
                .filter(|p| p.parent == Some(plan.id))
                .collect();
            for child in children {
                descendants.push(child.id.0);
                descendants.extend(self.run_plan(pass, child, plan_forced));
            }
        }

        let summary = self
            .settings
            .weights
            .aggregate_plan(&pass.report.results, plan.id.0, &descendants);
        pass.report.plans.push(PlanRecord {
            plan_id: plan.id.0,
            plan_name: plan.name.clone(),
            start_time: start,
            stop_time: Utc::now(),
            summary,
            passed,
            failed,
            skipped,
        });
        descendants
    }

    fn run_case(
        &self,
        pass: &Pass<'_>,
        scope: &PlanScope<'_>,
        case: &TestCase,
        cell: &MatrixCell,
        forced: Option<SkipReason>,
    ) -> ExecutionResult {
        let start = Utc::now();
        let skip = |reason: SkipReason| {
            tracing::debug!(case = case.id.0, code = %cell.code, %reason, "case skipped");
            self.result(scope, Some(case), cell, ResultStatus::Skipped(reason), start)
        };

        if let Some(reason) = forced {
            return skip(reason);
        }
        if self.abort.is_aborted() {
            return skip(SkipReason::Aborted);
        }
        let applicability = Applicability::from_parts(&case.os, &case.arch, &case.tags);
        if let Err(reason) = applicability.check(&self.host) {
            return skip(reason);
        }
        if !case.is_automated {
            return skip(SkipReason::CaseNotAutomated);
        }
        if self.options.dry_run {
            return skip(SkipReason::DryRun);
        }

        if let Err(err) = self.hook(Scope::Case, Phase::Init, pass, scope, Some(case), cell) {
            return self.assistant_result(scope, Some(case), cell, start, err);
        }

        let env = self.environment(pass, scope, Some(case), cell);
        let outcome = self.execute(scope, case, cell, &env);
        tracing::info!(case = case.id.0, code = %cell.code, status = %outcome.status, "case finished");

        let mut result = self.result(scope, Some(case), cell, outcome.status, start);
        result.detail = outcome.detail;
        result.output_file = outcome.output_file;

        if let Err(err) = self.hook(Scope::Case, Phase::Cleanup, pass, scope, Some(case), cell) {
            result.status = ResultStatus::AssistantFailed;
            result.detail = if result.detail.is_empty() {
                err.to_string()
            } else {
                format!("{}; {}", result.detail, err)
            };
        }
        result.stop_time = Utc::now();
        result
    }

    fn execute(
        &self,
        scope: &PlanScope<'_>,
        case: &TestCase,
        cell: &MatrixCell,
        env: &[(String, String)],
    ) -> Outcome {
        if case.script.trim().is_empty() {
            return Outcome {
                status: ResultStatus::Error,
                detail: "no script configured".to_string(),
                output_file: None,
            };
        }
        match Executable::parse(&case.script) {
            Ok(Executable::Script(script)) => {
                let log = self.paths.case_log(scope.id, case.id.0, &self.settings.output_log, &cell.code);
                let args: Vec<&str> = case.arguments.split_whitespace().collect();
                executable::run_script(&self.scripts, &script, &args, env, &log)
            }
            Ok(Executable::UnitTest(module)) => executable::run_unittest(self.registry, &module),
            Ok(Executable::Function(name)) => {
                let ctx = CallContext {
                    plan_id: scope.id,
                    case_id: Some(case.id.0),
                    cell,
                    env,
                    arguments: &case.arguments,
                };
                executable::run_function(self.registry, &name, &ctx)
            }
            Err(err) => Outcome {
                status: ResultStatus::Error,
                detail: err.to_string(),
                output_file: None,
            },
        }
    }

    fn hook(
        &self,
        scope: Scope,
        phase: Phase,
        pass: &Pass<'_>,
        plan: &PlanScope<'_>,
        case: Option<&TestCase>,
        cell: &MatrixCell,
    ) -> SyncResult<()> {
        let env = self.environment(pass, plan, case, cell);
        let ctx = CallContext {
            plan_id: plan.id,
            case_id: case.map(|c| c.id.0),
            cell,
            env: &env,
            arguments: "",
        };
        let name = match (scope, case) {
            (Scope::Entity, _) => format!("entity_{}", phase.as_str()),
            (Scope::Case, Some(c)) => format!("case_{}_{}_{}", plan.id, c.id, phase.as_str()),
            _ => format!("plan_{}_{}", plan.id, phase.as_str()),
        };
        let log = self.paths.assistant_log(&name, &cell.code);
        self.settings
            .assistants
            .invoke(scope, phase, self.registry, &self.scripts, &ctx, &log)
    }

    /// Variables exported to scripts and assistants, later entries winning.
    fn environment(
        &self,
        pass: &Pass<'_>,
        scope: &PlanScope<'_>,
        case: Option<&TestCase>,
        cell: &MatrixCell,
    ) -> Vec<(String, String)> {
        let mut env = self.settings.env.clone();
        let path = |p: &Path| p.display().to_string();
        env.push((env_vars::SOURCE_PATH.to_string(), path(&self.paths.source)));
        env.push((env_vars::TESTS_PATH.to_string(), path(&self.paths.tests)));
        env.push((
            env_vars::ATTACHMENTS_PATH.to_string(),
            path(&pass.container.base_dir.join("attachments")),
        ));
        env.push((env_vars::USERNAME.to_string(), self.options.tester.clone()));
        env.push((env_vars::MATRIX_CODE.to_string(), cell.code.clone()));
        env.push((env_vars::PLAN_ID.to_string(), scope.id.to_string()));
        if let Some(case) = case {
            env.push((env_vars::CASE_ID.to_string(), case.id.to_string()));
        }

        let essential = |props: &[Property], names: &[String], env: &mut Vec<(String, String)>| {
            env.extend(
                props
                    .iter()
                    .filter(|p| names.contains(&p.name))
                    .map(|p| (p.name.clone(), p.value.clone())),
            );
        };
        if let Some(plan) = scope.plan {
            essential(&plan.properties, &self.settings.plan_properties, &mut env);
        }
        if let Some(case) = case {
            essential(&case.properties, &self.settings.case_properties, &mut env);
        }
        env.extend(cell.properties.iter().cloned());
        env
    }

    fn result(
        &self,
        scope: &PlanScope<'_>,
        case: Option<&TestCase>,
        cell: &MatrixCell,
        status: ResultStatus,
        start: DateTime<Utc>,
    ) -> ExecutionResult {
        ExecutionResult {
            plan_id: scope.id,
            plan_name: scope.name.to_string(),
            case_id: case.map(|c| c.id.0),
            case_summary: case.map(|c| c.summary.clone()),
            matrix_code: cell.code.clone(),
            status,
            start_time: start,
            stop_time: Utc::now(),
            detail: String::new(),
            tester: self.options.tester.clone(),
            output_file: None,
        }
    }

    fn assistant_result(
        &self,
        scope: &PlanScope<'_>,
        case: Option<&TestCase>,
        cell: &MatrixCell,
        start: DateTime<Utc>,
        err: SyncError,
    ) -> ExecutionResult {
        tracing::warn!(plan = scope.id, code = %cell.code, error = %err, "assistant failed");
        let mut result = self.result(scope, case, cell, ResultStatus::AssistantFailed, start);
        result.detail = err.to_string();
        result
    }
}

/// Write the results of a run as a `plan-result` container to
/// `<working>/results/testplan_<id>.toml`.
pub fn write_result_container(
    paths: &ProductPaths,
    plan: &TestPlan,
    report: &RunReport,
) -> SyncResult<PathBuf> {
    let mut container = Container::new(EntityType::PlanResult, plan.id.0, &plan.name);
    container.entities.plan_results = report.plans.clone();
    container.entities.case_results = report.results.clone();
    let path = paths.results_dir().join(format!("testplan_{}.toml", plan.id));
    container
        .save(&path)
        .map_err(|e| SyncError::Container(e.to_string()))?;
    Ok(path)
}
