//! Runner scenarios: scripts over a property matrix, host gating, abort,
//! and storing a run's results back into TCMS.

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use tcmsync::apply::{LiveApply, SimulatedApply};
use tcmsync::container::{Container, EntityType};
use tcmsync::entity::{EnvProperty, Environment, PropertyValue};
use tcmsync::exporter::{ExportOptions, ExportTarget, Exporter};
use tcmsync::gateway::{MemoryGateway, TcmsGateway};
use tcmsync::platform::Host;
use tcmsync::reconcile::results::{report_from_records, resolve_build};
use tcmsync::reconcile::{Engine, ImportOptions};
use tcmsync::runner::executable::Registry;
use tcmsync::runner::{AbortHandle, RunOptions, RunTarget, Runner, RunnerSettings, write_result_container};
use tcmsync::test_helpers::{plan_container, product_paths, sample_case, sample_plan, seed_catalog};
use tcmsync::trace::Action;
use tcmsync::{ResultStatus, SkipReason, SourceId, TcmsClass};

fn options() -> RunOptions {
    RunOptions {
        dry_run: false,
        descendants: false,
        tester: "alice".to_string(),
    }
}

fn matrix_env() -> Environment {
    Environment {
        id: SourceId(1),
        name: "matrix".to_string(),
        description: String::new(),
        properties: vec![
            EnvProperty {
                name: "LANG".to_string(),
                value: PropertyValue::List(vec!["en_US".to_string(), "de_DE".to_string()]),
            },
            EnvProperty {
                name: "os".to_string(),
                value: PropertyValue::List(vec!["Linux".to_string()]),
            },
        ],
    }
}

fn single_plan(cases: Vec<tcmsync::entity::TestCase>) -> Container {
    let ids: Vec<i64> = cases.iter().map(|c| c.id.0).collect();
    let mut c = Container::new(EntityType::TestPlan, 10, "scripts");
    c.entities.test_plans.push(sample_plan(10, "scripts", &ids));
    c.entities.test_cases = cases;
    c
}

// ===========================================================================
// Scripts
// ===========================================================================

#[cfg(unix)]
#[test]
fn test_script_runs_once_per_matrix_cell_with_logs() {
    let dir = TempDir::new().unwrap();
    let paths = product_paths(dir.path());
    fs::write(
        paths.tests.join("lang.sh"),
        "echo \"$LANG $TCMSYNC_MATRIX_CODE $TCMSYNC_USERNAME\"\n[ \"$LANG\" = \"en_US\" ]\n",
    )
    .unwrap();
    let mut case = sample_case(1, "language check");
    case.script = "script:lang.sh".to_string();
    let container = single_plan(vec![case]);

    let settings = RunnerSettings {
        test_driver: Some("sh".to_string()),
        ..RunnerSettings::default()
    };
    let registry = Registry::new();
    let runner = Runner::new(paths.clone(), settings, &registry, options()).unwrap();
    let report = runner
        .run(&container, RunTarget::Plan(SourceId(10)), Some(&matrix_env()))
        .unwrap();

    let statuses: Vec<(String, ResultStatus)> = report
        .results
        .iter()
        .map(|r| (r.matrix_code.clone(), r.status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("en_US_Linux".to_string(), ResultStatus::Passed),
            ("de_DE_Linux".to_string(), ResultStatus::Failed),
        ]
    );
    assert_eq!(report.results[1].detail, "exit code 1");

    let log = paths
        .working
        .join("results")
        .join("case")
        .join("10_1")
        .join("console.log_de_DE_Linux");
    assert_eq!(report.results[1].output_file.as_deref(), Some(log.as_path()));
    assert_eq!(fs::read_to_string(&log).unwrap().trim(), "de_DE de_DE_Linux alice");
    assert_eq!(report.plans[0].summary, Some(ResultStatus::Failed));
}

#[test]
fn test_unittest_collection_counts_failures() {
    let dir = TempDir::new().unwrap();
    let mut registry = Registry::new();
    registry.register_test("auth", "login", || {});
    registry.register_test("auth", "lockout", || panic!("account not locked"));
    let mut case = sample_case(1, "auth suite");
    case.script = "unittest:auth".to_string();

    let runner = Runner::new(
        product_paths(dir.path()),
        RunnerSettings::default(),
        &registry,
        options(),
    )
    .unwrap();
    let report = runner
        .run(&single_plan(vec![case]), RunTarget::Plan(SourceId(10)), None)
        .unwrap();
    assert_eq!(report.results[0].status, ResultStatus::Failed);
    assert!(report.results[0].detail.starts_with("1 of 2 tests failed"));
}

// ===========================================================================
// Gating and abort
// ===========================================================================

#[test]
fn test_windows_case_skipped_on_linux() {
    let dir = TempDir::new().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = Registry::new();
    let counter = calls.clone();
    registry.register_function("probe", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let mut windows = sample_case(1, "registry keys");
    windows.os = vec!["Windows".to_string()];
    windows.script = "function:probe".to_string();
    let mut any = sample_case(2, "portable");
    any.script = "function:probe".to_string();

    let runner = Runner::new(
        product_paths(dir.path()),
        RunnerSettings::default(),
        &registry,
        options(),
    )
    .unwrap()
    .with_host(Host::new("linux", "x86_64"));
    let report = runner
        .run(&single_plan(vec![windows, any]), RunTarget::Plan(SourceId(10)), None)
        .unwrap();

    assert_eq!(
        report.results[0].status,
        ResultStatus::Skipped(SkipReason::NotForLocalOs)
    );
    assert_eq!(
        report.results[0].status.to_string(),
        "SKIPPED (not suitable for local operating system)"
    );
    assert_eq!(report.results[1].status, ResultStatus::Passed);
    assert_eq!(report.failed(), 0);
    assert_eq!(report.results.len(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_abort_turns_remaining_cells_into_skips() {
    let dir = TempDir::new().unwrap();
    let slot: Arc<Mutex<Option<AbortHandle>>> = Arc::new(Mutex::new(None));
    let mut registry = Registry::new();
    let handle = slot.clone();
    registry.register_function("stop", move |_| {
        if let Some(h) = handle.lock().unwrap().as_ref() {
            h.abort();
        }
        Err("stopping".to_string())
    });
    let mut first = sample_case(1, "stops the run");
    first.script = "function:stop".to_string();
    let mut second = sample_case(2, "never runs");
    second.script = "function:stop".to_string();

    let runner = Runner::new(
        product_paths(dir.path()),
        RunnerSettings::default(),
        &registry,
        options(),
    )
    .unwrap();
    *slot.lock().unwrap() = Some(runner.abort_handle());
    let report = runner
        .run(&single_plan(vec![first, second]), RunTarget::Plan(SourceId(10)), Some(&matrix_env()))
        .unwrap();

    let statuses: Vec<ResultStatus> = report.results.iter().map(|r| r.status).collect();
    let aborted = ResultStatus::Skipped(SkipReason::Aborted);
    assert_eq!(statuses, vec![ResultStatus::Failed, aborted, aborted, aborted]);
    // the failure before the abort still counts
    assert_eq!(report.plans[0].summary, Some(ResultStatus::Failed));
}

#[test]
fn test_entity_assistant_failure_skips_everything() {
    let dir = TempDir::new().unwrap();
    let mut registry = Registry::new();
    registry.register_function("broken", |_| Err("no lab".to_string()));
    registry.register_function("ok", |_| Ok(()));
    let mut case = sample_case(1, "c");
    case.script = "function:ok".to_string();
    let settings = RunnerSettings {
        assistants: tcmsync::runner::assistant::Assistants::parse(Some("function:broken"), None, None)
            .unwrap(),
        ..RunnerSettings::default()
    };

    let runner = Runner::new(product_paths(dir.path()), settings, &registry, options()).unwrap();
    let report = runner
        .run(&single_plan(vec![case]), RunTarget::Plan(SourceId(10)), None)
        .unwrap();
    assert_eq!(report.results[0].status, ResultStatus::AssistantFailed);
    assert_eq!(
        report.results[0].detail,
        "entity assistant failed during init: no lab"
    );
    assert_eq!(report.results[1].status, ResultStatus::Skipped(SkipReason::Aborted));
}

// ===========================================================================
// Result storage
// ===========================================================================

/// Import the sample plan, export it back so container IDs are TCMS IDs,
/// and run it with `login` passing and `logout` failing.
fn run_exported_plan(gw: &MemoryGateway, dir: &TempDir) -> (Container, tcmsync::RunReport) {
    seed_catalog(gw);
    let apply = LiveApply::new(gw);
    let import_options = ImportOptions::default();
    let imported = Engine::new(gw, &apply, &import_options).import_container(&plan_container());
    assert!(imported.is_success());

    let plan_id = gw.objects_of(TcmsClass::TestPlan)[0].id;
    let container = Exporter::new(gw, ExportOptions::default())
        .export(ExportTarget::Plan(plan_id), None)
        .unwrap();

    let mut registry = Registry::new();
    registry.register_function("login", |_| Ok(()));
    registry.register_function("logout", |_| Err("session kept".to_string()));
    let runner = Runner::new(
        product_paths(dir.path()),
        RunnerSettings::default(),
        &registry,
        options(),
    )
    .unwrap();
    let report = runner
        .run(&container, RunTarget::Plan(SourceId(plan_id)), None)
        .unwrap();
    (container, report)
}

#[test]
fn test_results_stored_as_run_and_executions() {
    let dir = TempDir::new().unwrap();
    let gw = MemoryGateway::new("alice");
    let (container, report) = run_exported_plan(&gw, &dir);
    assert_eq!((report.passed(), report.failed()), (1, 1));

    let build = resolve_build(&gw, container.entity_id, "b1").unwrap();
    assert_eq!(build.0, 56);
    let apply = LiveApply::new(&gw);
    let options = ImportOptions::default();
    let stored = Engine::new(&gw, &apply, &options).store_results(build, &report);
    assert!(stored.is_success(), "{:?}", stored.trace.failures().collect::<Vec<_>>());

    let runs = gw.objects_of(TcmsClass::TestRun);
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].id_field("plan"), Some(container.entity_id));
    assert_eq!(
        runs[0].str_field("notes"),
        Some("Result: FAILED\npassed: 1, failed: 1, skipped: 0")
    );
    let record = &report.plans[0];
    assert_eq!((record.passed, record.failed, record.skipped), (1, 1, 0));

    let passed = gw.find(TcmsClass::ExecutionStatus, &tcmsync::Filter::new().eq("name", "PASSED")).unwrap()[0].id;
    let failed = gw.find(TcmsClass::ExecutionStatus, &tcmsync::Filter::new().eq("name", "FAILED")).unwrap()[0].id;
    let mut statuses: Vec<i64> = gw
        .objects_of(TcmsClass::TestExecution)
        .iter()
        .filter_map(|e| e.id_field("status"))
        .collect();
    statuses.sort();
    assert_eq!(statuses, vec![passed, failed]);
}

#[test]
fn test_existing_results_follow_policy() {
    let dir = TempDir::new().unwrap();
    let gw = MemoryGateway::new("alice");
    let (container, report) = run_exported_plan(&gw, &dir);
    let build = resolve_build(&gw, container.entity_id, "b1").unwrap();
    let apply = LiveApply::new(&gw);

    let options = ImportOptions::default();
    Engine::new(&gw, &apply, &options).store_results(build, &report);
    let again = Engine::new(&gw, &apply, &options).store_results(build, &report);
    assert!(again.trace.for_class(TcmsClass::TestRun).all(|d| d.action == Action::Updated));
    assert_eq!(gw.objects_of(TcmsClass::TestExecution).len(), 2);

    let skip = ImportOptions {
        existing_results: tcmsync::ExistingResultPolicy::Skip,
        ..ImportOptions::default()
    };
    let sim = SimulatedApply::new();
    let skipped = Engine::new(&gw, &sim, &skip).store_results(build, &report);
    assert!(skipped.trace.for_class(TcmsClass::TestExecution).all(|d| d.action == Action::Skipped));
    assert!(sim.calls().is_empty());
}

#[test]
fn test_result_container_roundtrips_into_storage() {
    let dir = TempDir::new().unwrap();
    let gw = MemoryGateway::new("alice");
    let (container, report) = run_exported_plan(&gw, &dir);
    let paths = product_paths(dir.path());
    let plan = &container.entities.test_plans[0];

    let path = write_result_container(&paths, plan, &report).unwrap();
    let loaded = Container::load(&path).unwrap();
    assert_eq!(loaded.entity_type, EntityType::PlanResult);
    let rebuilt = report_from_records(&loaded.entities.plan_results, &loaded.entities.case_results);
    assert_eq!(rebuilt.results.len(), report.results.len());
    assert_eq!(rebuilt.failed(), 1);
}
