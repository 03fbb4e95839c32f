//! End-to-end reconciliation of containers against an in-memory TCMS.
//!
//! Covers dry-run parity, idempotence, remapping, ambiguity, owner checks,
//! user policies and attachment handling.

use serde_json::Value;
use tempfile::TempDir;
use tcmsync::apply::{LiveApply, SimulatedApply};
use tcmsync::container::Container;
use tcmsync::entity::{ExecutionStatus, TestExecution, TestRun};
use tcmsync::gateway::{MemoryGateway, TcmsGateway, fields};
use tcmsync::reconcile::{Engine, ImportOptions, ImportReport};
use tcmsync::test_helpers::{plan_container, seed_catalog};
use tcmsync::trace::Action;
use tcmsync::users::UserPolicy;
use tcmsync::{ErrorKind, SourceId, SyncError, TargetId, TcmsClass};

fn live(gw: &MemoryGateway, options: &ImportOptions, container: &Container) -> ImportReport {
    let apply = LiveApply::new(gw);
    Engine::new(gw, &apply, options).import_container(container)
}

fn simulated(gw: &MemoryGateway, options: &ImportOptions, container: &Container) -> ImportReport {
    let apply = SimulatedApply::new();
    Engine::new(gw, &apply, options).import_container(container)
}

fn action_of(report: &ImportReport, class: TcmsClass, source: i64) -> Action {
    report
        .trace
        .for_class(class)
        .find(|d| d.source == Some(SourceId(source)))
        .map(|d| d.action.clone())
        .unwrap_or_else(|| panic!("no decision for {} {}", class, source))
}

// ===========================================================================
// Dry run
// ===========================================================================

#[test]
fn test_dry_run_matches_live_run_and_changes_nothing() {
    let dry_gw = MemoryGateway::new("alice");
    seed_catalog(&dry_gw);
    let live_gw = MemoryGateway::new("alice");
    seed_catalog(&live_gw);
    let options = ImportOptions::default();
    let container = plan_container();

    let dry = simulated(&dry_gw, &options, &container);
    assert!(dry.simulated);
    assert_eq!(dry_gw.mutation_count(), 0);
    assert!(dry_gw.objects_of(TcmsClass::TestPlan).is_empty());

    let real = live(&live_gw, &options, &container);
    assert!(!real.simulated);
    assert!(real.is_success(), "{:?}", real.trace.failures().collect::<Vec<_>>());
    assert_eq!(dry.trace.parity_view(), real.trace.parity_view());
    assert_eq!(dry.summary, real.summary);
}

#[test]
fn test_duplicate_summaries_stay_distinct_in_both_modes() {
    let mut container = plan_container();
    let mut twin = container.entities.test_cases[0].clone();
    twin.id = SourceId(13);
    container.entities.test_cases.push(twin);
    container.entities.test_plans[0].cases.push(SourceId(13));
    let options = ImportOptions::default();

    let dry_gw = MemoryGateway::new("alice");
    seed_catalog(&dry_gw);
    let dry = simulated(&dry_gw, &options, &container);
    let live_gw = MemoryGateway::new("alice");
    seed_catalog(&live_gw);
    let real = live(&live_gw, &options, &container);

    for report in [&dry, &real] {
        for case in [11, 12, 13] {
            assert_eq!(action_of(report, TcmsClass::TestCase, case), Action::Created);
        }
    }
    assert_eq!(dry.trace.parity_view(), real.trace.parity_view());
    assert_eq!(live_gw.objects_of(TcmsClass::TestCase).len(), 3);
    let plan = &live_gw.objects_of(TcmsClass::TestPlan)[0];
    assert_eq!(plan.fields["cases"].as_array().map(Vec::len), Some(3));
}

#[test]
fn test_dry_run_placeholders_are_negative() {
    let gw = MemoryGateway::new("alice");
    seed_catalog(&gw);
    let report = simulated(&gw, &ImportOptions::default(), &plan_container());
    let created: Vec<TargetId> = report
        .trace
        .decisions()
        .iter()
        .filter(|d| d.action == Action::Created)
        .filter_map(|d| d.target)
        .collect();
    assert_eq!(created.len(), 3);
    assert!(created.iter().all(|t| t.0 < 0));
}

#[test]
fn test_dry_run_failure_has_same_taxonomy() {
    let gw = MemoryGateway::new("alice");
    // no catalog: the product itself is missing
    let report = simulated(&gw, &ImportOptions::default(), &plan_container());
    let abort = report.abort.expect("missing product aborts");
    assert_eq!(abort.kind(), ErrorKind::Resolution);
    assert!(matches!(abort, SyncError::MustExist { class: TcmsClass::Product, .. }));
}

// ===========================================================================
// Idempotence and remapping
// ===========================================================================

#[test]
fn test_second_definition_import_skips_everything() {
    let gw = MemoryGateway::new("alice");
    seed_catalog(&gw);
    let options = ImportOptions::default();
    let container = plan_container();

    let first = live(&gw, &options, &container);
    assert!(first.is_success());
    assert_eq!(action_of(&first, TcmsClass::TestPlan, 3), Action::Created);
    assert_eq!(action_of(&first, TcmsClass::TestCase, 11), Action::Created);
    let mutations = gw.mutation_count();

    let second = live(&gw, &options, &container);
    assert!(second.is_success());
    for class in [TcmsClass::TestPlan, TcmsClass::TestCase] {
        assert!(second.trace.for_class(class).all(|d| d.action == Action::Skipped));
    }
    assert_eq!(gw.mutation_count(), mutations);
    assert_eq!(gw.objects_of(TcmsClass::TestCase).len(), 2);
}

#[test]
fn test_master_data_remapped_to_target_ids() {
    let gw = MemoryGateway::new("alice");
    let seeded = seed_catalog(&gw);
    let report = live(&gw, &ImportOptions::default(), &plan_container());

    let version = report
        .trace
        .for_class(TcmsClass::Version)
        .next()
        .expect("version decision");
    assert_eq!(version.action, Action::Remapped);
    assert_eq!(version.target, Some(TargetId(seeded.version)));
    assert_eq!(action_of(&report, TcmsClass::Build, 201), Action::Remapped);
    assert_eq!(action_of(&report, TcmsClass::Product, 1), Action::Matched);
    assert_eq!(action_of(&report, TcmsClass::User, 7), Action::Remapped);

    let plan = &gw.objects_of(TcmsClass::TestPlan)[0];
    assert_eq!(plan.id_field("product-version"), Some(seeded.version));
    let cases = plan.fields.get("cases").and_then(Value::as_array).unwrap();
    assert_eq!(cases.len(), 2);
}

#[test]
fn test_missing_build_created_under_remapped_version() {
    let gw = MemoryGateway::new("alice");
    seed_catalog(&gw);
    let mut container = plan_container();
    container.entities.master_data.builds[0].name = "b2".to_string();
    let options = ImportOptions {
        auto_create: true,
        ..ImportOptions::default()
    };

    let report = live(&gw, &options, &container);
    assert_eq!(action_of(&report, TcmsClass::Build, 201), Action::Created);
    let b2 = gw
        .objects_of(TcmsClass::Build)
        .into_iter()
        .find(|b| b.str_field("name") == Some("b2"))
        .unwrap();
    assert_eq!(b2.id_field("version"), Some(55));
}

#[test]
fn test_existing_plan_left_untouched_on_reimport() {
    let gw = MemoryGateway::new("alice");
    seed_catalog(&gw);
    let options = ImportOptions::default();
    let mut container = plan_container();
    container.entities.test_plans[0].cases.truncate(1);
    container.entities.test_cases.truncate(1);
    live(&gw, &options, &container);
    let mutations = gw.mutation_count();

    let report = live(&gw, &options, &plan_container());
    assert_eq!(action_of(&report, TcmsClass::TestPlan, 3), Action::Skipped);
    assert_eq!(action_of(&report, TcmsClass::TestCase, 12), Action::Created);
    // only the new case was written
    assert_eq!(gw.mutation_count(), mutations + 1);
    let plan = &gw.objects_of(TcmsClass::TestPlan)[0];
    assert_eq!(plan.fields["cases"].as_array().map(Vec::len), Some(1));
}

// ===========================================================================
// Ambiguity and ownership
// ===========================================================================

#[test]
fn test_two_identical_plans_are_ambiguous() {
    let gw = MemoryGateway::new("alice");
    seed_catalog(&gw);
    for _ in 0..2 {
        let mut plan = fields([("name", "Smoke")]);
        plan.insert("product".to_string(), Value::from(1));
        plan.insert("product-version".to_string(), Value::from(55));
        gw.seed(TcmsClass::TestPlan, plan);
    }

    let report = live(&gw, &ImportOptions::default(), &plan_container());
    match action_of(&report, TcmsClass::TestPlan, 3) {
        Action::Failed(SyncError::AmbiguousMatch { class, count, .. }) => {
            assert_eq!(class, TcmsClass::TestPlan);
            assert_eq!(count, 2);
        }
        other => panic!("expected ambiguity, got {:?}", other),
    }
    assert_eq!(gw.objects_of(TcmsClass::TestPlan).len(), 2);
    assert!(!report.is_success());
    assert!(report.abort.is_none());
}

#[test]
fn test_same_plan_in_other_product_is_owner_mismatch() {
    let gw = MemoryGateway::new("alice");
    seed_catalog(&gw);
    gw.seed_with_id(TcmsClass::Product, 2, fields([("name", "other")]));
    let mut foreign = fields([("name", "Smoke")]);
    foreign.insert("product".to_string(), Value::from(2));
    gw.seed_with_id(TcmsClass::TestPlan, 3, foreign);

    let report = live(&gw, &ImportOptions::default(), &plan_container());
    match action_of(&report, TcmsClass::TestPlan, 3) {
        Action::Failed(err @ SyncError::OwnerMismatch { .. }) => {
            assert_eq!(err.kind(), ErrorKind::OwnerMismatch);
            let text = err.to_string();
            assert!(text.contains("demo") && text.contains("other"), "{}", text);
        }
        other => panic!("expected owner mismatch, got {:?}", other),
    }
}

// ===========================================================================
// Gateway failures
// ===========================================================================

fn with_run(mut c: Container) -> Container {
    c.entities.test_runs.push(TestRun {
        id: SourceId(40),
        summary: "nightly".to_string(),
        plan: SourceId(3),
        build: SourceId(201),
        manager: None,
        default_tester: None,
        start_date: None,
        stop_date: None,
        notes: String::new(),
        attachments: vec![],
    });
    c
}

#[test]
fn test_gateway_error_fails_one_object_and_its_dependants() {
    let gw = MemoryGateway::new("alice");
    seed_catalog(&gw);
    gw.fail_mutations_for(TcmsClass::TestPlan);
    let report = live(&gw, &ImportOptions::default(), &with_run(plan_container()));

    assert!(report.abort.is_none());
    match action_of(&report, TcmsClass::TestPlan, 3) {
        Action::Failed(err) => assert_eq!(err.kind(), ErrorKind::Gateway),
        other => panic!("expected gateway failure, got {:?}", other),
    }
    assert!(matches!(
        action_of(&report, TcmsClass::TestRun, 40),
        Action::Failed(SyncError::Unresolved { ref_class: TcmsClass::TestPlan, .. })
    ));
    // siblings went through
    assert_eq!(action_of(&report, TcmsClass::TestCase, 11), Action::Created);
    assert_eq!(action_of(&report, TcmsClass::TestCase, 12), Action::Created);
    assert_eq!(gw.objects_of(TcmsClass::TestCase).len(), 2);
}

// ===========================================================================
// Users
// ===========================================================================

fn container_with_user(name: &str) -> Container {
    let mut c = plan_container();
    c.entities.master_data.users[0].username = name.to_string();
    c
}

#[test]
fn test_user_policy_missing_substitutes_unknown_users() {
    let gw = MemoryGateway::new("alice");
    seed_catalog(&gw);
    let report = live(&gw, &ImportOptions::default(), &container_with_user("bob"));
    assert_eq!(action_of(&report, TcmsClass::User, 7), Action::Substituted);
    assert!(report.is_success());
}

#[test]
fn test_user_policy_never_fails_unknown_users() {
    let gw = MemoryGateway::new("alice");
    seed_catalog(&gw);
    let options = ImportOptions {
        user_policy: UserPolicy::Never,
        ..ImportOptions::default()
    };
    let report = live(&gw, &options, &container_with_user("bob"));
    assert!(matches!(
        action_of(&report, TcmsClass::User, 7),
        Action::Failed(SyncError::UserNotFound { .. })
    ));
    // the case author cannot be resolved either
    assert!(matches!(
        action_of(&report, TcmsClass::TestCase, 11),
        Action::Failed(SyncError::Unresolved { ref_class: TcmsClass::User, .. })
    ));
}

#[test]
fn test_user_policy_always_replaces_known_users() {
    let gw = MemoryGateway::new("alice");
    seed_catalog(&gw);
    gw.seed(TcmsClass::User, fields([("username", "bob")]));
    let options = ImportOptions {
        user_policy: UserPolicy::Always,
        ..ImportOptions::default()
    };
    let report = live(&gw, &options, &container_with_user("bob"));
    assert_eq!(action_of(&report, TcmsClass::User, 7), Action::Substituted);
}

// ===========================================================================
// Attachments
// ===========================================================================

fn container_with_attachment(dir: &TempDir, write_file: bool) -> Container {
    let mut c = plan_container();
    c.base_dir = dir.path().to_path_buf();
    c.entities.test_plans[0].attachments = vec!["spec.txt".to_string()];
    if write_file {
        let path = c.attachment_path(TcmsClass::TestPlan, SourceId(3), "spec.txt");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "steps").unwrap();
    }
    c
}

fn attachment_options(strict: bool) -> ImportOptions {
    ImportOptions {
        include_attachments: true,
        strict_attachments: strict,
        ..ImportOptions::default()
    }
}

#[test]
fn test_attachment_uploaded_to_created_plan() {
    let dir = TempDir::new().unwrap();
    let gw = MemoryGateway::new("alice");
    seed_catalog(&gw);
    let report = live(&gw, &attachment_options(false), &container_with_attachment(&dir, true));
    assert!(report.is_success());
    let plan = gw.objects_of(TcmsClass::TestPlan)[0].id;
    let files = gw.list_attachments(TcmsClass::TestPlan, plan).unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].name, "spec.txt");
    assert_eq!(
        gw.download_attachment(TcmsClass::TestPlan, plan, "spec.txt").unwrap(),
        b"steps".to_vec()
    );
}

#[test]
fn test_missing_attachment_recorded_when_not_strict() {
    let dir = TempDir::new().unwrap();
    let gw = MemoryGateway::new("alice");
    seed_catalog(&gw);
    let report = live(&gw, &attachment_options(false), &container_with_attachment(&dir, false));
    assert!(report.abort.is_none());
    assert_eq!(report.attachments.len(), 1);
    assert!(matches!(
        report.attachments[0].error,
        Some(SyncError::AttachmentMissing { .. })
    ));
    assert!(!report.is_success());
    // the plan itself was still created
    assert_eq!(gw.objects_of(TcmsClass::TestPlan).len(), 1);
}

#[test]
fn test_missing_attachment_aborts_when_strict() {
    let dir = TempDir::new().unwrap();
    let gw = MemoryGateway::new("alice");
    seed_catalog(&gw);
    let report = live(&gw, &attachment_options(true), &container_with_attachment(&dir, false));
    let abort = report.abort.expect("strict mode aborts");
    assert_eq!(abort.kind(), ErrorKind::Attachment);
}

#[test]
fn test_execution_attachments_are_not_supported() {
    let dir = TempDir::new().unwrap();
    let gw = MemoryGateway::new("alice");
    seed_catalog(&gw);
    let mut c = with_run(plan_container());
    c.base_dir = dir.path().to_path_buf();
    c.entities.master_data.execution_statuses.push(ExecutionStatus {
        id: SourceId(9),
        name: "PASSED".to_string(),
        weight: 20,
        icon: String::new(),
        color: String::new(),
    });
    c.entities.test_executions.push(TestExecution {
        id: SourceId(50),
        run: SourceId(40),
        case: SourceId(11),
        build: SourceId(201),
        status: SourceId(9),
        assignee: None,
        tested_by: None,
        start_date: None,
        stop_date: None,
        comment: String::new(),
        attachments: vec!["screen.png".to_string()],
    });

    let report = live(&gw, &attachment_options(false), &c);
    assert_eq!(action_of(&report, TcmsClass::TestExecution, 50), Action::Created);
    assert!(report.abort.is_none());
    assert_eq!(report.attachments.len(), 1);
    assert_eq!(
        report.attachments[0].error,
        Some(SyncError::AttachmentsNotSupported {
            class: TcmsClass::TestExecution
        })
    );
    assert_eq!(report.attachments[0].error.as_ref().map(SyncError::kind), Some(ErrorKind::Attachment));
}

#[test]
fn test_attachments_ignored_unless_requested() {
    let dir = TempDir::new().unwrap();
    let gw = MemoryGateway::new("alice");
    seed_catalog(&gw);
    let report = live(&gw, &ImportOptions::default(), &container_with_attachment(&dir, false));
    assert!(report.attachments.is_empty());
    assert!(report.is_success());
}
