use serde_json::Value;
use std::path::Path;

use crate::container::{Container, EntityType};
use crate::entity::{
    Build, CaseStatus, Category, Classification, ObjectId, PlanType, Priority, Product, SourceId,
    TcmsClass, TestCase, TestPlan, User, Version,
};
use crate::gateway::{Fields, MemoryGateway, fields};
use crate::runner::ProductPaths;

/// A plan with the given id, name and case links, on product 1 / version 102.
pub fn sample_plan(id: i64, name: &str, cases: &[i64]) -> TestPlan {
    TestPlan {
        id: SourceId(id),
        name: name.to_string(),
        text: String::new(),
        product: SourceId(1),
        product_version: SourceId(102),
        plan_type: SourceId(1),
        parent: None,
        is_active: true,
        author: None,
        tags: vec![],
        cases: cases.iter().copied().map(SourceId).collect(),
        properties: vec![],
        os: vec![],
        arch: vec![],
        attachments: vec![],
    }
}

/// An automated case without a script, in category 5.
pub fn sample_case(id: i64, summary: &str) -> TestCase {
    TestCase {
        id: SourceId(id),
        summary: summary.to_string(),
        text: String::new(),
        category: SourceId(5),
        priority: SourceId(1),
        case_status: SourceId(2),
        author: None,
        default_tester: None,
        reviewer: None,
        is_automated: true,
        script: String::new(),
        arguments: String::new(),
        requirement: String::new(),
        notes: String::new(),
        tags: vec![],
        components: vec![],
        properties: vec![],
        os: vec![],
        arch: vec![],
        attachments: vec![],
    }
}

/// Plan container "Smoke" (plan 3) linking cases 11 and 12, with the
/// master data both need and user alice (7) as author.
pub fn plan_container() -> Container {
    let mut c = Container::new(EntityType::TestPlan, 3, "Smoke");
    let md = &mut c.entities.master_data;
    md.classifications.push(Classification {
        id: SourceId(1),
        name: "Software".to_string(),
    });
    md.versions.push(Version {
        id: SourceId(102),
        value: "1.0".to_string(),
        product: SourceId(1),
    });
    md.builds.push(Build {
        id: SourceId(201),
        name: "b1".to_string(),
        version: SourceId(102),
        is_active: true,
    });
    md.categories.push(Category {
        id: SourceId(5),
        name: "default".to_string(),
        product: SourceId(1),
        description: String::new(),
    });
    md.plan_types.push(PlanType {
        id: SourceId(1),
        name: "Function".to_string(),
        description: String::new(),
    });
    md.priorities.push(Priority {
        id: SourceId(1),
        value: "P1".to_string(),
        is_active: true,
    });
    md.case_statuses.push(CaseStatus {
        id: SourceId(2),
        name: "CONFIRMED".to_string(),
        is_confirmed: true,
        description: String::new(),
    });
    md.users.push(User {
        id: SourceId(7),
        username: "alice".to_string(),
        first_name: String::new(),
        last_name: String::new(),
        email: String::new(),
        is_active: true,
    });
    c.entities.products.push(Product {
        id: SourceId(1),
        name: "demo".to_string(),
        classification: SourceId(1),
        description: String::new(),
    });

    for (id, summary, script) in [(11, "login works", "function:login"), (12, "logout works", "function:logout")] {
        let mut case = sample_case(id, summary);
        case.author = Some(SourceId(7));
        case.script = script.to_string();
        c.entities.test_cases.push(case);
    }
    let mut plan = sample_plan(3, "Smoke", &[11, 12]);
    plan.author = Some(SourceId(7));
    c.entities.test_plans.push(plan);
    c
}

/// Target IDs of the objects [`seed_catalog`] creates.
#[derive(Debug, Clone, Copy)]
pub struct Seeded {
    pub product: ObjectId,
    pub version: ObjectId,
    pub build: ObjectId,
}

fn with(mut base: Fields, extra: &[(&str, Value)]) -> Fields {
    for (k, v) in extra {
        base.insert(k.to_string(), v.clone());
    }
    base
}

/// Seed the target with master data matching [`plan_container`]. Product
/// keeps ID 1; version 102 lives in the target as 55.
pub fn seed_catalog(gw: &MemoryGateway) -> Seeded {
    gw.seed_with_id(TcmsClass::Classification, 30, fields([("name", "Software")]));
    gw.seed_with_id(
        TcmsClass::Product,
        1,
        with(fields([("name", "demo")]), &[("classification", Value::from(30))]),
    );
    gw.seed_with_id(
        TcmsClass::Version,
        55,
        with(fields([("value", "1.0")]), &[("product", Value::from(1))]),
    );
    gw.seed_with_id(
        TcmsClass::Build,
        56,
        with(
            fields([("name", "b1")]),
            &[("version", Value::from(55)), ("is-active", Value::from(true))],
        ),
    );
    gw.seed_with_id(TcmsClass::PlanType, 60, fields([("name", "Function")]));
    gw.seed_with_id(
        TcmsClass::Category,
        61,
        with(fields([("name", "default")]), &[("product", Value::from(1))]),
    );
    gw.seed_with_id(TcmsClass::Priority, 62, fields([("value", "P1")]));
    gw.seed_with_id(TcmsClass::CaseStatus, 63, fields([("name", "CONFIRMED")]));
    for (offset, name) in ["PASSED", "FAILED", "ERROR", "BLOCKED", "IDLE"].iter().enumerate() {
        gw.seed_with_id(TcmsClass::ExecutionStatus, 70 + offset as ObjectId, fields([("name", *name)]));
    }
    Seeded {
        product: 1,
        version: 55,
        build: 56,
    }
}

/// Product paths below `dir` with an existing source directory that also
/// serves as the test path.
pub fn product_paths(dir: &Path) -> ProductPaths {
    let source = dir.join("src");
    std::fs::create_dir_all(&source).unwrap();
    ProductPaths {
        tests: source.clone(),
        source,
        working: dir.join("work"),
    }
}
