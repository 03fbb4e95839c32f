//! Entity container files: parsing, validation and writing.
//!
//! A container holds one exported entity (product, plan, case or plan
//! result) together with everything it references. The format follows the
//! file extension: `.json`, `.yaml`/`.yml`, anything else is TOML.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::entity::{
    Environment, MasterData, ObjectId, Product, SourceId, TcmsClass, TestCase, TestExecution,
    TestPlan, TestRun,
};
use crate::runner::result::{ExecutionResult, PlanRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityType {
    Product,
    TestPlan,
    TestCase,
    PlanResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Toml,
    Json,
    Yaml,
}

impl Format {
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("json") => Format::Json,
            Some("yaml") | Some("yml") => Format::Yaml,
            _ => Format::Toml,
        }
    }
}

/// A structural problem found while validating a container.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContainerIssue {
    #[error("header field '{field}' is missing")]
    MissingHeader { field: &'static str },
    #[error("{class} #{id} is defined more than once")]
    DuplicateId { class: TcmsClass, id: SourceId },
    #[error("{class} #{id} references {ref_class} #{ref_id}, which is not in the container")]
    DanglingReference {
        class: TcmsClass,
        id: SourceId,
        ref_class: TcmsClass,
        ref_id: SourceId,
    },
    #[error("container holds {count} products, at most one is allowed")]
    MultipleProducts { count: usize },
    #[error("container holds test entities but no product")]
    NoProduct,
}

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Cannot parse {path}: {message}")]
    Parse { path: String, message: String },
    #[error("Cannot serialize container: {0}")]
    Serialize(String),
    #[error("Container {path} has {} issue(s): {}", .issues.len(), join_issues(.issues))]
    Invalid {
        path: String,
        issues: Vec<ContainerIssue>,
    },
}

fn join_issues(issues: &[ContainerIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Entity tables of a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct Entities {
    #[serde(default, skip_serializing_if = "MasterData::is_empty")]
    pub master_data: MasterData,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub products: Vec<Product>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub test_plans: Vec<TestPlan>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub test_cases: Vec<TestCase>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub test_runs: Vec<TestRun>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub test_executions: Vec<TestExecution>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environments: Vec<Environment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plan_results: Vec<PlanRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub case_results: Vec<ExecutionResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Container {
    pub entity_type: EntityType,
    pub entity_id: ObjectId,
    pub entity_name: String,
    #[serde(flatten)]
    pub entities: Entities,
    /// Directory the container was loaded from; attachments live below it.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawContainer {
    entity_type: Option<EntityType>,
    entity_id: Option<ObjectId>,
    entity_name: Option<String>,
    #[serde(flatten)]
    entities: Entities,
}

impl Container {
    pub fn new(entity_type: EntityType, entity_id: ObjectId, entity_name: &str) -> Self {
        Self {
            entity_type,
            entity_id,
            entity_name: entity_name.to_string(),
            entities: Entities::default(),
            base_dir: PathBuf::from("."),
        }
    }

    /// Parse and validate a container from text in the given format.
    pub fn parse(text: &str, format: Format, origin: &str) -> Result<Self, ContainerError> {
        let parse_err = |message: String| ContainerError::Parse {
            path: origin.to_string(),
            message,
        };
        let raw: RawContainer = match format {
            Format::Toml => toml::from_str(text).map_err(|e| parse_err(e.to_string()))?,
            Format::Json => serde_json::from_str(text).map_err(|e| parse_err(e.to_string()))?,
            Format::Yaml => serde_yaml::from_str(text).map_err(|e| parse_err(e.to_string()))?,
        };

        let mut issues = Vec::new();
        if raw.entity_type.is_none() {
            issues.push(ContainerIssue::MissingHeader {
                field: "entity-type",
            });
        }
        if raw.entity_id.is_none() {
            issues.push(ContainerIssue::MissingHeader { field: "entity-id" });
        }
        if raw.entity_name.as_deref().is_none_or(str::is_empty) {
            issues.push(ContainerIssue::MissingHeader {
                field: "entity-name",
            });
        }
        let (Some(entity_type), Some(entity_id), Some(entity_name), true) = (
            raw.entity_type,
            raw.entity_id,
            raw.entity_name,
            issues.is_empty(),
        ) else {
            return Err(ContainerError::Invalid {
                path: origin.to_string(),
                issues,
            });
        };

        let container = Container {
            entity_type,
            entity_id,
            entity_name,
            entities: raw.entities,
            base_dir: PathBuf::from("."),
        };
        let issues = container.validate();
        if !issues.is_empty() {
            return Err(ContainerError::Invalid {
                path: origin.to_string(),
                issues,
            });
        }
        Ok(container)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ContainerError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ContainerError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let mut container = Self::parse(&text, Format::from_path(path), &path.display().to_string())?;
        container.base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        tracing::debug!(path = %path.display(), kind = ?container.entity_type, "container loaded");
        Ok(container)
    }

    pub fn to_text(&self, format: Format) -> Result<String, ContainerError> {
        let ser_err = |e: String| ContainerError::Serialize(e);
        match format {
            Format::Toml => toml::to_string_pretty(self).map_err(|e| ser_err(e.to_string())),
            Format::Json => serde_json::to_string_pretty(self).map_err(|e| ser_err(e.to_string())),
            Format::Yaml => serde_yaml::to_string(self).map_err(|e| ser_err(e.to_string())),
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ContainerError> {
        let path = path.as_ref();
        let text = self.to_text(Format::from_path(path))?;
        let io_err = |e: std::io::Error| ContainerError::Io {
            path: path.display().to_string(),
            source: e,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(path, text).map_err(io_err)
    }

    /// Location of an attachment file shipped with the container.
    pub fn attachment_path(&self, class: TcmsClass, id: SourceId, file: &str) -> PathBuf {
        self.base_dir
            .join("attachments")
            .join(class.attachment_dir())
            .join(id.to_string())
            .join(file)
    }

    pub fn product(&self) -> Option<&Product> {
        self.entities.products.first()
    }

    pub fn plan(&self, id: SourceId) -> Option<&TestPlan> {
        self.entities.test_plans.iter().find(|p| p.id == id)
    }

    pub fn case(&self, id: SourceId) -> Option<&TestCase> {
        self.entities.test_cases.iter().find(|c| c.id == id)
    }

    /// Structural checks: unique IDs, resolvable references, one product.
    pub fn validate(&self) -> Vec<ContainerIssue> {
        let e = &self.entities;
        let md = &e.master_data;
        let mut issues = Vec::new();

        fn ids<T>(
            class: TcmsClass,
            items: &[T],
            id: impl Fn(&T) -> SourceId,
            issues: &mut Vec<ContainerIssue>,
        ) -> HashSet<SourceId> {
            let mut seen = HashSet::new();
            for item in items {
                if !seen.insert(id(item)) {
                    issues.push(ContainerIssue::DuplicateId {
                        class,
                        id: id(item),
                    });
                }
            }
            seen
        }

        let products = ids(TcmsClass::Product, &e.products, |p| p.id, &mut issues);
        let versions = ids(TcmsClass::Version, &md.versions, |v| v.id, &mut issues);
        let builds = ids(TcmsClass::Build, &md.builds, |b| b.id, &mut issues);
        let categories = ids(TcmsClass::Category, &md.categories, |c| c.id, &mut issues);
        let components = ids(TcmsClass::Component, &md.components, |c| c.id, &mut issues);
        let plan_types = ids(TcmsClass::PlanType, &md.plan_types, |t| t.id, &mut issues);
        let priorities = ids(TcmsClass::Priority, &md.priorities, |p| p.id, &mut issues);
        let case_statuses = ids(TcmsClass::CaseStatus, &md.case_statuses, |s| s.id, &mut issues);
        let exec_statuses = ids(
            TcmsClass::ExecutionStatus,
            &md.execution_statuses,
            |s| s.id,
            &mut issues,
        );
        let users = ids(TcmsClass::User, &md.users, |u| u.id, &mut issues);
        ids(TcmsClass::Classification, &md.classifications, |c| c.id, &mut issues);
        let plans = ids(TcmsClass::TestPlan, &e.test_plans, |p| p.id, &mut issues);
        let cases = ids(TcmsClass::TestCase, &e.test_cases, |c| c.id, &mut issues);
        let runs = ids(TcmsClass::TestRun, &e.test_runs, |r| r.id, &mut issues);
        ids(TcmsClass::TestExecution, &e.test_executions, |x| x.id, &mut issues);
        ids(TcmsClass::Environment, &e.environments, |x| x.id, &mut issues);

        if e.products.len() > 1 {
            issues.push(ContainerIssue::MultipleProducts {
                count: e.products.len(),
            });
        }
        if e.products.is_empty() && (!e.test_plans.is_empty() || !e.test_cases.is_empty()) {
            issues.push(ContainerIssue::NoProduct);
        }

        let mut check = |class, id, ref_class, ref_id: SourceId, known: &HashSet<SourceId>| {
            if !known.contains(&ref_id) {
                issues.push(ContainerIssue::DanglingReference {
                    class,
                    id,
                    ref_class,
                    ref_id,
                });
            }
        };

        for v in &md.versions {
            check(TcmsClass::Version, v.id, TcmsClass::Product, v.product, &products);
        }
        for b in &md.builds {
            check(TcmsClass::Build, b.id, TcmsClass::Version, b.version, &versions);
        }
        for c in &md.categories {
            check(TcmsClass::Category, c.id, TcmsClass::Product, c.product, &products);
        }
        for c in &md.components {
            check(TcmsClass::Component, c.id, TcmsClass::Product, c.product, &products);
        }
        for p in &e.test_plans {
            let class = TcmsClass::TestPlan;
            check(class, p.id, TcmsClass::Product, p.product, &products);
            check(class, p.id, TcmsClass::Version, p.product_version, &versions);
            check(class, p.id, TcmsClass::PlanType, p.plan_type, &plan_types);
            if let Some(parent) = p.parent {
                check(class, p.id, TcmsClass::TestPlan, parent, &plans);
            }
            if let Some(author) = p.author {
                check(class, p.id, TcmsClass::User, author, &users);
            }
            for case in &p.cases {
                check(class, p.id, TcmsClass::TestCase, *case, &cases);
            }
        }
        for c in &e.test_cases {
            let class = TcmsClass::TestCase;
            check(class, c.id, TcmsClass::Category, c.category, &categories);
            check(class, c.id, TcmsClass::Priority, c.priority, &priorities);
            check(class, c.id, TcmsClass::CaseStatus, c.case_status, &case_statuses);
            for user in [c.author, c.default_tester, c.reviewer].into_iter().flatten() {
                check(class, c.id, TcmsClass::User, user, &users);
            }
            for comp in &c.components {
                check(class, c.id, TcmsClass::Component, *comp, &components);
            }
        }
        for r in &e.test_runs {
            let class = TcmsClass::TestRun;
            check(class, r.id, TcmsClass::TestPlan, r.plan, &plans);
            check(class, r.id, TcmsClass::Build, r.build, &builds);
            for user in [r.manager, r.default_tester].into_iter().flatten() {
                check(class, r.id, TcmsClass::User, user, &users);
            }
        }
        for x in &e.test_executions {
            let class = TcmsClass::TestExecution;
            check(class, x.id, TcmsClass::TestRun, x.run, &runs);
            check(class, x.id, TcmsClass::TestCase, x.case, &cases);
            check(class, x.id, TcmsClass::Build, x.build, &builds);
            check(class, x.id, TcmsClass::ExecutionStatus, x.status, &exec_statuses);
            for user in [x.assignee, x.tested_by].into_iter().flatten() {
                check(class, x.id, TcmsClass::User, user, &users);
            }
        }
        issues
    }
}
