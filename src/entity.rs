//! Typed entity model for TCMS objects and master data.
//!
//! Records are built once from a parsed container and are never mutated by
//! the reconciliation engine. Every record keeps the ID it had in the
//! exporting TCMS (`SourceId`); IDs in the destination TCMS are `TargetId`s
//! and only ever live in the engine's `IdMap` and decision trace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Raw numeric object ID as used by TCMS.
pub type ObjectId = i64;

/// ID of an object in the TCMS the container was exported from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub ObjectId);

/// ID of an object in the destination TCMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(pub ObjectId);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// TCMS object classes handled by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TcmsClass {
    Product,
    Classification,
    Version,
    Build,
    Category,
    Component,
    PlanType,
    Priority,
    CaseStatus,
    ExecutionStatus,
    User,
    TestPlan,
    TestCase,
    TestRun,
    TestExecution,
    Environment,
}

impl TcmsClass {
    pub fn name(self) -> &'static str {
        match self {
            TcmsClass::Product => "Product",
            TcmsClass::Classification => "Classification",
            TcmsClass::Version => "Version",
            TcmsClass::Build => "Build",
            TcmsClass::Category => "Category",
            TcmsClass::Component => "Component",
            TcmsClass::PlanType => "PlanType",
            TcmsClass::Priority => "Priority",
            TcmsClass::CaseStatus => "TestCaseStatus",
            TcmsClass::ExecutionStatus => "TestExecutionStatus",
            TcmsClass::User => "User",
            TcmsClass::TestPlan => "TestPlan",
            TcmsClass::TestCase => "TestCase",
            TcmsClass::TestRun => "TestRun",
            TcmsClass::TestExecution => "TestExecution",
            TcmsClass::Environment => "Environment",
        }
    }

    /// Only plans, cases and runs can hold attachments in TCMS.
    pub fn supports_attachments(self) -> bool {
        matches!(
            self,
            TcmsClass::TestPlan | TcmsClass::TestCase | TcmsClass::TestRun
        )
    }

    /// Subdirectory below `attachments/` holding files for objects of this class.
    pub fn attachment_dir(self) -> &'static str {
        match self {
            TcmsClass::TestPlan => "plan",
            TcmsClass::TestCase => "case",
            TcmsClass::TestRun => "run",
            TcmsClass::TestExecution => "execution",
            _ => "entity",
        }
    }
}

impl fmt::Display for TcmsClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Human-meaningful attribute tuple used to match objects across TCMS instances.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey(pub Vec<String>);

impl NaturalKey {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        Self(parts.into_iter().map(|p| p.to_string()).collect())
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Product {
    pub id: SourceId,
    pub name: String,
    pub classification: SourceId,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Classification {
    pub id: SourceId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Version {
    pub id: SourceId,
    pub value: String,
    pub product: SourceId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Build {
    pub id: SourceId,
    pub name: String,
    pub version: SourceId,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Category {
    pub id: SourceId,
    pub name: String,
    pub product: SourceId,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Component {
    pub id: SourceId,
    pub name: String,
    pub product: SourceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_owner: Option<SourceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_qa_contact: Option<SourceId>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PlanType {
    pub id: SourceId,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Priority {
    pub id: SourceId,
    pub value: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CaseStatus {
    pub id: SourceId,
    pub name: String,
    #[serde(default)]
    pub is_confirmed: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExecutionStatus {
    pub id: SourceId,
    pub name: String,
    /// Higher is more favorable; negative weights denote failure-class statuses.
    #[serde(default)]
    pub weight: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub icon: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct User {
    pub id: SourceId,
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub first_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

/// Reference tables shipped with a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct MasterData {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub classifications: Vec<Classification>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub versions: Vec<Version>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub builds: Vec<Build>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<Category>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<Component>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plan_types: Vec<PlanType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub priorities: Vec<Priority>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub case_statuses: Vec<CaseStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub execution_statuses: Vec<ExecutionStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<User>,
}

impl MasterData {
    pub fn is_empty(&self) -> bool {
        self.classifications.is_empty()
            && self.versions.is_empty()
            && self.builds.is_empty()
            && self.categories.is_empty()
            && self.components.is_empty()
            && self.plan_types.is_empty()
            && self.priorities.is_empty()
            && self.case_statuses.is_empty()
            && self.execution_statuses.is_empty()
            && self.users.is_empty()
    }

    pub fn object_count(&self) -> usize {
        self.classifications.len()
            + self.versions.len()
            + self.builds.len()
            + self.categories.len()
            + self.components.len()
            + self.plan_types.len()
            + self.priorities.len()
            + self.case_statuses.len()
            + self.execution_statuses.len()
            + self.users.len()
    }
}

/// Name/value property attached to a plan or case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestPlan {
    pub id: SourceId,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    pub product: SourceId,
    pub product_version: SourceId,
    #[serde(rename = "type")]
    pub plan_type: SourceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<SourceId>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<SourceId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cases: Vec<SourceId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<Property>,
    /// Operating systems the plan may run on (empty = any)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub os: Vec<String>,
    /// CPU architectures the plan may run on (empty = any)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arch: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestCase {
    pub id: SourceId,
    pub summary: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    pub category: SourceId,
    pub priority: SourceId,
    pub case_status: SourceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<SourceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_tester: Option<SourceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer: Option<SourceId>,
    #[serde(default)]
    pub is_automated: bool,
    /// Executable identifier, e.g. `script:tests/login.sh` or `unittest:auth`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub script: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub arguments: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub requirement: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<SourceId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<Property>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub os: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arch: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestRun {
    pub id: SourceId,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    pub plan: SourceId,
    pub build: SourceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager: Option<SourceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_tester: Option<SourceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TestExecution {
    pub id: SourceId,
    pub run: SourceId,
    pub case: SourceId,
    pub build: SourceId,
    pub status: SourceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<SourceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tested_by: Option<SourceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
}

/// Environment property value: a single value or an explicit list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Scalar(String),
    List(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvProperty {
    pub name: String,
    pub value: PropertyValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Environment {
    pub id: SourceId,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<EnvProperty>,
}

impl Environment {
    /// Properties with repeated names folded into lists, in first-seen order.
    pub fn folded_properties(&self) -> Vec<EnvProperty> {
        let mut folded: Vec<EnvProperty> = Vec::new();
        for prop in &self.properties {
            match folded.iter_mut().find(|p| p.name == prop.name) {
                None => folded.push(prop.clone()),
                Some(existing) => {
                    let mut values = match &existing.value {
                        PropertyValue::Scalar(v) => vec![v.clone()],
                        PropertyValue::List(vs) => vs.clone(),
                    };
                    match &prop.value {
                        PropertyValue::Scalar(v) => values.push(v.clone()),
                        PropertyValue::List(vs) => values.extend(vs.iter().cloned()),
                    }
                    existing.value = PropertyValue::List(values);
                }
            }
        }
        folded
    }
}
