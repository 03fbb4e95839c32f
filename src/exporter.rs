//! Export TCMS objects into an entity container.
//!
//! A plan export carries the plan (and, on request, its descendants), every
//! case the plans link, the product with all of its master data, and the
//! users those objects reference. Stored objects use the container's field
//! names, so conversion is a serde round-trip with the object ID put back.

use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::container::{Container, EntityType};
use crate::entity::{
    Build, CaseStatus, Category, Classification, Component, Environment, ExecutionStatus,
    MasterData, ObjectId, PlanType, Priority, Product, SourceId, TcmsClass, TestCase, TestPlan,
    User, Version,
};
use crate::error::{SyncError, SyncResult};
use crate::gateway::{Filter, TcmsGateway, TcmsObject};
use crate::reconcile::attachments::download_attachments;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportTarget {
    Plan(ObjectId),
    Case(ObjectId),
    Product(ObjectId),
}

#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    pub descendants: bool,
    pub include_attachments: bool,
    pub include_environments: bool,
    /// Attachment names to download; every file when empty
    pub attachment_patterns: Vec<Regex>,
}

impl ExportOptions {
    pub fn from_config(config: &Config) -> SyncResult<Self> {
        Ok(Self {
            attachment_patterns: Config::compile_patterns(&config.tcms.spec_attachments)?,
            ..Self::default()
        })
    }
}

/// Convert a stored object into its typed entity.
pub fn typed<T: DeserializeOwned>(class: TcmsClass, object: &TcmsObject) -> SyncResult<T> {
    let mut fields = object.fields.clone();
    fields.insert("id".to_string(), Value::from(object.id));
    fields.remove("attachments");
    serde_json::from_value(Value::Object(fields)).map_err(|e| {
        SyncError::Container(format!("{} {} cannot be exported: {}", class, object.id, e))
    })
}

pub struct Exporter<'a> {
    gateway: &'a dyn TcmsGateway,
    options: ExportOptions,
}

impl<'a> Exporter<'a> {
    pub fn new(gateway: &'a dyn TcmsGateway, options: ExportOptions) -> Self {
        Self { gateway, options }
    }

    fn fetch<T: DeserializeOwned>(&self, class: TcmsClass, id: ObjectId) -> SyncResult<T> {
        typed(class, &self.gateway.get(class, id)?)
    }

    fn find<T: DeserializeOwned>(&self, class: TcmsClass, filter: &Filter) -> SyncResult<Vec<T>> {
        self.gateway
            .find(class, filter)?
            .iter()
            .map(|o| typed(class, o))
            .collect()
    }

    /// Build a container for `target`. With `dest_dir`, attachments are
    /// downloaded below it and the container's base directory points there.
    pub fn export(&self, target: ExportTarget, dest_dir: Option<&Path>) -> SyncResult<Container> {
        let (entity_type, product_id, mut plans, mut cases) = match target {
            ExportTarget::Plan(id) => {
                let plans = self.plan_tree(id)?;
                let cases = self.linked_cases(&plans)?;
                let product = plans.first().map(|p| p.product.0).unwrap_or_default();
                (EntityType::TestPlan, product, plans, cases)
            }
            ExportTarget::Case(id) => {
                let case: TestCase = self.fetch(TcmsClass::TestCase, id)?;
                let category: Category = self.fetch(TcmsClass::Category, case.category.0)?;
                (EntityType::TestCase, category.product.0, Vec::new(), vec![case])
            }
            ExportTarget::Product(id) => {
                let plans: Vec<TestPlan> =
                    self.find(TcmsClass::TestPlan, &Filter::new().eq("product", id))?;
                let mut cases = Vec::new();
                let categories: Vec<Category> =
                    self.find(TcmsClass::Category, &Filter::new().eq("product", id))?;
                for category in &categories {
                    let found: Vec<TestCase> = self.find(
                        TcmsClass::TestCase,
                        &Filter::new().eq("category", category.id.0),
                    )?;
                    cases.extend(found);
                }
                (EntityType::Product, id, plans, cases)
            }
        };

        let product: Product = self.fetch(TcmsClass::Product, product_id)?;
        let entity_name = match target {
            ExportTarget::Plan(_) => plans.first().map(|p| p.name.clone()).unwrap_or_default(),
            ExportTarget::Case(_) => cases.first().map(|c| c.summary.clone()).unwrap_or_default(),
            ExportTarget::Product(_) => product.name.clone(),
        };
        let entity_id = match target {
            ExportTarget::Plan(id) | ExportTarget::Case(id) | ExportTarget::Product(id) => id,
        };

        // parents outside the export are cut off
        let exported: BTreeSet<SourceId> = plans.iter().map(|p| p.id).collect();
        for plan in &mut plans {
            if plan.parent.is_some_and(|parent| !exported.contains(&parent)) {
                plan.parent = None;
            }
        }

        let master_data = self.master_data(&product, &plans, &cases)?;

        let mut container = Container::new(entity_type, entity_id, &entity_name);
        if let Some(dir) = dest_dir {
            container.base_dir = dir.to_path_buf();
        }
        if self.options.include_attachments
            && let Some(dir) = dest_dir
        {
            for plan in &mut plans {
                plan.attachments = self.download(TcmsClass::TestPlan, plan.id, dir)?;
            }
            for case in &mut cases {
                case.attachments = self.download(TcmsClass::TestCase, case.id, dir)?;
            }
        }
        if self.options.include_environments {
            container.entities.environments =
                self.find::<Environment>(TcmsClass::Environment, &Filter::new())?;
        }

        tracing::info!(
            ?target,
            plans = plans.len(),
            cases = cases.len(),
            master_data = master_data.object_count(),
            "export collected"
        );
        container.entities.master_data = master_data;
        container.entities.products = vec![product];
        container.entities.test_plans = plans;
        container.entities.test_cases = cases;
        Ok(container)
    }

    /// The plan followed, on request, by all of its descendants.
    fn plan_tree(&self, root: ObjectId) -> SyncResult<Vec<TestPlan>> {
        let mut plans = vec![self.fetch::<TestPlan>(TcmsClass::TestPlan, root)?];
        if !self.options.descendants {
            return Ok(plans);
        }
        let mut seen = BTreeSet::from([root]);
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let children: Vec<TestPlan> =
                self.find(TcmsClass::TestPlan, &Filter::new().eq("parent", id))?;
            for child in children.into_iter().rev() {
                if seen.insert(child.id.0) {
                    stack.push(child.id.0);
                    plans.push(child);
                }
            }
        }
        Ok(plans)
    }

    fn linked_cases(&self, plans: &[TestPlan]) -> SyncResult<Vec<TestCase>> {
        let mut seen = BTreeSet::new();
        let mut cases = Vec::new();
        for id in plans.iter().flat_map(|p| p.cases.iter()) {
            if seen.insert(*id) {
                cases.push(self.fetch(TcmsClass::TestCase, id.0)?);
            }
        }
        Ok(cases)
    }

    fn master_data(
        &self,
        product: &Product,
        plans: &[TestPlan],
        cases: &[TestCase],
    ) -> SyncResult<MasterData> {
        let by_product = Filter::new().eq("product", product.id.0);
        let mut md = MasterData {
            classifications: vec![
                self.fetch::<Classification>(TcmsClass::Classification, product.classification.0)?,
            ],
            versions: self.find::<Version>(TcmsClass::Version, &by_product)?,
            categories: self.find::<Category>(TcmsClass::Category, &by_product)?,
            components: self.find::<Component>(TcmsClass::Component, &by_product)?,
            execution_statuses: self.find::<ExecutionStatus>(TcmsClass::ExecutionStatus, &Filter::new())?,
            ..MasterData::default()
        };
        for version in &md.versions {
            let builds: Vec<Build> =
                self.find(TcmsClass::Build, &Filter::new().eq("version", version.id.0))?;
            md.builds.extend(builds);
        }

        for id in plans.iter().map(|p| p.plan_type).collect::<BTreeSet<_>>() {
            md.plan_types.push(self.fetch::<PlanType>(TcmsClass::PlanType, id.0)?);
        }
        for id in cases.iter().map(|c| c.priority).collect::<BTreeSet<_>>() {
            md.priorities.push(self.fetch::<Priority>(TcmsClass::Priority, id.0)?);
        }
        for id in cases.iter().map(|c| c.case_status).collect::<BTreeSet<_>>() {
            md.case_statuses.push(self.fetch::<CaseStatus>(TcmsClass::CaseStatus, id.0)?);
        }

        let users = plans
            .iter()
            .flat_map(|p| [p.author])
            .chain(cases.iter().flat_map(|c| [c.author, c.default_tester, c.reviewer]))
            .chain(
                md.components
                    .iter()
                    .flat_map(|c| [c.initial_owner, c.initial_qa_contact]),
            )
            .flatten()
            .collect::<BTreeSet<SourceId>>();
        for id in users {
            md.users.push(self.fetch::<User>(TcmsClass::User, id.0)?);
        }
        Ok(md)
    }

    fn download(&self, class: TcmsClass, id: SourceId, dir: &Path) -> SyncResult<Vec<String>> {
        let patterns = if self.options.attachment_patterns.is_empty() {
            vec![Regex::new(".*").map_err(|e| SyncError::Configuration(e.to_string()))?]
        } else {
            self.options.attachment_patterns.clone()
        };
        let written: Vec<PathBuf> = download_attachments(self.gateway, class, id.0, &patterns, dir)?;
        Ok(written
            .iter()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect())
    }
}
