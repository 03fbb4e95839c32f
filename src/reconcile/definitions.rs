//! Import of entity definitions from a container.

use serde_json::Value;
use std::collections::HashSet;

use super::{Engine, Intent, PendingUpload, payload};
use crate::apply::ApplyPort;
use crate::container::Container;
use crate::entity::{
    Environment, NaturalKey, ObjectId, SourceId, TargetId, TcmsClass, TestCase, TestExecution,
    TestPlan, TestRun,
};
use crate::error::{SyncError, SyncResult};
use crate::gateway::{Fields, Filter};
use crate::masterdata::MasterDataResolver;
use crate::reconcile::ImportReport;
use crate::trace::{Action, Decision};

/// Product a definition pass runs against.
struct Anchor {
    target: TargetId,
    name: String,
}

impl<'a, P: ApplyPort> Engine<'a, P> {
    /// Reconcile every definition in `container` against the target.
    ///
    /// Order: product, users, master data, environments, cases, plans
    /// (parents first), runs, executions, attachments.
    pub fn import_container(mut self, container: &Container) -> ImportReport {
        self.intent = Intent::ImportDefinition;
        let abort = self.import_definitions(container).err();
        self.finish(abort)
    }

    fn import_definitions(&mut self, container: &Container) -> SyncResult<()> {
        let (gateway, apply, options) = (self.gateway, self.apply, self.options);
        let entities = &container.entities;
        let product = container
            .product()
            .ok_or_else(|| SyncError::Container("container holds no product".to_string()))?;

        let mut resolver =
            MasterDataResolver::new(gateway, apply, &options.catalog, options.auto_create);
        let target = resolver.resolve_product(product, &mut self.ids, &mut self.trace)?;
        let anchor = Anchor {
            target,
            name: product.name.clone(),
        };

        self.users
            .resolve_all(&entities.master_data.users, &mut self.ids, &mut self.trace)?;
        resolver.resolve_all(&entities.master_data, &mut self.ids, &mut self.trace)?;

        if options.include_environments {
            for env in &entities.environments {
                self.import_environment(env);
            }
        }
        for case in &entities.test_cases {
            self.import_case(case, &anchor);
        }
        for plan in plans_parents_first(&entities.test_plans) {
            self.import_plan(container, plan, &anchor);
        }
        for run in &entities.test_runs {
            self.import_run(container, run);
        }
        for execution in &entities.test_executions {
            self.import_execution(container, execution);
        }
        self.flush_uploads(container)
    }

    fn queue_attachments(&mut self, class: TcmsClass, source: SourceId, target: TargetId, action: &Action, files: &[String]) {
        if self.options.include_attachments
            && !files.is_empty()
            && matches!(action, Action::Created | Action::Updated)
        {
            self.pending_uploads.push(PendingUpload {
                class,
                source,
                target,
                files: files.to_vec(),
            });
        }
    }

    fn import_environment(&mut self, env: &Environment) {
        let key = NaturalKey::new([env.name.as_str()]);
        let candidates = self
            .gateway
            .find(TcmsClass::Environment, &Filter::new().eq("name", env.name.as_str()))
            .map_err(SyncError::from);
        match payload(env, &[]) {
            Ok(create) => {
                self.settle_or_fail(TcmsClass::Environment, key, Some(env.id), candidates, &create, None);
            }
            Err(err) => self.fail(TcmsClass::Environment, key, Some(env.id), err),
        }
    }

    /// Product a target case belongs to, through its category.
    fn product_of_case(&self, case: &crate::gateway::TcmsObject) -> SyncResult<Option<ObjectId>> {
        let Some(category) = case.id_field("category") else {
            return Ok(None);
        };
        Ok(self
            .gateway
            .get(TcmsClass::Category, category)?
            .id_field("product"))
    }

    fn product_name(&self, id: Option<ObjectId>) -> String {
        id.and_then(|id| self.gateway.get(TcmsClass::Product, id).ok())
            .and_then(|p| p.str_field("name").map(str::to_string))
            .unwrap_or_default()
    }

    fn case_candidates(&self, case: &TestCase, anchor: &Anchor) -> SyncResult<Vec<crate::gateway::TcmsObject>> {
        let found = self
            .gateway
            .find(TcmsClass::TestCase, &Filter::new().eq("summary", case.summary.as_str()))?;
        let mut in_product = Vec::new();
        let mut foreign_same_id = None;
        for candidate in found {
            let product = self.product_of_case(&candidate)?;
            if product == Some(anchor.target.0) {
                in_product.push(candidate);
            } else if candidate.id == case.id.0 {
                foreign_same_id = Some(product);
            }
        }
        if in_product.is_empty()
            && let Some(actual) = foreign_same_id
        {
            return Err(SyncError::OwnerMismatch {
                class: TcmsClass::TestCase,
                name: case.summary.clone(),
                owner_class: TcmsClass::Product,
                expected: anchor.name.clone(),
                actual: self.product_name(actual),
            });
        }
        Ok(in_product)
    }

    fn import_case(&mut self, case: &TestCase, anchor: &Anchor) {
        let class = TcmsClass::TestCase;
        let key = NaturalKey::new([case.summary.as_str(), anchor.name.as_str()]);
        let owner = case.summary.as_str();

        let create = (|| -> SyncResult<Fields> {
            let ids = &self.ids;
            let mut fields = payload(
                case,
                &[
                    ("category", Some(ids.require(TcmsClass::Category, case.category, class, owner)?)),
                    ("priority", Some(ids.require(TcmsClass::Priority, case.priority, class, owner)?)),
                    (
                        "case-status",
                        Some(ids.require(TcmsClass::CaseStatus, case.case_status, class, owner)?),
                    ),
                    ("author", ids.require_opt(TcmsClass::User, case.author, class, owner)?),
                    (
                        "default-tester",
                        ids.require_opt(TcmsClass::User, case.default_tester, class, owner)?,
                    ),
                    ("reviewer", ids.require_opt(TcmsClass::User, case.reviewer, class, owner)?),
                ],
            )?;
            let components = case
                .components
                .iter()
                .map(|c| ids.require(TcmsClass::Component, *c, class, owner).map(|t| Value::from(t.0)))
                .collect::<SyncResult<Vec<_>>>()?;
            if !components.is_empty() {
                fields.insert("components".to_string(), Value::Array(components));
            }
            Ok(fields)
        })();

        let create = match create {
            Ok(fields) => fields,
            Err(err) => return self.fail(class, key, Some(case.id), err),
        };
        let candidates = self.case_candidates(case, anchor);
        if let Some((target, action)) =
            self.settle_or_fail(class, key, Some(case.id), candidates, &create, None)
        {
            self.queue_attachments(class, case.id, target, &action, &case.attachments);
        }
    }

    fn import_plan(&mut self, container: &Container, plan: &TestPlan, anchor: &Anchor) {
        let class = TcmsClass::TestPlan;
        let version = container
            .entities
            .master_data
            .versions
            .iter()
            .find(|v| v.id == plan.product_version)
            .map(|v| v.value.clone())
            .unwrap_or_default();
        let key = NaturalKey::new([plan.name.as_str(), anchor.name.as_str(), version.as_str()]);
        let owner = plan.name.as_str();

        let create = (|| -> SyncResult<Fields> {
            let ids = &self.ids;
            let version = ids.require(TcmsClass::Version, plan.product_version, class, owner)?;
            let mut fields = payload(
                plan,
                &[
                    ("product", Some(anchor.target)),
                    ("product-version", Some(version)),
                    ("type", Some(ids.require(TcmsClass::PlanType, plan.plan_type, class, owner)?)),
                    ("parent", ids.require_opt(class, plan.parent, class, owner)?),
                    ("author", ids.require_opt(TcmsClass::User, plan.author, class, owner)?),
                ],
            )?;
            let cases = plan
                .cases
                .iter()
                .map(|c| ids.require(TcmsClass::TestCase, *c, class, owner).map(|t| Value::from(t.0)))
                .collect::<SyncResult<Vec<_>>>()?;
            fields.insert("cases".to_string(), Value::Array(cases));
            Ok(fields)
        })();
        let create = match create {
            Ok(fields) => fields,
            Err(err) => return self.fail(class, key, Some(plan.id), err),
        };

        let lookup = Filter::new()
            .eq("name", plan.name.as_str())
            .eq("product", anchor.target.0)
            .eq("product-version", create.get("product-version").cloned().unwrap_or(Value::Null));

        let settled = (|| -> SyncResult<(TargetId, Action)> {
            let candidates = self.gateway.find(class, &lookup)?;
            match self.preexisting(class, candidates).as_slice() {
                [] => {
                    if let Ok(same_id) = self.gateway.get(class, plan.id.0)
                        && same_id.str_field("name") == Some(plan.name.as_str())
                        && same_id.id_field("product") != Some(anchor.target.0)
                    {
                        return Err(SyncError::OwnerMismatch {
                            class,
                            name: plan.name.clone(),
                            owner_class: TcmsClass::Product,
                            expected: anchor.name.clone(),
                            actual: self.product_name(same_id.id_field("product")),
                        });
                    }
                    Ok((self.create(class, &create)?, Action::Created))
                }
                [existing] => Ok((TargetId(existing.id), Action::Skipped)),
                many => Err(SyncError::AmbiguousMatch {
                    class,
                    key: key.to_string(),
                    count: many.len(),
                }),
            }
        })();

        match settled {
            Ok((target, action)) => {
                self.ids.insert(class, plan.id, target);
                self.trace.push(Decision::new(
                    class,
                    key,
                    Some(plan.id),
                    Some(target),
                    action.clone(),
                ));
                self.queue_attachments(class, plan.id, target, &action, &plan.attachments);
            }
            Err(err) => self.fail(class, key, Some(plan.id), err),
        }
    }

    fn import_run(&mut self, container: &Container, run: &TestRun) {
        let class = TcmsClass::TestRun;
        let key = run_key(container, run);
        let owner = run.summary.as_str();

        let prepared = (|| -> SyncResult<(Fields, Filter)> {
            let ids = &self.ids;
            let plan = ids.require(TcmsClass::TestPlan, run.plan, class, owner)?;
            let build = ids.require(TcmsClass::Build, run.build, class, owner)?;
            let fields = payload(
                run,
                &[
                    ("plan", Some(plan)),
                    ("build", Some(build)),
                    ("manager", ids.require_opt(TcmsClass::User, run.manager, class, owner)?),
                    (
                        "default-tester",
                        ids.require_opt(TcmsClass::User, run.default_tester, class, owner)?,
                    ),
                ],
            )?;
            let lookup = Filter::new().eq("plan", plan.0).eq("build", build.0);
            Ok((fields, lookup))
        })();
        let (create, lookup) = match prepared {
            Ok(p) => p,
            Err(err) => return self.fail(class, key, Some(run.id), err),
        };
        let candidates = self.gateway.find(class, &lookup).map_err(SyncError::from);
        if let Some((target, action)) =
            self.settle_or_fail(class, key, Some(run.id), candidates, &create, Some(&create))
        {
            self.queue_attachments(class, run.id, target, &action, &run.attachments);
        }
    }

    fn import_execution(&mut self, container: &Container, execution: &TestExecution) {
        let class = TcmsClass::TestExecution;
        let case_summary = container
            .case(execution.case)
            .map(|c| c.summary.clone())
            .unwrap_or_default();
        let run = container
            .entities
            .test_runs
            .iter()
            .find(|r| r.id == execution.run);
        let mut key_parts = run.map(|r| run_key(container, r).0).unwrap_or_default();
        key_parts.push(case_summary.clone());
        let key = NaturalKey(key_parts);
        let owner = case_summary.as_str();

        let prepared = (|| -> SyncResult<(Fields, Filter)> {
            let ids = &self.ids;
            let run = ids.require(TcmsClass::TestRun, execution.run, class, owner)?;
            let case = ids.require(TcmsClass::TestCase, execution.case, class, owner)?;
            let fields = payload(
                execution,
                &[
                    ("run", Some(run)),
                    ("case", Some(case)),
                    ("build", Some(ids.require(TcmsClass::Build, execution.build, class, owner)?)),
                    (
                        "status",
                        Some(ids.require(TcmsClass::ExecutionStatus, execution.status, class, owner)?),
                    ),
                    ("assignee", ids.require_opt(TcmsClass::User, execution.assignee, class, owner)?),
                    ("tested-by", ids.require_opt(TcmsClass::User, execution.tested_by, class, owner)?),
                ],
            )?;
            Ok((fields, Filter::new().eq("run", run.0).eq("case", case.0)))
        })();
        let (create, lookup) = match prepared {
            Ok(p) => p,
            Err(err) => return self.fail(class, key, Some(execution.id), err),
        };
        let candidates = self.gateway.find(class, &lookup).map_err(SyncError::from);
        if let Some((target, action)) =
            self.settle_or_fail(class, key, Some(execution.id), candidates, &create, Some(&create))
        {
            self.queue_attachments(class, execution.id, target, &action, &execution.attachments);
        }
    }
}

fn run_key(container: &Container, run: &TestRun) -> NaturalKey {
    let plan = container
        .plan(run.plan)
        .map(|p| p.name.clone())
        .unwrap_or_else(|| run.plan.to_string());
    let build = container
        .entities
        .master_data
        .builds
        .iter()
        .find(|b| b.id == run.build)
        .map(|b| b.name.clone())
        .unwrap_or_else(|| run.build.to_string());
    NaturalKey(vec![plan, build])
}

/// Plans ordered so that every parent precedes its children. Plans caught
/// in a parent cycle come last, in container order.
fn plans_parents_first(plans: &[TestPlan]) -> Vec<&TestPlan> {
    let in_container: HashSet<SourceId> = plans.iter().map(|p| p.id).collect();
    let mut placed: HashSet<SourceId> = HashSet::new();
    let mut ordered = Vec::with_capacity(plans.len());
    loop {
        let before = ordered.len();
        for plan in plans {
            if placed.contains(&plan.id) {
                continue;
            }
            let ready = match plan.parent {
                None => true,
                Some(parent) => !in_container.contains(&parent) || placed.contains(&parent),
            };
            if ready {
                placed.insert(plan.id);
                ordered.push(plan);
            }
        }
        if ordered.len() == plans.len() {
            break;
        }
        if ordered.len() == before {
            ordered.extend(plans.iter().filter(|p| !placed.contains(&p.id)));
            break;
        }
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(id: i64, parent: Option<i64>) -> TestPlan {
        TestPlan {
            id: SourceId(id),
            name: format!("plan-{}", id),
            text: String::new(),
            product: SourceId(1),
            product_version: SourceId(1),
            plan_type: SourceId(1),
            parent: parent.map(SourceId),
            is_active: true,
            author: None,
            tags: vec![],
            cases: vec![],
            properties: vec![],
            os: vec![],
            arch: vec![],
            attachments: vec![],
        }
    }

    #[test]
    fn test_parents_ordered_before_children() {
        let plans = vec![plan(3, Some(2)), plan(2, Some(1)), plan(1, None), plan(4, Some(99))];
        let order: Vec<i64> = plans_parents_first(&plans).iter().map(|p| p.id.0).collect();
        assert_eq!(order, vec![1, 4, 2, 3]);
    }

    #[test]
    fn test_parent_cycle_does_not_hang() {
        let plans = vec![plan(1, Some(2)), plan(2, Some(1))];
        assert_eq!(plans_parents_first(&plans).len(), 2);
    }
}
