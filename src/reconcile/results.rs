//! Storage of runner results as TestRuns and TestExecutions.

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{Engine, ImportReport, Intent};
use crate::apply::ApplyPort;
use crate::entity::{NaturalKey, ObjectId, TargetId, TcmsClass};
use crate::error::{SyncError, SyncResult};
use crate::gateway::{Fields, Filter, GatewayError, TcmsGateway};
use crate::reconcile::attachments::matches_any;
use crate::runner::result::{ExecutionResult, PlanRecord, RunReport};
use crate::trace::{Action, Decision};

/// Find the build named `build_name` under the version of plan `plan_id`.
pub fn resolve_build(gateway: &dyn TcmsGateway, plan_id: ObjectId, build_name: &str) -> SyncResult<TargetId> {
    let plan = gateway.get(TcmsClass::TestPlan, plan_id).map_err(|e| match e {
        GatewayError::NotFound { .. } => SyncError::Missing {
            class: TcmsClass::TestPlan,
            key: plan_id.to_string(),
        },
        other => other.into(),
    })?;
    let mut filter = Filter::new().eq("name", build_name);
    if let Some(version) = plan.id_field("product-version") {
        filter = filter.eq("version", version);
    }
    match gateway.find(TcmsClass::Build, &filter)?.as_slice() {
        [] => Err(SyncError::Missing {
            class: TcmsClass::Build,
            key: build_name.to_string(),
        }),
        [one] => Ok(TargetId(one.id)),
        many => Err(SyncError::AmbiguousMatch {
            class: TcmsClass::Build,
            key: build_name.to_string(),
            count: many.len(),
        }),
    }
}

fn timestamp(t: DateTime<Utc>) -> Value {
    Value::from(t.to_rfc3339())
}

/// Per-cell comment lines of a merged execution.
fn merged_comment(cells: &[&ExecutionResult]) -> String {
    if let [single] = cells
        && single.matrix_code.is_empty()
    {
        return single.detail.clone();
    }
    cells
        .iter()
        .map(|c| {
            let mut line = format!("[{}] {}", c.matrix_code, c.status);
            if !c.detail.is_empty() {
                line.push_str(": ");
                line.push_str(&c.detail);
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

impl<'a, P: ApplyPort> Engine<'a, P> {
    /// Write runner results to TCMS against `build`.
    ///
    /// Runs are matched by (plan, build) and executions by (run, case);
    /// existing ones are updated unless the policy says skip, missing ones
    /// are created. Matrix cells of one case are merged into one execution.
    pub fn store_results(mut self, build: TargetId, report: &RunReport) -> ImportReport {
        self.intent = Intent::ImportResult;
        let abort = self.store(build, report).err();
        self.finish(abort)
    }

    fn store(&mut self, build: TargetId, report: &RunReport) -> SyncResult<()> {
        let mut plan_ids: Vec<ObjectId> = Vec::new();
        for id in report
            .results
            .iter()
            .map(|r| r.plan_id)
            .chain(report.plans.iter().map(|p| p.plan_id))
        {
            if !plan_ids.contains(&id) {
                plan_ids.push(id);
            }
        }

        for plan_id in plan_ids {
            let results: Vec<&ExecutionResult> =
                report.results.iter().filter(|r| r.plan_id == plan_id).collect();
            let record = report.plans.iter().find(|p| p.plan_id == plan_id);
            let plan_name = record
                .map(|p| p.plan_name.clone())
                .or_else(|| results.first().map(|r| r.plan_name.clone()))
                .unwrap_or_default();

            let mut case_ids: Vec<ObjectId> = Vec::new();
            for id in results.iter().filter_map(|r| r.case_id) {
                if !case_ids.contains(&id) {
                    case_ids.push(id);
                }
            }

            let Some(run) = self.store_run(plan_id, &plan_name, build, record, &results) else {
                for case_id in case_ids {
                    let key = NaturalKey::new([plan_name.clone(), case_id.to_string()]);
                    let err = SyncError::Unresolved {
                        class: TcmsClass::TestExecution,
                        key: key.to_string(),
                        ref_class: TcmsClass::TestRun,
                        ref_id: plan_id,
                    };
                    self.fail(TcmsClass::TestExecution, key, None, err);
                }
                continue;
            };

            for case_id in case_ids {
                let cells: Vec<&ExecutionResult> = results
                    .iter()
                    .copied()
                    .filter(|r| r.case_id == Some(case_id))
                    .collect();
                self.store_execution(run, build, &plan_name, case_id, &cells)?;
            }
        }
        Ok(())
    }

    fn store_run(
        &mut self,
        plan_id: ObjectId,
        plan_name: &str,
        build: TargetId,
        record: Option<&PlanRecord>,
        results: &[&ExecutionResult],
    ) -> Option<TargetId> {
        let class = TcmsClass::TestRun;
        let key = NaturalKey::new([plan_name.to_string(), build.to_string()]);

        let prepared = (|| -> SyncResult<(Fields, Fields, Filter)> {
            let plan = self.gateway.get(TcmsClass::TestPlan, plan_id).map_err(|e| match e {
                GatewayError::NotFound { .. } => SyncError::Missing {
                    class: TcmsClass::TestPlan,
                    key: plan_name.to_string(),
                },
                other => other.into(),
            })?;
            let actual = plan.str_field("name").unwrap_or_default();
            if actual != plan_name {
                return Err(SyncError::OwnerMismatch {
                    class,
                    name: plan_name.to_string(),
                    owner_class: TcmsClass::TestPlan,
                    expected: plan_name.to_string(),
                    actual: actual.to_string(),
                });
            }

            let start = results
                .iter()
                .map(|r| r.start_time)
                .chain(record.map(|p| p.start_time))
                .min();
            let stop = results
                .iter()
                .map(|r| r.stop_time)
                .chain(record.map(|p| p.stop_time))
                .max();
            let notes = record.map(run_notes).unwrap_or_default();

            let mut update = Fields::new();
            if let Some(start) = start {
                update.insert("start-date".to_string(), timestamp(start));
            }
            if let Some(stop) = stop {
                update.insert("stop-date".to_string(), timestamp(stop));
            }
            if !notes.is_empty() {
                update.insert("notes".to_string(), Value::from(notes));
            }

            let (manager, _) = self.users.current_user()?;
            let mut create = update.clone();
            create.insert("summary".to_string(), Value::from(plan_name));
            create.insert("plan".to_string(), Value::from(plan_id));
            create.insert("build".to_string(), Value::from(build.0));
            create.insert("manager".to_string(), Value::from(manager.0));

            let lookup = Filter::new().eq("plan", plan_id).eq("build", build.0);
            Ok((create, update, lookup))
        })();

        let (create, update, lookup) = match prepared {
            Ok(p) => p,
            Err(err) => {
                self.fail(class, key, None, err);
                return None;
            }
        };
        let candidates = self.gateway.find(class, &lookup).map_err(SyncError::from);
        self.settle_or_fail(class, key, None, candidates, &create, Some(&update))
            .map(|(target, _)| target)
    }

    fn store_execution(
        &mut self,
        run: TargetId,
        build: TargetId,
        plan_name: &str,
        case_id: ObjectId,
        cells: &[&ExecutionResult],
    ) -> SyncResult<()> {
        let class = TcmsClass::TestExecution;
        let recorded_summary = cells.iter().find_map(|c| c.case_summary.clone());
        let key = NaturalKey::new([
            plan_name.to_string(),
            build.to_string(),
            recorded_summary.clone().unwrap_or_else(|| case_id.to_string()),
        ]);

        let ran: Vec<&ExecutionResult> = cells
            .iter()
            .copied()
            .filter(|c| !c.status.is_skipped())
            .collect();
        let Some(status) = self
            .options
            .status_weights
            .least_favorable(ran.iter().map(|c| c.status))
        else {
            self.trace
                .push(Decision::new(class, key, None, None, Action::Skipped));
            return Ok(());
        };

        let prepared = (|| -> SyncResult<(Fields, Fields, Filter)> {
            let case = self.gateway.get(TcmsClass::TestCase, case_id).map_err(|e| match e {
                GatewayError::NotFound { .. } => SyncError::Missing {
                    class: TcmsClass::TestCase,
                    key: key.to_string(),
                },
                other => other.into(),
            })?;
            let actual = case.str_field("summary").unwrap_or_default();
            if let Some(expected) = &recorded_summary
                && expected != actual
            {
                return Err(SyncError::OwnerMismatch {
                    class,
                    name: expected.clone(),
                    owner_class: TcmsClass::TestCase,
                    expected: expected.clone(),
                    actual: actual.to_string(),
                });
            }

            let state = self.options.execution_state(status.state_name()).to_string();
            let status_id = self
                .gateway
                .find(TcmsClass::ExecutionStatus, &Filter::new().eq("name", state.as_str()))?
                .first()
                .map(|s| s.id)
                .ok_or(SyncError::Missing {
                    class: TcmsClass::ExecutionStatus,
                    key: state,
                })?;

            let tester = match ran.iter().find(|c| !c.tester.is_empty()) {
                Some(c) => self.user_by_name(&c.tester)?,
                None => self.users.current_user()?.0,
            };
            let start = ran.iter().map(|c| c.start_time).min().unwrap_or_else(Utc::now);
            let stop = ran.iter().map(|c| c.stop_time).max().unwrap_or(start);
            let duration: i64 = ran.iter().map(|c| c.duration().num_seconds()).sum();

            let mut update = Fields::new();
            update.insert("status".to_string(), Value::from(status_id));
            update.insert("tested-by".to_string(), Value::from(tester.0));
            update.insert("start-date".to_string(), timestamp(start));
            update.insert("stop-date".to_string(), timestamp(stop));
            update.insert("actual-duration".to_string(), Value::from(duration));
            update.insert("comment".to_string(), Value::from(merged_comment(cells)));

            let mut create = update.clone();
            create.insert("run".to_string(), Value::from(run.0));
            create.insert("case".to_string(), Value::from(case_id));
            create.insert("build".to_string(), Value::from(build.0));
            create.insert("assignee".to_string(), Value::from(tester.0));

            let lookup = Filter::new().eq("run", run.0).eq("case", case_id);
            Ok((create, update, lookup))
        })();

        let (create, update, lookup) = match prepared {
            Ok(p) => p,
            Err(err) => {
                self.fail(class, key, None, err);
                return Ok(());
            }
        };
        let candidates = self.gateway.find(class, &lookup).map_err(SyncError::from);
        let Some((execution, action)) =
            self.settle_or_fail(class, key, None, candidates, &create, Some(&update))
        else {
            return Ok(());
        };

        if matches!(action, Action::Created | Action::Updated) {
            let patterns = &self.options.result_attachments;
            let files: Vec<_> = cells
                .iter()
                .filter_map(|c| c.output_file.clone())
                .filter(|f| {
                    f.file_name()
                        .is_some_and(|n| matches_any(patterns, &n.to_string_lossy()))
                })
                .collect();
            for file in files {
                self.upload_result_file(run, execution, &file)?;
            }
        }
        Ok(())
    }
}

/// Runner report rebuilt from a `plan-result` container.
/// TestRun notes for a plan record: the aggregated result and the counts.
pub fn run_notes(record: &PlanRecord) -> String {
    let counts = format!(
        "passed: {}, failed: {}, skipped: {}",
        record.passed, record.failed, record.skipped
    );
    match &record.summary {
        Some(summary) => format!("Result: {}\n{}", summary, counts),
        None => counts,
    }
}

pub fn report_from_records(plans: &[PlanRecord], results: &[ExecutionResult]) -> RunReport {
    RunReport {
        results: results.to_vec(),
        plans: plans.to_vec(),
    }
}
