//! Status weights and plan-level aggregation.

use std::collections::BTreeMap;

use crate::entity::ObjectId;
use crate::runner::result::{ExecutionResult, ResultStatus};

/// Weight per execution-state name. Higher is more favorable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusWeights(BTreeMap<String, i32>);

impl Default for StatusWeights {
    fn default() -> Self {
        Self(
            [
                ("PASSED", 20),
                ("FAILED", -30),
                ("ERROR", -20),
                ("BLOCKED", -10),
                ("IDLE", 0),
                ("RUNNING", 0),
                ("PAUSED", 0),
                ("WAIVED", 30),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
        )
    }
}

impl StatusWeights {
    /// Defaults overlaid with configured weights.
    pub fn with_overrides(overrides: &BTreeMap<String, i32>) -> Self {
        let mut weights = Self::default();
        for (name, weight) in overrides {
            weights.0.insert(name.to_ascii_uppercase(), *weight);
        }
        weights
    }

    pub fn weight_of(&self, state: &str) -> i32 {
        self.0.get(state).copied().unwrap_or(0)
    }

    pub fn weight(&self, status: ResultStatus) -> i32 {
        self.weight_of(status.state_name())
    }

    /// Least favorable non-skipped status; first one wins on ties.
    pub fn least_favorable<I>(&self, statuses: I) -> Option<ResultStatus>
    where
        I: IntoIterator<Item = ResultStatus>,
    {
        statuses
            .into_iter()
            .filter(|s| !s.is_skipped())
            .fold(None, |worst: Option<ResultStatus>, s| match worst {
                Some(w) if self.weight(w) <= self.weight(s) => Some(w),
                _ => Some(s),
            })
    }

    /// Status of a plan from its case results.
    ///
    /// `descendants` lists child plan IDs (depth-first) whose results count
    /// too; pass an empty slice to aggregate the plan alone.
    pub fn aggregate_plan(
        &self,
        results: &[ExecutionResult],
        plan_id: ObjectId,
        descendants: &[ObjectId],
    ) -> Option<ResultStatus> {
        self.least_favorable(
            results
                .iter()
                .filter(|r| r.plan_id == plan_id || descendants.contains(&r.plan_id))
                .map(|r| r.status),
        )
    }
}
