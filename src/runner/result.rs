//! Result records produced by the runner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::entity::ObjectId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    PlanNotActive,
    CaseNotAutomated,
    NotForLocalOs,
    NotForLocalArch,
    Aborted,
    DryRun,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::PlanNotActive => "test plan is not active",
            SkipReason::CaseNotAutomated => "test case is not automated",
            SkipReason::NotForLocalOs => "not suitable for local operating system",
            SkipReason::NotForLocalArch => "not suitable for local architecture",
            SkipReason::Aborted => "execution aborted",
            SkipReason::DryRun => "dry run",
        })
    }
}

/// Outcome of one case in one matrix cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind", content = "reason")]
pub enum ResultStatus {
    Passed,
    Failed,
    Error,
    Blocked,
    Skipped(SkipReason),
    AssistantFailed,
}

impl ResultStatus {
    /// TCMS execution-state name this status maps to.
    pub fn state_name(self) -> &'static str {
        match self {
            ResultStatus::Passed => "PASSED",
            ResultStatus::Failed => "FAILED",
            ResultStatus::Error | ResultStatus::AssistantFailed => "ERROR",
            ResultStatus::Blocked => "BLOCKED",
            ResultStatus::Skipped(_) => "IDLE",
        }
    }

    pub fn is_skipped(self) -> bool {
        matches!(self, ResultStatus::Skipped(_))
    }

    /// Failure-class outcomes counted against a run.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            ResultStatus::Failed | ResultStatus::Error | ResultStatus::AssistantFailed
        )
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultStatus::Skipped(reason) => write!(f, "SKIPPED ({})", reason),
            ResultStatus::AssistantFailed => f.write_str("ASSISTANT FAILED"),
            other => f.write_str(other.state_name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExecutionResult {
    pub plan_id: ObjectId,
    pub plan_name: String,
    /// `None` for plan- or entity-level results (assistant failures, plan skips).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_id: Option<ObjectId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_summary: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub matrix_code: String,
    pub status: ResultStatus,
    pub start_time: DateTime<Utc>,
    pub stop_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tester: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<PathBuf>,
}

impl ExecutionResult {
    pub fn duration(&self) -> chrono::Duration {
        self.stop_time - self.start_time
    }
}

/// Plan-level summary written to the TestRun on result storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PlanRecord {
    pub plan_id: ObjectId,
    pub plan_name: String,
    pub start_time: DateTime<Utc>,
    pub stop_time: DateTime<Utc>,
    /// Aggregated status, absent when every case was skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<ResultStatus>,
    /// Result counts of this plan's own cases, descendants excluded.
    #[serde(default)]
    pub passed: usize,
    #[serde(default)]
    pub failed: usize,
    #[serde(default)]
    pub skipped: usize,
}

/// Everything one runner invocation produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub results: Vec<ExecutionResult>,
    pub plans: Vec<PlanRecord>,
}

impl RunReport {
    pub fn passed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.status == ResultStatus::Passed)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| r.status.is_failure()).count()
    }

    pub fn skipped(&self) -> usize {
        self.results.iter().filter(|r| r.status.is_skipped()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_reason_text() {
        assert_eq!(
            SkipReason::NotForLocalOs.to_string(),
            "not suitable for local operating system"
        );
        assert_eq!(
            ResultStatus::Skipped(SkipReason::DryRun).to_string(),
            "SKIPPED (dry run)"
        );
    }

    #[test]
    fn test_skipped_results_are_not_failures() {
        let now = Utc::now();
        let result = |status| ExecutionResult {
            plan_id: 1,
            plan_name: "p".to_string(),
            case_id: Some(2),
            case_summary: None,
            matrix_code: String::new(),
            status,
            start_time: now,
            stop_time: now,
            detail: String::new(),
            tester: String::new(),
            output_file: None,
        };
        let report = RunReport {
            results: vec![
                result(ResultStatus::Passed),
                result(ResultStatus::Failed),
                result(ResultStatus::Skipped(SkipReason::NotForLocalOs)),
            ],
            plans: Vec::new(),
        };
        assert_eq!((report.passed(), report.failed(), report.skipped()), (1, 1, 1));
    }
}
