//! Decision trace produced by a reconciliation pass.
//!
//! A [`Decision`] is pushed once per object and never mutated afterwards.
//! The trace is identical for simulated and live passes except for the IDs
//! of created objects; [`Trace::parity_view`] blanks those.

use serde::Serialize;

use crate::entity::{NaturalKey, SourceId, TargetId, TcmsClass};
use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "action", content = "detail")]
pub enum Action {
    /// Same object exists in the target under the same ID.
    Matched,
    /// Same object exists in the target under a different ID.
    Remapped,
    Created,
    /// Existing object left as is.
    Skipped,
    Updated,
    /// User reference replaced by the current user.
    Substituted,
    Failed(#[serde(serialize_with = "serialize_error")] SyncError),
}

fn serialize_error<S: serde::Serializer>(err: &SyncError, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&err.to_string())
}

impl Action {
    pub fn is_failure(&self) -> bool {
        matches!(self, Action::Failed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Action::Matched => "matched",
            Action::Remapped => "remapped",
            Action::Created => "created",
            Action::Skipped => "skipped",
            Action::Updated => "updated",
            Action::Substituted => "substituted",
            Action::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Decision {
    pub class: TcmsClass,
    pub key: NaturalKey,
    pub source: Option<SourceId>,
    pub target: Option<TargetId>,
    #[serde(flatten)]
    pub action: Action,
}

impl Decision {
    pub fn new(
        class: TcmsClass,
        key: NaturalKey,
        source: Option<SourceId>,
        target: Option<TargetId>,
        action: Action,
    ) -> Self {
        Self {
            class,
            key,
            source,
            target,
            action,
        }
    }

    pub fn failed(class: TcmsClass, key: NaturalKey, source: Option<SourceId>, err: SyncError) -> Self {
        Self::new(class, key, source, None, Action::Failed(err))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Trace {
    decisions: Vec<Decision>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, decision: Decision) {
        tracing::debug!(
            class = %decision.class,
            key = %decision.key,
            action = decision.action.label(),
            "decision"
        );
        self.decisions.push(decision);
    }

    pub fn decisions(&self) -> &[Decision] {
        &self.decisions
    }

    pub fn len(&self) -> usize {
        self.decisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }

    pub fn failures(&self) -> impl Iterator<Item = &Decision> {
        self.decisions.iter().filter(|d| d.action.is_failure())
    }

    pub fn for_class(&self, class: TcmsClass) -> impl Iterator<Item = &Decision> {
        self.decisions.iter().filter(move |d| d.class == class)
    }

    /// Copy of the trace with target IDs of created objects removed.
    ///
    /// Simulated and live passes produce equal parity views.
    pub fn parity_view(&self) -> Trace {
        Trace {
            decisions: self
                .decisions
                .iter()
                .map(|d| {
                    let mut d = d.clone();
                    if d.action == Action::Created {
                        d.target = None;
                    }
                    d
                })
                .collect(),
        }
    }
}

/// Per-action counters over a trace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub matched: usize,
    pub remapped: usize,
    pub created: usize,
    pub skipped: usize,
    pub updated: usize,
    pub substituted: usize,
    pub failed: usize,
}

impl Summary {
    pub fn of(trace: &Trace) -> Self {
        let mut s = Summary::default();
        for d in trace.decisions() {
            match d.action {
                Action::Matched => s.matched += 1,
                Action::Remapped => s.remapped += 1,
                Action::Created => s.created += 1,
                Action::Skipped => s.skipped += 1,
                Action::Updated => s.updated += 1,
                Action::Substituted => s.substituted += 1,
                Action::Failed(_) => s.failed += 1,
            }
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created(id: i64) -> Decision {
        Decision::new(
            TcmsClass::Build,
            NaturalKey::new(["b1", "55"]),
            Some(SourceId(7)),
            Some(TargetId(id)),
            Action::Created,
        )
    }

    #[test]
    fn test_parity_view_blanks_created_ids_only() {
        let mut live = Trace::new();
        live.push(created(101));
        live.push(Decision::new(
            TcmsClass::Version,
            NaturalKey::new(["1.0"]),
            Some(SourceId(102)),
            Some(TargetId(55)),
            Action::Remapped,
        ));

        let mut simulated = Trace::new();
        simulated.push(created(-1));
        simulated.push(Decision::new(
            TcmsClass::Version,
            NaturalKey::new(["1.0"]),
            Some(SourceId(102)),
            Some(TargetId(55)),
            Action::Remapped,
        ));

        assert_ne!(live, simulated);
        assert_eq!(live.parity_view(), simulated.parity_view());
        assert_eq!(
            live.parity_view().decisions()[1].target,
            Some(TargetId(55))
        );
    }

    #[test]
    fn test_summary_counts() {
        let mut t = Trace::new();
        t.push(created(1));
        t.push(created(2));
        t.push(Decision::failed(
            TcmsClass::TestCase,
            NaturalKey::new(["c"]),
            None,
            SyncError::Gateway("x".to_string()),
        ));
        let s = Summary::of(&t);
        assert_eq!(s.created, 2);
        assert_eq!(s.failed, 1);
        assert_eq!(t.failures().count(), 1);
    }
}
