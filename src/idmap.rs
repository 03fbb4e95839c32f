//! Source-to-target ID mapping, one table per object class.

use std::collections::HashMap;

use crate::entity::{SourceId, TargetId, TcmsClass};
use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdMap {
    tables: HashMap<TcmsClass, HashMap<SourceId, TargetId>>,
}

impl IdMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, class: TcmsClass, source: SourceId, target: TargetId) {
        self.tables.entry(class).or_default().insert(source, target);
    }

    pub fn get(&self, class: TcmsClass, source: SourceId) -> Option<TargetId> {
        self.tables.get(&class).and_then(|t| t.get(&source)).copied()
    }

    /// Target ID of a reference held by `owner`, or `Unresolved`.
    pub fn require(
        &self,
        ref_class: TcmsClass,
        source: SourceId,
        owner: TcmsClass,
        owner_key: &str,
    ) -> SyncResult<TargetId> {
        self.get(ref_class, source).ok_or_else(|| SyncError::Unresolved {
            class: owner,
            key: owner_key.to_string(),
            ref_class,
            ref_id: source.0,
        })
    }

    /// Like [`IdMap::require`] for optional references.
    pub fn require_opt(
        &self,
        ref_class: TcmsClass,
        source: Option<SourceId>,
        owner: TcmsClass,
        owner_key: &str,
    ) -> SyncResult<Option<TargetId>> {
        source
            .map(|s| self.require(ref_class, s, owner, owner_key))
            .transpose()
    }

    pub fn len(&self, class: TcmsClass) -> usize {
        self.tables.get(&class).map(|t| t.len()).unwrap_or(0)
    }
}
