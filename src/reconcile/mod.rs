//! Reconciliation engine.
//!
//! Each object of a container goes through resolution of its references,
//! matching against the target by natural key and one of skip, update or
//! create. The outcome of every step is pushed to the [`Trace`]; mutations
//! go through the [`ApplyPort`], so simulated and live passes take exactly
//! the same decisions.
//!
//! - `definitions`: import of products, plans, cases, runs and executions
//! - `results`: storage of runner results
//! - `attachments`: attachment upload and download

pub mod attachments;
pub mod definitions;
pub mod results;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

use crate::apply::ApplyPort;
use crate::config::Config;
use crate::entity::{NaturalKey, ObjectId, SourceId, TargetId, TcmsClass};
use crate::error::{SyncError, SyncResult};
use crate::gateway::{Fields, TcmsGateway, TcmsObject};
use crate::idmap::IdMap;
use crate::masterdata::MasterDataCatalog;
use crate::status::StatusWeights;
use crate::trace::{Action, Decision, Summary, Trace};
use crate::users::{UserCache, UserPolicy, UserResolver};

pub use attachments::AttachmentEntry;

/// What to do with runs/executions that already exist when storing results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ExistingResultPolicy {
    #[default]
    Update,
    Skip,
}

/// Why objects are being reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Existing objects are left untouched.
    ImportDefinition,
    /// Existing runs and executions are updated (unless the policy says skip).
    ImportResult,
}

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub auto_create: bool,
    pub user_policy: UserPolicy,
    pub existing_results: ExistingResultPolicy,
    pub include_attachments: bool,
    pub include_environments: bool,
    pub strict_attachments: bool,
    pub catalog: MasterDataCatalog,
    /// Result state name -> TCMS execution status name
    pub execution_states: BTreeMap<String, String>,
    /// Runner output files uploaded with results
    pub result_attachments: Vec<Regex>,
    /// Used to merge matrix cells of one case
    pub status_weights: StatusWeights,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            auto_create: false,
            user_policy: UserPolicy::default(),
            existing_results: ExistingResultPolicy::default(),
            include_attachments: false,
            include_environments: false,
            strict_attachments: false,
            catalog: MasterDataCatalog::default(),
            execution_states: BTreeMap::new(),
            result_attachments: Vec::new(),
            status_weights: StatusWeights::default(),
        }
    }
}

impl ImportOptions {
    /// Options seeded from the `[import]`, `[master-data]` and `[tcms]` sections.
    pub fn from_config(config: &Config) -> SyncResult<Self> {
        Ok(Self {
            auto_create: config.import.auto_create,
            user_policy: config.import.user_references,
            existing_results: config.import.existing_results,
            include_attachments: false,
            include_environments: false,
            strict_attachments: config.import.strict_attachments,
            catalog: MasterDataCatalog::with_overrides(&config.master_data.overrides()?),
            execution_states: config.tcms.execution_states.clone(),
            result_attachments: Config::compile_patterns(&config.tcms.result_attachments)?,
            status_weights: StatusWeights::with_overrides(&config.tcms.status_weights),
        })
    }

    fn execution_state<'a>(&'a self, state: &'a str) -> &'a str {
        self.execution_states
            .get(state)
            .map(String::as_str)
            .unwrap_or(state)
    }
}

/// Everything a reconciliation pass produced. Always returned, even when
/// the pass was aborted.
#[derive(Debug, Clone, Default)]
pub struct ImportReport {
    pub trace: Trace,
    pub abort: Option<SyncError>,
    pub summary: Summary,
    pub attachments: Vec<AttachmentEntry>,
    pub simulated: bool,
}

impl ImportReport {
    pub fn is_success(&self) -> bool {
        self.abort.is_none()
            && self.summary.failed == 0
            && self.attachments.iter().all(|a| a.error.is_none())
    }
}

/// Attachment upload queued until the end of the pass.
struct PendingUpload {
    class: TcmsClass,
    source: SourceId,
    target: TargetId,
    files: Vec<String>,
}

pub struct Engine<'a, P: ApplyPort> {
    gateway: &'a dyn TcmsGateway,
    apply: &'a P,
    options: &'a ImportOptions,
    intent: Intent,
    ids: IdMap,
    trace: Trace,
    users: UserResolver<'a>,
    user_cache: UserCache,
    pending_uploads: Vec<PendingUpload>,
    attachments: Vec<AttachmentEntry>,
    /// Objects this pass created in the target.
    created: HashSet<(TcmsClass, ObjectId)>,
}

impl<'a, P: ApplyPort> Engine<'a, P> {
    pub fn new(gateway: &'a dyn TcmsGateway, apply: &'a P, options: &'a ImportOptions) -> Self {
        Self {
            gateway,
            apply,
            options,
            intent: Intent::ImportDefinition,
            ids: IdMap::new(),
            trace: Trace::new(),
            users: UserResolver::new(gateway, options.user_policy),
            user_cache: UserCache::default(),
            pending_uploads: Vec::new(),
            attachments: Vec::new(),
            created: HashSet::new(),
        }
    }

    pub fn ids(&self) -> &IdMap {
        &self.ids
    }

    fn finish(self, abort: Option<SyncError>) -> ImportReport {
        if let Some(err) = &abort {
            tracing::warn!(error = %err, "reconciliation aborted");
        }
        let summary = Summary::of(&self.trace);
        tracing::info!(
            created = summary.created,
            updated = summary.updated,
            skipped = summary.skipped,
            failed = summary.failed,
            simulated = self.apply.is_simulated(),
            "reconciliation finished"
        );
        ImportReport {
            summary,
            trace: self.trace,
            abort,
            attachments: self.attachments,
            simulated: self.apply.is_simulated(),
        }
    }

    fn fail(&mut self, class: TcmsClass, key: NaturalKey, source: Option<SourceId>, err: SyncError) {
        tracing::warn!(%class, %key, error = %err, "object failed");
        self.trace.push(Decision::failed(class, key, source, err));
    }

    /// Candidates that existed before this pass. Objects created by the
    /// pass itself never match, so a live pass decides exactly like a
    /// simulated one.
    fn preexisting(&self, class: TcmsClass, candidates: Vec<TcmsObject>) -> Vec<TcmsObject> {
        candidates
            .into_iter()
            .filter(|c| !self.created.contains(&(class, c.id)))
            .collect()
    }

    fn create(&mut self, class: TcmsClass, fields: &Fields) -> SyncResult<TargetId> {
        let id = self.apply.create(class, fields)?;
        self.created.insert((class, id));
        Ok(TargetId(id))
    }

    /// Skip, update or create one object given the target's candidates.
    ///
    /// `update` is only applied under `Intent::ImportResult` with the
    /// update policy. Returns the target ID and the action taken; the
    /// decision is already in the trace.
    fn settle(
        &mut self,
        class: TcmsClass,
        key: NaturalKey,
        source: Option<SourceId>,
        candidates: Vec<TcmsObject>,
        create: &Fields,
        update: Option<&Fields>,
    ) -> SyncResult<(TargetId, Action)> {
        let candidates = self.preexisting(class, candidates);
        let (target, action) = match candidates.as_slice() {
            [] => (self.create(class, create)?, Action::Created),
            [existing] => {
                let id = existing.id;
                match update {
                    Some(fields)
                        if self.intent == Intent::ImportResult
                            && self.options.existing_results == ExistingResultPolicy::Update =>
                    {
                        self.apply.update(class, id, fields)?;
                        (TargetId(id), Action::Updated)
                    }
                    _ => (TargetId(id), Action::Skipped),
                }
            }
            many => {
                return Err(SyncError::AmbiguousMatch {
                    class,
                    key: key.to_string(),
                    count: many.len(),
                });
            }
        };
        if let Some(source) = source {
            self.ids.insert(class, source, target);
        }
        self.trace
            .push(Decision::new(class, key, source, Some(target), action.clone()));
        Ok((target, action))
    }

    /// Like [`Engine::settle`], recording any error as a failed decision.
    fn settle_or_fail(
        &mut self,
        class: TcmsClass,
        key: NaturalKey,
        source: Option<SourceId>,
        candidates: SyncResult<Vec<TcmsObject>>,
        create: &Fields,
        update: Option<&Fields>,
    ) -> Option<(TargetId, Action)> {
        let result = candidates
            .and_then(|c| self.settle(class, key.clone(), source, c, create, update));
        match result {
            Ok(settled) => Some(settled),
            Err(err) => {
                self.fail(class, key, source, err);
                None
            }
        }
    }

    /// Tester or other user given by name, resolved through the user policy.
    fn user_by_name(&mut self, username: &str) -> SyncResult<TargetId> {
        self.user_cache.get_or_resolve(&mut self.users, username)
    }
}

/// Serialize an entity into a create payload: the `id` and `attachments`
/// keys are dropped and reference fields are overwritten with target IDs.
pub(crate) fn payload<T: Serialize>(
    entity: &T,
    refs: &[(&str, Option<TargetId>)],
) -> SyncResult<Fields> {
    let Value::Object(mut fields) =
        serde_json::to_value(entity).map_err(|e| SyncError::Container(e.to_string()))?
    else {
        return Err(SyncError::Container("entity is not a record".to_string()));
    };
    fields.remove("id");
    fields.remove("attachments");
    for (name, target) in refs {
        match target {
            Some(t) => fields.insert(name.to_string(), Value::from(t.0)),
            None => fields.remove(*name),
        };
    }
    Ok(fields)
}
