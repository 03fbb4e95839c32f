//! Master-data resolution: match, remap or create the reference objects a
//! container relies on.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::apply::ApplyPort;
use crate::entity::{MasterData, NaturalKey, Product, SourceId, TargetId, TcmsClass};
use crate::error::{SyncError, SyncResult};
use crate::gateway::{Fields, Filter, TcmsGateway};
use crate::idmap::IdMap;
use crate::trace::{Action, Decision, Trace};

/// Result of resolving one master-data reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    ExactMatch(TargetId),
    Remapped(TargetId),
    Created(TargetId),
    Missing,
}

impl Outcome {
    pub fn target(self) -> Option<TargetId> {
        match self {
            Outcome::ExactMatch(t) | Outcome::Remapped(t) | Outcome::Created(t) => Some(t),
            Outcome::Missing => None,
        }
    }

    fn action(self) -> Option<Action> {
        match self {
            Outcome::ExactMatch(_) => Some(Action::Matched),
            Outcome::Remapped(_) => Some(Action::Remapped),
            Outcome::Created(_) => Some(Action::Created),
            Outcome::Missing => None,
        }
    }
}

/// Matching capability of one master-data class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterDataType {
    pub class: TcmsClass,
    /// Fields forming the natural key, parent reference included.
    pub key_fields: &'static [&'static str],
    /// Key field holding the parent reference and the parent's class.
    pub parent: Option<(&'static str, TcmsClass)>,
    pub auto_creatable: bool,
    /// Anchor class: a missing object aborts the pass and is never created.
    pub must_exist: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterDataCatalog {
    types: Vec<MasterDataType>,
}

impl Default for MasterDataCatalog {
    fn default() -> Self {
        fn t(
            class: TcmsClass,
            key_fields: &'static [&'static str],
            parent: Option<(&'static str, TcmsClass)>,
            auto_creatable: bool,
        ) -> MasterDataType {
            MasterDataType {
                class,
                key_fields,
                parent,
                auto_creatable,
                must_exist: false,
            }
        }
        fn anchor(
            class: TcmsClass,
            key_fields: &'static [&'static str],
            parent: Option<(&'static str, TcmsClass)>,
        ) -> MasterDataType {
            MasterDataType {
                must_exist: true,
                ..t(class, key_fields, parent, false)
            }
        }
        Self {
            types: vec![
                anchor(TcmsClass::Product, &["name"], None),
                t(TcmsClass::Classification, &["name"], None, true),
                anchor(
                    TcmsClass::Version,
                    &["value", "product"],
                    Some(("product", TcmsClass::Product)),
                ),
                t(
                    TcmsClass::Build,
                    &["name", "version"],
                    Some(("version", TcmsClass::Version)),
                    true,
                ),
                t(
                    TcmsClass::Category,
                    &["name", "product"],
                    Some(("product", TcmsClass::Product)),
                    true,
                ),
                t(
                    TcmsClass::Component,
                    &["name", "product"],
                    Some(("product", TcmsClass::Product)),
                    true,
                ),
                t(TcmsClass::PlanType, &["name"], None, true),
                t(TcmsClass::Priority, &["value"], None, true),
                t(TcmsClass::CaseStatus, &["name"], None, true),
                t(TcmsClass::ExecutionStatus, &["name"], None, true),
            ],
        }
    }
}

impl MasterDataCatalog {
    /// Default catalog with per-class `auto_creatable` overrides applied.
    /// Anchor classes stay non-creatable.
    pub fn with_overrides(overrides: &BTreeMap<TcmsClass, bool>) -> Self {
        let mut catalog = Self::default();
        for ty in &mut catalog.types {
            if let Some(flag) = overrides.get(&ty.class)
                && !ty.must_exist
            {
                ty.auto_creatable = *flag;
            }
        }
        catalog
    }

    pub fn get(&self, class: TcmsClass) -> Option<&MasterDataType> {
        self.types.iter().find(|t| t.class == class)
    }

    pub fn is_auto_creatable(&self, class: TcmsClass) -> bool {
        self.get(class).is_some_and(|t| t.auto_creatable && !t.must_exist)
    }

    pub fn must_exist(&self, class: TcmsClass) -> bool {
        self.get(class).is_some_and(|t| t.must_exist)
    }
}

/// Natural key built from the key fields of a lookup map.
pub fn key_of(fields: &Fields, key_fields: &[&str]) -> NaturalKey {
    NaturalKey::new(key_fields.iter().map(|f| match fields.get(*f) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }))
}

pub struct MasterDataResolver<'a, P: ApplyPort> {
    gateway: &'a dyn TcmsGateway,
    apply: &'a P,
    catalog: &'a MasterDataCatalog,
    auto_create: bool,
    memo: HashMap<(TcmsClass, NaturalKey), TargetId>,
}

impl<'a, P: ApplyPort> MasterDataResolver<'a, P> {
    pub fn new(
        gateway: &'a dyn TcmsGateway,
        apply: &'a P,
        catalog: &'a MasterDataCatalog,
        auto_create: bool,
    ) -> Self {
        Self {
            gateway,
            apply,
            catalog,
            auto_create,
            memo: HashMap::new(),
        }
    }

    /// Resolve one reference.
    ///
    /// `lookup` holds the natural-key fields with the parent reference
    /// already rewritten to its target ID; `extra` is only sent on create.
    pub fn resolve(
        &mut self,
        class: TcmsClass,
        source: SourceId,
        lookup: &Fields,
        extra: &Fields,
    ) -> SyncResult<Outcome> {
        let key_fields = self.catalog.get(class).map(|t| t.key_fields).unwrap_or(&[]);
        let key = key_of(lookup, key_fields);
        if let Some(target) = self.memo.get(&(class, key.clone())) {
            return Ok(Outcome::ExactMatch(*target));
        }

        let mut filter = Filter::new();
        for (field, value) in lookup {
            filter = filter.eq(field, value.clone());
        }
        let found = self.gateway.find(class, &filter)?;
        let outcome = match found.as_slice() {
            [] => {
                if self.auto_create && self.catalog.is_auto_creatable(class) {
                    let mut payload = lookup.clone();
                    payload.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
                    Outcome::Created(TargetId(self.apply.create(class, &payload)?))
                } else {
                    Outcome::Missing
                }
            }
            [one] if one.id == source.0 => Outcome::ExactMatch(TargetId(one.id)),
            [one] => Outcome::Remapped(TargetId(one.id)),
            many => {
                return Err(SyncError::AmbiguousMatch {
                    class,
                    key: key.to_string(),
                    count: many.len(),
                });
            }
        };
        if let Some(target) = outcome.target() {
            self.memo.insert((class, key), target);
        }
        Ok(outcome)
    }

    /// Resolve a reference, record the decision and the ID mapping.
    ///
    /// Returns `Err` only when the failure must abort the pass.
    fn resolve_and_record(
        &mut self,
        class: TcmsClass,
        source: SourceId,
        lookup: SyncResult<Fields>,
        extra: Fields,
        ids: &mut IdMap,
        trace: &mut Trace,
    ) -> SyncResult<()> {
        let key_fields = self.catalog.get(class).map(|t| t.key_fields).unwrap_or(&[]);
        let anchor = self.catalog.must_exist(class);
        let result = lookup.and_then(|lookup| {
            let key = key_of(&lookup, key_fields);
            match self.resolve(class, source, &lookup, &extra)? {
                Outcome::Missing if anchor => Err(SyncError::MustExist {
                    class,
                    key: key.to_string(),
                }),
                Outcome::Missing => Err(SyncError::Missing {
                    class,
                    key: key.to_string(),
                }),
                outcome => Ok((key, outcome)),
            }
        });
        match result {
            Ok((key, outcome)) => {
                let target = outcome.target();
                if let (Some(target), Some(action)) = (target, outcome.action()) {
                    ids.insert(class, source, target);
                    trace.push(Decision::new(class, key, Some(source), Some(target), action));
                }
                Ok(())
            }
            Err(err) => {
                tracing::warn!(%class, source = source.0, error = %err, "master data unresolved");
                let key = NaturalKey::new([source.to_string()]);
                trace.push(Decision::failed(class, key, Some(source), err.clone()));
                if anchor { Err(err) } else { Ok(()) }
            }
        }
    }

    /// Product anchor: must exist in the target.
    pub fn resolve_product(
        &mut self,
        product: &Product,
        ids: &mut IdMap,
        trace: &mut Trace,
    ) -> SyncResult<TargetId> {
        let lookup = crate::gateway::fields([("name", product.name.as_str())]);
        self.resolve_and_record(
            TcmsClass::Product,
            product.id,
            Ok(lookup),
            Fields::new(),
            ids,
            trace,
        )?;
        ids.require(TcmsClass::Product, product.id, TcmsClass::Product, &product.name)
    }

    /// Resolve every master-data table in dependency order.
    ///
    /// Users are handled by the user resolver before this runs. Per-object
    /// failures are recorded in the trace; only missing anchors abort.
    pub fn resolve_all(
        &mut self,
        md: &MasterData,
        ids: &mut IdMap,
        trace: &mut Trace,
    ) -> SyncResult<()> {
        use crate::gateway::fields;

        for c in &md.classifications {
            self.resolve_and_record(
                TcmsClass::Classification,
                c.id,
                Ok(fields([("name", c.name.as_str())])),
                Fields::new(),
                ids,
                trace,
            )?;
        }
        for v in &md.versions {
            let lookup = ids
                .require(TcmsClass::Product, v.product, TcmsClass::Version, &v.value)
                .map(|p| {
                    let mut f = fields([("value", v.value.as_str())]);
                    f.insert("product".to_string(), Value::from(p.0));
                    f
                });
            self.resolve_and_record(TcmsClass::Version, v.id, lookup, Fields::new(), ids, trace)?;
        }
        for b in &md.builds {
            let lookup = ids
                .require(TcmsClass::Version, b.version, TcmsClass::Build, &b.name)
                .map(|v| {
                    let mut f = fields([("name", b.name.as_str())]);
                    f.insert("version".to_string(), Value::from(v.0));
                    f
                });
            let extra = fields([("is-active", b.is_active)]);
            self.resolve_and_record(TcmsClass::Build, b.id, lookup, extra, ids, trace)?;
        }
        for c in &md.categories {
            let lookup = ids
                .require(TcmsClass::Product, c.product, TcmsClass::Category, &c.name)
                .map(|p| {
                    let mut f = fields([("name", c.name.as_str())]);
                    f.insert("product".to_string(), Value::from(p.0));
                    f
                });
            let extra = fields([("description", c.description.as_str())]);
            self.resolve_and_record(TcmsClass::Category, c.id, lookup, extra, ids, trace)?;
        }
        for c in &md.components {
            let lookup = ids
                .require(TcmsClass::Product, c.product, TcmsClass::Component, &c.name)
                .map(|p| {
                    let mut f = fields([("name", c.name.as_str())]);
                    f.insert("product".to_string(), Value::from(p.0));
                    f
                });
            let mut extra = fields([("description", c.description.as_str())]);
            for (field, user) in [
                ("initial-owner", c.initial_owner),
                ("initial-qa-contact", c.initial_qa_contact),
            ] {
                if let Some(target) = user.and_then(|u| ids.get(TcmsClass::User, u)) {
                    extra.insert(field.to_string(), Value::from(target.0));
                }
            }
            self.resolve_and_record(TcmsClass::Component, c.id, lookup, extra, ids, trace)?;
        }
        for t in &md.plan_types {
            self.resolve_and_record(
                TcmsClass::PlanType,
                t.id,
                Ok(fields([("name", t.name.as_str())])),
                fields([("description", t.description.as_str())]),
                ids,
                trace,
            )?;
        }
        for p in &md.priorities {
            self.resolve_and_record(
                TcmsClass::Priority,
                p.id,
                Ok(fields([("value", p.value.as_str())])),
                fields([("is-active", p.is_active)]),
                ids,
                trace,
            )?;
        }
        for s in &md.case_statuses {
            let mut extra = fields([("description", s.description.as_str())]);
            extra.insert("is-confirmed".to_string(), Value::from(s.is_confirmed));
            self.resolve_and_record(
                TcmsClass::CaseStatus,
                s.id,
                Ok(fields([("name", s.name.as_str())])),
                extra,
                ids,
                trace,
            )?;
        }
        for s in &md.execution_statuses {
            let mut extra = fields([("icon", s.icon.as_str()), ("color", s.color.as_str())]);
            extra.insert("weight".to_string(), Value::from(s.weight));
            self.resolve_and_record(
                TcmsClass::ExecutionStatus,
                s.id,
                Ok(fields([("name", s.name.as_str())])),
                extra,
                ids,
                trace,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::{LiveApply, SimulatedApply};
    use crate::entity::{Build, Version};
    use crate::gateway::{MemoryGateway, fields};

    fn gateway_with_product() -> MemoryGateway {
        let gw = MemoryGateway::new("alice");
        gw.seed_with_id(TcmsClass::Product, 1, fields([("name", "demo")]));
        let mut version = fields([("value", "1.0")]);
        version.insert("product".to_string(), Value::from(1));
        gw.seed_with_id(TcmsClass::Version, 55, version);
        gw
    }

    fn product() -> Product {
        Product {
            id: SourceId(1),
            name: "demo".to_string(),
            classification: SourceId(1),
            description: String::new(),
        }
    }

    fn build(id: i64, name: &str, version: i64) -> Build {
        Build {
            id: SourceId(id),
            name: name.to_string(),
            version: SourceId(version),
            is_active: true,
        }
    }

    #[test]
    fn test_build_created_under_remapped_version() {
        let gw = gateway_with_product();
        let live = LiveApply::new(&gw);
        let catalog = MasterDataCatalog::default();
        let mut resolver = MasterDataResolver::new(&gw, &live, &catalog, true);
        let mut ids = IdMap::new();
        let mut trace = Trace::new();

        resolver.resolve_product(&product(), &mut ids, &mut trace).unwrap();
        let md = MasterData {
            versions: vec![Version {
                id: SourceId(102),
                value: "1.0".to_string(),
                product: SourceId(1),
            }],
            builds: vec![build(7, "b1", 102)],
            ..MasterData::default()
        };
        resolver.resolve_all(&md, &mut ids, &mut trace).unwrap();

        assert_eq!(ids.get(TcmsClass::Version, SourceId(102)), Some(TargetId(55)));
        let version = trace.for_class(TcmsClass::Version).next().unwrap();
        assert_eq!(version.action, Action::Remapped);

        let build_target = ids.get(TcmsClass::Build, SourceId(7)).unwrap();
        let created = gw.get(TcmsClass::Build, build_target.0).unwrap();
        assert_eq!(created.id_field("version"), Some(55));
        assert_eq!(created.str_field("name"), Some("b1"));
    }

    #[test]
    fn test_same_key_created_once() {
        let gw = gateway_with_product();
        let live = LiveApply::new(&gw);
        let catalog = MasterDataCatalog::default();
        let mut resolver = MasterDataResolver::new(&gw, &live, &catalog, true);
        let mut ids = IdMap::new();
        let mut trace = Trace::new();
        ids.insert(TcmsClass::Version, SourceId(102), TargetId(55));

        let md = MasterData {
            builds: vec![build(7, "b1", 102), build(8, "b1", 102)],
            ..MasterData::default()
        };
        resolver.resolve_all(&md, &mut ids, &mut trace).unwrap();

        assert_eq!(gw.objects_of(TcmsClass::Build).len(), 1);
        let actions: Vec<_> = trace.decisions().iter().map(|d| d.action.clone()).collect();
        assert_eq!(actions, vec![Action::Created, Action::Matched]);
        assert_eq!(
            ids.get(TcmsClass::Build, SourceId(7)),
            ids.get(TcmsClass::Build, SourceId(8))
        );
    }

    #[test]
    fn test_missing_version_aborts() {
        let gw = gateway_with_product();
        let sim = SimulatedApply::new();
        let catalog = MasterDataCatalog::default();
        let mut resolver = MasterDataResolver::new(&gw, &sim, &catalog, true);
        let mut ids = IdMap::new();
        let mut trace = Trace::new();
        resolver.resolve_product(&product(), &mut ids, &mut trace).unwrap();

        let md = MasterData {
            versions: vec![Version {
                id: SourceId(3),
                value: "9.9".to_string(),
                product: SourceId(1),
            }],
            ..MasterData::default()
        };
        let err = resolver.resolve_all(&md, &mut ids, &mut trace).unwrap_err();
        assert!(matches!(err, SyncError::MustExist { class: TcmsClass::Version, .. }));
        assert!(sim.calls().is_empty());
    }

    #[test]
    fn test_missing_without_auto_create_fails_only_that_object() {
        let gw = gateway_with_product();
        let live = LiveApply::new(&gw);
        let catalog = MasterDataCatalog::default();
        let mut resolver = MasterDataResolver::new(&gw, &live, &catalog, false);
        let mut ids = IdMap::new();
        let mut trace = Trace::new();
        ids.insert(TcmsClass::Version, SourceId(102), TargetId(55));

        let md = MasterData {
            builds: vec![build(7, "b1", 102), build(8, "b2", 999)],
            ..MasterData::default()
        };
        resolver.resolve_all(&md, &mut ids, &mut trace).unwrap();

        let failures: Vec<_> = trace.failures().collect();
        assert_eq!(failures.len(), 2);
        assert!(matches!(
            failures[0].action,
            Action::Failed(SyncError::Missing { .. })
        ));
        assert!(matches!(
            failures[1].action,
            Action::Failed(SyncError::Unresolved { ref_id: 999, .. })
        ));
        assert_eq!(gw.mutation_count(), 0);
    }

    #[test]
    fn test_catalog_override_keeps_anchors() {
        let mut overrides = BTreeMap::new();
        overrides.insert(TcmsClass::Priority, false);
        overrides.insert(TcmsClass::Version, true);
        let catalog = MasterDataCatalog::with_overrides(&overrides);
        assert!(!catalog.is_auto_creatable(TcmsClass::Priority));
        assert!(!catalog.is_auto_creatable(TcmsClass::Version));
        assert!(catalog.is_auto_creatable(TcmsClass::Build));
        assert!(catalog.must_exist(TcmsClass::Version));
        assert!(catalog.must_exist(TcmsClass::Product));
        assert!(!catalog.must_exist(TcmsClass::Build));
    }

    #[test]
    fn test_must_exist_flag_drives_abort() {
        let gw = gateway_with_product();
        let sim = SimulatedApply::new();
        let mut catalog = MasterDataCatalog::default();
        for ty in &mut catalog.types {
            if ty.class == TcmsClass::Build {
                ty.must_exist = true;
            }
        }
        let mut resolver = MasterDataResolver::new(&gw, &sim, &catalog, true);
        let mut ids = IdMap::new();
        let mut trace = Trace::new();
        ids.insert(TcmsClass::Version, SourceId(102), TargetId(55));

        let md = MasterData {
            builds: vec![build(7, "b9", 102)],
            ..MasterData::default()
        };
        let err = resolver.resolve_all(&md, &mut ids, &mut trace).unwrap_err();
        assert!(matches!(err, SyncError::MustExist { class: TcmsClass::Build, .. }));
        assert!(sim.calls().is_empty());
    }

    #[test]
    fn test_ambiguous_master_data() {
        let gw = gateway_with_product();
        gw.seed(TcmsClass::PlanType, fields([("name", "Unit")]));
        gw.seed(TcmsClass::PlanType, fields([("name", "Unit")]));
        let live = LiveApply::new(&gw);
        let catalog = MasterDataCatalog::default();
        let mut resolver = MasterDataResolver::new(&gw, &live, &catalog, true);
        let err = resolver
            .resolve(
                TcmsClass::PlanType,
                SourceId(4),
                &fields([("name", "Unit")]),
                &Fields::new(),
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::AmbiguousMatch { count: 2, .. }));
    }
}
