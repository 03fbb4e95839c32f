//! Boundary to the remote TCMS object store.
//!
//! The engine and the runner only ever talk to TCMS through [`TcmsGateway`].
//! Objects cross the boundary as untyped field maps so that the gateway does
//! not need to know about the typed entity model.
//!
//! [`MemoryGateway`] is an in-process object store implementing the trait. The
//! CLI persists it as a JSON snapshot (see `store.rs`); tests use it directly.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use crate::entity::{ObjectId, TcmsClass};

pub type Fields = serde_json::Map<String, Value>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("{0}")]
    Remote(String),
    #[error("{class} #{id} does not exist")]
    NotFound { class: TcmsClass, id: ObjectId },
    #[error("{class} rejected the request: {message}")]
    Rejected { class: TcmsClass, message: String },
}

/// An object as returned by the TCMS: its ID plus raw field values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcmsObject {
    pub id: ObjectId,
    #[serde(default)]
    pub fields: Fields,
}

impl TcmsObject {
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    pub fn id_field(&self, name: &str) -> Option<ObjectId> {
        self.fields.get(name).and_then(Value::as_i64)
    }
}

/// Equality filter for `find`. The pseudo-field `id` matches the object ID.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter(Fields);

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_id(id: ObjectId) -> Self {
        Self::new().eq("id", id)
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.0.insert(field.to_string(), value.into());
        self
    }

    pub fn matches(&self, object: &TcmsObject) -> bool {
        self.0.iter().all(|(field, expected)| {
            if field == "id" {
                expected.as_i64() == Some(object.id)
            } else {
                object.fields.get(field) == Some(expected)
            }
        })
    }

    pub fn fields(&self) -> &Fields {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentInfo {
    pub name: String,
    pub size: usize,
}

/// Remote object store consumed by the engine and the runner.
///
/// Failures are surfaced as-is; callers never retry.
pub trait TcmsGateway: Send + Sync {
    fn find(&self, class: TcmsClass, filter: &Filter) -> Result<Vec<TcmsObject>, GatewayError>;

    fn create(&self, class: TcmsClass, fields: &Fields) -> Result<ObjectId, GatewayError>;

    fn update(&self, class: TcmsClass, id: ObjectId, fields: &Fields) -> Result<(), GatewayError>;

    fn upload_attachment(
        &self,
        class: TcmsClass,
        id: ObjectId,
        name: &str,
        bytes: &[u8],
    ) -> Result<(), GatewayError>;

    /// The user the gateway is authenticated as.
    fn current_user(&self) -> Result<TcmsObject, GatewayError>;

    fn list_attachments(
        &self,
        class: TcmsClass,
        id: ObjectId,
    ) -> Result<Vec<AttachmentInfo>, GatewayError>;

    fn download_attachment(
        &self,
        class: TcmsClass,
        id: ObjectId,
        name: &str,
    ) -> Result<Vec<u8>, GatewayError>;

    /// Fetch a single object by ID.
    fn get(&self, class: TcmsClass, id: ObjectId) -> Result<TcmsObject, GatewayError> {
        self.find(class, &Filter::by_id(id))?
            .into_iter()
            .next()
            .ok_or(GatewayError::NotFound { class, id })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredObject {
    pub class: TcmsClass,
    pub id: ObjectId,
    #[serde(default)]
    pub fields: Fields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAttachment {
    pub class: TcmsClass,
    pub object_id: ObjectId,
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Serializable state of a [`MemoryGateway`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MemorySnapshot {
    #[serde(default)]
    pub next_id: ObjectId,
    #[serde(default)]
    pub current_user: String,
    #[serde(default)]
    pub objects: Vec<StoredObject>,
    #[serde(default)]
    pub attachments: Vec<StoredAttachment>,
}

/// In-process TCMS object store.
#[derive(Debug, Default)]
pub struct MemoryGateway {
    state: Mutex<MemorySnapshot>,
    mutations: Mutex<usize>,
    failing: Mutex<HashSet<TcmsClass>>,
    failing_lookups: Mutex<HashSet<TcmsClass>>,
}

impl MemoryGateway {
    /// Empty store whose current user is `username` (created on the spot).
    pub fn new(username: &str) -> Self {
        let gateway = Self::from_snapshot(MemorySnapshot {
            next_id: 1,
            current_user: username.to_string(),
            ..MemorySnapshot::default()
        });
        gateway.ensure_user(username);
        gateway
    }

    pub fn from_snapshot(snapshot: MemorySnapshot) -> Self {
        Self {
            state: Mutex::new(snapshot),
            mutations: Mutex::new(0),
            failing: Mutex::new(HashSet::new()),
            failing_lookups: Mutex::new(HashSet::new()),
        }
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        self.lock().clone()
    }

    /// Insert an object directly, bypassing mutation accounting. Returns its ID.
    pub fn seed(&self, class: TcmsClass, fields: Fields) -> ObjectId {
        let mut state = self.lock();
        let id = Self::allocate(&mut state);
        state.objects.push(StoredObject { class, id, fields });
        id
    }

    /// Insert an object with a fixed ID.
    pub fn seed_with_id(&self, class: TcmsClass, id: ObjectId, fields: Fields) {
        let mut state = self.lock();
        if state.next_id <= id {
            state.next_id = id + 1;
        }
        state.objects.push(StoredObject { class, id, fields });
    }

    /// Number of create/update/upload calls served so far.
    pub fn mutation_count(&self) -> usize {
        self.mutations.lock().map(|m| *m).unwrap_or_default()
    }

    /// Make every mutating call on `class` fail with a remote error.
    pub fn fail_mutations_for(&self, class: TcmsClass) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(class);
        }
    }

    /// Make every `find` on `class` fail with a remote error. The current
    /// user stays readable.
    pub fn fail_lookups_for(&self, class: TcmsClass) {
        if let Ok(mut failing) = self.failing_lookups.lock() {
            failing.insert(class);
        }
    }

    pub fn objects_of(&self, class: TcmsClass) -> Vec<TcmsObject> {
        self.lock()
            .objects
            .iter()
            .filter(|o| o.class == class)
            .map(|o| TcmsObject {
                id: o.id,
                fields: o.fields.clone(),
            })
            .collect()
    }

    fn ensure_user(&self, username: &str) {
        let exists = self
            .lock()
            .objects
            .iter()
            .any(|o| o.class == TcmsClass::User && o.fields.get("username") == Some(&Value::from(username)));
        if !exists {
            let mut fields = Fields::new();
            fields.insert("username".to_string(), Value::from(username));
            self.seed(TcmsClass::User, fields);
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemorySnapshot> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn matching(&self, class: TcmsClass, filter: &Filter) -> Vec<TcmsObject> {
        self.lock()
            .objects
            .iter()
            .filter(|o| o.class == class)
            .map(|o| TcmsObject {
                id: o.id,
                fields: o.fields.clone(),
            })
            .filter(|o| filter.matches(o))
            .collect()
    }

    fn allocate(state: &mut MemorySnapshot) -> ObjectId {
        if state.next_id < 1 {
            state.next_id = state.objects.iter().map(|o| o.id).max().unwrap_or(0) + 1;
        }
        let id = state.next_id;
        state.next_id += 1;
        id
    }

    fn check_mutation(&self, class: TcmsClass) -> Result<(), GatewayError> {
        let failing = self
            .failing
            .lock()
            .map(|f| f.contains(&class))
            .unwrap_or(false);
        if failing {
            return Err(GatewayError::Remote(format!(
                "{} is read-only on this server",
                class
            )));
        }
        if let Ok(mut m) = self.mutations.lock() {
            *m += 1;
        }
        Ok(())
    }
}

impl TcmsGateway for MemoryGateway {
    fn find(&self, class: TcmsClass, filter: &Filter) -> Result<Vec<TcmsObject>, GatewayError> {
        let failing = self
            .failing_lookups
            .lock()
            .map(|f| f.contains(&class))
            .unwrap_or(false);
        if failing {
            return Err(GatewayError::Remote(format!("lookup of {} timed out", class)));
        }
        Ok(self.matching(class, filter))
    }

    fn create(&self, class: TcmsClass, fields: &Fields) -> Result<ObjectId, GatewayError> {
        self.check_mutation(class)?;
        let mut state = self.lock();
        let id = Self::allocate(&mut state);
        state.objects.push(StoredObject {
            class,
            id,
            fields: fields.clone(),
        });
        Ok(id)
    }

    fn update(&self, class: TcmsClass, id: ObjectId, fields: &Fields) -> Result<(), GatewayError> {
        self.check_mutation(class)?;
        let mut state = self.lock();
        let object = state
            .objects
            .iter_mut()
            .find(|o| o.class == class && o.id == id)
            .ok_or(GatewayError::NotFound { class, id })?;
        for (k, v) in fields {
            object.fields.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    fn upload_attachment(
        &self,
        class: TcmsClass,
        id: ObjectId,
        name: &str,
        bytes: &[u8],
    ) -> Result<(), GatewayError> {
        if !class.supports_attachments() {
            return Err(GatewayError::Rejected {
                class,
                message: "attachments are not supported".to_string(),
            });
        }
        self.check_mutation(class)?;
        let mut state = self.lock();
        if !state.objects.iter().any(|o| o.class == class && o.id == id) {
            return Err(GatewayError::NotFound { class, id });
        }
        state
            .attachments
            .retain(|a| !(a.class == class && a.object_id == id && a.name == name));
        state.attachments.push(StoredAttachment {
            class,
            object_id: id,
            name: name.to_string(),
            bytes: bytes.to_vec(),
        });
        Ok(())
    }

    fn current_user(&self) -> Result<TcmsObject, GatewayError> {
        let username = self.lock().current_user.clone();
        self.matching(TcmsClass::User, &Filter::new().eq("username", username.as_str()))
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::Remote(format!("current user '{}' is unknown", username)))
    }

    fn list_attachments(
        &self,
        class: TcmsClass,
        id: ObjectId,
    ) -> Result<Vec<AttachmentInfo>, GatewayError> {
        Ok(self
            .lock()
            .attachments
            .iter()
            .filter(|a| a.class == class && a.object_id == id)
            .map(|a| AttachmentInfo {
                name: a.name.clone(),
                size: a.bytes.len(),
            })
            .collect())
    }

    fn download_attachment(
        &self,
        class: TcmsClass,
        id: ObjectId,
        name: &str,
    ) -> Result<Vec<u8>, GatewayError> {
        self.lock()
            .attachments
            .iter()
            .find(|a| a.class == class && a.object_id == id && a.name == name)
            .map(|a| a.bytes.clone())
            .ok_or_else(|| GatewayError::Remote(format!("attachment '{}' not found", name)))
    }
}

/// Build a field map from `(name, value)` pairs.
pub fn fields<I, V>(pairs: I) -> Fields
where
    I: IntoIterator<Item = (&'static str, V)>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.into()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_gateway_knows_current_user() {
        let gw = MemoryGateway::new("alice");
        let me = gw.current_user().unwrap();
        assert_eq!(me.str_field("username"), Some("alice"));
        assert_eq!(gw.mutation_count(), 0);
    }

    #[test]
    fn test_find_by_fields_and_id() {
        let gw = MemoryGateway::new("alice");
        let p1 = gw.seed(TcmsClass::Product, fields([("name", "demo")]));
        gw.seed(TcmsClass::Product, fields([("name", "other")]));

        let found = gw
            .find(TcmsClass::Product, &Filter::new().eq("name", "demo"))
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, p1);

        let by_id = gw.get(TcmsClass::Product, p1).unwrap();
        assert_eq!(by_id.str_field("name"), Some("demo"));
        assert!(gw.get(TcmsClass::Build, p1).is_err());
    }

    #[test]
    fn test_update_merges_fields() {
        let gw = MemoryGateway::new("alice");
        let id = gw
            .create(TcmsClass::TestRun, &fields([("summary", "r1")]))
            .unwrap();
        gw.update(TcmsClass::TestRun, id, &fields([("notes", "ok")]))
            .unwrap();
        let run = gw.get(TcmsClass::TestRun, id).unwrap();
        assert_eq!(run.str_field("summary"), Some("r1"));
        assert_eq!(run.str_field("notes"), Some("ok"));
        assert_eq!(gw.mutation_count(), 2);
    }

    #[test]
    fn test_attachments_roundtrip_and_rejection() {
        let gw = MemoryGateway::new("alice");
        let plan = gw.seed(TcmsClass::TestPlan, fields([("name", "p")]));
        gw.upload_attachment(TcmsClass::TestPlan, plan, "a.txt", b"hello")
            .unwrap();
        let listed = gw.list_attachments(TcmsClass::TestPlan, plan).unwrap();
        assert_eq!(
            listed,
            vec![AttachmentInfo {
                name: "a.txt".to_string(),
                size: 5
            }]
        );
        assert_eq!(
            gw.download_attachment(TcmsClass::TestPlan, plan, "a.txt")
                .unwrap(),
            b"hello".to_vec()
        );

        let build = gw.seed(TcmsClass::Build, fields([("name", "b")]));
        assert!(matches!(
            gw.upload_attachment(TcmsClass::Build, build, "a.txt", b"x"),
            Err(GatewayError::Rejected { .. })
        ));
    }

    #[test]
    fn test_failing_class_rejects_mutations() {
        let gw = MemoryGateway::new("alice");
        gw.fail_mutations_for(TcmsClass::Build);
        assert!(gw.create(TcmsClass::Build, &Fields::new()).is_err());
        assert!(gw.create(TcmsClass::Category, &Fields::new()).is_ok());
    }

    #[test]
    fn test_seed_with_id_advances_allocator() {
        let gw = MemoryGateway::new("alice");
        gw.seed_with_id(TcmsClass::Version, 55, fields([("value", "1.0")]));
        let next = gw.create(TcmsClass::Build, &Fields::new()).unwrap();
        assert_eq!(next, 56);
    }
}
