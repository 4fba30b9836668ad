use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::Principal;
use crate::authorization::{AuthorizationPolicy, PolicyHandle};

// --- Schema Descriptors ---

/// FieldKind
///
/// The type descriptor of a single schema field. References name the target
/// resource by its registered name; groups nest a sub-document.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    /// RFC 3339 timestamp, normalized to UTC on write.
    Date,
    Reference(String),
    ReferenceList(String),
    Group(Vec<(String, FieldSpec)>),
}

/// FieldSpec
///
/// A field descriptor plus the per-field flags the validator, the repository
/// (unique indexes) and the serializer (private fields) consult.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub kind: FieldKind,
    pub unique: bool,
    pub editable: bool,
    pub required: bool,
    /// Never serialized, neither on direct reads nor in expansions.
    pub private: bool,
}

impl FieldSpec {
    fn of(kind: FieldKind) -> Self {
        Self {
            kind,
            unique: false,
            editable: true,
            required: false,
            private: false,
        }
    }

    pub fn string() -> Self {
        Self::of(FieldKind::String)
    }

    pub fn number() -> Self {
        Self::of(FieldKind::Number)
    }

    pub fn boolean() -> Self {
        Self::of(FieldKind::Boolean)
    }

    pub fn date() -> Self {
        Self::of(FieldKind::Date)
    }

    pub fn reference(target: &str) -> Self {
        Self::of(FieldKind::Reference(target.to_string()))
    }

    pub fn reference_list(target: &str) -> Self {
        Self::of(FieldKind::ReferenceList(target.to_string()))
    }

    /// Nests the fields of `schema` as a sub-document. The schema's
    /// authorization policy, if any, is not carried over.
    pub fn group(schema: ResourceSchema) -> Self {
        Self::of(FieldKind::Group(schema.fields))
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn uneditable(mut self) -> Self {
        self.editable = false;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn private(mut self) -> Self {
        self.private = true;
        self
    }
}

/// ResourceSchema
///
/// Ordered field list handed to the registry. Declaration order matters: the
/// owner field and the parent scope field are the first matching references.
#[derive(Clone, Default)]
pub struct ResourceSchema {
    pub fields: Vec<(String, FieldSpec)>,
    pub(crate) policy: Option<PolicyHandle>,
}

impl ResourceSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: &str, spec: FieldSpec) -> Self {
        self.fields.push((name.to_string(), spec));
        self
    }

    /// Installs a resource-specific authorization predicate. It fully replaces
    /// the default ownership check.
    pub fn authorize_with<F>(self, predicate: F) -> Self
    where
        F: Fn(&Principal, &Document) -> bool + Send + Sync + 'static,
    {
        self.policy(predicate)
    }

    /// Same as [`ResourceSchema::authorize_with`] for a named strategy type.
    pub fn policy<P>(mut self, policy: P) -> Self
    where
        P: AuthorizationPolicy + 'static,
    {
        self.policy = Some(Arc::new(policy));
        self
    }
}

impl fmt::Debug for ResourceSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceSchema")
            .field("fields", &self.fields)
            .field("policy", &self.policy.is_some())
            .finish()
    }
}

/// FieldPath
///
/// A dotted path into a document, e.g. `nested.user`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath(pub Vec<String>);

impl FieldPath {
    pub fn parse(raw: &str) -> Self {
        FieldPath(raw.split('.').map(str::to_string).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn child(&self, segment: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.to_string());
        FieldPath(segments)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

// --- Stored Instances ---

/// Document
///
/// A stored resource instance. `fields` holds the schema fields (groups as
/// nested objects); the id and timestamps are system attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub fields: Map<String, Value>,
    pub timestamp_created: DateTime<Utc>,
    pub timestamp_updated: DateTime<Utc>,
}

impl Document {
    pub fn get(&self, path: &FieldPath) -> Option<&Value> {
        get_path(&self.fields, path.segments())
    }

    /// The id stored in a singular reference field, if present and well-formed.
    pub fn reference(&self, path: &FieldPath) -> Option<Uuid> {
        self.get(path)
            .and_then(Value::as_str)
            .and_then(|raw| Uuid::parse_str(raw).ok())
    }
}

/// NewDocument
///
/// Insert payload. Both timestamps are set from `created_at`.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub id: Uuid,
    pub fields: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl NewDocument {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            fields,
            created_at: timestamp_now(),
        }
    }
}

/// Current time at the microsecond precision every store can round-trip.
pub fn timestamp_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// The next `timestampUpdated` for an instance last touched at `previous`.
/// Strictly later than `previous` even when the clock has not advanced.
pub fn next_timestamp(previous: DateTime<Utc>) -> DateTime<Utc> {
    timestamp_now().max(previous + chrono::Duration::microseconds(1))
}

pub fn get_path<'a>(fields: &'a Map<String, Value>, path: &[String]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let value = fields.get(first)?;
    if rest.is_empty() {
        return Some(value);
    }
    value.as_object().and_then(|inner| get_path(inner, rest))
}

/// Writes `value` at `path`, creating intermediate objects.
pub fn set_path(fields: &mut Map<String, Value>, path: &[String], value: Value) {
    let Some((first, rest)) = path.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.insert(first.clone(), value);
        return;
    }
    let entry = fields
        .entry(first.clone())
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    if let Value::Object(inner) = entry {
        set_path(inner, rest, value);
    }
}

/// Merges `patch` into `base`; nested objects merge key by key.
pub fn deep_merge(base: &mut Map<String, Value>, patch: Map<String, Value>) {
    for (key, value) in patch {
        match value {
            Value::Object(incoming) => match base.get_mut(&key) {
                Some(Value::Object(existing)) => deep_merge(existing, incoming),
                _ => {
                    base.insert(key, Value::Object(incoming));
                }
            },
            value => {
                base.insert(key, value);
            }
        }
    }
}
