use chrono::SecondsFormat;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

use crate::authorization::PolicyHandle;
use crate::models::{Document, FieldKind, FieldPath, FieldSpec, ResourceSchema};

/// Name of the resource `enable_auth` registers. Principals are instances of it.
pub const USER_RESOURCE: &str = "User";

/// Attributes every representation carries; schemas may not redeclare them.
pub const SYSTEM_ATTRIBUTES: [&str; 3] = ["id", "timestampCreated", "timestampUpdated"];

/// RegistryError
///
/// Setup-time failures raised while registering resources and generating routes.
#[derive(Error, Debug, PartialEq)]
pub enum RegistryError {
    #[error("resource '{0}' is already registered")]
    DuplicateResource(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("{resource} has no reference field to {parent}")]
    NoScopeField { resource: String, parent: String },

    #[error("route {method} {path} is already registered")]
    DuplicateRoute { method: String, path: String },
}

/// ResourceDefinition
///
/// An immutable, registered resource. Shared through [`ResourceHandle`] by the
/// route generator, the validator, the authorization gate and the expansion
/// resolver.
pub struct ResourceDefinition {
    name: String,
    singular: String,
    plural: String,
    fields: Vec<(String, FieldSpec)>,
    policy: Option<PolicyHandle>,
    owner_field: Option<FieldPath>,
}

pub type ResourceHandle = Arc<ResourceDefinition>;

impl std::fmt::Debug for ResourceDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceDefinition")
            .field("name", &self.name)
            .field("fields", &self.fields)
            .field("policy", &self.policy.is_some())
            .finish()
    }
}

impl ResourceDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key wrapping a single instance in responses, e.g. `bar`.
    pub fn singular(&self) -> &str {
        &self.singular
    }

    /// URL segment and collection key, e.g. `bars`.
    pub fn plural(&self) -> &str {
        &self.plural
    }

    pub fn fields(&self) -> &[(String, FieldSpec)] {
        &self.fields
    }

    pub fn policy(&self) -> Option<&PolicyHandle> {
        self.policy.as_ref()
    }

    /// First singular reference to the user resource, in declaration order.
    pub fn owner_field(&self) -> Option<&FieldPath> {
        self.owner_field.as_ref()
    }

    pub fn is_user_resource(&self) -> bool {
        self.name == USER_RESOURCE
    }

    /// The field at `path`, descending through groups.
    pub fn field(&self, path: &FieldPath) -> Option<&FieldSpec> {
        lookup(&self.fields, path.segments())
    }

    /// The reference field a nested route for `parent` scopes on.
    pub fn scope_field(&self, parent: &str) -> Option<FieldPath> {
        find_reference(&self.fields, &FieldPath(Vec::new()), parent)
    }

    pub fn unique_paths(&self) -> Vec<FieldPath> {
        let mut paths = Vec::new();
        collect_unique(&self.fields, &FieldPath(Vec::new()), &mut paths);
        paths
    }

    /// The client-facing shape of `doc`: visible schema fields plus the
    /// system attributes. Private fields never leave the process.
    pub fn represent(&self, doc: &Document) -> Map<String, Value> {
        let mut out = visible_fields(&self.fields, &doc.fields);
        out.insert("id".to_string(), Value::String(doc.id.to_string()));
        out.insert(
            "timestampCreated".to_string(),
            Value::String(doc.timestamp_created.to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
        out.insert(
            "timestampUpdated".to_string(),
            Value::String(doc.timestamp_updated.to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
        out
    }
}

fn lookup<'a>(fields: &'a [(String, FieldSpec)], path: &[String]) -> Option<&'a FieldSpec> {
    let (first, rest) = path.split_first()?;
    let spec = fields
        .iter()
        .find(|(name, _)| name == first)
        .map(|(_, spec)| spec)?;
    if rest.is_empty() {
        return Some(spec);
    }
    match &spec.kind {
        FieldKind::Group(inner) => lookup(inner, rest),
        _ => None,
    }
}

fn find_reference(
    fields: &[(String, FieldSpec)],
    prefix: &FieldPath,
    target: &str,
) -> Option<FieldPath> {
    fields.iter().find_map(|(name, spec)| match &spec.kind {
        FieldKind::Reference(to) if to == target => Some(prefix.child(name)),
        FieldKind::Group(inner) => find_reference(inner, &prefix.child(name), target),
        _ => None,
    })
}

fn collect_unique(fields: &[(String, FieldSpec)], prefix: &FieldPath, out: &mut Vec<FieldPath>) {
    for (name, spec) in fields {
        match &spec.kind {
            FieldKind::Group(inner) => collect_unique(inner, &prefix.child(name), out),
            _ if spec.unique => out.push(prefix.child(name)),
            _ => {}
        }
    }
}

fn visible_fields(fields: &[(String, FieldSpec)], stored: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (name, spec) in fields {
        if spec.private {
            continue;
        }
        match (&spec.kind, stored.get(name)) {
            (FieldKind::Group(inner), Some(Value::Object(nested))) => {
                out.insert(name.clone(), Value::Object(visible_fields(inner, nested)));
            }
            (_, Some(value)) => {
                out.insert(name.clone(), value.clone());
            }
            (_, None) => {}
        }
    }
    out
}

fn validate_name(name: &str) -> Result<(), RegistryError> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidName(format!("'{name}'")))
    }
}

fn validate_fields(fields: &[(String, FieldSpec)], top_level: bool) -> Result<(), RegistryError> {
    let mut seen = HashSet::new();
    for (name, spec) in fields {
        validate_name(name)?;
        if top_level && SYSTEM_ATTRIBUTES.contains(&name.as_str()) {
            return Err(RegistryError::InvalidName(format!(
                "'{name}' is a system attribute"
            )));
        }
        if !seen.insert(name.as_str()) {
            return Err(RegistryError::InvalidName(format!("'{name}' is declared twice")));
        }
        match &spec.kind {
            FieldKind::Group(inner) => validate_fields(inner, false)?,
            FieldKind::Reference(target) | FieldKind::ReferenceList(target) => {
                validate_name(target)?
            }
            _ => {}
        }
    }
    Ok(())
}

/// ResourceRegistry
///
/// Startup-time catalogue of resources. Populated once, then frozen behind an
/// `Arc` inside the application state.
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    resources: HashMap<String, ResourceHandle>,
    order: Vec<String>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// register
    ///
    /// Adds a resource under a unique name and returns the handle the route
    /// generator works with.
    pub fn register(
        &mut self,
        name: &str,
        schema: ResourceSchema,
    ) -> Result<ResourceHandle, RegistryError> {
        validate_name(name)?;
        if self.resources.contains_key(name) {
            return Err(RegistryError::DuplicateResource(name.to_string()));
        }
        validate_fields(&schema.fields, true)?;

        let singular = name.to_lowercase();
        let plural = format!("{singular}s");
        if self.resources.values().any(|r| r.plural == plural) {
            return Err(RegistryError::DuplicateResource(name.to_string()));
        }

        let owner_field = find_reference(&schema.fields, &FieldPath(Vec::new()), USER_RESOURCE);
        let definition = Arc::new(ResourceDefinition {
            name: name.to_string(),
            singular,
            plural,
            fields: schema.fields,
            policy: schema.policy,
            owner_field,
        });

        tracing::debug!(resource = name, "registered resource");
        self.resources.insert(name.to_string(), definition.clone());
        self.order.push(name.to_string());
        Ok(definition)
    }

    /// enable_auth
    ///
    /// Registers the designated user resource: a required, unique `email` plus
    /// whatever extra fields the application supplies.
    pub fn enable_auth(&mut self, extra: ResourceSchema) -> Result<ResourceHandle, RegistryError> {
        let mut schema = ResourceSchema::new().field("email", FieldSpec::string().unique().required());
        schema.fields.extend(extra.fields);
        schema.policy = extra.policy;
        self.register(USER_RESOURCE, schema)
    }

    pub fn get(&self, name: &str) -> Option<&ResourceHandle> {
        self.resources.get(name)
    }

    pub fn user_resource(&self) -> Option<&ResourceHandle> {
        self.get(USER_RESOURCE)
    }

    /// Registered resources in registration order.
    pub fn resources(&self) -> impl Iterator<Item = &ResourceHandle> + '_ {
        self.order.iter().filter_map(|name| self.resources.get(name))
    }
}
