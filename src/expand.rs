use futures::future::{BoxFuture, FutureExt, join_all};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::auth::Principal;
use crate::authorization::is_visible;
use crate::error::ApiError;
use crate::models::{Document, FieldKind, FieldPath, FieldSpec};
use crate::registry::{ResourceDefinition, ResourceRegistry};
use crate::repository::Repository;

/// ExpandRequest
///
/// The reference paths a read asked to inline (`?expand=user,nested.foos`)
/// and whether a failed lookup fails the whole read (`?strictExpand=true`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpandRequest {
    pub paths: Vec<String>,
    pub strict: bool,
}

impl ExpandRequest {
    pub fn parse(raw: Option<&str>, strict: bool) -> Self {
        let paths = raw
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        Self { paths, strict }
    }
}

#[derive(Debug)]
struct ExpandTarget {
    location: FieldPath,
    target: String,
    many: bool,
    /// Paths to expand inside each referenced instance (explicit chaining).
    chain: Vec<String>,
}

/// ExpansionPlan
///
/// The validated expansion targets of one resource. Building it rejects paths
/// that do not reach a visible reference field, including chained segments.
#[derive(Debug, Default)]
pub struct ExpansionPlan {
    targets: Vec<ExpandTarget>,
}

/// One referenced instance to fetch. `index` is set for list references.
#[derive(Debug, Clone, Copy)]
pub struct Lookup<'a> {
    pub location: &'a FieldPath,
    pub index: Option<usize>,
    pub target: &'a str,
    pub id: Uuid,
    pub chain: &'a [String],
}

impl ExpansionPlan {
    pub fn build(
        registry: &ResourceRegistry,
        resource: &ResourceDefinition,
        paths: &[String],
    ) -> Result<Self, ApiError> {
        let mut plan = ExpansionPlan::default();
        for raw in paths {
            let segments: Vec<String> = raw.split('.').map(str::to_string).collect();
            let Resolved {
                location,
                target,
                many,
                rest,
            } = resolve_reference(resource.fields(), &segments, FieldPath(Vec::new()), raw)?;

            let chain = (!rest.is_empty()).then(|| rest.join("."));
            if let (Some(chain), Some(target_def)) = (&chain, registry.get(&target)) {
                ExpansionPlan::build(registry, target_def, std::slice::from_ref(chain))?;
            }

            match plan.targets.iter_mut().find(|t| t.location == location) {
                Some(existing) => existing.chain.extend(chain),
                None => plan.targets.push(ExpandTarget {
                    location,
                    target,
                    many,
                    chain: chain.into_iter().collect(),
                }),
            }
        }
        Ok(plan)
    }

    /// lookups
    ///
    /// A lazy, finite sequence of the lookups `doc` needs. Calling it again
    /// restarts the sequence. Stored values that are not identifiers are
    /// skipped and stay as they are.
    pub fn lookups<'a>(&'a self, doc: &'a Document) -> impl Iterator<Item = Lookup<'a>> + 'a {
        self.targets.iter().flat_map(move |target| {
            let ids: Vec<(Option<usize>, Uuid)> = match doc.get(&target.location) {
                Some(Value::String(raw)) if !target.many => {
                    Uuid::parse_str(raw).ok().map(|id| (None, id)).into_iter().collect()
                }
                Some(Value::Array(items)) if target.many => items
                    .iter()
                    .enumerate()
                    .filter_map(|(i, item)| {
                        item.as_str()
                            .and_then(|raw| Uuid::parse_str(raw).ok())
                            .map(|id| (Some(i), id))
                    })
                    .collect(),
                _ => Vec::new(),
            };
            ids.into_iter().map(move |(index, id)| Lookup {
                location: &target.location,
                index,
                target: &target.target,
                id,
                chain: &target.chain,
            })
        })
    }
}

struct Resolved<'f> {
    location: FieldPath,
    target: String,
    many: bool,
    rest: &'f [String],
}

fn resolve_reference<'f>(
    fields: &[(String, FieldSpec)],
    segments: &'f [String],
    prefix: FieldPath,
    raw: &str,
) -> Result<Resolved<'f>, ApiError> {
    let not_reference = || ApiError::Validation(format!("cannot expand '{raw}': not a reference field"));
    let (first, rest) = segments.split_first().ok_or_else(not_reference)?;
    let spec = fields
        .iter()
        .find(|(name, spec)| name == first && !spec.private)
        .map(|(_, spec)| spec)
        .ok_or_else(not_reference)?;
    let location = prefix.child(first);
    match &spec.kind {
        FieldKind::Reference(target) => Ok(Resolved {
            location,
            target: target.clone(),
            many: false,
            rest,
        }),
        FieldKind::ReferenceList(target) => Ok(Resolved {
            location,
            target: target.clone(),
            many: true,
            rest,
        }),
        FieldKind::Group(inner) if !rest.is_empty() => resolve_reference(inner, rest, location, raw),
        _ => Err(not_reference()),
    }
}

/// Expander
///
/// Renders documents with their requested references inlined. All lookups of
/// one document run concurrently and finish before the representation is
/// returned. Referenced instances pass the same gate as for the reader of
/// the request; hidden ones stay raw identifiers.
pub struct Expander<'a> {
    registry: &'a ResourceRegistry,
    repo: &'a dyn Repository,
    principal: Option<&'a Principal>,
}

impl<'a> Expander<'a> {
    pub fn new(registry: &'a ResourceRegistry, repo: &'a dyn Repository, principal: Option<&'a Principal>) -> Self {
        Self {
            registry,
            repo,
            principal,
        }
    }

    /// render
    ///
    /// The representation of `doc` with `request.paths` expanded one level,
    /// plus any explicitly chained levels.
    pub async fn render(
        &self,
        resource: &ResourceDefinition,
        doc: &Document,
        request: &ExpandRequest,
    ) -> Result<Map<String, Value>, ApiError> {
        let mut representation = resource.represent(doc);
        if request.paths.is_empty() {
            return Ok(representation);
        }

        let plan = ExpansionPlan::build(self.registry, resource, &request.paths)?;
        let lookups: Vec<Lookup<'_>> = plan.lookups(doc).collect();
        let resolved = join_all(
            lookups
                .iter()
                .map(|lookup| self.resolve(*lookup, request.strict)),
        )
        .await;

        for (lookup, value) in lookups.iter().zip(resolved) {
            write_back(&mut representation, lookup, value?);
        }
        Ok(representation)
    }

    fn resolve<'b>(&'b self, lookup: Lookup<'b>, strict: bool) -> BoxFuture<'b, Result<Value, ApiError>> {
        async move {
            let raw = Value::String(lookup.id.to_string());
            let Some(target) = self.registry.get(lookup.target) else {
                return degrade(raw, ApiError::not_found(lookup.target, lookup.id), strict);
            };
            match self.repo.find_by_id(target.name(), lookup.id).await {
                Ok(Some(doc)) if !is_visible(target, self.principal, &doc) => degrade(
                    raw,
                    ApiError::Unauthorized(format!("{} '{}' is not visible", target.name(), lookup.id)),
                    strict,
                ),
                Ok(Some(doc)) => {
                    let chained = ExpandRequest {
                        paths: lookup.chain.to_vec(),
                        strict,
                    };
                    self.render(target, &doc, &chained).await.map(Value::Object)
                }
                Ok(None) => degrade(raw, ApiError::not_found(target.name(), lookup.id), strict),
                Err(e) => degrade(raw, e.into(), strict),
            }
        }
        .boxed()
    }
}

/// A failed lookup keeps the raw identifier unless the caller demanded strict
/// expansion.
fn degrade(raw: Value, err: ApiError, strict: bool) -> Result<Value, ApiError> {
    if strict {
        return Err(err);
    }
    tracing::warn!(reference = %raw, error = %err, "expansion degraded to raw identifier");
    Ok(raw)
}

fn write_back(representation: &mut Map<String, Value>, lookup: &Lookup<'_>, value: Value) {
    let Some(slot) = get_path_mut(representation, lookup.location.segments()) else {
        return;
    };
    match (lookup.index, slot) {
        (None, slot) => *slot = value,
        (Some(i), Value::Array(items)) => {
            if let Some(item) = items.get_mut(i) {
                *item = value;
            }
        }
        (Some(_), _) => {}
    }
}

fn get_path_mut<'m>(fields: &'m mut Map<String, Value>, path: &[String]) -> Option<&'m mut Value> {
    let (first, rest) = path.split_first()?;
    let value = fields.get_mut(first)?;
    if rest.is_empty() {
        return Some(value);
    }
    match value {
        Value::Object(inner) => get_path_mut(inner, rest),
        _ => None,
    }
}
