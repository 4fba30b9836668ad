use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{FromRow, PgPool, query_builder::QueryBuilder, types::Json};
use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{Document, FieldPath, NewDocument, get_path, set_path};

/// RepositoryError
///
/// Failures reported by the persistence collaborator. Unique collisions are
/// the only ones the core can act on; everything else is passed through.
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("duplicate value for {resource}.{field}")]
    Duplicate { resource: String, field: String },

    #[error("{0}")]
    Upstream(String),
}

/// Filter
///
/// Equality conditions on field paths plus an offset/limit window.
/// Results are always ordered by creation time.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub conditions: Vec<(FieldPath, Value)>,
    pub offset: u64,
    pub limit: Option<u64>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn matching(mut self, path: FieldPath, value: Value) -> Self {
        self.conditions.push((path, value));
        self
    }

    pub fn page(mut self, offset: u64, limit: u64) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    fn accepts(&self, doc: &Document) -> bool {
        self.conditions
            .iter()
            .all(|(path, expected)| get_path(&doc.fields, path.segments()) == Some(expected))
    }
}

/// UpdateMode
///
/// `Replace` swaps the whole field map; `Merge` overwrites only the listed
/// top-level fields, so concurrent merges on different fields both survive.
#[derive(Debug, Clone)]
pub enum UpdateMode {
    Replace(Map<String, Value>),
    Merge(Map<String, Value>),
}

/// Repository Trait
///
/// The persistence collaborator. Every operation is a single-document atomic
/// step; the core never needs cross-document transactions.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Declares a resource and the field paths that must stay unique.
    async fn prepare(&self, resource: &str, unique: &[FieldPath]) -> Result<(), RepositoryError>;

    async fn insert(&self, resource: &str, doc: NewDocument) -> Result<Document, RepositoryError>;

    async fn find_by_id(&self, resource: &str, id: Uuid) -> Result<Option<Document>, RepositoryError>;

    async fn find(&self, resource: &str, filter: &Filter) -> Result<Vec<Document>, RepositoryError>;

    /// Applies `update` and moves `timestampUpdated` to `updated_at`, or one
    /// microsecond past the stored value if that is later. `None` if absent.
    async fn update_by_id(
        &self,
        resource: &str,
        id: Uuid,
        update: UpdateMode,
        updated_at: DateTime<Utc>,
    ) -> Result<Option<Document>, RepositoryError>;

    /// `false` if no such instance exists.
    async fn delete_by_id(&self, resource: &str, id: Uuid) -> Result<bool, RepositoryError>;

    /// Removes every stored instance of every resource.
    async fn clear(&self) -> Result<(), RepositoryError>;
}

/// RepositoryState
///
/// The concrete type used to share the persistence layer across the application state.
pub type RepositoryState = Arc<dyn Repository>;

fn bump(previous: DateTime<Utc>, requested: DateTime<Utc>) -> DateTime<Utc> {
    requested.max(previous + chrono::Duration::microseconds(1))
}

// --- In-Memory Implementation ---

#[derive(Default)]
struct Collection {
    unique: Vec<FieldPath>,
    documents: HashMap<Uuid, Document>,
    // Insertion order; breaks ties between equal creation timestamps.
    order: Vec<Uuid>,
}

impl Collection {
    /// The first unique path whose value in `fields` is held by another instance.
    fn conflict(&self, fields: &Map<String, Value>, except: Option<Uuid>) -> Option<&FieldPath> {
        self.unique.iter().find(|path| {
            let Some(candidate) = get_path(fields, path.segments()).filter(|v| !v.is_null())
            else {
                return false;
            };
            self.documents.values().any(|doc| {
                Some(doc.id) != except && get_path(&doc.fields, path.segments()) == Some(candidate)
            })
        })
    }
}

/// InMemoryRepository
///
/// Process-local store used for local development and the test suite. A single
/// lock serializes writes, which keeps unique checks and writes atomic.
#[derive(Default)]
pub struct InMemoryRepository {
    collections: RwLock<HashMap<String, Collection>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn prepare(&self, resource: &str, unique: &[FieldPath]) -> Result<(), RepositoryError> {
        let mut collections = self.collections.write().await;
        collections.entry(resource.to_string()).or_default().unique = unique.to_vec();
        Ok(())
    }

    async fn insert(&self, resource: &str, doc: NewDocument) -> Result<Document, RepositoryError> {
        let mut collections = self.collections.write().await;
        let collection = collections.entry(resource.to_string()).or_default();
        if let Some(path) = collection.conflict(&doc.fields, None) {
            return Err(RepositoryError::Duplicate {
                resource: resource.to_string(),
                field: path.to_string(),
            });
        }
        let stored = Document {
            id: doc.id,
            fields: doc.fields,
            timestamp_created: doc.created_at,
            timestamp_updated: doc.created_at,
        };
        collection.documents.insert(stored.id, stored.clone());
        collection.order.push(stored.id);
        Ok(stored)
    }

    async fn find_by_id(&self, resource: &str, id: Uuid) -> Result<Option<Document>, RepositoryError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(resource)
            .and_then(|c| c.documents.get(&id))
            .cloned())
    }

    async fn find(&self, resource: &str, filter: &Filter) -> Result<Vec<Document>, RepositoryError> {
        let collections = self.collections.read().await;
        let Some(collection) = collections.get(resource) else {
            return Ok(Vec::new());
        };
        let mut matched: Vec<&Document> = collection
            .order
            .iter()
            .filter_map(|id| collection.documents.get(id))
            .filter(|doc| filter.accepts(doc))
            .collect();
        matched.sort_by_key(|doc| doc.timestamp_created);

        let limit = filter.limit.map_or(usize::MAX, |l| l as usize);
        Ok(matched
            .into_iter()
            .skip(filter.offset as usize)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update_by_id(
        &self,
        resource: &str,
        id: Uuid,
        update: UpdateMode,
        updated_at: DateTime<Utc>,
    ) -> Result<Option<Document>, RepositoryError> {
        let mut collections = self.collections.write().await;
        let Some(collection) = collections.get_mut(resource) else {
            return Ok(None);
        };
        let Some(current) = collection.documents.get(&id) else {
            return Ok(None);
        };

        let mut fields = current.fields.clone();
        match update {
            UpdateMode::Replace(replacement) => fields = replacement,
            UpdateMode::Merge(patch) => fields.extend(patch),
        }
        if let Some(path) = collection.conflict(&fields, Some(id)) {
            return Err(RepositoryError::Duplicate {
                resource: resource.to_string(),
                field: path.to_string(),
            });
        }

        let Some(doc) = collection.documents.get_mut(&id) else {
            return Ok(None);
        };
        doc.fields = fields;
        doc.timestamp_updated = bump(doc.timestamp_updated, updated_at);
        Ok(Some(doc.clone()))
    }

    async fn delete_by_id(&self, resource: &str, id: Uuid) -> Result<bool, RepositoryError> {
        let mut collections = self.collections.write().await;
        let Some(collection) = collections.get_mut(resource) else {
            return Ok(false);
        };
        collection.order.retain(|kept| *kept != id);
        Ok(collection.documents.remove(&id).is_some())
    }

    async fn clear(&self) -> Result<(), RepositoryError> {
        let mut collections = self.collections.write().await;
        for collection in collections.values_mut() {
            collection.documents.clear();
            collection.order.clear();
        }
        Ok(())
    }
}

// --- Postgres Implementation ---

const CREATE_DOCUMENTS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS documents (
        resource TEXT NOT NULL,
        id UUID NOT NULL,
        fields JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (resource, id)
    )
"#;

const CREATE_LISTING_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS documents_listing_idx ON documents (resource, created_at, id)";

/// unique_index_name
///
/// Index name for a unique field path. Names are case-sensitive and joining
/// them can collide (`A` + `b_c` vs `A_b` + `c`), so the name is a v5 UUID of
/// `resource:path`. Fits Postgres' 63-byte identifier limit.
fn unique_index_name(resource: &str, path: &FieldPath) -> String {
    let key = format!("{resource}:{path}");
    format!(
        "documents_unique_{}",
        Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).simple()
    )
}

#[derive(FromRow)]
struct DocumentRow {
    id: Uuid,
    fields: Json<Map<String, Value>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<DocumentRow> for Document {
    fn from(row: DocumentRow) -> Self {
        Document {
            id: row.id,
            fields: row.fields.0,
            timestamp_created: row.created_at,
            timestamp_updated: row.updated_at,
        }
    }
}

/// PostgresRepository
///
/// Stores every resource in one JSONB `documents` table keyed by
/// `(resource, id)`. Unique fields become partial unique expression indexes,
/// so collisions are rejected atomically by the database.
pub struct PostgresRepository {
    pool: PgPool,
    // Unique index name -> field path, to report which field collided.
    constraints: StdRwLock<HashMap<String, String>>,
}

impl PostgresRepository {
    /// Creates a new repository instance using the initialized connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            constraints: StdRwLock::new(HashMap::new()),
        }
    }

    fn map_error(&self, resource: &str, err: sqlx::Error) -> RepositoryError {
        if let sqlx::Error::Database(db) = &err {
            if db.code().as_deref() == Some("23505") {
                let field = db
                    .constraint()
                    .and_then(|name| self.constraints.read().ok()?.get(name).cloned())
                    .unwrap_or_else(|| "unique field".to_string());
                return RepositoryError::Duplicate {
                    resource: resource.to_string(),
                    field,
                };
            }
        }
        tracing::error!(resource, "postgres error: {:?}", err);
        RepositoryError::Upstream(err.to_string())
    }
}

#[async_trait]
impl Repository for PostgresRepository {
    /// prepare
    ///
    /// Creates the shared table on first use and one unique index per unique
    /// field path. Resource and field names are restricted to
    /// `[A-Za-z][A-Za-z0-9_]*` by the registry, so they are safe to inline.
    async fn prepare(&self, resource: &str, unique: &[FieldPath]) -> Result<(), RepositoryError> {
        sqlx::query(CREATE_DOCUMENTS_TABLE)
            .execute(&self.pool)
            .await
            .map_err(|e| self.map_error(resource, e))?;
        sqlx::query(CREATE_LISTING_INDEX)
            .execute(&self.pool)
            .await
            .map_err(|e| self.map_error(resource, e))?;

        for path in unique {
            let index = unique_index_name(resource, path);
            let statement = format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {index} ON documents ((fields #>> '{{{}}}')) WHERE resource = '{resource}'",
                path.segments().join(",")
            );
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(|e| self.map_error(resource, e))?;
            if let Ok(mut constraints) = self.constraints.write() {
                constraints.insert(index, path.to_string());
            }
        }
        Ok(())
    }

    async fn insert(&self, resource: &str, doc: NewDocument) -> Result<Document, RepositoryError> {
        sqlx::query_as::<_, DocumentRow>(
            r#"INSERT INTO documents (resource, id, fields, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $4)
               RETURNING id, fields, created_at, updated_at"#,
        )
        .bind(resource)
        .bind(doc.id)
        .bind(Json(doc.fields))
        .bind(doc.created_at)
        .fetch_one(&self.pool)
        .await
        .map(Document::from)
        .map_err(|e| self.map_error(resource, e))
    }

    async fn find_by_id(&self, resource: &str, id: Uuid) -> Result<Option<Document>, RepositoryError> {
        sqlx::query_as::<_, DocumentRow>(
            r#"SELECT id, fields, created_at, updated_at
               FROM documents
               WHERE resource = $1 AND id = $2"#,
        )
        .bind(resource)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map(|row| row.map(Document::from))
        .map_err(|e| self.map_error(resource, e))
    }

    /// find
    ///
    /// Each equality condition becomes a JSONB containment test
    /// (`fields @> '{"nested": {"user": "..."}}'`), bound as a parameter.
    async fn find(&self, resource: &str, filter: &Filter) -> Result<Vec<Document>, RepositoryError> {
        let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
            "SELECT id, fields, created_at, updated_at FROM documents WHERE resource = ",
        );
        builder.push_bind(resource.to_string());

        for (path, value) in &filter.conditions {
            let mut containment = Map::new();
            set_path(&mut containment, path.segments(), value.clone());
            builder.push(" AND fields @> ");
            builder.push_bind(Json(Value::Object(containment)));
        }

        builder.push(" ORDER BY created_at ASC, id ASC");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ");
            builder.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }
        builder.push(" OFFSET ");
        builder.push_bind(i64::try_from(filter.offset).unwrap_or(i64::MAX));

        builder
            .build_query_as::<DocumentRow>()
            .fetch_all(&self.pool)
            .await
            .map(|rows| rows.into_iter().map(Document::from).collect())
            .map_err(|e| self.map_error(resource, e))
    }

    async fn update_by_id(
        &self,
        resource: &str,
        id: Uuid,
        update: UpdateMode,
        updated_at: DateTime<Utc>,
    ) -> Result<Option<Document>, RepositoryError> {
        let (statement, fields) = match update {
            UpdateMode::Replace(fields) => (
                r#"UPDATE documents
                   SET fields = $3,
                       updated_at = GREATEST($4, updated_at + interval '1 microsecond')
                   WHERE resource = $1 AND id = $2
                   RETURNING id, fields, created_at, updated_at"#,
                fields,
            ),
            UpdateMode::Merge(patch) => (
                r#"UPDATE documents
                   SET fields = fields || $3,
                       updated_at = GREATEST($4, updated_at + interval '1 microsecond')
                   WHERE resource = $1 AND id = $2
                   RETURNING id, fields, created_at, updated_at"#,
                patch,
            ),
        };

        sqlx::query_as::<_, DocumentRow>(statement)
            .bind(resource)
            .bind(id)
            .bind(Json(fields))
            .bind(updated_at)
            .fetch_optional(&self.pool)
            .await
            .map(|row| row.map(Document::from))
            .map_err(|e| self.map_error(resource, e))
    }

    async fn delete_by_id(&self, resource: &str, id: Uuid) -> Result<bool, RepositoryError> {
        sqlx::query("DELETE FROM documents WHERE resource = $1 AND id = $2")
            .bind(resource)
            .bind(id)
            .execute(&self.pool)
            .await
            .map(|res| res.rows_affected() > 0)
            .map_err(|e| self.map_error(resource, e))
    }

    async fn clear(&self) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM documents")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| self.map_error("*", e))
    }
}
