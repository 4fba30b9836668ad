use std::{collections::HashMap, fmt, sync::Arc};

use axum::{
    Router,
    body::Bytes,
    extract::{Path, Query, State, rejection::QueryRejection},
    http::Method,
    routing::{self, MethodRouter},
};

use crate::{
    AppState,
    actions::{Action, ActionHandle},
    auth::MaybePrincipal,
    handlers::{self, ReadQuery, read_query},
    models::FieldPath,
    registry::{RegistryError, ResourceHandle},
    validation::WriteMode,
};

/// Operation
///
/// The six CRUD operations a route can be generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Read,
    ReadMany,
    Update,
    PartialUpdate,
    Delete,
}

impl Operation {
    pub fn method(&self) -> Method {
        match self {
            Operation::Create | Operation::PartialUpdate => Method::POST,
            Operation::Read | Operation::ReadMany => Method::GET,
            Operation::Update => Method::PUT,
            Operation::Delete => Method::DELETE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Read => "read",
            Operation::ReadMany => "readMany",
            Operation::Update => "update",
            Operation::PartialUpdate => "partialUpdate",
            Operation::Delete => "delete",
        }
    }

    /// Whether the path addresses a single instance (`/{plural}/{id}`).
    pub fn targets_instance(&self) -> bool {
        !matches!(self, Operation::Create | Operation::ReadMany)
    }
}

/// RouteOptions
///
/// Per-route switches: whether a logged-in principal is required, and the
/// named actions a readMany route dispatches on `?action=<name>`.
#[derive(Clone, Default)]
pub struct RouteOptions {
    pub authenticate: bool,
    actions: HashMap<String, ActionHandle>,
}

impl RouteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn authenticated() -> Self {
        Self {
            authenticate: true,
            ..Self::default()
        }
    }

    pub fn action<A: Action + 'static>(mut self, name: &str, action: A) -> Self {
        self.actions.insert(name.to_string(), Arc::new(action));
        self
    }

    pub fn find_action(&self, name: &str) -> Option<&ActionHandle> {
        self.actions.get(name)
    }

    pub fn action_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for RouteOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteOptions")
            .field("authenticate", &self.authenticate)
            .field("actions", &self.action_names())
            .finish()
    }
}

/// The parent of a nested route and the field recording it.
#[derive(Debug, Clone)]
pub struct Scope {
    pub parent: ResourceHandle,
    pub field: FieldPath,
}

/// Endpoint
///
/// One generated route: what it does, for which resource, and where it is mounted.
#[derive(Debug)]
pub struct Endpoint {
    pub operation: Operation,
    pub resource: ResourceHandle,
    pub scope: Option<Scope>,
    pub options: RouteOptions,
    pub path: String,
}

/// RouteGenerator
///
/// Declares routes for registered resources and turns them into an axum
/// router. Paths follow `{api}/{plural}` and `{api}/{plural}/{id}`; nested
/// routes are mounted under `{api}/{parentPlural}/{id}/{plural}`.
#[derive(Debug)]
pub struct RouteGenerator {
    api_path: String,
    endpoints: Vec<Arc<Endpoint>>,
}

impl RouteGenerator {
    pub fn new(api_path: &str) -> Self {
        Self {
            api_path: api_path.trim_end_matches('/').to_string(),
            endpoints: Vec::new(),
        }
    }

    pub fn api_path(&self) -> &str {
        &self.api_path
    }

    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    pub fn create(&mut self, resource: &ResourceHandle, options: RouteOptions) -> Result<&mut Self, RegistryError> {
        self.add(Operation::Create, resource, None, options)
    }

    /// Create under a parent: `POST {api}/{parentPlural}/{id}/{plural}`.
    pub fn create_nested(
        &mut self,
        resource: &ResourceHandle,
        parent: &ResourceHandle,
        options: RouteOptions,
    ) -> Result<&mut Self, RegistryError> {
        self.add(Operation::Create, resource, Some(parent), options)
    }

    pub fn read(&mut self, resource: &ResourceHandle, options: RouteOptions) -> Result<&mut Self, RegistryError> {
        self.add(Operation::Read, resource, None, options)
    }

    pub fn read_many(&mut self, resource: &ResourceHandle, options: RouteOptions) -> Result<&mut Self, RegistryError> {
        self.add(Operation::ReadMany, resource, None, options)
    }

    /// List a parent's instances: `GET {api}/{parentPlural}/{id}/{plural}`.
    pub fn read_many_nested(
        &mut self,
        resource: &ResourceHandle,
        parent: &ResourceHandle,
        options: RouteOptions,
    ) -> Result<&mut Self, RegistryError> {
        self.add(Operation::ReadMany, resource, Some(parent), options)
    }

    pub fn update(&mut self, resource: &ResourceHandle, options: RouteOptions) -> Result<&mut Self, RegistryError> {
        self.add(Operation::Update, resource, None, options)
    }

    pub fn partial_update(
        &mut self,
        resource: &ResourceHandle,
        options: RouteOptions,
    ) -> Result<&mut Self, RegistryError> {
        self.add(Operation::PartialUpdate, resource, None, options)
    }

    pub fn delete(&mut self, resource: &ResourceHandle, options: RouteOptions) -> Result<&mut Self, RegistryError> {
        self.add(Operation::Delete, resource, None, options)
    }

    fn add(
        &mut self,
        operation: Operation,
        resource: &ResourceHandle,
        parent: Option<&ResourceHandle>,
        options: RouteOptions,
    ) -> Result<&mut Self, RegistryError> {
        let scope = match parent {
            Some(parent) => {
                let field = resource
                    .scope_field(parent.name())
                    .ok_or_else(|| RegistryError::NoScopeField {
                        resource: resource.name().to_string(),
                        parent: parent.name().to_string(),
                    })?;
                Some(Scope {
                    parent: parent.clone(),
                    field,
                })
            }
            None => None,
        };

        let path = match (&scope, operation.targets_instance()) {
            (Some(scope), _) => format!("{}/{}/{{id}}/{}", self.api_path, scope.parent.plural(), resource.plural()),
            (None, true) => format!("{}/{}/{{id}}", self.api_path, resource.plural()),
            (None, false) => format!("{}/{}", self.api_path, resource.plural()),
        };

        let method = operation.method();
        if self
            .endpoints
            .iter()
            .any(|e| e.path == path && e.operation.method() == method)
        {
            return Err(RegistryError::DuplicateRoute {
                method: method.to_string(),
                path,
            });
        }

        tracing::debug!(%method, %path, operation = operation.name(), "generated route");
        self.endpoints.push(Arc::new(Endpoint {
            operation,
            resource: resource.clone(),
            scope,
            options,
            path,
        }));
        Ok(self)
    }

    /// router
    ///
    /// One axum route per distinct path, with every declared method attached.
    pub fn router(&self) -> Router<AppState> {
        let mut by_path: Vec<(&str, Vec<Arc<Endpoint>>)> = Vec::new();
        for endpoint in &self.endpoints {
            match by_path.iter_mut().find(|(path, _)| *path == endpoint.path) {
                Some((_, group)) => group.push(endpoint.clone()),
                None => by_path.push((&endpoint.path, vec![endpoint.clone()])),
            }
        }

        by_path.into_iter().fold(Router::new(), |router, (path, group)| {
            match group.into_iter().map(method_router).reduce(MethodRouter::merge) {
                Some(handler) => router.route(path, handler),
                None => router,
            }
        })
    }
}

fn method_router(endpoint: Arc<Endpoint>) -> MethodRouter<AppState> {
    match (endpoint.operation, endpoint.scope.is_some()) {
        (Operation::Create, false) => routing::post(
            move |State(state): State<AppState>, MaybePrincipal(principal): MaybePrincipal, body: Bytes| {
                let endpoint = endpoint.clone();
                async move { handlers::create(&state, &endpoint, principal, None, &body).await }
            },
        ),
        (Operation::Create, true) => routing::post(
            move |State(state): State<AppState>,
                  MaybePrincipal(principal): MaybePrincipal,
                  Path(parent_id): Path<String>,
                  body: Bytes| {
                let endpoint = endpoint.clone();
                async move { handlers::create(&state, &endpoint, principal, Some(&parent_id), &body).await }
            },
        ),
        (Operation::Read, _) => routing::get(
            move |State(state): State<AppState>,
                  MaybePrincipal(principal): MaybePrincipal,
                  Path(id): Path<String>,
                  query: Result<Query<ReadQuery>, QueryRejection>| {
                let endpoint = endpoint.clone();
                async move { handlers::read(&state, &endpoint, principal, &id, read_query(query)?).await }
            },
        ),
        (Operation::ReadMany, false) => routing::get(
            move |State(state): State<AppState>,
                  MaybePrincipal(principal): MaybePrincipal,
                  query: Result<Query<ReadQuery>, QueryRejection>| {
                let endpoint = endpoint.clone();
                async move { handlers::read_many(&state, &endpoint, principal, None, read_query(query)?).await }
            },
        ),
        (Operation::ReadMany, true) => routing::get(
            move |State(state): State<AppState>,
                  MaybePrincipal(principal): MaybePrincipal,
                  Path(parent_id): Path<String>,
                  query: Result<Query<ReadQuery>, QueryRejection>| {
                let endpoint = endpoint.clone();
                async move {
                    handlers::read_many(&state, &endpoint, principal, Some(&parent_id), read_query(query)?).await
                }
            },
        ),
        (Operation::Update, _) => routing::put(
            move |State(state): State<AppState>,
                  MaybePrincipal(principal): MaybePrincipal,
                  Path(id): Path<String>,
                  body: Bytes| {
                let endpoint = endpoint.clone();
                async move { handlers::update(&state, &endpoint, principal, &id, &body, WriteMode::Replace).await }
            },
        ),
        (Operation::PartialUpdate, _) => routing::post(
            move |State(state): State<AppState>,
                  MaybePrincipal(principal): MaybePrincipal,
                  Path(id): Path<String>,
                  body: Bytes| {
                let endpoint = endpoint.clone();
                async move { handlers::update(&state, &endpoint, principal, &id, &body, WriteMode::Merge).await }
            },
        ),
        (Operation::Delete, _) => routing::delete(
            move |State(state): State<AppState>,
                  MaybePrincipal(principal): MaybePrincipal,
                  Path(id): Path<String>| {
                let endpoint = endpoint.clone();
                async move { handlers::delete(&state, &endpoint, principal, &id).await }
            },
        ),
    }
}
