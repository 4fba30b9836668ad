use utoipa::openapi::{
    ComponentsBuilder, OpenApi, OpenApiBuilder, Ref, RefOr, Required,
    content::ContentBuilder,
    info::InfoBuilder,
    path::{HttpMethod, OperationBuilder, ParameterBuilder, ParameterIn, PathItem, PathsBuilder},
    request_body::RequestBodyBuilder,
    response::ResponseBuilder,
    schema::{Array, KnownFormat, ObjectBuilder, Schema, SchemaFormat, Type},
    security::{HttpAuthScheme, HttpBuilder, SecurityRequirement, SecurityScheme},
};

use crate::{
    models::{FieldKind, FieldSpec},
    registry::ResourceDefinition,
    routes::{Endpoint, Operation, RouteGenerator},
};

const BEARER: &str = "bearer";

/// api_document
///
/// Builds the OpenAPI document for the generated routes at startup. Served
/// by Swagger UI at `/api-docs/openapi.json`.
pub fn api_document(routes: &RouteGenerator) -> OpenApi {
    let mut components = ComponentsBuilder::new().security_scheme(
        BEARER,
        SecurityScheme::Http(
            HttpBuilder::new()
                .scheme(HttpAuthScheme::Bearer)
                .bearer_format("JWT")
                .build(),
        ),
    );

    let mut documented: Vec<&str> = Vec::new();
    let mut paths = PathsBuilder::new();
    for endpoint in routes.endpoints() {
        let resource = &endpoint.resource;
        if !documented.contains(&resource.name()) {
            components = components.schema(resource.name(), resource_schema(resource));
            documented.push(resource.name());
        }
        let method = match endpoint.operation.method().as_str() {
            "POST" => HttpMethod::Post,
            "PUT" => HttpMethod::Put,
            "DELETE" => HttpMethod::Delete,
            _ => HttpMethod::Get,
        };
        paths = paths.path(&endpoint.path, PathItem::new(method, operation(endpoint)));
    }

    OpenApiBuilder::new()
        .info(
            InfoBuilder::new()
                .title("resource-router")
                .version(env!("CARGO_PKG_VERSION"))
                .description(Some("Generated CRUD routes for registered resources"))
                .build(),
        )
        .paths(paths.build())
        .components(Some(components.build()))
        .build()
}

fn operation(endpoint: &Endpoint) -> utoipa::openapi::path::Operation {
    let resource = &endpoint.resource;
    let mut op = OperationBuilder::new()
        .tag(resource.name())
        .operation_id(Some(format!("{}_{}", endpoint.operation.name(), resource.singular())))
        .summary(Some(summary(endpoint)));

    if endpoint.operation.targets_instance() || endpoint.scope.is_some() {
        op = op.parameter(
            ParameterBuilder::new()
                .name("id")
                .parameter_in(ParameterIn::Path)
                .required(Required::True)
                .schema(Some(uuid_schema()))
                .build(),
        );
    }

    if matches!(endpoint.operation, Operation::Read | Operation::ReadMany) {
        for (name, kind) in [("expand", Type::String), ("strictExpand", Type::Boolean)] {
            op = op.parameter(query_parameter(name, kind));
        }
    }
    if endpoint.operation == Operation::ReadMany {
        for (name, kind) in [("offset", Type::Integer), ("limit", Type::Integer), ("action", Type::String)] {
            op = op.parameter(query_parameter(name, kind));
        }
    }

    if matches!(
        endpoint.operation,
        Operation::Create | Operation::Update | Operation::PartialUpdate
    ) {
        op = op.request_body(Some(
            RequestBodyBuilder::new()
                .content(
                    "application/json",
                    ContentBuilder::new().schema(Some(schema_ref(resource.name()))).build(),
                )
                .required(Some(Required::True))
                .build(),
        ));
    }

    let (status, description) = match endpoint.operation {
        Operation::Create => ("201", "Created"),
        Operation::Delete => ("204", "Deleted"),
        _ => ("200", "Success"),
    };
    op = op
        .response(status, ResponseBuilder::new().description(description).build())
        .response("400", ResponseBuilder::new().description("VALIDATION_FAILED").build())
        .response("404", ResponseBuilder::new().description("NOT_FOUND").build());
    if endpoint.operation == Operation::Create {
        op = op.response("409", ResponseBuilder::new().description("ALREADY_EXISTS").build());
    }
    if endpoint.options.authenticate {
        op = op
            .security(SecurityRequirement::new(BEARER, Vec::<String>::new()))
            .response("401", ResponseBuilder::new().description("UNAUTHENTICATED").build());
    }
    op.build()
}

fn summary(endpoint: &Endpoint) -> String {
    let resource = endpoint.resource.name();
    let base = match endpoint.operation {
        Operation::Create => format!("Create a {resource}"),
        Operation::Read => format!("Read a {resource}"),
        Operation::ReadMany => format!("List {resource} instances"),
        Operation::Update => format!("Replace a {resource}"),
        Operation::PartialUpdate => format!("Partially update a {resource}"),
        Operation::Delete => format!("Delete a {resource}"),
    };
    match &endpoint.scope {
        Some(scope) => format!("{base} under a {}", scope.parent.name()),
        None => base,
    }
}

fn query_parameter(name: &str, kind: Type) -> utoipa::openapi::path::Parameter {
    ParameterBuilder::new()
        .name(name)
        .parameter_in(ParameterIn::Query)
        .required(Required::False)
        .schema(Some(RefOr::T(Schema::Object(ObjectBuilder::new().schema_type(kind).build()))))
        .build()
}

fn schema_ref(name: &str) -> RefOr<Schema> {
    RefOr::Ref(Ref::from_schema_name(name))
}

fn uuid_schema() -> RefOr<Schema> {
    RefOr::T(Schema::Object(
        ObjectBuilder::new()
            .schema_type(Type::String)
            .format(Some(SchemaFormat::KnownFormat(KnownFormat::Uuid)))
            .build(),
    ))
}

/// JSON schema of a resource's representation, derived from its fields.
fn resource_schema(resource: &ResourceDefinition) -> RefOr<Schema> {
    let mut object = ObjectBuilder::new()
        .property("id", uuid_schema())
        .property("timestampCreated", date_schema())
        .property("timestampUpdated", date_schema());
    for (name, spec) in resource.fields() {
        if !spec.private {
            object = object.property(name.as_str(), field_schema(spec));
        }
    }
    RefOr::T(Schema::Object(object.build()))
}

fn date_schema() -> RefOr<Schema> {
    RefOr::T(Schema::Object(
        ObjectBuilder::new()
            .schema_type(Type::String)
            .format(Some(SchemaFormat::KnownFormat(KnownFormat::DateTime)))
            .build(),
    ))
}

fn field_schema(spec: &FieldSpec) -> RefOr<Schema> {
    let primitive = |kind: Type| RefOr::T(Schema::Object(ObjectBuilder::new().schema_type(kind).build()));
    match &spec.kind {
        FieldKind::String => primitive(Type::String),
        FieldKind::Number => primitive(Type::Number),
        FieldKind::Boolean => primitive(Type::Boolean),
        FieldKind::Date => date_schema(),
        FieldKind::Reference(_) => uuid_schema(),
        FieldKind::ReferenceList(_) => RefOr::T(Schema::Array(Array::new(uuid_schema()))),
        FieldKind::Group(inner) => {
            let mut object = ObjectBuilder::new();
            for (name, spec) in inner.iter().filter(|(_, s)| !s.private) {
                object = object.property(name.as_str(), field_schema(spec));
            }
            RefOr::T(Schema::Object(object.build()))
        }
    }
}
