use crate::{
    actions::MeAction,
    models::{FieldPath, FieldSpec, ResourceSchema},
    registry::{RegistryError, ResourceRegistry},
    routes::{RouteGenerator, RouteOptions},
};

/// sample_api
///
/// The demo application served by the binary and exercised by the
/// integration tests.
///
/// * `Bar`: unique `name`, every CRUD route, no authentication.
/// * `User`: `email` plus a `name.first` / `name.last` group; public sign-up,
///   `GET /users?action=me`.
/// * `Foo`: owned by a user through its `user` reference; created and listed
///   under `/users/{id}/foos`.
/// * `Baz`: owned through `nested.user`, decided by its own policy; holds a
///   list of `Foo` references under `nested.foos`.
pub fn sample_api(api_path: &str) -> Result<(ResourceRegistry, RouteGenerator), RegistryError> {
    let mut registry = ResourceRegistry::new();
    let mut routes = RouteGenerator::new(api_path);

    let bar = registry.register("Bar", ResourceSchema::new().field("name", FieldSpec::string().unique()))?;
    routes
        .create(&bar, RouteOptions::new())?
        .delete(&bar, RouteOptions::new())?
        .partial_update(&bar, RouteOptions::new())?
        .read(&bar, RouteOptions::new())?
        .read_many(&bar, RouteOptions::new())?
        .update(&bar, RouteOptions::new())?;

    let user = registry.enable_auth(ResourceSchema::new().field(
        "name",
        FieldSpec::group(
            ResourceSchema::new()
                .field("first", FieldSpec::string())
                .field("last", FieldSpec::string()),
        ),
    ))?;
    routes
        .create(&user, RouteOptions::new())?
        .partial_update(&user, RouteOptions::authenticated())?
        .read_many(&user, RouteOptions::authenticated().action("me", MeAction))?;

    let foo = registry.register(
        "Foo",
        ResourceSchema::new()
            .field("user", FieldSpec::reference("User"))
            .field("name", FieldSpec::string()),
    )?;
    routes
        .read(&foo, RouteOptions::authenticated())?
        .delete(&foo, RouteOptions::authenticated())?
        .read_many_nested(&foo, &user, RouteOptions::authenticated())?
        .create_nested(&foo, &user, RouteOptions::authenticated())?;

    let baz = registry.register(
        "Baz",
        ResourceSchema::new()
            .field("name", FieldSpec::string())
            .field(
                "nested",
                FieldSpec::group(
                    ResourceSchema::new()
                        .field("user", FieldSpec::reference("User"))
                        .field("foos", FieldSpec::reference_list("Foo")),
                ),
            )
            .authorize_with(|principal, baz| {
                baz.reference(&FieldPath::parse("nested.user")) == Some(principal.id)
            }),
    )?;
    routes
        .create_nested(&baz, &user, RouteOptions::authenticated())?
        .read(&baz, RouteOptions::authenticated())?;

    Ok((registry, routes))
}
