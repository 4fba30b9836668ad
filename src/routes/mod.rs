/// Router Module Index
///
/// Generated resource routes live in `generator`; the fixed routes are split
/// by who may reach them.

/// CRUD route generation for registered resources.
pub mod generator;

/// Liveness and other routes that exist in every environment.
pub mod public;

/// Helpers for test suites. Mounted only in `Env::Local`.
pub mod testing;

pub use generator::{Endpoint, Operation, RouteGenerator, RouteOptions, Scope};
