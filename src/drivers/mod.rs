/*!
Dialect adapters

Each submodule implements `crate::driver::Driver` for one dialect, gated
behind its own cargo feature so a consumer only links the client library
for the dialects they actually use. `register_builtin` registers every
dialect compiled into this build with the process-wide registry
(`crate::registry`); a consumer who only wants a subset can instead call
the individual `register` function for just the schemes they need.
*/

#[cfg(feature = "d-postgres")]
pub mod postgres;

#[cfg(feature = "d-mysql")]
pub mod mysql;

#[cfg(feature = "d-sqlite")]
pub mod sqlite;

#[cfg(feature = "d-clickhouse")]
pub mod clickhouse;

/// Register every dialect compiled into this build (controlled by cargo
/// features) with the process-wide driver registry. Call this once, before
/// resolving any URL, the way a CLI front-end's `main` would.
pub fn register_builtin() {
    #[cfg(feature = "d-postgres")]
    postgres::register();

    #[cfg(feature = "d-mysql")]
    mysql::register();

    #[cfg(feature = "d-sqlite")]
    sqlite::register();

    #[cfg(feature = "d-clickhouse")]
    clickhouse::register();
}
