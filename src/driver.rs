/*!
Driver capability set

Every dialect adapter (`crate::drivers::postgres`, `::mysql`, `::sqlite`,
`::clickhouse`) implements this trait. The engine never matches on a
concrete dialect; it only calls through `&dyn Driver`, obtained from the
registry by URL scheme.

Ledger mutation (`insert_migration`/`delete_migration`) is expressed
against `&mut dyn Executor` rather than a concrete connection type, so the
exact same call works whether it participates in an open transaction or
runs directly against the connection -- satisfied by both the boxed
`Transaction` a driver hands back from `begin()` and the bare executor it
hands back from `direct_executor()`.
*/
use std::fmt;

use crate::errors::*;

/// Configuration handed to a driver constructor by the registry.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub database_url: String,
    pub migrations_table: String,
}

/// Something a statement can be run against: an open connection, or an
/// open transaction on one.
pub trait Executor {
    fn exec(&mut self, query: &str) -> Result<()>;
}

/// A started transaction. Object-safe `commit`/`rollback` take `Box<Self>`
/// so the engine can consume the transaction on either exit path without
/// the driver needing a `Drop`-based rollback-by-default (which would mask
/// double-rollback/double-commit bugs rather than surface them).
pub trait Transaction: Executor {
    fn commit(self: Box<Self>) -> Result<()>;
    fn rollback(self: Box<Self>) -> Result<()>;
}

/// The capability set every dialect adapter exposes.
pub trait Driver: fmt::Debug {
    /// Scheme this driver answers to in the registry (e.g. `"postgres"`).
    fn name(&self) -> &'static str;

    /// Probe connectivity. Must not create the application database.
    fn ping(&self) -> Result<()>;

    /// Whether the configured database exists. For dialects without an
    /// "administrative" connection concept, may simply report the result
    /// of `ping`.
    fn database_exists(&self) -> Result<bool>;

    /// Create the configured database. Dialects that can't (Spanner,
    /// BigQuery, managed ClickHouse) return `ErrorKind::Unsupported` with
    /// instructions for external tooling rather than panicking.
    fn create_database(&self) -> Result<()>;

    /// Drop the configured database. Idempotent when the dialect allows it.
    fn drop_database(&self) -> Result<()>;

    /// Whether the ledger table exists, consulting the dialect's catalog.
    fn migrations_table_exists(&self) -> Result<bool>;

    /// Create the ledger table. Idempotent; may also create an owning
    /// schema first when the table name is schema-qualified.
    fn create_migrations_table(&self) -> Result<()>;

    /// Every version recorded in the ledger. `limit < 0` means unlimited;
    /// when limited, rows come back ordered by version descending (used by
    /// rollback to find the most recently applied version).
    fn select_migrations(&self, limit: i64) -> Result<Vec<String>>;

    /// Insert one ledger row through `executor` -- either an open
    /// transaction or the driver's direct connection.
    fn insert_migration(&self, executor: &mut dyn Executor, version: &str) -> Result<()>;

    /// Delete one ledger row. Symmetric with `insert_migration`.
    fn delete_migration(&self, executor: &mut dyn Executor, version: &str) -> Result<()>;

    /// Start a transaction for a `transaction:true` section. Dialects with
    /// no transactional DDL support (ClickHouse, Spanner, BigQuery) return
    /// `ErrorKind::Unsupported`; the engine does not auto-downgrade a
    /// section that requested a transaction -- the migration author must
    /// declare `transaction:false` explicitly.
    fn begin(&self) -> Result<Box<dyn Transaction + '_>>;

    /// An executor that runs directly against the driver's own connection,
    /// for `transaction:false` sections and for the trailing ledger write
    /// that follows them.
    fn direct_executor(&self) -> Box<dyn Executor + '_>;

    /// Produce a textual schema dump (DDL only; the ledger snapshot block
    /// is appended by `crate::dump`, not by the driver).
    fn dump_schema(&self) -> Result<Vec<u8>>;

    /// Execute a raw SQL script against the connection, with no section
    /// parsing -- used by `load` to replay a schema file.
    fn load_schema(&self, sql: &str) -> Result<()>;

    /// Quote `ident` per the dialect's identifier-quoting rules, only when
    /// quoting is actually required, so that stable identifiers don't grow
    /// needless quotes in schema dumps.
    fn quote_identifier(&self, ident: &str) -> String {
        default_quote_identifier(ident, '"')
    }
}

/// Default ANSI-ish identifier quoting: double the quote character,
/// quote only when the identifier isn't a bare lowercase/digit/underscore
/// token starting with a letter or underscore.
pub fn default_quote_identifier(ident: &str, quote: char) -> String {
    if is_bare_identifier(ident) {
        return ident.to_owned();
    }
    let escaped = ident.replace(quote, &format!("{}{}", quote, quote));
    format!("{}{}{}", quote, escaped, quote)
}

fn is_bare_identifier(ident: &str) -> bool {
    let mut chars = ident.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Constructs a boxed driver from a `DriverConfig`. This is the type stored
/// in the registry, keyed by URL scheme.
pub type DriverConstructor = fn(&DriverConfig) -> Result<Box<dyn Driver>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_only_when_needed() {
        assert_eq!(default_quote_identifier("users", '"'), "users");
        assert_eq!(default_quote_identifier("User Table", '"'), "\"User Table\"");
        assert_eq!(default_quote_identifier("select", '"'), "select"); // reserved-word status isn't checked
        assert_eq!(default_quote_identifier("with\"quote", '"'), "\"with\"\"quote\"");
    }
}
