/*!
Driver registry

A process-wide, append-only mapping from URL scheme to driver constructor.
Population happens explicitly -- callers import the dialect modules they
want and call `register` for each, or call `crate::drivers::register_builtin`
to register every dialect compiled into this build -- there is no implicit
auto-registration mechanism. Lookup resolves a scheme to a constructor; the
registry is otherwise never mutated after program start.
*/
use std::collections::HashMap;
use std::sync::Mutex;

use crate::driver::DriverConstructor;
use crate::errors::*;

lazy_static! {
    static ref REGISTRY: Mutex<HashMap<&'static str, DriverConstructor>> = Mutex::new(HashMap::new());
}

/// Register a driver constructor for a URL scheme. Re-registering the same
/// scheme overwrites the previous constructor; this is intentional (it
/// lets a consumer swap in a test double for a scheme without forking the
/// registry), not an error.
pub fn register(scheme: &'static str, constructor: DriverConstructor) {
    REGISTRY
        .lock()
        .expect("sqlmigrate driver registry mutex poisoned")
        .insert(scheme, constructor);
}

/// Resolve a URL scheme to its registered driver constructor.
pub fn resolve(scheme: &str) -> Result<DriverConstructor> {
    REGISTRY
        .lock()
        .expect("sqlmigrate driver registry mutex poisoned")
        .get(scheme)
        .copied()
        .ok_or_else(|| Error::from(ErrorKind::Config(format!("no driver registered for scheme `{}`", scheme))))
}

/// Every scheme currently registered, for diagnostics.
pub fn registered_schemes() -> Vec<&'static str> {
    let mut schemes: Vec<&'static str> = REGISTRY
        .lock()
        .expect("sqlmigrate driver registry mutex poisoned")
        .keys()
        .copied()
        .collect();
    schemes.sort_unstable();
    schemes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Driver, DriverConfig, Executor, Transaction};

    #[derive(Debug)]
    struct FakeDriver;
    impl Driver for FakeDriver {
        fn name(&self) -> &'static str {
            "fake"
        }
        fn ping(&self) -> Result<()> {
            Ok(())
        }
        fn database_exists(&self) -> Result<bool> {
            Ok(true)
        }
        fn create_database(&self) -> Result<()> {
            Ok(())
        }
        fn drop_database(&self) -> Result<()> {
            Ok(())
        }
        fn migrations_table_exists(&self) -> Result<bool> {
            Ok(true)
        }
        fn create_migrations_table(&self) -> Result<()> {
            Ok(())
        }
        fn select_migrations(&self, _limit: i64) -> Result<Vec<String>> {
            Ok(vec![])
        }
        fn insert_migration(&self, _executor: &mut dyn Executor, _version: &str) -> Result<()> {
            Ok(())
        }
        fn delete_migration(&self, _executor: &mut dyn Executor, _version: &str) -> Result<()> {
            Ok(())
        }
        fn begin(&self) -> Result<Box<dyn Transaction + '_>> {
            unimplemented!()
        }
        fn direct_executor(&self) -> Box<dyn Executor + '_> {
            unimplemented!()
        }
        fn dump_schema(&self) -> Result<Vec<u8>> {
            Ok(vec![])
        }
        fn load_schema(&self, _sql: &str) -> Result<()> {
            Ok(())
        }
    }

    fn construct(_cfg: &DriverConfig) -> Result<Box<dyn Driver>> {
        Ok(Box::new(FakeDriver))
    }

    #[test]
    fn register_and_resolve_roundtrip() {
        register("fake-test-scheme", construct);
        let ctor = resolve("fake-test-scheme").unwrap();
        let cfg = DriverConfig {
            database_url: "fake-test-scheme://x".to_owned(),
            migrations_table: "schema_migrations".to_owned(),
        };
        let driver = ctor(&cfg).unwrap();
        assert_eq!(driver.name(), "fake");
    }

    #[test]
    fn resolve_unknown_scheme_errors() {
        assert!(resolve("no-such-scheme-xyz").is_err());
    }
}
