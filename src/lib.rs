/*!
`sqlmigrate` -- a framework-independent, multi-dialect database migration
engine.

This crate is the engine a command-line front-end or an embedding
application drives: it parses migration files into up/down sections,
reconciles a filesystem inventory against a database's applied-migrations
ledger, executes each section through a transactional or non-transactional
path, and hands dialect differences (identifier quoting, ledger storage,
schema dumping) off to a small driver capability set. PostgreSQL, MySQL,
SQLite and ClickHouse adapters are included behind cargo features; a
consumer with its own dialect registers a `driver::Driver` implementation
under a URL scheme with [`registry::register`].

```rust,no_run
# fn run() -> sqlmigrate::errors::Result<()> {
use sqlmigrate::driver::DriverConfig;
use sqlmigrate::engine::{Engine, EngineConfig};
use sqlmigrate::fs::RealFs;

sqlmigrate::drivers::register_builtin();

let config = DriverConfig {
    database_url: "sqlite://./app.db".to_owned(),
    migrations_table: "schema_migrations".to_owned(),
};
let driver = sqlmigrate::registry::resolve("sqlite")?(&config)?;
let fs = RealFs;
let engine_config = EngineConfig::new().migrations_dir("./db/migrations");
let engine = Engine::new(engine_config, &*driver, &fs);

engine.ensure_migrations_table()?;
let applied = engine.apply()?;
println!("applied {} migrations", applied.len());
# Ok(())
# }
```
*/

#[macro_use]
extern crate error_chain;
#[macro_use]
extern crate lazy_static;

pub mod dburl;
pub mod driver;
pub mod drivers;
pub mod dump;
pub mod engine;
pub mod errors;
pub mod fs;
pub mod inventory;
pub mod parser;
pub mod registry;
pub mod wait;

pub use driver::{Driver, DriverConfig};
pub use engine::{Engine, EngineConfig};
pub use errors::{Error, ErrorKind, Result};
