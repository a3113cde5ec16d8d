/*!
PostgreSQL driver

A `postgres::Client` connection, optional TLS via a root certificate
(`postgres-native-tls`). Only compiles under the `d-postgres` feature,
so the `postgres` crate is always available here.
*/
use std::cell::RefCell;
use std::fs;
use std::process::Command;

use postgres::{Client, NoTls};
use postgres_native_tls::MakeTlsConnector;

use crate::driver::{default_quote_identifier, Driver, DriverConfig, Executor, Transaction};
use crate::dburl::DatabaseUrl;
use crate::errors::*;

mod sql {
    pub static TABLE_EXISTS_TPL: &str =
        "select exists(select 1 from information_schema.tables where table_schema = {schema} and table_name = {name})";
    pub static CREATE_TABLE_TPL: &str = "create table if not exists {table}(version text primary key)";
    pub static SELECT_ALL_TPL: &str = "select version from {table} order by version asc";
    pub static SELECT_LIMIT_TPL: &str = "select version from {table} order by version desc limit $1";
    pub static INSERT_TPL: &str = "insert into {table} (version) values ($1)";
    pub static DELETE_TPL: &str = "delete from {table} where version = $1";
}

enum Conn {
    Plain(Client),
    Tls(Client),
}

impl Conn {
    fn client(&mut self) -> &mut Client {
        match self {
            Conn::Plain(c) => c,
            Conn::Tls(c) => c,
        }
    }
}

pub struct PostgresDriver {
    conn_str: String,
    database: String,
    table: String,
    conn: RefCell<Conn>,
}

impl std::fmt::Debug for PostgresDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresDriver")
            .field("database", &self.database)
            .field("table", &self.table)
            .finish()
    }
}

impl PostgresDriver {
    pub fn open(config: &DriverConfig) -> Result<Self> {
        let url = DatabaseUrl::parse(&config.database_url)?;
        let database = url.database().unwrap_or_default().to_owned();
        let conn = connect(&config.database_url, url.query_value("sslrootcert"))?;
        Ok(Self {
            conn_str: config.database_url.clone(),
            database,
            table: config.migrations_table.clone(),
            conn: RefCell::new(conn),
        })
    }

    fn table_parts(&self) -> (String, String) {
        match self.table.split_once('.') {
            Some((schema, name)) => (schema.to_owned(), name.to_owned()),
            None => ("public".to_owned(), self.table.clone()),
        }
    }

    fn table_ident(&self) -> String {
        self.table
            .split('.')
            .map(|part| default_quote_identifier(part, '"'))
            .collect::<Vec<_>>()
            .join(".")
    }
}

fn connect(conn_str: &str, sslrootcert: Option<String>) -> Result<Conn> {
    match sslrootcert {
        None => Ok(Conn::Plain(
            Client::connect(conn_str, NoTls).map_err(|e| Error::from(ErrorKind::Connectivity(e.to_string())))?,
        )),
        Some(cert_path) => {
            let cert_bytes = fs::read(&cert_path).chain_err(|| format!("failed reading sslrootcert at {}", cert_path))?;
            let cert = native_tls::Certificate::from_pem(&cert_bytes)
                .map_err(|e| Error::from(ErrorKind::Connectivity(format!("invalid sslrootcert: {}", e))))?;
            let connector = native_tls::TlsConnector::builder()
                .add_root_certificate(cert)
                .build()
                .map_err(|e| Error::from(ErrorKind::Connectivity(format!("tls connector build failed: {}", e))))?;
            let tls = MakeTlsConnector::new(connector);
            Ok(Conn::Tls(
                Client::connect(conn_str, tls).map_err(|e| Error::from(ErrorKind::Connectivity(e.to_string())))?,
            ))
        }
    }
}

/// Register the `postgres` and `postgresql` schemes with the process-wide registry.
pub fn register() {
    crate::registry::register("postgres", construct);
    crate::registry::register("postgresql", construct);
}

fn construct(config: &DriverConfig) -> Result<Box<dyn Driver>> {
    Ok(Box::new(PostgresDriver::open(config)?))
}

struct ClientExecutor<'a> {
    conn: &'a RefCell<Conn>,
}

impl<'a> Executor for ClientExecutor<'a> {
    fn exec(&mut self, query: &str) -> Result<()> {
        if query.trim().is_empty() {
            return Ok(());
        }
        self.conn
            .borrow_mut()
            .client()
            .batch_execute(query)
            .map_err(|e| query_error(query, None, e))
    }
}

// `postgres::Transaction<'_>` borrows its `Client` mutably for its whole
// lifetime, which doesn't fit a `&self`-based `Driver::begin`. Instead this
// issues BEGIN/COMMIT/ROLLBACK as plain statements against the same
// `RefCell<Conn>` every other executor uses, the same approach the sqlite
// adapter takes for the same reason.
struct PostgresDriverTransaction<'a> {
    conn: &'a RefCell<Conn>,
    finished: bool,
}

impl<'a> Executor for PostgresDriverTransaction<'a> {
    fn exec(&mut self, query: &str) -> Result<()> {
        if query.trim().is_empty() {
            return Ok(());
        }
        self.conn
            .borrow_mut()
            .client()
            .batch_execute(query)
            .map_err(|e| query_error(query, None, e))
    }
}

impl<'a> Transaction for PostgresDriverTransaction<'a> {
    fn commit(mut self: Box<Self>) -> Result<()> {
        self.finished = true;
        self.conn
            .borrow_mut()
            .client()
            .batch_execute("commit")
            .map_err(|e| Error::from(ErrorKind::Ledger(format!("postgres commit failed: {}", e))))
    }

    fn rollback(mut self: Box<Self>) -> Result<()> {
        self.finished = true;
        self.conn
            .borrow_mut()
            .client()
            .batch_execute("rollback")
            .map_err(|e| Error::from(ErrorKind::Ledger(format!("postgres rollback failed: {}", e))))
    }
}

impl<'a> Drop for PostgresDriverTransaction<'a> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.conn.borrow_mut().client().batch_execute("rollback");
        }
    }
}

impl Driver for PostgresDriver {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn ping(&self) -> Result<()> {
        self.conn
            .borrow_mut()
            .client()
            .simple_query("select 1")
            .map(|_| ())
            .map_err(|e| Error::from(ErrorKind::Connectivity(e.to_string())))
    }

    fn database_exists(&self) -> Result<bool> {
        let row = self
            .conn
            .borrow_mut()
            .client()
            .query_one("select exists(select 1 from pg_database where datname = $1)", &[&self.database])
            .map_err(|e| Error::from(ErrorKind::Connectivity(e.to_string())))?;
        Ok(row.get(0))
    }

    fn create_database(&self) -> Result<()> {
        let ident = default_quote_identifier(&self.database, '"');
        self.conn
            .borrow_mut()
            .client()
            .batch_execute(&format!("create database {}", ident))
            .map_err(|e| Error::from(ErrorKind::Ledger(format!("create database failed: {}", e))))
    }

    fn drop_database(&self) -> Result<()> {
        let ident = default_quote_identifier(&self.database, '"');
        self.conn
            .borrow_mut()
            .client()
            .batch_execute(&format!("drop database if exists {}", ident))
            .map_err(|e| Error::from(ErrorKind::Ledger(format!("drop database failed: {}", e))))
    }

    fn migrations_table_exists(&self) -> Result<bool> {
        let (schema, name) = self.table_parts();
        let query = sql::TABLE_EXISTS_TPL.replace("{schema}", "$1").replace("{name}", "$2");
        let row = self
            .conn
            .borrow_mut()
            .client()
            .query_one(&query, &[&schema, &name])
            .map_err(|e| query_error(&query, None, e))?;
        Ok(row.get(0))
    }

    fn create_migrations_table(&self) -> Result<()> {
        let query = sql::CREATE_TABLE_TPL.replace("{table}", &self.table_ident());
        self.conn
            .borrow_mut()
            .client()
            .batch_execute(&query)
            .map_err(|e| query_error(&query, None, e))
    }

    fn select_migrations(&self, limit: i64) -> Result<Vec<String>> {
        if limit < 0 {
            let query = sql::SELECT_ALL_TPL.replace("{table}", &self.table_ident());
            let rows = self
                .conn
                .borrow_mut()
                .client()
                .query(&query, &[])
                .map_err(|e| query_error(&query, None, e))?;
            Ok(rows.iter().map(|r| r.get(0)).collect())
        } else {
            let query = sql::SELECT_LIMIT_TPL.replace("{table}", &self.table_ident());
            let rows = self
                .conn
                .borrow_mut()
                .client()
                .query(&query, &[&limit])
                .map_err(|e| query_error(&query, None, e))?;
            Ok(rows.iter().map(|r| r.get(0)).collect())
        }
    }

    fn insert_migration(&self, executor: &mut dyn Executor, version: &str) -> Result<()> {
        let query = sql::INSERT_TPL.replace("{table}", &self.table_ident());
        executor.exec(&query.replace("$1", &quote_literal(version)))
    }

    fn delete_migration(&self, executor: &mut dyn Executor, version: &str) -> Result<()> {
        let query = sql::DELETE_TPL.replace("{table}", &self.table_ident());
        executor.exec(&query.replace("$1", &quote_literal(version)))
    }

    fn begin(&self) -> Result<Box<dyn Transaction + '_>> {
        self.conn
            .borrow_mut()
            .client()
            .batch_execute("begin")
            .map_err(|e| Error::from(ErrorKind::Ledger(format!("postgres begin failed: {}", e))))?;
        Ok(Box::new(PostgresDriverTransaction {
            conn: &self.conn,
            finished: false,
        }))
    }

    fn direct_executor(&self) -> Box<dyn Executor + '_> {
        Box::new(ClientExecutor { conn: &self.conn })
    }

    fn dump_schema(&self) -> Result<Vec<u8>> {
        let out = Command::new("pg_dump")
            .arg("--schema-only")
            .arg("--no-owner")
            .arg("--no-privileges")
            .arg(&self.conn_str)
            .output()
            .chain_err(|| "failed running `pg_dump`. Is it on your PATH?")?;
        if !out.status.success() {
            bail_fmt!(ErrorKind::Ledger, "pg_dump failed: {}", String::from_utf8_lossy(&out.stderr));
        }
        Ok(out.stdout)
    }

    fn load_schema(&self, sql: &str) -> Result<()> {
        self.conn
            .borrow_mut()
            .client()
            .batch_execute(sql)
            .map_err(|e| query_error(sql, None, e))
    }
}

fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Driver, DriverConfig, Executor};

    /// Requires a live server; skipped unless `POSTGRES_TEST_CONN_STR` is set.
    #[test]
    fn migration_table_and_ledger_roundtrip() {
        let conn_str = match std::env::var("POSTGRES_TEST_CONN_STR") {
            Ok(v) => v,
            Err(_) => {
                eprintln!("skipping: POSTGRES_TEST_CONN_STR not set");
                return;
            }
        };
        let config = DriverConfig {
            database_url: conn_str,
            migrations_table: "sqlmigrate_pg_test".to_owned(),
        };
        let driver = PostgresDriver::open(&config).unwrap();
        driver.direct_executor().exec("drop table if exists sqlmigrate_pg_test").unwrap();

        assert!(!driver.migrations_table_exists().unwrap());
        driver.create_migrations_table().unwrap();
        assert!(driver.migrations_table_exists().unwrap());

        let mut exec = driver.direct_executor();
        driver.insert_migration(&mut *exec, "1").unwrap();
        driver.insert_migration(&mut *exec, "2").unwrap();
        assert_eq!(driver.select_migrations(-1).unwrap(), vec!["1", "2"]);
        assert_eq!(driver.select_migrations(1).unwrap(), vec!["2"]);
        driver.delete_migration(&mut *exec, "2").unwrap();
        assert_eq!(driver.select_migrations(-1).unwrap(), vec!["1"]);

        driver.direct_executor().exec("drop table if exists sqlmigrate_pg_test").unwrap();
    }
}
