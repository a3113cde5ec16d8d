/*!
MySQL driver

Connection built from `mysql::Opts::from_url`, `query_drop`/`exec_drop`
for statements. Only compiles under the `d-mysql` feature, so `mysql`
is always available here.
*/
use std::cell::RefCell;
use std::process::Command;

use mysql::prelude::*;
use mysql::{Conn, Opts};

use crate::driver::{default_quote_identifier, Driver, DriverConfig, Executor, Transaction};
use crate::dburl::DatabaseUrl;
use crate::errors::*;

mod sql {
    pub static TABLE_EXISTS_TPL: &str =
        "select count(*) from information_schema.tables where table_schema = ? and table_name = ?";
    pub static CREATE_TABLE_TPL: &str = "create table if not exists {table}(version varchar(255) primary key)";
    pub static SELECT_ALL_TPL: &str = "select version from {table} order by version asc";
    pub static SELECT_LIMIT_TPL: &str = "select version from {table} order by version desc limit ?";
    pub static INSERT_TPL: &str = "insert into {table} (version) values (?)";
    pub static DELETE_TPL: &str = "delete from {table} where version = ?";
}

pub struct MysqlDriver {
    database: String,
    table: String,
    conn: RefCell<Conn>,
}

impl std::fmt::Debug for MysqlDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MysqlDriver")
            .field("database", &self.database)
            .field("table", &self.table)
            .finish()
    }
}

impl MysqlDriver {
    pub fn open(config: &DriverConfig) -> Result<Self> {
        let url = DatabaseUrl::parse(&config.database_url)?;
        let database = url.database().unwrap_or_default().to_owned();
        let opts = Opts::from_url(&config.database_url).chain_err(|| "failed parsing mysql connection string")?;
        let conn = Conn::new(opts).map_err(|e| Error::from(ErrorKind::Connectivity(e.to_string())))?;
        Ok(Self {
            database,
            table: config.migrations_table.clone(),
            conn: RefCell::new(conn),
        })
    }

    fn table_ident(&self) -> String {
        self.table
            .split('.')
            .map(|part| default_quote_identifier(part, '`'))
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Split a (possibly schema-qualified) migrations table name into
    /// `(schema, name)`, defaulting the schema to the connected database
    /// when unqualified -- mirroring `PostgresDriver::table_parts`, except
    /// MySQL has no fixed default schema like `public` to fall back on, so
    /// the connected database stands in for it.
    fn table_parts(&self) -> (String, String) {
        match self.table.split_once('.') {
            Some((schema, name)) => (schema.to_owned(), name.to_owned()),
            None => (self.database.clone(), self.table.clone()),
        }
    }
}

/// Register the `mysql` scheme with the process-wide registry.
pub fn register() {
    crate::registry::register("mysql", construct);
}

fn construct(config: &DriverConfig) -> Result<Box<dyn Driver>> {
    Ok(Box::new(MysqlDriver::open(config)?))
}

struct ConnExecutor<'a> {
    conn: &'a RefCell<Conn>,
}

impl<'a> Executor for ConnExecutor<'a> {
    fn exec(&mut self, query: &str) -> Result<()> {
        if query.trim().is_empty() {
            return Ok(());
        }
        self.conn
            .borrow_mut()
            .query_drop(query)
            .map_err(|e| query_error(query, None, e))
    }
}

// mysql::Transaction<'_> borrows its Conn mutably for its whole lifetime,
// which doesn't fit a &self-based Driver::begin. Plain START
// TRANSACTION/COMMIT/ROLLBACK statements against the same RefCell<Conn>
// every other executor uses sidestep that, mirroring the sqlite and
// postgres adapters.
struct MysqlDriverTransaction<'a> {
    conn: &'a RefCell<Conn>,
    finished: bool,
}

impl<'a> Executor for MysqlDriverTransaction<'a> {
    fn exec(&mut self, query: &str) -> Result<()> {
        if query.trim().is_empty() {
            return Ok(());
        }
        self.conn
            .borrow_mut()
            .query_drop(query)
            .map_err(|e| query_error(query, None, e))
    }
}

impl<'a> Transaction for MysqlDriverTransaction<'a> {
    fn commit(mut self: Box<Self>) -> Result<()> {
        self.finished = true;
        self.conn
            .borrow_mut()
            .query_drop("commit")
            .map_err(|e| Error::from(ErrorKind::Ledger(format!("mysql commit failed: {}", e))))
    }

    fn rollback(mut self: Box<Self>) -> Result<()> {
        self.finished = true;
        self.conn
            .borrow_mut()
            .query_drop("rollback")
            .map_err(|e| Error::from(ErrorKind::Ledger(format!("mysql rollback failed: {}", e))))
    }
}

impl<'a> Drop for MysqlDriverTransaction<'a> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.conn.borrow_mut().query_drop("rollback");
        }
    }
}

impl Driver for MysqlDriver {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn ping(&self) -> Result<()> {
        self.conn
            .borrow_mut()
            .query_drop("select 1")
            .map_err(|e| Error::from(ErrorKind::Connectivity(e.to_string())))
    }

    fn database_exists(&self) -> Result<bool> {
        let count: u64 = self
            .conn
            .borrow_mut()
            .exec_first("select count(*) from information_schema.schemata where schema_name = ?", (&self.database,))
            .map_err(|e| Error::from(ErrorKind::Connectivity(e.to_string())))?
            .unwrap_or(0);
        Ok(count > 0)
    }

    fn create_database(&self) -> Result<()> {
        let ident = default_quote_identifier(&self.database, '`');
        self.conn
            .borrow_mut()
            .query_drop(format!("create database if not exists {}", ident))
            .map_err(|e| Error::from(ErrorKind::Ledger(format!("create database failed: {}", e))))
    }

    fn drop_database(&self) -> Result<()> {
        let ident = default_quote_identifier(&self.database, '`');
        self.conn
            .borrow_mut()
            .query_drop(format!("drop database if exists {}", ident))
            .map_err(|e| Error::from(ErrorKind::Ledger(format!("drop database failed: {}", e))))
    }

    fn migrations_table_exists(&self) -> Result<bool> {
        let (schema, name) = self.table_parts();
        let count: u64 = self
            .conn
            .borrow_mut()
            .exec_first(sql::TABLE_EXISTS_TPL, (&schema, &name))
            .map_err(|e| query_error(sql::TABLE_EXISTS_TPL, None, e))?
            .unwrap_or(0);
        Ok(count > 0)
    }

    fn create_migrations_table(&self) -> Result<()> {
        let query = sql::CREATE_TABLE_TPL.replace("{table}", &self.table_ident());
        self.conn
            .borrow_mut()
            .query_drop(&query)
            .map_err(|e| query_error(&query, None, e))
    }

    fn select_migrations(&self, limit: i64) -> Result<Vec<String>> {
        let mut conn = self.conn.borrow_mut();
        if limit < 0 {
            let query = sql::SELECT_ALL_TPL.replace("{table}", &self.table_ident());
            conn.query(&query).map_err(|e| query_error(&query, None, e))
        } else {
            let query = sql::SELECT_LIMIT_TPL.replace("{table}", &self.table_ident());
            conn.exec(&query, (limit,)).map_err(|e| query_error(&query, None, e))
        }
    }

    fn insert_migration(&self, executor: &mut dyn Executor, version: &str) -> Result<()> {
        let query = sql::INSERT_TPL.replace("{table}", &self.table_ident());
        executor.exec(&query.replace('?', &quote_literal(version)))
    }

    fn delete_migration(&self, executor: &mut dyn Executor, version: &str) -> Result<()> {
        let query = sql::DELETE_TPL.replace("{table}", &self.table_ident());
        executor.exec(&query.replace('?', &quote_literal(version)))
    }

    fn begin(&self) -> Result<Box<dyn Transaction + '_>> {
        self.conn
            .borrow_mut()
            .query_drop("start transaction")
            .map_err(|e| Error::from(ErrorKind::Ledger(format!("mysql begin failed: {}", e))))?;
        Ok(Box::new(MysqlDriverTransaction {
            conn: &self.conn,
            finished: false,
        }))
    }

    fn direct_executor(&self) -> Box<dyn Executor + '_> {
        Box::new(ConnExecutor { conn: &self.conn })
    }

    fn dump_schema(&self) -> Result<Vec<u8>> {
        let out = Command::new("mysqldump")
            .arg("--no-data")
            .arg("--skip-comments")
            .arg(&self.database)
            .output()
            .chain_err(|| "failed running `mysqldump`. Is it on your PATH?")?;
        if !out.status.success() {
            bail_fmt!(ErrorKind::Ledger, "mysqldump failed: {}", String::from_utf8_lossy(&out.stderr));
        }
        Ok(out.stdout)
    }

    fn load_schema(&self, sql: &str) -> Result<()> {
        self.conn
            .borrow_mut()
            .query_drop(sql)
            .map_err(|e| query_error(sql, None, e))
    }

    fn quote_identifier(&self, ident: &str) -> String {
        default_quote_identifier(ident, '`')
    }
}

fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Driver, DriverConfig, Executor};

    /// Requires a live server; skipped unless `MYSQL_TEST_CONN_STR` is set.
    #[test]
    fn migration_table_and_ledger_roundtrip() {
        let conn_str = match std::env::var("MYSQL_TEST_CONN_STR") {
            Ok(v) => v,
            Err(_) => {
                eprintln!("skipping: MYSQL_TEST_CONN_STR not set");
                return;
            }
        };
        let config = DriverConfig {
            database_url: conn_str,
            migrations_table: "sqlmigrate_mysql_test".to_owned(),
        };
        let driver = MysqlDriver::open(&config).unwrap();
        driver
            .direct_executor()
            .exec("drop table if exists sqlmigrate_mysql_test")
            .unwrap();

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

        driver
            .direct_executor()
            .exec("drop table if exists sqlmigrate_mysql_test")
            .unwrap();
    }
}
