/*!
ClickHouse driver

ClickHouse has no native Rust client in this stack's pedigree, so this
adapter talks to ClickHouse's HTTP interface directly with
`reqwest::blocking`, treating the endpoint as a plain HTTP backend the
way a non-SQL-native dialect has to be handled. ClickHouse has no
transactional DDL, so `begin` returns `ErrorKind::Unsupported` -- a
migration author who wrote `transaction:true` against this dialect gets
a clear error rather than a silently-ignored transaction wrapper.
*/
use reqwest::blocking::Client;
use serde_json::Value;

use crate::driver::{default_quote_identifier, Driver, DriverConfig, Executor, Transaction};
use crate::dburl::DatabaseUrl;
use crate::errors::*;

mod sql {
    pub static CREATE_TABLE_TPL: &str = "create table if not exists {table} (version String) engine = MergeTree() order by version";
    pub static SELECT_ALL_TPL: &str = "select version from {table} order by version asc format JSONEachRow";
    pub static SELECT_LIMIT_TPL: &str = "select version from {table} order by version desc limit {limit} format JSONEachRow";
    pub static INSERT_TPL: &str = "insert into {table} (version) values ({version})";
    pub static DELETE_TPL: &str = "alter table {table} delete where version = {version}";
    pub static SHOW_TABLES_DDL: &str = "select create_table_query from system.tables where database = currentDatabase() format JSONEachRow";
}

pub struct ClickhouseDriver {
    endpoint: String,
    database: String,
    table: String,
    user: Option<String>,
    password: Option<String>,
    http: Client,
}

impl std::fmt::Debug for ClickhouseDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClickhouseDriver")
            .field("endpoint", &self.endpoint)
            .field("database", &self.database)
            .field("table", &self.table)
            .finish()
    }
}

impl ClickhouseDriver {
    pub fn open(config: &DriverConfig) -> Result<Self> {
        let url = DatabaseUrl::parse(&config.database_url)?;
        let scheme = if url.query_value("secure").as_deref() == Some("true") { "https" } else { "http" };
        let port = url.port().unwrap_or(8123);
        let host = url.host().ok_or_else(|| Error::from(ErrorKind::Config("clickhouse url has no host".into())))?;
        let endpoint = format!("{}://{}:{}", scheme, host, port);
        let database = url.database().map(str::to_owned).unwrap_or_else(|| "default".to_owned());
        Ok(Self {
            endpoint,
            database,
            table: config.migrations_table.clone(),
            user: url.username().map(str::to_owned).filter(|s| !s.is_empty()),
            password: url.password().map(str::to_owned),
            http: Client::new(),
        })
    }

    fn table_ident(&self) -> String {
        default_quote_identifier(&self.table, '`')
    }

    fn run(&self, query: &str) -> Result<String> {
        let mut req = self
            .http
            .post(&self.endpoint)
            .query(&[("database", self.database.as_str())])
            .body(query.to_owned());
        if let Some(user) = &self.user {
            req = req.basic_auth(user, self.password.clone());
        }
        let resp = req.send().map_err(|e| Error::from(ErrorKind::Connectivity(e.to_string())))?;
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        if !status.is_success() {
            return Err(query_error(query, None, body));
        }
        Ok(body)
    }
}

/// Register the `clickhouse` scheme with the process-wide registry.
pub fn register() {
    crate::registry::register("clickhouse", construct);
}

fn construct(config: &DriverConfig) -> Result<Box<dyn Driver>> {
    Ok(Box::new(ClickhouseDriver::open(config)?))
}

struct HttpExecutor<'a> {
    driver: &'a ClickhouseDriver,
}

impl<'a> Executor for HttpExecutor<'a> {
    fn exec(&mut self, query: &str) -> Result<()> {
        if query.trim().is_empty() {
            return Ok(());
        }
        self.driver.run(query)?;
        Ok(())
    }
}

impl Driver for ClickhouseDriver {
    fn name(&self) -> &'static str {
        "clickhouse"
    }

    fn ping(&self) -> Result<()> {
        self.run("select 1").map(|_| ())
    }

    fn database_exists(&self) -> Result<bool> {
        let body = self.run(&format!(
            "select count(*) as c from system.databases where name = '{}' format JSONEachRow",
            self.database.replace('\'', "''")
        ))?;
        count_from_rows(&body)
    }

    fn create_database(&self) -> Result<()> {
        let ident = default_quote_identifier(&self.database, '`');
        self.run(&format!("create database if not exists {}", ident)).map(|_| ())
    }

    fn drop_database(&self) -> Result<()> {
        let ident = default_quote_identifier(&self.database, '`');
        self.run(&format!("drop database if exists {}", ident)).map(|_| ())
    }

    fn migrations_table_exists(&self) -> Result<bool> {
        let body = self.run(&format!(
            "select count(*) as c from system.tables where database = currentDatabase() and name = '{}' format JSONEachRow",
            self.table.replace('\'', "''")
        ))?;
        count_from_rows(&body)
    }

    fn create_migrations_table(&self) -> Result<()> {
        let query = sql::CREATE_TABLE_TPL.replace("{table}", &self.table_ident());
        self.run(&query).map(|_| ())
    }

    fn select_migrations(&self, limit: i64) -> Result<Vec<String>> {
        let body = if limit < 0 {
            let query = sql::SELECT_ALL_TPL.replace("{table}", &self.table_ident());
            self.run(&query)?
        } else {
            let query = sql::SELECT_LIMIT_TPL
                .replace("{table}", &self.table_ident())
                .replace("{limit}", &limit.to_string());
            self.run(&query)?
        };
        parse_json_rows(&body)?
            .into_iter()
            .map(|row| {
                row.get("version")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
                    .ok_or_else(|| Error::from(ErrorKind::Ledger("clickhouse row missing `version` field".into())))
            })
            .collect()
    }

    fn insert_migration(&self, executor: &mut dyn Executor, version: &str) -> Result<()> {
        let query = sql::INSERT_TPL
            .replace("{table}", &self.table_ident())
            .replace("{version}", &quote_literal(version));
        executor.exec(&query)
    }

    fn delete_migration(&self, executor: &mut dyn Executor, version: &str) -> Result<()> {
        let query = sql::DELETE_TPL
            .replace("{table}", &self.table_ident())
            .replace("{version}", &quote_literal(version));
        executor.exec(&query)
    }

    fn begin(&self) -> Result<Box<dyn Transaction + '_>> {
        bail_fmt!(
            ErrorKind::Unsupported,
            "clickhouse has no transactional DDL; declare `transaction:false` for every section in this dialect"
        );
    }

    fn direct_executor(&self) -> Box<dyn Executor + '_> {
        Box::new(HttpExecutor { driver: self })
    }

    fn dump_schema(&self) -> Result<Vec<u8>> {
        let body = self.run(sql::SHOW_TABLES_DDL)?;
        let ddls: Vec<String> = parse_json_rows(&body)?
            .into_iter()
            .filter_map(|row| row.get("create_table_query").and_then(Value::as_str).map(str::to_owned))
            .collect();
        Ok(format!("{};\n", ddls.join(";\n")).into_bytes())
    }

    fn load_schema(&self, sql: &str) -> Result<()> {
        for statement in sql.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            self.run(statement)?;
        }
        Ok(())
    }

    fn quote_identifier(&self, ident: &str) -> String {
        default_quote_identifier(ident, '`')
    }
}

fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// ClickHouse's `JSONEachRow` format is one JSON object per line, not a
/// single JSON array.
fn parse_json_rows(body: &str) -> Result<Vec<Value>> {
    body.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).chain_err(|| "failed parsing clickhouse JSON response"))
        .collect()
}

/// ClickHouse renders `UInt64` as a JSON string (to dodge JS precision
/// loss), so the `count(*) as c` aggregate comes back as `{"c": "1"}`.
fn count_from_rows(body: &str) -> Result<bool> {
    let rows = parse_json_rows(body)?;
    let count = rows
        .first()
        .and_then(|row| row.get("c"))
        .and_then(|v| v.as_str().map(str::to_owned).or_else(|| v.as_u64().map(|n| n.to_string())))
        .unwrap_or_else(|| "0".to_owned());
    Ok(count != "0")
}
