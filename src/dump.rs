/*!
Schema-dump orchestrator

After a successful apply/rollback, a driver's textual `dump_schema` output
is made reproducible across runs by trimming non-deterministic leading
comments (timestamps, tool versions) and appending a deterministic ledger
snapshot: a header comment plus an `insert` listing every applied version,
ascending. The file is written atomically (temp file, then rename) so a
concurrent reader never observes a half-written schema file.
*/
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::driver::Driver;
use crate::errors::*;

const LEDGER_HEADER: &str = "-- sqlmigrate: applied migrations snapshot, do not edit by hand";

/// Dump the driver's schema, append the ledger snapshot, and atomically
/// write the result to `schema_file`.
pub fn dump(driver: &dyn Driver, migrations_table: &str, schema_file: &Path) -> Result<()> {
    let raw = driver.dump_schema()?;
    let text = String::from_utf8(raw).chain_err(|| "dump_schema produced non-utf8 output")?;
    let trimmed = trim_nondeterministic_preamble(&text);
    let versions = driver.select_migrations(-1)?;
    let snapshot = render_ledger_snapshot(migrations_table, &versions);

    let mut out = String::with_capacity(trimmed.len() + snapshot.len() + 2);
    out.push_str(trimmed.trim_end());
    out.push('\n');
    if !versions.is_empty() {
        out.push('\n');
        out.push_str(&snapshot);
    }

    write_atomically(schema_file, out.as_bytes())
}

/// Replay a schema file verbatim against the connection. No section
/// parsing: the file is a raw dump, not an up/down migration.
pub fn load(driver: &dyn Driver, schema_file: &Path) -> Result<()> {
    let contents = std::fs::read_to_string(schema_file)
        .chain_err(|| format!("failed reading schema file: {:?}", schema_file))?;
    driver.load_schema(&contents)
}

/// Strip leading comment lines (`--` or `/* ... */`) and blank lines that
/// dump tools prepend with timestamps or tool version strings, which would
/// otherwise make every dump a diff even with no schema change.
fn trim_nondeterministic_preamble(text: &str) -> &str {
    let mut rest = text;
    loop {
        let trimmed_start = rest.trim_start_matches(['\n', '\r', ' ', '\t']);
        if let Some(after) = trimmed_start.strip_prefix("--") {
            let newline = after.find('\n').map(|i| i + 1).unwrap_or(after.len());
            rest = &after[newline..];
            continue;
        }
        if let Some(after) = trimmed_start.strip_prefix("/*") {
            if let Some(end) = after.find("*/") {
                rest = &after[end + 2..];
                continue;
            }
        }
        return trimmed_start;
    }
}

fn render_ledger_snapshot(migrations_table: &str, versions: &[String]) -> String {
    let mut out = String::new();
    out.push_str(LEDGER_HEADER);
    out.push('\n');
    if versions.is_empty() {
        return out;
    }
    out.push_str(&format!("insert into {} (version) values\n", migrations_table));
    let rows: Vec<String> = versions.iter().map(|v| format!("  ('{}')", v.replace('\'', "''"))).collect();
    out.push_str(&rows.join(",\n"));
    out.push_str(";\n");
    out
}

fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).chain_err(|| format!("failed creating schema file directory: {:?}", parent))?;
    let mut tmp = NamedTempFile::new_in(parent).chain_err(|| "failed creating temp file for schema dump")?;
    tmp.write_all(contents).chain_err(|| "failed writing schema dump to temp file")?;
    tmp.persist(path)
        .map_err(|e| Error::from(ErrorKind::Ledger(format!("failed renaming schema dump into place: {}", e))))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_leading_line_comments() {
        let text = "-- pg_dump 14.2\n-- generated at 2020-01-01\ncreate table users(id int);\n";
        assert_eq!(trim_nondeterministic_preamble(text), "create table users(id int);\n");
    }

    #[test]
    fn trims_leading_block_comment() {
        let text = "/* tool v1.2.3 */\ncreate table users(id int);\n";
        assert_eq!(trim_nondeterministic_preamble(text), "create table users(id int);\n");
    }

    #[test]
    fn leaves_body_comments_alone() {
        let text = "create table users(id int); -- trailing note\n";
        assert_eq!(trim_nondeterministic_preamble(text), text);
    }

    #[test]
    fn ledger_snapshot_is_sorted_and_deterministic() {
        let snapshot = render_ledger_snapshot("schema_migrations", &["1".to_owned(), "2".to_owned()]);
        assert!(snapshot.starts_with(LEDGER_HEADER));
        assert!(snapshot.contains("insert into schema_migrations (version) values"));
        assert!(snapshot.contains("('1')"));
        assert!(snapshot.contains("('2')"));
    }

    #[test]
    fn empty_ledger_has_no_insert() {
        let snapshot = render_ledger_snapshot("schema_migrations", &[]);
        assert!(!snapshot.contains("insert into"));
    }

    /// Exercises the sqlite driver's `dump_schema`, which shells out to the
    /// `sqlite3` CLI -- requires it on PATH.
    #[cfg(feature = "d-sqlite")]
    #[test]
    fn dump_then_load_roundtrip() {
        use crate::driver::{Driver, DriverConfig, Executor};
        use crate::drivers::sqlite::SqliteDriver;

        // dump_schema shells out to the `sqlite3` CLI against the database
        // file, so this needs a file-backed database -- `:memory:` has
        // nothing on disk for the CLI to read and is rejected up front.
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("app.db");
        let driver = SqliteDriver::open(&DriverConfig {
            database_url: db_path.to_str().unwrap().to_owned(),
            migrations_table: "schema_migrations".to_owned(),
        })
        .unwrap();
        driver.create_migrations_table().unwrap();
        driver.direct_executor().exec("create table widgets(id int)").unwrap();
        let mut exec = driver.direct_executor();
        driver.insert_migration(&mut *exec, "1").unwrap();

        let schema_file = dir.path().join("schema.sql");
        dump(&driver, "schema_migrations", &schema_file).unwrap();

        let contents = std::fs::read_to_string(&schema_file).unwrap();
        assert!(contents.contains("widgets"));
        assert!(contents.contains("('1')"));

        let fresh_path = dir.path().join("fresh.db");
        let fresh = SqliteDriver::open(&DriverConfig {
            database_url: fresh_path.to_str().unwrap().to_owned(),
            migrations_table: "schema_migrations".to_owned(),
        })
        .unwrap();
        fresh.create_migrations_table().unwrap();
        load(&fresh, &schema_file).unwrap();
        assert_eq!(fresh.select_migrations(-1).unwrap(), vec!["1"]);
    }
}
