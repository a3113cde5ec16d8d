/*!
Engine: planner + executor

Holds the immutable configuration for one migrator invocation, reconciles
the filesystem inventory against the ledger, computes a plan, and executes
it one file at a time.
*/
use std::path::PathBuf;

use log::{debug, info, warn};

use crate::driver::{Driver, Executor};
use crate::errors::*;
use crate::fs::MigrationFs;
use crate::inventory::{self, MigrationFile};
use crate::parser::{self, ParsedMigration};

/// Immutable configuration for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Migration directories, in search order; later directories shadow
    /// earlier ones on a filename-version collision.
    pub migrations_dirs: Vec<PathBuf>,
    /// Ledger table name, optionally schema-qualified (e.g. `"app.schema_migrations"`).
    pub migrations_table: String,
    /// When `true`, a pending migration that sorts before an already
    /// applied version is a fatal `OrderingError` instead of being applied
    /// silently out of order.
    pub strict: bool,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self {
            migrations_dirs: vec![PathBuf::from("./migrations")],
            migrations_table: "schema_migrations".to_owned(),
            strict: false,
        }
    }

    pub fn migrations_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.migrations_dirs.push(dir.into());
        self
    }

    pub fn migrations_table<S: Into<String>>(mut self, table: S) -> Self {
        self.migrations_table = table.into();
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// One item in a computed plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanItem {
    /// A pending migration that will be applied.
    Apply(MigrationFile),
    /// An inventory migration already recorded in the ledger.
    Skip(MigrationFile),
    /// A ledger version with no corresponding inventory file.
    UnknownVersionInLedger(String),
}

/// An ordered sequence of plan-items, the engine's answer to "what would
/// `migrate` do right now".
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub items: Vec<PlanItem>,
}

impl Plan {
    pub fn pending(&self) -> Vec<&MigrationFile> {
        self.items
            .iter()
            .filter_map(|i| match i {
                PlanItem::Apply(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }
}

/// The migration engine. Read-only with respect to its own configuration;
/// all mutable state lives in the database via `driver`.
pub struct Engine<'a> {
    config: EngineConfig,
    driver: &'a dyn Driver,
    fs: &'a dyn MigrationFs,
}

impl<'a> Engine<'a> {
    pub fn new(config: EngineConfig, driver: &'a dyn Driver, fs: &'a dyn MigrationFs) -> Self {
        Self { config, driver, fs }
    }

    fn inventory(&self) -> Result<Vec<MigrationFile>> {
        inventory::scan(self.fs, &self.config.migrations_dirs)
    }

    fn applied(&self) -> Result<Vec<String>> {
        if !self.driver.migrations_table_exists()? {
            return Ok(Vec::new());
        }
        self.driver.select_migrations(-1)
    }

    /// Compute, but do not execute, the plan for `migrate`/`up`. Side-effect
    /// free: never mutates the database.
    pub fn plan(&self) -> Result<Plan> {
        let inventory = self.inventory()?;
        let applied: std::collections::BTreeSet<String> = self.applied()?.into_iter().collect();

        let mut items = Vec::new();
        for m in &inventory {
            if applied.contains(&m.version) {
                items.push(PlanItem::Skip(m.clone()));
            } else {
                items.push(PlanItem::Apply(m.clone()));
            }
        }
        let inventory_versions: std::collections::BTreeSet<&String> =
            inventory.iter().map(|m| &m.version).collect();
        for v in &applied {
            if !inventory_versions.contains(v) {
                items.push(PlanItem::UnknownVersionInLedger(v.clone()));
            }
        }

        if self.config.strict {
            if let Some(max_applied) = applied.iter().max() {
                for m in &inventory {
                    if !applied.contains(&m.version) && &m.version < max_applied {
                        return Err(Error::from(ErrorKind::Ordering(m.version.clone(), max_applied.clone())));
                    }
                }
            }
        }

        Ok(Plan { items })
    }

    /// Apply every pending migration in ascending version order. Errors
    /// surface without partial-success masking: files applied before the
    /// failing one remain applied; the failing file's state follows the
    /// per-section transaction rules; files after it are untouched.
    pub fn apply(&self) -> Result<Vec<String>> {
        let plan = self.plan()?;
        let pending = plan.pending();
        if pending.is_empty() {
            debug!("migrate: nothing pending");
            return Ok(Vec::new());
        }

        let mut applied_now = Vec::new();
        for file in pending {
            info!("applying {}", file.version);
            self.apply_one(file)?;
            applied_now.push(file.version.clone());
        }
        Ok(applied_now)
    }

    fn parse(&self, file: &MigrationFile) -> Result<ParsedMigration> {
        let bytes = self.fs.read_file(&file.path)?;
        let text = String::from_utf8(bytes)?;
        parser::parse(&text)
    }

    fn apply_one(&self, file: &MigrationFile) -> Result<()> {
        let parsed = self.parse(file)?;
        let n = parsed.sections.len();
        let mut ledger_written = false;

        for (idx, section) in parsed.sections.iter().enumerate() {
            let is_first = idx == 0;
            let is_last = idx == n - 1;

            if section.up_options.transaction {
                let mut tx = self.driver.begin()?;
                if let Err(e) = tx.exec(&section.up_body) {
                    let _ = tx.rollback();
                    return Err(e);
                }
                if is_first && !ledger_written {
                    if let Err(e) = self.driver.insert_migration(&mut *tx, &file.version) {
                        let _ = tx.rollback();
                        return Err(e);
                    }
                    ledger_written = true;
                }
                tx.commit()?;
            } else {
                let mut exec = self.driver.direct_executor();
                exec.exec(&section.up_body)?;
                if is_last && !ledger_written {
                    self.driver.insert_migration(&mut *exec, &file.version)?;
                    ledger_written = true;
                }
            }
        }

        if !ledger_written {
            // Only reachable when the first section isn't transactional and
            // the last section is transactional (a mixed-mode file) -- write
            // the row directly; there is no open transaction left to ride.
            let mut exec = self.driver.direct_executor();
            self.driver.insert_migration(&mut *exec, &file.version)?;
        }
        Ok(())
    }

    /// Revert the single most-recently-applied migration: read the latest
    /// applied version, locate its file, run the file's sections in
    /// reverse order with down bodies, and delete the ledger row in the
    /// last (innermost) step, mirroring insert.
    pub fn rollback(&self) -> Result<String> {
        let latest = self.driver.select_migrations(1)?;
        let version = match latest.into_iter().next() {
            Some(v) => v,
            None => bail_fmt!(ErrorKind::NotFound, "NothingToRollback: the ledger is empty"),
        };

        let inventory = self.inventory()?;
        let file = inventory::find(&inventory, &version)
            .ok_or_else(|| Error::from(ErrorKind::NotFound(format!("MissingMigrationFile: {}", version))))?;

        let parsed = self.parse(file)?;
        let mut ledger_deleted = false;

        for (rev_idx, section) in parsed.sections.iter().enumerate().rev() {
            let is_first = rev_idx == 0;

            if section.down_options.transaction {
                let mut tx = self.driver.begin()?;
                if let Err(e) = tx.exec(&section.down_body) {
                    let _ = tx.rollback();
                    return Err(e);
                }
                if is_first && !ledger_deleted {
                    if let Err(e) = self.driver.delete_migration(&mut *tx, &version) {
                        let _ = tx.rollback();
                        return Err(e);
                    }
                    ledger_deleted = true;
                }
                tx.commit()?;
            } else {
                let mut exec = self.driver.direct_executor();
                exec.exec(&section.down_body)?;
                if is_first && !ledger_deleted {
                    self.driver.delete_migration(&mut *exec, &version)?;
                    ledger_deleted = true;
                }
            }
        }

        if !ledger_deleted {
            let mut exec = self.driver.direct_executor();
            self.driver.delete_migration(&mut *exec, &version)?;
        }

        Ok(version)
    }

    /// Ensure the ledger table exists. Idempotent.
    pub fn ensure_migrations_table(&self) -> Result<()> {
        if !self.driver.migrations_table_exists()? {
            self.driver.create_migrations_table()?;
        }
        Ok(())
    }

    /// `applied`/`pending` counts for `status`, in inventory order. Never
    /// mutates state.
    pub fn status(&self) -> Result<StatusReport> {
        let plan = self.plan()?;
        let mut lines = Vec::new();
        for item in &plan.items {
            match item {
                PlanItem::Apply(m) => lines.push(StatusLine::Pending(m.version.clone())),
                PlanItem::Skip(m) => lines.push(StatusLine::Applied(m.version.clone())),
                PlanItem::UnknownVersionInLedger(v) => {
                    warn!("applied migration {} has no file on disk", v);
                    lines.push(StatusLine::AppliedFileMissing(v.clone()));
                }
            }
        }
        Ok(StatusReport {
            pending_count: plan.pending_count(),
            lines,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusLine {
    Applied(String),
    AppliedFileMissing(String),
    Pending(String),
}

#[derive(Debug, Clone, Default)]
pub struct StatusReport {
    pub pending_count: usize,
    pub lines: Vec<StatusLine>,
}

/// Generate a new migration filename: `<UTC timestamp YYYYMMDDHHMMSS>_<slug>.sql`,
/// refusing to overwrite an existing file. `now` is injected so callers
/// (and tests) control the timestamp rather than the engine calling
/// `Utc::now()` internally.
pub fn new_migration_filename(now: chrono::DateTime<chrono::Utc>, descriptor: &str) -> String {
    let slug = slugify(descriptor);
    format!("{}_{}.sql", now.format("%Y%m%d%H%M%S"), slug)
}

fn slugify(descriptor: &str) -> String {
    let mut out = String::new();
    let mut last_was_dash = false;
    for c in descriptor.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_was_dash = false;
        } else if !last_was_dash && !out.is_empty() {
            out.push('-');
            last_was_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("migration");
    }
    out
}

/// Write a new migration file's template contents (one empty up/down pair)
/// to `dir/<filename>` via the real filesystem, creating the parent
/// directory if needed and refusing to overwrite an existing file.
pub fn write_new_migration(dir: &std::path::Path, filename: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).chain_err(|| format!("failed creating migrations directory: {:?}", dir))?;
    let path = dir.join(filename);
    if path.exists() {
        bail_fmt!(ErrorKind::Config, "refusing to overwrite existing migration file: {:?}", path);
    }
    std::fs::write(&path, MIGRATION_TEMPLATE).chain_err(|| format!("failed writing migration file: {:?}", path))?;
    Ok(path)
}

const MIGRATION_TEMPLATE: &str = "-- migrate:up\n\n\n-- migrate:down\n\n";

#[cfg(all(test, feature = "d-sqlite"))]
mod tests {
    use super::*;
    use crate::driver::{Driver, Executor};
    use crate::drivers::sqlite::SqliteDriver;
    use crate::fs::MemFs;
    use chrono::TimeZone;

    fn engine_with<'a>(driver: &'a SqliteDriver, fs: &'a MemFs) -> Engine<'a> {
        Engine::new(
            EngineConfig::new().migrations_table("schema_migrations"),
            driver,
            fs,
        )
    }

    fn fresh_driver() -> SqliteDriver {
        SqliteDriver::open_in_memory().unwrap()
    }

    #[test]
    fn migrate_then_migrate_is_idempotent() {
        let driver = fresh_driver();
        driver.create_migrations_table().unwrap();
        let fs = MemFs::new().with_file(
            "migrations/20200101000000_users.sql",
            "-- migrate:up\nCREATE TABLE users (id INT);\n-- migrate:down\nDROP TABLE users;\n",
        );
        let mut cfg = EngineConfig::new();
        cfg.migrations_dirs = vec![PathBuf::from("migrations")];
        let engine = Engine::new(cfg.clone(), &driver, &fs);

        let applied = engine.apply().unwrap();
        assert_eq!(applied, vec!["20200101000000".to_owned()]);

        let engine2 = Engine::new(cfg, &driver, &fs);
        let applied_again = engine2.apply().unwrap();
        assert!(applied_again.is_empty(), "second migrate must be a no-op");
    }

    #[test]
    fn migrate_then_rollback_removes_latest() {
        let driver = fresh_driver();
        driver.create_migrations_table().unwrap();
        let fs = MemFs::new()
            .with_file(
                "migrations/100_a.sql",
                "-- migrate:up\nCREATE TABLE a(id INT);\n-- migrate:down\nDROP TABLE a;\n",
            )
            .with_file(
                "migrations/200_b.sql",
                "-- migrate:up\nCREATE TABLE b(id INT);\n-- migrate:down\nDROP TABLE b;\n",
            );
        let mut cfg = EngineConfig::new();
        cfg.migrations_dirs = vec![PathBuf::from("migrations")];
        let engine = Engine::new(cfg, &driver, &fs);

        engine.apply().unwrap();
        let reverted = engine.rollback().unwrap();
        assert_eq!(reverted, "200");

        let status = engine.status().unwrap();
        assert_eq!(status.pending_count, 1);
    }

    #[test]
    fn rollback_deletes_ledger_row_only_after_last_down_section_succeeds() {
        // Two sections in one file: the first (file order) down body is
        // well-formed, the second's fails. Rollback runs sections in
        // reverse, so the failing section runs *first* and must abort
        // before the ledger row is touched -- the row is only deleted on
        // the final (file-first) section, mirroring where apply_one writes
        // it (engine.rs, gated on `is_first`).
        let driver = fresh_driver();
        driver.create_migrations_table().unwrap();
        let fs = MemFs::new().with_file(
            "migrations/100_ab.sql",
            "-- migrate:up\nCREATE TABLE a(id INT);\n-- migrate:down\nDROP TABLE a;\n\
             -- migrate:up\nCREATE TABLE b(id INT);\n-- migrate:down\nDROP TABLE does_not_exist;\n",
        );
        let mut cfg = EngineConfig::new();
        cfg.migrations_dirs = vec![PathBuf::from("migrations")];
        let engine = Engine::new(cfg, &driver, &fs);

        engine.apply().unwrap();
        assert_eq!(driver.select_migrations(-1).unwrap(), vec!["100".to_owned()]);

        let err = engine.rollback().unwrap_err();
        assert!(err.to_string().contains("does_not_exist") || err.to_string().contains("QueryError"));

        // The ledger row must still be present: the second section's down
        // body (processed first in reverse) failed before the first
        // section's down body -- where the delete happens -- ever ran.
        assert_eq!(
            driver.select_migrations(-1).unwrap(),
            vec!["100".to_owned()],
            "ledger row must survive a failure in a later-processed (file-earlier) down section"
        );
    }

    #[test]
    fn strict_mode_rejects_out_of_order_pending() {
        let driver = fresh_driver();
        driver.create_migrations_table().unwrap();
        {
            let mut exec = driver.direct_executor();
            driver.insert_migration(&mut *exec, "300").unwrap();
        }
        let fs = MemFs::new()
            .with_file("migrations/100_a.sql", "-- migrate:up\nSELECT 1;\n-- migrate:down\nSELECT 1;\n")
            .with_file("migrations/300_b.sql", "-- migrate:up\nSELECT 1;\n-- migrate:down\nSELECT 1;\n");

        let mut cfg = EngineConfig::new().strict(true);
        cfg.migrations_dirs = vec![PathBuf::from("migrations")];
        let engine = Engine::new(cfg, &driver, &fs);

        let err = engine.plan().unwrap_err();
        assert!(err.is_ordering());
    }

    #[test]
    fn non_strict_applies_out_of_order() {
        let driver = fresh_driver();
        driver.create_migrations_table().unwrap();
        {
            let mut exec = driver.direct_executor();
            driver.insert_migration(&mut *exec, "300").unwrap();
        }
        let fs = MemFs::new()
            .with_file("migrations/100_a.sql", "-- migrate:up\nSELECT 1;\n-- migrate:down\nSELECT 1;\n")
            .with_file("migrations/300_b.sql", "-- migrate:up\nSELECT 1;\n-- migrate:down\nSELECT 1;\n");

        let mut cfg = EngineConfig::new();
        cfg.migrations_dirs = vec![PathBuf::from("migrations")];
        let engine = Engine::new(cfg, &driver, &fs);

        let applied = engine.apply().unwrap();
        assert_eq!(applied, vec!["100".to_owned()]);
    }

    #[test]
    fn rollback_with_empty_ledger_errors() {
        let driver = fresh_driver();
        driver.create_migrations_table().unwrap();
        let fs = MemFs::new();
        let engine = engine_with(&driver, &fs);
        let err = engine.rollback().unwrap_err();
        assert!(err.to_string().contains("NothingToRollback"));
    }

    #[test]
    fn rollback_missing_file_errors() {
        let driver = fresh_driver();
        driver.create_migrations_table().unwrap();
        {
            let mut exec = driver.direct_executor();
            driver.insert_migration(&mut *exec, "100").unwrap();
        }
        let fs = MemFs::new();
        let engine = engine_with(&driver, &fs);
        let err = engine.rollback().unwrap_err();
        assert!(err.to_string().contains("MissingMigrationFile"));
    }

    #[test]
    fn new_migration_filename_is_timestamped_and_slugified() {
        let now = chrono::Utc.ymd(2020, 1, 2).and_hms(3, 4, 5);
        let name = new_migration_filename(now, "Create Users Table!");
        assert_eq!(name, "20200102030405_create-users-table.sql");
    }
}
